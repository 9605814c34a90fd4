//! Contract every metric source implements.
//!
//! Sources are external collaborators: a sensor listener, a counter read from the
//! OS, a network statistic. The engine only needs to know whether the source
//! works on this device, what it costs to keep active, and how to ask it for a
//! sample. Sources answer asynchronously through the [`SampleSink`] they are
//! handed.

use crate::engine::SampleSink;
use crate::value::{MetricValue, ValueKind};

use super::MetricId;

/// A metric the engine can schedule.
pub trait MetricSource: Send + Sync {
    /// Identity of the metric this source produces.
    fn metric_id(&self) -> MetricId;

    /// Shape of every value the source reports.
    fn value_kind(&self) -> ValueKind;

    /// Whether the device can provide this metric at all.
    fn is_supported(&self) -> bool;

    /// Relative expense of keeping this metric actively monitored.
    ///
    /// Continuous listeners should cost more than cheap counter reads.
    fn cost(&self) -> u32;

    /// Most recent value the source holds, if any.
    fn current_value(&self) -> Option<MetricValue>;

    /// Asks for a fresh sample.
    ///
    /// Must not block; the source later calls [`SampleSink::deliver`]. Until a
    /// sample arrives the engine repeats the request every
    /// `EngineConfig::sample_retry_ms`, so a source may drop requests it cannot
    /// serve right now.
    fn request_sample(&self, sink: SampleSink);
}
