//! Per-metric monitor scheduling.
//!
//! Every metric owns one [`MetricNode`] holding four independent lists: periodic
//! timer requests, opportunistic (eavesdrop) requests, and the maximum/minimum
//! threshold watches registered by condition leaves. The node is fed samples by
//! the engine and answers with the next time the metric must be sampled.

/// Per-metric node combining all lists.
pub mod node;
/// Monitor ids, request records and deliveries.
pub mod request;
/// Timer and eavesdrop schedules.
pub mod schedule;
/// Threshold watch lists.
pub mod threshold;

pub use node::{Delivery, MetricNode, UpdateOutcome, DEFAULT_SCHEDULE_MARGIN_MS};
pub use request::{MonitorId, MonitorRequest, SampleCallback, SampleEvent};
pub use schedule::{EavesdropSchedule, TimerSchedule};
pub use threshold::{LeafSignal, ThresholdList, ThresholdWatch, WatchKey};
