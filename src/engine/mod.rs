//! Metron engine.
//!
//! [`MonitorEngine`] is the client-facing entry point. It owns the metric hub
//! (one node per metric source), the wake-up scheduler that asks sources for
//! samples, and the serializing context that evaluates condition trees.
//!
//! Timed and opportunistic monitors live directly on a metric node. Threshold
//! and condition monitors are compiled into condition trees whose leaves watch
//! metric nodes.

pub mod hub;
pub mod wakeup;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::condition::{ConditionCallback, ConditionContext, ConditionMonitor, ConditionTree, Expression, ThresholdHost};
use crate::config::EngineConfig;
use crate::error::{ExecutionError, MetronError, MetronResult, ValidationError};
use crate::metric::{MetricId, MetricRegistry, MetricSource};
use crate::monitor::{MonitorId, SampleCallback};
use crate::time::{Clock, Millis, MonotonicClock};
use crate::value::{MetricValue, Threshold};

pub use hub::MetricHub;
pub use wakeup::{WakeHandler, WakeupScheduler};

/// Counters across all metrics and conditions.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub missed_deadlines: u64,
    pub comparison_faults: u64,
    /// Live timed and opportunistic monitors.
    pub active_monitors: usize,
    pub active_conditions: usize,
    pub dropped_signals: u64,
    pub registry_conflicts: u64,
}

/// Handle a source uses to answer a sample request.
#[derive(Clone)]
pub struct SampleSink {
    metric: MetricId,
    engine: Weak<EngineShared>,
}

impl SampleSink {
    #[must_use]
    pub const fn metric(&self) -> &MetricId {
        &self.metric
    }

    /// Feeds a sample into the engine.
    ///
    /// Returns the metric's next due time.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::Disconnected` once the engine is gone.
    pub fn deliver(&self, timestamp: Millis, value: MetricValue) -> MetronResult<Option<Millis>> {
        let Some(engine) = self.engine.upgrade() else {
            return Err(ExecutionError::Disconnected {
                path: "engine".to_string(),
            }
            .into());
        };
        engine.on_sample(&self.metric, timestamp, value)
    }
}

impl fmt::Debug for SampleSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleSink").field("metric", &self.metric).finish_non_exhaustive()
    }
}

/// Builder for [`MonitorEngine`].
#[derive(Default)]
pub struct MonitorEngineBuilder {
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
    sources: Vec<Arc<dyn MetricSource>>,
}

impl MonitorEngineBuilder {
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Clock used for registration times, expiry and wake-ups.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn source(mut self, source: Arc<dyn MetricSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Starts the engine threads.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` for a bad config and
    /// `ExecutionError::DuplicateMetric` if two sources share a metric id.
    pub fn build(self) -> MetronResult<MonitorEngine> {
        let Self { config, clock, sources } = self;
        config.validate()?;
        let clock: Arc<dyn Clock> = clock.unwrap_or_else(|| Arc::new(MonotonicClock::new()));

        let mut metrics = MetricRegistry::new(config.schedule_margin_ms);
        for source in sources {
            if let Err(e) = metrics.insert(source) {
                error!(error = %e, "engine construction aborted");
                return Err(e.into());
            }
        }
        let metric_count = metrics.len();

        let shared = Arc::new_cyclic(|weak: &Weak<EngineShared>| {
            let sampler = weak.clone();
            let handler: WakeHandler = Box::new(move |metric: &MetricId| {
                if let Some(engine) = sampler.upgrade() {
                    engine.request_sample(metric);
                }
            });
            let wakeups = WakeupScheduler::start(Arc::clone(&clock), handler, config.sample_retry_ms);
            let hub = Arc::new(MetricHub::new(metrics, Arc::clone(&clock), wakeups));
            let host: Arc<dyn ThresholdHost> = Arc::clone(&hub) as Arc<dyn ThresholdHost>;
            let context = ConditionContext::start(&config, host, Arc::clone(&clock));
            EngineShared {
                config,
                context,
                hub,
                timers: Mutex::new(HashMap::new()),
                weak: weak.clone(),
            }
        });
        info!(metrics = metric_count, "monitor engine started");
        Ok(MonitorEngine { shared })
    }
}

struct EngineShared {
    config: EngineConfig,
    context: ConditionContext,
    hub: Arc<MetricHub>,
    /// Timed and opportunistic monitors and the metric they sit on.
    timers: Mutex<HashMap<MonitorId, MetricId>>,
    weak: Weak<EngineShared>,
}

impl EngineShared {
    fn timers(&self) -> MetronResult<MutexGuard<'_, HashMap<MonitorId, MetricId>>> {
        self.timers
            .lock()
            .map_err(|_| MetronError::internal("poisoned monitor index lock"))
    }

    fn request_sample(&self, metric: &MetricId) {
        match self.hub.metrics().slot(metric) {
            Ok(slot) => slot.source().request_sample(SampleSink {
                metric: metric.clone(),
                engine: self.weak.clone(),
            }),
            Err(e) => warn!(metric = %metric, error = %e, "wake-up for unknown metric"),
        }
    }

    fn on_sample(&self, metric: &MetricId, timestamp: Millis, value: MetricValue) -> MetronResult<Option<Millis>> {
        let outcome = self.hub.with_node(metric, |node| node.update_value(value, timestamp))?;

        if !outcome.expired.is_empty() {
            let mut timers = self.timers()?;
            for id in &outcome.expired {
                timers.remove(id);
            }
        }
        for delivery in &outcome.deliveries {
            delivery.dispatch();
        }
        if let Err(e) = self.context.post_signals(outcome.signals) {
            warn!(metric = %metric, error = %e, "leaf signals dropped");
        }
        Ok(outcome.next_due)
    }
}

/// Client-facing monitoring engine.
///
/// Cheap to clone; all clones share the same engine.
#[derive(Clone)]
pub struct MonitorEngine {
    shared: Arc<EngineShared>,
}

impl MonitorEngine {
    #[must_use]
    pub fn builder() -> MonitorEngineBuilder {
        MonitorEngineBuilder::default()
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn now(&self) -> Millis {
        self.shared.hub.now()
    }

    /// Delivers a sample of `metric` every `period` ms, starting now.
    ///
    /// A `duration` of zero keeps the monitor until it is unregistered.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a bad period or duration, or an
    /// unknown or unsupported metric.
    pub fn register_timed(
        &self,
        metric: impl Into<MetricId>,
        period: Millis,
        callback: SampleCallback,
        duration: Millis,
    ) -> MetronResult<MonitorId> {
        let metric = metric.into();
        self.prepare(&metric, period, duration)?;
        let id = MonitorId::new();
        let now = self.now();
        self.shared
            .hub
            .with_node(&metric, |node| node.insert_timed(id, period, callback, duration, now))?;
        self.shared.timers()?.insert(id, metric);
        Ok(id)
    }

    /// Delivers every sample of `metric` taken for other reasons, and forces one
    /// if none arrives within `max_period` ms.
    ///
    /// # Errors
    ///
    /// Same as [`MonitorEngine::register_timed`].
    pub fn register_opportunistic(
        &self,
        metric: impl Into<MetricId>,
        max_period: Millis,
        callback: SampleCallback,
        duration: Millis,
    ) -> MetronResult<MonitorId> {
        let metric = metric.into();
        self.prepare(&metric, max_period, duration)?;
        let id = MonitorId::new();
        let now = self.now();
        self.shared
            .hub
            .with_node(&metric, |node| node.insert_opportunistic(id, max_period, callback, duration, now))?;
        self.shared.timers()?.insert(id, metric);
        Ok(id)
    }

    /// Notifies when `metric` crosses `threshold`, checked every `period` ms.
    ///
    /// With `is_max` the condition holds while the value is at or above the
    /// threshold, otherwise while it is at or below.
    ///
    /// # Errors
    ///
    /// Same as [`MonitorEngine::register_condition`].
    pub fn register_threshold(
        &self,
        metric: impl Into<MetricId>,
        threshold: Threshold,
        period: Millis,
        is_max: bool,
        callback: ConditionCallback,
        duration: Millis,
    ) -> MetronResult<MonitorId> {
        let leaf = Expression::Threshold {
            metric: metric.into(),
            threshold,
            is_max,
            period_ms: Some(period),
            negated: false,
        };
        self.register_condition(&leaf, callback, duration)
    }

    /// Registers a composite condition.
    ///
    /// The callback fires with `triggered = true` when the expression starts to
    /// hold and `false` when it stops.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed expression or an unusable
    /// metric, and an execution error if the condition context is unavailable.
    pub fn register_condition(
        &self,
        expr: &Expression,
        callback: ConditionCallback,
        duration: Millis,
    ) -> MetronResult<MonitorId> {
        if duration < 0 {
            return Err(ValidationError::InvalidDuration { duration_ms: duration }.into());
        }
        let id = MonitorId::new();
        let metrics = self.shared.hub.metrics();
        let tree = ConditionTree::build(id, expr, self.shared.config.default_threshold_period_ms, |m| metrics.cost(m))?;
        let expires_at = (duration > 0).then(|| self.now().saturating_add(duration));
        self.shared
            .context
            .register(ConditionMonitor::new(tree, callback, expires_at))?;
        debug!(monitor_id = %id, leaves = expr.leaf_count(), ?expires_at, "condition monitor registered");
        Ok(id)
    }

    /// Cancels any monitor. Unknown or already removed ids are ignored.
    ///
    /// Condition removal is asynchronous; use [`MonitorEngine::flush`] to wait for it.
    ///
    /// # Errors
    ///
    /// Returns an error only if the engine's internal state is unavailable.
    pub fn unregister(&self, id: MonitorId) -> MetronResult<()> {
        let metric = self.shared.timers()?.remove(&id);
        match metric {
            Some(metric) => {
                let empty = self.shared.hub.with_node(&metric, |node| node.remove_timer(id))?;
                debug!(monitor_id = %id, metric = %metric, node_empty = empty, "monitor unregistered");
                Ok(())
            }
            None => self.shared.context.unregister(id),
        }
    }

    /// Feeds a sample of `metric` taken at `timestamp`.
    ///
    /// Services every monitor on the metric, runs due callbacks and returns the
    /// next time the metric must be sampled, or `None` if nothing needs it.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::UnknownMetric` for a metric without a source.
    pub fn on_sample(
        &self,
        metric: impl Into<MetricId>,
        timestamp: Millis,
        value: MetricValue,
    ) -> MetronResult<Option<Millis>> {
        self.shared.on_sample(&metric.into(), timestamp, value)
    }

    /// Latest known value: the source's own, or the last sample fed in.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown metrics.
    pub fn current_value(&self, metric: &MetricId) -> MetronResult<Option<MetricValue>> {
        let slot = self.shared.hub.metrics().slot(metric)?;
        if let Some(value) = slot.source().current_value() {
            return Ok(Some(value));
        }
        Ok(slot.lock()?.last_sample().map(|(_, value)| value))
    }

    /// Pending wake-up time for `metric`.
    #[must_use]
    pub fn next_wakeup(&self, metric: &MetricId) -> Option<Millis> {
        self.shared.hub.wakeups().pending(metric)
    }

    /// Waits for the condition context to handle everything queued so far.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::Timeout` if it does not catch up in time.
    pub fn flush(&self, timeout: Duration) -> MetronResult<()> {
        self.shared.context.flush(timeout)
    }

    /// Snapshot of engine counters.
    ///
    /// # Errors
    ///
    /// Returns an internal error if a lock is poisoned.
    pub fn stats(&self) -> MetronResult<EngineStats> {
        let mut stats = EngineStats {
            active_monitors: self.shared.timers()?.len(),
            active_conditions: self.shared.context.active_conditions(),
            dropped_signals: self.shared.context.dropped_signals(),
            registry_conflicts: self.shared.context.registry_conflicts(),
            ..EngineStats::default()
        };
        for (_, slot) in self.shared.hub.metrics().iter() {
            let node = slot.lock()?;
            stats.missed_deadlines += node.missed_deadlines();
            stats.comparison_faults += node.comparison_faults();
        }
        Ok(stats)
    }

    fn prepare(&self, metric: &MetricId, period: Millis, duration: Millis) -> MetronResult<()> {
        if period <= 0 {
            return Err(ValidationError::InvalidPeriod { period_ms: period }.into());
        }
        if duration < 0 {
            return Err(ValidationError::InvalidDuration { duration_ms: duration }.into());
        }
        self.shared.hub.metrics().supported(metric)?;
        Ok(())
    }
}

impl fmt::Debug for MonitorEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorEngine")
            .field("config", &self.shared.config)
            .field("hub", &self.shared.hub)
            .field("context", &self.shared.context)
            .finish()
    }
}
