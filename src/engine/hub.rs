//! Shared access to metric nodes.

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::condition::ThresholdHost;
use crate::error::MetronResult;
use crate::metric::{MetricId, MetricRegistry};
use crate::monitor::{MetricNode, WatchKey};
use crate::time::{Clock, Millis};
use crate::value::Threshold;

use super::wakeup::WakeupScheduler;

/// Metric registry plus the wake-up scheduler that keeps its nodes sampled.
///
/// Every node mutation goes through [`MetricHub::with_node`], which re-posts the
/// node's next due time while the node is still locked.
pub struct MetricHub {
    metrics: MetricRegistry,
    clock: Arc<dyn Clock>,
    wakeups: WakeupScheduler,
}

impl MetricHub {
    pub(crate) fn new(metrics: MetricRegistry, clock: Arc<dyn Clock>, wakeups: WakeupScheduler) -> Self {
        Self {
            metrics,
            clock,
            wakeups,
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &MetricRegistry {
        &self.metrics
    }

    #[must_use]
    pub fn wakeups(&self) -> &WakeupScheduler {
        &self.wakeups
    }

    #[must_use]
    pub fn now(&self) -> Millis {
        self.clock.now_ms()
    }

    /// Runs `f` on the locked node of `metric` and reschedules its wake-up.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown metrics or a poisoned node lock.
    pub fn with_node<R>(&self, metric: &MetricId, f: impl FnOnce(&mut MetricNode) -> R) -> MetronResult<R> {
        let slot = self.metrics.slot(metric)?;
        let mut node = slot.lock()?;
        let out = f(&mut node);
        self.wakeups.update(metric, node.next_due());
        Ok(out)
    }
}

impl ThresholdHost for MetricHub {
    fn insert_threshold(
        &self,
        metric: &MetricId,
        key: WatchKey,
        threshold: Threshold,
        period: Millis,
        is_max: bool,
    ) -> MetronResult<()> {
        self.metrics.supported(metric)?;
        let now = self.now();
        self.with_node(metric, |node| node.insert_thresh(key, threshold, period, is_max, now))
    }

    fn remove_threshold(&self, metric: &MetricId, key: &WatchKey, is_max: bool) {
        if let Err(e) = self.with_node(metric, |node| node.remove_thresh(key, is_max)) {
            warn!(metric = %metric, tree = %key.tree, error = %e, "failed to remove threshold watch");
        }
    }
}

impl fmt::Debug for MetricHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricHub")
            .field("metrics", &self.metrics)
            .field("wakeups", &self.wakeups)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::wakeup::WakeHandler;
    use crate::engine::SampleSink;
    use crate::metric::MetricSource;
    use crate::monitor::MonitorId;
    use crate::time::ManualClock;
    use crate::value::{MetricValue, ValueKind};

    struct Counter {
        supported: bool,
    }

    impl MetricSource for Counter {
        fn metric_id(&self) -> MetricId {
            MetricId::from("counter")
        }

        fn value_kind(&self) -> ValueKind {
            ValueKind::Int
        }

        fn is_supported(&self) -> bool {
            self.supported
        }

        fn cost(&self) -> u32 {
            1
        }

        fn current_value(&self) -> Option<MetricValue> {
            None
        }

        fn request_sample(&self, _sink: SampleSink) {}
    }

    fn hub(supported: bool) -> MetricHub {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(10));
        let mut metrics = MetricRegistry::new(5);
        metrics.insert(Arc::new(Counter { supported })).unwrap();
        let handler: WakeHandler = Box::new(|_| {});
        let wakeups = WakeupScheduler::start(Arc::clone(&clock), handler, 1000);
        MetricHub::new(metrics, clock, wakeups)
    }

    #[test]
    fn threshold_watch_is_due_immediately_and_cleared_on_removal() {
        let hub = hub(true);
        let metric = MetricId::from("counter");
        let key = WatchKey {
            tree: MonitorId::new(),
            node: 0,
            epoch: 1,
        };

        hub.insert_threshold(&metric, key, Threshold::Int { value: 3 }, 1000, true)
            .unwrap();
        let due = hub.with_node(&metric, |n| n.next_due()).unwrap();
        assert_eq!(due, Some(10));

        hub.remove_threshold(&metric, &key, true);
        assert!(hub.with_node(&metric, |n| n.is_empty()).unwrap());
        assert_eq!(hub.wakeups().pending(&metric), None);
    }

    #[test]
    fn unsupported_metric_refuses_watches() {
        let hub = hub(false);
        let key = WatchKey {
            tree: MonitorId::new(),
            node: 0,
            epoch: 1,
        };
        let err = hub
            .insert_threshold(&MetricId::from("counter"), key, Threshold::Int { value: 3 }, 1000, true)
            .unwrap_err();
        assert!(err.is_validation());
    }
}
