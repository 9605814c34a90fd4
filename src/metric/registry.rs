//! Registry of metric nodes.
//!
//! Built once at engine start-up: each metric source gets exactly one
//! [`MetricNode`]. A second source for the same metric would mean two independent
//! monitor states for one sensor, so the registry refuses it outright.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::info;

use crate::error::{ExecutionError, MetronError, MetronResult, ValidationError};
use crate::monitor::MetricNode;
use crate::time::Millis;

use super::{MetricId, MetricSource};

/// One metric: its source and the node holding its requests.
///
/// The mutex serializes sampling, registration and removal for this metric.
pub struct MetricSlot {
    source: Arc<dyn MetricSource>,
    node: Mutex<MetricNode>,
}

impl MetricSlot {
    #[must_use]
    pub fn source(&self) -> &Arc<dyn MetricSource> {
        &self.source
    }

    /// Locks the node.
    ///
    /// # Errors
    ///
    /// Returns an internal error if a previous holder panicked.
    pub fn lock(&self) -> MetronResult<MutexGuard<'_, MetricNode>> {
        self.node
            .lock()
            .map_err(|_| MetronError::internal(format!("poisoned metric node lock: {}", self.source.metric_id())))
    }
}

impl fmt::Debug for MetricSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricSlot")
            .field("metric", &self.source.metric_id())
            .field("node", &self.node)
            .finish()
    }
}

/// Map from metric id to its single node.
#[derive(Debug)]
pub struct MetricRegistry {
    slots: HashMap<MetricId, MetricSlot>,
    margin: Millis,
}

impl MetricRegistry {
    /// Creates an empty registry whose nodes use `margin` as timer jitter margin.
    #[must_use]
    pub fn new(margin: Millis) -> Self {
        Self {
            slots: HashMap::new(),
            margin,
        }
    }

    /// Adds a source and creates its node.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::DuplicateMetric` if the metric already has a node.
    pub fn insert(&mut self, source: Arc<dyn MetricSource>) -> Result<(), ExecutionError> {
        let metric = source.metric_id();
        if self.slots.contains_key(&metric) {
            return Err(ExecutionError::DuplicateMetric { metric });
        }

        let node = MetricNode::new(metric.clone(), source.value_kind(), self.margin);
        info!(
            metric = %metric,
            kind = ?source.value_kind(),
            supported = source.is_supported(),
            cost = source.cost(),
            "metric registered"
        );
        self.slots.insert(
            metric,
            MetricSlot {
                source,
                node: Mutex::new(node),
            },
        );
        Ok(())
    }

    /// Looks up a metric regardless of device support.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::UnknownMetric` if no source was registered.
    pub fn slot(&self, metric: &MetricId) -> Result<&MetricSlot, ValidationError> {
        self.slots
            .get(metric)
            .ok_or_else(|| ValidationError::UnknownMetric { metric: metric.clone() })
    }

    /// Looks up a metric that can actually be monitored.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::UnknownMetric` or `ValidationError::UnsupportedMetric`.
    pub fn supported(&self, metric: &MetricId) -> Result<&MetricSlot, ValidationError> {
        let slot = self.slot(metric)?;
        if !slot.source.is_supported() {
            return Err(ValidationError::UnsupportedMetric { metric: metric.clone() });
        }
        Ok(slot)
    }

    /// Monitoring cost of a supported metric.
    ///
    /// # Errors
    ///
    /// Same as [`MetricRegistry::supported`].
    pub fn cost(&self, metric: &MetricId) -> Result<u32, ValidationError> {
        Ok(self.supported(metric)?.source.cost())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MetricId, &MetricSlot)> {
        self.slots.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SampleSink;
    use crate::value::{MetricValue, ValueKind};

    struct FixedSource {
        id: &'static str,
        supported: bool,
    }

    impl MetricSource for FixedSource {
        fn metric_id(&self) -> MetricId {
            MetricId::new(self.id)
        }

        fn value_kind(&self) -> ValueKind {
            ValueKind::Int
        }

        fn is_supported(&self) -> bool {
            self.supported
        }

        fn cost(&self) -> u32 {
            7
        }

        fn current_value(&self) -> Option<MetricValue> {
            None
        }

        fn request_sample(&self, _sink: SampleSink) {}
    }

    fn registry() -> MetricRegistry {
        let mut reg = MetricRegistry::new(5);
        reg.insert(Arc::new(FixedSource { id: "battery", supported: true })).unwrap();
        reg.insert(Arc::new(FixedSource { id: "barometer", supported: false })).unwrap();
        reg
    }

    #[test]
    fn duplicate_metric_is_refused() {
        let mut reg = registry();
        let err = reg
            .insert(Arc::new(FixedSource { id: "battery", supported: true }))
            .unwrap_err();
        let ExecutionError::DuplicateMetric { metric } = err else {
            panic!("expected DuplicateMetric, got {err:?}");
        };
        assert_eq!(metric.as_str(), "battery");
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn unsupported_and_unknown_metrics_are_rejected() {
        let reg = registry();
        assert!(matches!(
            reg.supported(&MetricId::new("barometer")),
            Err(ValidationError::UnsupportedMetric { .. })
        ));
        assert!(matches!(
            reg.supported(&MetricId::new("gyro")),
            Err(ValidationError::UnknownMetric { .. })
        ));
        assert!(reg.slot(&MetricId::new("barometer")).is_ok());
        assert_eq!(reg.cost(&MetricId::new("battery")).unwrap(), 7);
    }

    #[test]
    fn slot_lock_exposes_node() {
        let reg = registry();
        let slot = reg.slot(&MetricId::new("battery")).unwrap();
        let node = slot.lock().unwrap();
        assert!(node.is_empty());
        assert_eq!(node.metric().as_str(), "battery");
    }
}
