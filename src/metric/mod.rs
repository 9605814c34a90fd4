//! Metric identities, the source contract, and the per-metric node registry.

/// Per-metric node registry.
pub mod registry;
/// External metric source contract.
pub mod source;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use registry::{MetricRegistry, MetricSlot};
pub use source::MetricSource;

/// Name of a sampled metric, e.g. `"battery.level"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricId(String);

impl MetricId {
    #[must_use]
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MetricId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}
