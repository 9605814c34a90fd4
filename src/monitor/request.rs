//! Monitor request records and value deliveries.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::metric::MetricId;
use crate::time::Millis;
use crate::value::MetricValue;

/// Unique identifier for a client registration.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MonitorId(Uuid);

impl MonitorId {
    /// Create a new random monitor id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for MonitorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MonitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A value handed to a periodic or opportunistic monitor.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleEvent {
    pub monitor_id: MonitorId,
    pub metric: MetricId,
    pub timestamp: Millis,
    pub value: MetricValue,
    /// The monitor was serviced at least one full period after its due time.
    pub late: bool,
}

/// Client callback for value deliveries.
pub type SampleCallback = Arc<dyn Fn(&SampleEvent) + Send + Sync>;

/// One periodic or opportunistic registration on a metric.
///
/// For timer entries `key` is the next due time; for eavesdrop entries it is the
/// staleness deadline. Either way it only ever moves forward.
#[derive(Clone)]
pub struct MonitorRequest {
    pub id: MonitorId,
    /// Period for timer entries, maximum staleness for eavesdrop entries.
    pub period: Millis,
    /// Absolute expiry, `None` when unbounded.
    pub expires_at: Option<Millis>,
    pub callback: SampleCallback,
    pub key: Millis,
}

impl MonitorRequest {
    /// Builds a request first due at `now`.
    ///
    /// A `duration` of zero means the request never expires.
    #[must_use]
    pub fn new(id: MonitorId, period: Millis, duration: Millis, callback: SampleCallback, now: Millis) -> Self {
        Self {
            id,
            period,
            expires_at: (duration > 0).then(|| now.saturating_add(duration)),
            callback,
            key: now,
        }
    }

    pub(crate) fn is_expired_at(&self, at: Millis) -> bool {
        self.expires_at.is_some_and(|exp| at > exp)
    }
}

impl fmt::Debug for MonitorRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorRequest")
            .field("id", &self.id)
            .field("period", &self.period)
            .field("expires_at", &self.expires_at)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}
