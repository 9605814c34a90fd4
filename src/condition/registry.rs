//! Live condition monitors.
//!
//! The registry is owned by the serializing context thread and never shared.
//! A monitor is leased out of the registry while a signal propagates through
//! its tree; removing a leased monitor is refused and must be retried.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ExecutionError;
use crate::monitor::MonitorId;
use crate::time::Millis;

use super::tree::ConditionTree;

/// Notification that a condition started or stopped holding.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionEvent {
    pub event_id: Uuid,
    pub monitor_id: MonitorId,
    pub triggered: bool,
    pub timestamp: DateTime<Utc>,
}

impl ConditionEvent {
    #[must_use]
    pub fn new(monitor_id: MonitorId, triggered: bool) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            monitor_id,
            triggered,
            timestamp: Utc::now(),
        }
    }
}

/// Client callback for condition transitions.
pub type ConditionCallback = Arc<dyn Fn(&ConditionEvent) + Send + Sync>;

/// A registered condition: its tree, callback and optional expiry.
pub struct ConditionMonitor {
    pub tree: ConditionTree,
    pub callback: ConditionCallback,
    /// Absolute expiry on the engine clock, `None` when unbounded.
    pub expires_at: Option<Millis>,
}

impl ConditionMonitor {
    #[must_use]
    pub fn new(tree: ConditionTree, callback: ConditionCallback, expires_at: Option<Millis>) -> Self {
        Self {
            tree,
            callback,
            expires_at,
        }
    }

    #[must_use]
    pub const fn id(&self) -> MonitorId {
        self.tree.id()
    }

    /// Invokes the callback once per pending root transition.
    pub fn dispatch_transitions(&mut self) -> usize {
        let transitions = self.tree.take_transitions();
        for triggered in &transitions {
            (self.callback)(&ConditionEvent::new(self.id(), *triggered));
        }
        transitions.len()
    }
}

impl fmt::Debug for ConditionMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionMonitor")
            .field("tree", &self.tree)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// All live condition monitors, keyed by monitor id.
#[derive(Debug, Default)]
pub struct ConditionRegistry {
    events: Vec<ConditionMonitor>,
    leased: HashSet<MonitorId>,
}

impl ConditionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a monitor. A monitor with the same id is replaced and returned.
    pub fn insert_event(&mut self, monitor: ConditionMonitor) -> Option<ConditionMonitor> {
        let id = monitor.id();
        match self.events.iter().position(|m| m.id() == id) {
            Some(idx) => Some(std::mem::replace(&mut self.events[idx], monitor)),
            None => {
                self.events.push(monitor);
                None
            }
        }
    }

    #[must_use]
    pub fn get_event(&self, id: MonitorId) -> Option<&ConditionMonitor> {
        self.events.iter().find(|m| m.id() == id)
    }

    /// Removes a monitor; `Ok(None)` if it is already gone.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::RegistryConflict` while the monitor is leased.
    pub fn remove_event(&mut self, id: MonitorId) -> Result<Option<ConditionMonitor>, ExecutionError> {
        if self.leased.contains(&id) {
            return Err(ExecutionError::RegistryConflict { id });
        }
        Ok(self
            .events
            .iter()
            .position(|m| m.id() == id)
            .map(|idx| self.events.swap_remove(idx)))
    }

    /// Takes a monitor out for exclusive mutation until [`ConditionRegistry::restore`].
    pub fn lease(&mut self, id: MonitorId) -> Option<ConditionMonitor> {
        let idx = self.events.iter().position(|m| m.id() == id)?;
        self.leased.insert(id);
        Some(self.events.swap_remove(idx))
    }

    /// Returns a leased monitor.
    pub fn restore(&mut self, monitor: ConditionMonitor) {
        self.leased.remove(&monitor.id());
        self.events.push(monitor);
    }

    /// Ends a lease without returning the monitor, which is then gone for good.
    pub fn release(&mut self, id: MonitorId) {
        self.leased.remove(&id);
    }

    /// Ids of monitors whose expiry is at or before `now`.
    #[must_use]
    pub fn expired(&self, now: Millis) -> Vec<MonitorId> {
        self.events
            .iter()
            .filter(|m| m.expires_at.is_some_and(|exp| exp <= now))
            .map(ConditionMonitor::id)
            .collect()
    }

    /// Removes every monitor, leased ones excepted.
    pub fn drain(&mut self) -> Vec<ConditionMonitor> {
        std::mem::take(&mut self.events)
    }

    pub fn ids(&self) -> impl Iterator<Item = MonitorId> + '_ {
        self.events.iter().map(ConditionMonitor::id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
