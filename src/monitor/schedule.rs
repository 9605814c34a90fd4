//! Timer and eavesdrop schedules.
//!
//! Both schedules hold [`MonitorRequest`]s in a sorted deque. Insertion is stable:
//! an entry goes after every existing entry with an equal sort key, and nothing is
//! re-sorted on pop.

use std::collections::VecDeque;

use crate::time::Millis;

use super::request::{MonitorId, MonitorRequest, SampleCallback};

/// A request that must receive the current sample.
#[derive(Clone)]
pub(crate) struct Serviced {
    pub id: MonitorId,
    pub callback: SampleCallback,
    pub late: bool,
}

/// Result of servicing a schedule for one sample.
#[derive(Default)]
pub(crate) struct ServiceReport {
    pub serviced: Vec<Serviced>,
    pub expired: Vec<MonitorId>,
}

/// Periodic requests ordered by next due time.
#[derive(Debug, Default)]
pub struct TimerSchedule {
    entries: VecDeque<MonitorRequest>,
}

impl TimerSchedule {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts in ascending key order, after any entries with the same key.
    pub fn insert(&mut self, req: MonitorRequest) {
        let at = self.entries.partition_point(|e| e.key <= req.key);
        self.entries.insert(at, req);
    }

    /// Pops the head once `head.key - margin <= now`.
    pub fn pop_due(&mut self, now: Millis, margin: Millis) -> Option<MonitorRequest> {
        match self.entries.front() {
            Some(head) if head.key.saturating_sub(margin) <= now => self.entries.pop_front(),
            _ => None,
        }
    }

    /// Removes the entry with `id`; returns whether one was found.
    pub fn remove(&mut self, id: MonitorId) -> bool {
        match self.entries.iter().position(|e| e.id == id) {
            Some(idx) => {
                self.entries.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Key of the next entry due.
    #[must_use]
    pub fn next_key(&self) -> Option<Millis> {
        self.entries.front().map(|e| e.key)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MonitorRequest> {
        self.entries.iter()
    }

    /// Fires every due entry and reschedules or expires it.
    ///
    /// A late entry skips straight to its first future slot instead of firing once
    /// per missed period.
    pub(crate) fn service(&mut self, now: Millis, margin: Millis) -> ServiceReport {
        let mut report = ServiceReport::default();
        let mut rescheduled = Vec::new();

        while let Some(mut req) = self.pop_due(now, margin) {
            let (next, late) = advance_key(req.key, req.period, now);
            report.serviced.push(Serviced {
                id: req.id,
                callback: req.callback.clone(),
                late,
            });

            if req.expires_at.is_some_and(|exp| next > exp) {
                report.expired.push(req.id);
                continue;
            }
            req.key = next;
            rescheduled.push(req);
        }

        for req in rescheduled {
            self.insert(req);
        }
        report
    }
}

/// First slot `key + k * period` strictly after `now` (k >= 1), and whether at
/// least one whole period was missed.
pub(crate) fn advance_key(key: Millis, period: Millis, now: Millis) -> (Millis, bool) {
    let period = period.max(1);
    let behind = now.saturating_sub(key);
    let steps = if behind >= 0 { behind / period + 1 } else { 1 };
    (key.saturating_add(steps.saturating_mul(period)), behind >= period)
}

/// Opportunistic requests ordered by maximum staleness.
///
/// Each entry's `key` is its own staleness deadline, so the deadline order does
/// not follow list order and the whole list is visited on every sample.
#[derive(Debug, Default)]
pub struct EavesdropSchedule {
    entries: Vec<MonitorRequest>,
}

impl EavesdropSchedule {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts in ascending max-staleness order, after equal periods.
    ///
    /// The entry's first deadline is `req.key + req.period`.
    pub fn insert(&mut self, mut req: MonitorRequest) {
        req.key = req.key.saturating_add(req.period);
        let at = self.entries.partition_point(|e| e.period <= req.period);
        self.entries.insert(at, req);
    }

    /// Evicts an interior entry by id.
    pub fn pop_node(&mut self, id: MonitorId) -> Option<MonitorRequest> {
        let idx = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(idx))
    }

    pub fn remove(&mut self, id: MonitorId) -> bool {
        self.pop_node(id).is_some()
    }

    /// Earliest staleness deadline across all entries.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Millis> {
        self.entries.iter().map(|e| e.key).min()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MonitorRequest> {
        self.entries.iter()
    }

    /// Hands the sample to every live entry and restarts its staleness window.
    ///
    /// An entry is late only once a whole extra period has passed its deadline.
    pub(crate) fn service(&mut self, now: Millis) -> ServiceReport {
        let mut report = ServiceReport::default();

        let expired: Vec<MonitorId> = self
            .entries
            .iter()
            .filter(|e| e.is_expired_at(now))
            .map(|e| e.id)
            .collect();
        for id in expired {
            if self.pop_node(id).is_some() {
                report.expired.push(id);
            }
        }

        for entry in &mut self.entries {
            report.serviced.push(Serviced {
                id: entry.id,
                callback: entry.callback.clone(),
                late: now.saturating_sub(entry.key) >= entry.period,
            });
            entry.key = now.saturating_add(entry.period);
        }
        report
    }
}
