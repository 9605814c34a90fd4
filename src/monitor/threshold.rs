//! Threshold watch lists.
//!
//! A metric keeps one ascending list of "exceeds maximum" watches and one of
//! "exceeds minimum" watches. Each watch points back at the condition leaf that
//! owns it and reports edges (exceeded / cleared) rather than levels; the leaf
//! decides what an edge means for it.

use std::cmp::Ordering;

use crate::time::Millis;
use crate::value::{Comparator, MetricValue, Threshold};

use super::request::MonitorId;

/// Non-owning link from a watch to the condition leaf that registered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchKey {
    /// Condition tree owning the leaf.
    pub tree: MonitorId,
    /// Leaf index inside the tree.
    pub node: usize,
    /// Activation epoch of the leaf when the watch was inserted.
    pub epoch: u64,
}

impl WatchKey {
    fn same_leaf(&self, other: &Self) -> bool {
        self.tree == other.tree && self.node == other.node
    }
}

/// An exceeded/cleared edge for one leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafSignal {
    pub key: WatchKey,
    pub exceeded: bool,
}

#[derive(Debug, Clone)]
pub struct ThresholdWatch {
    pub key: WatchKey,
    pub threshold: Threshold,
    /// Longest allowed gap between two evaluations.
    pub period: Millis,
    next_check: Millis,
    exceeded: Option<bool>,
}

impl ThresholdWatch {
    /// A watch that wants its first evaluation at `now`.
    #[must_use]
    pub const fn new(key: WatchKey, threshold: Threshold, period: Millis, now: Millis) -> Self {
        Self {
            key,
            threshold,
            period,
            next_check: now,
            exceeded: None,
        }
    }

    /// Last evaluated state, `None` before the first usable sample.
    #[must_use]
    pub const fn exceeded(&self) -> Option<bool> {
        self.exceeded
    }
}

/// Outcome of evaluating one list against a sample.
#[derive(Debug, Default)]
pub(crate) struct ThresholdReport {
    pub signals: Vec<LeafSignal>,
    pub mismatched: Vec<WatchKey>,
}

/// Watches for one direction, ascending by threshold.
#[derive(Debug)]
pub struct ThresholdList {
    is_max: bool,
    entries: Vec<ThresholdWatch>,
}

impl ThresholdList {
    /// List firing when the sample is at or above the threshold.
    #[must_use]
    pub const fn max() -> Self {
        Self {
            is_max: true,
            entries: Vec::new(),
        }
    }

    /// List firing when the sample is at or below the threshold.
    #[must_use]
    pub const fn min() -> Self {
        Self {
            is_max: false,
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub const fn is_max(&self) -> bool {
        self.is_max
    }

    pub fn insert(&mut self, watch: ThresholdWatch) {
        let key = watch.threshold.sort_key();
        let at = self.entries.partition_point(|e| e.threshold.sort_key() <= key);
        self.entries.insert(at, watch);
    }

    /// Removes the watch belonging to the same leaf as `key`, whatever its epoch.
    pub fn remove(&mut self, key: &WatchKey) -> bool {
        match self.entries.iter().position(|e| e.key.same_leaf(key)) {
            Some(idx) => {
                self.entries.remove(idx);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ThresholdWatch> {
        self.entries.iter()
    }

    /// Earliest time any watch wants to be re-evaluated.
    #[must_use]
    pub fn next_check(&self) -> Option<Millis> {
        self.entries.iter().map(|e| e.next_check).min()
    }

    /// Evaluates every watch against `value`.
    ///
    /// Max lists are walked from the smallest threshold up, min lists from the
    /// largest down, so the watches that fire form a prefix of the walk.
    pub(crate) fn evaluate(&mut self, value: &MetricValue, compare: Comparator, now: Millis) -> ThresholdReport {
        let mut report = ThresholdReport::default();
        let is_max = self.is_max;

        let mut visit = |watch: &mut ThresholdWatch| {
            watch.next_check = now.saturating_add(watch.period);
            let Some(ord) = compare(value, &watch.threshold) else {
                report.mismatched.push(watch.key);
                return;
            };

            let exceeded = if is_max {
                ord != Ordering::Less
            } else {
                ord != Ordering::Greater
            };
            if watch.exceeded != Some(exceeded) {
                watch.exceeded = Some(exceeded);
                report.signals.push(LeafSignal {
                    key: watch.key,
                    exceeded,
                });
            }
        };

        if is_max {
            self.entries.iter_mut().for_each(&mut visit);
        } else {
            self.entries.iter_mut().rev().for_each(&mut visit);
        }
        report
    }
}
