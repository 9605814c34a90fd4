//! Per-metric monitor state.
//!
//! A [`MetricNode`] is the single authority for every active request on one
//! metric. Feeding it a sample services the timer schedule, the eavesdrop
//! schedule and both threshold lists, and yields the next time the metric must be
//! sampled again.

use std::fmt;

use tracing::{debug, warn};

use crate::metric::MetricId;
use crate::time::Millis;
use crate::value::{comparator_for, Comparator, MetricValue, Threshold, ValueKind};

use super::request::{MonitorId, MonitorRequest, SampleCallback, SampleEvent};
use super::schedule::{EavesdropSchedule, ServiceReport, TimerSchedule};
use super::threshold::{LeafSignal, ThresholdList, ThresholdWatch, WatchKey};

/// Jitter margin used when none is configured.
pub const DEFAULT_SCHEDULE_MARGIN_MS: Millis = 5;

/// A pending callback invocation.
#[derive(Clone)]
pub struct Delivery {
    pub callback: SampleCallback,
    pub event: SampleEvent,
}

impl Delivery {
    /// Invokes the client callback.
    pub fn dispatch(&self) {
        (self.callback)(&self.event);
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery").field("event", &self.event).finish_non_exhaustive()
    }
}

/// Everything a sample produced.
///
/// Callbacks are returned rather than invoked so the caller can run them after
/// releasing whatever lock guards the node.
#[derive(Debug, Default)]
pub struct UpdateOutcome {
    pub deliveries: Vec<Delivery>,
    pub signals: Vec<LeafSignal>,
    /// Timer and eavesdrop requests whose duration ran out.
    pub expired: Vec<MonitorId>,
    /// Next time the metric must be sampled; `None` when nothing is registered.
    pub next_due: Option<Millis>,
}

/// All active monitoring for one metric.
pub struct MetricNode {
    metric: MetricId,
    kind: ValueKind,
    compare: Comparator,
    margin: Millis,
    timers: Option<TimerSchedule>,
    eavesdrop: Option<EavesdropSchedule>,
    max_watches: Option<ThresholdList>,
    min_watches: Option<ThresholdList>,
    last_sample: Option<(Millis, MetricValue)>,
    missed_deadlines: u64,
    comparison_faults: u64,
}

impl MetricNode {
    /// Creates an empty node; the comparator is fixed by `kind`.
    #[must_use]
    pub fn new(metric: MetricId, kind: ValueKind, margin: Millis) -> Self {
        Self {
            metric,
            kind,
            compare: comparator_for(kind),
            margin: margin.max(0),
            timers: None,
            eavesdrop: None,
            max_watches: None,
            min_watches: None,
            last_sample: None,
            missed_deadlines: 0,
            comparison_faults: 0,
        }
    }

    #[must_use]
    pub const fn metric(&self) -> &MetricId {
        &self.metric
    }

    #[must_use]
    pub const fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Registers a periodic request, first due at `now`.
    pub fn insert_timed(
        &mut self,
        id: MonitorId,
        period: Millis,
        callback: SampleCallback,
        duration: Millis,
        now: Millis,
    ) {
        let req = MonitorRequest::new(id, period, duration, callback, now);
        debug!(metric = %self.metric, monitor_id = %id, period, duration, "timed monitor inserted");
        self.timers.get_or_insert_with(TimerSchedule::new).insert(req);
    }

    /// Registers an opportunistic request that tolerates `max_period` of staleness.
    pub fn insert_opportunistic(
        &mut self,
        id: MonitorId,
        max_period: Millis,
        callback: SampleCallback,
        duration: Millis,
        now: Millis,
    ) {
        let req = MonitorRequest::new(id, max_period, duration, callback, now);
        debug!(metric = %self.metric, monitor_id = %id, max_period, duration, "opportunistic monitor inserted");
        self.eavesdrop.get_or_insert_with(EavesdropSchedule::new).insert(req);
    }

    /// Registers a threshold watch for a condition leaf.
    pub fn insert_thresh(&mut self, key: WatchKey, threshold: Threshold, period: Millis, is_max: bool, now: Millis) {
        let watch = ThresholdWatch::new(key, threshold, period, now);
        let list = if is_max {
            self.max_watches.get_or_insert_with(ThresholdList::max)
        } else {
            self.min_watches.get_or_insert_with(ThresholdList::min)
        };
        list.insert(watch);
        debug!(metric = %self.metric, tree = %key.tree, leaf = key.node, is_max, "threshold watch inserted");
    }

    /// Removes a timed or opportunistic request. Returns whether the node is now empty.
    pub fn remove_timer(&mut self, id: MonitorId) -> bool {
        if let Some(timers) = self.timers.as_mut() {
            if timers.remove(id) && timers.is_empty() {
                self.timers = None;
            }
        }
        if let Some(eavesdrop) = self.eavesdrop.as_mut() {
            if eavesdrop.remove(id) && eavesdrop.is_empty() {
                self.eavesdrop = None;
            }
        }
        self.is_empty()
    }

    /// Removes a leaf's threshold watch. Returns whether the node is now empty.
    pub fn remove_thresh(&mut self, key: &WatchKey, is_max: bool) -> bool {
        let slot = if is_max {
            &mut self.max_watches
        } else {
            &mut self.min_watches
        };
        if let Some(list) = slot.as_mut() {
            if list.remove(key) && list.is_empty() {
                *slot = None;
            }
        }
        self.is_empty()
    }

    /// True once all four lists are inactive.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.timers.is_none() && self.eavesdrop.is_none() && self.max_watches.is_none() && self.min_watches.is_none()
    }

    /// Services every list with a fresh sample.
    pub fn update_value(&mut self, value: MetricValue, timestamp: Millis) -> UpdateOutcome {
        let mut outcome = UpdateOutcome::default();
        self.last_sample = Some((timestamp, value));

        if let Some(timers) = self.timers.as_mut() {
            let report = timers.service(timestamp, self.margin);
            if timers.is_empty() {
                self.timers = None;
            }
            self.collect(report, value, timestamp, &mut outcome);
        }

        if let Some(eavesdrop) = self.eavesdrop.as_mut() {
            let report = eavesdrop.service(timestamp);
            if eavesdrop.is_empty() {
                self.eavesdrop = None;
            }
            self.collect(report, value, timestamp, &mut outcome);
        }

        for list in [self.max_watches.as_mut(), self.min_watches.as_mut()].into_iter().flatten() {
            let report = list.evaluate(&value, self.compare, timestamp);
            for key in report.mismatched {
                self.comparison_faults += 1;
                warn!(
                    metric = %self.metric,
                    tree = %key.tree,
                    leaf = key.node,
                    sample = ?value,
                    "threshold not comparable with sample, skipping watch"
                );
            }
            outcome.signals.extend(report.signals);
        }

        outcome.next_due = self.next_due();
        outcome
    }

    fn collect(&mut self, report: ServiceReport, value: MetricValue, timestamp: Millis, outcome: &mut UpdateOutcome) {
        for serviced in report.serviced {
            if serviced.late {
                self.missed_deadlines += 1;
                debug!(metric = %self.metric, monitor_id = %serviced.id, timestamp, "missed deadline, delivering late");
            }
            outcome.deliveries.push(Delivery {
                callback: serviced.callback,
                event: SampleEvent {
                    monitor_id: serviced.id,
                    metric: self.metric.clone(),
                    timestamp,
                    value,
                    late: serviced.late,
                },
            });
        }
        for id in &report.expired {
            debug!(metric = %self.metric, monitor_id = %id, "monitor duration elapsed");
        }
        outcome.expired.extend(report.expired);
    }

    /// Earliest of the next timer key, eavesdrop deadline and threshold re-check.
    #[must_use]
    pub fn next_due(&self) -> Option<Millis> {
        [
            self.timers.as_ref().and_then(TimerSchedule::next_key),
            self.eavesdrop.as_ref().and_then(EavesdropSchedule::next_deadline),
            self.max_watches.as_ref().and_then(ThresholdList::next_check),
            self.min_watches.as_ref().and_then(ThresholdList::next_check),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    #[must_use]
    pub const fn last_sample(&self) -> Option<(Millis, MetricValue)> {
        self.last_sample
    }

    #[must_use]
    pub const fn missed_deadlines(&self) -> u64 {
        self.missed_deadlines
    }

    #[must_use]
    pub const fn comparison_faults(&self) -> u64 {
        self.comparison_faults
    }

    /// Number of timed, opportunistic and threshold registrations.
    #[must_use]
    pub fn registration_count(&self) -> usize {
        self.timers.as_ref().map_or(0, TimerSchedule::len)
            + self.eavesdrop.as_ref().map_or(0, EavesdropSchedule::len)
            + self.max_watches.as_ref().map_or(0, ThresholdList::len)
            + self.min_watches.as_ref().map_or(0, ThresholdList::len)
    }

    /// Threshold watches currently registered in one direction.
    pub fn watches(&self, is_max: bool) -> impl Iterator<Item = &ThresholdWatch> {
        let list = if is_max {
            self.max_watches.as_ref()
        } else {
            self.min_watches.as_ref()
        };
        list.into_iter().flat_map(ThresholdList::iter)
    }
}

impl fmt::Debug for MetricNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricNode")
            .field("metric", &self.metric)
            .field("kind", &self.kind)
            .field("timers", &self.timers)
            .field("eavesdrop", &self.eavesdrop)
            .field("max_watches", &self.max_watches)
            .field("min_watches", &self.min_watches)
            .field("last_sample", &self.last_sample)
            .finish_non_exhaustive()
    }
}
