use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;

use metron::condition::{ConditionTree, Expression};
use metron::monitor::{MonitorRequest, TimerSchedule};
use metron::{MetricId, MetricNode, MetricValue, Millis, MonitorId, Threshold, ValidationError, ValueKind};

fn request(key: Millis, period: Millis) -> MonitorRequest {
    MonitorRequest::new(MonitorId::new(), period, 0, Arc::new(|_| {}), key)
}

proptest! {
    #[test]
    fn timer_schedule_stays_sorted_and_stable(
        ops in prop::collection::vec((0i64..10_000, any::<bool>(), any::<prop::sample::Index>()), 1..64),
    ) {
        let mut schedule = TimerSchedule::new();
        // Insertion order kept stably sorted by key.
        let mut expected: Vec<(Millis, MonitorId)> = Vec::new();

        for (key, remove, pick) in ops {
            if remove && !expected.is_empty() {
                let (_, id) = expected.remove(pick.index(expected.len()));
                prop_assert!(schedule.remove(id));
                prop_assert!(!schedule.remove(id));
            } else {
                let req = request(key, 100);
                let at = expected.partition_point(|(k, _)| *k <= key);
                expected.insert(at, (req.key, req.id));
                schedule.insert(req);
            }

            let got: Vec<(Millis, MonitorId)> = schedule.iter().map(|r| (r.key, r.id)).collect();
            prop_assert_eq!(&got, &expected);
            prop_assert_eq!(schedule.next_key(), expected.first().map(|(k, _)| *k));
        }
    }

    #[test]
    fn pop_due_drains_in_key_order(keys in prop::collection::vec(0i64..1_000, 1..32), now in 0i64..1_000) {
        let mut schedule = TimerSchedule::new();
        for key in &keys {
            schedule.insert(request(*key, 10));
        }

        let mut last = Millis::MIN;
        while let Some(req) = schedule.pop_due(now, 5) {
            prop_assert!(req.key - 5 <= now);
            prop_assert!(req.key >= last);
            last = req.key;
        }
        prop_assert!(schedule.iter().all(|r| r.key - 5 > now));
    }

    #[test]
    fn serviced_timers_are_rescheduled_into_the_future(
        periods in prop::collection::vec(1i64..500, 1..16),
        samples in prop::collection::vec(0i64..200, 1..16),
    ) {
        let mut node = MetricNode::new(MetricId::from("battery"), ValueKind::Int, 0);
        for period in &periods {
            node.insert_timed(MonitorId::new(), *period, Arc::new(|_| {}), 0, 0);
        }

        let mut now = 0;
        for step in samples {
            now += step;
            let outcome = node.update_value(MetricValue::Int(1), now);
            let next = outcome.next_due.expect("timers never expire without a duration");
            prop_assert!(next > now);
            prop_assert!(outcome.deliveries.len() <= periods.len());
        }
    }

    #[test]
    fn and_costs_its_cheaper_child_and_or_costs_both(a in 1u32..1_000, b in 1u32..1_000) {
        let costs: HashMap<MetricId, u32> = [(MetricId::from("a"), a), (MetricId::from("b"), b)].into_iter().collect();
        let cost_of = |m: &MetricId| {
            costs.get(m).copied().ok_or_else(|| ValidationError::UnknownMetric { metric: m.clone() })
        };
        let leaf_a = Expression::above("a", Threshold::Int { value: 1 });
        let leaf_b = Expression::below("b", Threshold::Int { value: 1 });

        let and = ConditionTree::build(MonitorId::new(), &leaf_a.clone().and(leaf_b.clone()), 1000, cost_of).unwrap();
        let root = and.root().unwrap();
        prop_assert_eq!(and.status(root).unwrap().cost, u64::from(a.min(b)));

        // The cheaper child is evaluated first.
        let (first, _) = and.children(root).unwrap();
        prop_assert_eq!(and.status(first).unwrap().cost, u64::from(a.min(b)));

        let or = ConditionTree::build(MonitorId::new(), &leaf_a.or(leaf_b), 1000, cost_of).unwrap();
        let root = or.root().unwrap();
        prop_assert_eq!(or.status(root).unwrap().cost, u64::from(a) + u64::from(b));
    }
}
