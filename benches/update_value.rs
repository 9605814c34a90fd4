use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};

use metron::monitor::WatchKey;
use metron::{MetricId, MetricNode, MetricValue, MonitorId, Threshold, ValueKind};

/// Node with `n` timers, `n` opportunistic monitors and `n` watches per list.
fn loaded_node(n: usize) -> MetricNode {
    let mut node = MetricNode::new(MetricId::from("battery"), ValueKind::Int, 5);
    for i in 0..n {
        let period = 100 + i64::try_from(i).unwrap_or(0) * 10;
        node.insert_timed(MonitorId::new(), period, Arc::new(|_| {}), 0, 0);
        node.insert_opportunistic(MonitorId::new(), period * 5, Arc::new(|_| {}), 0, 0);

        let threshold = i64::try_from(i).unwrap_or(0);
        let key = |leaf| WatchKey {
            tree: MonitorId::new(),
            node: leaf,
            epoch: 1,
        };
        node.insert_thresh(key(0), Threshold::Int { value: threshold }, 1000, true, 0);
        node.insert_thresh(key(1), Threshold::Int { value: threshold }, 1000, false, 0);
    }
    node
}

fn bench_update_value(c: &mut Criterion) {
    let mut group = c.benchmark_group("update_value");
    for n in [1usize, 16, 128] {
        group.throughput(Throughput::Elements(1));
        group.bench_function(format!("monitors_{n}"), |b| {
            b.iter_batched(
                || loaded_node(n),
                |mut node| {
                    let mut now = 0;
                    for step in 0..32 {
                        now += 50;
                        let _ = node.update_value(MetricValue::Int(step), now);
                    }
                    node
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_next_due(c: &mut Criterion) {
    let node = loaded_node(128);
    c.bench_function("next_due_128", |b| b.iter(|| node.next_due()));
}

criterion_group!(benches, bench_update_value, bench_next_due);
criterion_main!(benches);
