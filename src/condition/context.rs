//! Serializing execution context for condition trees.
//!
//! One dedicated worker thread owns the [`ConditionRegistry`] and performs every
//! tree mutation: registration, activation, leaf signal propagation, removal and
//! expiry. Other threads only post messages into its bounded queue, so trees
//! need no locking of their own.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{ExecutionError, MetronError, MetronResult};
use crate::monitor::{LeafSignal, MonitorId};
use crate::time::Clock;

use super::registry::{ConditionMonitor, ConditionRegistry};
use super::tree::ThresholdHost;

const CONTEXT_PATH: &str = "condition_context";

enum ContextMsg {
    Register {
        monitor: Box<ConditionMonitor>,
        reply: Option<Sender<MetronResult<()>>>,
    },
    Unregister {
        id: MonitorId,
    },
    Signals {
        signals: Vec<LeafSignal>,
    },
    Flush {
        reply: Sender<()>,
    },
}

#[derive(Debug, Default)]
struct ContextStats {
    active: AtomicUsize,
    conflicts: AtomicU64,
    dropped: AtomicU64,
}

/// Handle to the condition worker thread.
#[derive(Debug)]
pub struct ConditionContext {
    tx: Sender<ContextMsg>,
    capacity: usize,
    stats: Arc<ContextStats>,
    worker: ThreadId,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ConditionContext {
    /// Spawns the worker. Leaves register their watches through `host`.
    pub fn start(cfg: &EngineConfig, host: Arc<dyn ThresholdHost>, clock: Arc<dyn Clock>) -> Self {
        let capacity = cfg.context_queue_capacity.max(1);
        let sweep_every = Duration::from_millis(cfg.expiry_sweep_interval_ms.max(1));
        let (tx, rx) = bounded::<ContextMsg>(capacity);
        let stats = Arc::new(ContextStats::default());

        let worker = Worker {
            registry: ConditionRegistry::new(),
            host,
            clock,
            retry: VecDeque::new(),
            stats: Arc::clone(&stats),
        };
        let join = thread::Builder::new()
            .name("metron-conditions".to_string())
            .spawn(move || worker.run(&rx, sweep_every))
            .expect("failed to spawn metron condition worker");
        let worker = join.thread().id();
        info!(capacity, "condition context started");

        Self {
            tx,
            capacity,
            stats,
            worker,
            join: Mutex::new(Some(join)),
        }
    }

    fn on_worker(&self) -> bool {
        thread::current().id() == self.worker
    }

    /// Queues a message. The worker itself never blocks on its own queue.
    fn submit(&self, msg: ContextMsg) -> MetronResult<()> {
        if self.on_worker() {
            return self.tx.try_send(msg).map_err(|err| match err {
                TrySendError::Full(_) => ExecutionError::QueueFull {
                    path: CONTEXT_PATH.to_string(),
                    capacity: self.capacity,
                }
                .into(),
                TrySendError::Disconnected(_) => disconnected(),
            });
        }
        self.tx.send(msg).map_err(|_| disconnected())
    }

    /// Registers and activates a condition monitor.
    ///
    /// Waits for the worker's acknowledgement, except when called from a
    /// condition callback, where the registration is only queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker is gone or a leaf could not be registered.
    pub fn register(&self, monitor: ConditionMonitor) -> MetronResult<()> {
        if self.on_worker() {
            return self.submit(ContextMsg::Register {
                monitor: Box::new(monitor),
                reply: None,
            });
        }

        let (reply_tx, reply_rx) = bounded::<MetronResult<()>>(1);
        self.submit(ContextMsg::Register {
            monitor: Box::new(monitor),
            reply: Some(reply_tx),
        })?;
        reply_rx.recv().map_err(|_| disconnected())?
    }

    /// Queues removal of a condition monitor. Unknown ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker is gone or its queue is full.
    pub fn unregister(&self, id: MonitorId) -> MetronResult<()> {
        self.submit(ContextMsg::Unregister { id })
    }

    /// Hands leaf edges produced by a sample to the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker is gone or its queue is full.
    pub fn post_signals(&self, signals: Vec<LeafSignal>) -> MetronResult<()> {
        if signals.is_empty() {
            return Ok(());
        }
        let count = signals.len() as u64;
        self.submit(ContextMsg::Signals { signals }).inspect_err(|_| {
            self.stats.dropped.fetch_add(count, Ordering::Relaxed);
        })
    }

    /// Waits until every message queued before this call has been handled.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::Timeout` if the worker does not catch up in time.
    pub fn flush(&self, timeout: Duration) -> MetronResult<()> {
        if self.on_worker() {
            return Ok(());
        }
        let (reply_tx, reply_rx) = bounded::<()>(1);
        self.submit(ContextMsg::Flush { reply: reply_tx })?;
        reply_rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => ExecutionError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }
            .into(),
            RecvTimeoutError::Disconnected => disconnected(),
        })
    }

    /// Number of live condition monitors.
    #[must_use]
    pub fn active_conditions(&self) -> usize {
        self.stats.active.load(Ordering::Relaxed)
    }

    /// Removals refused because the monitor was mid-propagation.
    #[must_use]
    pub fn registry_conflicts(&self) -> u64 {
        self.stats.conflicts.load(Ordering::Relaxed)
    }

    /// Leaf signals that found no live condition or could not be queued.
    #[must_use]
    pub fn dropped_signals(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for ConditionContext {
    fn drop(&mut self) {
        // Close the queue so the worker drains and exits, then join it.
        let (dummy_tx, _) = bounded::<ContextMsg>(1);
        drop(std::mem::replace(&mut self.tx, dummy_tx));

        if let Ok(mut guard) = self.join.lock() {
            if let Some(handle) = guard.take() {
                // Joining from inside a condition callback would wait on ourselves.
                if !self.on_worker() {
                    let _ = handle.join();
                }
            }
        }
    }
}

fn disconnected() -> MetronError {
    ExecutionError::Disconnected {
        path: CONTEXT_PATH.to_string(),
    }
    .into()
}

struct Worker {
    registry: ConditionRegistry,
    host: Arc<dyn ThresholdHost>,
    clock: Arc<dyn Clock>,
    retry: VecDeque<MonitorId>,
    stats: Arc<ContextStats>,
}

impl Worker {
    fn run(mut self, rx: &Receiver<ContextMsg>, sweep_every: Duration) {
        let mut last_sweep = Instant::now();

        loop {
            select! {
                recv(rx) -> msg => match msg {
                    Ok(msg) => self.handle(msg),
                    Err(_) => break,
                },
                default(sweep_every) => {}
            }

            for _ in 0..self.retry.len() {
                if let Some(id) = self.retry.pop_front() {
                    self.remove(id);
                }
            }

            if last_sweep.elapsed() >= sweep_every {
                self.sweep_expired();
                last_sweep = Instant::now();
            }
            self.stats.active.store(self.registry.len(), Ordering::Relaxed);
        }

        for mut monitor in self.registry.drain() {
            monitor.tree.clear(self.host.as_ref());
        }
        self.stats.active.store(0, Ordering::Relaxed);
        info!("condition context stopped");
    }

    fn handle(&mut self, msg: ContextMsg) {
        match msg {
            ContextMsg::Register { monitor, reply } => {
                let result = self.register(*monitor);
                if let Err(e) = &result {
                    warn!(error = %e, "condition registration failed");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            ContextMsg::Unregister { id } => self.remove(id),
            ContextMsg::Signals { signals } => {
                for signal in signals {
                    self.apply(signal);
                }
            }
            ContextMsg::Flush { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn register(&mut self, monitor: ConditionMonitor) -> MetronResult<()> {
        let id = monitor.id();
        if let Some(mut old) = self.registry.insert_event(monitor) {
            old.tree.clear(self.host.as_ref());
        }

        let Some(mut monitor) = self.registry.lease(id) else {
            return Err(MetronError::internal(format!("condition {id} vanished during registration")));
        };
        match monitor.tree.activate(self.host.as_ref()) {
            Ok(()) => {
                monitor.dispatch_transitions();
                self.registry.restore(monitor);
                debug!(tree = %id, "condition registered");
                Ok(())
            }
            Err(e) => {
                monitor.tree.clear(self.host.as_ref());
                self.registry.release(id);
                Err(e)
            }
        }
    }

    fn remove(&mut self, id: MonitorId) {
        match self.registry.remove_event(id) {
            Ok(Some(mut monitor)) => {
                monitor.tree.clear(self.host.as_ref());
                debug!(tree = %id, "condition removed");
            }
            Ok(None) => {}
            Err(e) => {
                self.stats.conflicts.fetch_add(1, Ordering::Relaxed);
                warn!(tree = %id, error = %e, "condition removal deferred");
                self.retry.push_back(id);
            }
        }
    }

    fn apply(&mut self, signal: LeafSignal) {
        let Some(mut monitor) = self.registry.lease(signal.key.tree) else {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(tree = %signal.key.tree, "signal for unknown condition dropped");
            return;
        };
        if let Err(e) = monitor.tree.on_signal(signal, self.host.as_ref()) {
            warn!(tree = %signal.key.tree, error = %e, "condition propagation failed");
        }
        monitor.dispatch_transitions();
        self.registry.restore(monitor);
    }

    fn sweep_expired(&mut self) {
        for id in self.registry.expired(self.clock.now_ms()) {
            info!(tree = %id, "condition monitor expired");
            self.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::condition::{ConditionEvent, ConditionTree, Expression};
    use crate::metric::MetricId;
    use crate::monitor::WatchKey;
    use crate::time::{ManualClock, Millis};
    use crate::value::Threshold;

    #[derive(Default)]
    struct KeyHost {
        keys: Mutex<Vec<WatchKey>>,
    }

    impl ThresholdHost for KeyHost {
        fn insert_threshold(
            &self,
            _metric: &MetricId,
            key: WatchKey,
            _threshold: Threshold,
            _period: Millis,
            _is_max: bool,
        ) -> MetronResult<()> {
            self.keys.lock().unwrap().push(key);
            Ok(())
        }

        fn remove_threshold(&self, _metric: &MetricId, key: &WatchKey, _is_max: bool) {
            self.keys.lock().unwrap().retain(|k| k.node != key.node || k.tree != key.tree);
        }
    }

    fn start(host: &Arc<KeyHost>, clock: &Arc<ManualClock>) -> ConditionContext {
        let cfg = EngineConfig {
            expiry_sweep_interval_ms: 5,
            ..EngineConfig::default()
        };
        ConditionContext::start(&cfg, Arc::clone(host) as Arc<dyn ThresholdHost>, Arc::clone(clock) as Arc<dyn Clock>)
    }

    fn monitor(expires_at: Option<Millis>) -> (ConditionMonitor, crossbeam_channel::Receiver<ConditionEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let expr = Expression::above("battery", Threshold::Int { value: 10 });
        let tree = ConditionTree::build(MonitorId::new(), &expr, 1000, |_| Ok(1)).unwrap();
        let callback = Arc::new(move |ev: &ConditionEvent| {
            let _ = tx.send(ev.clone());
        });
        (ConditionMonitor::new(tree, callback, expires_at), rx)
    }

    #[test]
    fn register_signal_and_unregister_round_trip() {
        let host = Arc::new(KeyHost::default());
        let clock = Arc::new(ManualClock::new(0));
        let ctx = start(&host, &clock);

        let (m, events) = monitor(None);
        let id = m.id();
        ctx.register(m).unwrap();
        assert_eq!(host.keys.lock().unwrap().len(), 1);

        let key = host.keys.lock().unwrap()[0];
        ctx.post_signals(vec![LeafSignal { key, exceeded: true }]).unwrap();
        let ev = events.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(ev.monitor_id, id);
        assert!(ev.triggered);

        ctx.unregister(id).unwrap();
        ctx.unregister(id).unwrap();
        ctx.flush(Duration::from_secs(1)).unwrap();
        assert!(host.keys.lock().unwrap().is_empty());
        assert_eq!(ctx.active_conditions(), 0);
    }

    #[test]
    fn expired_condition_is_swept() {
        let host = Arc::new(KeyHost::default());
        let clock = Arc::new(ManualClock::new(0));
        let ctx = start(&host, &clock);

        let (m, _events) = monitor(Some(100));
        ctx.register(m).unwrap();
        ctx.flush(Duration::from_secs(1)).unwrap();
        assert_eq!(ctx.active_conditions(), 1);

        clock.set(150);
        let deadline = Instant::now() + Duration::from_secs(2);
        while ctx.active_conditions() != 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(ctx.active_conditions(), 0);
        assert!(host.keys.lock().unwrap().is_empty());
    }

    #[test]
    fn callback_may_unregister_its_own_condition() {
        let host = Arc::new(KeyHost::default());
        let clock = Arc::new(ManualClock::new(0));
        let ctx = Arc::new(start(&host, &clock));

        let expr = Expression::above("battery", Threshold::Int { value: 10 });
        let id = MonitorId::new();
        let tree = ConditionTree::build(id, &expr, 1000, |_| Ok(1)).unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let weak = Arc::downgrade(&ctx);
        let f = Arc::clone(&fired);
        let callback = Arc::new(move |ev: &ConditionEvent| {
            f.store(true, Ordering::SeqCst);
            if let Some(ctx) = weak.upgrade() {
                ctx.unregister(ev.monitor_id).unwrap();
            }
        });
        ctx.register(ConditionMonitor::new(tree, callback, None)).unwrap();

        let key = host.keys.lock().unwrap()[0];
        ctx.post_signals(vec![LeafSignal { key, exceeded: true }]).unwrap();
        ctx.flush(Duration::from_secs(1)).unwrap();
        ctx.flush(Duration::from_secs(1)).unwrap();

        assert!(fired.load(Ordering::SeqCst));
        assert!(host.keys.lock().unwrap().is_empty());
    }
    struct RefusingHost;

    impl ThresholdHost for RefusingHost {
        fn insert_threshold(
            &self,
            metric: &MetricId,
            _key: WatchKey,
            _threshold: Threshold,
            _period: Millis,
            _is_max: bool,
        ) -> MetronResult<()> {
            Err(crate::error::ValidationError::UnsupportedMetric { metric: metric.clone() }.into())
        }

        fn remove_threshold(&self, _metric: &MetricId, _key: &WatchKey, _is_max: bool) {}
    }

    #[test]
    fn failed_activation_leaves_no_lease_behind() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let ctx = ConditionContext::start(&EngineConfig::default(), Arc::new(RefusingHost), clock);

        let (m, _events) = monitor(None);
        let id = m.id();
        let err = ctx.register(m).unwrap_err();
        assert!(err.is_validation());

        ctx.unregister(id).unwrap();
        ctx.flush(Duration::from_secs(1)).unwrap();
        thread::sleep(Duration::from_millis(50));
        ctx.flush(Duration::from_secs(1)).unwrap();

        assert_eq!(ctx.registry_conflicts(), 0);
        assert_eq!(ctx.active_conditions(), 0);
    }
}
