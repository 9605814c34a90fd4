//! Wake-up scheduling.
//!
//! Each metric has at most one pending wake-up. Scheduling a new one supersedes
//! the old, and a metric with nothing registered has none. A single thread sleeps
//! until the earliest wake-up and then asks the metric's source for a sample.
//! A fired wake-up is re-armed `retry` ms later; the sample it asked for
//! supersedes that when it arrives.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, trace, warn};

use crate::metric::MetricId;
use crate::time::{Clock, Millis};

/// Longest the thread sleeps before re-reading the clock.
const MAX_IDLE: Duration = Duration::from_millis(250);

/// Called on the scheduler thread when a metric's wake-up fires.
pub type WakeHandler = Box<dyn Fn(&MetricId) + Send + Sync>;

#[derive(Debug, Default)]
struct Pending {
    due: HashMap<MetricId, Millis>,
}

impl Pending {
    fn earliest(&self) -> Option<(&MetricId, Millis)> {
        self.due.iter().map(|(m, due)| (m, *due)).min_by_key(|(_, due)| *due)
    }
}

/// Owner of the wake-up thread.
#[derive(Debug)]
pub struct WakeupScheduler {
    pending: Arc<Mutex<Pending>>,
    kick: Sender<()>,
    worker: ThreadId,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl WakeupScheduler {
    /// Spawns the scheduler thread.
    pub fn start(clock: Arc<dyn Clock>, handler: WakeHandler, retry: Millis) -> Self {
        let pending = Arc::new(Mutex::new(Pending::default()));
        let (kick, kick_rx) = bounded::<()>(1);

        let state = Arc::clone(&pending);
        let join = thread::Builder::new()
            .name("metron-wakeup".to_string())
            .spawn(move || wake_loop(&state, clock.as_ref(), &handler, retry.max(1), &kick_rx))
            .expect("failed to spawn metron wake-up thread");
        let worker = join.thread().id();

        Self {
            pending,
            kick,
            worker,
            join: Mutex::new(Some(join)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        // Pending is a plain map; a panic elsewhere cannot leave it half-written.
        self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Sets or clears the wake-up for `metric`.
    pub fn update(&self, metric: &MetricId, due: Option<Millis>) {
        match due {
            Some(at) => self.schedule(metric, at),
            None => self.cancel(metric),
        }
    }

    /// Replaces any pending wake-up for `metric` with one at `at`.
    pub fn schedule(&self, metric: &MetricId, at: Millis) {
        let previous = self.lock().due.insert(metric.clone(), at);
        if previous != Some(at) {
            trace!(metric = %metric, at, ?previous, "wake-up scheduled");
            let _ = self.kick.try_send(());
        }
    }

    /// Drops the pending wake-up for `metric`, if any.
    pub fn cancel(&self, metric: &MetricId) {
        if self.lock().due.remove(metric).is_some() {
            trace!(metric = %metric, "wake-up cancelled");
        }
    }

    /// Time of the pending wake-up for `metric`.
    #[must_use]
    pub fn pending(&self, metric: &MetricId) -> Option<Millis> {
        self.lock().due.get(metric).copied()
    }

    /// Number of metrics with a pending wake-up.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().due.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for WakeupScheduler {
    fn drop(&mut self) {
        let (dummy, _) = bounded::<()>(1);
        drop(std::mem::replace(&mut self.kick, dummy));

        if let Ok(mut guard) = self.join.lock() {
            if let Some(handle) = guard.take() {
                if thread::current().id() != self.worker {
                    let _ = handle.join();
                }
            }
        }
    }
}

fn wake_loop(pending: &Mutex<Pending>, clock: &dyn Clock, handler: &WakeHandler, retry: Millis, kick: &Receiver<()>) {
    loop {
        let now = clock.now_ms();
        let (fire, wait) = {
            let Ok(mut state) = pending.lock() else {
                warn!("wake-up state poisoned, stopping scheduler");
                return;
            };
            match state.earliest().map(|(m, due)| (m.clone(), due)) {
                Some((metric, due)) if due <= now => {
                    state.due.insert(metric.clone(), now.saturating_add(retry));
                    (Some((metric, due)), Duration::ZERO)
                }
                Some((_, due)) => {
                    let ms = u64::try_from(due - now).unwrap_or(0);
                    (None, Duration::from_millis(ms).min(MAX_IDLE))
                }
                None => (None, MAX_IDLE),
            }
        };

        if let Some((metric, due)) = fire {
            debug!(metric = %metric, due, now, "wake-up fired, requesting sample");
            handler(&metric);
            continue;
        }

        match kick.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
