//! Deferred teardown of environment instances.
//!
//! A single sequential worker receives scheduled keys, performs its
//! pre-work (an optional settle delay) without touching shared state, and
//! then re-dispatches the actual teardown onto the authority thread through
//! the [`AuthorityInbox`], which the heartbeat drains.
//!
//! ```text
//!  schedule(key) ──► [worker task] ──sleep(settle)──► AuthorityInbox
//!        │                                                  │
//!   pending marker ◄── cancel(key) on re-request            ▼
//!                                               heartbeat: teardown(key)
//! ```
//!
//! The pending marker doubles as the cancellation flag: removing it before
//! the authority thread runs the task turns the task into a no-op.

use crate::lock;
use arena_env::{EnvironmentKey, HostRuntime};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Work dispatched back onto the authority thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorityTask {
    /// Tear down an instance if it is still marked pending
    Teardown(EnvironmentKey),
}

/// Receiving end drained by the heartbeat.
pub struct AuthorityInbox {
    rx: Mutex<mpsc::UnboundedReceiver<AuthorityTask>>,
}

impl AuthorityInbox {
    /// Takes every task dispatched so far, in order.
    pub fn drain(&self) -> Vec<AuthorityTask> {
        let mut rx = lock(&self.rx);
        let mut tasks = Vec::new();
        while let Ok(task) = rx.try_recv() {
            tasks.push(task);
        }
        tasks
    }
}

/// Sequential teardown scheduler with per-key dedupe.
pub struct DeferredUnloadQueue {
    pending: Mutex<HashSet<EnvironmentKey>>,
    jobs: mpsc::UnboundedSender<EnvironmentKey>,
}

impl DeferredUnloadQueue {
    /// Creates the queue and spawns its worker on `runtime`.
    pub fn start<R: HostRuntime>(runtime: &Arc<R>, settle: Duration) -> (Self, AuthorityInbox) {
        let (jobs, mut job_rx) = mpsc::unbounded_channel::<EnvironmentKey>();
        let (dispatch, dispatch_rx) = mpsc::unbounded_channel::<AuthorityTask>();

        let worker_runtime = Arc::clone(runtime);
        runtime.spawn("deferred-unload", async move {
            while let Some(key) = job_rx.recv().await {
                if !settle.is_zero() {
                    worker_runtime.sleep(settle).await;
                }
                debug!("Dispatching teardown of {} to authority thread", key);
                if dispatch.send(AuthorityTask::Teardown(key)).is_err() {
                    break;
                }
            }
        });

        let queue = Self {
            pending: Mutex::new(HashSet::new()),
            jobs,
        };
        let inbox = AuthorityInbox {
            rx: Mutex::new(dispatch_rx),
        };
        (queue, inbox)
    }

    /// Schedules a teardown. Returns false if one is already pending.
    pub fn schedule(&self, key: EnvironmentKey) -> bool {
        let mut pending = lock(&self.pending);
        if !pending.insert(key) {
            return false;
        }
        if self.jobs.send(key).is_err() {
            warn!("Unload worker stopped; dropping teardown of {}", key);
            pending.remove(&key);
            return false;
        }
        true
    }

    /// Cancels a pending teardown. Returns true if one was pending.
    pub fn cancel(&self, key: EnvironmentKey) -> bool {
        lock(&self.pending).remove(&key)
    }

    /// Claims a dispatched teardown. False means it was cancelled.
    pub fn claim(&self, key: EnvironmentKey) -> bool {
        lock(&self.pending).remove(&key)
    }

    pub fn is_pending(&self, key: EnvironmentKey) -> bool {
        lock(&self.pending).contains(&key)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Drops every pending marker (shutdown flush).
    pub fn clear(&self) {
        lock(&self.pending).clear();
    }
}
