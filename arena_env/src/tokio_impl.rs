//! Production implementations of HostRuntime and Heartbeat using Tokio.

use crate::{Heartbeat, HostRuntime};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Production runtime backed by Tokio.
///
/// Time comes from the system monotonic clock, tasks from `tokio::spawn`.
pub struct TokioRuntime {
    /// Start time for monotonic duration calculations
    start: Instant,
}

impl TokioRuntime {
    /// Creates a new TokioRuntime.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Creates an Arc-wrapped runtime for sharing across tasks.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for TokioRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostRuntime for TokioRuntime {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn spawn<F>(&self, _name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future);
    }
}

/// Fixed-period heartbeat driven by `tokio::time::interval`.
pub struct IntervalHeartbeat {
    interval: Mutex<Interval>,
    beats: AtomicU64,
    /// Stop after this many beats (None = forever)
    limit: Option<u64>,
}

impl IntervalHeartbeat {
    /// Creates a heartbeat firing every `period`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(period: Duration) -> Self {
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            interval: Mutex::new(interval),
            beats: AtomicU64::new(0),
            limit: None,
        }
    }

    /// Stops after `limit` beats.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[async_trait]
impl Heartbeat for IntervalHeartbeat {
    async fn next_beat(&self) -> Option<u64> {
        if let Some(limit) = self.limit {
            if self.beats.load(Ordering::SeqCst) >= limit {
                return None;
            }
        }
        self.interval.lock().await.tick().await;
        Some(self.beats.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tokio_runtime_time() {
        let rt = TokioRuntime::new();
        let t1 = rt.now();
        rt.sleep(Duration::from_millis(10)).await;
        let t2 = rt.now();

        assert!(t2 > t1);
        assert!(t2 - t1 >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_tokio_runtime_spawn() {
        let rt = TokioRuntime::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        rt.spawn("probe", async move {
            let _ = tx.send(7u32);
        });
        assert_eq!(rx.await.ok(), Some(7));
    }

    #[tokio::test]
    async fn test_interval_heartbeat_limit() {
        let hb = IntervalHeartbeat::new(Duration::from_millis(1)).with_limit(3);
        assert_eq!(hb.next_beat().await, Some(1));
        assert_eq!(hb.next_beat().await, Some(2));
        assert_eq!(hb.next_beat().await, Some(3));
        assert_eq!(hb.next_beat().await, None);
    }
}
