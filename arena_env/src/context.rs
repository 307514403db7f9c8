//! Runtime and heartbeat abstractions for the orchestrator.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// The host's execution environment.
///
/// This trait abstracts the "real" host so the orchestrator can run
/// in both production (tokio) and simulation (virtual clock) environments.
///
/// # Implementations
///
/// - **Production**: `TokioRuntime` - wraps `tokio::time`, `tokio::spawn`
/// - **Simulation**: `SimRuntime` - manually advanced virtual clock
#[async_trait]
pub trait HostRuntime: Send + Sync + 'static {
    /// Returns the current monotonic time since runtime creation.
    ///
    /// Used for instance ages and slot grace windows.
    fn now(&self) -> Duration;

    /// Suspends execution for the given duration.
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    ///
    /// Used by the deferred unload worker and fire-and-forget persistence.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// The host's periodic tick event.
///
/// Each beat drives virtual clocks and dispatches deferred work onto the
/// authority thread.
#[async_trait]
pub trait Heartbeat: Send + Sync {
    /// Waits for the next beat and returns its sequence number.
    ///
    /// Returns `None` once the host stops ticking.
    async fn next_beat(&self) -> Option<u64>;
}
