//! Simulation runtime implementing HostRuntime for deterministic testing.

use arena_env::HostRuntime;
use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Simulation runtime backed by deterministic time and RNG.
///
/// This implements `HostRuntime` using:
/// - A virtual clock that only moves when advanced (or slept on)
/// - A seeded ChaCha8 RNG for scenario decisions
/// - Tokio tasks for background work, so a current-thread runtime keeps
///   execution order deterministic
pub struct SimRuntime {
    /// Master seed for this simulation
    seed: u64,

    /// Current virtual time (nanoseconds since simulation start)
    virtual_time_ns: Arc<Mutex<u64>>,

    /// Deterministic RNG for scenario decisions
    rng: Arc<Mutex<ChaCha8Rng>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SimRuntime {
    /// Creates a new SimRuntime with the given seed.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            virtual_time_ns: Arc::new(Mutex::new(0)),
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
        }
    }

    /// Creates an Arc-wrapped runtime for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Advances virtual time by the given duration.
    pub fn advance_time(&self, duration: Duration) {
        let mut time = lock(&self.virtual_time_ns);
        *time = time.saturating_add(duration.as_nanos() as u64);
    }

    /// Returns the current virtual time in nanoseconds.
    pub fn time_ns(&self) -> u64 {
        *lock(&self.virtual_time_ns)
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Next deterministic value in `0..bound`.
    pub fn next_below(&self, bound: u64) -> u64 {
        lock(&self.rng).gen_range(0..bound.max(1))
    }

    /// Next deterministic 64-bit value.
    pub fn next_u64(&self) -> u64 {
        lock(&self.rng).gen()
    }
}

impl Clone for SimRuntime {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            virtual_time_ns: Arc::clone(&self.virtual_time_ns),
            rng: Arc::clone(&self.rng),
        }
    }
}

#[async_trait]
impl HostRuntime for SimRuntime {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.time_ns())
    }

    async fn sleep(&self, duration: Duration) {
        // In simulation, sleep advances virtual time and lets other tasks run
        self.advance_time(duration);
        tokio::task::yield_now().await;
    }

    fn spawn<F>(&self, _name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_runtime_time() {
        let rt = SimRuntime::new(42);
        assert_eq!(rt.now(), Duration::ZERO);

        rt.advance_time(Duration::from_secs(1));
        assert_eq!(rt.now(), Duration::from_secs(1));

        rt.advance_time(Duration::from_millis(500));
        assert_eq!(rt.now(), Duration::from_millis(1500));
    }

    #[test]
    fn test_sim_runtime_deterministic_draws() {
        let a = SimRuntime::new(42);
        let b = SimRuntime::new(42);
        let draws_a: Vec<u64> = (0..8).map(|_| a.next_below(100)).collect();
        let draws_b: Vec<u64> = (0..8).map(|_| b.next_below(100)).collect();
        assert_eq!(draws_a, draws_b);
        assert_ne!(SimRuntime::new(1).next_u64(), SimRuntime::new(2).next_u64());
    }

    #[test]
    fn test_sim_runtime_clone_shares_time() {
        let rt1 = SimRuntime::new(42);
        let rt2 = rt1.clone();

        rt1.advance_time(Duration::from_secs(5));

        assert_eq!(rt1.now(), rt2.now());
    }

    #[tokio::test]
    async fn test_sleep_advances_virtual_time() {
        let rt = SimRuntime::new(7);
        rt.sleep(Duration::from_millis(250)).await;
        assert_eq!(rt.now(), Duration::from_millis(250));
    }
}
