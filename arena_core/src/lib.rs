//! Arena Core - Sandbox Environment Orchestration
//!
//! Gives every tenant a private, seed-driven sandbox environment inside a
//! shared host. The subsystem solves four problems:
//! 1. **Slot Drift**: one table decides which slot a tenant holds, reconciled
//!    against where the tenant actually is
//! 2. **Duplicate Worlds**: concurrent requests for one environment key share
//!    a single construction
//! 3. **Unsafe Arrival**: tenants never land in fluid or solid matter, and
//!    placement never forces full generation
//! 4. **Stale Instances**: superseded seeds are torn down on a deferred,
//!    cancellable schedule
//!
//! [`Orchestrator`] is the facade; the other modules are its building blocks.

use std::sync::{Mutex, MutexGuard};

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod orchestrator;
pub mod persistence;
pub mod seed_registry;
pub mod slots;
pub mod spawn;
pub mod unload;

#[cfg(test)]
mod test_support;

// Re-export key types for convenience
pub use clock::{ClockEntry, VirtualClockService};
pub use config::OrchestratorConfig;
pub use context::OrchestratorContext;
pub use error::OrchestratorError;
pub use gateway::{GatewayLink, GatewayLinker};
pub use lifecycle::{Destination, EnvironmentInstance, EnvironmentLifecycleManager, TeardownOutcome};
pub use orchestrator::{HeartbeatReport, Orchestrator, OrchestratorStats};
pub use persistence::SledPersistence;
pub use seed_registry::SeedRegistry;
pub use slots::{SlotAllocator, SlotAssignment, SlotSource};
pub use spawn::{SpawnPoint, SpawnPointResolver, SpawnSettings};
pub use unload::{AuthorityInbox, AuthorityTask, DeferredUnloadQueue};

/// Locks a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
