//! Collaborators the orchestrator consumes from its host.

use crate::error::EnvError;
use crate::terrain::{ContentGenerator, RegionSource, Terrain};
use crate::types::{BlockPos, EnvironmentKey, Placement, TenantId, Variant, WorldRef};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// A generator together with its region source, both bound to one seed.
#[derive(Clone)]
pub struct GeneratedContent {
    pub generator: Arc<dyn ContentGenerator>,
    pub regions: Arc<dyn RegionSource>,
}

/// Builds seed-bound procedural generators.
///
/// The seed is an explicit construction parameter: implementations must not
/// create a generator first and patch its seed afterwards.
pub trait GeneratorFactory: Send + Sync {
    /// Creates the content for `(seed, variant)`.
    fn create(&self, seed: u64, variant: Variant) -> Result<GeneratedContent, EnvError>;
}

/// The host's registry of live worlds.
pub trait WorldRegistry: Send + Sync {
    /// Registers a new environment driven by `content`.
    fn load(
        &self,
        key: EnvironmentKey,
        content: &GeneratedContent,
    ) -> Result<Arc<dyn Terrain>, EnvError>;

    /// Removes an environment. Returns `Ok(false)` if it was not registered.
    fn unload(&self, key: EnvironmentKey) -> Result<bool, EnvError>;

    /// The default world tenants land in when a sandbox is unusable.
    fn fallback(&self) -> Arc<dyn Terrain>;

    /// Spawn coordinate inside the fallback world.
    fn fallback_spawn(&self) -> BlockPos;
}

/// Resolves tenants to their live connection and location.
pub trait SessionDirectory: Send + Sync {
    /// Current placement of an online tenant.
    fn placement(&self, tenant: TenantId) -> Option<Placement>;

    /// Whether the tenant has a live connection.
    fn is_online(&self, tenant: TenantId) -> bool;

    /// Tenants currently inside a world.
    fn occupants(&self, world: &WorldRef) -> Vec<TenantId>;

    /// Moves a tenant.
    fn relocate(&self, tenant: TenantId, placement: Placement) -> Result<(), EnvError>;

    /// Pushes an environment-local time value to one tenant.
    fn send_time(&self, tenant: TenantId, tick: u64);
}

/// Persisted per-instance state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub key: EnvironmentKey,
    pub spawn: BlockPos,
    pub tick: u64,
    pub tick_speed: u64,
    pub saved_at_ms: u64,
}

/// Storage for instance data, addressed by environment key.
pub trait PersistenceProvider: Send + Sync {
    /// Checks that the backend is usable. Called once at startup.
    fn probe(&self) -> Result<(), EnvError>;

    /// Directory/path holding the key's data.
    fn path_for(&self, key: EnvironmentKey) -> PathBuf;

    /// Saves a snapshot, replacing any previous one for the same key.
    fn save(&self, snapshot: &InstanceSnapshot) -> Result<(), EnvError>;

    /// Loads the snapshot for a key, if one was saved.
    fn load(&self, key: EnvironmentKey) -> Result<Option<InstanceSnapshot>, EnvError>;

    /// Deletes a key's data.
    fn delete(&self, key: EnvironmentKey) -> Result<(), EnvError>;
}

/// Optional subsystem owning special per-instance encounter state.
pub trait EncounterRegistry: Send + Sync {
    /// Re-homes encounter state into a (re)created environment.
    fn rehome(&self, key: EnvironmentKey, terrain: &Arc<dyn Terrain>);

    /// Drops encounter state for a destroyed environment.
    fn release(&self, key: EnvironmentKey);
}
