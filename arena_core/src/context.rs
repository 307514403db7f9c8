//! Injected host collaborators.

use arena_env::{
    EncounterRegistry, GeneratorFactory, HostRuntime, PersistenceProvider, Placement,
    SessionDirectory, WorldRegistry,
};
use std::sync::Arc;

/// Everything the orchestrator needs from its host, constructed once at
/// startup and passed explicitly.
pub struct OrchestratorContext<R: HostRuntime> {
    /// Time and background tasks
    pub runtime: Arc<R>,

    /// Tenant connections and locations
    pub sessions: Arc<dyn SessionDirectory>,

    /// Instance data storage
    pub persistence: Arc<dyn PersistenceProvider>,

    /// Seed-bound generator construction
    pub generators: Arc<dyn GeneratorFactory>,

    /// Live world registry
    pub registry: Arc<dyn WorldRegistry>,

    /// Optional encounter/boss state
    pub encounters: Option<Arc<dyn EncounterRegistry>>,
}

impl<R: HostRuntime> OrchestratorContext<R> {
    pub fn new(
        runtime: Arc<R>,
        sessions: Arc<dyn SessionDirectory>,
        persistence: Arc<dyn PersistenceProvider>,
        generators: Arc<dyn GeneratorFactory>,
        registry: Arc<dyn WorldRegistry>,
    ) -> Self {
        Self {
            runtime,
            sessions,
            persistence,
            generators,
            registry,
            encounters: None,
        }
    }

    /// Attaches an encounter subsystem.
    pub fn with_encounters(mut self, encounters: Arc<dyn EncounterRegistry>) -> Self {
        self.encounters = Some(encounters);
        self
    }

    /// Where tenants go when no sandbox is usable.
    pub fn fallback_placement(&self) -> Placement {
        Placement::new(self.registry.fallback().world_ref(), self.registry.fallback_spawn())
    }
}

impl<R: HostRuntime> Clone for OrchestratorContext<R> {
    fn clone(&self) -> Self {
        Self {
            runtime: Arc::clone(&self.runtime),
            sessions: Arc::clone(&self.sessions),
            persistence: Arc::clone(&self.persistence),
            generators: Arc::clone(&self.generators),
            registry: Arc::clone(&self.registry),
            encounters: self.encounters.clone(),
        }
    }
}
