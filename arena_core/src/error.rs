//! Orchestrator error taxonomy.
//!
//! Apart from `Startup` and `Config`, none of these reach a tenant: the
//! orchestrator logs them and degrades.

use arena_env::{BlockPos, EnvError, EnvironmentKey, Slot, TenantId};
use thiserror::Error;

/// Errors and degradations raised inside the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Slot conflict for tenant {tenant}: bound to {bound}, observed in {observed}")]
    SlotConflict {
        tenant: TenantId,
        bound: Slot,
        observed: Slot,
    },

    #[error("Creation failed for {key}: {reason}")]
    CreationFailure { key: EnvironmentKey, reason: String },

    #[error("Instance {0} already gone at teardown")]
    UnloadRace(EnvironmentKey),

    #[error("No clear space for gateway at {:?}", .0.as_slice())]
    GatewaySpaceExhausted(BlockPos),

    #[error("No safe spawn in {key} within radius {radius}")]
    SpawnSearchExhausted { key: String, radius: i32 },

    #[error("All {max_slots} slots in use")]
    SlotPoolExhausted { max_slots: u32 },

    #[error("Startup failed: {0}")]
    Startup(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Env(#[from] EnvError),
}

impl OrchestratorError {
    /// Short taxonomy name for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SlotConflict { .. } => "slot_conflict",
            Self::CreationFailure { .. } => "creation_failure",
            Self::UnloadRace(_) => "unload_race",
            Self::GatewaySpaceExhausted(_) => "gateway_space_exhausted",
            Self::SpawnSearchExhausted { .. } => "spawn_search_exhausted",
            Self::SlotPoolExhausted { .. } => "slot_pool_exhausted",
            Self::Startup(_) => "startup",
            Self::Config(_) => "config",
            Self::Env(_) => "env",
        }
    }

    /// Creates a creation failure.
    pub fn creation(key: EnvironmentKey, reason: impl std::fmt::Display) -> Self {
        Self::CreationFailure {
            key,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_env::Variant;

    #[test]
    fn test_kinds_and_messages() {
        let key = EnvironmentKey::new(Slot(3), Variant::Primary, 42);
        let err = OrchestratorError::creation(key, "registry offline");
        assert_eq!(err.kind(), "creation_failure");
        assert_eq!(err.to_string(), "Creation failed for slot-3/primary/42: registry offline");

        let err = OrchestratorError::GatewaySpaceExhausted(BlockPos::new(1, 2, 3));
        assert_eq!(err.to_string(), "No clear space for gateway at [1, 2, 3]");

        let err: OrchestratorError = EnvError::unavailable("x").into();
        assert_eq!(err.kind(), "env");
    }
}
