//! Arena Host Abstraction Layer
//!
//! This crate provides the "Sans-IO" seam that lets the sandbox orchestrator
//! run against a **Production** host (tokio) or a **Simulation** host
//! (virtual clock, in-memory worlds).
//!
//! # Core Concept: Injected Collaborators
//!
//! The orchestrator never reaches into global host state. Everything it
//! touches comes in through a trait:
//! - Time and background tasks (`HostRuntime`, `Heartbeat`)
//! - Procedural content (`GeneratorFactory`, `ContentGenerator`, `RegionSource`)
//! - Live worlds (`WorldRegistry`, `Terrain`)
//! - Tenants (`SessionDirectory`)
//! - Storage (`PersistenceProvider`)
//! - Optional encounter state (`EncounterRegistry`)
//!
//! # Example
//!
//! ```ignore
//! use arena_env::{Heartbeat, IntervalHeartbeat};
//!
//! let heartbeat = IntervalHeartbeat::new(Duration::from_millis(50));
//! while let Some(beat) = heartbeat.next_beat().await {
//!     orchestrator.heartbeat();
//! }
//! ```

mod context;
mod error;
mod host;
mod memory_impl;
mod terrain;
mod tokio_impl;
mod types;

pub use context::{Heartbeat, HostRuntime};
pub use error::EnvError;
pub use host::{
    EncounterRegistry, GeneratedContent, GeneratorFactory, InstanceSnapshot, PersistenceProvider,
    SessionDirectory, WorldRegistry,
};
pub use memory_impl::{
    FlatGenerator, MemoryPersistence, MemoryRegistry, MemorySessions, MemoryTerrain, UniformRegions,
};
pub use terrain::{
    Axis, BlockKind, ContentGenerator, GenerationBudget, RegionId, RegionSource, Terrain,
};
pub use tokio_impl::{IntervalHeartbeat, TokioRuntime};
pub use types::{BlockPos, EnvironmentKey, Placement, Slot, TenantId, Variant, WorldRef};
