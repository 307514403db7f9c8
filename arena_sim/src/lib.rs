//! Arena Deterministic Simulation Harness
//!
//! Runs the orchestrator against simulated collaborators so that every
//! scenario replays identically from a single 64-bit seed.
//!
//! # Sources of non-determinism, and how they are pinned
//!
//! - **Time**: `SimRuntime` keeps a virtual clock that only moves when a
//!   scenario advances it
//! - **Scheduling**: background work runs on a current-thread Tokio runtime,
//!   so it only progresses at explicit yield points
//! - **Content**: terrain is value noise seeded from the environment seed;
//!   scenario choices draw from one ChaCha8 stream
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SimWorld                            │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ SimRuntime (Virtual Clock + Seeded RNG)              │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │       │                                                     │
//! │  ┌────▼─────────────┐     ┌──────────────────────────┐     │
//! │  │   Orchestrator   │────►│ MemorySessions           │     │
//! │  │ (system under    │     │ MemoryRegistry           │     │
//! │  │  test)           │────►│ NoiseGeneratorFactory    │     │
//! │  └──────────────────┘     └──────────────────────────┘     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use arena_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::Supersede);
//! assert!(result.passed);
//! ```

mod context;
mod runner;
mod world;
pub mod scenarios;

pub use context::SimRuntime;
pub use runner::{ScenarioResult, ScenarioRunner, SimError};
pub use world::{NoiseGenerator, NoiseGeneratorFactory, NoiseRegions, SimWorld};
