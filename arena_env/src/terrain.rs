//! Block model, procedural generators and live terrain access.

use crate::types::{BlockPos, EnvironmentKey, Variant, WorldRef};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Horizontal axis a gateway surface is aligned with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Z,
}

impl Axis {
    /// Unit step along this axis.
    pub fn step(self) -> BlockPos {
        match self {
            Axis::X => BlockPos::new(1, 0, 0),
            Axis::Z => BlockPos::new(0, 0, 1),
        }
    }

    /// The perpendicular horizontal axis.
    pub fn perpendicular(self) -> Axis {
        match self {
            Axis::X => Axis::Z,
            Axis::Z => Axis::X,
        }
    }
}

/// Coarse block classification the orchestrator reasons about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockKind {
    Air,
    Solid,
    Fluid,
    /// Gateway frame block (solid)
    Frame,
    /// Gateway surface aligned with an axis (passable)
    Gateway(Axis),
}

impl BlockKind {
    /// Blocks a tenant can stand on.
    pub fn is_solid(self) -> bool {
        matches!(self, BlockKind::Solid | BlockKind::Frame)
    }

    /// Liquid blocks.
    pub fn is_fluid(self) -> bool {
        matches!(self, BlockKind::Fluid)
    }

    /// Blocks a tenant can occupy.
    pub fn is_clear(self) -> bool {
        matches!(self, BlockKind::Air)
    }
}

/// Identifier of a biome/region produced by a region source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionId(pub u16);

/// A seed-bound procedural content generator.
///
/// The seed is fixed when the generator is constructed and never changes
/// afterwards.
pub trait ContentGenerator: Send + Sync {
    /// Seed this generator was built with.
    fn seed(&self) -> u64;

    /// Variant this generator produces terrain for.
    fn variant(&self) -> Variant;

    /// Inclusive vertical bounds `(min_y, max_y)`.
    fn height_range(&self) -> (i32, i32);

    /// Cheap surface estimate from noise alone, without generating blocks.
    ///
    /// Returns `None` when the generator cannot estimate (e.g. caves-only
    /// variants).
    fn estimate_surface(&self, x: i32, z: i32) -> Option<i32>;

    /// Full block generation for a single position.
    fn generate_block(&self, pos: BlockPos) -> BlockKind;
}

/// Biome/region lookup companion to a generator.
pub trait RegionSource: Send + Sync {
    /// Region at a column.
    fn region_at(&self, x: i32, z: i32) -> RegionId;
}

/// Budget bounding synchronous generation waits on the authority thread.
///
/// Once either limit is reached, [`GenerationBudget::try_consume`] refuses
/// further work.
#[derive(Debug, Clone)]
pub struct GenerationBudget {
    max_millis: u64,
    max_chunks: u32,
    used_chunks: u32,
    started: Instant,
}

impl GenerationBudget {
    /// Creates a budget starting now.
    pub fn new(max_millis: u64, max_chunks: u32) -> Self {
        Self {
            max_millis,
            max_chunks,
            used_chunks: 0,
            started: Instant::now(),
        }
    }

    /// Claims one unit of generation work.
    pub fn try_consume(&mut self) -> bool {
        if self.is_exhausted() {
            return false;
        }
        self.used_chunks += 1;
        true
    }

    /// True once the count or time limit has been reached.
    pub fn is_exhausted(&self) -> bool {
        self.used_chunks >= self.max_chunks
            || self.started.elapsed() >= Duration::from_millis(self.max_millis)
    }

    /// Units consumed so far.
    pub fn used(&self) -> u32 {
        self.used_chunks
    }
}

/// Live block access to a loaded environment.
///
/// Columns are generated lazily; only [`Terrain::generate_column`] may
/// force generation, and only within the caller's budget.
pub trait Terrain: Send + Sync {
    /// Where this terrain lives.
    fn world_ref(&self) -> WorldRef;

    /// Sandbox key, if this terrain is an orchestrated environment.
    fn key(&self) -> Option<EnvironmentKey> {
        self.world_ref().sandbox()
    }

    /// Inclusive vertical bounds `(min_y, max_y)`.
    fn height_range(&self) -> (i32, i32);

    /// Approximate surface height without forcing generation.
    fn approximate_height(&self, x: i32, z: i32) -> Option<i32>;

    /// Whether the column containing `(x, z)` has been generated.
    fn is_generated(&self, x: i32, z: i32) -> bool;

    /// Generates the column if needed, spending from `budget`.
    ///
    /// Returns `true` when the column is generated afterwards.
    fn generate_column(&self, x: i32, z: i32, budget: &mut GenerationBudget) -> bool;

    /// Block at a position. Ungenerated columns read as `Air`.
    fn block(&self, pos: BlockPos) -> BlockKind;

    /// Overwrites a block. Writing into an ungenerated column marks it generated.
    fn set_block(&self, pos: BlockPos, kind: BlockKind);
}
