//! Safe placement search.
//!
//! Placement runs on the authority thread, so it must never force a full
//! generation of the environment:
//!
//! 1. **Heuristic**: ask the terrain for an approximate surface height at the
//!    anchor column. This never generates anything.
//! 2. **Ring search**: walk square rings outward from the anchor. Columns are
//!    generated only while the [`GenerationBudget`] allows; each candidate
//!    needs solid footing, no fluid at or below the feet, and a clear
//!    walkable volume with head room.
//! 3. **Platform**: if nothing qualifies within the radius, build a small
//!    solid platform with cleared space above it at the anchor.
//!
//! The resolver therefore always terminates, and its result is never inside
//! fluid or solid matter.

use arena_env::{BlockKind, BlockPos, GenerationBudget, Terrain};
use tracing::{debug, warn};

use crate::error::OrchestratorError;

/// Height of the clear volume above the footing (feet + head).
pub const CLEARANCE_HEIGHT: i32 = 2;

/// Vertical window scanned around a known approximate height.
const VERTICAL_WINDOW: i32 = 24;

/// Used when the terrain cannot estimate a height.
const DEFAULT_SPAWN_Y: i32 = 64;

/// Half-width of the synthesized platform.
const PLATFORM_HALF_WIDTH: i32 = 1;

/// Result of a placement search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnPoint {
    /// Feet position: footing is at `pos.y - 1`
    pub pos: BlockPos,
    /// True when a platform had to be built
    pub synthesized: bool,
}

/// Search parameters.
#[derive(Debug, Clone, Copy)]
pub struct SpawnSettings {
    pub anchor_x: i32,
    pub anchor_z: i32,
    pub search_radius: i32,
    pub budget_max_millis: u64,
    pub budget_max_chunks: u32,
}

impl Default for SpawnSettings {
    fn default() -> Self {
        Self {
            anchor_x: 0,
            anchor_z: 0,
            search_radius: 16,
            budget_max_millis: 50,
            budget_max_chunks: 16,
        }
    }
}

/// Finds or synthesizes safe placement coordinates.
#[derive(Debug, Clone)]
pub struct SpawnPointResolver {
    settings: SpawnSettings,
}

impl SpawnPointResolver {
    pub fn new(settings: SpawnSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SpawnSettings {
        &self.settings
    }

    /// Resolves a placement inside `terrain`. Always succeeds.
    pub fn resolve(&self, terrain: &dyn Terrain) -> SpawnPoint {
        let s = self.settings;
        let mut budget = GenerationBudget::new(s.budget_max_millis, s.budget_max_chunks);

        // Phase 1: non-forcing height estimate
        let hint = terrain.approximate_height(s.anchor_x, s.anchor_z);
        if hint.is_none() {
            debug!("No height estimate at anchor, falling back to ring search from default height");
        }

        // Phase 2: ring search
        if let Some(pos) = self.search_rings(terrain, hint, &mut budget) {
            return SpawnPoint {
                pos,
                synthesized: false,
            };
        }

        // Phase 3: synthetic platform
        let err = OrchestratorError::SpawnSearchExhausted {
            key: format!("{:?}", terrain.world_ref()),
            radius: s.search_radius,
        };
        warn!(kind = err.kind(), used_chunks = budget.used(), "{}", err);
        SpawnPoint {
            pos: self.build_platform(terrain, hint),
            synthesized: true,
        }
    }

    fn search_rings(
        &self,
        terrain: &dyn Terrain,
        hint: Option<i32>,
        budget: &mut GenerationBudget,
    ) -> Option<BlockPos> {
        let s = self.settings;
        for radius in 0..=s.search_radius {
            for (dx, dz) in ring_offsets(radius) {
                let (x, z) = (s.anchor_x + dx, s.anchor_z + dz);
                if !terrain.generate_column(x, z, budget) {
                    continue;
                }
                if let Some(y) = find_standing_height(terrain, x, z, hint) {
                    return Some(BlockPos::new(x, y, z));
                }
            }
        }
        None
    }

    fn build_platform(&self, terrain: &dyn Terrain, hint: Option<i32>) -> BlockPos {
        let (min_y, max_y) = terrain.height_range();
        let top = max_y - CLEARANCE_HEIGHT;
        let mut feet_y = hint.map(|h| h + 1).unwrap_or(DEFAULT_SPAWN_Y).clamp(min_y + 1, top);
        let (ax, az) = (self.settings.anchor_x, self.settings.anchor_z);

        // Float the platform on top of any fluid instead of sinking it
        while feet_y < top && footprint_has_fluid(terrain, BlockPos::new(ax, feet_y, az)) {
            feet_y += 1;
        }
        let center = BlockPos::new(ax, feet_y, az);

        for dx in -PLATFORM_HALF_WIDTH..=PLATFORM_HALF_WIDTH {
            for dz in -PLATFORM_HALF_WIDTH..=PLATFORM_HALF_WIDTH {
                terrain.set_block(center + BlockPos::new(dx, -1, dz), BlockKind::Solid);
                // One extra layer of head room above the clearance volume
                for dy in 0..=CLEARANCE_HEIGHT {
                    terrain.set_block(center + BlockPos::new(dx, dy, dz), BlockKind::Air);
                }
            }
        }
        debug!("Built spawn platform at {:?}", center.as_slice());
        center
    }
}

/// Offsets on the square ring at Chebyshev distance `radius`, in a fixed
/// order starting at the -x/-z corner.
pub fn ring_offsets(radius: i32) -> Vec<(i32, i32)> {
    if radius == 0 {
        return vec![(0, 0)];
    }
    let mut offsets = Vec::with_capacity((8 * radius) as usize);
    for dx in -radius..=radius {
        offsets.push((dx, -radius));
    }
    for dz in (-radius + 1)..=radius {
        offsets.push((radius, dz));
    }
    for dx in (-radius..radius).rev() {
        offsets.push((dx, radius));
    }
    for dz in ((-radius + 1)..radius).rev() {
        offsets.push((-radius, dz));
    }
    offsets
}

fn footprint_has_fluid(terrain: &dyn Terrain, feet: BlockPos) -> bool {
    (-1..=CLEARANCE_HEIGHT).any(|dy| {
        (-PLATFORM_HALF_WIDTH..=PLATFORM_HALF_WIDTH).any(|dx| {
            (-PLATFORM_HALF_WIDTH..=PLATFORM_HALF_WIDTH)
                .any(|dz| terrain.block(feet + BlockPos::new(dx, dy, dz)).is_fluid())
        })
    })
}

/// Highest safe feet height in a generated column, near `hint` if known.
fn find_standing_height(terrain: &dyn Terrain, x: i32, z: i32, hint: Option<i32>) -> Option<i32> {
    let (min_y, max_y) = terrain.height_range();
    let (low, high) = match hint {
        Some(h) => (h - VERTICAL_WINDOW, h + VERTICAL_WINDOW),
        None => (min_y + 1, max_y - CLEARANCE_HEIGHT + 1),
    };
    let low = low.max(min_y + 1);
    let high = high.min(max_y - CLEARANCE_HEIGHT + 1);
    (low..=high)
        .rev()
        .find(|y| is_safe_placement(terrain, BlockPos::new(x, *y, z)))
}

/// Whether a tenant can stand with feet at `feet`.
///
/// Requires solid footing below, a clear volume of [`CLEARANCE_HEIGHT`]
/// blocks, and no fluid in the 3x3 ring around the feet and head.
pub fn is_safe_placement(terrain: &dyn Terrain, feet: BlockPos) -> bool {
    if !terrain.block(feet - BlockPos::new(0, 1, 0)).is_solid() {
        return false;
    }
    for dy in 0..CLEARANCE_HEIGHT {
        let p = feet + BlockPos::new(0, dy, 0);
        if !terrain.block(p).is_clear() {
            return false;
        }
        for dx in -1..=1 {
            for dz in -1..=1 {
                if terrain.block(p + BlockPos::new(dx, 0, dz)).is_fluid() {
                    return false;
                }
            }
        }
    }
    true
}
