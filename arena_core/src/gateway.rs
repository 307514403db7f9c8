//! Linked gateways between the variants of one slot.
//!
//! A gateway is a 4x5 frame standing on a support pad, with a 2x3 gateway
//! surface inside:
//!
//! ```text
//!   F F F F      F = frame
//!   F G G F      G = gateway surface (aligned with the axis)
//!   F G G F      P = support pad
//!   F b G F      b = base coordinate returned to callers
//!   F F F F
//! P P P P P P
//! ```
//!
//! Lookups only read generated terrain. Building spends a generation budget
//! for the footprint and never fails: without clear space the area is
//! forcibly cleared and levelled.

use arena_env::{Axis, BlockKind, BlockPos, GenerationBudget, Terrain, Variant};
use nalgebra::Vector3;
use tracing::{debug, info, warn};

use crate::error::OrchestratorError;

const INNER_WIDTH: i32 = 2;
const INNER_HEIGHT: i32 = 3;

/// A located or freshly built gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayLink {
    /// Lowest surface block, first along the axis
    pub pos: BlockPos,
    pub axis: Axis,
    /// False when an existing structure was found
    pub created: bool,
}

impl GatewayLink {
    /// Standing position in front of the gateway.
    pub fn exit_point(&self) -> BlockPos {
        self.pos + self.axis.perpendicular().step()
    }
}

/// Finds or builds the gateway linking two variants.
#[derive(Debug, Clone)]
pub struct GatewayLinker {
    search_radius: i32,
    budget_max_millis: u64,
    budget_max_chunks: u32,
}

impl GatewayLinker {
    pub fn new(search_radius: i32, budget_max_millis: u64, budget_max_chunks: u32) -> Self {
        Self {
            search_radius,
            budget_max_millis,
            budget_max_chunks,
        }
    }

    /// Scales an origin coordinate into the target variant's space.
    ///
    /// Height is kept, clamped so a full frame fits in `height_range`.
    pub fn anchor_for(
        origin: BlockPos,
        from: Variant,
        to: Variant,
        height_range: (i32, i32),
    ) -> BlockPos {
        let ratio = to.coordinate_scale() / from.coordinate_scale();
        let scaled = origin
            .cast::<f64>()
            .component_mul(&Vector3::new(ratio, 1.0, ratio))
            .map(|v| v.floor() as i32);
        let (min_y, max_y) = height_range;
        BlockPos::new(scaled.x, origin.y.clamp(min_y + 2, max_y - INNER_HEIGHT - 1), scaled.z)
    }

    /// Returns the gateway near the scaled anchor, building one if none exists.
    ///
    /// Idempotent: a second call with the same arguments finds the structure
    /// built by the first.
    pub fn find_or_create(
        &self,
        terrain: &dyn Terrain,
        origin: BlockPos,
        from: Variant,
        to: Variant,
    ) -> GatewayLink {
        let anchor = Self::anchor_for(origin, from, to, terrain.height_range());

        // Builds stand on the surface, which may be far from the origin's height
        let surface = BlockPos::new(anchor.x, base_height(terrain, anchor), anchor.z);
        let found = self.find_existing(terrain, anchor).or_else(|| {
            (surface != anchor)
                .then(|| self.find_existing(terrain, surface))
                .flatten()
        });
        if let Some(link) = found {
            debug!("Found gateway at {:?} for anchor {:?}", link.pos.as_slice(), anchor.as_slice());
            return link;
        }

        let link = self.build(terrain, anchor);
        info!(
            "Built {:?}-axis gateway at {:?} ({} -> {})",
            link.axis,
            link.pos.as_slice(),
            from,
            to
        );
        link
    }

    /// Nearest existing gateway within the search radius of `anchor`.
    pub fn find_existing(&self, terrain: &dyn Terrain, anchor: BlockPos) -> Option<GatewayLink> {
        let r = self.search_radius;
        let (min_y, max_y) = terrain.height_range();
        let mut best: Option<(i64, GatewayLink)> = None;

        for dx in -r..=r {
            for dz in -r..=r {
                let (x, z) = (anchor.x + dx, anchor.z + dz);
                if !terrain.is_generated(x, z) {
                    continue;
                }
                for y in (anchor.y - r).max(min_y)..=(anchor.y + r).min(max_y) {
                    let pos = BlockPos::new(x, y, z);
                    let BlockKind::Gateway(axis) = terrain.block(pos) else {
                        continue;
                    };
                    let base = canonical_base(terrain, pos, axis);
                    let offset = (base - anchor).cast::<i64>();
                    let distance = offset.dot(&offset);
                    let better = match &best {
                        None => true,
                        Some((d, link)) => {
                            (distance, base.as_slice()) < (*d, link.pos.as_slice())
                        }
                    };
                    if better {
                        best = Some((
                            distance,
                            GatewayLink {
                                pos: base,
                                axis,
                                created: false,
                            },
                        ));
                    }
                }
            }
        }
        best.map(|(_, link)| link)
    }

    fn build(&self, terrain: &dyn Terrain, anchor: BlockPos) -> GatewayLink {
        let mut budget = GenerationBudget::new(self.budget_max_millis, self.budget_max_chunks);
        for (i, k) in [(-2, -1), (3, -1), (-2, 1), (3, 1)] {
            let corner = anchor + BlockPos::new(i, 0, k);
            terrain.generate_column(corner.x, corner.z, &mut budget);
        }

        let base = BlockPos::new(anchor.x, base_height(terrain, anchor), anchor.z);

        let clear_x = has_clear_space(terrain, base, Axis::X);
        let clear_z = has_clear_space(terrain, base, Axis::Z);
        let axis = match (clear_x, clear_z) {
            (true, _) => Axis::X,
            (false, true) => Axis::Z,
            (false, false) => {
                let err = OrchestratorError::GatewaySpaceExhausted(base);
                warn!(kind = err.kind(), "{}; clearing area", err);
                Axis::X
            }
        };

        build_structure(terrain, base, axis);
        GatewayLink {
            pos: base,
            axis,
            created: true,
        }
    }
}

/// Height a new gateway at `anchor` stands on: just above the surface,
/// or the anchor's own height when the surface is unknown.
fn base_height(terrain: &dyn Terrain, anchor: BlockPos) -> i32 {
    let (min_y, max_y) = terrain.height_range();
    terrain
        .approximate_height(anchor.x, anchor.z)
        .map(|h| h + 1)
        .unwrap_or(anchor.y)
        .clamp(min_y + 2, max_y - INNER_HEIGHT - 1)
}

/// Position relative to a gateway base: `i` along the axis, `j` up,
/// `k` across.
fn offset(base: BlockPos, axis: Axis, i: i32, j: i32, k: i32) -> BlockPos {
    base + axis.step() * i + BlockPos::new(0, j, 0) + axis.perpendicular().step() * k
}

/// Walks down and back along the axis to the base surface block.
fn canonical_base(terrain: &dyn Terrain, pos: BlockPos, axis: Axis) -> BlockPos {
    let surface = BlockKind::Gateway(axis);
    let mut base = pos;
    while terrain.block(base - BlockPos::new(0, 1, 0)) == surface {
        base.y -= 1;
    }
    while terrain.block(base - axis.step()) == surface {
        base -= axis.step();
    }
    base
}

/// Frame plus walkway volume is free of obstruction.
fn has_clear_space(terrain: &dyn Terrain, base: BlockPos, axis: Axis) -> bool {
    (-1..=INNER_WIDTH).all(|i| {
        (0..=INNER_HEIGHT).all(|j| {
            (-1..=1).all(|k| terrain.block(offset(base, axis, i, j, k)).is_clear())
        })
    })
}

fn build_structure(terrain: &dyn Terrain, base: BlockPos, axis: Axis) {
    // Walkways on both sides
    for i in -1..=INNER_WIDTH {
        for j in 0..=INNER_HEIGHT {
            for k in [-1, 1] {
                terrain.set_block(offset(base, axis, i, j, k), BlockKind::Air);
            }
        }
    }

    // Support pad: two layers so the frame never floats
    for i in -2..=INNER_WIDTH + 1 {
        for k in -1..=1 {
            terrain.set_block(offset(base, axis, i, -2, k), BlockKind::Solid);
            if k != 0 || !(-1..=INNER_WIDTH).contains(&i) {
                terrain.set_block(offset(base, axis, i, -1, k), BlockKind::Solid);
            }
        }
    }

    // Frame and surface
    for i in -1..=INNER_WIDTH {
        for j in -1..=INNER_HEIGHT {
            let border = i == -1 || i == INNER_WIDTH || j == -1 || j == INNER_HEIGHT;
            let kind = if border { BlockKind::Frame } else { BlockKind::Gateway(axis) };
            terrain.set_block(offset(base, axis, i, j, 0), kind);
        }
    }
}
