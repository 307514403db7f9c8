//! Shared fixtures for unit tests.

use crate::config::OrchestratorConfig;
use crate::context::OrchestratorContext;
use arena_env::{
    BlockKind, BlockPos, ContentGenerator, EnvError, FlatGenerator, GeneratedContent,
    GeneratorFactory, MemoryPersistence, MemoryRegistry, MemorySessions, MemoryTerrain, RegionId,
    Slot, TokioRuntime, UniformRegions, Variant, WorldRef,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

// ============================================================================
// TERRAIN
// ============================================================================

#[derive(Debug, Clone)]
struct FluidDisc {
    cx: i32,
    cz: i32,
    radius: i32,
    level: i32,
}

/// Heightmap generator tiled from a small grid.
///
/// Column `(x, z)` reads cell `((x + size/2) mod size, (z + size/2) mod size)`
/// so the grid is centred on the origin.
#[derive(Debug, Clone)]
pub struct GridGenerator {
    size: i32,
    heights: Vec<i32>,
    fluid: Vec<i32>,
    discs: Vec<FluidDisc>,
    estimates: bool,
    seed: u64,
}

impl GridGenerator {
    /// Flat solid ground up to `height`.
    pub fn flat(height: i32) -> Self {
        Self::from_grid(1, vec![height], vec![0])
    }

    /// Tiled grid of surface heights and fluid depths above them.
    pub fn from_grid(size: i32, heights: Vec<i32>, fluid: Vec<i32>) -> Self {
        assert_eq!(heights.len(), (size * size) as usize);
        assert_eq!(fluid.len(), heights.len());
        Self {
            size,
            heights,
            fluid,
            discs: Vec::new(),
            estimates: true,
            seed: 0,
        }
    }

    /// Floods a square disc around `(cx, cz)` up to `level`.
    pub fn with_fluid_disc(mut self, cx: i32, cz: i32, radius: i32, level: i32) -> Self {
        self.discs.push(FluidDisc { cx, cz, radius, level });
        self
    }

    /// Makes `estimate_surface` return nothing.
    pub fn without_estimates(mut self) -> Self {
        self.estimates = false;
        self
    }

    fn cell(&self, x: i32, z: i32) -> usize {
        let half = self.size / 2;
        let cx = (x + half).rem_euclid(self.size);
        let cz = (z + half).rem_euclid(self.size);
        (cz * self.size + cx) as usize
    }

    fn surface(&self, x: i32, z: i32) -> i32 {
        self.heights[self.cell(x, z)]
    }

    fn fluid_top(&self, x: i32, z: i32) -> i32 {
        let surface = self.surface(x, z);
        let mut top = surface + self.fluid[self.cell(x, z)];
        for disc in &self.discs {
            if (x - disc.cx).abs().max((z - disc.cz).abs()) <= disc.radius {
                top = top.max(disc.level);
            }
        }
        top
    }
}

impl ContentGenerator for GridGenerator {
    fn seed(&self) -> u64 {
        self.seed
    }

    fn variant(&self) -> Variant {
        Variant::Primary
    }

    fn height_range(&self) -> (i32, i32) {
        (0, 63)
    }

    fn estimate_surface(&self, x: i32, z: i32) -> Option<i32> {
        self.estimates.then(|| self.surface(x, z))
    }

    fn generate_block(&self, pos: BlockPos) -> BlockKind {
        if pos.y <= self.surface(pos.x, pos.z) {
            BlockKind::Solid
        } else if pos.y <= self.fluid_top(pos.x, pos.z) {
            BlockKind::Fluid
        } else {
            BlockKind::Air
        }
    }
}

/// Lazily generated terrain over a grid generator.
pub fn grid_terrain(generator: GridGenerator) -> MemoryTerrain {
    MemoryTerrain::new(WorldRef::Shared("grid".to_string()), Arc::new(generator))
}

// ============================================================================
// FACTORY
// ============================================================================

/// Flat-world factory with switchable failure modes.
pub struct TestFactory {
    surface: i32,
    fail: AtomicBool,
    mismatched_seed: AtomicBool,
    creations: AtomicUsize,
}

impl TestFactory {
    pub fn new(surface: i32) -> Self {
        Self {
            surface,
            fail: AtomicBool::new(false),
            mismatched_seed: AtomicBool::new(false),
            creations: AtomicUsize::new(0),
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Hands out generators bound to the wrong seed.
    pub fn set_mismatched_seed(&self, mismatched: bool) {
        self.mismatched_seed.store(mismatched, Ordering::SeqCst);
    }

    pub fn creations(&self) -> usize {
        self.creations.load(Ordering::SeqCst)
    }
}

impl GeneratorFactory for TestFactory {
    fn create(&self, seed: u64, variant: Variant) -> Result<GeneratedContent, EnvError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(EnvError::Generation("generator crashed".to_string()));
        }
        self.creations.fetch_add(1, Ordering::SeqCst);
        let bound = if self.mismatched_seed.load(Ordering::SeqCst) {
            seed.wrapping_add(1)
        } else {
            seed
        };
        Ok(GeneratedContent {
            generator: Arc::new(FlatGenerator::new(bound, variant, self.surface)),
            regions: Arc::new(UniformRegions(RegionId(1))),
        })
    }
}

// ============================================================================
// HARNESS
// ============================================================================

/// In-memory host wired for orchestrator tests.
pub struct Harness {
    pub runtime: Arc<TokioRuntime>,
    pub sessions: Arc<MemorySessions>,
    pub persistence: Arc<MemoryPersistence>,
    pub registry: Arc<MemoryRegistry>,
    pub factory: Arc<TestFactory>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            runtime: TokioRuntime::shared(),
            sessions: Arc::new(MemorySessions::new()),
            persistence: Arc::new(MemoryPersistence::new()),
            registry: Arc::new(MemoryRegistry::new()),
            factory: Arc::new(TestFactory::new(10)),
        }
    }

    pub fn context(&self) -> OrchestratorContext<TokioRuntime> {
        OrchestratorContext::new(
            self.runtime.clone(),
            self.sessions.clone(),
            self.persistence.clone(),
            self.factory.clone(),
            self.registry.clone(),
        )
    }
}

/// Small pool, no grace windows, tight searches.
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_max_slots(4)
        .with_unload_grace(std::time::Duration::ZERO)
        .with_spawn_search_radius(4)
}

/// Sandbox placement at the flat-world surface.
pub fn sandbox_placement(slot: u32, variant: Variant, seed: u64) -> arena_env::Placement {
    arena_env::Placement::new(
        WorldRef::Sandbox(arena_env::EnvironmentKey::new(Slot(slot), variant, seed)),
        BlockPos::new(0, 11, 0),
    )
}
