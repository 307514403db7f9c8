//! SimWorld - The simulation harness container.
//!
//! Procedural terrain is value noise over a 16-block lattice: a ChaCha8
//! stream seeded from the world seed shuffles a permutation table and fills
//! a table of lattice heights; columns interpolate bilinearly between the
//! four surrounding lattice points. Everything below sea level that is not
//! ground is fluid, which gives the spawn search real lakes to avoid.

use crate::context::SimRuntime;
use arena_core::{Orchestrator, OrchestratorConfig, OrchestratorContext, OrchestratorError};
use arena_env::{
    BlockKind, BlockPos, ContentGenerator, EnvError, GeneratedContent, GeneratorFactory,
    MemoryPersistence, MemoryRegistry, MemorySessions, PersistenceProvider, RegionId, RegionSource,
    Variant,
};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Lattice spacing in blocks.
const LATTICE: i32 = 16;

/// Size of the permutation and value tables.
const TABLE_SIZE: usize = 256;

/// Shape parameters of one variant.
#[derive(Debug, Clone, Copy)]
struct Profile {
    base: i32,
    amplitude: i32,
    sea_level: i32,
    height_range: (i32, i32),
    /// Whether the noise can be queried without generating
    estimates: bool,
}

impl Profile {
    fn of(variant: Variant) -> Self {
        match variant {
            Variant::Primary => Self {
                base: 64,
                amplitude: 20,
                sea_level: 62,
                height_range: (0, 255),
                estimates: true,
            },
            // Low, flooded caverns without a usable height estimate
            Variant::Secondary => Self {
                base: 36,
                amplitude: 16,
                sea_level: 31,
                height_range: (0, 127),
                estimates: false,
            },
            // Gentle islands, no fluid
            Variant::Tertiary => Self {
                base: 48,
                amplitude: 6,
                sea_level: -1,
                height_range: (0, 255),
                estimates: true,
            },
        }
    }
}

/// Seed-bound value-noise terrain generator.
pub struct NoiseGenerator {
    seed: u64,
    variant: Variant,
    profile: Profile,
    perm: Vec<u8>,
    values: Vec<i32>,
}

impl NoiseGenerator {
    /// Builds the noise tables for `(seed, variant)`.
    pub fn new(seed: u64, variant: Variant) -> Self {
        let profile = Profile::of(variant);
        // Variants of one seed get unrelated terrain
        let stream = seed ^ (variant as u64 + 1).wrapping_mul(0x9e3779b97f4a7c15);
        let mut rng = ChaCha8Rng::seed_from_u64(stream);

        let mut perm: Vec<u8> = (0..TABLE_SIZE).map(|i| i as u8).collect();
        perm.shuffle(&mut rng);
        let values = (0..TABLE_SIZE)
            .map(|_| rng.gen_range(-profile.amplitude..=profile.amplitude))
            .collect();

        Self {
            seed,
            variant,
            profile,
            perm,
            values,
        }
    }

    fn lattice(&self, ix: i32, iz: i32) -> i32 {
        let a = self.perm[(ix & 0xff) as usize] as usize;
        let b = self.perm[(a + (iz & 0xff) as usize) % TABLE_SIZE] as usize;
        self.profile.base + self.values[b]
    }

    /// Interpolated ground height of a column.
    pub fn surface(&self, x: i32, z: i32) -> i32 {
        let (ix, iz) = (x.div_euclid(LATTICE), z.div_euclid(LATTICE));
        let tx = x.rem_euclid(LATTICE) as f64 / LATTICE as f64;
        let tz = z.rem_euclid(LATTICE) as f64 / LATTICE as f64;

        let h00 = self.lattice(ix, iz) as f64;
        let h10 = self.lattice(ix + 1, iz) as f64;
        let h01 = self.lattice(ix, iz + 1) as f64;
        let h11 = self.lattice(ix + 1, iz + 1) as f64;

        let top = h00 + (h10 - h00) * tx;
        let bottom = h01 + (h11 - h01) * tx;
        (top + (bottom - top) * tz).round() as i32
    }

    pub fn sea_level(&self) -> i32 {
        self.profile.sea_level
    }
}

impl ContentGenerator for NoiseGenerator {
    fn seed(&self) -> u64 {
        self.seed
    }

    fn variant(&self) -> Variant {
        self.variant
    }

    fn height_range(&self) -> (i32, i32) {
        self.profile.height_range
    }

    fn estimate_surface(&self, x: i32, z: i32) -> Option<i32> {
        self.profile.estimates.then(|| self.surface(x, z))
    }

    fn generate_block(&self, pos: BlockPos) -> BlockKind {
        let surface = self.surface(pos.x, pos.z);
        if pos.y <= surface {
            BlockKind::Solid
        } else if pos.y <= self.profile.sea_level {
            BlockKind::Fluid
        } else {
            BlockKind::Air
        }
    }
}

/// Regions laid out on a coarse grid, labelled from the seed.
pub struct NoiseRegions {
    seed: u64,
}

impl RegionSource for NoiseRegions {
    fn region_at(&self, x: i32, z: i32) -> RegionId {
        let cell = ((x.div_euclid(256) as i64) << 32) ^ (z.div_euclid(256) as i64 & 0xffff_ffff);
        let mixed = (cell as u64 ^ self.seed).wrapping_mul(0xbf58476d1ce4e5b9);
        RegionId((mixed >> 56) as u16 % 8)
    }
}

/// Factory handing out noise generators, with a switchable outage.
#[derive(Default)]
pub struct NoiseGeneratorFactory {
    offline: AtomicBool,
    created: AtomicUsize,
}

impl NoiseGeneratorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an unavailable generator backend.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Generators built so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl GeneratorFactory for NoiseGeneratorFactory {
    fn create(&self, seed: u64, variant: Variant) -> Result<GeneratedContent, EnvError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(EnvError::unavailable("generator backend offline"));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(GeneratedContent {
            generator: Arc::new(NoiseGenerator::new(seed, variant)),
            regions: Arc::new(NoiseRegions { seed }),
        })
    }
}

/// Handles to every simulated collaborator plus the orchestrator under test.
pub struct SimWorld {
    /// Shared simulation runtime (virtual clock)
    pub runtime: Arc<SimRuntime>,

    /// Simulated tenant connections
    pub sessions: Arc<MemorySessions>,

    /// Simulated world registry
    pub registry: Arc<MemoryRegistry>,

    /// Procedural content
    pub factory: Arc<NoiseGeneratorFactory>,

    /// The system under test
    pub orchestrator: Orchestrator<SimRuntime>,

    /// Heartbeats run so far
    beats: u64,
}

impl SimWorld {
    /// Builds a world on in-memory storage. Must run inside a Tokio runtime.
    pub fn new(seed: u64, config: OrchestratorConfig) -> Result<Self, OrchestratorError> {
        Self::with_persistence(seed, config, Arc::new(MemoryPersistence::new()))
    }

    /// Builds a world on the given storage backend.
    pub fn with_persistence(
        seed: u64,
        config: OrchestratorConfig,
        persistence: Arc<dyn PersistenceProvider>,
    ) -> Result<Self, OrchestratorError> {
        let runtime = SimRuntime::shared(seed);
        let sessions = Arc::new(MemorySessions::new());
        let registry = Arc::new(MemoryRegistry::new());
        let factory = Arc::new(NoiseGeneratorFactory::new());

        let ctx = OrchestratorContext::new(
            runtime.clone(),
            sessions.clone(),
            persistence,
            factory.clone(),
            registry.clone(),
        );
        let orchestrator = Orchestrator::new(ctx, config)?;

        Ok(Self {
            runtime,
            sessions,
            registry,
            factory,
            orchestrator,
            beats: 0,
        })
    }

    /// Lets background tasks run, then performs one heartbeat.
    pub async fn step(&mut self) -> arena_core::HeartbeatReport {
        tokio::task::yield_now().await;
        self.beats += 1;
        self.orchestrator.heartbeat()
    }

    pub fn beats(&self) -> u64 {
        self.beats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_generator_is_deterministic() {
        let a = NoiseGenerator::new(42, Variant::Primary);
        let b = NoiseGenerator::new(42, Variant::Primary);
        let c = NoiseGenerator::new(43, Variant::Primary);
        let columns: Vec<(i32, i32)> = (-40..40).step_by(7).map(|x| (x, x * 3)).collect();

        assert!(columns.iter().all(|(x, z)| a.surface(*x, *z) == b.surface(*x, *z)));
        assert!(columns.iter().any(|(x, z)| a.surface(*x, *z) != c.surface(*x, *z)));
    }

    #[test]
    fn test_blocks_follow_surface_and_sea() {
        let generator = NoiseGenerator::new(7, Variant::Primary);
        let surface = generator.surface(5, 5);
        assert_eq!(generator.generate_block(BlockPos::new(5, surface, 5)), BlockKind::Solid);
        let above = generator.generate_block(BlockPos::new(5, surface + 1, 5));
        if surface + 1 <= generator.sea_level() {
            assert_eq!(above, BlockKind::Fluid);
        } else {
            assert_eq!(above, BlockKind::Air);
        }
    }

    #[test]
    fn test_secondary_has_no_estimate() {
        let generator = NoiseGenerator::new(7, Variant::Secondary);
        assert_eq!(generator.estimate_surface(0, 0), None);
        assert!(NoiseGenerator::new(7, Variant::Tertiary).estimate_surface(0, 0).is_some());
    }

    #[test]
    fn test_factory_outage() {
        let factory = NoiseGeneratorFactory::new();
        assert!(factory.create(1, Variant::Primary).is_ok());
        factory.set_offline(true);
        assert!(factory.create(1, Variant::Primary).is_err());
        assert_eq!(factory.created(), 1);
    }

    proptest! {
        #[test]
        fn prop_surface_stays_in_profile(
            seed in any::<u64>(),
            x in -10_000i32..10_000,
            z in -10_000i32..10_000,
        ) {
            for variant in Variant::all() {
                let generator = NoiseGenerator::new(seed, variant);
                let profile = Profile::of(variant);
                let h = generator.surface(x, z);
                let low = profile.base - profile.amplitude;
                let high = profile.base + profile.amplitude;
                prop_assert!(h >= low && h <= high);
            }
        }
    }
}
