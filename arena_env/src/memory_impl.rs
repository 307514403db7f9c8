//! In-memory host collaborators.
//!
//! These back the unit tests and the simulator: everything lives in
//! mutex-guarded maps, and outages can be injected with simple toggles.

use crate::error::EnvError;
use crate::host::{
    GeneratedContent, InstanceSnapshot, PersistenceProvider, SessionDirectory, WorldRegistry,
};
use crate::terrain::{
    BlockKind, ContentGenerator, GenerationBudget, RegionId, RegionSource, Terrain,
};
use crate::types::{BlockPos, EnvironmentKey, Placement, TenantId, Variant, WorldRef};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Columns are generated in 16x16 chunks.
const CHUNK_SHIFT: i32 = 4;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// GENERATORS
// ============================================================================

/// Flat terrain: solid up to `surface`, air above.
#[derive(Debug, Clone)]
pub struct FlatGenerator {
    seed: u64,
    variant: Variant,
    surface: i32,
}

impl FlatGenerator {
    /// Creates a flat generator.
    pub fn new(seed: u64, variant: Variant, surface: i32) -> Self {
        Self { seed, variant, surface }
    }
}

impl ContentGenerator for FlatGenerator {
    fn seed(&self) -> u64 {
        self.seed
    }

    fn variant(&self) -> Variant {
        self.variant
    }

    fn height_range(&self) -> (i32, i32) {
        (0, 255)
    }

    fn estimate_surface(&self, _x: i32, _z: i32) -> Option<i32> {
        Some(self.surface)
    }

    fn generate_block(&self, pos: BlockPos) -> BlockKind {
        if pos.y <= self.surface {
            BlockKind::Solid
        } else {
            BlockKind::Air
        }
    }
}

/// Region source that reports one region everywhere.
#[derive(Debug, Clone, Copy)]
pub struct UniformRegions(pub RegionId);

impl RegionSource for UniformRegions {
    fn region_at(&self, _x: i32, _z: i32) -> RegionId {
        self.0
    }
}

// ============================================================================
// TERRAIN
// ============================================================================

/// Lazily generated terrain over any [`ContentGenerator`].
pub struct MemoryTerrain {
    world: WorldRef,
    generator: Arc<dyn ContentGenerator>,
    generated: Mutex<HashSet<(i32, i32)>>,
    edits: Mutex<HashMap<BlockPos, BlockKind>>,
}

impl MemoryTerrain {
    /// Creates an ungenerated terrain.
    pub fn new(world: WorldRef, generator: Arc<dyn ContentGenerator>) -> Self {
        Self {
            world,
            generator,
            generated: Mutex::new(HashSet::new()),
            edits: Mutex::new(HashMap::new()),
        }
    }

    /// Generator driving this terrain.
    pub fn generator(&self) -> &Arc<dyn ContentGenerator> {
        &self.generator
    }

    /// Number of generated chunks.
    pub fn generated_chunks(&self) -> usize {
        lock(&self.generated).len()
    }

    fn chunk_of(x: i32, z: i32) -> (i32, i32) {
        (x >> CHUNK_SHIFT, z >> CHUNK_SHIFT)
    }
}

impl Terrain for MemoryTerrain {
    fn world_ref(&self) -> WorldRef {
        self.world.clone()
    }

    fn height_range(&self) -> (i32, i32) {
        self.generator.height_range()
    }

    fn approximate_height(&self, x: i32, z: i32) -> Option<i32> {
        self.generator.estimate_surface(x, z)
    }

    fn is_generated(&self, x: i32, z: i32) -> bool {
        lock(&self.generated).contains(&Self::chunk_of(x, z))
    }

    fn generate_column(&self, x: i32, z: i32, budget: &mut GenerationBudget) -> bool {
        let chunk = Self::chunk_of(x, z);
        let mut generated = lock(&self.generated);
        if generated.contains(&chunk) {
            return true;
        }
        if !budget.try_consume() {
            return false;
        }
        generated.insert(chunk);
        true
    }

    fn block(&self, pos: BlockPos) -> BlockKind {
        if let Some(kind) = lock(&self.edits).get(&pos) {
            return *kind;
        }
        if !self.is_generated(pos.x, pos.z) {
            return BlockKind::Air;
        }
        let (min_y, max_y) = self.generator.height_range();
        if pos.y < min_y || pos.y > max_y {
            return BlockKind::Air;
        }
        self.generator.generate_block(pos)
    }

    fn set_block(&self, pos: BlockPos, kind: BlockKind) {
        lock(&self.generated).insert(Self::chunk_of(pos.x, pos.z));
        lock(&self.edits).insert(pos, kind);
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// In-memory world registry with a flat shared fallback world.
pub struct MemoryRegistry {
    loaded: Mutex<HashMap<EnvironmentKey, Arc<MemoryTerrain>>>,
    fallback: Arc<MemoryTerrain>,
    fallback_spawn: BlockPos,
    available: AtomicBool,
    loads: AtomicUsize,
}

impl MemoryRegistry {
    /// Creates a registry whose fallback world is named `lobby`.
    pub fn new() -> Self {
        let surface = 64;
        let fallback = Arc::new(MemoryTerrain::new(
            WorldRef::Shared("lobby".to_string()),
            Arc::new(FlatGenerator::new(0, Variant::Primary, surface)),
        ));
        Self {
            loaded: Mutex::new(HashMap::new()),
            fallback,
            fallback_spawn: BlockPos::new(0, surface + 1, 0),
            available: AtomicBool::new(true),
            loads: AtomicUsize::new(0),
        }
    }

    /// Simulates a registry outage.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Total successful loads since creation.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Whether a key is currently registered.
    pub fn is_loaded(&self, key: EnvironmentKey) -> bool {
        lock(&self.loaded).contains_key(&key)
    }

    /// Registered keys, sorted.
    pub fn loaded_keys(&self) -> Vec<EnvironmentKey> {
        let mut keys: Vec<_> = lock(&self.loaded).keys().copied().collect();
        keys.sort();
        keys
    }

    /// Concrete terrain for a registered key.
    pub fn terrain(&self, key: EnvironmentKey) -> Option<Arc<MemoryTerrain>> {
        lock(&self.loaded).get(&key).cloned()
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorldRegistry for MemoryRegistry {
    fn load(
        &self,
        key: EnvironmentKey,
        content: &GeneratedContent,
    ) -> Result<Arc<dyn Terrain>, EnvError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(EnvError::unavailable("world registry offline"));
        }
        let terrain = Arc::new(MemoryTerrain::new(
            WorldRef::Sandbox(key),
            content.generator.clone(),
        ));
        lock(&self.loaded).insert(key, terrain.clone());
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(terrain)
    }

    fn unload(&self, key: EnvironmentKey) -> Result<bool, EnvError> {
        Ok(lock(&self.loaded).remove(&key).is_some())
    }

    fn fallback(&self) -> Arc<dyn Terrain> {
        self.fallback.clone()
    }

    fn fallback_spawn(&self) -> BlockPos {
        self.fallback_spawn
    }
}

// ============================================================================
// SESSIONS
// ============================================================================

/// In-memory session directory.
#[derive(Default)]
pub struct MemorySessions {
    online: Mutex<HashMap<TenantId, Option<Placement>>>,
    times: Mutex<Vec<(TenantId, u64)>>,
}

impl MemorySessions {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a tenant online, optionally already placed somewhere.
    pub fn connect(&self, tenant: TenantId, placement: Option<Placement>) {
        lock(&self.online).insert(tenant, placement);
    }

    /// Marks a tenant offline.
    pub fn disconnect(&self, tenant: TenantId) {
        lock(&self.online).remove(&tenant);
    }

    /// Time values pushed to a tenant, oldest first.
    pub fn received_times(&self, tenant: TenantId) -> Vec<u64> {
        lock(&self.times)
            .iter()
            .filter(|(t, _)| *t == tenant)
            .map(|(_, tick)| *tick)
            .collect()
    }
}

impl SessionDirectory for MemorySessions {
    fn placement(&self, tenant: TenantId) -> Option<Placement> {
        lock(&self.online).get(&tenant).cloned().flatten()
    }

    fn is_online(&self, tenant: TenantId) -> bool {
        lock(&self.online).contains_key(&tenant)
    }

    fn occupants(&self, world: &WorldRef) -> Vec<TenantId> {
        let mut tenants: Vec<_> = lock(&self.online)
            .iter()
            .filter(|(_, p)| p.as_ref().map(|p| &p.world == world).unwrap_or(false))
            .map(|(t, _)| *t)
            .collect();
        tenants.sort();
        tenants
    }

    fn relocate(&self, tenant: TenantId, placement: Placement) -> Result<(), EnvError> {
        let mut online = lock(&self.online);
        match online.get_mut(&tenant) {
            Some(slot) => {
                *slot = Some(placement);
                Ok(())
            }
            None => Err(EnvError::session(format!("tenant {} is offline", tenant))),
        }
    }

    fn send_time(&self, tenant: TenantId, tick: u64) {
        lock(&self.times).push((tenant, tick));
    }
}

// ============================================================================
// PERSISTENCE
// ============================================================================

/// Snapshot store held in memory.
pub struct MemoryPersistence {
    root: PathBuf,
    snapshots: Mutex<HashMap<EnvironmentKey, InstanceSnapshot>>,
    healthy: AtomicBool,
}

impl MemoryPersistence {
    /// Creates an empty store rooted at a virtual path.
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("memory"),
            snapshots: Mutex::new(HashMap::new()),
            healthy: AtomicBool::new(true),
        }
    }

    /// Simulates a backend outage.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Number of stored snapshots.
    pub fn len(&self) -> usize {
        lock(&self.snapshots).len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), EnvError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EnvError::persistence("memory backend offline"))
        }
    }
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistenceProvider for MemoryPersistence {
    fn probe(&self) -> Result<(), EnvError> {
        self.check()
    }

    fn path_for(&self, key: EnvironmentKey) -> PathBuf {
        self.root.join(key.storage_name())
    }

    fn save(&self, snapshot: &InstanceSnapshot) -> Result<(), EnvError> {
        self.check()?;
        lock(&self.snapshots).insert(snapshot.key, snapshot.clone());
        Ok(())
    }

    fn load(&self, key: EnvironmentKey) -> Result<Option<InstanceSnapshot>, EnvError> {
        self.check()?;
        Ok(lock(&self.snapshots).get(&key).cloned())
    }

    fn delete(&self, key: EnvironmentKey) -> Result<(), EnvError> {
        self.check()?;
        lock(&self.snapshots).remove(&key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Slot;

    fn flat_content(seed: u64) -> GeneratedContent {
        GeneratedContent {
            generator: Arc::new(FlatGenerator::new(seed, Variant::Primary, 10)),
            regions: Arc::new(UniformRegions(RegionId(0))),
        }
    }

    #[test]
    fn test_terrain_generation_respects_budget() {
        let terrain = MemoryTerrain::new(
            WorldRef::Shared("t".into()),
            Arc::new(FlatGenerator::new(1, Variant::Primary, 10)),
        );
        assert_eq!(terrain.block(BlockPos::new(0, 5, 0)), BlockKind::Air);

        let mut budget = GenerationBudget::new(10_000, 1);
        assert!(terrain.generate_column(0, 0, &mut budget));
        // Same chunk is free
        assert!(terrain.generate_column(15, 15, &mut budget));
        assert!(!terrain.generate_column(16, 0, &mut budget));
        assert_eq!(terrain.block(BlockPos::new(0, 5, 0)), BlockKind::Solid);
        assert_eq!(terrain.block(BlockPos::new(0, 11, 0)), BlockKind::Air);
    }

    #[test]
    fn test_terrain_edits_override_generation() {
        let terrain = MemoryTerrain::new(
            WorldRef::Shared("t".into()),
            Arc::new(FlatGenerator::new(1, Variant::Primary, 10)),
        );
        terrain.set_block(BlockPos::new(40, 3, 40), BlockKind::Fluid);
        assert!(terrain.is_generated(40, 40));
        assert_eq!(terrain.block(BlockPos::new(40, 3, 40)), BlockKind::Fluid);
    }

    #[test]
    fn test_registry_outage() {
        let registry = MemoryRegistry::new();
        let key = EnvironmentKey::new(Slot(1), Variant::Primary, 5);
        registry.set_available(false);
        assert!(registry.load(key, &flat_content(5)).is_err());
        registry.set_available(true);
        assert!(registry.load(key, &flat_content(5)).is_ok());
        assert!(registry.is_loaded(key));
        assert_eq!(registry.unload(key).ok(), Some(true));
        assert_eq!(registry.unload(key).ok(), Some(false));
    }

    #[test]
    fn test_sessions_occupants_and_relocate() {
        let sessions = MemorySessions::new();
        let a = TenantId::from_seed(1);
        let key = EnvironmentKey::new(Slot(2), Variant::Primary, 5);
        let world = WorldRef::Sandbox(key);

        sessions.connect(a, None);
        assert!(sessions.occupants(&world).is_empty());

        sessions
            .relocate(a, Placement::new(world.clone(), BlockPos::new(0, 70, 0)))
            .unwrap();
        assert_eq!(sessions.occupants(&world), vec![a]);

        sessions.disconnect(a);
        assert!(sessions.relocate(a, Placement::new(world, BlockPos::zeros())).is_err());
    }

    #[test]
    fn test_persistence_roundtrip_and_outage() {
        let store = MemoryPersistence::new();
        let key = EnvironmentKey::new(Slot(4), Variant::Secondary, 11);
        let snapshot = InstanceSnapshot {
            key,
            spawn: BlockPos::new(1, 2, 3),
            tick: 500,
            tick_speed: 1,
            saved_at_ms: 0,
        };
        store.save(&snapshot).unwrap();
        assert_eq!(store.load(key).unwrap(), Some(snapshot));
        assert!(store.path_for(key).ends_with("slot_4/secondary/seed_11"));

        store.set_healthy(false);
        assert!(store.probe().is_err());
    }
}
