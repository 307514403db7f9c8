//! Environment instance lifecycle.
//!
//! Instances are created on demand, at most once per key even under
//! concurrent requests, and torn down on a deferred, cancellable schedule
//! once a newer seed supersedes them.
//!
//! ```text
//!               get_or_create(key)
//!   (absent) ───────────────────────► Creating ──ok──► Live
//!      ▲                                 │              │ superseded, idle, old enough
//!      │                     failure ────┘              ▼
//!      │                  (tenant sent to          PendingUnload ──re-request──► Live
//!      │                   fallback world)              │
//!      └──────────────────── teardown ◄─────────────────┘
//! ```
//!
//! Lock order is always slot table before instance map, never the reverse.

use crate::clock::VirtualClockService;
use crate::config::OrchestratorConfig;
use crate::context::OrchestratorContext;
use crate::error::OrchestratorError;
use crate::gateway::GatewayLinker;
use crate::lock;
use crate::seed_registry::SeedRegistry;
use crate::slots::{SlotAllocator, SlotAssignment};
use crate::spawn::{is_safe_placement, SpawnPoint, SpawnPointResolver, SpawnSettings};
use crate::unload::DeferredUnloadQueue;
use arena_env::{
    EnvironmentKey, GeneratedContent, GenerationBudget, HostRuntime, InstanceSnapshot, Placement,
    RegionId, Slot, Terrain, TenantId, Variant, WorldRef,
};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

// ============================================================================
// INSTANCES
// ============================================================================

/// A live sandbox world bound to one environment key.
pub struct EnvironmentInstance {
    key: EnvironmentKey,
    terrain: Arc<dyn Terrain>,
    content: GeneratedContent,
    spawn: SpawnPoint,
    created_at: Duration,
    pending_unload: AtomicBool,
}

impl EnvironmentInstance {
    pub fn key(&self) -> EnvironmentKey {
        self.key
    }

    pub fn terrain(&self) -> &Arc<dyn Terrain> {
        &self.terrain
    }

    /// Seed the instance's generator is bound to.
    pub fn seed(&self) -> u64 {
        self.content.generator.seed()
    }

    pub fn spawn(&self) -> SpawnPoint {
        self.spawn
    }

    /// Host time at construction.
    pub fn created_at(&self) -> Duration {
        self.created_at
    }

    pub fn world_ref(&self) -> WorldRef {
        WorldRef::Sandbox(self.key)
    }

    /// Arrival placement inside this instance.
    pub fn placement(&self) -> Placement {
        Placement::new(self.world_ref(), self.spawn.pos)
    }

    /// Region label at a column, from the instance's own region source.
    pub fn region_at(&self, x: i32, z: i32) -> RegionId {
        self.content.regions.region_at(x, z)
    }

    pub fn is_pending_unload(&self) -> bool {
        self.pending_unload.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for EnvironmentInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentInstance")
            .field("key", &self.key)
            .field("spawn", &self.spawn)
            .field("created_at", &self.created_at)
            .field("pending_unload", &self.is_pending_unload())
            .finish()
    }
}

/// Where a request sends the tenant.
#[derive(Debug, Clone)]
pub enum Destination {
    /// The requested sandbox
    Sandbox(Arc<EnvironmentInstance>),
    /// The host's fallback world, after a creation failure
    Fallback { placement: Placement, reason: String },
}

impl Destination {
    pub fn placement(&self) -> Placement {
        match self {
            Destination::Sandbox(instance) => instance.placement(),
            Destination::Fallback { placement, .. } => placement.clone(),
        }
    }

    pub fn instance(&self) -> Option<&Arc<EnvironmentInstance>> {
        match self {
            Destination::Sandbox(instance) => Some(instance),
            Destination::Fallback { .. } => None,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Destination::Fallback { .. })
    }
}

/// What a dispatched teardown did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOutcome {
    /// Instance destroyed
    Destroyed,
    /// Re-requested before the teardown ran
    Cancelled,
    /// Nothing left to tear down
    AlreadyGone,
}

// ============================================================================
// CREATION GATE
// ============================================================================

/// Blocks concurrent requesters until one construction finishes.
struct CreationGate {
    done: Mutex<bool>,
    opened: Condvar,
}

impl CreationGate {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            opened: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut done = lock(&self.done);
        while !*done {
            done = self.opened.wait(done).unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn open(&self) {
        *lock(&self.done) = true;
        self.opened.notify_all();
    }
}

enum InstanceState {
    Creating(Arc<CreationGate>),
    Live(Arc<EnvironmentInstance>),
}

type InstanceMap = Mutex<HashMap<EnvironmentKey, InstanceState>>;

/// Held by the one thread constructing a key. Dropping it without
/// completing clears the in-flight marker; either way waiters wake up.
struct CreationGuard<'a> {
    instances: &'a InstanceMap,
    key: EnvironmentKey,
    gate: Arc<CreationGate>,
    completed: bool,
}

impl CreationGuard<'_> {
    fn complete(mut self, instance: Arc<EnvironmentInstance>) {
        lock(self.instances).insert(self.key, InstanceState::Live(instance));
        self.completed = true;
    }
}

impl Drop for CreationGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            let mut instances = lock(self.instances);
            let ours = matches!(
                instances.get(&self.key),
                Some(InstanceState::Creating(g)) if Arc::ptr_eq(g, &self.gate)
            );
            if ours {
                instances.remove(&self.key);
            }
        }
        self.gate.open();
    }
}

enum Acquired<'a> {
    Existing(Arc<EnvironmentInstance>),
    Build(CreationGuard<'a>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PersistMode {
    /// Fire-and-forget save on a background task
    Background,
    /// Save before returning (shutdown)
    Blocking,
}

// ============================================================================
// MANAGER
// ============================================================================

/// Creates, caches, reuses and tears down environment instances.
pub struct EnvironmentLifecycleManager<R: HostRuntime> {
    ctx: OrchestratorContext<R>,
    config: OrchestratorConfig,
    slots: SlotAllocator,
    seeds: SeedRegistry,
    clock: VirtualClockService,
    spawns: SpawnPointResolver,
    gateways: GatewayLinker,
    unload: DeferredUnloadQueue,
    instances: InstanceMap,
}

impl<R: HostRuntime> EnvironmentLifecycleManager<R> {
    /// Wires the components from `config`. The unload queue's worker must
    /// already be running.
    pub fn new(
        ctx: OrchestratorContext<R>,
        config: OrchestratorConfig,
        unload: DeferredUnloadQueue,
    ) -> Self {
        let slots = SlotAllocator::new(config.max_slots, config.slot_grace());
        let clock =
            VirtualClockService::new(ctx.sessions.clone(), config.day_length, config.morning_tick);
        let spawns = SpawnPointResolver::new(SpawnSettings {
            anchor_x: config.spawn_anchor[0],
            anchor_z: config.spawn_anchor[1],
            search_radius: config.spawn_search_radius,
            budget_max_millis: config.budget_max_millis,
            budget_max_chunks: config.budget_max_chunks,
        });
        let gateways = GatewayLinker::new(
            config.gateway_search_radius,
            config.budget_max_millis,
            config.budget_max_chunks,
        );
        Self {
            ctx,
            config,
            slots,
            seeds: SeedRegistry::new(),
            clock,
            spawns,
            gateways,
            unload,
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &OrchestratorContext<R> {
        &self.ctx
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn slots(&self) -> &SlotAllocator {
        &self.slots
    }

    pub fn seeds(&self) -> &SeedRegistry {
        &self.seeds
    }

    pub fn clock(&self) -> &VirtualClockService {
        &self.clock
    }

    pub fn gateways(&self) -> &GatewayLinker {
        &self.gateways
    }

    pub fn unload_queue(&self) -> &DeferredUnloadQueue {
        &self.unload
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    /// Resolves the tenant's slot and returns their environment for
    /// `(seed, variant)`, creating it if needed.
    pub fn get_or_create(&self, tenant: TenantId, seed: u64, variant: Variant) -> Destination {
        let assignment = self.assign_slot(tenant);
        self.get_or_create_key(EnvironmentKey::new(assignment.slot, variant, seed))
    }

    /// Same as [`get_or_create`](Self::get_or_create) for an explicit shared
    /// slot, bypassing per-tenant assignment.
    pub fn get_or_create_group(&self, slot: Slot, seed: u64, variant: Variant) -> Destination {
        let key = EnvironmentKey::new(slot, variant, seed);
        if !self.slots.in_range(slot) {
            let reason = format!("slot outside 1..={}", self.slots.max_slots());
            let err = OrchestratorError::creation(key, reason);
            warn!(kind = err.kind(), "{}", err);
            return self.fallback(err);
        }
        self.get_or_create_key(key)
    }

    /// Returns the instance for `key`, constructing it exactly once.
    ///
    /// Concurrent callers for the same key block until the first caller's
    /// construction finishes and then share its result. A failed
    /// construction degrades to the fallback world.
    pub fn get_or_create_key(&self, key: EnvironmentKey) -> Destination {
        let instance = match self.acquire(key) {
            Acquired::Existing(instance) => {
                self.reuse(&instance);
                instance
            }
            Acquired::Build(guard) => match self.construct(key) {
                Ok(instance) => {
                    guard.complete(instance.clone());
                    info!(
                        "Created {} (spawn {:?}{})",
                        key,
                        instance.spawn.pos.as_slice(),
                        if instance.spawn.synthesized { ", platform" } else { "" }
                    );
                    instance
                }
                Err(err) => {
                    warn!(kind = err.kind(), "{}; using fallback world", err);
                    return self.fallback(err);
                }
            },
        };
        self.supersede_stale(key);
        Destination::Sandbox(instance)
    }

    /// Moves a tenant to a destination. On failure the tenant is sent to
    /// the fallback world instead. Returns true if the tenant ended up
    /// where requested.
    pub fn relocate_tenant(&self, tenant: TenantId, destination: &Destination) -> bool {
        let placement = destination.placement();
        match self.ctx.sessions.relocate(tenant, placement) {
            Ok(()) => {
                if let Destination::Sandbox(instance) = destination {
                    if let Some(tick) = self.clock.get(instance.key) {
                        self.ctx.sessions.send_time(tenant, tick);
                    }
                }
                true
            }
            Err(err) => {
                warn!("Relocating tenant {} failed: {}", tenant, err);
                if !destination.is_fallback() {
                    let fallback = self.ctx.fallback_placement();
                    if let Err(err) = self.ctx.sessions.relocate(tenant, fallback) {
                        warn!("Fallback relocation of tenant {} failed: {}", tenant, err);
                    }
                }
                false
            }
        }
    }

    /// Releases a tenant's slot into its reservation window.
    pub fn release_tenant_slot(&self, tenant: TenantId) -> Option<Slot> {
        let released = self.slots.release(tenant, self.ctx.runtime.now());
        if let Some(slot) = released {
            debug!("Tenant {} released {}", tenant, slot);
        }
        released
    }

    /// Slot to use for a group environment of `seed`.
    ///
    /// Prefers a tenant-free slot already hosting that seed, then the lowest
    /// slot with neither a tenant nor a live instance, then slot 1.
    pub fn find_first_free_slot_for_seed(&self, seed: u64) -> Slot {
        let now = self.ctx.runtime.now();
        let free = self.slots.free_slots(now);
        let live = self.live_keys();

        if let Some(slot) = live
            .iter()
            .filter(|k| k.seed == seed && free.contains(&k.slot))
            .map(|k| k.slot)
            .min()
        {
            return slot;
        }
        if let Some(slot) = free.iter().copied().find(|slot| live.iter().all(|k| k.slot != *slot)) {
            return slot;
        }
        let err = OrchestratorError::SlotPoolExhausted {
            max_slots: self.slots.max_slots(),
        };
        warn!(kind = err.kind(), "{}; group seed {} uses {}", err, seed, Slot::FALLBACK);
        Slot::FALLBACK
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Runs a dispatched teardown on the authority thread.
    pub fn teardown(&self, key: EnvironmentKey) -> TeardownOutcome {
        if !self.unload.claim(key) {
            debug!("Teardown of {} cancelled", key);
            return TeardownOutcome::Cancelled;
        }
        let Some(instance) = self.instance(key) else {
            let err = OrchestratorError::UnloadRace(key);
            warn!(kind = err.kind(), "{}", err);
            return TeardownOutcome::AlreadyGone;
        };
        self.evacuate(&instance);
        self.destroy(&instance, PersistMode::Background);
        info!("Unloaded superseded {}", key);
        TeardownOutcome::Destroyed
    }

    /// Destroys every live instance, saving synchronously. Returns the
    /// number destroyed.
    pub fn unload_all(&self) -> usize {
        self.unload.clear();
        let live: Vec<Arc<EnvironmentInstance>> = {
            let instances = lock(&self.instances);
            instances
                .values()
                .filter_map(|state| match state {
                    InstanceState::Live(instance) => Some(instance.clone()),
                    InstanceState::Creating(_) => None,
                })
                .collect()
        };
        for instance in &live {
            self.evacuate(instance);
            self.destroy(instance, PersistMode::Blocking);
        }
        info!("Unloaded {} environments", live.len());
        live.len()
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Live instance for a key.
    pub fn instance(&self, key: EnvironmentKey) -> Option<Arc<EnvironmentInstance>> {
        match lock(&self.instances).get(&key) {
            Some(InstanceState::Live(instance)) => Some(instance.clone()),
            _ => None,
        }
    }

    /// Keys of live instances, sorted.
    pub fn live_keys(&self) -> Vec<EnvironmentKey> {
        let mut keys: Vec<EnvironmentKey> = lock(&self.instances)
            .iter()
            .filter(|(_, state)| matches!(state, InstanceState::Live(_)))
            .map(|(key, _)| *key)
            .collect();
        keys.sort();
        keys
    }

    /// Constructions currently in flight.
    pub fn creating_count(&self) -> usize {
        lock(&self.instances)
            .values()
            .filter(|state| matches!(state, InstanceState::Creating(_)))
            .count()
    }

    /// Tenants currently inside an environment.
    pub fn occupants(&self, key: EnvironmentKey) -> Vec<TenantId> {
        self.ctx.sessions.occupants(&WorldRef::Sandbox(key))
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn assign_slot(&self, tenant: TenantId) -> SlotAssignment {
        let placement = self.ctx.sessions.placement(tenant);
        let now = self.ctx.runtime.now();
        // A slot is busy while a live instance in it has someone else inside
        self.slots.get_or_assign(tenant, placement.as_ref(), now, |slot| {
            self.slot_hosts_others(slot, tenant)
        })
    }

    fn slot_hosts_others(&self, slot: Slot, tenant: TenantId) -> bool {
        self.live_keys()
            .into_iter()
            .filter(|k| k.slot == slot)
            .any(|key| self.occupants(key).into_iter().any(|t| t != tenant))
    }

    fn acquire(&self, key: EnvironmentKey) -> Acquired<'_> {
        loop {
            let gate = {
                let mut instances = lock(&self.instances);
                match instances.entry(key) {
                    Entry::Occupied(entry) => match entry.get() {
                        InstanceState::Live(instance) => {
                            return Acquired::Existing(instance.clone());
                        }
                        InstanceState::Creating(gate) => gate.clone(),
                    },
                    Entry::Vacant(entry) => {
                        let gate = Arc::new(CreationGate::new());
                        entry.insert(InstanceState::Creating(gate.clone()));
                        return Acquired::Build(CreationGuard {
                            instances: &self.instances,
                            key,
                            gate,
                            completed: false,
                        });
                    }
                }
            };
            debug!("Waiting for in-flight construction of {}", key);
            gate.wait();
        }
    }

    fn reuse(&self, instance: &EnvironmentInstance) {
        if self.unload.cancel(instance.key) {
            info!("Cancelled pending unload of {}", instance.key);
        }
        instance.pending_unload.store(false, Ordering::SeqCst);
        if let Some(previous) = self.seeds.promote(instance.key) {
            let key = instance.key;
            debug!("{}/{} back to seed {} from {}", key.slot, key.variant, key.seed, previous);
        }
    }

    fn construct(
        &self,
        key: EnvironmentKey,
    ) -> Result<Arc<EnvironmentInstance>, OrchestratorError> {
        let result = self.construct_inner(key);
        if result.is_err() {
            self.seeds.forget(key);
        }
        result
    }

    fn construct_inner(
        &self,
        key: EnvironmentKey,
    ) -> Result<Arc<EnvironmentInstance>, OrchestratorError> {
        if let Some(previous) = self.seeds.bind(key) {
            info!("{}/{} moves from seed {} to {}", key.slot, key.variant, previous, key.seed);
        }
        let seed = self.seeds.take_pending(key).unwrap_or(key.seed);

        let content = self
            .ctx
            .generators
            .create(seed, key.variant)
            .map_err(|e| OrchestratorError::creation(key, e))?;
        let bound = content.generator.seed();
        if bound != key.seed {
            return Err(OrchestratorError::creation(
                key,
                format!("generator bound to seed {} instead of {}", bound, key.seed),
            ));
        }

        let terrain = self
            .ctx
            .registry
            .load(key, &content)
            .map_err(|e| OrchestratorError::creation(key, e))?;
        if let Some(encounters) = &self.ctx.encounters {
            encounters.rehome(key, &terrain);
        }

        let snapshot = match self.ctx.persistence.load(key) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!("Could not read snapshot of {}: {}", key, err);
                None
            }
        };
        let spawn = snapshot
            .as_ref()
            .and_then(|s| self.restore_spawn(terrain.as_ref(), s))
            .unwrap_or_else(|| self.spawns.resolve(terrain.as_ref()));
        let (tick, speed) = snapshot
            .as_ref()
            .map(|s| (s.tick, s.tick_speed))
            .unwrap_or((self.config.morning_tick, self.config.default_tick_speed));
        self.clock.insert(key, tick, speed);

        Ok(Arc::new(EnvironmentInstance {
            key,
            terrain,
            content,
            spawn,
            created_at: self.ctx.runtime.now(),
            pending_unload: AtomicBool::new(false),
        }))
    }

    /// Reuses a saved spawn if it is still safe in the regenerated terrain.
    fn restore_spawn(
        &self,
        terrain: &dyn Terrain,
        snapshot: &InstanceSnapshot,
    ) -> Option<SpawnPoint> {
        let pos = snapshot.spawn;
        let mut budget =
            GenerationBudget::new(self.config.budget_max_millis, self.config.budget_max_chunks);
        if !terrain.generate_column(pos.x, pos.z, &mut budget) {
            return None;
        }
        if is_safe_placement(terrain, pos) {
            debug!("Restored spawn of {} from snapshot", snapshot.key);
            Some(SpawnPoint {
                pos,
                synthesized: false,
            })
        } else {
            debug!("Saved spawn of {} no longer safe", snapshot.key);
            None
        }
    }

    /// Schedules idle, old-enough instances of other seeds in the same
    /// (slot, variant) for deferred unload.
    fn supersede_stale(&self, current: EnvironmentKey) {
        let stale: Vec<Arc<EnvironmentInstance>> = lock(&self.instances)
            .values()
            .filter_map(|state| match state {
                InstanceState::Live(instance)
                    if instance.key.slot == current.slot
                        && instance.key.variant == current.variant
                        && instance.key.seed != current.seed =>
                {
                    Some(instance.clone())
                }
                _ => None,
            })
            .collect();

        let now = self.ctx.runtime.now();
        let grace = self.config.unload_grace();
        for instance in stale {
            if instance.is_pending_unload() {
                continue;
            }
            if now.saturating_sub(instance.created_at) < grace {
                debug!("Superseded {} is too young to unload", instance.key);
                continue;
            }
            if !self.occupants(instance.key).is_empty() {
                debug!("Superseded {} is still occupied", instance.key);
                continue;
            }
            instance.pending_unload.store(true, Ordering::SeqCst);
            if self.unload.schedule(instance.key) {
                info!("Scheduled superseded {} for unload", instance.key);
            } else {
                instance.pending_unload.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Moves everyone out of an instance into the fallback world.
    fn evacuate(&self, instance: &EnvironmentInstance) {
        let fallback = self.ctx.fallback_placement();
        for tenant in self.occupants(instance.key) {
            if let Err(err) = self.ctx.sessions.relocate(tenant, fallback.clone()) {
                warn!("Evacuating tenant {} from {} failed: {}", tenant, instance.key, err);
            }
        }
    }

    fn destroy(&self, instance: &Arc<EnvironmentInstance>, persist: PersistMode) {
        let key = instance.key;
        {
            let mut instances = lock(&self.instances);
            let ours = matches!(
                instances.get(&key),
                Some(InstanceState::Live(live)) if Arc::ptr_eq(live, instance)
            );
            if ours {
                instances.remove(&key);
            }
        }

        let clock = self.clock.remove(key);
        let snapshot = InstanceSnapshot {
            key,
            spawn: instance.spawn.pos,
            tick: clock.map(|c| c.tick).unwrap_or(self.config.morning_tick),
            tick_speed: clock.map(|c| c.speed).unwrap_or(self.config.default_tick_speed),
            saved_at_ms: self.ctx.runtime.now().as_millis() as u64,
        };
        match persist {
            PersistMode::Background => {
                let persistence = self.ctx.persistence.clone();
                self.ctx.runtime.spawn("persist-snapshot", async move {
                    if let Err(err) = persistence.save(&snapshot) {
                        warn!("Saving {} failed: {}", snapshot.key, err);
                    }
                });
            }
            PersistMode::Blocking => {
                if let Err(err) = self.ctx.persistence.save(&snapshot) {
                    warn!("Saving {} failed: {}", key, err);
                }
            }
        }

        match self.ctx.registry.unload(key) {
            Ok(true) => {}
            Ok(false) => {
                let err = OrchestratorError::UnloadRace(key);
                warn!(kind = err.kind(), "{}", err);
            }
            Err(err) => warn!("Registry unload of {} failed: {}", key, err),
        }
        self.seeds.forget(key);
        if let Some(encounters) = &self.ctx.encounters {
            encounters.release(key);
        }
        instance.pending_unload.store(false, Ordering::SeqCst);
    }

    fn fallback(&self, err: OrchestratorError) -> Destination {
        Destination::Fallback {
            placement: self.ctx.fallback_placement(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sandbox_placement, test_config, Harness};
    use crate::unload::{AuthorityInbox, AuthorityTask};
    use arena_env::{
        BlockPos, PersistenceProvider, SessionDirectory, TokioRuntime, WorldRegistry,
    };

    fn manager(h: &Harness) -> (EnvironmentLifecycleManager<TokioRuntime>, AuthorityInbox) {
        manager_with(h, test_config())
    }

    fn manager_with(
        h: &Harness,
        config: OrchestratorConfig,
    ) -> (EnvironmentLifecycleManager<TokioRuntime>, AuthorityInbox) {
        let (queue, inbox) = DeferredUnloadQueue::start(&h.runtime, config.unload_settle());
        (EnvironmentLifecycleManager::new(h.context(), config, queue), inbox)
    }

    fn reseed(key: EnvironmentKey, seed: u64) -> EnvironmentKey {
        EnvironmentKey::new(key.slot, key.variant, seed)
    }

    async fn next_teardown(inbox: &AuthorityInbox) -> Option<EnvironmentKey> {
        for _ in 0..100 {
            if let Some(AuthorityTask::Teardown(key)) = inbox.drain().into_iter().next() {
                return Some(key);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        None
    }

    #[tokio::test]
    async fn test_create_then_reuse() {
        let h = Harness::new();
        let (lm, _inbox) = manager(&h);
        let tenant = TenantId::new();
        h.sessions.connect(tenant, None);

        let first = lm.get_or_create(tenant, 42, Variant::Primary);
        let instance = first.instance().unwrap().clone();
        assert_eq!(instance.key(), EnvironmentKey::new(Slot(1), Variant::Primary, 42));
        assert_eq!(instance.seed(), 42);
        assert_eq!(instance.spawn().pos, BlockPos::new(0, 11, 0));

        let second = lm.get_or_create(tenant, 42, Variant::Primary);
        assert!(Arc::ptr_eq(&instance, second.instance().unwrap()));
        assert_eq!(h.registry.load_count(), 1);
        assert_eq!(lm.clock().get(instance.key()), Some(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_requests_construct_once() {
        let h = Harness::new();
        let (lm, _inbox) = manager(&h);
        let key = EnvironmentKey::new(Slot(2), Variant::Secondary, 7);

        let results: Vec<Arc<EnvironmentInstance>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| lm.get_or_create_key(key)))
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap().instance().unwrap().clone())
                .collect()
        });

        assert_eq!(h.factory.creations(), 1);
        assert_eq!(h.registry.load_count(), 1);
        assert!(results.iter().all(|i| Arc::ptr_eq(i, &results[0])));
        assert_eq!(lm.creating_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_seeds_in_one_slot_build_their_own_seed() {
        let h = Harness::new();
        let (lm, _inbox) = manager(&h);
        let old = EnvironmentKey::new(Slot(1), Variant::Primary, 100);
        let new = reseed(old, 200);
        let barrier = std::sync::Barrier::new(4);

        for _ in 0..16 {
            let built: Vec<Destination> = std::thread::scope(|scope| {
                let handles: Vec<_> = [old, new, old, new]
                    .into_iter()
                    .map(|key| {
                        let barrier = &barrier;
                        let lm = &lm;
                        scope.spawn(move || {
                            barrier.wait();
                            lm.get_or_create_key(key)
                        })
                    })
                    .collect();
                handles.into_iter().map(|handle| handle.join().unwrap()).collect()
            });
            for (destination, key) in built.iter().zip([old, new, old, new]) {
                let instance = destination.instance().expect("both seeds build");
                assert_eq!(instance.key(), key);
                assert_eq!(instance.seed(), key.seed);
            }
            lm.unload_all();
        }
    }

    #[tokio::test]
    async fn test_visiting_group_sandbox_keeps_own_slot() {
        let h = Harness::new();
        let (lm, _inbox) = manager(&h);
        let tenant = TenantId::new();
        h.sessions.connect(tenant, None);

        let own = lm.get_or_create(tenant, 42, Variant::Primary);
        assert_eq!(own.instance().unwrap().key().slot, Slot(1));

        let group = lm.get_or_create_group(Slot(3), 7, Variant::Primary);
        assert!(lm.relocate_tenant(tenant, &group));

        let again = lm.get_or_create(tenant, 42, Variant::Primary);
        assert_eq!(again.instance().unwrap().key().slot, Slot(1));
        assert!(Arc::ptr_eq(own.instance().unwrap(), again.instance().unwrap()));
        assert_eq!(lm.slots().slot_of(tenant), Some(Slot(1)));
    }

    #[tokio::test]
    async fn test_creation_failure_degrades_to_fallback() {
        let h = Harness::new();
        let (lm, _inbox) = manager(&h);
        h.registry.set_available(false);

        let key = EnvironmentKey::new(Slot(1), Variant::Primary, 5);
        let destination = lm.get_or_create_key(key);
        assert!(destination.is_fallback());
        assert_eq!(destination.placement().world, WorldRef::Shared("lobby".to_string()));
        assert!(lm.live_keys().is_empty());
        assert_eq!(lm.seeds().current(Slot(1), Variant::Primary), None);

        // The failure leaves no marker behind
        h.registry.set_available(true);
        assert!(!lm.get_or_create_key(key).is_fallback());
    }

    #[tokio::test]
    async fn test_mismatched_generator_seed_is_rejected() {
        let h = Harness::new();
        let (lm, _inbox) = manager(&h);
        h.factory.set_mismatched_seed(true);

        let destination = lm.get_or_create_key(EnvironmentKey::new(Slot(1), Variant::Primary, 5));
        match destination {
            Destination::Fallback { reason, .. } => assert!(reason.contains("instead of 5")),
            Destination::Sandbox(_) => panic!("mismatched seed must not produce a sandbox"),
        }
        assert_eq!(h.registry.load_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_range_group_slot_falls_back() {
        let h = Harness::new();
        let (lm, _inbox) = manager(&h);
        assert!(lm.get_or_create_group(Slot(9), 1, Variant::Primary).is_fallback());
        assert!(lm.get_or_create_group(Slot(0), 1, Variant::Primary).is_fallback());
        assert!(!lm.get_or_create_group(Slot(4), 1, Variant::Primary).is_fallback());
    }

    #[tokio::test]
    async fn test_superseded_instance_is_torn_down() {
        let h = Harness::new();
        let (lm, inbox) = manager(&h);
        let old = EnvironmentKey::new(Slot(3), Variant::Primary, 100);
        let new = reseed(old, 200);

        lm.get_or_create_key(old);
        lm.get_or_create_key(new);
        assert!(lm.instance(old).unwrap().is_pending_unload());

        assert_eq!(next_teardown(&inbox).await, Some(old));
        assert_eq!(lm.teardown(old), TeardownOutcome::Destroyed);
        assert_eq!(lm.live_keys(), vec![new]);
        assert!(!h.registry.is_loaded(old));
        assert_eq!(lm.clock().get(old), None);
        assert_eq!(lm.seeds().current(Slot(3), Variant::Primary), Some(200));

        // Background save lands shortly after
        for _ in 0..100 {
            if h.persistence.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(h.persistence.load(old).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_re_request_cancels_pending_teardown() {
        let h = Harness::new();
        let (lm, inbox) = manager(&h);
        let old = EnvironmentKey::new(Slot(3), Variant::Primary, 100);
        let new = reseed(old, 200);

        let original = lm.get_or_create_key(old).instance().unwrap().clone();
        lm.get_or_create_key(new);
        let again = lm.get_or_create_key(old);

        assert!(Arc::ptr_eq(&original, again.instance().unwrap()));
        assert!(!original.is_pending_unload());
        assert_eq!(next_teardown(&inbox).await, Some(old));
        assert_eq!(lm.teardown(old), TeardownOutcome::Cancelled);
        assert!(lm.instance(old).is_some());
        assert_eq!(h.registry.load_count(), 2);
    }

    #[tokio::test]
    async fn test_occupied_or_young_instances_are_kept() {
        let h = Harness::new();
        let config = test_config().with_unload_grace(Duration::from_secs(3600));
        let (lm, _inbox) = manager_with(&h, config);
        let old = EnvironmentKey::new(Slot(1), Variant::Primary, 1);
        lm.get_or_create_key(old);
        lm.get_or_create_key(reseed(old, 2));
        assert!(!lm.instance(old).unwrap().is_pending_unload());

        let h = Harness::new();
        let (lm, _inbox) = manager(&h);
        let tenant = TenantId::new();
        h.sessions.connect(tenant, Some(sandbox_placement(1, Variant::Primary, 1)));
        lm.get_or_create_key(old);
        lm.get_or_create_key(reseed(old, 2));
        assert!(!lm.instance(old).unwrap().is_pending_unload());
    }

    #[tokio::test]
    async fn test_unload_race_still_completes_teardown() {
        let h = Harness::new();
        let (lm, _inbox) = manager(&h);
        let key = EnvironmentKey::new(Slot(2), Variant::Primary, 9);
        lm.get_or_create_key(key);

        // Host dropped the world behind our back
        assert!(h.registry.unload(key).unwrap());
        lm.unload_queue().schedule(key);
        assert_eq!(lm.teardown(key), TeardownOutcome::Destroyed);
        assert!(lm.instance(key).is_none());

        // Nothing left at all
        let gone = EnvironmentKey::new(Slot(2), Variant::Primary, 10);
        lm.unload_queue().schedule(gone);
        assert_eq!(lm.teardown(gone), TeardownOutcome::AlreadyGone);
    }

    #[tokio::test]
    async fn test_teardown_after_manual_unload_is_a_race() {
        let h = Harness::new();
        let (lm, inbox) = manager(&h);
        let old = EnvironmentKey::new(Slot(1), Variant::Primary, 1);
        lm.get_or_create_key(old);
        lm.get_or_create_key(reseed(old, 2));
        assert_eq!(lm.unload_all(), 2);

        // The queue was flushed, so the dispatched task finds nothing
        assert_eq!(next_teardown(&inbox).await, Some(old));
        assert_eq!(lm.teardown(old), TeardownOutcome::Cancelled);
        assert_eq!(h.persistence.len(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_restores_clock_and_spawn() {
        let h = Harness::new();
        let key = EnvironmentKey::new(Slot(2), Variant::Primary, 9);
        h.persistence
            .save(&InstanceSnapshot {
                key,
                spawn: BlockPos::new(3, 11, -2),
                tick: 1234,
                tick_speed: 5,
                saved_at_ms: 0,
            })
            .unwrap();

        let (lm, _inbox) = manager(&h);
        let instance = lm.get_or_create_key(key).instance().unwrap().clone();
        assert_eq!(instance.spawn().pos, BlockPos::new(3, 11, -2));
        assert_eq!(lm.clock().entry(key).unwrap().tick, 1234);
        assert_eq!(lm.clock().entry(key).unwrap().speed, 5);
    }

    #[tokio::test]
    async fn test_teardown_evacuates_occupants() {
        let h = Harness::new();
        let (lm, _inbox) = manager(&h);
        let key = EnvironmentKey::new(Slot(1), Variant::Primary, 1);
        let tenant = TenantId::new();
        h.sessions.connect(tenant, None);

        let destination = lm.get_or_create_key(key);
        assert!(lm.relocate_tenant(tenant, &destination));
        assert_eq!(lm.occupants(key), vec![tenant]);

        lm.unload_queue().schedule(key);
        assert_eq!(lm.teardown(key), TeardownOutcome::Destroyed);
        assert_eq!(
            h.sessions.placement(tenant).unwrap().world,
            WorldRef::Shared("lobby".to_string())
        );
    }

    #[tokio::test]
    async fn test_free_slot_for_seed_prefers_existing_group() {
        let h = Harness::new();
        let (lm, _inbox) = manager(&h);
        let tenant = TenantId::new();
        h.sessions.connect(tenant, None);

        // Tenant takes slot 1; group environment for seed 5 lives in slot 3
        lm.get_or_create(tenant, 1, Variant::Primary);
        lm.get_or_create_group(Slot(3), 5, Variant::Primary);

        assert_eq!(lm.find_first_free_slot_for_seed(5), Slot(3));
        assert_eq!(lm.find_first_free_slot_for_seed(6), Slot(2));
    }
}
