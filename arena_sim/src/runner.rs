//! Scenario runner - executes orchestration scenarios against a SimWorld.

use crate::scenarios::ScenarioId;
use crate::world::SimWorld;

use arena_core::spawn::is_safe_placement;
use arena_core::{Destination, OrchestratorConfig, OrchestratorError, SledPersistence};
use arena_env::{
    BlockPos, EnvironmentKey, MemoryPersistence, PersistenceProvider, Placement, SessionDirectory,
    Slot, TenantId, Terrain, Variant, WorldRef,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Heartbeats allowed for a deferred teardown to come through.
const SETTLE_BEATS: usize = 32;

/// Why a scenario run stopped.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("Check failed: {0}")]
    Check(String),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error("Runtime setup failed: {0}")]
    Runtime(#[from] std::io::Error),
}

fn check(condition: bool, message: impl FnOnce() -> String) -> Result<(), SimError> {
    if condition {
        Ok(())
    } else {
        Err(SimError::Check(message()))
    }
}

fn sandbox(destination: &Destination, what: &str) -> Result<EnvironmentKey, SimError> {
    destination
        .instance()
        .map(|i| i.key())
        .ok_or_else(|| SimError::Check(format!("{} landed in the fallback world", what)))
}

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all checks
    pub passed: bool,

    /// Heartbeats executed
    pub heartbeats: u64,

    /// Virtual time at the end, in seconds
    pub final_time_secs: f64,

    /// Instances flushed at shutdown
    pub flushed_instances: usize,

    /// Failure message if any
    pub failure_reason: Option<String>,
}

/// Runs orchestration scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Orchestrator configuration under test
    config: OrchestratorConfig,

    /// Directory for sled stores (None = in-memory)
    store: Option<PathBuf>,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            config: OrchestratorConfig::default(),
            store: None,
        }
    }

    /// Sets the orchestrator configuration.
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Persists snapshots in sled databases under `dir`.
    pub fn with_store(mut self, dir: PathBuf) -> Self {
        self.store = Some(dir);
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let mut result = ScenarioResult {
            scenario,
            seed: self.seed,
            passed: false,
            heartbeats: 0,
            final_time_secs: 0.0,
            flushed_instances: 0,
            failure_reason: None,
        };

        // Current-thread runtime: background tasks only run when a scenario yields
        let outcome = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(SimError::from)
            .and_then(|rt| rt.block_on(self.execute(scenario, &mut result)));

        match outcome {
            Ok(()) => result.passed = true,
            Err(err) => result.failure_reason = Some(err.to_string()),
        }
        result
    }

    async fn execute(
        &self,
        scenario: ScenarioId,
        result: &mut ScenarioResult,
    ) -> Result<(), SimError> {
        let persistence: Arc<dyn PersistenceProvider> = match &self.store {
            Some(dir) => {
                let path = dir.join(format!("{}-{}", scenario.name(), self.seed));
                Arc::new(SledPersistence::open(path).map_err(OrchestratorError::from)?)
            }
            None => Arc::new(MemoryPersistence::new()),
        };
        let mut world = SimWorld::with_persistence(self.seed, self.config.clone(), persistence)?;

        let outcome = match scenario {
            ScenarioId::RepeatJoin => self.run_repeat_join(&mut world).await,
            ScenarioId::GroupShare => self.run_group_share(&mut world).await,
            ScenarioId::Reconnect => self.run_reconnect(&mut world).await,
            ScenarioId::Supersede => self.run_supersede(&mut world).await,
            ScenarioId::ConcurrentCreate => self.run_concurrent_create(&mut world).await,
            ScenarioId::CancelTeardown => self.run_cancel_teardown(&mut world).await,
            ScenarioId::SafeSpawn => self.run_safe_spawn(&mut world).await,
            ScenarioId::GatewayLink => self.run_gateway_link(&mut world).await,
            ScenarioId::ClockSkip => self.run_clock_skip(&mut world).await,
            ScenarioId::Outage => self.run_outage(&mut world).await,
        };

        result.heartbeats = world.beats();
        result.final_time_secs = world.runtime.time_ns() as f64 / 1e9;
        result.flushed_instances = world.orchestrator.unload_all_environments();
        outcome
    }

    fn tenant(&self, index: u64) -> TenantId {
        TenantId::from_seed(self.seed.wrapping_mul(0x9e3779b97f4a7c15).wrapping_add(index))
    }

    /// SIM-001: RepeatJoin - same request twice, same instance and slot.
    async fn run_repeat_join(&self, world: &mut SimWorld) -> Result<(), SimError> {
        let a = self.tenant(0);
        world.sessions.connect(a, None);

        let first = world.orchestrator.get_or_create_environment(a, 42, Variant::Primary);
        world.orchestrator.relocate_tenant(a, &first);
        world.step().await;
        let second = world.orchestrator.get_or_create_environment(a, 42, Variant::Primary);

        let (k1, k2) = (sandbox(&first, "first join")?, sandbox(&second, "second join")?);
        check(k1 == k2, || format!("keys differ: {} vs {}", k1, k2))?;
        let same = matches!(
            (first.instance(), second.instance()),
            (Some(x), Some(y)) if Arc::ptr_eq(x, y)
        );
        check(same, || "second join returned a different instance".into())?;
        check(world.registry.load_count() == 1, || {
            format!("{} loads for one key", world.registry.load_count())
        })
    }

    /// SIM-002: GroupShare - two tenants, one group instance.
    async fn run_group_share(&self, world: &mut SimWorld) -> Result<(), SimError> {
        let (a, b) = (self.tenant(0), self.tenant(1));
        world.sessions.connect(a, None);
        world.sessions.connect(b, None);

        let slot = Slot(3.min(world.orchestrator.lifecycle().slots().max_slots()));
        let for_a = world.orchestrator.get_or_create_group_environment(slot, 42, Variant::Primary);
        let for_b = world.orchestrator.get_or_create_group_environment(slot, 42, Variant::Primary);
        world.orchestrator.relocate_tenant(a, &for_a);
        world.orchestrator.relocate_tenant(b, &for_b);
        world.step().await;

        let key = sandbox(&for_a, "tenant A")?;
        check(key == sandbox(&for_b, "tenant B")?, || "group members split".into())?;
        let occupants = world.orchestrator.lifecycle().occupants(key);
        check(occupants.len() == 2, || format!("{} occupants in {}", occupants.len(), key))
    }

    /// SIM-003: Reconnect - slot survives a short disconnect.
    async fn run_reconnect(&self, world: &mut SimWorld) -> Result<(), SimError> {
        let (a, b) = (self.tenant(0), self.tenant(1));
        world.sessions.connect(a, None);
        let joined = world.orchestrator.get_or_create_environment(a, 7, Variant::Primary);
        let before = sandbox(&joined, "A")?.slot;

        world.orchestrator.release_tenant_slot(a);
        world.sessions.disconnect(a);
        world.runtime.advance_time(self.config.slot_grace() / 2);
        world.step().await;

        world.sessions.connect(b, None);
        let elsewhere = world.orchestrator.get_or_create_environment(b, 8, Variant::Primary);
        let other = sandbox(&elsewhere, "B")?.slot;
        check(other != before, || format!("{} was handed out while reserved", before))?;

        world.sessions.connect(a, None);
        let rejoined = world.orchestrator.get_or_create_environment(a, 7, Variant::Primary);
        let after = sandbox(&rejoined, "A again")?.slot;
        check(after == before, || format!("reconnected into {} instead of {}", after, before))
    }

    /// SIM-004: Supersede - idle old seed is scheduled, then torn down.
    async fn run_supersede(&self, world: &mut SimWorld) -> Result<(), SimError> {
        let slot = Slot(3.min(world.orchestrator.lifecycle().slots().max_slots()));
        let old = sandbox(
            &world.orchestrator.get_or_create_group_environment(slot, 100, Variant::Primary),
            "seed 100",
        )?;
        world.runtime.advance_time(self.config.unload_grace() + Duration::from_secs(1));

        let new = sandbox(
            &world.orchestrator.get_or_create_group_environment(slot, 200, Variant::Primary),
            "seed 200",
        )?;
        check(world.orchestrator.instance(old).is_some(), || {
            "old instance destroyed eagerly".into()
        })?;
        check(world.orchestrator.stats().pending_unloads == 1, || {
            "old instance not scheduled".into()
        })?;

        let mut torn_down = 0;
        for _ in 0..SETTLE_BEATS {
            torn_down += world.step().await.teardowns;
            if torn_down > 0 {
                break;
            }
        }
        check(torn_down == 1, || format!("{} teardowns", torn_down))?;
        let live = world.orchestrator.live_keys();
        check(live == vec![new], || format!("live keys {:?}", live))
    }

    /// SIM-005: ConcurrentCreate - racing callers share one construction.
    async fn run_concurrent_create(&self, world: &mut SimWorld) -> Result<(), SimError> {
        let slot = Slot(3.min(world.orchestrator.lifecycle().slots().max_slots()));
        let orchestrator = &world.orchestrator;

        let destinations: Vec<Destination> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        orchestrator.get_or_create_group_environment(slot, 200, Variant::Primary)
                    })
                })
                .collect();
            handles.into_iter().filter_map(|h| h.join().ok()).collect()
        });
        check(destinations.len() == 4, || "a caller panicked".into())?;

        let first = destinations[0]
            .instance()
            .ok_or_else(|| SimError::Check("creation fell back".into()))?;
        let shared = destinations
            .iter()
            .all(|d| d.instance().is_some_and(|i| Arc::ptr_eq(i, first)));
        check(shared, || "callers observed different instances".into())?;
        check(world.registry.load_count() == 1, || {
            format!("{} constructions", world.registry.load_count())
        })
    }

    /// SIM-006: CancelTeardown - a re-request beats the worker.
    async fn run_cancel_teardown(&self, world: &mut SimWorld) -> Result<(), SimError> {
        let slot = Slot(2.min(world.orchestrator.lifecycle().slots().max_slots()));
        let original =
            world.orchestrator.get_or_create_group_environment(slot, 100, Variant::Primary);
        let old = sandbox(&original, "seed 100")?;
        world.runtime.advance_time(self.config.unload_grace() + Duration::from_secs(1));

        world.orchestrator.get_or_create_group_environment(slot, 200, Variant::Primary);
        check(world.orchestrator.stats().pending_unloads == 1, || "teardown not scheduled".into())?;
        let again = world.orchestrator.get_or_create_group_environment(slot, 100, Variant::Primary);

        let mut cancelled = 0;
        for _ in 0..SETTLE_BEATS {
            let report = world.step().await;
            check(report.teardowns == 0, || "re-requested instance was destroyed".into())?;
            cancelled += report.cancelled;
            if cancelled > 0 {
                break;
            }
        }
        check(cancelled == 1, || "teardown never dispatched".into())?;
        let same = matches!(
            (original.instance(), again.instance()),
            (Some(x), Some(y)) if Arc::ptr_eq(x, y)
        );
        check(same && world.orchestrator.instance(old).is_some(), || "instance replaced".into())
    }

    /// SIM-007: SafeSpawn - random seeds and variants.
    async fn run_safe_spawn(&self, world: &mut SimWorld) -> Result<(), SimError> {
        let max_slots = world.orchestrator.lifecycle().slots().max_slots();
        let variants = Variant::all();
        for round in 0..24u32 {
            let seed = world.runtime.next_u64();
            let variant = variants[world.runtime.next_below(variants.len() as u64) as usize];
            let slot = Slot(1 + round % max_slots);

            let destination =
                world.orchestrator.get_or_create_group_environment(slot, seed, variant);
            let instance = destination
                .instance()
                .ok_or_else(|| SimError::Check(format!("seed {} fell back", seed)))?;
            let spawn = instance.spawn();
            check(is_safe_placement(instance.terrain().as_ref(), spawn.pos), || {
                format!("unsafe spawn {:?} in {}", spawn.pos.as_slice(), instance.key())
            })?;
            debug!(
                "{}: spawn {:?}{}",
                instance.key(),
                spawn.pos.as_slice(),
                if spawn.synthesized { " (platform)" } else { "" }
            );
            world.step().await;
        }
        Ok(())
    }

    /// SIM-008: GatewayLink - primary to secondary, twice.
    async fn run_gateway_link(&self, world: &mut SimWorld) -> Result<(), SimError> {
        let a = self.tenant(0);
        world.sessions.connect(a, None);
        let seed = world.runtime.next_u64();
        let primary = world.orchestrator.get_or_create_environment(a, seed, Variant::Primary);
        world.orchestrator.relocate_tenant(a, &primary);
        let key = sandbox(&primary, "primary")?;
        let origin = primary.placement().pos + BlockPos::new(40, 0, -24);

        let (from, to) = (Variant::Primary, Variant::Secondary);
        let first = world.orchestrator.link_variant(a, from, to, origin);
        let second = world.orchestrator.link_variant(a, from, to, origin);
        check(first == second, || "second link built a new gateway".into())?;

        let target = key.with_variant(Variant::Secondary);
        check(first.world == WorldRef::Sandbox(target), || {
            format!("linked into {:?}", first.world)
        })?;
        let terrain = world
            .orchestrator
            .instance(target)
            .ok_or_else(|| SimError::Check("target variant not live".into()))?
            .terrain()
            .clone();
        let below = terrain.block(first.pos - BlockPos::new(0, 1, 0));
        check(terrain.block(first.pos).is_clear() && below.is_solid(), || {
            format!("exit {:?} is not standable", first.pos.as_slice())
        })?;

        world.sessions.relocate(a, first).map_err(OrchestratorError::from)?;
        world.step().await;
        Ok(())
    }

    /// SIM-009: ClockSkip - independent clocks, smooth skip.
    async fn run_clock_skip(&self, world: &mut SimWorld) -> Result<(), SimError> {
        let (a, b) = (self.tenant(0), self.tenant(1));
        world.sessions.connect(a, None);
        world.sessions.connect(b, None);
        let env_a = world.orchestrator.get_or_create_environment(a, 1, Variant::Primary);
        let env_b = world.orchestrator.get_or_create_environment(b, 2, Variant::Primary);
        world.orchestrator.relocate_tenant(a, &env_a);
        world.orchestrator.relocate_tenant(b, &env_b);
        let (ka, kb) = (sandbox(&env_a, "A")?, sandbox(&env_b, "B")?);

        world.orchestrator.clock_set_speed(kb, 10);
        for _ in 0..5 {
            world.step().await;
        }
        let (ta, tb) = (world.orchestrator.clock_get(ka), world.orchestrator.clock_get(kb));
        check(ta == Some(5) && tb == Some(50), || format!("ticks {:?} / {:?}", ta, tb))?;

        let target = world
            .orchestrator
            .skip_to_morning(ka, 4)
            .ok_or_else(|| SimError::Check("clock missing".into()))?;
        let mut last = 5;
        for _ in 0..4 {
            world.step().await;
            let tick = world.orchestrator.clock_get(ka).unwrap_or(0);
            check(tick >= last, || format!("clock went back from {} to {}", last, tick))?;
            last = tick;
        }
        check(last == target, || format!("stopped at {} instead of {}", last, target))?;

        let seen = world.sessions.received_times(a);
        check(seen.last() == Some(&target), || format!("tenant saw {:?}", seen.last()))?;
        let tb = world.orchestrator.clock_get(kb);
        check(tb == Some(90), || format!("other clock at {:?}", tb))
    }

    /// SIM-010: Outage - degrade to the fallback world, then recover.
    async fn run_outage(&self, world: &mut SimWorld) -> Result<(), SimError> {
        let a = self.tenant(0);
        world.sessions.connect(a, None);

        world.factory.set_offline(true);
        let degraded = world.orchestrator.get_or_create_environment(a, 5, Variant::Primary);
        check(degraded.is_fallback(), || "creation succeeded while offline".into())?;
        world.orchestrator.relocate_tenant(a, &degraded);
        let here: Option<Placement> = world.sessions.placement(a);
        check(
            here.is_some_and(|p| p.world.sandbox().is_none()),
            || "tenant not in the fallback world".into(),
        )?;
        world.step().await;

        world.factory.set_offline(false);
        let recovered = world.orchestrator.get_or_create_environment(a, 5, Variant::Primary);
        sandbox(&recovered, "after recovery")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_scenarios_pass() {
        let runner = ScenarioRunner::new(42);
        for scenario in ScenarioId::all() {
            let result = runner.run(scenario);
            assert!(result.passed, "{} failed: {:?}", scenario, result.failure_reason);
        }
    }

    #[test]
    fn test_runs_are_deterministic() {
        let a = ScenarioRunner::new(7).run(ScenarioId::SafeSpawn);
        let b = ScenarioRunner::new(7).run(ScenarioId::SafeSpawn);
        assert_eq!(a.heartbeats, b.heartbeats);
        assert_eq!(a.flushed_instances, b.flushed_instances);
        assert_eq!(a.final_time_secs, b.final_time_secs);
    }

    #[test]
    fn test_small_pool_still_passes_group_scenarios() {
        let config = OrchestratorConfig::default().with_max_slots(2);
        let runner = ScenarioRunner::new(3).with_config(config);
        assert!(runner.run(ScenarioId::GroupShare).passed);
        assert!(runner.run(ScenarioId::Supersede).passed);
    }
}
