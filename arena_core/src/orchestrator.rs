//! The orchestrator facade.
//!
//! Owns the lifecycle manager and the authority inbox. Every public
//! operation absorbs degradations and logs them; only construction can
//! fail, when the host is unusable at startup.

use crate::config::OrchestratorConfig;
use crate::context::OrchestratorContext;
use crate::error::OrchestratorError;
use crate::lifecycle::{
    Destination, EnvironmentInstance, EnvironmentLifecycleManager, TeardownOutcome,
};
use crate::unload::{AuthorityInbox, AuthorityTask, DeferredUnloadQueue};
use arena_env::{
    BlockPos, EnvironmentKey, Heartbeat, HostRuntime, Placement, Slot, TenantId, Variant,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What one heartbeat did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HeartbeatReport {
    /// Clocks that moved toward a transition target
    pub transitioning: usize,
    /// Instances destroyed
    pub teardowns: usize,
    /// Teardowns cancelled by a re-request
    pub cancelled: usize,
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OrchestratorStats {
    pub live_instances: usize,
    pub creating: usize,
    pub pending_unloads: usize,
    pub bound_tenants: usize,
    pub clocks: usize,
}

/// Entry point of the orchestration subsystem.
pub struct Orchestrator<R: HostRuntime> {
    lifecycle: EnvironmentLifecycleManager<R>,
    inbox: AuthorityInbox,
}

impl<R: HostRuntime> Orchestrator<R> {
    /// Validates the configuration, probes persistence and starts the
    /// deferred unload worker.
    pub fn new(
        ctx: OrchestratorContext<R>,
        config: OrchestratorConfig,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;
        ctx.persistence.probe().map_err(|e| {
            OrchestratorError::Startup(format!("persistence backend unavailable: {}", e))
        })?;

        let (queue, inbox) = DeferredUnloadQueue::start(&ctx.runtime, config.unload_settle());
        info!(
            "Orchestrator started: {} slots, unload grace {}s",
            config.max_slots, config.unload_grace_secs
        );
        Ok(Self {
            lifecycle: EnvironmentLifecycleManager::new(ctx, config, queue),
            inbox,
        })
    }

    pub fn lifecycle(&self) -> &EnvironmentLifecycleManager<R> {
        &self.lifecycle
    }

    // ------------------------------------------------------------------------
    // Environments
    // ------------------------------------------------------------------------

    /// The tenant's own environment for `(seed, variant)`.
    pub fn get_or_create_environment(
        &self,
        tenant: TenantId,
        seed: u64,
        variant: Variant,
    ) -> Destination {
        self.lifecycle.get_or_create(tenant, seed, variant)
    }

    /// A shared environment in an explicit slot.
    pub fn get_or_create_group_environment(
        &self,
        slot: Slot,
        seed: u64,
        variant: Variant,
    ) -> Destination {
        self.lifecycle.get_or_create_group(slot, seed, variant)
    }

    /// Moves a tenant into a destination, falling back to the shared world
    /// on failure.
    pub fn relocate_tenant(&self, tenant: TenantId, destination: &Destination) -> bool {
        self.lifecycle.relocate_tenant(tenant, destination)
    }

    /// Releases a tenant's slot on disconnect; the instance stays.
    pub fn release_tenant_slot(&self, tenant: TenantId) -> Option<Slot> {
        self.lifecycle.release_tenant_slot(tenant)
    }

    pub fn find_first_free_slot_for_seed(&self, seed: u64) -> Slot {
        self.lifecycle.find_first_free_slot_for_seed(seed)
    }

    /// Shutdown flush: destroys everything now, bypassing the queue.
    pub fn unload_all_environments(&self) -> usize {
        self.lifecycle.unload_all()
    }

    /// Takes a tenant through a gateway from `from` to `to`.
    ///
    /// The tenant's slot and seed come from the sandbox they stand in, or
    /// from the slot's current seed for `from`. Returns the placement beside
    /// the linked gateway in the target variant.
    pub fn link_variant(
        &self,
        tenant: TenantId,
        from: Variant,
        to: Variant,
        origin: BlockPos,
    ) -> Placement {
        let ctx = self.lifecycle.context();
        let here = ctx.sessions.placement(tenant).and_then(|p| p.world.sandbox());
        let source = here.or_else(|| {
            let slot = self.lifecycle.slots().slot_of(tenant)?;
            let seed = self.lifecycle.seeds().current(slot, from)?;
            Some(EnvironmentKey::new(slot, from, seed))
        });
        let Some(source) = source else {
            warn!("Tenant {} has no sandbox to link from; using fallback world", tenant);
            return ctx.fallback_placement();
        };

        let target = source.with_variant(to);
        match self.lifecycle.get_or_create_key(target) {
            Destination::Sandbox(instance) => {
                let link = self
                    .lifecycle
                    .gateways()
                    .find_or_create(instance.terrain().as_ref(), origin, source.variant, to);
                debug!(
                    "Linked {} -> {} at {:?} ({})",
                    source,
                    target,
                    link.pos.as_slice(),
                    if link.created { "built" } else { "existing" }
                );
                Placement::new(instance.world_ref(), link.exit_point())
            }
            Destination::Fallback { placement, .. } => placement,
        }
    }

    pub fn instance(&self, key: EnvironmentKey) -> Option<Arc<EnvironmentInstance>> {
        self.lifecycle.instance(key)
    }

    pub fn live_keys(&self) -> Vec<EnvironmentKey> {
        self.lifecycle.live_keys()
    }

    // ------------------------------------------------------------------------
    // Clocks
    // ------------------------------------------------------------------------

    pub fn clock_get(&self, key: EnvironmentKey) -> Option<u64> {
        self.lifecycle.clock().get(key)
    }

    pub fn clock_set(&self, key: EnvironmentKey, tick: u64) -> bool {
        self.lifecycle.clock().set(key, tick)
    }

    pub fn clock_set_speed(&self, key: EnvironmentKey, ticks_per_heartbeat: u64) -> bool {
        self.lifecycle.clock().set_speed(key, ticks_per_heartbeat)
    }

    /// Moves the clock to the next morning over `duration_heartbeats`.
    pub fn skip_to_morning(&self, key: EnvironmentKey, duration_heartbeats: u64) -> Option<u64> {
        self.lifecycle.clock().begin_smooth_transition(key, duration_heartbeats)
    }

    // ------------------------------------------------------------------------
    // Authority loop
    // ------------------------------------------------------------------------

    /// One authority tick: advance clocks, then run dispatched teardowns.
    pub fn heartbeat(&self) -> HeartbeatReport {
        let mut report = HeartbeatReport {
            transitioning: self.lifecycle.clock().heartbeat().len(),
            ..HeartbeatReport::default()
        };
        for task in self.inbox.drain() {
            match task {
                AuthorityTask::Teardown(key) => match self.lifecycle.teardown(key) {
                    TeardownOutcome::Destroyed => report.teardowns += 1,
                    TeardownOutcome::Cancelled => report.cancelled += 1,
                    TeardownOutcome::AlreadyGone => {}
                },
            }
        }
        report
    }

    /// Drives [`heartbeat`](Self::heartbeat) until the source ends. Returns
    /// the number of beats processed.
    pub async fn run<H: Heartbeat + ?Sized>(&self, source: &H) -> u64 {
        let mut beats = 0;
        while let Some(beat) = source.next_beat().await {
            let report = self.heartbeat();
            if report.teardowns > 0 || report.cancelled > 0 {
                debug!("Beat {}: {:?}", beat, report);
            }
            beats += 1;
        }
        info!("Heartbeat source ended after {} beats", beats);
        beats
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            live_instances: self.lifecycle.live_keys().len(),
            creating: self.lifecycle.creating_count(),
            pending_unloads: self.lifecycle.unload_queue().pending_count(),
            bound_tenants: self.lifecycle.slots().bound_count(),
            clocks: self.lifecycle.clock().len(),
        }
    }
}
