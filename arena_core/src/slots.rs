//! Slot assignment.
//!
//! One table is the single source of truth for "which slot does this tenant
//! have". The slot -> tenant ownership view is derived from it inside the
//! same critical section, so the two can never disagree. The only outside
//! signal is the tenant's live placement, which is reconciled against the
//! table (and logged) rather than trusted blindly.

use crate::error::OrchestratorError;
use crate::lock;
use arena_env::{Placement, Slot, TenantId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Where a slot resolution came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotSource {
    /// Existing binding (active or reserved within the grace window)
    Bound,
    /// Inferred from the tenant's current sandbox placement
    Placement,
    /// Lowest free slot
    Allocated,
    /// Pool exhausted; slot 1 handed out regardless
    Fallback,
}

/// Result of [`SlotAllocator::get_or_assign`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAssignment {
    pub slot: Slot,
    pub source: SlotSource,
}

#[derive(Debug, Clone, Copy)]
struct SlotBinding {
    slot: Slot,
    /// Set while the tenant is disconnected
    released_at: Option<Duration>,
}

#[derive(Debug, Default)]
struct SlotTable {
    bindings: HashMap<TenantId, SlotBinding>,
    /// Derived view: slot -> tenant holding it
    owners: BTreeMap<Slot, TenantId>,
}

impl SlotTable {
    fn bind(&mut self, tenant: TenantId, slot: Slot) {
        let binding = SlotBinding {
            slot,
            released_at: None,
        };
        if let Some(previous) = self.bindings.insert(tenant, binding) {
            if previous.slot != slot && self.owners.get(&previous.slot) == Some(&tenant) {
                self.owners.remove(&previous.slot);
            }
        }
        self.owners.insert(slot, tenant);
    }

    fn unbind(&mut self, tenant: TenantId) {
        if let Some(binding) = self.bindings.remove(&tenant) {
            if self.owners.get(&binding.slot) == Some(&tenant) {
                self.owners.remove(&binding.slot);
            }
        }
    }

    /// Drops reservations whose grace window has elapsed.
    fn expire(&mut self, now: Duration, grace: Duration) {
        let expired: Vec<TenantId> = self
            .bindings
            .iter()
            .filter(|(_, b)| b.released_at.is_some_and(|at| now.saturating_sub(at) > grace))
            .map(|(t, _)| *t)
            .collect();
        for tenant in expired {
            debug!("Slot reservation for tenant {} expired", tenant);
            self.unbind(tenant);
        }
    }

    fn held_by_other(&self, slot: Slot, tenant: TenantId) -> bool {
        self.owners.get(&slot).is_some_and(|owner| *owner != tenant)
    }
}

/// Assigns and reuses slots per tenant.
pub struct SlotAllocator {
    table: Mutex<SlotTable>,
    max_slots: u32,
    grace: Duration,
}

impl SlotAllocator {
    /// Creates an allocator over slots `1..=max_slots`.
    pub fn new(max_slots: u32, grace: Duration) -> Self {
        Self {
            table: Mutex::new(SlotTable::default()),
            max_slots: max_slots.max(1),
            grace,
        }
    }

    pub fn max_slots(&self) -> u32 {
        self.max_slots
    }

    /// Whether `slot` lies inside the pool.
    pub fn in_range(&self, slot: Slot) -> bool {
        (1..=self.max_slots).contains(&slot.0)
    }

    /// Resolves the tenant's slot, assigning one if needed.
    ///
    /// Checked in order: existing binding, current sandbox placement, lowest
    /// free slot (skipping slots for which `busy` is true), and finally slot 1.
    /// The whole resolution happens under one lock.
    pub fn get_or_assign(
        &self,
        tenant: TenantId,
        placement: Option<&Placement>,
        now: Duration,
        busy: impl Fn(Slot) -> bool,
    ) -> SlotAssignment {
        let mut table = lock(&self.table);
        table.expire(now, self.grace);

        let observed = placement
            .and_then(|p| p.world.sandbox())
            .map(|key| key.slot)
            .filter(|slot| self.in_range(*slot));

        if let Some(binding) = table.bindings.get(&tenant).copied() {
            if let Some(observed) = observed.filter(|o| *o != binding.slot) {
                let err = OrchestratorError::SlotConflict {
                    tenant,
                    bound: binding.slot,
                    observed,
                };
                warn!(kind = err.kind(), "{}; keeping bound slot", err);
            }
            if let Some(b) = table.bindings.get_mut(&tenant) {
                b.released_at = None;
            }
            // Fallback bindings never displace the slot's real owner
            table.owners.entry(binding.slot).or_insert(tenant);
            return SlotAssignment {
                slot: binding.slot,
                source: SlotSource::Bound,
            };
        }

        if let Some(slot) = observed.filter(|s| !table.held_by_other(*s, tenant)) {
            table.bind(tenant, slot);
            debug!("Tenant {} inferred {} from placement", tenant, slot);
            return SlotAssignment {
                slot,
                source: SlotSource::Placement,
            };
        }

        let free = (1..=self.max_slots)
            .map(Slot)
            .find(|slot| !table.owners.contains_key(slot) && !busy(*slot));
        match free {
            Some(slot) => {
                table.bind(tenant, slot);
                debug!("Tenant {} allocated {}", tenant, slot);
                SlotAssignment {
                    slot,
                    source: SlotSource::Allocated,
                }
            }
            None => {
                let err = OrchestratorError::SlotPoolExhausted {
                    max_slots: self.max_slots,
                };
                warn!(
                    kind = err.kind(),
                    "{}; tenant {} falls back to {}",
                    err,
                    tenant,
                    Slot::FALLBACK
                );
                // Known risk: this may share slot 1 with its current owner
                table.bindings.insert(
                    tenant,
                    SlotBinding {
                        slot: Slot::FALLBACK,
                        released_at: None,
                    },
                );
                SlotAssignment {
                    slot: Slot::FALLBACK,
                    source: SlotSource::Fallback,
                }
            }
        }
    }

    /// Releases a tenant's slot, keeping it reserved for the grace window.
    ///
    /// Returns the slot that was released.
    pub fn release(&self, tenant: TenantId, now: Duration) -> Option<Slot> {
        let mut table = lock(&self.table);
        let binding = table.bindings.get_mut(&tenant)?;
        binding.released_at = Some(now);
        Some(binding.slot)
    }

    /// Drops a tenant's binding immediately.
    pub fn forget(&self, tenant: TenantId) {
        lock(&self.table).unbind(tenant);
    }

    /// Bound (or reserved) slot of a tenant.
    pub fn slot_of(&self, tenant: TenantId) -> Option<Slot> {
        lock(&self.table).bindings.get(&tenant).map(|b| b.slot)
    }

    /// Tenant holding a slot.
    pub fn owner_of(&self, slot: Slot) -> Option<TenantId> {
        lock(&self.table).owners.get(&slot).copied()
    }

    /// Slots nobody holds or reserves at `now`.
    pub fn free_slots(&self, now: Duration) -> Vec<Slot> {
        let mut table = lock(&self.table);
        table.expire(now, self.grace);
        (1..=self.max_slots)
            .map(Slot)
            .filter(|slot| !table.owners.contains_key(slot))
            .collect()
    }

    /// Number of tenants with a binding.
    pub fn bound_count(&self) -> usize {
        lock(&self.table).bindings.len()
    }
}
