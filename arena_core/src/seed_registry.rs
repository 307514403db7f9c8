//! Seed bindings per (slot, variant).

use crate::lock;
use arena_env::{EnvironmentKey, Slot, Variant};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct SeedTable {
    /// Keys whose instance is under construction
    pending: HashSet<EnvironmentKey>,
    /// The one current seed of each (slot, variant)
    current: HashMap<(Slot, Variant), u64>,
}

/// Transient seed map consulted while an instance is being constructed.
///
/// Also records the current seed of each (slot, variant), so callers can
/// tell a stale-seed instance from the live one.
#[derive(Debug, Default)]
pub struct SeedRegistry {
    table: Mutex<SeedTable>,
}

impl SeedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `key.seed` for construction and makes it current.
    ///
    /// Returns the previous current seed when it differs.
    pub fn bind(&self, key: EnvironmentKey) -> Option<u64> {
        let mut table = lock(&self.table);
        table.pending.insert(key);
        table
            .current
            .insert((key.slot, key.variant), key.seed)
            .filter(|previous| *previous != key.seed)
    }

    /// Makes an existing instance's seed current again without binding it
    /// for construction. Returns the displaced seed when it differs.
    pub fn promote(&self, key: EnvironmentKey) -> Option<u64> {
        lock(&self.table)
            .current
            .insert((key.slot, key.variant), key.seed)
            .filter(|previous| *previous != key.seed)
    }

    /// Removes and returns the seed bound for constructing `key`.
    ///
    /// Constructions of other seeds in the same (slot, variant) never see
    /// each other's binding.
    pub fn take_pending(&self, key: EnvironmentKey) -> Option<u64> {
        lock(&self.table).pending.remove(&key).then_some(key.seed)
    }

    /// Current seed of a (slot, variant).
    pub fn current(&self, slot: Slot, variant: Variant) -> Option<u64> {
        lock(&self.table).current.get(&(slot, variant)).copied()
    }

    /// Drops the current binding if it still belongs to `key`.
    pub fn forget(&self, key: EnvironmentKey) {
        let mut table = lock(&self.table);
        if table.current.get(&(key.slot, key.variant)) == Some(&key.seed) {
            table.current.remove(&(key.slot, key.variant));
        }
        table.pending.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_reports_superseded_seed() {
        let seeds = SeedRegistry::new();
        let old = EnvironmentKey::new(Slot(3), Variant::Primary, 100);
        let new = EnvironmentKey::new(Slot(3), Variant::Primary, 200);

        assert_eq!(seeds.bind(old), None);
        assert_eq!(seeds.bind(old), None);
        assert_eq!(seeds.bind(new), Some(100));
        assert_eq!(seeds.current(Slot(3), Variant::Primary), Some(200));
    }

    #[test]
    fn test_pending_is_consumed_once() {
        let seeds = SeedRegistry::new();
        let key = EnvironmentKey::new(Slot(1), Variant::Secondary, 7);
        seeds.bind(key);
        assert_eq!(seeds.take_pending(key), Some(7));
        assert_eq!(seeds.take_pending(key), None);
    }

    #[test]
    fn test_interleaved_bindings_keep_their_own_seed() {
        let seeds = SeedRegistry::new();
        let first = EnvironmentKey::new(Slot(1), Variant::Primary, 100);
        let second = EnvironmentKey::new(Slot(1), Variant::Primary, 200);

        seeds.bind(first);
        seeds.bind(second);
        assert_eq!(seeds.take_pending(first), Some(100));
        assert_eq!(seeds.take_pending(second), Some(200));
        assert_eq!(seeds.current(Slot(1), Variant::Primary), Some(200));
    }

    #[test]
    fn test_forget_ignores_stale_key() {
        let seeds = SeedRegistry::new();
        let old = EnvironmentKey::new(Slot(2), Variant::Primary, 1);
        let new = EnvironmentKey::new(Slot(2), Variant::Primary, 2);
        seeds.bind(old);
        seeds.bind(new);

        seeds.forget(old);
        assert_eq!(seeds.current(Slot(2), Variant::Primary), Some(2));

        seeds.forget(new);
        assert_eq!(seeds.current(Slot(2), Variant::Primary), None);
    }
}
