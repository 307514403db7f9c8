//! Common types for the Arena host abstraction.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Block coordinate inside an environment (x, y = height, z).
pub type BlockPos = nalgebra::Vector3<i32>;

/// Unique identifier for a tenant (a participant occupying a sandbox).
///
/// Uses UUID v4 for global uniqueness without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub Uuid);

impl TenantId {
    /// Creates a new random TenantId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a TenantId from a UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Creates a deterministic TenantId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Reusable allocation unit bounding the pool of concurrent sandboxes.
///
/// Valid slots are `1..=max_slots`; slot 0 is never handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Slot(pub u32);

impl Slot {
    /// Slot used when the pool is exhausted.
    pub const FALLBACK: Slot = Slot(1);

    /// Returns the raw slot number.
    pub fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// One of the three linked sub-environments composing a slot's sandbox set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// Surface environment where tenants join.
    Primary,
    /// Linked underworld, compressed horizontally.
    Secondary,
    /// Linked terminal realm.
    Tertiary,
}

impl Variant {
    /// All variants in canonical order.
    pub fn all() -> [Variant; 3] {
        [Variant::Primary, Variant::Secondary, Variant::Tertiary]
    }

    /// Horizontal coordinate scale relative to the primary variant.
    ///
    /// A primary coordinate `p` maps to `p * scale(target) / scale(origin)`.
    pub fn coordinate_scale(self) -> f64 {
        match self {
            Variant::Primary => 1.0,
            Variant::Secondary => 0.125,
            Variant::Tertiary => 1.0,
        }
    }

    /// Stable lowercase name.
    pub fn name(self) -> &'static str {
        match self {
            Variant::Primary => "primary",
            Variant::Secondary => "secondary",
            Variant::Tertiary => "tertiary",
        }
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Variant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "primary" => Ok(Variant::Primary),
            "secondary" => Ok(Variant::Secondary),
            "tertiary" => Ok(Variant::Tertiary),
            _ => Err(format!("Unknown variant: {}", s)),
        }
    }
}

/// Composite identity of one sandbox environment.
///
/// Immutable once an instance exists for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvironmentKey {
    pub slot: Slot,
    pub variant: Variant,
    pub seed: u64,
}

impl EnvironmentKey {
    /// Creates a new key.
    pub fn new(slot: Slot, variant: Variant, seed: u64) -> Self {
        Self { slot, variant, seed }
    }

    /// Returns the same slot and seed with another variant.
    pub fn with_variant(self, variant: Variant) -> Self {
        Self { variant, ..self }
    }

    /// Name used by persistence providers for this key's data.
    pub fn storage_name(&self) -> String {
        format!("slot_{}/{}/seed_{}", self.slot.0, self.variant.name(), self.seed)
    }
}

impl std::fmt::Display for EnvironmentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.slot, self.variant, self.seed)
    }
}

/// Where a tenant currently is.
///
/// Sandboxes are tagged explicitly so nobody has to guess from a world name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorldRef {
    /// An orchestrated sandbox environment.
    Sandbox(EnvironmentKey),
    /// A neutral world shared by everyone (lobby, default world).
    Shared(String),
}

impl WorldRef {
    /// Returns the sandbox key, if this is an orchestrated environment.
    pub fn sandbox(&self) -> Option<EnvironmentKey> {
        match self {
            WorldRef::Sandbox(key) => Some(*key),
            WorldRef::Shared(_) => None,
        }
    }
}

/// A tenant position: world plus block coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub world: WorldRef,
    pub pos: BlockPos,
}

impl Placement {
    /// Creates a placement.
    pub fn new(world: WorldRef, pos: BlockPos) -> Self {
        Self { world, pos }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_from_seed_is_deterministic() {
        assert_eq!(TenantId::from_seed(7), TenantId::from_seed(7));
        assert_ne!(TenantId::from_seed(7), TenantId::from_seed(8));
    }

    #[test]
    fn test_key_display_and_storage_name() {
        let key = EnvironmentKey::new(Slot(3), Variant::Primary, 42);
        assert_eq!(key.to_string(), "slot-3/primary/42");
        assert_eq!(key.storage_name(), "slot_3/primary/seed_42");
        assert_eq!(key.with_variant(Variant::Secondary).variant, Variant::Secondary);
    }

    #[test]
    fn test_variant_parse() {
        assert_eq!("Secondary".parse::<Variant>(), Ok(Variant::Secondary));
        assert!("nether".parse::<Variant>().is_err());
    }

    #[test]
    fn test_world_ref_tag() {
        let key = EnvironmentKey::new(Slot(1), Variant::Tertiary, 9);
        assert_eq!(WorldRef::Sandbox(key).sandbox(), Some(key));
        assert_eq!(WorldRef::Shared("lobby".into()).sandbox(), None);
    }
}
