//! Orchestrator configuration.

use crate::error::OrchestratorError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for the sandbox orchestrator.
///
/// Every field has a default, so a JSON document only needs the keys it
/// overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Size of the slot pool (slots are `1..=max_slots`)
    pub max_slots: u32,

    /// How long a released slot stays reserved for its tenant (seconds)
    pub slot_grace_secs: u64,

    /// Minimum age before a superseded instance may be scheduled for unload (seconds)
    pub unload_grace_secs: u64,

    /// Delay the unload worker waits before dispatching teardown (milliseconds)
    pub unload_settle_ms: u64,

    /// Column the spawn search starts from `[x, z]`
    pub spawn_anchor: [i32; 2],

    /// Ring radius of the local safe-spot search
    pub spawn_search_radius: i32,

    /// Synchronous generation budget: wall-clock limit (milliseconds)
    pub budget_max_millis: u64,

    /// Synchronous generation budget: chunk limit
    pub budget_max_chunks: u32,

    /// Search radius for an existing linked gateway
    pub gateway_search_radius: i32,

    /// Virtual ticks per day
    pub day_length: u64,

    /// Default ticks advanced per heartbeat
    pub default_tick_speed: u64,

    /// Tick within a day treated as "morning"
    pub morning_tick: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_slots: 8,
            slot_grace_secs: 300,
            unload_grace_secs: 30,
            unload_settle_ms: 0,
            spawn_anchor: [0, 0],
            spawn_search_radius: 16,
            budget_max_millis: 50,
            budget_max_chunks: 16,
            gateway_search_radius: 16,
            day_length: 24_000,
            default_tick_speed: 1,
            morning_tick: 0,
        }
    }
}

impl OrchestratorConfig {
    /// Parses a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, OrchestratorError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| OrchestratorError::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, OrchestratorError> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            OrchestratorError::Config(format!("cannot read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_json_str(&text)
    }

    /// Rejects configurations the orchestrator cannot run with.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.max_slots == 0 {
            return Err(OrchestratorError::Config("max_slots must be at least 1".into()));
        }
        if self.day_length == 0 {
            return Err(OrchestratorError::Config("day_length must be positive".into()));
        }
        if self.spawn_search_radius < 0 || self.gateway_search_radius < 0 {
            return Err(OrchestratorError::Config("search radii must not be negative".into()));
        }
        Ok(())
    }

    pub fn slot_grace(&self) -> Duration {
        Duration::from_secs(self.slot_grace_secs)
    }

    pub fn unload_grace(&self) -> Duration {
        Duration::from_secs(self.unload_grace_secs)
    }

    pub fn unload_settle(&self) -> Duration {
        Duration::from_millis(self.unload_settle_ms)
    }

    /// Sets the slot pool size.
    pub fn with_max_slots(mut self, max_slots: u32) -> Self {
        self.max_slots = max_slots;
        self
    }

    /// Sets the slot reservation window.
    pub fn with_slot_grace(mut self, grace: Duration) -> Self {
        self.slot_grace_secs = grace.as_secs();
        self
    }

    /// Sets the minimum age of superseded instances before unload.
    pub fn with_unload_grace(mut self, grace: Duration) -> Self {
        self.unload_grace_secs = grace.as_secs();
        self
    }

    /// Sets the spawn search radius.
    pub fn with_spawn_search_radius(mut self, radius: i32) -> Self {
        self.spawn_search_radius = radius;
        self
    }

    /// Sets the generation budget.
    pub fn with_generation_budget(mut self, max_millis: u64, max_chunks: u32) -> Self {
        self.budget_max_millis = max_millis;
        self.budget_max_chunks = max_chunks;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = OrchestratorConfig::from_json_str(r#"{ "max_slots": 3 }"#).unwrap();
        assert_eq!(config.max_slots, 3);
        assert_eq!(config.day_length, 24_000);
        assert_eq!(config.unload_grace(), Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(OrchestratorConfig::from_json_str(r#"{ "max_slots": 0 }"#).is_err());
        assert!(OrchestratorConfig::from_json_str(r#"{ "day_length": 0 }"#).is_err());
        assert!(OrchestratorConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_builders() {
        let config = OrchestratorConfig::default()
            .with_max_slots(2)
            .with_unload_grace(Duration::ZERO)
            .with_generation_budget(5, 1);
        assert_eq!(config.max_slots, 2);
        assert_eq!(config.unload_grace(), Duration::ZERO);
        assert_eq!(config.budget_max_chunks, 1);
    }
}
