//! Orchestration scenarios for deterministic simulation.

use serde::Serialize;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// SIM-001: repeated join returns the same instance and slot
    RepeatJoin,

    /// SIM-002: two tenants share a group environment
    GroupShare,

    /// SIM-003: reconnect within the grace window keeps the slot
    Reconnect,

    /// SIM-004: a newer seed schedules the stale instance for teardown
    Supersede,

    /// SIM-005: concurrent construction of one key yields one instance
    ConcurrentCreate,

    /// SIM-006: a re-request cancels a pending teardown
    CancelTeardown,

    /// SIM-007: many random worlds, every spawn is safe
    SafeSpawn,

    /// SIM-008: linking variants twice reuses the gateway
    GatewayLink,

    /// SIM-009: per-environment clocks and skip-to-morning
    ClockSkip,

    /// SIM-010: generator outage degrades to the fallback world
    Outage,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::RepeatJoin,
            ScenarioId::GroupShare,
            ScenarioId::Reconnect,
            ScenarioId::Supersede,
            ScenarioId::ConcurrentCreate,
            ScenarioId::CancelTeardown,
            ScenarioId::SafeSpawn,
            ScenarioId::GatewayLink,
            ScenarioId::ClockSkip,
            ScenarioId::Outage,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::RepeatJoin => "repeat_join",
            ScenarioId::GroupShare => "group_share",
            ScenarioId::Reconnect => "reconnect",
            ScenarioId::Supersede => "supersede",
            ScenarioId::ConcurrentCreate => "concurrent_create",
            ScenarioId::CancelTeardown => "cancel_teardown",
            ScenarioId::SafeSpawn => "safe_spawn",
            ScenarioId::GatewayLink => "gateway_link",
            ScenarioId::ClockSkip => "clock_skip",
            ScenarioId::Outage => "outage",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::RepeatJoin => "Seed 42 requested twice: same instance and slot",
            ScenarioId::GroupShare => "A and B join group (slot 3, seed 42): one shared instance",
            ScenarioId::Reconnect => "Tenant leaves and returns inside the grace window: same slot",
            ScenarioId::Supersede => "Seed 200 replaces idle seed 100 in slot 3: deferred teardown",
            ScenarioId::ConcurrentCreate => "Callers race on one key: one instance",
            ScenarioId::CancelTeardown => "Re-request before the worker runs: stays live",
            ScenarioId::SafeSpawn => "Random seeds and variants: spawn never in fluid or solid",
            ScenarioId::GatewayLink => "Primary to secondary link twice: one gateway, same exit",
            ScenarioId::ClockSkip => "Two environments tick independently; morning skip is smooth",
            ScenarioId::Outage => "Generator offline: tenants land in the fallback world",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "repeat_join" | "repeatjoin" | "sim-001" => Ok(ScenarioId::RepeatJoin),
            "group_share" | "groupshare" | "sim-002" => Ok(ScenarioId::GroupShare),
            "reconnect" | "sim-003" => Ok(ScenarioId::Reconnect),
            "supersede" | "sim-004" => Ok(ScenarioId::Supersede),
            "concurrent_create" | "concurrentcreate" | "sim-005" => {
                Ok(ScenarioId::ConcurrentCreate)
            }
            "cancel_teardown" | "cancelteardown" | "sim-006" => Ok(ScenarioId::CancelTeardown),
            "safe_spawn" | "safespawn" | "sim-007" => Ok(ScenarioId::SafeSpawn),
            "gateway_link" | "gatewaylink" | "sim-008" => Ok(ScenarioId::GatewayLink),
            "clock_skip" | "clockskip" | "sim-009" => Ok(ScenarioId::ClockSkip),
            "outage" | "sim-010" => Ok(ScenarioId::Outage),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
        }
        assert_eq!("SIM-004".parse::<ScenarioId>(), Ok(ScenarioId::Supersede));
        assert!("split_brain".parse::<ScenarioId>().is_err());
    }
}
