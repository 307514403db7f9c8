//! The virtual clock - per-environment synthetic time.
//!
//! Each environment instance progresses its own day/night cycle,
//! independent of the host's global clock. A clock is either ticking
//! normally (`tick += speed` every heartbeat) or transitioning toward a
//! target tick, after which it snaps to the target and resumes normal
//! ticking.
//!
//! ```text
//!            begin_smooth_transition
//!   Normal ───────────────────────────► Transitioning
//!     ▲                                      │
//!     └──────────── target reached ──────────┘
//! ```

use crate::lock;
use arena_env::{EnvironmentKey, SessionDirectory, WorldRef};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// An in-progress move toward a target tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub target: u64,
    pub step: u64,
}

/// Clock state of one environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockEntry {
    pub tick: u64,
    pub speed: u64,
    pub transition: Option<Transition>,
}

impl ClockEntry {
    /// Advances by one heartbeat. Returns true while transitioning
    /// (including the beat that arrives at the target).
    fn advance(&mut self) -> bool {
        match self.transition {
            Some(transition) => {
                self.tick = self.tick.saturating_add(transition.step).min(transition.target);
                if self.tick >= transition.target {
                    self.tick = transition.target;
                    self.transition = None;
                }
                true
            }
            None => {
                self.tick = self.tick.saturating_add(self.speed);
                false
            }
        }
    }
}

/// Per-environment clocks, advanced by the host heartbeat.
pub struct VirtualClockService {
    entries: Mutex<HashMap<EnvironmentKey, ClockEntry>>,
    sessions: Arc<dyn SessionDirectory>,
    day_length: u64,
    morning_tick: u64,
}

impl VirtualClockService {
    /// Creates an empty service.
    ///
    /// `day_length` must be positive.
    pub fn new(sessions: Arc<dyn SessionDirectory>, day_length: u64, morning_tick: u64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            sessions,
            day_length: day_length.max(1),
            morning_tick: morning_tick % day_length.max(1),
        }
    }

    /// Creates the clock of a new instance.
    pub fn insert(&self, key: EnvironmentKey, tick: u64, speed: u64) {
        lock(&self.entries).insert(
            key,
            ClockEntry {
                tick,
                speed,
                transition: None,
            },
        );
    }

    /// Destroys a clock, returning its final state.
    pub fn remove(&self, key: EnvironmentKey) -> Option<ClockEntry> {
        lock(&self.entries).remove(&key)
    }

    /// Current tick.
    pub fn get(&self, key: EnvironmentKey) -> Option<u64> {
        lock(&self.entries).get(&key).map(|e| e.tick)
    }

    /// Full clock state.
    pub fn entry(&self, key: EnvironmentKey) -> Option<ClockEntry> {
        lock(&self.entries).get(&key).copied()
    }

    /// Sets the tick instantly and pushes it to every observer.
    ///
    /// Cancels any transition in progress.
    pub fn set(&self, key: EnvironmentKey, tick: u64) -> bool {
        {
            let mut entries = lock(&self.entries);
            let Some(entry) = entries.get_mut(&key) else {
                return false;
            };
            entry.tick = tick;
            entry.transition = None;
        }
        self.broadcast(key, tick);
        true
    }

    /// Sets ticks advanced per heartbeat.
    pub fn set_speed(&self, key: EnvironmentKey, ticks_per_heartbeat: u64) -> bool {
        match lock(&self.entries).get_mut(&key) {
            Some(entry) => {
                entry.speed = ticks_per_heartbeat;
                true
            }
            None => false,
        }
    }

    /// Starts moving toward the next morning over `duration_heartbeats`.
    ///
    /// Returns the target tick. A zero duration jumps immediately.
    pub fn begin_smooth_transition(
        &self,
        key: EnvironmentKey,
        duration_heartbeats: u64,
    ) -> Option<u64> {
        let (target, snapped) = {
            let mut entries = lock(&self.entries);
            let entry = entries.get_mut(&key)?;
            let target = self.next_morning(entry.tick);
            if duration_heartbeats == 0 {
                entry.tick = target;
                entry.transition = None;
                (target, true)
            } else {
                let distance = target - entry.tick;
                let step = distance.div_ceil(duration_heartbeats).max(1);
                entry.transition = Some(Transition { target, step });
                (target, false)
            }
        };
        debug!("Clock {} transitioning to {}", key, target);
        if snapped {
            self.broadcast(key, target);
        }
        Some(target)
    }

    /// Smallest tick strictly after `tick` that falls on the morning tick.
    pub fn next_morning(&self, tick: u64) -> u64 {
        let day_start = tick - tick % self.day_length;
        let candidate = day_start + self.morning_tick;
        if candidate > tick {
            candidate
        } else {
            candidate + self.day_length
        }
    }

    /// Advances every clock by one heartbeat.
    ///
    /// Transitioning clocks are pushed to their observers each beat, since
    /// the host's own time broadcast knows nothing about them. Returns the
    /// keys that were transitioning.
    pub fn heartbeat(&self) -> Vec<(EnvironmentKey, u64)> {
        let mut moved = Vec::new();
        {
            let mut entries = lock(&self.entries);
            for (key, entry) in entries.iter_mut() {
                if entry.advance() {
                    moved.push((*key, entry.tick));
                }
            }
        }
        moved.sort();
        for (key, tick) in &moved {
            self.broadcast(*key, *tick);
        }
        moved
    }

    /// Number of clocks.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// True when no clocks exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn broadcast(&self, key: EnvironmentKey, tick: u64) {
        for tenant in self.sessions.occupants(&WorldRef::Sandbox(key)) {
            self.sessions.send_time(tenant, tick);
        }
    }
}
