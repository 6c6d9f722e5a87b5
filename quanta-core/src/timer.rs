//! Quantum timer: one logical clock for the task holding the running slot.
//!
//! Elapsed time is always recomputed as `baseline + seconds since arm`, never
//! by counting ticks, so missed or late ticks cannot skew it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reference point of an armed timer. Persisted so a restart picks up where
/// the previous process left off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerState {
    pub task_id: String,
    pub armed_at: DateTime<Utc>,
    /// Elapsed seconds the task had when the timer was armed.
    pub baseline: u64,
}

impl TimerState {
    /// Unclamped elapsed seconds at `now`. A clock that went backwards
    /// contributes nothing.
    pub fn elapsed_at(&self, now: DateTime<Utc>) -> u64 {
        let since = (now - self.armed_at).num_seconds().max(0) as u64;
        self.baseline.saturating_add(since)
    }
}

/// Result of a single tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    /// Nothing armed.
    Idle,
    Progress { task_id: String, elapsed: u64 },
    /// Ceiling reached; `elapsed` is exactly the ceiling and the timer is now
    /// disarmed.
    Exhausted { task_id: String, elapsed: u64 },
}

#[derive(Debug, Default, Clone)]
pub struct QuantumTimer {
    armed: Option<TimerState>,
}

impl QuantumTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, task_id: impl Into<String>, now: DateTime<Utc>, baseline: u64) {
        self.armed = Some(TimerState {
            task_id: task_id.into(),
            armed_at: now,
            baseline,
        });
    }

    /// Stop immediately; later ticks are `Idle` until re-armed.
    pub fn disarm(&mut self) -> Option<TimerState> {
        self.armed.take()
    }

    pub fn restore(&mut self, state: TimerState) {
        self.armed = Some(state);
    }

    pub fn state(&self) -> Option<&TimerState> {
        self.armed.as_ref()
    }

    pub fn armed_for(&self) -> Option<&str> {
        self.armed.as_ref().map(|s| s.task_id.as_str())
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Advance to `now` against a ceiling of `quantum_secs`.
    pub fn tick(&mut self, now: DateTime<Utc>, quantum_secs: u64) -> Tick {
        let Some(state) = self.armed.as_ref() else {
            return Tick::Idle;
        };

        let elapsed = state.elapsed_at(now);
        if elapsed >= quantum_secs {
            let task_id = state.task_id.clone();
            self.armed = None;
            return Tick::Exhausted {
                task_id,
                elapsed: quantum_secs,
            };
        }

        Tick::Progress {
            task_id: state.task_id.clone(),
            elapsed,
        }
    }
}
