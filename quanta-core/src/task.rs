//! Task model: one record per unit of work, with its scheduling class as a
//! sum type so only the active class's fields exist.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SchedError;
use crate::policy::vruntime;

pub const NICE_MIN: i32 = -20;
pub const NICE_MAX: i32 = 19;

/// Declared real-time discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RtAlgorithm {
    Fifo,
    Rr,
}

/// Whether a fair-share task leaves the store on completion or comes back
/// every day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Routine {
    OneShot,
    Daily,
}

/// Scheduling class with its class-specific fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum SchedClass {
    /// Earliest deadline first.
    Deadline { deadline: DateTime<Utc> },

    /// Creation-order FIFO. `Rr` tasks rotate behind their peers once they
    /// are requeued after using up a quantum; `requeued_at` records when.
    RealTime {
        algorithm: RtAlgorithm,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        requeued_at: Option<DateTime<Utc>>,
    },

    /// Lowest virtual runtime first.
    FairShare {
        nice: i32,
        #[serde(default)]
        vruntime: u64,
        routine: Routine,
    },
}

impl SchedClass {
    pub fn deadline(deadline: DateTime<Utc>) -> Self {
        SchedClass::Deadline { deadline }
    }

    pub fn real_time(algorithm: RtAlgorithm) -> Self {
        SchedClass::RealTime {
            algorithm,
            requeued_at: None,
        }
    }

    pub fn fair_share(nice: i32, routine: Routine) -> Self {
        SchedClass::FairShare {
            nice,
            vruntime: 0,
            routine,
        }
    }

    pub fn validate(&self) -> Result<(), SchedError> {
        if let SchedClass::FairShare { nice, .. } = self {
            if !(NICE_MIN..=NICE_MAX).contains(nice) {
                return Err(SchedError::InvalidNice(*nice));
            }
        }
        Ok(())
    }

    /// Strict priority between classes: lower runs first.
    pub fn rank(&self) -> u8 {
        match self {
            SchedClass::Deadline { .. } => 0,
            SchedClass::RealTime { .. } => 1,
            SchedClass::FairShare { .. } => 2,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SchedClass::Deadline { .. } => "deadline",
            SchedClass::RealTime { .. } => "real-time",
            SchedClass::FairShare { .. } => "fair-share",
        }
    }
}

/// Core task type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,

    pub created_at: DateTime<Utc>,

    /// Set iff the task holds the running slot (running or paused).
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub is_paused: bool,

    /// Minutes.
    pub time_quantum: u32,

    /// Seconds.
    #[serde(default)]
    pub elapsed_time: u64,

    pub class: SchedClass,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        created_at: DateTime<Utc>,
        class: SchedClass,
    ) -> Self {
        let mut task = Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            created_at,
            started_at: None,
            is_paused: false,
            time_quantum: 60,
            elapsed_time: 0,
            class,
        };
        task.refresh_vruntime();
        task
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_quantum(mut self, minutes: u32) -> Self {
        self.time_quantum = minutes;
        self
    }

    pub fn with_elapsed(mut self, seconds: u64) -> Self {
        self.elapsed_time = seconds;
        self.refresh_vruntime();
        self
    }

    /// Quantum ceiling in seconds.
    pub fn quantum_secs(&self) -> u64 {
        u64::from(self.time_quantum) * 60
    }

    /// Share of the quantum used so far, 0..=100.
    pub fn progress_percent(&self) -> f64 {
        let total = self.quantum_secs();
        if total == 0 {
            return 100.0;
        }
        (self.elapsed_time as f64 / total as f64 * 100.0).min(100.0)
    }

    /// The whole quantum is spent. Such a task stops again on its first tick
    /// after being started, until its quantum is extended.
    pub fn is_exhausted(&self) -> bool {
        self.elapsed_time >= self.quantum_secs()
    }

    /// Holds the slot with the clock moving.
    pub fn is_running(&self) -> bool {
        self.started_at.is_some() && !self.is_paused
    }

    pub fn is_daily(&self) -> bool {
        matches!(
            self.class,
            SchedClass::FairShare {
                routine: Routine::Daily,
                ..
            }
        )
    }

    pub fn vruntime(&self) -> Option<u64> {
        match self.class {
            SchedClass::FairShare { vruntime, .. } => Some(vruntime),
            _ => None,
        }
    }

    /// Set accumulated seconds, keeping `vruntime` in step.
    pub(crate) fn set_elapsed(&mut self, seconds: u64) -> bool {
        let changed = self.elapsed_time != seconds;
        self.elapsed_time = seconds;
        self.refresh_vruntime();
        changed
    }

    /// Recompute `vruntime` from scratch from the accumulated elapsed time and
    /// the current nice value.
    pub(crate) fn refresh_vruntime(&mut self) {
        let elapsed = self.elapsed_time;
        if let SchedClass::FairShare { nice, vruntime: v, .. } = &mut self.class {
            *v = vruntime(elapsed, *nice);
        }
    }
}

/// Archive entry captured at completion time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedTask {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub class: SchedClass,
    pub completed_at: DateTime<Utc>,
    /// Seconds.
    pub total_time: u64,
}

impl CompletedTask {
    pub fn snapshot(task: &Task, completed_at: DateTime<Utc>) -> Self {
        Self {
            id: task.id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            class: task.class.clone(),
            completed_at,
            total_time: task.elapsed_time,
        }
    }
}

/// Input for creating a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub class: SchedClass,
    /// Minutes; the scheduler default applies when absent.
    pub time_quantum: Option<u32>,
}

impl NewTask {
    pub fn new(title: impl Into<String>, class: SchedClass) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            class,
            time_quantum: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_quantum(mut self, minutes: u32) -> Self {
        self.time_quantum = Some(minutes);
        self
    }
}

/// Edits applied by `Scheduler::update_task`. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub time_quantum: Option<u32>,
    /// Replaces the class wholesale.
    pub class: Option<SchedClass>,
    /// Only valid for fair-share tasks; applied after `class`.
    pub nice: Option<i32>,
}
