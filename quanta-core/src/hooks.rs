//! Collaborator contracts: persistence and notifications.
//!
//! The engine calls out through these after every successful mutation. Real
//! adapters (JSON files, toasts, desktop notifications) live outside the core.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::task::{CompletedTask, Task};
use crate::timer::TimerState;

/// Everything the engine needs to resume after a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub completed: Vec<CompletedTask>,
    /// task_id -> when it was marked done for the day.
    #[serde(default)]
    pub daily_done: BTreeMap<String, DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer: Option<TimerState>,
}

/// Load/save collaborator. `save` is fire-and-forget from the engine's point
/// of view: a failure is logged and never retried.
pub trait Persistence {
    fn load(&self) -> Result<Snapshot>;
    fn save(&self, snapshot: &Snapshot) -> Result<()>;

    /// Token that changes whenever the stored snapshot changes, whoever wrote
    /// it. The engine reloads before its next operation when the token moves
    /// away from the one it last saw. `None` means the store cannot tell.
    fn revision(&self) -> Option<u64> {
        None
    }
}

/// Keeps nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPersistence;

impl Persistence for NoPersistence {
    fn load(&self) -> Result<Snapshot> {
        Ok(Snapshot::default())
    }

    fn save(&self, _snapshot: &Snapshot) -> Result<()> {
        Ok(())
    }
}

/// Keeps the latest snapshot in memory and counts saves.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    snapshot: Mutex<Option<Snapshot>>,
    saves: AtomicUsize,
}

impl MemoryPersistence {
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn last(&self) -> Option<Snapshot> {
        self.snapshot.lock().ok().and_then(|s| s.clone())
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl Persistence for MemoryPersistence {
    fn load(&self) -> Result<Snapshot> {
        let guard = self
            .snapshot
            .lock()
            .map_err(|_| anyhow!("snapshot lock poisoned"))?;
        Ok(guard.clone().unwrap_or_default())
    }

    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let mut guard = self
            .snapshot
            .lock()
            .map_err(|_| anyhow!("snapshot lock poisoned"))?;
        *guard = Some(snapshot.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn revision(&self) -> Option<u64> {
        Some(self.saves.load(Ordering::SeqCst) as u64)
    }
}

impl<P: Persistence + ?Sized> Persistence for Arc<P> {
    fn load(&self) -> Result<Snapshot> {
        (**self).load()
    }

    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        (**self).save(snapshot)
    }

    fn revision(&self) -> Option<u64> {
        (**self).revision()
    }
}

/// Informational lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    Added { task_id: String, title: String },
    Updated { task_id: String },
    Started { task_id: String },
    Switched { from: String, to: String },
    Paused { task_id: String },
    Resumed { task_id: String },
    QuantumAdjusted { task_id: String, time_quantum: u32 },
    QuantumExhausted { task_id: String, elapsed: u64 },
    Requeued { task_id: String },
    Completed { task_id: String, total_time: u64 },
    DoneForToday { task_id: String },
    Deleted { task_id: String },
    CompletedDeleted { task_id: String },
    DailyReset { task_ids: Vec<String> },
}

/// Notification collaborator. Has no way to fail back into the engine.
pub trait Notifier {
    fn notify(&self, event: &SchedulerEvent);
}

/// Emits every event as a structured log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &SchedulerEvent) {
        tracing::info!(?event, "scheduler event");
    }
}

impl<N: Notifier + ?Sized> Notifier for Arc<N> {
    fn notify(&self, event: &SchedulerEvent) {
        (**self).notify(event)
    }
}
