//! Scheduler — owns the running slot and every lifecycle transition.
//!
//! State machine per task:
//! `Queued -> Running -> {Paused -> Running, Preempted -> Queued, Completed}`
//!
//! Invariants kept after every public call:
//! - `current` names a task in the store with `started_at` set; every other
//!   task has `started_at` unset.
//! - The slot is empty iff no task is eligible.
//! - The timer is armed only for `current`, and only while it is not paused
//!   and no quantum decision is pending.
//!
//! Confirmation dialogs are modelled as two phases: an operation that needs
//! the caller's say-so parks a `PendingDecision` and `resolve` finishes it.

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::SchedError;
use crate::hooks::{LogNotifier, NoPersistence, Notifier, Persistence, SchedulerEvent, Snapshot};
use crate::policy;
use crate::routine::DailyReset;
use crate::store::TaskStore;
use crate::task::{CompletedTask, NewTask, RtAlgorithm, SchedClass, Task, TaskUpdate};
use crate::timer::{QuantumTimer, Tick};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Quantum for new tasks that do not bring their own.
    pub default_quantum_minutes: u32,
    /// Zone the daily boundary is expressed in.
    pub timezone: Tz,
    pub daily_boundary: NaiveTime,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_quantum_minutes: 60,
            timezone: Tz::UTC,
            daily_boundary: NaiveTime::from_hms_opt(5, 0, 0).unwrap_or_default(),
        }
    }
}

/// A transition waiting on the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingDecision {
    /// `start` was asked for `to` while `from` held the slot.
    Switch { from: String, to: String },
    /// The running task used up its quantum; its clock is stopped.
    QuantumExhausted { task_id: String },
}

impl PendingDecision {
    fn kind(&self) -> &'static str {
        match self {
            PendingDecision::Switch { .. } => "switch",
            PendingDecision::QuantumExhausted { .. } => "quantum exhausted",
        }
    }

    fn involves(&self, id: &str) -> bool {
        match self {
            PendingDecision::Switch { from, to } => from == id || to == id,
            PendingDecision::QuantumExhausted { task_id } => task_id == id,
        }
    }
}

/// The caller's answer to a `PendingDecision`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    ConfirmSwitch,
    CancelSwitch,
    /// Add minutes to the exhausted quantum and keep running.
    Extend { minutes: u32 },
    /// Put the exhausted task back in the queue and run the next one.
    Requeue,
    /// Complete the exhausted task.
    Complete,
}

impl Decision {
    fn kind(&self) -> &'static str {
        match self {
            Decision::ConfirmSwitch => "confirm switch",
            Decision::CancelSwitch => "cancel switch",
            Decision::Extend { .. } => "extend",
            Decision::Requeue => "requeue",
            Decision::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
    /// Another task holds the slot; answer with `ConfirmSwitch`/`CancelSwitch`.
    NeedsConfirmation(PendingDecision),
    /// Unknown or ineligible task.
    Ignored,
}

pub struct Scheduler<C = SystemClock, P = NoPersistence, N = LogNotifier>
where
    C: Clock,
    P: Persistence,
    N: Notifier,
{
    clock: C,
    persistence: P,
    notifier: N,
    config: SchedulerConfig,

    store: TaskStore,
    current: Option<String>,
    timer: QuantumTimer,
    pending: Option<PendingDecision>,
    reset: DailyReset,
    /// Store revision this instance last loaded or wrote.
    seen: Option<u64>,
}

impl<C: Clock, P: Persistence, N: Notifier> Scheduler<C, P, N> {
    /// Empty scheduler; nothing is loaded.
    pub fn new(clock: C, persistence: P, notifier: N, config: SchedulerConfig) -> Self {
        let reset = DailyReset::new(config.daily_boundary, config.timezone);
        let seen = persistence.revision();
        Self {
            clock,
            persistence,
            notifier,
            config,
            store: TaskStore::new(),
            current: None,
            timer: QuantumTimer::new(),
            pending: None,
            reset,
            seen,
        }
    }

    /// Load the last snapshot and resume from it.
    pub fn open(clock: C, persistence: P, notifier: N, config: SchedulerConfig) -> anyhow::Result<Self> {
        let snapshot = persistence.load()?;
        let mut scheduler = Self::new(clock, persistence, notifier, config);
        scheduler.restore(snapshot);
        Ok(scheduler)
    }

    /// Reload from the store if another writer changed it since this
    /// instance last loaded or saved. Every operation calls this first, so
    /// a long-lived scheduler never writes back over someone else's change.
    ///
    /// A proposed switch survives the reload while its holder still owns the
    /// slot and its target is still eligible. A pending exhaustion is derived
    /// again from the reloaded state.
    pub fn refresh(&mut self) -> bool {
        let revision = self.persistence.revision();
        if revision.is_none() || revision == self.seen {
            return false;
        }
        self.seen = revision;

        let snapshot = match self.persistence.load() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "failed to reload changed state; keeping in-memory copy");
                return false;
            }
        };

        info!("state changed by another writer; reloading");
        let proposed = self.pending.take();
        self.restore(snapshot);

        if let Some(PendingDecision::Switch { from, to }) = proposed {
            let still_valid = self.pending.is_none()
                && self.current.as_deref() == Some(from.as_str())
                && self.store.is_eligible(&to);
            if still_valid {
                self.pending = Some(PendingDecision::Switch { from, to });
            }
        }
        true
    }

    fn restore(&mut self, snapshot: Snapshot) {
        let Snapshot {
            tasks,
            completed,
            daily_done,
            timer,
        } = snapshot;
        self.store = TaskStore::from_parts(tasks, completed, daily_done);
        self.timer = QuantumTimer::new();
        self.pending = None;
        self.current = None;

        let ids: Vec<String> = self.store.tasks().iter().map(|t| t.id.clone()).collect();
        for id in &ids {
            if let Some(task) = self.store.get_mut(id) {
                task.refresh_vruntime();
            }
        }

        // Prefer the holder the timer was armed for, then the latest start.
        let holders: Vec<String> = self.store.slot_holders().iter().map(|t| t.id.clone()).collect();
        let keep = timer
            .as_ref()
            .map(|s| s.task_id.clone())
            .filter(|id| holders.contains(id))
            .or_else(|| holders.last().cloned());

        for id in holders.iter().filter(|id| Some(*id) != keep.as_ref()) {
            warn!(task_id = %id, "clearing stale running marker on load");
            if let Some(task) = self.store.get_mut(id) {
                task.started_at = None;
                task.is_paused = false;
            }
        }

        self.current = keep;
        if let Some(id) = self.current.clone() {
            let running = self.store.get(&id).map(|t| (!t.is_paused, t.elapsed_time));
            match (running, timer) {
                (Some((true, _)), Some(state)) if state.task_id == id => self.timer.restore(state),
                (Some((true, baseline)), _) => {
                    let now = self.now();
                    self.timer.arm(&id, now, baseline);
                }
                _ => {}
            }
        }

        info!(
            tasks = self.store.len(),
            completed = self.store.completed().len(),
            current = ?self.current,
            "scheduler state restored"
        );

        self.ensure_running(None);
        // Catch up on time that passed while nobody was ticking.
        let _ = self.tick_inner();
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Task holding the running slot, paused or not.
    pub fn current(&self) -> Option<&Task> {
        self.current.as_deref().and_then(|id| self.store.get(id))
    }

    pub fn pending(&self) -> Option<&PendingDecision> {
        self.pending.as_ref()
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.store.get(id)
    }

    /// Live tasks in creation order.
    pub fn tasks(&self) -> Vec<&Task> {
        self.store.tasks()
    }

    /// Completed archive, newest first.
    pub fn completed(&self) -> &[CompletedTask] {
        self.store.completed()
    }

    pub fn is_done_today(&self, id: &str) -> bool {
        self.store.is_done_today(id)
    }

    /// Eligible tasks in the order they would be selected.
    pub fn ready_queue(&self, limit: usize) -> Vec<&Task> {
        let mut queue = policy::ordered(self.store.eligible());
        queue.truncate(limit);
        queue
    }

    /// What would run next if the slot were empty now.
    pub fn select_next(&self) -> Option<&Task> {
        policy::select_next(self.store.eligible())
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            tasks: self.store.tasks().into_iter().cloned().collect(),
            completed: self.store.completed().to_vec(),
            daily_done: self.store.daily_done().clone(),
            timer: self.timer.state().cloned(),
        }
    }

    pub fn add_task(&mut self, new: NewTask) -> Result<String, SchedError> {
        self.refresh();
        let NewTask {
            title,
            description,
            class,
            time_quantum,
        } = new;

        if title.trim().is_empty() {
            return Err(rejected(SchedError::EmptyTitle));
        }
        class.validate().map_err(rejected)?;
        let quantum = time_quantum.unwrap_or(self.config.default_quantum_minutes);
        check_quantum(i64::from(quantum), 0).map_err(rejected)?;

        let id = Uuid::new_v4().to_string();
        let task = Task::new(id.clone(), title.trim(), self.now(), class)
            .with_description(description)
            .with_quantum(quantum);

        info!(task_id = %id, class = task.class.label(), quantum, "task added");
        self.emit(SchedulerEvent::Added {
            task_id: id.clone(),
            title: task.title.clone(),
        });
        self.store.upsert(task);

        self.ensure_running(None);
        self.persist();
        Ok(id)
    }

    /// Edit a live task. Returns `Ok(false)` for an unknown id.
    pub fn update_task(&mut self, id: &str, update: TaskUpdate) -> Result<bool, SchedError> {
        self.refresh();
        if self.store.get(id).is_none() {
            return Ok(false);
        }
        if self.current.as_deref() == Some(id) {
            let _ = self.tick_inner();
        }
        let Some(task) = self.store.get(id) else {
            return Ok(false);
        };

        let TaskUpdate {
            title,
            description,
            time_quantum,
            class,
            nice,
        } = update;

        if title.as_ref().is_some_and(|t| t.trim().is_empty()) {
            return Err(rejected(SchedError::EmptyTitle));
        }

        let mut new_class = class.unwrap_or_else(|| task.class.clone());
        if let Some(n) = nice {
            match &mut new_class {
                SchedClass::FairShare { nice, .. } => *nice = n,
                _ => return Err(rejected(SchedError::NotFairShare(id.to_string()))),
            }
        }
        new_class.validate().map_err(rejected)?;

        if let Some(q) = time_quantum {
            check_quantum(i64::from(q), task.elapsed_time).map_err(rejected)?;
        }

        let was_daily = task.is_daily();
        let Some(task) = self.store.get_mut(id) else {
            return Ok(false);
        };
        if let Some(t) = title {
            task.title = t.trim().to_string();
        }
        if let Some(d) = description {
            task.description = d;
        }
        if let Some(q) = time_quantum {
            task.time_quantum = q;
        }
        task.class = new_class;
        task.refresh_vruntime();

        let is_daily = task.is_daily();
        let has_budget = task.quantum_secs() > task.elapsed_time;
        let baseline = task.elapsed_time;

        if was_daily && !is_daily {
            self.store.clear_done(id);
        }

        // A longer quantum on an exhausted task is an extension.
        let exhausted_here = matches!(
            &self.pending,
            Some(PendingDecision::QuantumExhausted { task_id }) if task_id == id
        );
        if exhausted_here && has_budget {
            self.pending = None;
            let now = self.now();
            self.timer.arm(id, now, baseline);
        }

        debug!(task_id = %id, "task updated");
        self.emit(SchedulerEvent::Updated {
            task_id: id.to_string(),
        });
        self.ensure_running(None);
        self.persist();
        Ok(true)
    }

    /// Remove a live task without archiving it.
    pub fn delete_task(&mut self, id: &str) -> bool {
        self.refresh();
        if self.store.get(id).is_none() {
            return false;
        }
        if self.current.as_deref() == Some(id) {
            self.timer.disarm();
            self.current = None;
        }
        self.clear_pending_for(id);
        self.store.remove(id);

        info!(task_id = %id, "task deleted");
        self.emit(SchedulerEvent::Deleted {
            task_id: id.to_string(),
        });
        self.ensure_running(None);
        self.persist();
        true
    }

    pub fn delete_completed(&mut self, id: &str) -> bool {
        self.refresh();
        if self.store.remove_completed(id).is_none() {
            return false;
        }
        self.emit(SchedulerEvent::CompletedDeleted {
            task_id: id.to_string(),
        });
        self.persist();
        true
    }

    /// Give `id` the running slot.
    ///
    /// If another task holds the slot this only proposes the switch; nothing
    /// changes until `resolve(Decision::ConfirmSwitch)`. Once the holder's
    /// quantum is exhausted the switch needs no confirmation.
    pub fn start(&mut self, id: &str) -> StartOutcome {
        self.refresh();
        if self.current.as_deref() == Some(id) {
            return StartOutcome::AlreadyRunning;
        }
        if !self.store.is_eligible(id) {
            debug!(task_id = %id, "start ignored: task not eligible");
            return StartOutcome::Ignored;
        }

        let Some(from) = self.current.clone() else {
            self.activate(id);
            self.persist();
            return StartOutcome::Started;
        };

        if self.pending_exhaustion().is_some() {
            self.pending = None;
            self.switch_to(id, true);
            self.persist();
            return StartOutcome::Started;
        }

        let decision = PendingDecision::Switch {
            from,
            to: id.to_string(),
        };
        debug!(?decision, "switch needs confirmation");
        self.pending = Some(decision.clone());
        StartOutcome::NeedsConfirmation(decision)
    }

    /// Answer the pending decision.
    pub fn resolve(&mut self, decision: Decision) -> Result<(), SchedError> {
        self.refresh();
        let Some(pending) = self.pending.take() else {
            return Err(rejected(SchedError::NoPendingDecision));
        };

        match (pending, decision) {
            (PendingDecision::Switch { from, to }, Decision::ConfirmSwitch) => {
                if !self.store.is_eligible(&to) {
                    debug!(task_id = %to, "switch target no longer eligible");
                    return Ok(());
                }
                if self.current.as_deref() != Some(from.as_str()) {
                    return Err(rejected(SchedError::SwitchOutdated(from)));
                }
                self.switch_to(&to, false);
                self.persist();
            }
            (PendingDecision::Switch { to, .. }, Decision::CancelSwitch) => {
                debug!(task_id = %to, "switch cancelled");
            }
            (PendingDecision::QuantumExhausted { task_id }, Decision::Extend { minutes }) => {
                if minutes == 0 {
                    self.pending = Some(PendingDecision::QuantumExhausted { task_id });
                    return Err(rejected(SchedError::EmptyExtension));
                }
                self.extend(&task_id, minutes);
            }
            (PendingDecision::QuantumExhausted { task_id }, Decision::Requeue) => {
                if self.current.as_deref() == Some(task_id.as_str()) {
                    self.release_current(true);
                    info!(task_id = %task_id, "task requeued after quantum");
                    self.emit(SchedulerEvent::Requeued {
                        task_id: task_id.clone(),
                    });
                    self.ensure_running(Some(&task_id));
                    self.persist();
                }
            }
            (PendingDecision::QuantumExhausted { task_id }, Decision::Complete) => {
                self.complete(&task_id);
            }
            (pending, decision) => {
                let err = SchedError::DecisionMismatch {
                    pending: pending.kind(),
                    decision: decision.kind(),
                };
                self.pending = Some(pending);
                return Err(rejected(err));
            }
        }
        Ok(())
    }

    /// Stop the running task's clock. `elapsed_time` keeps the value it had
    /// at this instant.
    pub fn pause(&mut self) -> bool {
        self.refresh();
        let Some(id) = self.current.clone() else {
            return false;
        };
        if self.pending_exhaustion().is_some() {
            return false;
        }
        if self.store.get(&id).is_none_or(|t| t.is_paused) {
            return false;
        }

        let (tick, _) = self.tick_inner();
        if matches!(tick, Tick::Exhausted { .. }) {
            self.persist();
            return false;
        }

        self.timer.disarm();
        let Some(task) = self.store.get_mut(&id) else {
            return false;
        };
        task.is_paused = true;
        let elapsed = task.elapsed_time;

        info!(task_id = %id, elapsed, "task paused");
        self.emit(SchedulerEvent::Paused { task_id: id });
        self.persist();
        true
    }

    /// Restart the paused task's clock from its accumulated elapsed time.
    pub fn resume(&mut self) -> bool {
        self.refresh();
        let Some(id) = self.current.clone() else {
            return false;
        };
        let now = self.now();
        let Some(task) = self.store.get_mut(&id) else {
            return false;
        };
        if !task.is_paused {
            return false;
        }
        task.is_paused = false;
        task.started_at = Some(now);
        let baseline = task.elapsed_time;
        self.timer.arm(&id, now, baseline);

        info!(task_id = %id, baseline, "task resumed");
        self.emit(SchedulerEvent::Resumed { task_id: id });
        self.persist();
        true
    }

    /// Grow or shrink the running task's quantum.
    ///
    /// Shrinking is refused when the result would drop below one minute or
    /// below the time already spent. `Ok(false)` when nothing holds the slot.
    pub fn adjust_quantum(&mut self, delta_minutes: i32) -> Result<bool, SchedError> {
        self.refresh();
        let Some(id) = self.current.clone() else {
            return Ok(false);
        };
        if self.pending_exhaustion().is_some() {
            return Err(rejected(SchedError::DecisionPending(id)));
        }
        if delta_minutes == 0 {
            return Ok(false);
        }

        let (tick, _) = self.tick_inner();
        if matches!(tick, Tick::Exhausted { .. }) {
            self.persist();
            return Err(rejected(SchedError::DecisionPending(id)));
        }

        let Some(task) = self.store.get_mut(&id) else {
            return Ok(false);
        };
        let requested = i64::from(task.time_quantum) + i64::from(delta_minutes);
        if delta_minutes < 0 {
            check_quantum(requested, task.elapsed_time).map_err(rejected)?;
        }
        task.time_quantum = u32::try_from(requested).unwrap_or(u32::MAX);
        let time_quantum = task.time_quantum;

        info!(task_id = %id, delta_minutes, time_quantum, "quantum adjusted");
        self.emit(SchedulerEvent::QuantumAdjusted {
            task_id: id,
            time_quantum,
        });
        self.persist();
        Ok(true)
    }

    /// Finish a task.
    ///
    /// One-shot tasks move to the archive. Daily fair-share tasks stay in the
    /// store marked done for today. Either way the slot is refilled at once.
    pub fn complete(&mut self, id: &str) -> bool {
        self.refresh();
        let Some(task) = self.store.get(id) else {
            return false;
        };
        let daily = task.is_daily();
        if daily && self.store.is_done_today(id) {
            return false;
        }

        let now = self.now();
        if self.current.as_deref() == Some(id) {
            self.settle();
            self.current = None;
        }
        self.clear_pending_for(id);

        if daily {
            if let Some(task) = self.store.get_mut(id) {
                task.started_at = None;
                task.is_paused = false;
            }
            self.store.mark_done(id, now);
            info!(task_id = %id, "daily task done for today");
            self.emit(SchedulerEvent::DoneForToday {
                task_id: id.to_string(),
            });
        } else if let Some(task) = self.store.remove(id) {
            let done = CompletedTask::snapshot(&task, now);
            info!(task_id = %id, total_time = done.total_time, "task completed");
            self.emit(SchedulerEvent::Completed {
                task_id: id.to_string(),
                total_time: done.total_time,
            });
            self.store.archive(done);
        }

        self.ensure_running(None);
        self.persist();
        true
    }

    /// Advance the quantum timer to the clock's current time.
    pub fn tick(&mut self) -> Tick {
        self.refresh();
        let (tick, changed) = self.tick_inner();
        if changed {
            self.persist();
        }
        tick
    }

    /// Clear done-today markers once the daily boundary has passed. Returns
    /// how many tasks became eligible again.
    pub fn sweep_daily_reset(&mut self) -> usize {
        self.refresh();
        let now = self.now();
        let Some(boundary) = self.reset.poll(now) else {
            return 0;
        };

        let cleared = self.store.clear_done_before(boundary);
        debug!(%boundary, cleared = cleared.len(), "daily reset sweep");
        if cleared.is_empty() {
            return 0;
        }

        info!(count = cleared.len(), "daily tasks reset");
        let count = cleared.len();
        self.emit(SchedulerEvent::DailyReset { task_ids: cleared });
        self.ensure_running(None);
        self.persist();
        count
    }

    fn tick_inner(&mut self) -> (Tick, bool) {
        let Some(armed) = self.timer.armed_for().map(str::to_string) else {
            return (Tick::Idle, false);
        };
        if self.current.as_deref() != Some(armed.as_str()) {
            warn!(task_id = %armed, "dropping tick for a task that left the slot");
            self.timer.disarm();
            return (Tick::Idle, false);
        }
        let Some(quantum_secs) = self.store.get(&armed).map(Task::quantum_secs) else {
            self.timer.disarm();
            return (Tick::Idle, false);
        };

        let now = self.now();
        let tick = self.timer.tick(now, quantum_secs);
        let changed = match &tick {
            Tick::Idle => false,
            Tick::Progress { task_id, elapsed } => self
                .store
                .get_mut(task_id)
                .is_some_and(|t| t.set_elapsed(*elapsed)),
            Tick::Exhausted { task_id, .. } => {
                let id = task_id.clone();
                self.on_quantum_exhausted(&id);
                true
            }
        };
        (tick, changed)
    }

    /// Freeze the task at exactly its ceiling and park the decision.
    fn on_quantum_exhausted(&mut self, id: &str) {
        self.timer.disarm();
        let Some(task) = self.store.get_mut(id) else {
            return;
        };
        let ceiling = task.quantum_secs();
        task.set_elapsed(ceiling);

        info!(task_id = %id, elapsed = ceiling, "quantum exhausted");
        self.pending = Some(PendingDecision::QuantumExhausted {
            task_id: id.to_string(),
        });
        self.emit(SchedulerEvent::QuantumExhausted {
            task_id: id.to_string(),
            elapsed: ceiling,
        });
    }

    fn pending_exhaustion(&self) -> Option<&str> {
        match &self.pending {
            Some(PendingDecision::QuantumExhausted { task_id }) => Some(task_id),
            _ => None,
        }
    }

    fn extend(&mut self, id: &str, minutes: u32) {
        let now = self.now();
        let Some(task) = self.store.get_mut(id) else {
            return;
        };
        task.time_quantum = task.time_quantum.saturating_add(minutes);
        let time_quantum = task.time_quantum;
        let baseline = task.elapsed_time;
        let paused = task.is_paused;

        if self.current.as_deref() == Some(id) && !paused {
            self.timer.arm(id, now, baseline);
        }

        info!(task_id = %id, minutes, time_quantum, "quantum extended");
        self.emit(SchedulerEvent::QuantumAdjusted {
            task_id: id.to_string(),
            time_quantum,
        });
        self.persist();
    }

    fn activate(&mut self, id: &str) {
        let now = self.now();
        let Some(task) = self.store.get_mut(id) else {
            return;
        };
        task.started_at = Some(now);
        task.is_paused = false;
        let baseline = task.elapsed_time;

        self.timer.arm(id, now, baseline);
        self.current = Some(id.to_string());

        info!(task_id = %id, baseline, "task started");
        self.emit(SchedulerEvent::Started {
            task_id: id.to_string(),
        });
    }

    fn switch_to(&mut self, id: &str, rotate: bool) {
        let from = self.release_current(rotate);
        self.activate(id);
        if let Some(from) = from {
            info!(%from, to = %id, "switched task");
            self.emit(SchedulerEvent::Switched {
                from,
                to: id.to_string(),
            });
        }
    }

    /// Fold the timer's progress into the slot holder and stop the timer.
    fn settle(&mut self) {
        let now = self.now();
        let Some(state) = self.timer.disarm() else {
            return;
        };
        if let Some(task) = self.store.get_mut(&state.task_id) {
            let elapsed = state
                .elapsed_at(now)
                .min(task.quantum_secs())
                .max(task.elapsed_time);
            task.set_elapsed(elapsed);
        }
    }

    /// Send the slot holder back to the queue. With `rotate`, an RR task goes
    /// behind its real-time peers.
    fn release_current(&mut self, rotate: bool) -> Option<String> {
        self.settle();
        let id = self.current.take()?;
        let now = self.now();
        if let Some(task) = self.store.get_mut(&id) {
            task.started_at = None;
            task.is_paused = false;
            if rotate {
                if let SchedClass::RealTime {
                    algorithm: RtAlgorithm::Rr,
                    requeued_at,
                } = &mut task.class
                {
                    *requeued_at = Some(now);
                }
            }
        }
        Some(id)
    }

    /// Fill an empty slot with the best eligible task. `exclude` is skipped
    /// unless it is the only candidate.
    fn ensure_running(&mut self, exclude: Option<&str>) {
        if self.current.is_some() {
            return;
        }
        let candidate = {
            let eligible: Vec<&Task> = self.store.eligible().collect();
            policy::select_next(
                eligible
                    .iter()
                    .copied()
                    .filter(|t| Some(t.id.as_str()) != exclude),
            )
            .or_else(|| policy::select_next(eligible.iter().copied()))
            .map(|t| t.id.clone())
        };

        match candidate {
            Some(id) => {
                debug!(task_id = %id, "auto-selected next task");
                self.activate(&id);
            }
            None => debug!("no eligible task; slot left empty"),
        }
    }

    fn clear_pending_for(&mut self, id: &str) {
        if self.pending.as_ref().is_some_and(|p| p.involves(id)) {
            self.pending = None;
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        self.notifier.notify(&event);
    }

    fn persist(&mut self) {
        match self.persistence.save(&self.snapshot()) {
            Ok(()) => self.seen = self.persistence.revision(),
            Err(e) => warn!(error = %e, "failed to save scheduler state"),
        }
    }
}

/// Quantum floor: at least one minute and never below time already spent.
fn check_quantum(minutes: i64, elapsed: u64) -> Result<(), SchedError> {
    if minutes < 1 {
        return Err(SchedError::QuantumBelowMinimum { requested: minutes });
    }
    let quantum_secs = minutes.saturating_mul(60);
    if (quantum_secs as u64) < elapsed {
        return Err(SchedError::QuantumBelowElapsed {
            quantum_secs,
            elapsed,
        });
    }
    Ok(())
}

fn rejected(err: SchedError) -> SchedError {
    warn!(reason = %err, "request rejected");
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::hooks::MemoryPersistence;
    use crate::task::Routine;
    use chrono::{Duration, TimeZone};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    struct Recorder(Mutex<Vec<SchedulerEvent>>);

    impl Notifier for Recorder {
        fn notify(&self, event: &SchedulerEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    impl Recorder {
        fn events(&self) -> Vec<SchedulerEvent> {
            self.0.lock().unwrap().clone()
        }
    }

    type TestScheduler = Scheduler<Arc<ManualClock>, Arc<MemoryPersistence>, Arc<Recorder>>;

    struct Harness {
        clock: Arc<ManualClock>,
        store: Arc<MemoryPersistence>,
        events: Arc<Recorder>,
        sched: TestScheduler,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = Arc::new(MemoryPersistence::default());
        let events = Arc::new(Recorder::default());
        let sched = Scheduler::new(
            clock.clone(),
            store.clone(),
            events.clone(),
            SchedulerConfig::default(),
        );
        Harness {
            clock,
            store,
            events,
            sched,
        }
    }

    fn fair(title: &str, nice: i32) -> NewTask {
        NewTask::new(title, SchedClass::fair_share(nice, Routine::OneShot))
    }

    fn running_count(s: &TestScheduler) -> usize {
        s.tasks().iter().filter(|t| t.is_running()).count()
    }

    #[test]
    fn first_task_is_started_automatically() {
        let mut h = harness();
        let id = h.sched.add_task(fair("write", 0)).unwrap();

        let current = h.sched.current().unwrap();
        assert_eq!(current.id, id);
        assert_eq!(current.started_at, Some(t0()));
        assert!(h.store.save_count() >= 1);
        assert!(matches!(h.events.events()[0], SchedulerEvent::Added { .. }));
    }

    #[test]
    fn add_task_validates_input() {
        let mut h = harness();
        assert_eq!(h.sched.add_task(fair("  ", 0)), Err(SchedError::EmptyTitle));
        assert_eq!(h.sched.add_task(fair("x", -21)), Err(SchedError::InvalidNice(-21)));
        assert_eq!(
            h.sched.add_task(fair("x", 0).with_quantum(0)),
            Err(SchedError::QuantumBelowMinimum { requested: 0 })
        );
        assert!(h.sched.tasks().is_empty());
    }

    #[test]
    fn switch_needs_confirmation_then_swaps_slot() {
        let mut h = harness();
        let a = h.sched.add_task(fair("a", 0)).unwrap();
        let b = h.sched.add_task(fair("b", 0)).unwrap();
        assert_eq!(h.sched.current().unwrap().id, a);

        h.clock.advance_secs(30);
        h.sched.tick();

        let outcome = h.sched.start(&b);
        assert_eq!(
            outcome,
            StartOutcome::NeedsConfirmation(PendingDecision::Switch {
                from: a.clone(),
                to: b.clone()
            })
        );
        // nothing moved yet
        assert_eq!(h.sched.current().unwrap().id, a);

        h.clock.advance_secs(5);
        h.sched.resolve(Decision::ConfirmSwitch).unwrap();

        assert_eq!(h.sched.current().unwrap().id, b);
        let prev = h.sched.task(&a).unwrap();
        assert_eq!(prev.started_at, None);
        assert!(!prev.is_paused);
        assert_eq!(prev.elapsed_time, 35);
        assert_eq!(running_count(&h.sched), 1);
        assert!(h.sched.pending().is_none());
    }

    #[test]
    fn cancelled_switch_changes_nothing() {
        let mut h = harness();
        let a = h.sched.add_task(fair("a", 0)).unwrap();
        let b = h.sched.add_task(fair("b", 0)).unwrap();

        h.sched.start(&b);
        h.sched.resolve(Decision::CancelSwitch).unwrap();
        assert_eq!(h.sched.current().unwrap().id, a);
        assert_eq!(h.sched.resolve(Decision::CancelSwitch), Err(SchedError::NoPendingDecision));
    }

    #[test]
    fn start_of_unknown_task_is_a_no_op() {
        let mut h = harness();
        h.sched.add_task(fair("a", 0)).unwrap();
        assert_eq!(h.sched.start("nope"), StartOutcome::Ignored);
        assert!(h.sched.pending().is_none());
    }

    #[test]
    fn mismatched_decision_keeps_pending() {
        let mut h = harness();
        h.sched.add_task(fair("a", 0)).unwrap();
        let b = h.sched.add_task(fair("b", 0)).unwrap();
        h.sched.start(&b);

        let err = h.sched.resolve(Decision::Requeue).unwrap_err();
        assert_eq!(
            err,
            SchedError::DecisionMismatch {
                pending: "switch",
                decision: "requeue"
            }
        );
        assert!(h.sched.pending().is_some());
    }

    #[test]
    fn adjust_quantum_enforces_floor() {
        let mut h = harness();
        h.sched.add_task(fair("a", 0).with_quantum(10)).unwrap();

        h.clock.advance_secs(330);
        h.sched.tick();

        // 5 minutes = 300s < 330s spent
        let err = h.sched.adjust_quantum(-5).unwrap_err();
        assert_eq!(
            err,
            SchedError::QuantumBelowElapsed {
                quantum_secs: 300,
                elapsed: 330
            }
        );
        assert_eq!(h.sched.current().unwrap().time_quantum, 10);

        assert!(h.sched.adjust_quantum(-4).unwrap());
        assert_eq!(h.sched.current().unwrap().time_quantum, 6);

        assert_eq!(
            h.sched.adjust_quantum(-6).unwrap_err(),
            SchedError::QuantumBelowMinimum { requested: 0 }
        );

        assert!(h.sched.adjust_quantum(30).unwrap());
        assert_eq!(h.sched.current().unwrap().time_quantum, 36);
    }

    #[test]
    fn adjust_quantum_without_running_task_is_a_no_op() {
        let mut h = harness();
        assert_eq!(h.sched.adjust_quantum(5), Ok(false));
    }

    #[test]
    fn exhausted_quantum_can_be_extended() {
        let mut h = harness();
        let a = h.sched.add_task(fair("a", 0).with_quantum(1)).unwrap();

        h.clock.advance_secs(75);
        assert!(matches!(h.sched.tick(), Tick::Exhausted { .. }));
        assert_eq!(h.sched.current().unwrap().elapsed_time, 60);
        assert_eq!(
            h.sched.pending(),
            Some(&PendingDecision::QuantumExhausted { task_id: a.clone() })
        );

        // clock is stopped while the decision is open
        h.clock.advance_secs(600);
        assert_eq!(h.sched.tick(), Tick::Idle);
        assert_eq!(h.sched.current().unwrap().elapsed_time, 60);
        assert!(!h.sched.pause());
        assert_eq!(h.sched.adjust_quantum(5), Err(SchedError::DecisionPending(a.clone())));

        assert_eq!(
            h.sched.resolve(Decision::Extend { minutes: 0 }),
            Err(SchedError::EmptyExtension)
        );
        h.sched.resolve(Decision::Extend { minutes: 2 }).unwrap();
        assert_eq!(h.sched.current().unwrap().time_quantum, 3);

        h.clock.advance_secs(10);
        h.sched.tick();
        assert_eq!(h.sched.current().unwrap().elapsed_time, 70);
    }

    #[test]
    fn requeue_hands_slot_to_another_task() {
        let mut h = harness();
        let a = h.sched.add_task(fair("a", 0).with_quantum(1)).unwrap();
        let b = h.sched.add_task(fair("b", 0)).unwrap();

        h.clock.advance_secs(60);
        h.sched.tick();
        h.sched.resolve(Decision::Requeue).unwrap();

        assert_eq!(h.sched.current().unwrap().id, b);
        assert!(h.sched.task(&a).unwrap().started_at.is_none());
        assert!(
            h.events
                .events()
                .contains(&SchedulerEvent::Requeued { task_id: a.clone() })
        );
    }

    #[test]
    fn requeue_of_only_task_restarts_it() {
        let mut h = harness();
        let a = h.sched.add_task(fair("a", 0).with_quantum(1)).unwrap();
        h.clock.advance_secs(60);
        h.sched.tick();
        h.sched.resolve(Decision::Requeue).unwrap();
        assert_eq!(h.sched.current().unwrap().id, a);
    }

    #[test]
    fn rr_task_rotates_behind_peer_on_requeue() {
        let mut h = harness();
        let a = h
            .sched
            .add_task(NewTask::new("a", SchedClass::real_time(RtAlgorithm::Rr)).with_quantum(1))
            .unwrap();
        h.clock.advance_secs(1);
        let b = h
            .sched
            .add_task(NewTask::new("b", SchedClass::real_time(RtAlgorithm::Rr)).with_quantum(1))
            .unwrap();
        assert_eq!(h.sched.current().unwrap().id, a);

        h.clock.advance_secs(60);
        h.sched.tick();
        h.sched.resolve(Decision::Requeue).unwrap();
        assert_eq!(h.sched.current().unwrap().id, b);

        // b rotates behind a the same way
        h.clock.advance_secs(60);
        h.sched.tick();
        h.sched.resolve(Decision::Requeue).unwrap();
        assert_eq!(h.sched.current().unwrap().id, a);
    }

    #[test]
    fn starting_another_task_after_exhaustion_needs_no_confirmation() {
        let mut h = harness();
        h.sched.add_task(fair("a", 0).with_quantum(1)).unwrap();
        let b = h.sched.add_task(fair("b", 0)).unwrap();

        h.clock.advance_secs(60);
        h.sched.tick();
        assert_eq!(h.sched.start(&b), StartOutcome::Started);
        assert_eq!(h.sched.current().unwrap().id, b);
        assert!(h.sched.pending().is_none());
    }

    #[test]
    fn complete_one_shot_archives_and_advances() {
        let mut h = harness();
        let a = h.sched.add_task(fair("a", 0)).unwrap();
        let b = h.sched.add_task(fair("b", 0)).unwrap();

        h.clock.advance_secs(42);
        assert!(h.sched.complete(&a));

        assert!(h.sched.task(&a).is_none());
        assert_eq!(h.sched.completed()[0].id, a);
        assert_eq!(h.sched.completed()[0].total_time, 42);
        assert_eq!(h.sched.current().unwrap().id, b);
        assert!(!h.sched.complete(&a));
    }

    #[test]
    fn complete_daily_keeps_task_but_gates_it() {
        let mut h = harness();
        let d = h
            .sched
            .add_task(NewTask::new("stretch", SchedClass::fair_share(0, Routine::Daily)))
            .unwrap();

        assert!(h.sched.complete(&d));
        assert!(h.sched.task(&d).is_some());
        assert!(h.sched.completed().is_empty());
        assert!(h.sched.is_done_today(&d));
        assert!(h.sched.current().is_none());
        assert_eq!(h.sched.start(&d), StartOutcome::Ignored);
        assert!(!h.sched.complete(&d));
    }

    #[test]
    fn changing_nice_recomputes_vruntime_from_elapsed() {
        let mut h = harness();
        let a = h.sched.add_task(fair("a", 0)).unwrap();
        h.clock.advance_secs(100);
        h.sched.tick();
        assert_eq!(h.sched.task(&a).unwrap().vruntime(), Some(100));

        let update = TaskUpdate {
            nice: Some(1),
            ..Default::default()
        };
        assert!(h.sched.update_task(&a, update).unwrap());
        assert_eq!(h.sched.task(&a).unwrap().vruntime(), Some(125));

        let update = TaskUpdate {
            nice: Some(-1),
            ..Default::default()
        };
        h.sched.update_task(&a, update).unwrap();
        assert_eq!(h.sched.task(&a).unwrap().vruntime(), Some(80));
    }

    #[test]
    fn update_rejects_nice_on_other_classes_and_short_quanta() {
        let mut h = harness();
        let rt = h
            .sched
            .add_task(NewTask::new("rt", SchedClass::real_time(RtAlgorithm::Fifo)))
            .unwrap();
        let err = h
            .sched
            .update_task(
                &rt,
                TaskUpdate {
                    nice: Some(3),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_eq!(err, SchedError::NotFairShare(rt.clone()));

        h.clock.advance_secs(200);
        let err = h
            .sched
            .update_task(
                &rt,
                TaskUpdate {
                    time_quantum: Some(3),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_eq!(
            err,
            SchedError::QuantumBelowElapsed {
                quantum_secs: 180,
                elapsed: 200
            }
        );
        assert_eq!(h.sched.update_task("missing", TaskUpdate::default()), Ok(false));
    }

    #[test]
    fn delete_running_task_advances() {
        let mut h = harness();
        let a = h.sched.add_task(fair("a", 0)).unwrap();
        let b = h.sched.add_task(fair("b", 0)).unwrap();

        assert!(h.sched.delete_task(&a));
        assert_eq!(h.sched.current().unwrap().id, b);
        assert!(h.sched.completed().is_empty());
        assert!(!h.sched.delete_task(&a));
    }

    #[test]
    fn delete_completed_removes_archive_entry() {
        let mut h = harness();
        let a = h.sched.add_task(fair("a", 0)).unwrap();
        h.sched.complete(&a);
        assert!(h.sched.delete_completed(&a));
        assert!(h.sched.completed().is_empty());
        assert!(!h.sched.delete_completed(&a));
    }

    #[test]
    fn failed_save_does_not_roll_back() {
        struct Broken;
        impl Persistence for Broken {
            fn load(&self) -> anyhow::Result<Snapshot> {
                Ok(Snapshot::default())
            }
            fn save(&self, _snapshot: &Snapshot) -> anyhow::Result<()> {
                anyhow::bail!("disk full")
            }
        }

        let clock = Arc::new(ManualClock::new(t0()));
        let mut sched = Scheduler::new(clock, Broken, LogNotifier, SchedulerConfig::default());
        let id = sched.add_task(fair("a", 0)).unwrap();
        assert_eq!(sched.current().unwrap().id, id);
    }

    #[test]
    fn restore_resumes_timer_from_reference_point() {
        let mut h = harness();
        let a = h.sched.add_task(fair("a", 0)).unwrap();
        h.clock.advance_secs(10);
        h.sched.tick();

        let snapshot = h.store.last().unwrap();
        h.clock.advance_secs(50);

        let reopened = Scheduler::open(
            h.clock.clone(),
            Arc::new(MemoryPersistence::with_snapshot(snapshot)),
            LogNotifier,
            SchedulerConfig::default(),
        )
        .unwrap();
        let current = reopened.current().unwrap();
        assert_eq!(current.id, a);
        assert_eq!(current.elapsed_time, 60);
    }

    #[test]
    fn restore_repairs_multiple_slot_holders() {
        let at = t0();
        let mut first = Task::new("first", "first", at, SchedClass::fair_share(0, Routine::OneShot));
        first.started_at = Some(at);
        let mut second = Task::new("second", "second", at, SchedClass::fair_share(0, Routine::OneShot));
        second.started_at = Some(at + Duration::minutes(1));

        let snapshot = Snapshot {
            tasks: vec![first, second],
            ..Default::default()
        };
        let clock = Arc::new(ManualClock::new(at + Duration::minutes(2)));
        let sched = Scheduler::open(
            clock,
            MemoryPersistence::with_snapshot(snapshot),
            LogNotifier,
            SchedulerConfig::default(),
        )
        .unwrap();

        assert_eq!(sched.current().unwrap().id, "second");
        assert!(sched.task("first").unwrap().started_at.is_none());
    }

    #[test]
    fn ready_queue_excludes_running_task() {
        let mut h = harness();
        let a = h.sched.add_task(fair("a", 0)).unwrap();
        h.clock.advance_secs(1);
        let b = h.sched.add_task(fair("b", 0)).unwrap();
        h.clock.advance_secs(1);
        let c = h.sched.add_task(fair("c", -3)).unwrap();

        let queue: Vec<&str> = h.sched.ready_queue(10).iter().map(|t| t.id.as_str()).collect();
        assert_eq!(queue, vec![b.as_str(), c.as_str()]);
        assert!(!queue.contains(&a.as_str()));
        assert_eq!(h.sched.ready_queue(1).len(), 1);
    }

    #[test]
    fn confirm_is_refused_when_holder_changed() {
        let mut h = harness();
        let a = h.sched.add_task(fair("a", 0)).unwrap();
        let b = h.sched.add_task(fair("b", 0)).unwrap();
        h.sched.pending = Some(PendingDecision::Switch {
            from: "gone".into(),
            to: b.clone(),
        });

        assert_eq!(
            h.sched.resolve(Decision::ConfirmSwitch),
            Err(SchedError::SwitchOutdated("gone".into()))
        );
        assert_eq!(h.sched.current().unwrap().id, a);
        assert!(h.sched.pending().is_none());
    }

    fn second_writer(h: &Harness) -> Scheduler<Arc<ManualClock>, Arc<MemoryPersistence>, Arc<Recorder>> {
        Scheduler::open(
            h.clock.clone(),
            h.store.clone(),
            Arc::new(Recorder::default()),
            SchedulerConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn tick_keeps_pause_made_by_another_writer() {
        let mut h = harness();
        let a = h.sched.add_task(fair("a", 0)).unwrap();
        h.clock.advance_secs(10);

        let mut other = second_writer(&h);
        assert!(other.pause());

        h.clock.advance_secs(1);
        assert_eq!(h.sched.tick(), Tick::Idle);

        let saved = h.store.last().unwrap();
        let task = saved.tasks.iter().find(|t| t.id == a).unwrap();
        assert!(task.is_paused);
        assert_eq!(task.elapsed_time, 10);
        assert!(h.sched.current().unwrap().is_paused);
    }

    #[test]
    fn completion_by_another_writer_is_not_undone() {
        let mut h = harness();
        let a = h.sched.add_task(fair("a", 0)).unwrap();
        h.clock.advance_secs(30);

        let mut other = second_writer(&h);
        assert!(other.complete(&a));

        h.clock.advance_secs(1);
        h.sched.tick();
        assert!(h.sched.task(&a).is_none());
        assert_eq!(h.sched.completed().len(), 1);
        assert_eq!(h.sched.completed()[0].total_time, 30);

        let saved = h.store.last().unwrap();
        assert!(saved.tasks.is_empty());
        assert_eq!(saved.completed.len(), 1);
    }

    #[test]
    fn proposed_switch_survives_unrelated_reload() {
        let mut h = harness();
        let a = h.sched.add_task(fair("a", 0)).unwrap();
        let b = h.sched.add_task(fair("b", 0)).unwrap();
        assert!(matches!(h.sched.start(&b), StartOutcome::NeedsConfirmation(_)));

        let mut other = second_writer(&h);
        assert_eq!(other.adjust_quantum(5), Ok(true));

        h.sched.resolve(Decision::ConfirmSwitch).unwrap();
        assert_eq!(h.sched.current().unwrap().id, b);
        assert_eq!(h.sched.task(&a).unwrap().time_quantum, 65);
    }

    #[test]
    fn proposed_switch_is_dropped_when_another_writer_took_the_slot() {
        let mut h = harness();
        let a = h.sched.add_task(fair("a", 0)).unwrap();
        h.clock.advance_secs(1);
        let b = h.sched.add_task(fair("b", 0)).unwrap();
        h.clock.advance_secs(1);
        let c = h.sched.add_task(fair("c", 0)).unwrap();
        assert!(matches!(h.sched.start(&c), StartOutcome::NeedsConfirmation(_)));

        let mut other = second_writer(&h);
        assert!(other.complete(&a));
        assert_eq!(other.current().unwrap().id, b);

        assert_eq!(
            h.sched.resolve(Decision::ConfirmSwitch),
            Err(SchedError::NoPendingDecision)
        );
        assert_eq!(h.sched.current().unwrap().id, b);
        assert!(h.sched.task(&c).unwrap().started_at.is_none());
    }
}
