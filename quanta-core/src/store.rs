//! TaskStore — canonical storage for live tasks, the completed archive and
//! the daily done-today markers.
//!
//! Pure data: the store answers questions about eligibility but never decides
//! what runs. All mutation goes through `Scheduler`.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

use crate::task::{CompletedTask, Task};

#[derive(Debug, Default, Clone)]
pub struct TaskStore {
    tasks: HashMap<String, Task>,

    /// Newest first.
    completed: Vec<CompletedTask>,

    // task_id -> instant it was marked done for the day
    daily_done: BTreeMap<String, DateTime<Utc>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(
        tasks: Vec<Task>,
        completed: Vec<CompletedTask>,
        daily_done: BTreeMap<String, DateTime<Utc>>,
    ) -> Self {
        let tasks = tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
        Self {
            tasks,
            completed,
            daily_done,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    pub fn upsert(&mut self, task: Task) {
        self.tasks.insert(task.id.clone(), task);
    }

    pub fn remove(&mut self, id: &str) -> Option<Task> {
        self.daily_done.remove(id);
        self.tasks.remove(id)
    }

    /// Live tasks in creation order.
    pub fn tasks(&self) -> Vec<&Task> {
        let mut out: Vec<&Task> = self.tasks.values().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Tasks holding the running slot. More than one means a corrupted load.
    pub fn slot_holders(&self) -> Vec<&Task> {
        let mut out: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.started_at.is_some())
            .collect();
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub fn is_done_today(&self, id: &str) -> bool {
        self.daily_done.contains_key(id)
    }

    /// Queued and not gated by a done-today marker.
    pub fn is_eligible(&self, id: &str) -> bool {
        self.tasks
            .get(id)
            .is_some_and(|t| t.started_at.is_none() && !(t.is_daily() && self.is_done_today(id)))
    }

    pub fn eligible(&self) -> impl Iterator<Item = &Task> {
        self.tasks
            .values()
            .filter(move |t| self.is_eligible(&t.id))
    }

    pub fn mark_done(&mut self, id: &str, at: DateTime<Utc>) {
        self.daily_done.insert(id.to_string(), at);
    }

    pub fn clear_done(&mut self, id: &str) -> bool {
        self.daily_done.remove(id).is_some()
    }

    /// Drop markers stamped strictly before `boundary`, returning their ids.
    pub fn clear_done_before(&mut self, boundary: DateTime<Utc>) -> Vec<String> {
        let stale: Vec<String> = self
            .daily_done
            .iter()
            .filter(|(_, at)| **at < boundary)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.daily_done.remove(id);
        }
        stale
    }

    pub fn daily_done(&self) -> &BTreeMap<String, DateTime<Utc>> {
        &self.daily_done
    }

    pub fn completed(&self) -> &[CompletedTask] {
        &self.completed
    }

    pub fn archive(&mut self, done: CompletedTask) {
        self.completed.insert(0, done);
    }

    pub fn remove_completed(&mut self, id: &str) -> Option<CompletedTask> {
        let idx = self.completed.iter().position(|c| c.id == id)?;
        Some(self.completed.remove(idx))
    }
}
