//! Class policies and virtual-runtime accounting.
//!
//! Selection is strict priority across classes:
//! - deadline: earliest `deadline`, then `created_at`
//! - real-time: creation order (RR tasks rotate behind peers once requeued)
//! - fair-share: lowest `vruntime`, then `created_at`
//!
//! Ties that survive all of the above fall back to `id`, so the order is total
//! and independent of store iteration order.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;

use crate::task::{SchedClass, Task};

/// Weight base per nice step.
pub const NICE_BASE: f64 = 1.25;

/// `floor(1.25^nice * elapsed)`.
///
/// Lower nice values shrink the multiplier, so the task looks like it has run
/// less and stays ahead in the fair-share queue.
pub fn vruntime(elapsed_secs: u64, nice: i32) -> u64 {
    (NICE_BASE.powi(nice) * elapsed_secs as f64).floor() as u64
}

/// Total order over tasks: `Less` runs first.
pub fn compare(a: &Task, b: &Task) -> Ordering {
    a.class
        .rank()
        .cmp(&b.class.rank())
        .then_with(|| compare_within_class(a, b))
        .then_with(|| a.id.cmp(&b.id))
}

fn compare_within_class(a: &Task, b: &Task) -> Ordering {
    match (&a.class, &b.class) {
        (SchedClass::Deadline { deadline: da }, SchedClass::Deadline { deadline: db }) => {
            da.cmp(db).then_with(|| a.created_at.cmp(&b.created_at))
        }
        (SchedClass::RealTime { .. }, SchedClass::RealTime { .. }) => fifo_key(a)
            .cmp(&fifo_key(b))
            .then_with(|| a.created_at.cmp(&b.created_at)),
        (
            SchedClass::FairShare { vruntime: va, .. },
            SchedClass::FairShare { vruntime: vb, .. },
        ) => va.cmp(vb).then_with(|| a.created_at.cmp(&b.created_at)),
        _ => Ordering::Equal,
    }
}

/// Queue position of a real-time task.
fn fifo_key(task: &Task) -> DateTime<Utc> {
    match task.class {
        SchedClass::RealTime {
            requeued_at: Some(at),
            ..
        } => at.max(task.created_at),
        _ => task.created_at,
    }
}

/// Pick the task to run next from an already-filtered eligible set.
pub fn select_next<'a, I>(eligible: I) -> Option<&'a Task>
where
    I: IntoIterator<Item = &'a Task>,
{
    eligible.into_iter().min_by(|a, b| compare(a, b))
}

/// The eligible set in selection order.
pub fn ordered<'a, I>(eligible: I) -> Vec<&'a Task>
where
    I: IntoIterator<Item = &'a Task>,
{
    let mut out: Vec<&Task> = eligible.into_iter().collect();
    out.sort_by(|a, b| compare(a, b));
    out
}
