//! quanta-core: a three-class task scheduler.
//!
//! Tasks are deadline-driven (EDF), real-time (FIFO/RR) or fair-share
//! (lowest virtual runtime). One task at a time holds the running slot and
//! spends a time quantum; the `Scheduler` decides what runs next.

pub mod clock;
pub mod error;
pub mod hooks;
pub mod policy;
pub mod routine;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod time;
pub mod timer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::SchedError;
pub use hooks::{
    LogNotifier, MemoryPersistence, NoPersistence, Notifier, Persistence, SchedulerEvent, Snapshot,
};
pub use policy::{select_next, vruntime};
pub use routine::DailyReset;
pub use scheduler::{Decision, PendingDecision, Scheduler, SchedulerConfig, StartOutcome};
pub use store::TaskStore;
pub use task::{
    CompletedTask, NICE_MAX, NICE_MIN, NewTask, Routine, RtAlgorithm, SchedClass, Task, TaskUpdate,
};
pub use time::{format_hms, parse_boundary, parse_local_deadline_to_utc, parse_timezone};
pub use timer::{QuantumTimer, Tick, TimerState};
