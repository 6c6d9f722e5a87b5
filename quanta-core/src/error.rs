//! Rejections raised by the scheduling engine.
//!
//! Only invariant-violating requests end up here. Operations that target an
//! unknown or ineligible task are absorbed as no-ops and never produce an
//! error value.

use thiserror::Error;

use crate::task::{NICE_MAX, NICE_MIN};

/// A request the scheduler refused, with the reason shown to the user.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    #[error("task title must not be empty")]
    EmptyTitle,

    #[error("nice value {0} is outside {min}..={max}", min = NICE_MIN, max = NICE_MAX)]
    InvalidNice(i32),

    /// The resulting quantum would be shorter than one minute.
    #[error("time quantum must be at least 1 minute (requested {requested} minutes)")]
    QuantumBelowMinimum { requested: i64 },

    /// The resulting quantum would be shorter than the time already spent.
    #[error("time quantum of {quantum_secs}s would fall below the {elapsed}s already spent")]
    QuantumBelowElapsed { quantum_secs: i64, elapsed: u64 },

    #[error("quantum exhausted for task {0}; resolve the pending decision first")]
    DecisionPending(String),

    #[error("task {0} no longer holds the slot; the switch was cancelled")]
    SwitchOutdated(String),

    #[error("no decision is pending")]
    NoPendingDecision,

    #[error("decision '{decision}' does not answer the pending '{pending}' decision")]
    DecisionMismatch {
        pending: &'static str,
        decision: &'static str,
    },

    #[error("an extension must add at least 1 minute")]
    EmptyExtension,

    #[error("task {0} is not in the fair-share class")]
    NotFairShare(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_the_reason() {
        let e = SchedError::QuantumBelowElapsed {
            quantum_secs: 120,
            elapsed: 300,
        };
        assert_eq!(
            e.to_string(),
            "time quantum of 120s would fall below the 300s already spent"
        );
        assert_eq!(
            SchedError::InvalidNice(25).to_string(),
            "nice value 25 is outside -20..=19"
        );
    }
}
