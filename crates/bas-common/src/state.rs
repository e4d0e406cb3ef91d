//! Control-cycle phase state machine.
//!
//! Every cycle walks IDLE → ACCUMULATING → FLUSHING → IDLE. A cycle in
//! which no plugin touched remote I/O may go straight from IDLE to
//! FLUSHING.

use crate::error::{BasError, BasResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Phases of one control cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CyclePhase {
    /// Between cycles; nothing pending.
    #[default]
    Idle,
    /// Plugins are running and remote operations are being queued.
    Accumulating,
    /// The batch is being drained onto the buses.
    Flushing,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Accumulating => write!(f, "ACCUMULATING"),
            Self::Flushing => write!(f, "FLUSHING"),
        }
    }
}

impl CyclePhase {
    /// Check if a transition to `target` is valid from the current phase.
    #[must_use]
    pub fn can_transition_to(&self, target: CyclePhase) -> bool {
        use CyclePhase::{Accumulating, Flushing, Idle};

        matches!(
            (self, target),
            (Idle, Accumulating) | (Accumulating, Flushing) | (Idle, Flushing) | (Flushing, Idle)
        )
    }

    /// Returns true while operations may be queued.
    #[must_use]
    pub fn accepts_operations(&self) -> bool {
        matches!(self, Self::Idle | Self::Accumulating)
    }
}

/// Phase tracker with cycle counting.
#[derive(Debug, Clone, Default)]
pub struct PhaseTracker {
    current: CyclePhase,
    completed_cycles: u64,
}

impl PhaseTracker {
    /// Create a tracker in IDLE.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> CyclePhase {
        self.current
    }

    /// Number of cycles that returned to IDLE after a flush.
    #[must_use]
    pub fn completed_cycles(&self) -> u64 {
        self.completed_cycles
    }

    /// Attempt a phase transition.
    pub fn transition(&mut self, target: CyclePhase) -> BasResult<()> {
        if !self.current.can_transition_to(target) {
            return Err(BasError::InvalidStateTransition {
                from: self.current.to_string(),
                to: target.to_string(),
            });
        }
        if self.current == CyclePhase::Flushing && target == CyclePhase::Idle {
            self.completed_cycles += 1;
        }
        self.current = target;
        Ok(())
    }

    /// Move to ACCUMULATING if the cycle has not started yet.
    pub fn begin_accumulating(&mut self) -> BasResult<()> {
        match self.current {
            CyclePhase::Accumulating => Ok(()),
            _ => self.transition(CyclePhase::Accumulating),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_cycle() {
        let mut tracker = PhaseTracker::new();
        assert_eq!(tracker.phase(), CyclePhase::Idle);

        tracker.begin_accumulating().unwrap();
        // Idempotent while accumulating
        tracker.begin_accumulating().unwrap();
        assert_eq!(tracker.phase(), CyclePhase::Accumulating);

        tracker.transition(CyclePhase::Flushing).unwrap();
        tracker.transition(CyclePhase::Idle).unwrap();
        assert_eq!(tracker.completed_cycles(), 1);
    }

    #[test]
    fn test_empty_cycle_flushes_from_idle() {
        let mut tracker = PhaseTracker::new();
        assert!(tracker.transition(CyclePhase::Flushing).is_ok());
        assert!(tracker.transition(CyclePhase::Idle).is_ok());
    }

    #[test]
    fn test_no_queueing_during_flush() {
        let mut tracker = PhaseTracker::new();
        tracker.transition(CyclePhase::Flushing).unwrap();
        assert!(!tracker.phase().accepts_operations());

        let err = tracker.begin_accumulating().unwrap_err();
        assert_eq!(
            err,
            BasError::InvalidStateTransition {
                from: "FLUSHING".into(),
                to: "ACCUMULATING".into(),
            }
        );
    }

    #[test]
    fn test_accumulating_cannot_return_to_idle() {
        let mut tracker = PhaseTracker::new();
        tracker.begin_accumulating().unwrap();
        assert!(tracker.transition(CyclePhase::Idle).is_err());
        assert_eq!(tracker.completed_cycles(), 0);
    }
}
