//! Worker Lifecycle Management
//!
//! Handles worker state transitions.

use log::debug;

use crate::error::WorkerError;

/// Worker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    /// Constructed, not yet installed
    #[default]
    Parsed,
    /// Precaching the shell
    Installing,
    /// Installed, waiting to activate
    Installed,
    /// Purging stale cache generations
    Activating,
    /// Active and intercepting requests
    Activated,
    /// Install or activation failed
    Redundant,
}

/// Check if a state transition is valid
fn is_valid_transition(from: WorkerState, to: WorkerState) -> bool {
    use WorkerState::*;

    matches!(
        (from, to),
        (Parsed, Installing)
            | (Installing, Installed)
            | (Installing, Redundant) // Install failed
            | (Installed, Activating)
            | (Activating, Activated)
            | (Activating, Redundant) // Activate failed
            | (Activated, Redundant)
    )
}

/// Lifecycle state machine
#[derive(Debug, Default)]
pub struct Lifecycle {
    state: WorkerState,
    /// Transitions applied so far
    history: Vec<(WorkerState, WorkerState)>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == WorkerState::Activated
    }

    pub fn history(&self) -> &[(WorkerState, WorkerState)] {
        &self.history
    }

    /// Transition worker state
    pub fn transition(&mut self, to: WorkerState) -> Result<(), WorkerError> {
        let from = self.state;
        if !is_valid_transition(from, to) {
            return Err(WorkerError::InvalidStateTransition { from, to });
        }
        debug!("worker state {:?} -> {:?}", from, to);
        self.state = to;
        self.history.push((from, to));
        Ok(())
    }
}
