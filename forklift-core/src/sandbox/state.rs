// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Sandbox lifecycle state machine.
//!
//! NEW → RUNNING ↔ PAUSED → DESTROYED. Any state may be destroyed;
//! DESTROYED is terminal.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::SandboxError;
use crate::types::SandboxId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxState {
    /// Set up, but listeners have not been told about it yet.
    New,
    Running,
    Paused,
    Destroyed,
}

impl SandboxState {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Destroyed => "Destroyed",
        }
    }

    pub fn can_transition_to(&self, target: SandboxState) -> bool {
        matches!(
            (self, target),
            (Self::New, Self::Running)
                | (Self::Running, Self::Paused)
                | (Self::Paused, Self::Running)
                | (Self::New, Self::Destroyed)
                | (Self::Running, Self::Destroyed)
                | (Self::Paused, Self::Destroyed)
        )
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug)]
pub struct SandboxStateMachine {
    sandbox_id: SandboxId,
    current_state: SandboxState,
    last_transition: Instant,
    transition_count: u64,
}

impl SandboxStateMachine {
    pub fn new(sandbox_id: SandboxId) -> Self {
        Self {
            sandbox_id,
            current_state: SandboxState::New,
            last_transition: Instant::now(),
            transition_count: 0,
        }
    }

    pub fn state(&self) -> SandboxState {
        self.current_state
    }

    pub fn time_in_current_state(&self) -> std::time::Duration {
        self.last_transition.elapsed()
    }

    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    pub fn is_paused(&self) -> bool {
        self.current_state == SandboxState::Paused
    }

    /// Move to `target`; leaving DESTROYED reports the sandbox as dead.
    pub fn transition_to(&mut self, target: SandboxState) -> Result<(), SandboxError> {
        if !self.current_state.can_transition_to(target) {
            return Err(SandboxError::Dead {
                id: self.sandbox_id,
                reason: format!(
                    "invalid transition from {} to {}",
                    self.current_state.name(),
                    target.name()
                ),
            });
        }

        tracing::trace!(
            sandbox_id = %self.sandbox_id,
            from = self.current_state.name(),
            to = target.name(),
            "State transition"
        );

        self.current_state = target;
        self.last_transition = Instant::now();
        self.transition_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        let mut sm = SandboxStateMachine::new(SandboxId::new(1));
        assert_eq!(sm.state(), SandboxState::New);

        sm.transition_to(SandboxState::Running).unwrap();
        sm.transition_to(SandboxState::Paused).unwrap();
        assert!(sm.is_paused());
        sm.transition_to(SandboxState::Running).unwrap();
        sm.transition_to(SandboxState::Destroyed).unwrap();
        assert_eq!(sm.transition_count(), 4);
    }

    #[test]
    fn test_destroyed_is_terminal() {
        let mut sm = SandboxStateMachine::new(SandboxId::new(2));
        sm.transition_to(SandboxState::Destroyed).unwrap();

        let err = sm.transition_to(SandboxState::Running).unwrap_err();
        assert!(matches!(err, SandboxError::Dead { .. }));
        assert!(sm.transition_to(SandboxState::Destroyed).is_err());
    }

    #[test]
    fn test_new_cannot_pause() {
        assert!(!SandboxState::New.can_transition_to(SandboxState::Paused));
        assert!(!SandboxState::Running.can_transition_to(SandboxState::Running));
    }
}
