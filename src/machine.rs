//! machine.rs
//!
//! Repair loop state machine. Transitions are pure; the orchestrator owns
//! the side effects.

use crate::config::RepairConfig;
use crate::state::{Phase, SessionState, VerificationOutcome};

pub fn next_state(state: SessionState, outcome: &VerificationOutcome, cfg: &RepairConfig) -> SessionState {
    match state {
        SessionState::Unidiomatic(n) => {
            if outcome.is_success() {
                if cfg.unidiomatic_only {
                    SessionState::Succeeded
                } else {
                    SessionState::Idiomatic(0)
                }
            } else {
                retry_or_exhaust(Phase::Unidiomatic, n, cfg)
            }
        }

        SessionState::Idiomatic(n) => {
            if outcome.is_success() {
                SessionState::Succeeded
            } else {
                retry_or_exhaust(Phase::Idiomatic, n, cfg)
            }
        }

        terminal => terminal,
    }
}

pub fn ceiling(phase: Phase, cfg: &RepairConfig) -> u32 {
    match phase {
        Phase::Unidiomatic => cfg.max_unidiomatic_attempts,
        Phase::Idiomatic => cfg.max_idiomatic_attempts,
    }
}

fn retry_or_exhaust(phase: Phase, n: u32, cfg: &RepairConfig) -> SessionState {
    if n + 1 >= ceiling(phase, cfg) {
        return SessionState::ExhaustedAttempts;
    }

    match phase {
        Phase::Unidiomatic => SessionState::Unidiomatic(n + 1),
        Phase::Idiomatic => SessionState::Idiomatic(n + 1),
    }
}
