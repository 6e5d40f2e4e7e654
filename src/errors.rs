//! Typed error hierarchy for the execution orchestrator.
//!
//! `RunError` covers every way a run can terminally fail; `ScopeViolation`
//! is split out so agent-diff evaluation can return it directly.
//! `StoreError` covers state-store misuse.

use thiserror::Error;

use crate::models::FailureReason;

/// A scope policy breach detected from the agent's filesystem diff.
///
/// Always fatal and never retried, regardless of remaining iteration budget.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScopeViolation {
    #[error("agent changed {changed} files, policy allows at most {max}")]
    TooManyFiles { changed: usize, max: usize },

    #[error("agent touched forbidden path '{path}' (prefix '{prefix}')")]
    ForbiddenPath { path: String, prefix: String },
}

/// A terminal run failure.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("infrastructure failure during {stage}: {message}")]
    Infra { stage: &'static str, message: String },

    #[error("plan/test generation failed: {0}")]
    Generator(String),

    #[error(transparent)]
    Scope(#[from] ScopeViolation),

    #[error("check '{check}' failed with exit code {exit_code}")]
    Verification {
        check: String,
        exit_code: i32,
        output: String,
    },

    #[error("agent exceeded the {timeout_secs}s build timeout on the final iteration")]
    AgentTimeout { timeout_secs: u64 },

    #[error("run exceeded the {budget_secs}s wall-clock budget")]
    RunTimeout { budget_secs: u64 },

    #[error("publish failed: {0}")]
    Publish(String),
}

impl RunError {
    pub fn infra(stage: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Infra {
            stage,
            message: err.to_string(),
        }
    }

    /// Map to the reason persisted on the run record.
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::Infra { .. } => FailureReason::InfraError,
            Self::Generator(_) => FailureReason::GeneratorError,
            Self::Scope(_) => FailureReason::ScopeViolation,
            Self::Verification { .. } => FailureReason::VerificationFailure,
            Self::AgentTimeout { .. } => FailureReason::AgentTimeout,
            Self::RunTimeout { .. } => FailureReason::RunTimeout,
            Self::Publish(_) => FailureReason::PublishError,
        }
    }
}

/// Errors from the execution state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run {id} not found")]
    RunNotFound { id: String },

    #[error("invalid transition {from} -> {to} for run {id}")]
    InvalidTransition {
        id: String,
        from: crate::models::RunStatus,
        to: crate::models::RunStatus,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunStatus;

    #[test]
    fn scope_violation_messages_carry_context() {
        let err = ScopeViolation::TooManyFiles { changed: 30, max: 25 };
        assert!(err.to_string().contains("30"));
        assert!(err.to_string().contains("25"));

        let err = ScopeViolation::ForbiddenPath {
            path: ".env.production".into(),
            prefix: ".env".into(),
        };
        assert!(err.to_string().contains(".env.production"));
    }

    #[test]
    fn run_error_maps_to_failure_reason() {
        assert_eq!(
            RunError::infra("clone", "network down").reason(),
            FailureReason::InfraError
        );
        assert_eq!(
            RunError::Scope(ScopeViolation::TooManyFiles { changed: 3, max: 2 }).reason(),
            FailureReason::ScopeViolation
        );
        assert_eq!(
            RunError::Verification {
                check: "lint".into(),
                exit_code: 1,
                output: String::new(),
            }
            .reason(),
            FailureReason::VerificationFailure
        );
        assert_eq!(
            RunError::AgentTimeout { timeout_secs: 600 }.reason(),
            FailureReason::AgentTimeout
        );
        assert_eq!(
            RunError::RunTimeout { budget_secs: 3600 }.reason(),
            FailureReason::RunTimeout
        );
        assert_eq!(
            RunError::Publish("push rejected".into()).reason(),
            FailureReason::PublishError
        );
        assert_eq!(
            RunError::Generator("llm unreachable".into()).reason(),
            FailureReason::GeneratorError
        );
    }

    #[test]
    fn store_error_invalid_transition_is_matchable() {
        let err = StoreError::InvalidTransition {
            id: "r1".into(),
            from: RunStatus::Done,
            to: RunStatus::Building,
        };
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert!(err.to_string().contains("done -> building"));
    }
}
