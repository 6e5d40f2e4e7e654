use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of an execution run.
///
/// Transitions are validated by [`is_valid_transition`]; terminal states
/// (`Done`, `Failed`, `Cancelled`) have no outgoing edges.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Cloning,
    Planning,
    Testing,
    Building,
    Verifying,
    Pushing,
    Done,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Cloning => "cloning",
            Self::Planning => "planning",
            Self::Testing => "testing",
            Self::Building => "building",
            Self::Verifying => "verifying",
            Self::Pushing => "pushing",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "cloning" => Ok(Self::Cloning),
            "planning" => Ok(Self::Planning),
            "testing" => Ok(Self::Testing),
            "building" => Ok(Self::Building),
            "verifying" => Ok(Self::Verifying),
            "pushing" => Ok(Self::Pushing),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// Validate a run status transition.
///
/// Forward edges follow the pipeline order; `Failed` is reachable from every
/// in-flight stage, `Cancelled` from every non-terminal state. The retry loop
/// is the single backward edge `Verifying -> Building`.
pub fn is_valid_transition(from: RunStatus, to: RunStatus) -> bool {
    use RunStatus::*;
    match (from, to) {
        (Queued, Cloning) => true,
        (Cloning, Planning) => true,
        (Planning, Testing) => true,
        (Testing, Building) => true,
        (Building, Verifying) => true,
        (Verifying, Pushing) => true,
        (Verifying, Building) => true,
        (Pushing, Done) => true,
        (Cloning | Planning | Testing | Building | Verifying | Pushing, Failed) => true,
        (from, Cancelled) => !from.is_terminal(),
        _ => false,
    }
}

/// Why a run ended in `Failed`, surfaced to pollers alongside the status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    InfraError,
    GeneratorError,
    ScopeViolation,
    VerificationFailure,
    AgentTimeout,
    RunTimeout,
    PublishError,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InfraError => "infra_error",
            Self::GeneratorError => "generator_error",
            Self::ScopeViolation => "scope_violation",
            Self::VerificationFailure => "verification_failure",
            Self::AgentTimeout => "agent_timeout",
            Self::RunTimeout => "run_timeout",
            Self::PublishError => "publish_error",
        }
    }
}

impl FromStr for FailureReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "infra_error" => Ok(Self::InfraError),
            "generator_error" => Ok(Self::GeneratorError),
            "scope_violation" => Ok(Self::ScopeViolation),
            "verification_failure" => Ok(Self::VerificationFailure),
            "agent_timeout" => Ok(Self::AgentTimeout),
            "run_timeout" => Ok(Self::RunTimeout),
            "publish_error" => Ok(Self::PublishError),
            _ => Err(format!("Invalid failure reason: {}", s)),
        }
    }
}

/// One end-to-end attempt to build and publish one suggestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRun {
    pub id: String,
    pub repo_id: String,
    pub feature_node_id: String,
    pub suggestion_id: String,
    pub status: RunStatus,
    /// Number of BUILDING attempts made so far (<= max_iterations).
    pub iteration_count: u32,
    pub files_changed: u32,
    pub sandbox_path: Option<String>,
    pub branch_name: Option<String>,
    pub pr_url: Option<String>,
    pub failure_reason: Option<FailureReason>,
    pub failure_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Severity of a single log line.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid log level: {}", s)),
        }
    }
}

/// One append-only line of observable run progress.
///
/// `seq` is gapless and strictly increasing per run; it is assigned by the
/// store inside the same statement that inserts the row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub run_id: String,
    pub seq: i64,
    pub step: String,
    pub level: LogLevel,
    pub message: String,
    pub created_at: String,
}

/// Feature node context handed to the plan generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Approved suggestion context handed to the plan generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestionDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub complexity: String,
    #[serde(default)]
    pub test_cases: Vec<String>,
}

/// A generated test file to drop into the sandbox before the build starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestFile {
    pub path: String,
    pub content: String,
}

/// Output of the external plan/test generation boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedPlan {
    pub plan_text: String,
    #[serde(default)]
    pub test_files: Vec<TestFile>,
    #[serde(default)]
    pub self_review: Option<String>,
}

/// Result of one executed verification check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub command: String,
    pub exit_code: i32,
    /// Combined stdout/stderr, truncated to the configured cap.
    pub output: String,
}

impl CheckResult {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

/// Aggregate outcome of a verification pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub passed: bool,
    /// Executed checks in order; stops at the first failure.
    pub checks: Vec<CheckResult>,
}

impl VerificationResult {
    pub fn first_failure(&self) -> Option<&CheckResult> {
        self.checks.iter().find(|c| !c.passed())
    }

    pub fn passed_names(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|c| c.passed())
            .map(|c| c.name.clone())
            .collect()
    }
}

/// Result of the publish stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishResult {
    pub pr_url: String,
    /// False when an existing open change request was reused.
    pub created: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [RunStatus; 10] = [
        RunStatus::Queued,
        RunStatus::Cloning,
        RunStatus::Planning,
        RunStatus::Testing,
        RunStatus::Building,
        RunStatus::Verifying,
        RunStatus::Pushing,
        RunStatus::Done,
        RunStatus::Failed,
        RunStatus::Cancelled,
    ];

    #[test]
    fn test_status_round_trips_through_str() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_forward_transitions_are_valid() {
        use RunStatus::*;
        for (from, to) in [
            (Queued, Cloning),
            (Cloning, Planning),
            (Planning, Testing),
            (Testing, Building),
            (Building, Verifying),
            (Verifying, Pushing),
            (Pushing, Done),
        ] {
            assert!(is_valid_transition(from, to), "{} -> {}", from, to);
        }
    }

    #[test]
    fn test_retry_edge_is_valid() {
        assert!(is_valid_transition(RunStatus::Verifying, RunStatus::Building));
    }

    #[test]
    fn test_terminal_states_have_no_outgoing_edges() {
        for from in [RunStatus::Done, RunStatus::Failed, RunStatus::Cancelled] {
            for to in ALL {
                assert!(
                    !is_valid_transition(from, to),
                    "{} -> {} must be invalid",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_failed_unreachable_from_queued() {
        // The wall-clock budget starts at CLONING; a queued run can only be
        // started or cancelled.
        assert!(!is_valid_transition(RunStatus::Queued, RunStatus::Failed));
    }

    #[test]
    fn test_cancelled_reachable_from_every_non_terminal_state() {
        for from in ALL {
            assert_eq!(
                is_valid_transition(from, RunStatus::Cancelled),
                !from.is_terminal()
            );
        }
    }

    #[test]
    fn test_no_skipped_stages() {
        use RunStatus::*;
        assert!(!is_valid_transition(Queued, Building));
        assert!(!is_valid_transition(Cloning, Testing));
        assert!(!is_valid_transition(Building, Pushing));
        assert!(!is_valid_transition(Verifying, Done));
        // No reversed transitions either.
        assert!(!is_valid_transition(Building, Testing));
        assert!(!is_valid_transition(Pushing, Verifying));
    }

    #[test]
    fn test_failure_reason_round_trips() {
        for reason in [
            FailureReason::InfraError,
            FailureReason::GeneratorError,
            FailureReason::ScopeViolation,
            FailureReason::VerificationFailure,
            FailureReason::AgentTimeout,
            FailureReason::RunTimeout,
            FailureReason::PublishError,
        ] {
            assert_eq!(reason.as_str().parse::<FailureReason>().unwrap(), reason);
        }
    }

    #[test]
    fn test_verification_result_first_failure() {
        let result = VerificationResult {
            passed: false,
            checks: vec![
                CheckResult {
                    name: "test".into(),
                    command: "jest".into(),
                    exit_code: 0,
                    output: String::new(),
                },
                CheckResult {
                    name: "lint".into(),
                    command: "eslint .".into(),
                    exit_code: 1,
                    output: "3 problems".into(),
                },
            ],
        };
        assert_eq!(result.first_failure().unwrap().name, "lint");
        assert_eq!(result.passed_names(), vec!["test".to_string()]);
    }
}
