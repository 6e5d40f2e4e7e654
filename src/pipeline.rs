//! Run lifecycle: the state machine that drives one suggestion from QUEUED
//! to DONE.
//!
//! One tokio task owns a run end to end. All status writes go through the
//! store's transition check, so a run that was cancelled under a worker
//! surfaces as an invalid transition at the worker's next step; the worker
//! then stops without overwriting the terminal state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::AgentInvoker;
use crate::config::Settings;
use crate::errors::{RunError, StoreError};
use crate::generator::PlanGenerator;
use crate::logstream::LogStream;
use crate::models::{
    ExecutionRun, FeatureDescriptor, RunStatus, SuggestionDescriptor, VerificationResult,
};
use crate::publish::PublishStage;
use crate::sandbox::{Sandbox, SandboxManager};
use crate::scope::ScopePolicy;
use crate::store::StoreHandle;
use crate::verify::{VerificationRunner, fix_prompt};

/// Everything needed to start a run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub repo_id: String,
    pub repo_url: String,
    pub feature: FeatureDescriptor,
    pub suggestion: SuggestionDescriptor,
}

/// Why a worker stopped before DONE.
enum StageError {
    /// The run reached a terminal state through someone else (cancel or a
    /// racing failure); stop quietly.
    Superseded,
    Run(RunError),
}

impl From<RunError> for StageError {
    fn from(err: RunError) -> Self {
        Self::Run(err)
    }
}

pub struct Pipeline {
    store: StoreHandle,
    logs: LogStream,
    sandboxes: SandboxManager,
    scope: ScopePolicy,
    invoker: AgentInvoker,
    verifier: VerificationRunner,
    publisher: PublishStage,
    generator: Arc<dyn PlanGenerator>,
    max_iterations: u32,
    run_budget: Duration,
}

impl Pipeline {
    pub fn new(
        settings: &Settings,
        store: StoreHandle,
        logs: LogStream,
        generator: Arc<dyn PlanGenerator>,
    ) -> Self {
        Self {
            store,
            logs,
            sandboxes: SandboxManager::new(
                settings.sandbox_base_dir.clone(),
                settings.retain_failed_sandboxes,
            ),
            scope: ScopePolicy::from_settings(settings),
            invoker: AgentInvoker::new(
                settings.agent_cmd.clone(),
                settings.agent_timeout_secs,
                settings.max_concurrent_agents,
            ),
            verifier: VerificationRunner::new(settings.check_timeout_secs),
            publisher: PublishStage::new(settings.gh_cmd.clone()),
            generator,
            max_iterations: settings.max_iterations.max(1),
            run_budget: Duration::from_secs(settings.run_budget_secs),
        }
    }

    pub fn sandboxes(&self) -> &SandboxManager {
        &self.sandboxes
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn logs(&self) -> &LogStream {
        &self.logs
    }

    /// Create a QUEUED run and spawn its worker.
    pub async fn start(self: Arc<Self>, request: RunRequest) -> anyhow::Result<ExecutionRun> {
        let repo_id = request.repo_id.clone();
        let feature_id = request.feature.id.clone();
        let suggestion_id = request.suggestion.id.clone();
        let run = self
            .store
            .call(move |s| s.create_run(&repo_id, &feature_id, &suggestion_id))
            .await?;

        let pipeline = self.clone();
        let run_id = run.id.clone();
        tokio::spawn(async move {
            pipeline.execute(run_id, request).await;
        });
        Ok(run)
    }

    /// Cancel a run. Valid from any non-terminal state; kills the live agent
    /// and always releases the sandbox.
    pub async fn cancel(&self, run_id: &str) -> Result<ExecutionRun, StoreError> {
        let id = run_id.to_string();
        let run = self
            .store
            .call(move |s| Ok(s.transition(&id, RunStatus::Cancelled)))
            .await
            .map_err(StoreError::Other)??;

        self.invoker.kill(run_id).await;
        if let Some(path) = &run.sandbox_path {
            if let Err(e) = self.sandboxes.release(&PathBuf::from(path)).await {
                tracing::warn!("failed to release sandbox for {}: {:#}", run_id, e);
            }
        }
        self.logs.info(run_id, "cancel", "run cancelled").await;
        self.logs.status(run_id, RunStatus::Cancelled);
        self.logs.finished(run.clone());
        Ok(run)
    }

    /// Worker entry point: drive the run under the wall-clock budget and
    /// translate the outcome into a terminal state.
    async fn execute(self: Arc<Self>, run_id: String, request: RunRequest) {
        let mut sandbox_path: Option<PathBuf> = None;
        let driven = tokio::time::timeout(
            self.run_budget,
            self.drive(&run_id, &request, &mut sandbox_path),
        )
        .await;

        let outcome = match driven {
            Ok(outcome) => outcome,
            Err(_) => {
                self.invoker.kill(&run_id).await;
                Err(StageError::Run(RunError::RunTimeout {
                    budget_secs: self.run_budget.as_secs(),
                }))
            }
        };

        match outcome {
            Ok(()) => {}
            Err(StageError::Superseded) => {
                tracing::info!("run {} reached a terminal state elsewhere; worker stopping", run_id);
            }
            Err(StageError::Run(err)) => {
                self.finish_failed(&run_id, sandbox_path.as_deref(), err).await;
            }
        }
    }

    async fn finish_failed(&self, run_id: &str, sandbox_path: Option<&std::path::Path>, err: RunError) {
        self.logs.error(run_id, "failed", &err.to_string()).await;
        let id = run_id.to_string();
        let reason = err.reason();
        let message = err.to_string();
        let failed = self
            .store
            .call(move |s| Ok(s.fail_run(&id, reason, &message)))
            .await;
        match failed {
            Ok(Ok(run)) => {
                self.logs.status(run_id, RunStatus::Failed);
                self.logs.finished(run);
            }
            // Cancel won the race; the terminal state stands.
            Ok(Err(StoreError::InvalidTransition { .. })) => return,
            Ok(Err(e)) => tracing::error!("failed to record failure for {}: {}", run_id, e),
            Err(e) => tracing::error!("failed to record failure for {}: {:#}", run_id, e),
        }
        if let Some(path) = sandbox_path {
            if let Err(e) = self.sandboxes.release_failed(path).await {
                tracing::warn!("failed to release sandbox for {}: {:#}", run_id, e);
            }
        }
    }

    /// The happy path plus retries. Any error return is mapped to FAILED by
    /// the caller; `Superseded` means another writer already ended the run.
    async fn drive(
        &self,
        run_id: &str,
        request: &RunRequest,
        sandbox_path: &mut Option<PathBuf>,
    ) -> Result<(), StageError> {
        self.transition(run_id, RunStatus::Cloning).await?;
        self.logs
            .info(run_id, "clone", &format!("cloning {}", request.repo_url))
            .await;
        let sandbox = self
            .sandboxes
            .acquire(run_id, &request.repo_url, &request.feature.name)
            .await?;
        *sandbox_path = Some(sandbox.path.clone());
        {
            let id = run_id.to_string();
            let path = sandbox.path.to_string_lossy().to_string();
            let branch = sandbox.branch_name.clone();
            self.store
                .call(move |s| s.set_sandbox(&id, &path, &branch))
                .await
                .map_err(|e| RunError::infra("clone", e))?;
        }
        self.logs
            .info(
                run_id,
                "clone",
                &format!("sandbox ready on branch {}", sandbox.branch_name),
            )
            .await;

        self.transition(run_id, RunStatus::Planning).await?;
        self.logs.info(run_id, "plan", "generating implementation plan").await;
        let plan_text = self
            .generator
            .generate_plan(&request.feature, &request.suggestion)
            .await
            .map_err(|e| RunError::Generator(format!("{:#}", e)))?;

        self.transition(run_id, RunStatus::Testing).await?;
        self.logs.info(run_id, "tests", "generating test files").await;
        let tests = self
            .generator
            .generate_tests(&request.feature, &request.suggestion, &plan_text)
            .await
            .map_err(|e| RunError::Generator(format!("{:#}", e)))?;
        let written = self
            .sandboxes
            .write_plan_files(&sandbox, &plan_text, &tests.test_files)
            .await?;
        self.logs
            .info(
                run_id,
                "tests",
                &format!("wrote plan and {} test file(s)", tests.test_files.len()),
            )
            .await;

        let (files_changed, verification) = self
            .build_loop(run_id, &sandbox, &plan_text, &written)
            .await?;

        self.transition(run_id, RunStatus::Pushing).await?;
        self.logs.info(run_id, "push", "publishing branch").await;
        let published = self
            .publisher
            .publish(
                &sandbox,
                &plan_text,
                &verification,
                &files_changed,
                tests.self_review.as_deref(),
            )
            .await?;
        self.logs
            .info(
                run_id,
                "push",
                &format!(
                    "change request {}: {}",
                    if published.created { "opened" } else { "updated" },
                    published.pr_url
                ),
            )
            .await;

        // The URL lands in the same store call as the DONE transition, so a
        // cancel racing the publish never leaves a URL on a cancelled run.
        let run = {
            let id = run_id.to_string();
            let url = published.pr_url.clone();
            let result = self
                .store
                .call(move |s| Ok(s.complete_run(&id, &url)))
                .await
                .map_err(|e| StageError::Run(RunError::infra("push", e)))?;
            match result {
                Ok(run) => {
                    self.logs.status(run_id, RunStatus::Done);
                    run
                }
                Err(StoreError::InvalidTransition { from, .. }) if from.is_terminal() => {
                    return Err(StageError::Superseded);
                }
                Err(e) => return Err(StageError::Run(RunError::infra("push", e))),
            }
        };
        self.logs.info(run_id, "done", "run complete").await;
        self.logs.finished(run);
        if let Err(e) = self.sandboxes.release(&sandbox.path).await {
            tracing::warn!("failed to release sandbox for {}: {:#}", run_id, e);
        }
        Ok(())
    }

    /// BUILDING/VERIFYING loop. Returns the final changed-file set and the
    /// passing verification result.
    async fn build_loop(
        &self,
        run_id: &str,
        sandbox: &Sandbox,
        plan_text: &str,
        written_paths: &[String],
    ) -> Result<(Vec<String>, VerificationResult), StageError> {
        let mut iteration: u32 = 1;
        let mut fix: Option<String> = None;
        // First entry comes from TESTING; retries come back from VERIFYING.
        // An agent timeout retries without leaving BUILDING.
        let mut in_building = false;

        loop {
            if !in_building {
                self.transition(run_id, RunStatus::Building).await?;
                in_building = true;
            }
            {
                let id = run_id.to_string();
                self.store
                    .call(move |s| s.set_iteration(&id, iteration))
                    .await
                    .map_err(|e| RunError::infra("build", e))?;
            }
            self.logs
                .info(
                    run_id,
                    "building",
                    &format!("build attempt {} of {}", iteration, self.max_iterations),
                )
                .await;

            let prompt = build_prompt(plan_text, written_paths, &self.scope, fix.as_deref());
            let outcome = match self
                .invoker
                .invoke(sandbox, &prompt, written_paths, &self.logs)
                .await
            {
                Ok(outcome) => outcome,
                Err(RunError::AgentTimeout { timeout_secs }) => {
                    if iteration >= self.max_iterations {
                        return Err(RunError::AgentTimeout { timeout_secs }.into());
                    }
                    self.logs
                        .warn(
                            run_id,
                            "building",
                            &format!("agent timed out after {}s; retrying", timeout_secs),
                        )
                        .await;
                    iteration += 1;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            {
                let id = run_id.to_string();
                let count = outcome.files_changed.len();
                self.store
                    .call(move |s| s.set_files_changed(&id, count))
                    .await
                    .map_err(|e| RunError::infra("build", e))?;
            }
            self.logs
                .info(
                    run_id,
                    "building",
                    &format!("agent changed {} file(s)", outcome.files_changed.len()),
                )
                .await;

            // Scope is checked before VERIFYING ever starts; a violation is
            // fatal regardless of remaining iterations.
            if let Err(violation) = self.scope.evaluate(&outcome.files_changed) {
                return Err(RunError::from(violation).into());
            }

            self.transition(run_id, RunStatus::Verifying).await?;
            in_building = false;
            let verification = self
                .verifier
                .run(run_id, &sandbox.path, &self.logs)
                .await
                .map_err(|e| RunError::infra("verify", e))?;

            if verification.passed {
                return Ok((outcome.files_changed, verification));
            }
            if iteration >= self.max_iterations {
                let failure = verification
                    .first_failure()
                    .cloned()
                    .ok_or_else(|| RunError::infra("verify", "failed with no failing check"))?;
                return Err(RunError::Verification {
                    check: failure.name,
                    exit_code: failure.exit_code,
                    output: failure.output,
                }
                .into());
            }

            fix = fix_prompt(&verification);
            iteration += 1;
            self.logs
                .warn(run_id, "verifying", "verification failed; retrying build")
                .await;
        }
    }

    /// Apply a status transition, broadcasting on success. An invalid
    /// transition out of a terminal state means the run ended elsewhere.
    async fn transition(&self, run_id: &str, to: RunStatus) -> Result<ExecutionRun, StageError> {
        let id = run_id.to_string();
        let result = self
            .store
            .call(move |s| Ok(s.transition(&id, to)))
            .await
            .map_err(|e| StageError::Run(RunError::infra("state", e)))?;
        match result {
            Ok(run) => {
                self.logs.status(run_id, to);
                Ok(run)
            }
            Err(StoreError::InvalidTransition { from, .. }) if from.is_terminal() => {
                Err(StageError::Superseded)
            }
            Err(e) => Err(StageError::Run(RunError::infra("state", e))),
        }
    }
}

/// Assemble the agent prompt for one build attempt.
fn build_prompt(
    plan_text: &str,
    written_paths: &[String],
    scope: &ScopePolicy,
    fix: Option<&str>,
) -> String {
    let test_paths: Vec<&str> = written_paths
        .iter()
        .filter(|p| p.as_str() != "Plan.md")
        .map(String::as_str)
        .collect();
    let mut prompt = format!(
        "Implement the feature described in Plan.md at the repository root.\n\n\
         Plan:\n{}\n\n",
        plan_text.trim()
    );
    if test_paths.is_empty() {
        prompt.push_str("There are no pre-written test files for this change.\n\n");
    } else {
        prompt.push_str(&format!(
            "Make the following pre-written test files pass without modifying them:\n{}\n\n",
            test_paths
                .iter()
                .map(|p| format!("- {}", p))
                .collect::<Vec<_>>()
                .join("\n")
        ));
    }
    prompt.push_str(&scope.prompt_text());
    if let Some(fix) = fix {
        prompt.push_str("\n\n");
        prompt.push_str(fix);
    }
    prompt
}
