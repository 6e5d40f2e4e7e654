//! End-to-end pipeline tests against a local git repository, a scripted
//! fake agent, and a fake `gh` CLI.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use autobuild::config::Settings;
use autobuild::generator::{GeneratedTests, PlanGenerator};
use autobuild::logstream::LogStream;
use autobuild::models::{
    ExecutionRun, FailureReason, FeatureDescriptor, RunStatus, SuggestionDescriptor, TestFile,
};
use autobuild::pipeline::{Pipeline, RunRequest};
use autobuild::sandbox::git;
use autobuild::store::{ExecutionStore, StoreHandle};

struct StubGenerator {
    test_files: Vec<TestFile>,
}

#[async_trait]
impl PlanGenerator for StubGenerator {
    async fn generate_plan(
        &self,
        feature: &FeatureDescriptor,
        _suggestion: &SuggestionDescriptor,
    ) -> Result<String> {
        Ok(format!("# Implement {}\n\n1. Write the code.\n", feature.name))
    }

    async fn generate_tests(
        &self,
        _feature: &FeatureDescriptor,
        _suggestion: &SuggestionDescriptor,
        _plan_text: &str,
    ) -> Result<GeneratedTests> {
        Ok(GeneratedTests {
            test_files: self.test_files.clone(),
            self_review: Some("Covers the main path.".to_string()),
        })
    }
}

struct Fixture {
    pipeline: Arc<Pipeline>,
    store: StoreHandle,
    upstream: PathBuf,
    sandbox_base: PathBuf,
    #[allow(dead_code)]
    dir: tempfile::TempDir,
}

/// Seed an upstream repo whose `test` script passes only once `impl.js`
/// exists (or per the given script).
async fn seed_upstream(dir: &Path, test_script: &str) -> PathBuf {
    let upstream = dir.join("upstream");
    tokio::fs::create_dir_all(&upstream).await.unwrap();
    git(&upstream, &["init", "--initial-branch=main"]).await.unwrap();
    git(&upstream, &["config", "user.email", "test@example.com"])
        .await
        .unwrap();
    git(&upstream, &["config", "user.name", "Test"]).await.unwrap();
    git(&upstream, &["config", "receive.denyCurrentBranch", "refuse"])
        .await
        .unwrap();
    let manifest = serde_json::json!({
        "name": "fixture",
        "scripts": { "test": test_script }
    });
    tokio::fs::write(upstream.join("package.json"), manifest.to_string())
        .await
        .unwrap();
    tokio::fs::write(upstream.join("app.js"), "// v1\n").await.unwrap();
    git(&upstream, &["add", "-A"]).await.unwrap();
    git(&upstream, &["commit", "-m", "initial"]).await.unwrap();
    upstream
}

async fn write_script(path: &Path, body: &str) {
    tokio::fs::write(path, format!("#!/bin/sh\n{}\n", body))
        .await
        .unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}

async fn fake_gh(dir: &Path) -> String {
    let path = dir.join("fake-gh.sh");
    write_script(
        &path,
        "case \"$1 $2\" in\n\
         \"pr list\") echo '' ;;\n\
         \"pr create\") echo 'https://example.com/pr/1' ;;\n\
         esac",
    )
    .await;
    path.to_string_lossy().to_string()
}

/// Build a fixture with the given agent script body and settings overrides.
async fn fixture(
    test_script: &str,
    agent_body: &str,
    test_files: Vec<TestFile>,
    tune: impl FnOnce(&mut Settings),
) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let upstream = seed_upstream(dir.path(), test_script).await;
    let agent_path = dir.path().join("fake-agent.sh");
    // The prompt is the last argument; log it for assertions.
    let body = format!(
        "echo \"$@\" >> {}/prompts.log\n{}",
        dir.path().display(),
        agent_body
    );
    write_script(&agent_path, &body).await;
    let gh = fake_gh(dir.path()).await;

    let sandbox_base = dir.path().join("sandboxes");
    let mut settings = Settings {
        sandbox_base_dir: sandbox_base.clone(),
        agent_cmd: agent_path.to_string_lossy().to_string(),
        gh_cmd: gh,
        agent_timeout_secs: 10,
        ..Settings::default()
    };
    tune(&mut settings);

    let store = StoreHandle::new(ExecutionStore::open_in_memory().unwrap());
    let logs = LogStream::new(store.clone());
    let pipeline = Arc::new(Pipeline::new(
        &settings,
        store.clone(),
        logs,
        Arc::new(StubGenerator { test_files }),
    ));
    Fixture {
        pipeline,
        store,
        upstream,
        sandbox_base,
        dir,
    }
}

fn request(fixture: &Fixture) -> RunRequest {
    RunRequest {
        repo_id: "repo-1".to_string(),
        repo_url: fixture.upstream.to_string_lossy().to_string(),
        feature: FeatureDescriptor {
            id: "f1".to_string(),
            name: "Add widget".to_string(),
            description: "Widgets for everyone".to_string(),
        },
        suggestion: SuggestionDescriptor {
            id: "s1".to_string(),
            name: "Basic widget".to_string(),
            rationale: "Simplest useful version".to_string(),
            complexity: "low".to_string(),
            test_cases: vec!["widget exists".to_string()],
        },
    }
}

async fn wait_terminal(store: &StoreHandle, run_id: &str, secs: u64) -> ExecutionRun {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    loop {
        let id = run_id.to_string();
        let run = store
            .call(move |s| s.get_run(&id))
            .await
            .unwrap()
            .expect("run exists");
        if run.status.is_terminal() {
            return run;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run {} stuck in {}",
            run_id,
            run.status
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn wait_status(store: &StoreHandle, run_id: &str, status: RunStatus, secs: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    loop {
        let id = run_id.to_string();
        let run = store
            .call(move |s| s.get_run(&id))
            .await
            .unwrap()
            .expect("run exists");
        if run.status == status {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run {} never reached {} (currently {})",
            run_id,
            status,
            run.status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn run_logs(store: &StoreHandle, run_id: &str) -> Vec<autobuild::models::ExecutionLog> {
    let id = run_id.to_string();
    store
        .call(move |s| s.logs_after(&id, 0, 10_000))
        .await
        .unwrap()
}

#[tokio::test]
async fn first_try_success_publishes_change_request() {
    let fx = fixture(
        "test -f impl.js",
        "echo 'implemented' > impl.js",
        vec![TestFile {
            path: "tests/widget.test.js".to_string(),
            content: "// generated test\n".to_string(),
        }],
        |_| {},
    )
    .await;

    let run = fx.pipeline.clone().start(request(&fx)).await.unwrap();
    let done = wait_terminal(&fx.store, &run.id, 20).await;

    assert_eq!(done.status, RunStatus::Done);
    assert_eq!(done.iteration_count, 1);
    assert_eq!(done.pr_url.as_deref(), Some("https://example.com/pr/1"));
    // Plan.md and the generated test are orchestrator-written; only the
    // agent's file counts.
    assert_eq!(done.files_changed, 1);
    assert!(done.failure_reason.is_none());

    // The branch with the commit reached the upstream.
    let branch = done.branch_name.unwrap();
    let refs = git(&fx.upstream, &["branch", "--list"]).await.unwrap();
    assert!(refs.contains(&branch));

    // Sandbox released after success.
    assert!(!fx.sandbox_base.join(&run.id).exists());

    // Log sequence is gapless from 1.
    let logs = run_logs(&fx.store, &run.id).await;
    for (i, log) in logs.iter().enumerate() {
        assert_eq!(log.seq, i as i64 + 1);
    }
}

#[tokio::test]
async fn failing_verification_retries_with_fix_prompt_and_succeeds() {
    // The agent misbehaves on the first attempt and complies on the second.
    let fx = fixture(
        "test -f impl.js",
        "if [ -f attempted.marker ]; then echo ok > impl.js; else touch attempted.marker; fi",
        vec![],
        |_| {},
    )
    .await;

    let run = fx.pipeline.clone().start(request(&fx)).await.unwrap();
    let done = wait_terminal(&fx.store, &run.id, 20).await;

    assert_eq!(done.status, RunStatus::Done);
    assert_eq!(done.iteration_count, 2);

    // The second prompt carried the failing check's output.
    let prompts = tokio::fs::read_to_string(fx.dir.path().join("prompts.log"))
        .await
        .unwrap();
    assert!(prompts.contains("failed verification"));
    assert!(prompts.contains("test -f impl.js"));
}

#[tokio::test]
async fn agent_nonzero_exit_still_verifies_and_succeeds() {
    // The agent writes the implementation but exits non-zero; the run is
    // judged by scope and the declared checks, not the exit code.
    let fx = fixture("test -f impl.js", "echo ok > impl.js\nexit 1", vec![], |_| {}).await;

    let run = fx.pipeline.clone().start(request(&fx)).await.unwrap();
    let done = wait_terminal(&fx.store, &run.id, 20).await;

    assert_eq!(done.status, RunStatus::Done);
    assert_eq!(done.iteration_count, 1);
    assert_eq!(done.files_changed, 1);

    // The exit was still surfaced in the run log.
    let logs = run_logs(&fx.store, &run.id).await;
    assert!(logs.iter().any(|l| l.message.contains("agent exited")));
}

#[tokio::test]
async fn iteration_cap_exhaustion_fails_with_verification_failure() {
    let fx = fixture("exit 1", "echo noop > noop.js", vec![], |_| {}).await;

    let run = fx.pipeline.clone().start(request(&fx)).await.unwrap();
    let done = wait_terminal(&fx.store, &run.id, 20).await;

    assert_eq!(done.status, RunStatus::Failed);
    assert_eq!(done.failure_reason, Some(FailureReason::VerificationFailure));
    // Default cap is 2, inclusive.
    assert_eq!(done.iteration_count, 2);
}

#[tokio::test]
async fn scope_violation_is_fatal_and_skips_verification() {
    let fx = fixture(
        "true",
        "echo 'SECRET=1' > .env.local\necho ok > impl.js",
        vec![],
        |_| {},
    )
    .await;

    let run = fx.pipeline.clone().start(request(&fx)).await.unwrap();
    let done = wait_terminal(&fx.store, &run.id, 20).await;

    assert_eq!(done.status, RunStatus::Failed);
    assert_eq!(done.failure_reason, Some(FailureReason::ScopeViolation));
    assert!(done.failure_message.unwrap().contains(".env.local"));
    // Despite remaining iteration budget, no retry and no verification.
    assert_eq!(done.iteration_count, 1);
    let logs = run_logs(&fx.store, &run.id).await;
    assert!(logs.iter().all(|l| l.step != "verifying"));
}

#[tokio::test]
async fn too_many_files_is_a_scope_violation() {
    let fx = fixture(
        "true",
        "i=0; while [ $i -lt 30 ]; do echo x > \"gen_$i.js\"; i=$((i+1)); done",
        vec![],
        |_| {},
    )
    .await;

    let run = fx.pipeline.clone().start(request(&fx)).await.unwrap();
    let done = wait_terminal(&fx.store, &run.id, 20).await;

    assert_eq!(done.failure_reason, Some(FailureReason::ScopeViolation));
    assert!(done.failure_message.unwrap().contains("30"));
}

#[tokio::test]
async fn cancel_mid_build_releases_sandbox_and_sticks() {
    let fx = fixture("true", "sleep 30", vec![], |s| {
        s.agent_timeout_secs = 60;
    })
    .await;

    let run = fx.pipeline.clone().start(request(&fx)).await.unwrap();
    wait_status(&fx.store, &run.id, RunStatus::Building, 10).await;
    // Give the agent process a moment to actually spawn.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let cancelled = fx.pipeline.cancel(&run.id).await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);

    // The worker notices and never overwrites the terminal state.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let after = wait_terminal(&fx.store, &run.id, 5).await;
    assert_eq!(after.status, RunStatus::Cancelled);
    assert!(!fx.sandbox_base.join(&run.id).exists());
}

#[tokio::test]
async fn cancel_during_verification_sticks_without_change_request() {
    // The test check runs long enough for the cancel to land mid-VERIFYING.
    let fx = fixture("sleep 3", "echo ok > impl.js", vec![], |_| {}).await;

    let run = fx.pipeline.clone().start(request(&fx)).await.unwrap();
    wait_status(&fx.store, &run.id, RunStatus::Verifying, 10).await;

    let cancelled = fx.pipeline.cancel(&run.id).await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);
    assert!(!fx.sandbox_base.join(&run.id).exists());

    // The worker finishes the in-flight check, notices the terminal state,
    // and stops: no publish, no change request, status untouched.
    tokio::time::sleep(Duration::from_secs(4)).await;
    let after = wait_terminal(&fx.store, &run.id, 5).await;
    assert_eq!(after.status, RunStatus::Cancelled);
    assert!(after.pr_url.is_none());
    let logs = run_logs(&fx.store, &run.id).await;
    assert!(logs.iter().all(|l| l.step != "push"));
}

#[tokio::test]
async fn agent_timeout_on_final_iteration_fails_run() {
    let fx = fixture("true", "sleep 30", vec![], |s| {
        s.agent_timeout_secs = 1;
        s.max_iterations = 1;
    })
    .await;

    let run = fx.pipeline.clone().start(request(&fx)).await.unwrap();
    let done = wait_terminal(&fx.store, &run.id, 20).await;

    assert_eq!(done.status, RunStatus::Failed);
    assert_eq!(done.failure_reason, Some(FailureReason::AgentTimeout));
}

#[tokio::test]
async fn agent_timeout_retries_when_budget_remains() {
    // First attempt hangs past the timeout; second completes.
    let fx = fixture(
        "test -f impl.js",
        "if [ -f attempted.marker ]; then echo ok > impl.js; else touch attempted.marker; sleep 30; fi",
        vec![],
        |s| {
            s.agent_timeout_secs = 1;
        },
    )
    .await;

    let run = fx.pipeline.clone().start(request(&fx)).await.unwrap();
    let done = wait_terminal(&fx.store, &run.id, 30).await;

    assert_eq!(done.status, RunStatus::Done);
    assert_eq!(done.iteration_count, 2);
}

#[tokio::test]
async fn run_budget_expiry_fails_with_run_timeout() {
    let fx = fixture("true", "sleep 30", vec![], |s| {
        s.agent_timeout_secs = 60;
        s.run_budget_secs = 2;
    })
    .await;

    let run = fx.pipeline.clone().start(request(&fx)).await.unwrap();
    let done = wait_terminal(&fx.store, &run.id, 20).await;

    assert_eq!(done.status, RunStatus::Failed);
    assert_eq!(done.failure_reason, Some(FailureReason::RunTimeout));
}

#[tokio::test]
async fn concurrent_runs_get_disjoint_sandboxes_and_sequences() {
    let fx = fixture("test -f impl.js", "echo ok > impl.js", vec![], |_| {}).await;

    let a = fx.pipeline.clone().start(request(&fx)).await.unwrap();
    let b = fx.pipeline.clone().start(request(&fx)).await.unwrap();
    let a_done = wait_terminal(&fx.store, &a.id, 30).await;
    let b_done = wait_terminal(&fx.store, &b.id, 30).await;

    assert_eq!(a_done.status, RunStatus::Done);
    assert_eq!(b_done.status, RunStatus::Done);
    assert_ne!(a_done.sandbox_path, b_done.sandbox_path);
    assert_ne!(a_done.branch_name, b_done.branch_name);

    // Each run's log sequence is independent and gapless.
    for id in [&a.id, &b.id] {
        let logs = run_logs(&fx.store, id).await;
        assert!(!logs.is_empty());
        for (i, log) in logs.iter().enumerate() {
            assert_eq!(log.seq, i as i64 + 1);
        }
    }
}

#[tokio::test]
async fn generator_failure_fails_run_without_retry() {
    struct FailingGenerator;

    #[async_trait]
    impl PlanGenerator for FailingGenerator {
        async fn generate_plan(
            &self,
            _feature: &FeatureDescriptor,
            _suggestion: &SuggestionDescriptor,
        ) -> Result<String> {
            anyhow::bail!("model unavailable")
        }

        async fn generate_tests(
            &self,
            _feature: &FeatureDescriptor,
            _suggestion: &SuggestionDescriptor,
            _plan_text: &str,
        ) -> Result<GeneratedTests> {
            unreachable!("tests are not generated when the plan fails")
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let upstream = seed_upstream(dir.path(), "true").await;
    let settings = Settings {
        sandbox_base_dir: dir.path().join("sandboxes"),
        ..Settings::default()
    };
    let store = StoreHandle::new(ExecutionStore::open_in_memory().unwrap());
    let logs = LogStream::new(store.clone());
    let pipeline = Arc::new(Pipeline::new(
        &settings,
        store.clone(),
        logs,
        Arc::new(FailingGenerator),
    ));

    let run = pipeline
        .start(RunRequest {
            repo_id: "r".to_string(),
            repo_url: upstream.to_string_lossy().to_string(),
            feature: FeatureDescriptor {
                id: "f".to_string(),
                name: "feat".to_string(),
                description: String::new(),
            },
            suggestion: SuggestionDescriptor {
                id: "s".to_string(),
                name: "sugg".to_string(),
                rationale: String::new(),
                complexity: String::new(),
                test_cases: vec![],
            },
        })
        .await
        .unwrap();
    let done = wait_terminal(&store, &run.id, 20).await;

    assert_eq!(done.status, RunStatus::Failed);
    assert_eq!(done.failure_reason, Some(FailureReason::GeneratorError));
    assert!(done.failure_message.unwrap().contains("model unavailable"));
    assert_eq!(done.iteration_count, 0);
}
