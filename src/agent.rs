//! Headless agent subprocess supervision.
//!
//! One invocation per BUILDING attempt: spawn the agent in the sandbox with
//! the build prompt, stream its stdout into the run log, enforce the
//! per-invocation timeout, then account for what it changed with git. The
//! agent writes files only; committing and pushing stay with the
//! orchestrator.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, Semaphore};

use crate::errors::RunError;
use crate::logstream::LogStream;
use crate::sandbox::{Sandbox, git};
use crate::stream::render_line;

/// Outcome of one successful agent invocation.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    /// Paths changed relative to the sandbox root, orchestrator-written
    /// files excluded. Includes untracked files the agent created.
    pub files_changed: Vec<String>,
}

#[derive(Clone)]
pub struct AgentInvoker {
    agent_cmd: String,
    timeout: Duration,
    /// Caps concurrent agent subprocesses across all runs.
    permits: Arc<Semaphore>,
    /// Live child pids by run id, for forced cancellation.
    running: Arc<Mutex<HashMap<String, u32>>>,
}

impl AgentInvoker {
    pub fn new(agent_cmd: String, timeout_secs: u64, max_concurrent: usize) -> Self {
        Self {
            agent_cmd,
            timeout: Duration::from_secs(timeout_secs),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run one build attempt in the sandbox. Returns the changed-file set;
    /// the caller evaluates scope on it. The agent's exit code does not fail
    /// the attempt, only spawn failures and timeouts do.
    pub async fn invoke(
        &self,
        sandbox: &Sandbox,
        prompt: &str,
        excluded_paths: &[String],
        logs: &LogStream,
    ) -> Result<AgentOutcome, RunError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| RunError::infra("build", e))?;

        let mut cmd = Command::new(&self.agent_cmd);
        cmd.args([
            "--print",
            "--dangerously-skip-permissions",
            "--output-format",
            "stream-json",
            "--verbose",
            "-p",
            prompt,
        ])
        .current_dir(&sandbox.path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
        // Own process group so a timeout or cancel takes the agent's
        // children down with it.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| RunError::infra("build", format!("failed to spawn agent: {}", e)))?;

        let pid = child.id();
        if let Some(pid) = pid {
            self.running.lock().await.insert(sandbox.run_id.clone(), pid);
        }

        let result = self.supervise(&mut child, &sandbox.run_id, logs).await;
        self.running.lock().await.remove(&sandbox.run_id);
        result?;

        let files_changed = changed_files(sandbox, excluded_paths)
            .await
            .map_err(|e| RunError::infra("build", e))?;
        Ok(AgentOutcome { files_changed })
    }

    /// Stream output and wait for exit, enforcing the timeout.
    async fn supervise(
        &self,
        child: &mut Child,
        run_id: &str,
        logs: &LogStream,
    ) -> Result<(), RunError> {
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_task = {
            let logs = logs.clone();
            let run_id = run_id.to_string();
            tokio::spawn(async move {
                if let Some(stdout) = stdout {
                    let mut lines = BufReader::new(stdout).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        for message in render_line(&line) {
                            logs.info(&run_id, "building", &message).await;
                        }
                    }
                }
            })
        };
        let stderr_task = {
            let logs = logs.clone();
            let run_id = run_id.to_string();
            tokio::spawn(async move {
                if let Some(stderr) = stderr {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        if !line.trim().is_empty() {
                            logs.warn(&run_id, "building", line.trim()).await;
                        }
                    }
                }
            })
        };

        let pid = child.id();
        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(RunError::infra("build", e)),
            Err(_) => {
                if let Some(pid) = pid {
                    kill_group(pid);
                }
                let _ = child.wait().await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(RunError::AgentTimeout {
                    timeout_secs: self.timeout.as_secs(),
                });
            }
        };

        // Drain whatever output is still buffered.
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        // A non-zero exit is not fatal: the agent's work is judged by the
        // filesystem diff, scope, and the declared checks, not its exit code.
        if !status.success() {
            logs.warn(run_id, "building", &format!("agent exited with {}", status))
                .await;
        }
        Ok(())
    }

    /// Kill the live agent for a run, if any. Used by cancellation.
    pub async fn kill(&self, run_id: &str) {
        if let Some(pid) = self.running.lock().await.remove(run_id) {
            kill_group(pid);
        }
    }

    pub async fn kill_all(&self) {
        let pids: Vec<u32> = self.running.lock().await.drain().map(|(_, pid)| pid).collect();
        for pid in pids {
            kill_group(pid);
        }
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    unsafe {
        libc::kill(-(pid as i32), libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

/// Changed-file set for the sandbox: tracked files that differ from the base
/// commit plus untracked files, minus orchestrator-written paths.
pub async fn changed_files(
    sandbox: &Sandbox,
    excluded_paths: &[String],
) -> anyhow::Result<Vec<String>> {
    let diff = git(
        &sandbox.path,
        &["diff", "--name-only", &sandbox.base_commit],
    )
    .await?;
    let untracked = git(
        &sandbox.path,
        &["ls-files", "--others", "--exclude-standard"],
    )
    .await?;

    let mut files: Vec<String> = diff
        .lines()
        .chain(untracked.lines())
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .filter(|path| !excluded_paths.contains(path))
        .collect();
    files.sort();
    files.dedup();
    Ok(files)
}
