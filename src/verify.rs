//! Declared-check verification.
//!
//! Checks come from the sandbox's `package.json` scripts table and run in a
//! fixed order: `test`, then `lint`, then `typecheck`. A missing script is
//! skipped, a missing manifest skips everything, and the first failing check
//! stops the pass. Correctness here means exactly "the declared commands
//! exit zero", nothing deeper.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::logstream::LogStream;
use crate::models::{CheckResult, VerificationResult};
use crate::stream::truncate;

/// Check names in execution order.
pub const CHECK_ORDER: [&str; 3] = ["test", "lint", "typecheck"];

/// Cap on captured output per check.
const OUTPUT_CAP: usize = 4096;

/// Exit code reported for a check that hit its timeout.
const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Deserialize)]
struct PackageManifest {
    #[serde(default)]
    scripts: std::collections::HashMap<String, String>,
}

#[derive(Clone)]
pub struct VerificationRunner {
    check_timeout: Duration,
}

impl VerificationRunner {
    pub fn new(check_timeout_secs: u64) -> Self {
        Self {
            check_timeout: Duration::from_secs(check_timeout_secs),
        }
    }

    /// Checks declared by the sandbox, in execution order. `None` when there
    /// is no manifest at all.
    pub fn detect_checks(sandbox_path: &Path) -> Result<Option<Vec<(String, String)>>> {
        let manifest_path = sandbox_path.join("package.json");
        if !manifest_path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&manifest_path)
            .with_context(|| format!("Failed to read {}", manifest_path.display()))?;
        let manifest: PackageManifest =
            serde_json::from_str(&content).context("Failed to parse package.json")?;
        let checks = CHECK_ORDER
            .iter()
            .filter_map(|name| {
                manifest
                    .scripts
                    .get(*name)
                    .map(|command| (name.to_string(), command.clone()))
            })
            .collect();
        Ok(Some(checks))
    }

    /// Run the declared checks, logging each start and outcome at step
    /// `verifying`, stopping at the first failure.
    pub async fn run(
        &self,
        run_id: &str,
        sandbox_path: &Path,
        logs: &LogStream,
    ) -> Result<VerificationResult> {
        let Some(checks) = Self::detect_checks(sandbox_path)? else {
            logs.info(run_id, "verifying", "no package.json; nothing to verify")
                .await;
            return Ok(VerificationResult {
                passed: true,
                checks: Vec::new(),
            });
        };
        if checks.is_empty() {
            logs.info(run_id, "verifying", "no test/lint/typecheck scripts declared")
                .await;
            return Ok(VerificationResult {
                passed: true,
                checks: Vec::new(),
            });
        }

        let mut results = Vec::new();
        for (name, command) in checks {
            logs.info(run_id, "verifying", &format!("running check '{}'", name))
                .await;
            let result = self.run_check(&name, &command, sandbox_path).await?;
            let passed = result.passed();
            if passed {
                logs.info(run_id, "verifying", &format!("check '{}' passed", name))
                    .await;
            } else {
                logs.error(
                    run_id,
                    "verifying",
                    &format!(
                        "check '{}' failed (exit {}): {}",
                        name,
                        result.exit_code,
                        truncate(&result.output, 500)
                    ),
                )
                .await;
            }
            results.push(result);
            if !passed {
                return Ok(VerificationResult {
                    passed: false,
                    checks: results,
                });
            }
        }
        Ok(VerificationResult {
            passed: true,
            checks: results,
        })
    }

    async fn run_check(
        &self,
        name: &str,
        command: &str,
        sandbox_path: &Path,
    ) -> Result<CheckResult> {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.args(["-c", command])
            .current_dir(sandbox_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn check '{}'", name))?;

        let output = match tokio::time::timeout(self.check_timeout, child.wait_with_output()).await
        {
            Ok(output) => output.with_context(|| format!("Failed to run check '{}'", name))?,
            Err(_) => {
                // Dropping the wait future kills the child via kill_on_drop.
                return Ok(CheckResult {
                    name: name.to_string(),
                    command: command.to_string(),
                    exit_code: TIMEOUT_EXIT_CODE,
                    output: format!(
                        "check timed out after {}s",
                        self.check_timeout.as_secs()
                    ),
                });
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(stderr.trim_end());
        }
        Ok(CheckResult {
            name: name.to_string(),
            command: command.to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            output: truncate(&combined, OUTPUT_CAP),
        })
    }
}

/// Build the fix prompt for the next build attempt from the first failing
/// check.
pub fn fix_prompt(result: &VerificationResult) -> Option<String> {
    let failure = result.first_failure()?;
    Some(format!(
        "The previous attempt failed verification. Check '{}' (command: {}) \
         exited with code {}. Output:\n\n{}\n\nFix the underlying problem so \
         this check passes, then re-run it locally to confirm.",
        failure.name,
        failure.command,
        failure.exit_code,
        truncate(&failure.output, 2000)
    ))
}
