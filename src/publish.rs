//! Commit, push, and change-request creation.
//!
//! Runs only after verification passes. Committing and pushing are the
//! orchestrator's job, never the agent's, so what lands on the branch is
//! exactly the diff that was scope-checked and verified. Change requests go
//! through the `gh` CLI and are idempotent per branch: re-publishing updates
//! the existing open request instead of opening a second one.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};

use crate::errors::RunError;
use crate::models::{PublishResult, VerificationResult};
use crate::sandbox::{Sandbox, git};

const COMMIT_AUTHOR_NAME: &str = "autobuild";
const COMMIT_AUTHOR_EMAIL: &str = "autobuild@localhost";

#[derive(Clone)]
pub struct PublishStage {
    gh_cmd: String,
}

impl PublishStage {
    pub fn new(gh_cmd: String) -> Self {
        Self { gh_cmd }
    }

    /// Commit everything in the sandbox, push the branch, and ensure an open
    /// change request exists for it.
    pub async fn publish(
        &self,
        sandbox: &Sandbox,
        plan_text: &str,
        verification: &VerificationResult,
        files_changed: &[String],
        self_review: Option<&str>,
    ) -> Result<PublishResult, RunError> {
        let title = plan_title(plan_text);

        self.commit_all(&sandbox.path, &title)
            .await
            .map_err(|e| RunError::Publish(format!("{:#}", e)))?;

        git(&sandbox.path, &["push", "-u", "origin", &sandbox.branch_name])
            .await
            .map_err(|e| RunError::Publish(format!("{:#}", e)))?;

        let body = change_request_body(plan_text, verification, files_changed, self_review);
        if let Some(url) = self
            .existing_request_url(&sandbox.path, &sandbox.branch_name)
            .await
            .map_err(|e| RunError::Publish(format!("{:#}", e)))?
        {
            self.gh(
                &sandbox.path,
                &["pr", "edit", &sandbox.branch_name, "--body", &body],
            )
            .await
            .map_err(|e| RunError::Publish(format!("{:#}", e)))?;
            return Ok(PublishResult { pr_url: url, created: false });
        }

        let output = self
            .gh(
                &sandbox.path,
                &["pr", "create", "--title", &title, "--body", &body],
            )
            .await
            .map_err(|e| RunError::Publish(format!("{:#}", e)))?;
        let url = output
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| l.starts_with("http"))
            .ok_or_else(|| {
                RunError::Publish(format!("no URL in gh pr create output: {}", output.trim()))
            })?
            .to_string();
        Ok(PublishResult { pr_url: url, created: true })
    }

    /// Stage and commit the working tree. A tree with nothing to commit is
    /// fine; the branch may already carry the commit from a previous publish.
    async fn commit_all(&self, sandbox_path: &Path, title: &str) -> Result<()> {
        git(sandbox_path, &["add", "-A"]).await?;
        let staged = git(sandbox_path, &["status", "--porcelain"]).await?;
        if staged.trim().is_empty() {
            return Ok(());
        }
        git(
            sandbox_path,
            &[
                "-c",
                &format!("user.name={}", COMMIT_AUTHOR_NAME),
                "-c",
                &format!("user.email={}", COMMIT_AUTHOR_EMAIL),
                "commit",
                "-m",
                title,
            ],
        )
        .await?;
        Ok(())
    }

    /// URL of an existing open change request for the branch, if any.
    async fn existing_request_url(
        &self,
        sandbox_path: &Path,
        branch: &str,
    ) -> Result<Option<String>> {
        let output = self
            .gh(
                sandbox_path,
                &[
                    "pr", "list", "--head", branch, "--state", "open", "--json", "url",
                    "--jq", ".[0].url",
                ],
            )
            .await?;
        let url = output.trim();
        if url.is_empty() || url == "null" {
            Ok(None)
        } else {
            Ok(Some(url.to_string()))
        }
    }

    async fn gh(&self, cwd: &Path, args: &[&str]) -> Result<String> {
        let output = tokio::process::Command::new(&self.gh_cmd)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to run {} {}", self.gh_cmd, args.join(" ")))?;
        if !output.status.success() {
            anyhow::bail!(
                "{} {} failed: {}",
                self.gh_cmd,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Commit and change-request title: the first non-empty plan line, markdown
/// heading markers stripped.
pub fn plan_title(plan_text: &str) -> String {
    plan_text
        .lines()
        .map(|l| l.trim().trim_start_matches('#').trim())
        .find(|l| !l.is_empty())
        .unwrap_or("Automated feature implementation")
        .to_string()
}

pub fn change_request_body(
    plan_text: &str,
    verification: &VerificationResult,
    files_changed: &[String],
    self_review: Option<&str>,
) -> String {
    let mut body = String::from("## Summary\n\n");
    body.push_str(plan_text.trim());
    body.push_str("\n\n## Verification\n\n");
    if verification.checks.is_empty() {
        body.push_str("No checks declared in this repository.\n");
    } else {
        for check in &verification.checks {
            body.push_str(&format!(
                "- `{}`: {}\n",
                check.name,
                if check.passed() { "passed" } else { "failed" }
            ));
        }
    }
    body.push_str("\n## Files changed\n\n");
    for file in files_changed {
        body.push_str(&format!("- `{}`\n", file));
    }
    if let Some(review) = self_review {
        body.push_str("\n## Notes\n\n");
        body.push_str(review.trim());
        body.push('\n');
    }
    body.push_str("\n---\n*Opened automatically by autobuild.*\n");
    body
}
