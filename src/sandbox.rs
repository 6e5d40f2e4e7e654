//! Per-run isolated git workspaces.
//!
//! Every run gets its own clone under `<base>/<run_id>`, so concurrent runs
//! never share a working tree. The sandbox records the commit the clone
//! started from; the diff against that commit is what scope evaluation and
//! the publish stage operate on.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};

use crate::errors::RunError;
use crate::models::TestFile;
use crate::store::StoreHandle;

/// Truncation length for the branch slug.
const SLUG_MAX_LEN: usize = 40;

#[derive(Debug, Clone)]
pub struct Sandbox {
    pub run_id: String,
    pub path: PathBuf,
    /// HEAD of the default branch at clone time.
    pub base_commit: String,
    pub branch_name: String,
}

#[derive(Clone)]
pub struct SandboxManager {
    base_dir: PathBuf,
    retain_failed: bool,
}

impl SandboxManager {
    pub fn new(base_dir: PathBuf, retain_failed: bool) -> Self {
        Self {
            base_dir,
            retain_failed,
        }
    }

    /// Clone the repository into a fresh per-run directory and check out the
    /// feature branch. Any git failure here is an infrastructure error.
    pub async fn acquire(
        &self,
        run_id: &str,
        repo_url: &str,
        feature_name: &str,
    ) -> Result<Sandbox, RunError> {
        let path = self.base_dir.join(run_id);
        if path.exists() {
            return Err(RunError::infra(
                "clone",
                format!("sandbox path already exists: {}", path.display()),
            ));
        }
        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|e| RunError::infra("clone", e))?;

        git(&self.base_dir, &["clone", repo_url, run_id])
            .await
            .map_err(|e| RunError::infra("clone", e))?;

        let base_commit = git(&path, &["rev-parse", "HEAD"])
            .await
            .map_err(|e| RunError::infra("clone", e))?
            .trim()
            .to_string();

        let branch_name = branch_name(feature_name, run_id);
        git(&path, &["checkout", "-b", &branch_name])
            .await
            .map_err(|e| RunError::infra("clone", e))?;

        Ok(Sandbox {
            run_id: run_id.to_string(),
            path,
            base_commit,
            branch_name,
        })
    }

    /// Write the plan and generated test files into the sandbox. Returns the
    /// relative paths written, so scope evaluation can exclude them.
    pub async fn write_plan_files(
        &self,
        sandbox: &Sandbox,
        plan_text: &str,
        test_files: &[TestFile],
    ) -> Result<Vec<String>, RunError> {
        let mut written = vec!["Plan.md".to_string()];
        tokio::fs::write(sandbox.path.join("Plan.md"), plan_text)
            .await
            .map_err(|e| RunError::infra("plan", e))?;
        for file in test_files {
            let rel = Path::new(&file.path);
            if rel.is_absolute()
                || rel
                    .components()
                    .any(|c| matches!(c, std::path::Component::ParentDir))
            {
                return Err(RunError::infra(
                    "plan",
                    format!("generated test path escapes sandbox: {}", file.path),
                ));
            }
            let dest = sandbox.path.join(rel);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| RunError::infra("plan", e))?;
            }
            tokio::fs::write(&dest, &file.content)
                .await
                .map_err(|e| RunError::infra("plan", e))?;
            written.push(file.path.clone());
        }
        Ok(written)
    }

    /// Delete a sandbox directory. Already-gone paths are fine.
    pub async fn release(&self, sandbox_path: &Path) -> Result<()> {
        match tokio::fs::remove_dir_all(sandbox_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to remove {}", sandbox_path.display()))
            }
        }
    }

    /// Release after a terminal failure, honoring the retain setting.
    pub async fn release_failed(&self, sandbox_path: &Path) -> Result<()> {
        if self.retain_failed {
            tracing::info!("retaining failed sandbox at {}", sandbox_path.display());
            return Ok(());
        }
        self.release(sandbox_path).await
    }

    /// Delete sandbox directories left behind by a previous process: any
    /// entry whose name is not a known non-terminal run id. Runs at startup,
    /// before any worker is spawned.
    pub async fn reclaim_orphans(&self, store: &StoreHandle) -> Result<usize> {
        if !self.base_dir.exists() {
            return Ok(0);
        }
        let active: Vec<String> = store
            .call(|s| Ok(s.non_terminal_runs()?.into_iter().map(|r| r.id).collect()))
            .await?;

        let mut reclaimed = 0;
        let mut entries = tokio::fs::read_dir(&self.base_dir)
            .await
            .context("Failed to read sandbox base directory")?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if active.contains(&name) {
                continue;
            }
            tracing::info!("reclaiming orphaned sandbox {}", name);
            self.release(&entry.path()).await?;
            reclaimed += 1;
        }
        Ok(reclaimed)
    }
}

/// Branch for a run: `auto/feature-<slug>-<run8>`.
pub fn branch_name(feature_name: &str, run_id: &str) -> String {
    let short_id: String = run_id.chars().filter(|c| *c != '-').take(8).collect();
    format!("auto/feature-{}-{}", slugify(feature_name, SLUG_MAX_LEN), short_id)
}

/// Lowercase, ASCII-alphanumeric-and-hyphen slug, collapsed and truncated.
pub fn slugify(name: &str, max_len: usize) -> String {
    let slug: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

/// Run a git subcommand, returning stdout on success.
pub async fn git(cwd: &Path, args: &[&str]) -> Result<String> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("Failed to run git {}", args.join(" ")))?;
    if !output.status.success() {
        anyhow::bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
