//! Blast-radius limits on what the agent may change.
//!
//! The policy is advisory in the prompt and mechanical after the fact: the
//! agent is told the limits, and the diff is checked regardless of whether
//! it listened. Evaluation runs on the changed-file list computed after the
//! agent exits, so a violation is detected even when the agent claims
//! compliance.

use crate::config::Settings;
use crate::errors::ScopeViolation;

#[derive(Debug, Clone)]
pub struct ScopePolicy {
    pub max_files_changed: usize,
    pub forbidden_prefixes: Vec<String>,
}

impl ScopePolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_files_changed: settings.max_files_changed,
            forbidden_prefixes: settings.forbidden_prefixes.clone(),
        }
    }

    /// Check a changed-file list against the policy. Paths written by the
    /// orchestrator itself (plan, generated tests) must be excluded by the
    /// caller before evaluation.
    pub fn evaluate(&self, changed_files: &[String]) -> Result<(), ScopeViolation> {
        for path in changed_files {
            if let Some(prefix) = self.matching_prefix(path) {
                return Err(ScopeViolation::ForbiddenPath {
                    path: path.clone(),
                    prefix: prefix.to_string(),
                });
            }
        }
        if changed_files.len() > self.max_files_changed {
            return Err(ScopeViolation::TooManyFiles {
                changed: changed_files.len(),
                max: self.max_files_changed,
            });
        }
        Ok(())
    }

    fn matching_prefix(&self, path: &str) -> Option<&str> {
        let normalized = path.trim_start_matches("./");
        self.forbidden_prefixes
            .iter()
            .map(String::as_str)
            .find(|prefix| {
                // Prefixes ending in '/' match directory subtrees; bare
                // prefixes match any path component starting with them,
                // so ".env" also catches ".env.production".
                if let Some(dir) = prefix.strip_suffix('/') {
                    normalized == dir || normalized.starts_with(prefix)
                } else {
                    normalized.starts_with(prefix)
                }
            })
    }

    /// Instruction block injected into every agent prompt.
    pub fn prompt_text(&self) -> String {
        let mut text = String::from("Constraints:\n");
        text.push_str(&format!(
            "- Modify at most {} files.\n",
            self.max_files_changed
        ));
        text.push_str(
            "- Do not touch any of the following paths (environment files, CI \
             configuration, deployment code):\n",
        );
        for prefix in &self.forbidden_prefixes {
            text.push_str(&format!("  - {}\n", prefix));
        }
        text.push_str("- Do not run git commit or git push; the orchestrator handles both.\n");
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ScopePolicy {
        ScopePolicy::from_settings(&Settings::default())
    }

    fn files(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("src/module_{}.js", i)).collect()
    }

    #[test]
    fn test_clean_diff_passes() {
        assert!(policy().evaluate(&files(3)).is_ok());
    }

    #[test]
    fn test_at_limit_passes_over_limit_fails() {
        let policy = policy();
        assert!(policy.evaluate(&files(25)).is_ok());
        let err = policy.evaluate(&files(26)).unwrap_err();
        assert_eq!(err, ScopeViolation::TooManyFiles { changed: 26, max: 25 });
    }

    #[test]
    fn test_forbidden_prefix_fails() {
        let policy = policy();
        let changed = vec!["src/ok.js".to_string(), ".env.production".to_string()];
        let err = policy.evaluate(&changed).unwrap_err();
        assert_eq!(
            err,
            ScopeViolation::ForbiddenPath {
                path: ".env.production".into(),
                prefix: ".env".into(),
            }
        );
    }

    #[test]
    fn test_directory_prefix_matches_subtree() {
        let policy = policy();
        let err = policy
            .evaluate(&[".github/workflows/ci.yml".to_string()])
            .unwrap_err();
        assert!(matches!(err, ScopeViolation::ForbiddenPath { .. }));
        let err = policy.evaluate(&["deploy/prod.sh".to_string()]).unwrap_err();
        assert!(matches!(err, ScopeViolation::ForbiddenPath { .. }));
    }

    #[test]
    fn test_forbidden_prefix_reported_before_count() {
        // A diff that violates both limits reports the path violation.
        let mut changed = files(30);
        changed.push("Dockerfile".to_string());
        let err = policy().evaluate(&changed).unwrap_err();
        assert!(matches!(err, ScopeViolation::ForbiddenPath { .. }));
    }

    #[test]
    fn test_similar_names_do_not_match() {
        let policy = policy();
        // "deployment.md" does not live under "deploy/".
        assert!(policy.evaluate(&["deployment.md".to_string()]).is_ok());
        assert!(policy.evaluate(&["src/infra_utils.js".to_string()]).is_ok());
    }

    #[test]
    fn test_prompt_text_mentions_limits() {
        let text = policy().prompt_text();
        assert!(text.contains("at most 25 files"));
        assert!(text.contains(".env"));
        assert!(text.contains(".github/"));
        assert!(text.contains("git commit"));
    }
}
