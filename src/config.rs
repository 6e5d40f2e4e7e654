use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime settings for the orchestrator.
///
/// Loaded from `autobuild.toml` when present, with environment-variable
/// overrides for the agent command and generator credentials. Everything has
/// a usable default so the server can start with no config file at all.
#[derive(Debug, Clone)]
pub struct Settings {
    pub db_path: PathBuf,
    /// Parent directory under which per-run sandboxes are created.
    pub sandbox_base_dir: PathBuf,
    /// Headless agent executable (e.g. `claude`).
    pub agent_cmd: String,
    /// Change-request CLI (e.g. `gh`).
    pub gh_cmd: String,
    /// Inclusive cap on BUILDING attempts per run.
    pub max_iterations: u32,
    /// Per-invocation agent timeout.
    pub agent_timeout_secs: u64,
    /// Whole-run wall-clock budget, counted from CLONING.
    pub run_budget_secs: u64,
    /// Per-check verification timeout.
    pub check_timeout_secs: u64,
    /// Process-wide cap on concurrently running agent subprocesses.
    pub max_concurrent_agents: usize,
    /// Keep failed sandboxes on disk for debugging.
    pub retain_failed_sandboxes: bool,
    pub max_files_changed: usize,
    pub forbidden_prefixes: Vec<String>,
    pub port: u16,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub llm_base_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".autobuild/runs.db"),
            sandbox_base_dir: PathBuf::from(".autobuild/sandboxes"),
            agent_cmd: "claude".to_string(),
            gh_cmd: "gh".to_string(),
            max_iterations: 2,
            agent_timeout_secs: 1200,
            run_budget_secs: 3600,
            check_timeout_secs: 300,
            max_concurrent_agents: 4,
            retain_failed_sandboxes: false,
            max_files_changed: 25,
            forbidden_prefixes: default_forbidden_prefixes(),
            port: 3580,
            llm_api_key: None,
            llm_model: "gpt-4o-mini".to_string(),
            llm_base_url: "https://api.openai.com/v1".to_string(),
        }
    }
}

fn default_forbidden_prefixes() -> Vec<String> {
    [".env", ".github/", ".gitlab-ci", "Dockerfile", "deploy/", "infra/"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Raw TOML structure for `autobuild.toml`.
#[derive(Debug, Deserialize)]
struct SettingsToml {
    orchestrator: Option<OrchestratorSection>,
    scope: Option<ScopeSection>,
    llm: Option<LlmSection>,
}

#[derive(Debug, Deserialize)]
struct OrchestratorSection {
    db_path: Option<PathBuf>,
    sandbox_base_dir: Option<PathBuf>,
    agent_cmd: Option<String>,
    gh_cmd: Option<String>,
    max_iterations: Option<u32>,
    agent_timeout_secs: Option<u64>,
    run_budget_secs: Option<u64>,
    check_timeout_secs: Option<u64>,
    max_concurrent_agents: Option<usize>,
    retain_failed_sandboxes: Option<bool>,
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct ScopeSection {
    max_files_changed: Option<usize>,
    forbidden_prefixes: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct LlmSection {
    model: Option<String>,
    base_url: Option<String>,
}

impl Settings {
    /// Load settings from `<dir>/autobuild.toml`, falling back to defaults
    /// when the file doesn't exist, then apply environment overrides.
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join("autobuild.toml");
        let mut settings = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            let toml: SettingsToml = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?;
            Self::from_toml(toml)
        } else {
            Self::default()
        };
        settings.apply_env(&env_snapshot());
        Ok(settings)
    }

    fn from_toml(toml: SettingsToml) -> Self {
        let mut settings = Self::default();
        if let Some(section) = toml.orchestrator {
            if let Some(v) = section.db_path {
                settings.db_path = v;
            }
            if let Some(v) = section.sandbox_base_dir {
                settings.sandbox_base_dir = v;
            }
            if let Some(v) = section.agent_cmd {
                settings.agent_cmd = v;
            }
            if let Some(v) = section.gh_cmd {
                settings.gh_cmd = v;
            }
            if let Some(v) = section.max_iterations {
                settings.max_iterations = v.max(1);
            }
            if let Some(v) = section.agent_timeout_secs {
                settings.agent_timeout_secs = v;
            }
            if let Some(v) = section.run_budget_secs {
                settings.run_budget_secs = v;
            }
            if let Some(v) = section.check_timeout_secs {
                settings.check_timeout_secs = v;
            }
            if let Some(v) = section.max_concurrent_agents {
                settings.max_concurrent_agents = v.max(1);
            }
            if let Some(v) = section.retain_failed_sandboxes {
                settings.retain_failed_sandboxes = v;
            }
            if let Some(v) = section.port {
                settings.port = v;
            }
        }
        if let Some(section) = toml.scope {
            if let Some(v) = section.max_files_changed {
                settings.max_files_changed = v;
            }
            if let Some(v) = section.forbidden_prefixes {
                settings.forbidden_prefixes = v;
            }
        }
        if let Some(section) = toml.llm {
            if let Some(v) = section.model {
                settings.llm_model = v;
            }
            if let Some(v) = section.base_url {
                settings.llm_base_url = v;
            }
        }
        settings
    }

    fn apply_env(&mut self, env: &HashMap<String, String>) {
        if let Some(v) = env.get("AGENT_CMD") {
            self.agent_cmd = v.clone();
        }
        if let Some(v) = env.get("GH_CMD") {
            self.gh_cmd = v.clone();
        }
        if let Some(v) = env.get("OPENAI_API_KEY") {
            self.llm_api_key = Some(v.clone());
        }
        if let Some(v) = env.get("SANDBOX_BASE_DIR") {
            self.sandbox_base_dir = PathBuf::from(v);
        }
    }
}

fn env_snapshot() -> HashMap<String, String> {
    std::env::vars().collect()
}
