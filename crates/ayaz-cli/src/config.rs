use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use ayaz_core::Backend;
use ayaz_core::providers::ProviderOptions;

/// Bundled default configuration, written by `ayaz init`
pub const DEFAULT_CONFIG: &str = include_str!("../../../config/default.toml");

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AyazConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

// ── LLM ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: Backend,
    /// Backend tried when `provider` fails; its variables must be set too
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<Backend>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_tokens() -> u32 {
    4096
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    3
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: Backend::default(),
            fallback: None,
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl LlmConfig {
    pub fn provider_options(&self) -> ProviderOptions {
        ProviderOptions {
            max_tokens: self.max_tokens,
            timeout: std::time::Duration::from_secs(self.timeout_secs),
            max_retries: self.max_retries,
        }
    }
}

// ── Project ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Directory holding agents.yaml and tasks.yaml
    #[serde(default = "default_project_dir")]
    pub dir: String,
}

fn default_project_dir() -> String {
    "~/.ayaz/project".to_string()
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            dir: default_project_dir(),
        }
    }
}

// ── Storage ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_kickoff_db")]
    pub kickoff_db: String,
    /// Training results consulted at every kickoff
    #[serde(default = "default_trained_agents_file")]
    pub trained_agents_file: String,
}

fn default_kickoff_db() -> String {
    "~/.ayaz/latest_kickoff_task_outputs.db".to_string()
}
fn default_trained_agents_file() -> String {
    "trained_agents_data.json".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kickoff_db: default_kickoff_db(),
            trained_agents_file: default_trained_agents_file(),
        }
    }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ayaz")
}

impl AyazConfig {
    /// Load the config. A missing default file yields the defaults; an explicit path must exist.
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        match custom_path {
            Some(path) => Self::load_from(path),
            None => {
                let path = config_dir().join("config.toml");
                if path.exists() {
                    Self::load_from(&path)
                } else {
                    debug!("No config at {}, using defaults", path.display());
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("Config file {} does not exist", path.display());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config at {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        Ok(toml::from_str(&expanded)?)
    }

    pub fn project_dir(&self) -> PathBuf {
        shellexpand(&self.project.dir)
    }

    pub fn kickoff_db_path(&self) -> PathBuf {
        shellexpand(&self.storage.kickoff_db)
    }

    pub fn trained_agents_path(&self) -> PathBuf {
        shellexpand(&self.storage.trained_agents_file)
    }
}

/// Allowlist of environment variable names that may be expanded in config files
const ALLOWED_ENV_VARS: &[&str] = &["HOME", "USER", "AYAZ_HOME", "XDG_DATA_HOME", "XDG_CONFIG_HOME"];

fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        let Some(start) = result[pos..].find("${") else {
            break;
        };
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();

        if !ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                var_name
            );
            pos = abs_start + end + 1;
            continue;
        }

        let value = std::env::var(&var_name).unwrap_or_default();
        result = format!(
            "{}{}{}",
            &result[..abs_start],
            value,
            &result[abs_start + end + 1..]
        );
        pos = abs_start + value.len();
    }
    result
}

pub fn shellexpand(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
