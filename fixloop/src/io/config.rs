//! User configuration stored at `~/.fixloop/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::retry::RetryPolicy;
use crate::io::agent::AgentKind;

pub const CONFIG_DIR_NAME: &str = ".fixloop";
const CONFIG_FILE_NAME: &str = "config.toml";
const LOGS_DIR_NAME: &str = "logs";

/// fixloop configuration (TOML).
///
/// Meant to be edited by hand. Every table is optional and missing fields take
/// their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FixloopConfig {
    /// Iteration budget per run.
    pub max_iterations: u32,

    /// Keep iterating after the fixer reports `stop_iteration`.
    pub force_max_iterations: bool,

    /// Wall-clock limit for a single agent invocation.
    pub agent_timeout_secs: u64,

    /// Agent stdout/stderr kept in memory beyond this many bytes is dropped.
    pub output_limit_bytes: usize,

    /// Mirror agent stdout to the terminal while it runs.
    pub stream_output: bool,

    /// Where session logs and lock files live. Defaults to `~/.fixloop/logs`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs_dir: Option<PathBuf>,

    pub retry: RetryPolicy,
    pub reviewer: RoleConfig,
    pub fixer: RoleConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simplifier: Option<RoleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RoleConfig {
    pub agent: AgentKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Argv for `agent = "command"` (e.g. `["./review.sh", "--strict"]`).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    /// The agent always emits a valid summary, so format-reminder retries are skipped.
    pub structured_output: bool,
}

impl Default for RoleConfig {
    fn default() -> Self {
        Self {
            agent: AgentKind::Claude,
            model: None,
            command: Vec::new(),
            structured_output: false,
        }
    }
}

impl Default for FixloopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            force_max_iterations: false,
            agent_timeout_secs: 30 * 60,
            output_limit_bytes: 2_000_000,
            stream_output: true,
            logs_dir: None,
            retry: RetryPolicy::default(),
            reviewer: RoleConfig {
                agent: AgentKind::Codex,
                ..RoleConfig::default()
            },
            fixer: RoleConfig::default(),
            simplifier: None,
        }
    }
}

impl RoleConfig {
    fn validate(&self, name: &str) -> Result<()> {
        if self.agent == AgentKind::Command
            && self.command.first().is_none_or(|program| program.trim().is_empty())
        {
            return Err(anyhow!(
                "{name}.command must be a non-empty array when agent = \"command\""
            ));
        }
        if self.model.as_deref().is_some_and(|m| m.trim().is_empty()) {
            return Err(anyhow!("{name}.model must not be empty"));
        }
        Ok(())
    }
}

impl FixloopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.agent_timeout_secs == 0 {
            return Err(anyhow!("agent_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        self.retry.validate()?;
        self.reviewer.validate("reviewer")?;
        self.fixer.validate("fixer")?;
        if let Some(simplifier) = &self.simplifier {
            simplifier.validate("simplifier")?;
        }
        Ok(())
    }

    /// Configured logs directory, or `~/.fixloop/logs`.
    pub fn resolved_logs_dir(&self) -> Result<PathBuf> {
        match &self.logs_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(fixloop_home()?.join(LOGS_DIR_NAME)),
        }
    }
}

fn fixloop_home() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow!("cannot determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(fixloop_home()?.join(CONFIG_FILE_NAME))
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `FixloopConfig::default()`.
pub fn load_config(path: &Path) -> Result<FixloopConfig> {
    if !path.exists() {
        let cfg = FixloopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: FixloopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &FixloopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, FixloopConfig::default());
        assert_eq!(cfg.reviewer.agent, AgentKind::Codex);
        assert_eq!(cfg.fixer.agent, AgentKind::Claude);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested/config.toml");
        let cfg = FixloopConfig {
            max_iterations: 3,
            logs_dir: Some(temp.path().join("logs")),
            simplifier: Some(RoleConfig {
                agent: AgentKind::Command,
                command: vec!["./simplify.sh".to_string()],
                ..RoleConfig::default()
            }),
            ..FixloopConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
    }

    #[test]
    fn partial_tables_fill_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "max_iterations = 2\n\n[retry]\nmax_retries = 0\n\n[fixer]\nagent = \"codex\"\nstructured_output = true\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_iterations, 2);
        assert_eq!(cfg.retry.max_retries, 0);
        assert_eq!(cfg.retry.base_delay_ms, RetryPolicy::default().base_delay_ms);
        assert_eq!(cfg.fixer.agent, AgentKind::Codex);
        assert!(cfg.fixer.structured_output);
        assert_eq!(cfg.reviewer, FixloopConfig::default().reviewer);
    }

    #[test]
    fn rejects_command_agent_without_command() {
        let cfg = FixloopConfig {
            reviewer: RoleConfig {
                agent: AgentKind::Command,
                ..RoleConfig::default()
            },
            ..FixloopConfig::default()
        };
        let err = cfg.validate().expect_err("invalid");
        assert!(err.to_string().contains("reviewer.command"));
    }

    #[test]
    fn rejects_zero_budget() {
        let cfg = FixloopConfig {
            max_iterations: 0,
            ..FixloopConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
