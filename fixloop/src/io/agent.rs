//! Agent invocation backends.
//!
//! The engine only sees [`AgentRunner`]: give it a role, a prompt and a
//! timeout, get back an [`AgentInvocationResult`]. [`ProcessAgentRunner`] maps
//! each role to an [`AgentKind`] whose [`AgentBackend`] knows the command line
//! and how to pull the final message out of the agent's stdout. Tests use
//! scripted runners that never spawn processes.

use std::fmt;
use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{AgentInvocationResult, AgentRole, TIMEOUT_EXIT_CODE};
use crate::io::config::{FixloopConfig, RoleConfig};
use crate::io::process::{LiveSink, run_command_with_stream};

/// Runs one agent invocation for a role.
pub trait AgentRunner {
    /// `Err` means the process could not be run at all; the caller counts it
    /// as a failed attempt.
    fn run(&self, role: AgentRole, prompt: &str, timeout: Duration)
    -> Result<AgentInvocationResult>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Codex,
    /// Arbitrary command taking the prompt on stdin.
    Command,
}

impl AgentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Codex => "codex",
            AgentKind::Command => "command",
        }
    }

    pub fn backend(self) -> &'static dyn AgentBackend {
        match self {
            AgentKind::Claude => &ClaudeBackend,
            AgentKind::Codex => &CodexBackend,
            AgentKind::Command => &CommandBackend,
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully specified process launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Written to the child's stdin.
    pub stdin: String,
}

pub trait AgentBackend: Sync {
    fn build_invocation(
        &self,
        role: AgentRole,
        config: &RoleConfig,
        prompt: &str,
    ) -> Result<Invocation>;

    /// The agent's final message, given its complete stdout.
    fn extract_result(&self, stdout: &str) -> String;
}

struct ClaudeBackend;

impl AgentBackend for ClaudeBackend {
    fn build_invocation(
        &self,
        _role: AgentRole,
        config: &RoleConfig,
        prompt: &str,
    ) -> Result<Invocation> {
        let mut args: Vec<String> = [
            "-p",
            "--output-format",
            "stream-json",
            "--verbose",
            "--dangerously-skip-permissions",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        if let Some(model) = &config.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        Ok(Invocation {
            program: "claude".to_string(),
            args,
            env: Vec::new(),
            stdin: prompt.to_string(),
        })
    }

    /// Stream-json output ends with a `{"type":"result","result":...}` line.
    fn extract_result(&self, stdout: &str) -> String {
        for line in stdout.lines().rev() {
            let Ok(value) = serde_json::from_str::<Value>(line.trim()) else {
                continue;
            };
            if value.get("type").and_then(Value::as_str) == Some("result")
                && let Some(result) = value.get("result").and_then(Value::as_str)
            {
                return result.to_string();
            }
        }
        debug!("no result event in claude stream; using raw stdout");
        stdout.to_string()
    }
}

struct CodexBackend;

impl AgentBackend for CodexBackend {
    fn build_invocation(
        &self,
        _role: AgentRole,
        config: &RoleConfig,
        prompt: &str,
    ) -> Result<Invocation> {
        let mut args: Vec<String> = [
            "exec",
            "-c",
            "model_reasoning_effort=medium",
            "--sandbox",
            "danger-full-access",
            // Works in directories codex does not consider trusted repositories.
            "--skip-git-repo-check",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        if let Some(model) = &config.model {
            args.push("-m".to_string());
            args.push(model.clone());
        }
        args.push("-".to_string());
        Ok(Invocation {
            program: "codex".to_string(),
            args,
            env: Vec::new(),
            stdin: prompt.to_string(),
        })
    }

    fn extract_result(&self, stdout: &str) -> String {
        stdout.to_string()
    }
}

struct CommandBackend;

impl AgentBackend for CommandBackend {
    fn build_invocation(
        &self,
        role: AgentRole,
        config: &RoleConfig,
        prompt: &str,
    ) -> Result<Invocation> {
        let (program, args) = config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("{role}.command must be set for agent = \"command\""))?;
        let mut env = vec![("FIXLOOP_ROLE".to_string(), role.as_str().to_string())];
        if let Some(model) = &config.model {
            env.push(("FIXLOOP_MODEL".to_string(), model.clone()));
        }
        Ok(Invocation {
            program: program.clone(),
            args: args.to_vec(),
            env,
            stdin: prompt.to_string(),
        })
    }

    fn extract_result(&self, stdout: &str) -> String {
        stdout.to_string()
    }
}

/// [`AgentRunner`] that spawns the configured agent CLIs in `workdir`.
pub struct ProcessAgentRunner {
    workdir: PathBuf,
    reviewer: RoleConfig,
    fixer: RoleConfig,
    simplifier: Option<RoleConfig>,
    output_limit_bytes: usize,
    stream_output: bool,
}

impl ProcessAgentRunner {
    pub fn from_config(workdir: impl Into<PathBuf>, config: &FixloopConfig) -> Self {
        Self {
            workdir: workdir.into(),
            reviewer: config.reviewer.clone(),
            fixer: config.fixer.clone(),
            simplifier: config.simplifier.clone(),
            output_limit_bytes: config.output_limit_bytes,
            stream_output: config.stream_output,
        }
    }

    fn role_config(&self, role: AgentRole) -> Result<&RoleConfig> {
        match role {
            AgentRole::Reviewer => Ok(&self.reviewer),
            AgentRole::Fixer => Ok(&self.fixer),
            AgentRole::Simplifier => self
                .simplifier
                .as_ref()
                .ok_or_else(|| anyhow!("no simplifier configured")),
        }
    }
}

impl AgentRunner for ProcessAgentRunner {
    #[instrument(skip_all, fields(%role, timeout_secs = timeout.as_secs()))]
    fn run(
        &self,
        role: AgentRole,
        prompt: &str,
        timeout: Duration,
    ) -> Result<AgentInvocationResult> {
        let config = self.role_config(role)?;
        let backend = config.agent.backend();
        let invocation = backend.build_invocation(role, config, prompt)?;
        info!(agent = %config.agent, program = %invocation.program, "invoking agent");

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args).current_dir(&self.workdir);
        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }
        let live: Option<LiveSink> = self
            .stream_output
            .then(|| Box::new(std::io::stderr()) as LiveSink);

        let started = Instant::now();
        let output = run_command_with_stream(
            cmd,
            Some(invocation.stdin.as_bytes()),
            timeout,
            self.output_limit_bytes,
            live,
        )
        .with_context(|| format!("run {} for {role}", invocation.program))?;
        let duration_ms = started.elapsed().as_millis() as u64;

        let exit_code = if output.timed_out {
            TIMEOUT_EXIT_CODE
        } else {
            output.status.code().unwrap_or(-1)
        };
        let success = !output.timed_out && output.status.success();
        if !success {
            let stderr = output.stderr_lossy();
            warn!(
                exit_code,
                timed_out = output.timed_out,
                stderr = %tail(&stderr, 2_000).trim(),
                "agent failed"
            );
        }

        Ok(AgentInvocationResult {
            success,
            exit_code,
            raw_output: backend.extract_result(&output.stdout_lossy()),
            duration_ms,
            timed_out: output.timed_out,
        })
    }
}

/// Last `max` bytes of `text`, moved forward to a char boundary.
fn tail(text: &str, max: usize) -> &str {
    let mut start = text.len().saturating_sub(max);
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
