//! Test-only fakes for the engine's collaborators.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use tempfile::TempDir;

use crate::core::types::{AgentInvocationResult, AgentRole};
use crate::io::agent::AgentRunner;
use crate::io::checkpoint::{Checkpointer, GitCheckpoint};

/// Successful invocation whose extracted output is `text`.
pub fn ok_result(text: &str) -> AgentInvocationResult {
    AgentInvocationResult {
        success: true,
        exit_code: 0,
        raw_output: text.to_string(),
        duration_ms: 1,
        timed_out: false,
    }
}

/// Failed invocation with the given exit code.
pub fn failed_result(exit_code: i32, text: &str) -> AgentInvocationResult {
    AgentInvocationResult {
        success: false,
        exit_code,
        raw_output: text.to_string(),
        duration_ms: 1,
        timed_out: false,
    }
}

/// [`AgentRunner`] replaying queued results per role and recording prompts.
///
/// Running a role whose queue is empty returns `Err`, which the engine treats
/// as a spawn failure.
#[derive(Default)]
pub struct ScriptedAgentRunner {
    script: RefCell<HashMap<AgentRole, VecDeque<AgentInvocationResult>>>,
    calls: RefCell<Vec<(AgentRole, String)>>,
}

impl ScriptedAgentRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next result for `role`.
    pub fn with(self, role: AgentRole, result: AgentInvocationResult) -> Self {
        self.script
            .borrow_mut()
            .entry(role)
            .or_default()
            .push_back(result);
        self
    }

    /// Prompts sent to `role`, in order.
    pub fn calls(&self, role: AgentRole) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .filter(|(r, _)| *r == role)
            .map(|(_, prompt)| prompt.clone())
            .collect()
    }

    /// Roles invoked, in order.
    pub fn call_order(&self) -> Vec<AgentRole> {
        self.calls.borrow().iter().map(|(role, _)| *role).collect()
    }
}

impl AgentRunner for ScriptedAgentRunner {
    fn run(
        &self,
        role: AgentRole,
        prompt: &str,
        _timeout: Duration,
    ) -> Result<AgentInvocationResult> {
        self.calls.borrow_mut().push((role, prompt.to_string()));
        self.script
            .borrow_mut()
            .get_mut(&role)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| anyhow!("no scripted result left for {role}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointEvent {
    Created(String),
    Discarded(String),
    RolledBack(String),
}

/// [`Checkpointer`] that touches nothing and records what it was asked to do.
#[derive(Default)]
pub struct RecordingCheckpointer {
    events: RefCell<Vec<CheckpointEvent>>,
    pub fail_create: bool,
    pub fail_rollback: bool,
}

impl RecordingCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CheckpointEvent> {
        self.events.borrow().clone()
    }

    pub fn rollbacks(&self) -> usize {
        self.events
            .borrow()
            .iter()
            .filter(|e| matches!(e, CheckpointEvent::RolledBack(_)))
            .count()
    }
}

fn checkpoint_id(checkpoint: &GitCheckpoint) -> String {
    match checkpoint {
        GitCheckpoint::Clean => "clean".to_string(),
        GitCheckpoint::Ref { id, .. } | GitCheckpoint::Snapshot { id, .. } => id.clone(),
    }
}

impl Checkpointer for RecordingCheckpointer {
    fn create(&self, _repo: &Path, id: &str) -> Result<GitCheckpoint> {
        if self.fail_create {
            bail!("checkpoint storage unavailable");
        }
        self.events
            .borrow_mut()
            .push(CheckpointEvent::Created(id.to_string()));
        Ok(GitCheckpoint::Ref {
            id: id.to_string(),
            ref_name: format!("refs/fixloop/checkpoints/{id}"),
            commit: "0".repeat(40),
        })
    }

    fn discard(&self, _repo: &Path, checkpoint: &GitCheckpoint) -> Result<()> {
        self.events
            .borrow_mut()
            .push(CheckpointEvent::Discarded(checkpoint_id(checkpoint)));
        Ok(())
    }

    fn rollback(&self, _repo: &Path, checkpoint: &GitCheckpoint) -> Result<()> {
        self.events
            .borrow_mut()
            .push(CheckpointEvent::RolledBack(checkpoint_id(checkpoint)));
        if self.fail_rollback {
            bail!("git reset --hard failed");
        }
        Ok(())
    }
}

/// Run git in `dir`, failing on a non-zero exit.
pub fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "fixloop-test")
        .env("GIT_AUTHOR_EMAIL", "fixloop-test@example.com")
        .env("GIT_COMMITTER_NAME", "fixloop-test")
        .env("GIT_COMMITTER_EMAIL", "fixloop-test@example.com")
        .output()?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Throwaway git repository on branch `main`, removed on drop.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    /// Empty repository without commits.
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        git(dir.path(), &["init", "-q"])?;
        git(dir.path(), &["symbolic-ref", "HEAD", "refs/heads/main"])?;
        git(dir.path(), &["config", "commit.gpgsign", "false"])?;
        Ok(Self { dir })
    }

    /// Repository with one commit containing `files`.
    pub fn with_files(files: &[(&str, &str)]) -> Result<Self> {
        let repo = Self::new()?;
        for (name, contents) in files {
            repo.write(name, contents)?;
        }
        repo.git(&["add", "-A"])?;
        repo.git(&["commit", "-q", "-m", "initial"])?;
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn git(&self, args: &[&str]) -> Result<String> {
        git(self.root(), args)
    }

    pub fn write(&self, name: &str, contents: &str) -> Result<()> {
        let path = self.root().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn read(&self, name: &str) -> Result<String> {
        Ok(fs::read_to_string(self.root().join(name))?)
    }

    /// `git status --porcelain` including every untracked file.
    pub fn status(&self) -> Result<String> {
        self.git(&["status", "--porcelain", "--untracked-files=all"])
    }
}
