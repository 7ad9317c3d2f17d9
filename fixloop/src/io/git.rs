//! Git adapter for checkpoints and session metadata.
//!
//! Checkpoints are built from git plumbing commands so the working tree is
//! never touched while one is being recorded. Everything goes through a small,
//! explicit wrapper around `git` subprocess calls.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

impl StatusEntry {
    pub fn is_untracked(&self) -> bool {
        self.code == "??"
    }
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    /// Alternate index file (`GIT_INDEX_FILE`) for every command.
    index_file: Option<PathBuf>,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            index_file: None,
        }
    }

    /// Same repository, but reading and writing `index` instead of the real index.
    pub fn with_index_file(&self, index: impl Into<PathBuf>) -> Self {
        Self {
            workdir: self.workdir.clone(),
            index_file: Some(index.into()),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Short branch name, or `"detached"` when HEAD does not point at a branch.
    #[instrument(skip_all)]
    pub fn branch_name(&self) -> Result<String> {
        let out = self.run(&["symbolic-ref", "--quiet", "--short", "HEAD"])?;
        if !out.status.success() {
            debug!("detached HEAD");
            return Ok("detached".to_string());
        }
        let name = String::from_utf8_lossy(&out.stdout).trim().to_string();
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// True once HEAD resolves to a commit.
    pub fn has_commits(&self) -> Result<bool> {
        let out = self.run(&["rev-parse", "--verify", "--quiet", "HEAD^{commit}"])?;
        Ok(out.status.success())
    }

    /// Top-level directory of the working tree containing `workdir`.
    pub fn toplevel(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--show-toplevel"])?;
        Ok(PathBuf::from(out.trim()))
    }

    /// Resolve a path inside the git directory (e.g. `index`), absolute.
    pub fn git_path(&self, name: &str) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--git-path", name])?;
        let path = PathBuf::from(out.trim());
        if path.is_absolute() {
            Ok(path)
        } else {
            Ok(self.workdir.join(path))
        }
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// Write the current index as a tree object and return its id.
    pub fn write_tree(&self) -> Result<String> {
        let out = self.run_capture(&["write-tree"])?;
        Ok(out.trim().to_string())
    }

    /// Create a commit object for `tree` with the given parents.
    #[instrument(skip_all, fields(tree, parents = parents.len()))]
    pub fn commit_tree(&self, tree: &str, parents: &[&str], message: &str) -> Result<String> {
        let mut args = vec!["commit-tree", tree];
        for parent in parents {
            args.push("-p");
            args.push(parent);
        }
        args.push("-m");
        args.push(message);
        let out = self.run_capture(&args)?;
        Ok(out.trim().to_string())
    }

    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--verify", rev])?;
        Ok(out.trim().to_string())
    }

    pub fn update_ref(&self, name: &str, target: &str, reason: &str) -> Result<()> {
        self.run_checked(&["update-ref", "-m", reason, name, target])?;
        Ok(())
    }

    pub fn delete_ref(&self, name: &str) -> Result<()> {
        self.run_checked(&["update-ref", "-d", name])?;
        Ok(())
    }

    pub fn ref_exists(&self, name: &str) -> Result<bool> {
        let out = self.run(&["show-ref", "--verify", "--quiet", name])?;
        Ok(out.status.success())
    }

    /// Discard every tracked change in the index and working tree.
    pub fn reset_hard(&self) -> Result<()> {
        self.run_checked(&["reset", "--hard", "--quiet", "HEAD"])?;
        Ok(())
    }

    /// Remove untracked files and directories. Ignored files are kept.
    pub fn clean_untracked(&self) -> Result<()> {
        self.run_checked(&["clean", "-f", "-d", "--quiet"])?;
        Ok(())
    }

    /// Replace the index with `tree`, also updating the working tree when `update_worktree`.
    pub fn read_tree(&self, tree: &str, update_worktree: bool) -> Result<()> {
        if update_worktree {
            self.run_checked(&["read-tree", "--reset", "-u", tree])?;
        } else {
            self.run_checked(&["read-tree", tree])?;
        }
        Ok(())
    }

    pub fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    pub fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    pub fn run(&self, args: &[&str]) -> Result<Output> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        if let Some(index) = &self.index_file {
            cmd.env("GIT_INDEX_FILE", index.as_os_str());
        }
        // Plumbing commits need an identity even on unconfigured machines.
        for (key, fallback) in [
            ("GIT_AUTHOR_NAME", "fixloop"),
            ("GIT_AUTHOR_EMAIL", "fixloop@localhost"),
            ("GIT_COMMITTER_NAME", "fixloop"),
            ("GIT_COMMITTER_EMAIL", "fixloop@localhost"),
        ] {
            if std::env::var_os(key).is_none() {
                cmd.env(key, OsStr::new(fallback));
            }
        }
        cmd.output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
