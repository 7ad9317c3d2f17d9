//! Restorable checkpoints of the working tree and index.
//!
//! Three strategies, chosen by repository state:
//!
//! - **clean**: nothing was uncommitted, so there is nothing to restore.
//! - **ref**: the index and working tree are recorded as a stash-shaped commit
//!   (first parent `HEAD`, second parent a commit of the index) reachable only
//!   through `refs/fixloop/checkpoints/<id>`. The commit is built through a
//!   temporary index, so the working tree is never modified while recording.
//! - **snapshot**: repositories without commits get a tar archive of the
//!   working tree (minus `.git`) and a copy of the index in a staging
//!   directory under the OS temp dir.
//!
//! Rollback is the only operation here that destroys uncommitted work.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::core::path::sanitize_component;
use crate::io::git::Git;

pub const CHECKPOINT_REF_PREFIX: &str = "refs/fixloop/checkpoints/";

const ARCHIVE_NAME: &str = "worktree.tar";
const INDEX_COPY_NAME: &str = "index";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GitCheckpoint {
    Clean,
    Ref {
        id: String,
        ref_name: String,
        commit: String,
    },
    Snapshot {
        id: String,
        dir: PathBuf,
        has_index: bool,
    },
}

impl GitCheckpoint {
    pub fn kind(&self) -> &'static str {
        match self {
            GitCheckpoint::Clean => "clean",
            GitCheckpoint::Ref { .. } => "ref",
            GitCheckpoint::Snapshot { .. } => "snapshot",
        }
    }
}

/// Checkpoint operations the cycle engine depends on.
pub trait Checkpointer {
    fn create(&self, repo: &Path, id: &str) -> Result<GitCheckpoint>;
    /// Best-effort cleanup; discarding twice is not an error.
    fn discard(&self, repo: &Path, checkpoint: &GitCheckpoint) -> Result<()>;
    fn rollback(&self, repo: &Path, checkpoint: &GitCheckpoint) -> Result<()>;
}

/// [`Checkpointer`] backed by the real `git` binary and filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct GitCheckpoints;

impl Checkpointer for GitCheckpoints {
    fn create(&self, repo: &Path, id: &str) -> Result<GitCheckpoint> {
        create_checkpoint(repo, id)
    }

    fn discard(&self, repo: &Path, checkpoint: &GitCheckpoint) -> Result<()> {
        discard_checkpoint(repo, checkpoint)
    }

    fn rollback(&self, repo: &Path, checkpoint: &GitCheckpoint) -> Result<()> {
        rollback_to_checkpoint(repo, checkpoint)
    }
}

#[instrument(skip_all, fields(repo = %repo.display(), id))]
pub fn create_checkpoint(repo: &Path, id: &str) -> Result<GitCheckpoint> {
    let git = open_toplevel(repo)?;
    if !git.has_commits()? {
        return create_snapshot(&git, id);
    }

    let status = git.status_porcelain()?;
    if status.is_empty() {
        debug!("no uncommitted changes; clean checkpoint");
        return Ok(GitCheckpoint::Clean);
    }
    debug!(
        changed = status.len(),
        untracked = status.iter().filter(|e| e.is_untracked()).count(),
        "recording uncommitted changes"
    );

    let head = git.rev_parse("HEAD")?;
    let index_tree = git.write_tree().context("record index tree")?;
    let worktree_tree = worktree_tree(&git, id)?;

    let index_commit = git.commit_tree(
        &index_tree,
        &[&head],
        &format!("index on fixloop checkpoint {id}"),
    )?;
    let commit = git.commit_tree(
        &worktree_tree,
        &[&head, &index_commit],
        &format!("fixloop checkpoint {id}"),
    )?;

    let ref_name = format!("{CHECKPOINT_REF_PREFIX}{}", sanitize_component(id));
    git.update_ref(&ref_name, &commit, "fixloop: checkpoint")?;
    info!(%ref_name, %commit, "checkpoint recorded");
    Ok(GitCheckpoint::Ref {
        id: id.to_string(),
        ref_name,
        commit,
    })
}

#[instrument(skip_all, fields(repo = %repo.display(), kind = checkpoint.kind()))]
pub fn discard_checkpoint(repo: &Path, checkpoint: &GitCheckpoint) -> Result<()> {
    match checkpoint {
        GitCheckpoint::Clean => Ok(()),
        GitCheckpoint::Ref { ref_name, .. } => {
            let git = open_toplevel(repo)?;
            if git.ref_exists(ref_name)? {
                git.delete_ref(ref_name)?;
                debug!(%ref_name, "checkpoint ref deleted");
            }
            Ok(())
        }
        GitCheckpoint::Snapshot { dir, .. } => {
            if dir.exists() {
                fs::remove_dir_all(dir)
                    .with_context(|| format!("remove snapshot {}", dir.display()))?;
                debug!(dir = %dir.display(), "snapshot removed");
            }
            Ok(())
        }
    }
}

#[instrument(skip_all, fields(repo = %repo.display(), kind = checkpoint.kind()))]
pub fn rollback_to_checkpoint(repo: &Path, checkpoint: &GitCheckpoint) -> Result<()> {
    let git = open_toplevel(repo)?;
    match checkpoint {
        GitCheckpoint::Snapshot { dir, has_index, .. } => {
            restore_snapshot(&git, dir, *has_index)?;
        }
        GitCheckpoint::Clean => {
            git.reset_hard()?;
            git.clean_untracked()?;
        }
        GitCheckpoint::Ref { commit, .. } => {
            git.reset_hard()?;
            git.clean_untracked()?;
            git.read_tree(&format!("{commit}^{{tree}}"), true)
                .context("restore working tree from checkpoint")?;
            git.read_tree(&format!("{commit}^2^{{tree}}"), false)
                .context("restore index from checkpoint")?;
        }
    }
    warn!("working tree rolled back to checkpoint");
    discard_checkpoint(repo, checkpoint)
}

fn open_toplevel(repo: &Path) -> Result<Git> {
    let toplevel = Git::new(repo)
        .toplevel()
        .with_context(|| format!("{} is not inside a git repository", repo.display()))?;
    Ok(Git::new(toplevel))
}

/// Tree of the full working tree, built in a scratch copy of the index.
fn worktree_tree(git: &Git, id: &str) -> Result<String> {
    let real_index = git.git_path("index")?;
    let scratch =
        git.git_path(&format!("fixloop-index-{}-{}", sanitize_component(id), std::process::id()))?;
    if real_index.exists() {
        fs::copy(&real_index, &scratch)
            .with_context(|| format!("copy index to {}", scratch.display()))?;
    }
    let scratch_git = git.with_index_file(&scratch);
    let result = scratch_git
        .add_all()
        .and_then(|()| scratch_git.write_tree())
        .context("record working tree");
    if let Err(e) = fs::remove_file(&scratch)
        && scratch.exists()
    {
        warn!(err = %e, path = %scratch.display(), "failed to remove scratch index");
    }
    result
}

fn create_snapshot(git: &Git, id: &str) -> Result<GitCheckpoint> {
    let dir = std::env::temp_dir().join(format!(
        "fixloop-snapshot-{}-{}",
        sanitize_component(id),
        std::process::id()
    ));
    if dir.exists() {
        fs::remove_dir_all(&dir)
            .with_context(|| format!("clear stale snapshot {}", dir.display()))?;
    }
    fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;

    let archive = dir.join(ARCHIVE_NAME);
    write_archive(git.workdir(), &archive)?;

    let index = git.git_path("index")?;
    let has_index = index.exists();
    if has_index {
        let copy = dir.join(INDEX_COPY_NAME);
        fs::copy(&index, &copy).with_context(|| format!("copy index to {}", copy.display()))?;
    }

    info!(dir = %dir.display(), has_index, "snapshot recorded");
    Ok(GitCheckpoint::Snapshot {
        id: id.to_string(),
        dir,
        has_index,
    })
}

fn write_archive(root: &Path, archive: &Path) -> Result<()> {
    let file =
        File::create(archive).with_context(|| format!("create archive {}", archive.display()))?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);

    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !(entry.depth() == 1 && entry.file_name() == ".git"));
    for entry in walker {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("relativize {}", entry.path().display()))?;
        builder
            .append_path_with_name(entry.path(), relative)
            .with_context(|| format!("archive {}", entry.path().display()))?;
    }
    builder
        .into_inner()
        .with_context(|| format!("finish archive {}", archive.display()))?
        .sync_all()
        .with_context(|| format!("sync archive {}", archive.display()))?;
    Ok(())
}

fn restore_snapshot(git: &Git, dir: &Path, has_index: bool) -> Result<()> {
    let archive = dir.join(ARCHIVE_NAME);
    if !archive.exists() {
        return Err(anyhow!("snapshot archive missing: {}", archive.display()));
    }
    let root = git.workdir();

    for entry in fs::read_dir(root).with_context(|| format!("read {}", root.display()))? {
        let entry = entry.with_context(|| format!("read {}", root.display()))?;
        if entry.file_name() == ".git" {
            continue;
        }
        let path = entry.path();
        let file_type = entry
            .file_type()
            .with_context(|| format!("stat {}", path.display()))?;
        if file_type.is_dir() {
            fs::remove_dir_all(&path).with_context(|| format!("remove {}", path.display()))?;
        } else {
            fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        }
    }

    let file = File::open(&archive).with_context(|| format!("open {}", archive.display()))?;
    let mut unpacker = tar::Archive::new(file);
    unpacker.set_preserve_permissions(true);
    unpacker.set_overwrite(true);
    unpacker
        .unpack(root)
        .with_context(|| format!("extract {} into {}", archive.display(), root.display()))?;

    let index = git.git_path("index")?;
    if has_index {
        fs::copy(dir.join(INDEX_COPY_NAME), &index)
            .with_context(|| format!("restore index {}", index.display()))?;
    } else if index.exists() {
        fs::remove_file(&index).with_context(|| format!("remove index {}", index.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_serializes_with_kind_tag() {
        let checkpoint = GitCheckpoint::Ref {
            id: "s-iter1".to_string(),
            ref_name: format!("{CHECKPOINT_REF_PREFIX}s-iter1"),
            commit: "abc".to_string(),
        };
        let json = serde_json::to_value(&checkpoint).expect("serialize");
        assert_eq!(json["kind"], "ref");
        assert_eq!(checkpoint.kind(), "ref");
    }

    #[test]
    fn discarding_a_missing_snapshot_is_a_no_op() {
        let temp = tempfile::tempdir().expect("tempdir");
        let checkpoint = GitCheckpoint::Snapshot {
            id: "x".to_string(),
            dir: temp.path().join("gone"),
            has_index: false,
        };
        discard_checkpoint(temp.path(), &checkpoint).expect("discard");
        discard_checkpoint(temp.path(), &GitCheckpoint::Clean).expect("discard clean");
    }
}
