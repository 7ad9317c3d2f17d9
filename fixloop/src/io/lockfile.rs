//! Per-project advisory lock files under `<logs_dir>/locks/`.
//!
//! One JSON file per project path. Creation is atomic: the lock is written in
//! full to a temp file and then hard-linked into place, which fails if a lock
//! already exists. Liveness is judged lazily on every read from the recorded
//! pid; there is no background sweeper.
//!
//! A stale lock is only ever deleted by the holder of a short-lived
//! `<lock>.reclaim` guard, after re-reading the lock under that guard. Plain
//! acquisition never deletes anything, so two runs cannot both end up owning
//! the project.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration as StdDuration, SystemTime};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::path::lock_file_name;
use crate::core::types::AgentRole;

pub const LOCKS_DIR: &str = "locks";

/// A `pending` lock younger than this is never considered stale.
pub const PENDING_GRACE_SECS: i64 = 30;

/// A reclaim guard older than this was left by a crashed process.
const RECLAIM_GUARD_STALE: StdDuration = StdDuration::from_secs(10);
const RECLAIM_ATTEMPTS: usize = 50;
const RECLAIM_BACKOFF: StdDuration = StdDuration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockData {
    pub session_id: String,
    pub session_name: String,
    pub start_time: DateTime<Utc>,
    pub pid: u32,
    pub project_path: String,
    pub branch: String,
    pub status: LockStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_agent: Option<AgentRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
}

/// Fields to merge into an existing lock. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockUpdate {
    pub status: Option<LockStatus>,
    /// `Some(None)` clears the current agent.
    pub current_agent: Option<Option<AgentRole>>,
    pub iteration: Option<u32>,
}

/// Another live session already owns the project.
#[derive(Debug, Clone, thiserror::Error)]
#[error(
    "project {project_path} is locked by session '{session_name}' ({session_id}, pid {pid}, started {start_time})"
)]
pub struct LockHeld {
    pub project_path: String,
    pub session_id: String,
    pub session_name: String,
    pub pid: u32,
    pub start_time: DateTime<Utc>,
}

pub fn lock_path(logs_dir: &Path, project_path: &str) -> PathBuf {
    logs_dir.join(LOCKS_DIR).join(lock_file_name(project_path))
}

/// Acquire the project lock in `pending` state.
///
/// Returns a [`LockHeld`] error (inside `anyhow`) when a live session owns the
/// project. Stale locks are reclaimed.
#[instrument(skip_all, fields(project_path, session_id))]
pub fn create_lockfile(
    logs_dir: &Path,
    project_path: &str,
    session_id: &str,
    session_name: &str,
    branch: &str,
) -> Result<LockData> {
    let path = lock_path(logs_dir, project_path);
    let dir = logs_dir.join(LOCKS_DIR);
    fs::create_dir_all(&dir).with_context(|| format!("create directory {}", dir.display()))?;

    let lock = LockData {
        session_id: session_id.to_string(),
        session_name: session_name.to_string(),
        start_time: Utc::now(),
        pid: std::process::id(),
        project_path: project_path.to_string(),
        branch: branch.to_string(),
        status: LockStatus::Pending,
        current_agent: None,
        iteration: None,
    };
    let tmp_path = super::temp_sibling(&path);
    let mut buf = serde_json::to_string_pretty(&lock).context("serialize lock")?;
    buf.push('\n');
    fs::write(&tmp_path, buf).with_context(|| format!("write temp lock {}", tmp_path.display()))?;

    let result = link_into_place(&tmp_path, &path, project_path);
    if let Err(e) = fs::remove_file(&tmp_path) {
        debug!(err = %e, path = %tmp_path.display(), "temp lock already gone");
    }
    result?;
    info!(path = %path.display(), "lock acquired");
    Ok(lock)
}

fn link_into_place(tmp_path: &Path, path: &Path, project_path: &str) -> Result<()> {
    for _ in 0..RECLAIM_ATTEMPTS {
        match fs::hard_link(tmp_path, path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e).with_context(|| format!("create lock {}", path.display())),
        }

        let existing = read_lock_file(path)?;
        if let Some(existing) = existing.as_ref()
            && !is_stale(existing)
        {
            return Err(lock_held(project_path, existing).into());
        }
        match ReclaimGuard::acquire(path)? {
            Some(_guard) => remove_if_unchanged(path, existing.as_ref())?,
            None => thread::sleep(RECLAIM_BACKOFF),
        }
    }

    match read_lock_file(path)? {
        Some(existing) => Err(lock_held(project_path, &existing).into()),
        None => bail!("could not reclaim lock {}", path.display()),
    }
}

/// Delete the stale lock at `path` if it is still the one judged stale.
///
/// Must be called with the reclaim guard held.
fn remove_if_unchanged(path: &Path, judged: Option<&LockData>) -> Result<()> {
    // A missing file may be relinked by a fresh run at any moment; leave it.
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("read lock {}", path.display())),
    };
    let current = serde_json::from_str::<LockData>(&raw).ok();
    if current.as_ref() != judged {
        debug!("lock changed while waiting for the reclaim guard");
        return Ok(());
    }
    match &current {
        Some(stale) => warn!(
            stale_session = %stale.session_id,
            stale_pid = stale.pid,
            "reclaiming stale lock"
        ),
        None => warn!(path = %path.display(), "reclaiming unreadable lock"),
    }
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove stale lock {}", path.display())),
    }
}

fn lock_held(project_path: &str, lock: &LockData) -> LockHeld {
    LockHeld {
        project_path: project_path.to_string(),
        session_id: lock.session_id.clone(),
        session_name: lock.session_name.clone(),
        pid: lock.pid,
        start_time: lock.start_time,
    }
}

/// Exclusive right to delete a stale lock, held as `<lock>.reclaim`.
struct ReclaimGuard {
    path: PathBuf,
}

impl ReclaimGuard {
    /// `Ok(None)` while another process holds the guard.
    fn acquire(lock_path: &Path) -> Result<Option<Self>> {
        let path = lock_path.with_extension("json.reclaim");
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{}", std::process::id()) {
                    debug!(err = %e, "could not record reclaim guard owner");
                }
                Ok(Some(Self { path }))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let age = fs::metadata(&path)
                    .and_then(|meta| meta.modified())
                    .ok()
                    .and_then(|modified| SystemTime::now().duration_since(modified).ok());
                if age.is_some_and(|age| age > RECLAIM_GUARD_STALE) {
                    warn!(path = %path.display(), "removing abandoned reclaim guard");
                    if let Err(e) = fs::remove_file(&path) {
                        debug!(err = %e, "abandoned reclaim guard already gone");
                    }
                }
                Ok(None)
            }
            Err(e) => Err(e).with_context(|| format!("create reclaim guard {}", path.display())),
        }
    }
}

impl Drop for ReclaimGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), err = %e, "failed to release reclaim guard");
        }
    }
}

/// Read the lock for `project_path`, whether stale or not.
pub fn read_lockfile(logs_dir: &Path, project_path: &str) -> Result<Option<LockData>> {
    read_lock_file(&lock_path(logs_dir, project_path))
}

/// `Ok(None)` when the file is missing or unparsable.
fn read_lock_file(path: &Path) -> Result<Option<LockData>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("read lock {}", path.display())),
    };
    match serde_json::from_str(&raw) {
        Ok(lock) => Ok(Some(lock)),
        Err(e) => {
            warn!(path = %path.display(), err = %e, "ignoring malformed lock file");
            Ok(None)
        }
    }
}

/// Read-merge-write. A missing lock, or one owned by another session, is left alone.
#[instrument(skip_all, fields(project_path, session_id))]
pub fn update_lockfile(
    logs_dir: &Path,
    project_path: &str,
    session_id: &str,
    update: &LockUpdate,
) -> Result<()> {
    let path = lock_path(logs_dir, project_path);
    let Some(mut lock) = read_lock_file(&path)? else {
        debug!("no lock to update");
        return Ok(());
    };
    if lock.session_id != session_id {
        warn!(owner = %lock.session_id, "lock owned by another session; not updating");
        return Ok(());
    }
    if let Some(status) = update.status {
        lock.status = status;
    }
    if let Some(agent) = update.current_agent {
        lock.current_agent = agent;
    }
    if let Some(iteration) = update.iteration {
        lock.iteration = Some(iteration);
    }

    let mut buf = serde_json::to_string_pretty(&lock).context("serialize lock")?;
    buf.push('\n');
    let tmp_path = super::temp_sibling(&path);
    fs::write(&tmp_path, buf).with_context(|| format!("write temp lock {}", tmp_path.display()))?;
    fs::rename(&tmp_path, &path).with_context(|| format!("replace lock {}", path.display()))?;
    Ok(())
}

/// Delete the lock if it still belongs to `session_id`.
#[instrument(skip_all, fields(project_path, session_id))]
pub fn remove_lockfile(logs_dir: &Path, project_path: &str, session_id: &str) -> Result<()> {
    let path = lock_path(logs_dir, project_path);
    match read_lock_file(&path)? {
        Some(lock) if lock.session_id != session_id => {
            warn!(owner = %lock.session_id, "lock owned by another session; not removing");
            Ok(())
        }
        // Unreadable locks are left for the stale reclaim path.
        None => Ok(()),
        Some(_) => match fs::remove_file(&path) {
            Ok(()) => {
                debug!("lock removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove lock {}", path.display())),
        },
    }
}

/// Every non-stale lock, oldest first.
pub fn list_all_active_sessions(logs_dir: &Path) -> Result<Vec<LockData>> {
    let dir = logs_dir.join(LOCKS_DIR);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("read {}", dir.display())),
    };

    let mut active = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read {}", dir.display()))?;
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }
        if let Some(lock) = read_lock_file(&path)?
            && !is_stale(&lock)
        {
            active.push(lock);
        }
    }
    active.sort_by(|a, b| a.start_time.cmp(&b.start_time));
    Ok(active)
}

pub fn is_stale(lock: &LockData) -> bool {
    is_stale_with(lock, Utc::now(), pid_alive)
}

/// Staleness with an injectable clock and liveness probe.
pub fn is_stale_with(lock: &LockData, now: DateTime<Utc>, alive: impl Fn(u32) -> bool) -> bool {
    if lock.status == LockStatus::Pending
        && now.signed_duration_since(lock.start_time) < Duration::seconds(PENDING_GRACE_SECS)
    {
        return false;
    }
    !alive(lock.pid)
}

/// Whether a process with `pid` exists. Assumes alive when it cannot tell.
pub fn pid_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    probe_pid(pid)
}

#[cfg(unix)]
fn probe_pid(pid: u32) -> bool {
    match Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) => status.success(),
        Err(e) => {
            warn!(pid, err = %e, "cannot probe pid; assuming alive");
            true
        }
    }
}

#[cfg(not(unix))]
fn probe_pid(_pid: u32) -> bool {
    true
}
