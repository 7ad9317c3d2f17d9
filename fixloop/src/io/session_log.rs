//! Append-only session logs (newline-delimited JSON) and their summary caches.
//!
//! # Layout
//!
//! ```text
//! <logs_dir>/<sanitized project path>/<YYYYMMDD-HHMMSS-mmm>_<branch>.jsonl
//! <logs_dir>/<sanitized project path>/<YYYYMMDD-HHMMSS-mmm>_<branch>.summary.json
//! ```
//!
//! The log is the product artifact: one [`LogEntry`] per line, never rewritten.
//! The summary cache is derived and may be stale or missing; readers rebuild
//! it from the log whenever it is older than the log file.
//!
//! Appends go through a [`SessionLogs`] store which keeps one writer per path.
//! Each writer sits behind its own mutex so appends to one path never
//! interleave, and carries the running [`SessionSummary`] so the cache is
//! updated without re-scanning. A writer is only reused while the file still
//! has the length it last wrote; anything else (rotation, truncation, another
//! process appending) falls back to a full re-read.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::core::log_entry::LogEntry;
use crate::core::path::{sanitize_component, session_stem};
use crate::core::summary::SessionSummary;

pub const LOG_EXTENSION: &str = "jsonl";
const SUMMARY_EXTENSION: &str = "summary.json";
/// Bytes before the cursor offset that are hashed into the boundary probe.
const PROBE_WINDOW: u64 = 64;
const PROBE_HEX_LEN: usize = 16;

/// Create a new, empty session log file and return its path.
///
/// The name is derived from `started_at` and `branch`; on collision a numeric
/// suffix is appended so concurrent sessions never share a file.
#[instrument(skip_all, fields(logs_dir = %logs_dir.display(), branch))]
pub fn create_log_session(
    logs_dir: &Path,
    project_path: &str,
    branch: &str,
    started_at: DateTime<Utc>,
) -> Result<PathBuf> {
    let dir = logs_dir.join(sanitize_component(project_path));
    fs::create_dir_all(&dir).with_context(|| format!("create directory {}", dir.display()))?;

    let stem = session_stem(started_at, branch);
    for attempt in 0u32..1_000 {
        let name = if attempt == 0 {
            format!("{stem}.{LOG_EXTENSION}")
        } else {
            format!("{stem}-{}.{LOG_EXTENSION}", attempt + 1)
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => {
                debug!(path = %path.display(), "session log created");
                return Ok(path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("create session log {}", path.display()));
            }
        }
    }
    Err(anyhow!(
        "too many session logs named {stem} in {}",
        dir.display()
    ))
}

/// Path of the summary cache that belongs to `log_path`.
pub fn summary_path(log_path: &Path) -> PathBuf {
    log_path.with_extension(SUMMARY_EXTENSION)
}

struct ActiveWriter {
    file: File,
    /// File length after our last write; used to detect foreign modification.
    len: u64,
    summary: SessionSummary,
}

/// Per-process registry of open session log writers.
#[derive(Default)]
pub struct SessionLogs {
    writers: Mutex<HashMap<PathBuf, Arc<Mutex<ActiveWriter>>>>,
}

impl SessionLogs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one entry and refresh the summary cache.
    ///
    /// A [`LogEntry::SessionEnd`] closes the writer for `path`.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn append(&self, path: &Path, entry: &LogEntry) -> Result<()> {
        let writer = self.writer_for(path)?;
        let mut writer = writer
            .lock()
            .map_err(|_| anyhow!("session log writer poisoned: {}", path.display()))?;

        let mut line = serde_json::to_string(entry).context("serialize log entry")?;
        line.push('\n');
        writer
            .file
            .write_all(line.as_bytes())
            .with_context(|| format!("append to {}", path.display()))?;
        writer.len += line.len() as u64;
        writer.summary.apply(entry);
        write_summary_cache(path, &writer.summary)?;
        drop(writer);

        if matches!(entry, LogEntry::SessionEnd(_)) {
            self.close(path)?;
            debug!("session log closed");
        }
        Ok(())
    }

    /// Running summary for an open writer, if any.
    pub fn current_summary(&self, path: &Path) -> Result<Option<SessionSummary>> {
        let writers = self
            .writers
            .lock()
            .map_err(|_| anyhow!("session log registry poisoned"))?;
        let Some(writer) = writers.get(path) else {
            return Ok(None);
        };
        let writer = writer
            .lock()
            .map_err(|_| anyhow!("session log writer poisoned: {}", path.display()))?;
        Ok(Some(writer.summary.clone()))
    }

    /// Drop the writer for `path`. Later appends reopen it.
    pub fn close(&self, path: &Path) -> Result<()> {
        self.writers
            .lock()
            .map_err(|_| anyhow!("session log registry poisoned"))?
            .remove(path);
        Ok(())
    }

    fn writer_for(&self, path: &Path) -> Result<Arc<Mutex<ActiveWriter>>> {
        let mut writers = self
            .writers
            .lock()
            .map_err(|_| anyhow!("session log registry poisoned"))?;

        if let Some(existing) = writers.get(path) {
            let expected = existing
                .lock()
                .map_err(|_| anyhow!("session log writer poisoned: {}", path.display()))?
                .len;
            let actual = fs::metadata(path).map(|m| m.len()).ok();
            if actual == Some(expected) {
                return Ok(Arc::clone(existing));
            }
            warn!(
                path = %path.display(),
                expected,
                actual = ?actual,
                "session log changed underneath its writer; reopening"
            );
            writers.remove(path);
        }

        let writer = Arc::new(Mutex::new(open_writer(path)?));
        writers.insert(path.to_path_buf(), Arc::clone(&writer));
        Ok(writer)
    }
}

/// Open `path` for appending after a full read that rebuilds the summary.
fn open_writer(path: &Path) -> Result<ActiveWriter> {
    let summary = if path.exists() {
        SessionSummary::from_entries(&read_log(path)?)
    } else {
        SessionSummary::default()
    };
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .read(true)
        .open(path)
        .with_context(|| format!("open session log {}", path.display()))?;
    let mut len = file
        .metadata()
        .with_context(|| format!("stat {}", path.display()))?
        .len();

    // A crash mid-write can leave a torn final line; start the next entry on a fresh line.
    if len > 0 {
        let mut last = [0u8; 1];
        file.seek(SeekFrom::Start(len - 1))
            .with_context(|| format!("seek {}", path.display()))?;
        file.read_exact(&mut last)
            .with_context(|| format!("read {}", path.display()))?;
        if last[0] != b'\n' {
            warn!(path = %path.display(), "session log ends in a partial line");
            file.write_all(b"\n")
                .with_context(|| format!("append to {}", path.display()))?;
            len += 1;
        }
    }

    debug!(path = %path.display(), entries = summary.entry_count, "session log writer opened");
    Ok(ActiveWriter { file, len, summary })
}

fn write_summary_cache(log_path: &Path, summary: &SessionSummary) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(summary).context("serialize session summary")?;
    buf.push('\n');
    write_atomic(&summary_path(log_path), &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("summary path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = super::temp_sibling(path);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp summary {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace summary {}", path.display()))?;
    Ok(())
}

/// Read every entry in the log. Malformed lines are skipped with a warning.
pub fn read_log(path: &Path) -> Result<Vec<LogEntry>> {
    let bytes = fs::read(path).with_context(|| format!("read session log {}", path.display()))?;
    Ok(parse_lines(path, &bytes))
}

fn parse_lines(path: &Path, bytes: &[u8]) -> Vec<LogEntry> {
    let mut entries = Vec::new();
    for (idx, line) in bytes.split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<LogEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                warn!(path = %path.display(), line = idx + 1, err = %e, "skipping malformed log line");
            }
        }
    }
    entries
}

/// Position of an incremental reader within a log file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogCursor {
    /// End of the last complete line consumed.
    pub offset: u64,
    /// File length observed by the read that produced this cursor.
    pub len: u64,
    pub mtime_ms: u64,
    /// Short SHA-256 of the bytes just before `offset`.
    pub probe: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IncrementalRead {
    pub entries: Vec<LogEntry>,
    pub cursor: LogCursor,
    /// True when the previous cursor was invalid and the file was read from the start.
    pub reset: bool,
}

/// Read entries appended since `previous`.
///
/// When the file shrank, got older, or the bytes before the old offset
/// changed, the cursor is discarded and the whole file is re-read. A trailing
/// line without a newline is left for the next call.
#[instrument(skip_all, fields(path = %path.display(), resume = previous.is_some()))]
pub fn read_log_incremental(path: &Path, previous: Option<&LogCursor>) -> Result<IncrementalRead> {
    let mut file = File::open(path).with_context(|| format!("open session log {}", path.display()))?;
    let meta = file
        .metadata()
        .with_context(|| format!("stat {}", path.display()))?;
    let len = meta.len();
    let mtime_ms = modified_ms(&meta);

    let (start, reset) = match previous {
        Some(cursor) if cursor_still_valid(&mut file, cursor, len, mtime_ms)? => {
            (cursor.offset, false)
        }
        Some(_) => {
            debug!("log rewritten underneath cursor; re-reading from start");
            (0, true)
        }
        None => (0, false),
    };

    file.seek(SeekFrom::Start(start))
        .with_context(|| format!("seek {}", path.display()))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .with_context(|| format!("read session log {}", path.display()))?;

    let complete = buf
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |idx| idx + 1);
    let entries = parse_lines(path, &buf[..complete]);
    let offset = start + complete as u64;
    let probe = boundary_probe(&mut file, offset)?;

    Ok(IncrementalRead {
        entries,
        cursor: LogCursor {
            offset,
            len: start + buf.len() as u64,
            mtime_ms,
            probe,
        },
        reset,
    })
}

fn cursor_still_valid(file: &mut File, cursor: &LogCursor, len: u64, mtime_ms: u64) -> Result<bool> {
    if len < cursor.len || len < cursor.offset {
        return Ok(false);
    }
    if mtime_ms < cursor.mtime_ms {
        return Ok(false);
    }
    Ok(boundary_probe(file, cursor.offset)? == cursor.probe)
}

fn boundary_probe(file: &mut File, offset: u64) -> Result<String> {
    let start = offset.saturating_sub(PROBE_WINDOW);
    let mut window = vec![0u8; (offset - start) as usize];
    file.seek(SeekFrom::Start(start)).context("seek probe window")?;
    file.read_exact(&mut window).context("read probe window")?;
    let digest = Sha256::digest(&window);
    let mut probe = hex::encode(digest);
    probe.truncate(PROBE_HEX_LEN);
    Ok(probe)
}

fn modified_ms(meta: &fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_millis() as u64)
}

/// Summary for a session, from the cache when it is at least as new as the log.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn compute_session_stats(path: &Path) -> Result<SessionSummary> {
    let log_meta = fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    let cache = summary_path(path);
    if let Ok(cache_meta) = fs::metadata(&cache)
        && modified_ms(&cache_meta) >= modified_ms(&log_meta)
    {
        match fs::read_to_string(&cache)
            .map_err(anyhow::Error::from)
            .and_then(|raw| serde_json::from_str::<SessionSummary>(&raw).map_err(Into::into))
        {
            Ok(summary) => {
                debug!("using cached session summary");
                return Ok(summary);
            }
            Err(e) => warn!(cache = %cache.display(), err = %e, "unreadable summary cache"),
        }
    }

    let summary = SessionSummary::from_entries(&read_log(path)?);
    write_summary_cache(path, &summary)?;
    debug!(entries = summary.entry_count, "session summary rebuilt");
    Ok(summary)
}

/// All session logs under `logs_dir`, oldest first.
pub fn list_sessions(logs_dir: &Path) -> Result<Vec<PathBuf>> {
    if !logs_dir.exists() {
        return Ok(Vec::new());
    }
    let mut sessions = Vec::new();
    for entry in WalkDir::new(logs_dir).min_depth(2).max_depth(2) {
        let entry = entry.with_context(|| format!("walk {}", logs_dir.display()))?;
        let path = entry.path();
        if entry.file_type().is_file()
            && path.extension().is_some_and(|ext| ext == LOG_EXTENSION)
        {
            sessions.push(path.to_path_buf());
        }
    }
    sessions.sort_by(|a, b| a.file_name().cmp(&b.file_name()).then_with(|| a.cmp(b)));
    Ok(sessions)
}

/// Most recent session log, optionally restricted to one project.
pub fn latest_session(logs_dir: &Path, project_path: Option<&str>) -> Result<Option<PathBuf>> {
    let project_dir = project_path.map(|p| logs_dir.join(sanitize_component(p)));
    let sessions = list_sessions(logs_dir)?;
    Ok(sessions
        .into_iter()
        .filter(|path| match &project_dir {
            Some(dir) => path.parent() == Some(dir.as_path()),
            None => true,
        })
        .next_back())
}

/// Delete a session log together with its summary cache.
pub fn delete_session(path: &Path) -> Result<()> {
    fs::remove_file(path).with_context(|| format!("remove session log {}", path.display()))?;
    let cache = summary_path(path);
    if cache.exists() {
        fs::remove_file(&cache).with_context(|| format!("remove {}", cache.display()))?;
    }
    Ok(())
}
