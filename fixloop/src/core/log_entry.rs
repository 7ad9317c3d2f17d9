//! Session log records.
//!
//! A session log is newline-delimited JSON with one [`LogEntry`] per line. The
//! first line is always [`LogEntry::System`]; the last line of a finished
//! session is always [`LogEntry::SessionEnd`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{FixSummary, ReviewPayload};

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    /// The fixer reported `stop_iteration`.
    Success,
    /// The budget ran out without a stop signal. Not an error, but issues may remain.
    MaxIterations,
    Failed,
    Interrupted,
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CycleStatus::Success => "success",
            CycleStatus::MaxIterations => "max_iterations",
            CycleStatus::Failed => "failed",
            CycleStatus::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// The phase an iteration error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Simplifier,
    Reviewer,
    Checkpoint,
    Fixer,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Simplifier => "simplifier",
            Phase::Reviewer => "reviewer",
            Phase::Checkpoint => "checkpoint",
            Phase::Fixer => "fixer",
        };
        f.write_str(s)
    }
}

/// Agent identity recorded in the session header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleDescriptor {
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemEntry {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub session_name: String,
    pub project_path: String,
    pub branch: String,
    pub reviewer: RoleDescriptor,
    pub fixer: RoleDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simplifier: Option<RoleDescriptor>,
    pub max_iterations: u32,
    #[serde(default)]
    pub force_max_iterations: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationError {
    pub phase: Phase,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// One completed (or aborted) iteration attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationEntry {
    pub timestamp: DateTime<Utc>,
    pub iteration: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<IterationError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix: Option<FixSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEndEntry {
    pub timestamp: DateTime<Utc>,
    pub status: CycleStatus,
    pub reason: String,
    pub iterations: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEntry {
    System(SystemEntry),
    Iteration(IterationEntry),
    SessionEnd(SessionEndEntry),
}
