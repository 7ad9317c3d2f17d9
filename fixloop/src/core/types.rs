//! Shared deterministic types for the review/fix cycle.
//!
//! These types define stable contracts between the engine, the parser and the
//! session log. They do not depend on external state or I/O.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Exit code reported for an invocation killed by its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Exit code reported when the agent process could not be spawned at all.
pub const SPAWN_FAILED_EXIT_CODE: i32 = -1;

/// The external agent roles driven by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Reviewer,
    Fixer,
    Simplifier,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Reviewer => "reviewer",
            AgentRole::Fixer => "fixer",
            AgentRole::Simplifier => "simplifier",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one external process call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInvocationResult {
    pub success: bool,
    pub exit_code: i32,
    /// Agent text after per-agent extraction (e.g. the final message of a stream).
    pub raw_output: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl AgentInvocationResult {
    /// Result used when the process never started.
    pub fn spawn_failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: SPAWN_FAILED_EXIT_CODE,
            raw_output: message.into(),
            duration_ms: 0,
            timed_out: false,
        }
    }
}

/// Issue priority, `P0` being the most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
}

/// A single reviewer finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewFinding {
    pub title: String,
    pub body: String,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_start: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_end: Option<u32>,
}

/// Structured envelope emitted by the reviewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewSummary {
    pub findings: Vec<ReviewFinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall_correctness: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

/// What the engine hands to the fixer: a parsed summary, or the reviewer's raw
/// text when no structured envelope could be recovered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewPayload {
    Structured(ReviewSummary),
    Raw { text: String },
}

impl ReviewPayload {
    /// Number of findings, when known.
    pub fn finding_count(&self) -> Option<usize> {
        match self {
            ReviewPayload::Structured(summary) => Some(summary.findings.len()),
            ReviewPayload::Raw { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FixDecision {
    NoChangesNeeded,
    ApplySelectively,
    ApplyMost,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixEntry {
    pub id: u32,
    pub title: String,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub claim: String,
    pub evidence: String,
    pub fix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedEntry {
    pub id: u32,
    pub title: String,
    pub reason: String,
}

/// Structured envelope emitted by the fixer.
///
/// `stop_iteration` is the authoritative "no more issues" signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixSummary {
    pub decision: FixDecision,
    pub fixes: Vec<FixEntry>,
    pub skipped: Vec<SkippedEntry>,
    pub stop_iteration: bool,
}

/// Counts keyed by priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityCounts {
    pub p0: u32,
    pub p1: u32,
    pub p2: u32,
    pub p3: u32,
}

impl PriorityCounts {
    pub fn add(&mut self, priority: Priority) {
        match priority {
            Priority::P0 => self.p0 += 1,
            Priority::P1 => self.p1 += 1,
            Priority::P2 => self.p2 += 1,
            Priority::P3 => self.p3 += 1,
        }
    }
}
