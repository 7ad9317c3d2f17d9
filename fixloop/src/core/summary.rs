//! Derived rollup of a session log.
//!
//! A [`SessionSummary`] is never authoritative: it can always be rebuilt by
//! folding the log's entries in order. The session log caches it next to the
//! log file so historical sessions can be inspected without a full scan.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::log_entry::{CycleStatus, LogEntry};
use crate::core::types::{PriorityCounts, ReviewPayload};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSummary {
    pub session_id: Option<String>,
    pub session_name: Option<String>,
    pub project_path: Option<String>,
    pub branch: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// `None` while the session is still running (or crashed before ending).
    pub status: Option<CycleStatus>,
    pub end_reason: Option<String>,
    pub entry_count: u64,
    pub iterations: u32,
    pub total_duration_ms: u64,
    /// Findings reported by the reviewer, across all iterations.
    pub findings: PriorityCounts,
    /// Fixes the fixer reported as applied.
    pub fixes: PriorityCounts,
    pub skipped: u32,
    pub errors: u32,
    pub rollbacks: u32,
    pub failed_rollbacks: u32,
}

impl SessionSummary {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a LogEntry>) -> Self {
        let mut summary = Self::default();
        for entry in entries {
            summary.apply(entry);
        }
        summary
    }

    /// Fold one entry into the rollup.
    pub fn apply(&mut self, entry: &LogEntry) {
        self.entry_count += 1;
        match entry {
            LogEntry::System(system) => {
                self.session_id = Some(system.session_id.clone());
                self.session_name = Some(system.session_name.clone());
                self.project_path = Some(system.project_path.clone());
                self.branch = Some(system.branch.clone());
                self.started_at = Some(system.timestamp);
            }
            LogEntry::Iteration(iteration) => {
                self.iterations = self.iterations.max(iteration.iteration);
                self.total_duration_ms += iteration.duration_ms;
                if iteration.error.is_some() {
                    self.errors += 1;
                }
                if let Some(ReviewPayload::Structured(review)) = &iteration.review {
                    for finding in &review.findings {
                        self.findings.add(finding.priority);
                    }
                }
                if let Some(fix) = &iteration.fix {
                    for entry in &fix.fixes {
                        self.fixes.add(entry.priority);
                    }
                    self.skipped += fix.skipped.len() as u32;
                }
                if let Some(rollback) = &iteration.rollback {
                    self.rollbacks += 1;
                    if !rollback.success {
                        self.failed_rollbacks += 1;
                    }
                }
            }
            LogEntry::SessionEnd(end) => {
                self.status = Some(end.status);
                self.end_reason = Some(end.reason.clone());
                self.ended_at = Some(end.timestamp);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.status.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::log_entry::{
        IterationEntry, IterationError, Phase, RoleDescriptor, RollbackOutcome, SessionEndEntry,
        SystemEntry,
    };
    use crate::core::types::{
        FixDecision, FixEntry, FixSummary, Priority, ReviewFinding, ReviewSummary, SkippedEntry,
    };

    fn ts() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).expect("ts")
    }

    fn system() -> LogEntry {
        LogEntry::System(SystemEntry {
            timestamp: ts(),
            session_id: "s-1".to_string(),
            session_name: "demo".to_string(),
            project_path: "/tmp/project".to_string(),
            branch: "main".to_string(),
            reviewer: RoleDescriptor {
                agent: "codex".to_string(),
                model: None,
            },
            fixer: RoleDescriptor {
                agent: "claude".to_string(),
                model: None,
            },
            simplifier: None,
            max_iterations: 5,
            force_max_iterations: false,
        })
    }

    #[test]
    fn folds_fixes_skips_and_rollbacks() {
        let iteration = LogEntry::Iteration(IterationEntry {
            timestamp: ts(),
            iteration: 1,
            duration_ms: 1_500,
            error: None,
            review: Some(ReviewPayload::Structured(ReviewSummary {
                findings: vec![ReviewFinding {
                    title: "bug".to_string(),
                    body: "details".to_string(),
                    priority: Priority::P1,
                    confidence_score: None,
                    file: None,
                    line_start: None,
                    line_end: None,
                }],
                overall_correctness: None,
                explanation: None,
            })),
            fix: Some(FixSummary {
                decision: FixDecision::ApplySelectively,
                fixes: vec![FixEntry {
                    id: 1,
                    title: "bug".to_string(),
                    priority: Priority::P1,
                    file: None,
                    claim: "c".to_string(),
                    evidence: "e".to_string(),
                    fix: "f".to_string(),
                }],
                skipped: vec![SkippedEntry {
                    id: 2,
                    title: "nit".to_string(),
                    reason: "style".to_string(),
                }],
                stop_iteration: false,
            }),
            rollback: None,
        });
        let failed = LogEntry::Iteration(IterationEntry {
            timestamp: ts(),
            iteration: 2,
            duration_ms: 500,
            error: Some(IterationError {
                phase: Phase::Fixer,
                message: "exit 1".to_string(),
                exit_code: Some(1),
            }),
            review: None,
            fix: None,
            rollback: Some(RollbackOutcome {
                success: true,
                message: None,
            }),
        });
        let end = LogEntry::SessionEnd(SessionEndEntry {
            timestamp: ts(),
            status: CycleStatus::Failed,
            reason: "fixer failed".to_string(),
            iterations: 2,
        });

        let summary = SessionSummary::from_entries(&[system(), iteration, failed, end]);
        assert_eq!(summary.entry_count, 4);
        assert_eq!(summary.iterations, 2);
        assert_eq!(summary.total_duration_ms, 2_000);
        assert_eq!(summary.findings.p1, 1);
        assert_eq!(summary.fixes.p1, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.rollbacks, 1);
        assert_eq!(summary.failed_rollbacks, 0);
        assert_eq!(summary.status, Some(CycleStatus::Failed));
        assert!(!summary.is_running());
    }

    #[test]
    fn session_without_end_is_running() {
        let summary = SessionSummary::from_entries(&[system()]);
        assert!(summary.is_running());
        assert_eq!(summary.branch.as_deref(), Some("main"));
    }
}
