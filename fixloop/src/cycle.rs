//! The review → fix cycle.
//!
//! One run of [`Engine::run`] is one session: it takes the project lock,
//! opens a session log, and loops reviewer → checkpoint → fixer until the
//! fixer reports `stop_iteration`, the budget runs out, an agent fails for
//! good, or the operator cancels. Every iteration appends exactly one
//! [`IterationEntry`]; the session always ends with a [`SessionEndEntry`],
//! including on unexpected errors (best effort).
//!
//! Collaborators are injected so the state machine runs against fakes in tests.

use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{error, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::log_entry::{
    CycleStatus, IterationEntry, IterationError, LogEntry, Phase, RoleDescriptor, RollbackOutcome,
    SessionEndEntry, SystemEntry,
};
use crate::core::structured::extract_text;
use crate::core::types::{AgentRole, FixSummary, ReviewPayload, ReviewSummary};
use crate::invoke::{Attempted, Invoker, StructuredOutcome};
use crate::io::agent::AgentRunner;
use crate::io::checkpoint::{CHECKPOINT_REF_PREFIX, Checkpointer, GitCheckpoint};
use crate::io::config::{FixloopConfig, RoleConfig};
use crate::io::lockfile::{
    LockStatus, LockUpdate, create_lockfile, remove_lockfile, update_lockfile,
};
use crate::io::prompt::Prompts;
use crate::io::session_log::{SessionLogs, create_log_session};

/// Typed reasons a cycle terminated `failed`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CycleError {
    #[error("{role} failed after {attempts} attempt(s) with exit code {exit_code}")]
    AgentExhausted {
        role: AgentRole,
        attempts: u32,
        exit_code: i32,
        /// Why the final attempt failed, when more specific than an exit code.
        #[source]
        cause: Option<Box<CycleError>>,
    },
    #[error("{role} timed out after {timeout_secs}s")]
    AgentTimedOut { role: AgentRole, timeout_secs: u64 },
    #[error("{role} produced no usable summary: {reason}")]
    StructuredOutputMissing { role: AgentRole, reason: String },
    #[error("could not create checkpoint: {message}")]
    CheckpointCreationFailed { message: String },
    #[error("rollback failed: {message}")]
    RollbackFailed { message: String },
}

/// Everything needed to start one session.
#[derive(Debug, Clone)]
pub struct CycleRequest {
    pub project_path: PathBuf,
    pub branch: String,
    pub session_name: String,
    pub logs_dir: PathBuf,
    pub config: FixloopConfig,
    /// Take the per-project lock for the duration of the run.
    pub use_lock: bool,
}

/// Details of a `failed` termination.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureReport {
    pub phase: Phase,
    pub error: CycleError,
    pub exit_code: Option<i32>,
    pub attempts: u32,
    /// Present when a rollback was attempted.
    pub rollback: Option<RollbackOutcome>,
}

impl FailureReport {
    pub fn rollback_error(&self) -> Option<CycleError> {
        match &self.rollback {
            Some(RollbackOutcome {
                success: false,
                message,
            }) => Some(CycleError::RollbackFailed {
                message: message.clone().unwrap_or_default(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleOutcome {
    pub session_id: String,
    pub log_path: PathBuf,
    pub status: CycleStatus,
    pub reason: String,
    /// Iterations started (the simplifier pre-phase is not counted).
    pub iterations: u32,
    pub failure: Option<FailureReport>,
}

const BANNER_WIDTH: usize = 72;

impl CycleOutcome {
    /// Bordered operator warning for `failed` outcomes.
    pub fn failure_banner(&self) -> Option<String> {
        let failure = self.failure.as_ref()?;
        let border = "=".repeat(BANNER_WIDTH);
        let mut out = String::new();
        let _ = writeln!(out, "{border}");
        let _ = writeln!(out, "  FIXLOOP FAILED in the {} phase", failure.phase);
        let _ = writeln!(out, "  {}", failure.error);
        if let Some(exit_code) = failure.exit_code {
            let _ = writeln!(out, "  exit code: {exit_code}");
        }
        if failure.attempts > 0 {
            let _ = writeln!(out, "  attempts:  {}", failure.attempts);
        }
        if failure.phase == Phase::Fixer {
            let _ = writeln!(
                out,
                "  WARNING: the fixer may have left the working tree in an inconsistent state."
            );
        }
        match &failure.rollback {
            Some(RollbackOutcome { success: true, .. }) => {
                let _ = writeln!(out, "  rollback:  succeeded; working tree restored to the checkpoint");
            }
            Some(RollbackOutcome {
                success: false,
                message,
            }) => {
                let _ = writeln!(
                    out,
                    "  rollback:  FAILED: {}",
                    message.as_deref().unwrap_or("unknown error")
                );
                let _ = writeln!(
                    out,
                    "  Automatic recovery failed. Restore the tree manually from git history"
                );
                let _ = writeln!(out, "  or the checkpoint refs under {CHECKPOINT_REF_PREFIX}.");
            }
            None => {}
        }
        let _ = writeln!(out, "  session log: {}", self.log_path.display());
        let _ = write!(out, "{border}");
        Some(out)
    }
}

/// The cycle state machine with its collaborators.
pub struct Engine<'a, A: AgentRunner, C: Checkpointer, P: Prompts> {
    runner: &'a A,
    checkpoints: &'a C,
    prompts: &'a P,
    logs: &'a SessionLogs,
    sleep: fn(Duration),
}

/// Internal terminal state before it is written to the log.
struct Termination {
    status: CycleStatus,
    reason: String,
    failure: Option<FailureReport>,
}

impl Termination {
    fn failed(reason: String, failure: FailureReport) -> Self {
        Self {
            status: CycleStatus::Failed,
            reason,
            failure: Some(failure),
        }
    }
}

/// Per-session state shared by the phases.
struct Session<'r> {
    id: String,
    log_path: PathBuf,
    project: String,
    request: &'r CycleRequest,
    iterations: u32,
    issues: IssueState,
}

/// Best-known issue state, reported when a run is interrupted.
#[derive(Debug, Clone, Copy, Default)]
struct IssueState {
    reviewed: bool,
    /// `None` when the last review came back as raw text.
    findings: Option<usize>,
    /// Fixes applied and skipped since the last review.
    fixed: Option<(usize, usize)>,
}

impl fmt::Display for IssueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.reviewed {
            return f.write_str("no review completed");
        }
        match self.findings {
            Some(n) => write!(f, "last review reported {n} finding(s)")?,
            None => f.write_str("last review was unstructured")?,
        }
        if let Some((applied, skipped)) = self.fixed {
            write!(f, ", fixer applied {applied} and skipped {skipped}")?;
        }
        Ok(())
    }
}

impl Session<'_> {
    fn project_path(&self) -> &Path {
        &self.request.project_path
    }

    fn config(&self) -> &FixloopConfig {
        &self.request.config
    }
}

/// Removes the project lock when the run ends, however it ends.
struct LockGuard {
    logs_dir: PathBuf,
    project: String,
    session_id: String,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = remove_lockfile(&self.logs_dir, &self.project, &self.session_id) {
            warn!(err = %format!("{e:#}"), "failed to remove lock");
        }
    }
}

impl<'a, A: AgentRunner, C: Checkpointer, P: Prompts> Engine<'a, A, C, P> {
    pub fn new(runner: &'a A, checkpoints: &'a C, prompts: &'a P, logs: &'a SessionLogs) -> Self {
        Self {
            runner,
            checkpoints,
            prompts,
            logs,
            sleep: std::thread::sleep,
        }
    }

    /// Replace the backoff sleep (tests pass a no-op).
    pub fn with_sleep(mut self, sleep: fn(Duration)) -> Self {
        self.sleep = sleep;
        self
    }

    /// Run one session to completion.
    ///
    /// Agent, parse, checkpoint and rollback failures become a `failed`
    /// outcome. `Err` is reserved for the lock or log filesystem failing (and
    /// for a lock held by another live session).
    #[instrument(skip_all, fields(project = %request.project_path.display(), branch = %request.branch))]
    pub fn run(&self, request: &CycleRequest, cancel: &CancelToken) -> Result<CycleOutcome> {
        request.config.validate()?;
        let session_id = hex::encode(rand::random::<[u8; 6]>());
        let project = request.project_path.display().to_string();

        let _lock = if request.use_lock {
            create_lockfile(
                &request.logs_dir,
                &project,
                &session_id,
                &request.session_name,
                &request.branch,
            )?;
            Some(LockGuard {
                logs_dir: request.logs_dir.clone(),
                project: project.clone(),
                session_id: session_id.clone(),
            })
        } else {
            None
        };

        let started_at = Utc::now();
        let log_path = create_log_session(&request.logs_dir, &project, &request.branch, started_at)?;
        info!(session_id = %session_id, log = %log_path.display(), "session started");
        self.logs.append(
            &log_path,
            &LogEntry::System(SystemEntry {
                timestamp: started_at,
                session_id: session_id.clone(),
                session_name: request.session_name.clone(),
                project_path: project.clone(),
                branch: request.branch.clone(),
                reviewer: describe(&request.config.reviewer),
                fixer: describe(&request.config.fixer),
                simplifier: request.config.simplifier.as_ref().map(describe),
                max_iterations: request.config.max_iterations,
                force_max_iterations: request.config.force_max_iterations,
            }),
        )?;

        let mut session = Session {
            id: session_id,
            log_path,
            project,
            request,
            iterations: 0,
            issues: IssueState::default(),
        };

        match self.drive(&mut session, cancel) {
            Ok(termination) => self.finish(&session, termination),
            Err(e) => {
                error!(err = %format!("{e:#}"), "cycle aborted by unexpected error");
                let end = LogEntry::SessionEnd(SessionEndEntry {
                    timestamp: Utc::now(),
                    status: CycleStatus::Failed,
                    reason: format!("unexpected error: {e:#}"),
                    iterations: session.iterations,
                });
                if let Err(log_err) = self.logs.append(&session.log_path, &end) {
                    warn!(err = %format!("{log_err:#}"), "could not record session end");
                }
                if request.use_lock
                    && let Err(lock_err) = update_lockfile(
                        &request.logs_dir,
                        &session.project,
                        &session.id,
                        &LockUpdate {
                            status: Some(LockStatus::Failed),
                            ..LockUpdate::default()
                        },
                    )
                {
                    warn!(err = %format!("{lock_err:#}"), "could not mark lock failed");
                }
                Err(e)
            }
        }
    }

    fn finish(&self, session: &Session<'_>, termination: Termination) -> Result<CycleOutcome> {
        self.logs.append(
            &session.log_path,
            &LogEntry::SessionEnd(SessionEndEntry {
                timestamp: Utc::now(),
                status: termination.status,
                reason: termination.reason.clone(),
                iterations: session.iterations,
            }),
        )?;
        self.update_lock(
            session,
            LockUpdate {
                status: Some(if termination.status == CycleStatus::Failed {
                    LockStatus::Failed
                } else {
                    LockStatus::Completed
                }),
                current_agent: Some(None),
                iteration: None,
            },
        )?;
        info!(status = %termination.status, iterations = session.iterations, reason = %termination.reason, "session finished");
        Ok(CycleOutcome {
            session_id: session.id.clone(),
            log_path: session.log_path.clone(),
            status: termination.status,
            reason: termination.reason,
            iterations: session.iterations,
            failure: termination.failure,
        })
    }

    fn drive(&self, session: &mut Session<'_>, cancel: &CancelToken) -> Result<Termination> {
        let config = session.config().clone();
        let invoker = Invoker {
            runner: self.runner,
            policy: config.retry,
            timeout: Duration::from_secs(config.agent_timeout_secs),
            sleep: self.sleep,
        };

        if config.simplifier.is_some() {
            if cancel.is_cancelled() {
                return Ok(interrupted(format!(
                    "interrupted before the simplifier ran; {}",
                    session.issues
                )));
            }
            if let Some(termination) = self.simplify(session, &invoker)? {
                return Ok(termination);
            }
        }

        let mut last_stop = false;
        for iteration in 1..=config.max_iterations {
            if cancel.is_cancelled() {
                return Ok(interrupted(format!(
                    "interrupted before iteration {iteration}; {}",
                    session.issues
                )));
            }
            session.iterations = iteration;
            match self.iterate(session, &invoker, iteration, cancel)? {
                Step::Continue { stop } => {
                    last_stop = stop;
                    if stop && !config.force_max_iterations {
                        return Ok(Termination {
                            status: CycleStatus::Success,
                            reason: format!(
                                "fixer reported no remaining issues after {iteration} iteration(s)"
                            ),
                            failure: None,
                        });
                    }
                }
                Step::Stop(termination) => return Ok(termination),
            }
        }

        if config.force_max_iterations && last_stop {
            return Ok(Termination {
                status: CycleStatus::Success,
                reason: format!(
                    "completed all {} forced iterations; fixer reported no remaining issues",
                    config.max_iterations
                ),
                failure: None,
            });
        }
        Ok(Termination {
            status: CycleStatus::MaxIterations,
            reason: format!(
                "max iterations reached ({}); issues may remain",
                config.max_iterations
            ),
            failure: None,
        })
    }

    #[instrument(skip_all, fields(iteration))]
    fn iterate<R: AgentRunner>(
        &self,
        session: &mut Session<'_>,
        invoker: &Invoker<'_, R>,
        iteration: u32,
        cancel: &CancelToken,
    ) -> Result<Step> {
        let started = Instant::now();
        let request = session.request;
        let config = &request.config;
        self.update_lock(
            session,
            LockUpdate {
                status: Some(LockStatus::Running),
                current_agent: Some(Some(AgentRole::Reviewer)),
                iteration: Some(iteration),
            },
        )?;

        let reviewer_prompt = self.prompts.reviewer(iteration)?;
        let review_outcome = invoker.invoke_structured::<ReviewSummary>(
            AgentRole::Reviewer,
            &reviewer_prompt,
            config.reviewer.structured_output,
            |failure| {
                Ok(reviewer_prompt.clone()
                    + &self
                        .prompts
                        .retry_reminder(AgentRole::Reviewer, &failure.reason)?)
            },
        )?;
        let review = match review_outcome {
            StructuredOutcome::AgentFailed(attempted) => {
                let failure = agent_failure(Phase::Reviewer, AgentRole::Reviewer, &attempted, config);
                self.log_iteration(
                    session,
                    iteration,
                    started,
                    Some(iteration_error(&failure)),
                    None,
                    None,
                    None,
                )?;
                return Ok(Step::Stop(Termination::failed(
                    failure.error.to_string(),
                    failure,
                )));
            }
            StructuredOutcome::Parsed { parsed, .. } => {
                info!(findings = parsed.value.findings.len(), "review parsed");
                ReviewPayload::Structured(parsed.value)
            }
            StructuredOutcome::Missing {
                failure,
                raw_output,
                ..
            } => {
                warn!(reason = %failure.reason, "using raw review text");
                ReviewPayload::Raw {
                    text: extract_text(&raw_output).unwrap_or_default(),
                }
            }
        };

        session.issues = IssueState {
            reviewed: true,
            findings: review.finding_count(),
            fixed: None,
        };

        if cancel.is_cancelled() {
            self.log_iteration(session, iteration, started, None, Some(review), None, None)?;
            return Ok(Step::Stop(interrupted(format!(
                "interrupted before the fixer ran in iteration {iteration}; {}",
                session.issues
            ))));
        }

        let checkpoint_id = format!("{}-iter{iteration}", session.id);
        let checkpoint = match self.checkpoints.create(session.project_path(), &checkpoint_id) {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                error!(err = %format!("{e:#}"), "checkpoint creation failed");
                let failure = FailureReport {
                    phase: Phase::Checkpoint,
                    error: CycleError::CheckpointCreationFailed {
                        message: format!("{e:#}"),
                    },
                    exit_code: None,
                    attempts: 0,
                    rollback: None,
                };
                self.log_iteration(
                    session,
                    iteration,
                    started,
                    Some(iteration_error(&failure)),
                    Some(review),
                    None,
                    None,
                )?;
                return Ok(Step::Stop(Termination::failed(
                    failure.error.to_string(),
                    failure,
                )));
            }
        };

        self.update_lock(
            session,
            LockUpdate {
                current_agent: Some(Some(AgentRole::Fixer)),
                ..LockUpdate::default()
            },
        )?;
        let fixer_prompt = self.prompts.fixer(iteration, &review)?;
        let fix_outcome = invoker.invoke_structured::<FixSummary>(
            AgentRole::Fixer,
            &fixer_prompt,
            config.fixer.structured_output,
            |failure| {
                Ok(fixer_prompt.clone()
                    + &self
                        .prompts
                        .retry_reminder(AgentRole::Fixer, &failure.reason)?)
            },
        )?;

        match fix_outcome {
            StructuredOutcome::Parsed { parsed, .. } => {
                if let Err(e) = self.checkpoints.discard(session.project_path(), &checkpoint) {
                    warn!(err = %format!("{e:#}"), "failed to discard checkpoint");
                }
                let fix = parsed.value;
                let stop = fix.stop_iteration;
                session.issues.fixed = Some((fix.fixes.len(), fix.skipped.len()));
                info!(
                    decision = ?fix.decision,
                    fixes = fix.fixes.len(),
                    skipped = fix.skipped.len(),
                    stop,
                    "fix applied"
                );
                self.log_iteration(session, iteration, started, None, Some(review), Some(fix), None)?;
                Ok(Step::Continue { stop })
            }
            StructuredOutcome::AgentFailed(attempted) => {
                let mut failure = agent_failure(Phase::Fixer, AgentRole::Fixer, &attempted, config);
                failure.rollback = Some(self.rollback(session.project_path(), &checkpoint));
                self.log_iteration(
                    session,
                    iteration,
                    started,
                    Some(iteration_error(&failure)),
                    Some(review),
                    None,
                    failure.rollback.clone(),
                )?;
                Ok(Step::Stop(Termination::failed(
                    failure.error.to_string(),
                    failure,
                )))
            }
            StructuredOutcome::Missing {
                failure: parse_failure,
                attempts,
                ..
            } => {
                let mut failure = FailureReport {
                    phase: Phase::Fixer,
                    error: CycleError::StructuredOutputMissing {
                        role: AgentRole::Fixer,
                        reason: parse_failure.reason,
                    },
                    exit_code: Some(0),
                    attempts,
                    rollback: None,
                };
                failure.rollback = Some(self.rollback(session.project_path(), &checkpoint));
                self.log_iteration(
                    session,
                    iteration,
                    started,
                    Some(iteration_error(&failure)),
                    Some(review),
                    None,
                    failure.rollback.clone(),
                )?;
                Ok(Step::Stop(Termination::failed(
                    failure.error.to_string(),
                    failure,
                )))
            }
        }
    }

    /// Optional pre-phase. Its output is not parsed; only success matters.
    #[instrument(skip_all)]
    fn simplify<R: AgentRunner>(
        &self,
        session: &Session<'_>,
        invoker: &Invoker<'_, R>,
    ) -> Result<Option<Termination>> {
        let started = Instant::now();
        self.update_lock(
            session,
            LockUpdate {
                status: Some(LockStatus::Running),
                current_agent: Some(Some(AgentRole::Simplifier)),
                iteration: None,
            },
        )?;

        let checkpoint_id = format!("{}-simplify", session.id);
        let checkpoint = match self.checkpoints.create(session.project_path(), &checkpoint_id) {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                let failure = FailureReport {
                    phase: Phase::Checkpoint,
                    error: CycleError::CheckpointCreationFailed {
                        message: format!("{e:#}"),
                    },
                    exit_code: None,
                    attempts: 0,
                    rollback: None,
                };
                self.log_iteration(
                    session,
                    0,
                    started,
                    Some(iteration_error(&failure)),
                    None,
                    None,
                    None,
                )?;
                return Ok(Some(Termination::failed(failure.error.to_string(), failure)));
            }
        };

        let prompt = self.prompts.simplifier()?;
        let attempted = invoker.invoke(AgentRole::Simplifier, &prompt);
        if attempted.result.success {
            if let Err(e) = self.checkpoints.discard(session.project_path(), &checkpoint) {
                warn!(err = %format!("{e:#}"), "failed to discard checkpoint");
            }
            self.log_iteration(session, 0, started, None, None, None, None)?;
            return Ok(None);
        }

        let mut failure = agent_failure(
            Phase::Simplifier,
            AgentRole::Simplifier,
            &attempted,
            session.config(),
        );
        failure.rollback = Some(self.rollback(session.project_path(), &checkpoint));
        self.log_iteration(
            session,
            0,
            started,
            Some(iteration_error(&failure)),
            None,
            None,
            failure.rollback.clone(),
        )?;
        Ok(Some(Termination::failed(failure.error.to_string(), failure)))
    }

    fn rollback(&self, project: &Path, checkpoint: &GitCheckpoint) -> RollbackOutcome {
        match self.checkpoints.rollback(project, checkpoint) {
            Ok(()) => RollbackOutcome {
                success: true,
                message: None,
            },
            Err(e) => {
                error!(err = %format!("{e:#}"), kind = checkpoint.kind(), "rollback failed");
                RollbackOutcome {
                    success: false,
                    message: Some(format!("{e:#}")),
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn log_iteration(
        &self,
        session: &Session<'_>,
        iteration: u32,
        started: Instant,
        error: Option<IterationError>,
        review: Option<ReviewPayload>,
        fix: Option<FixSummary>,
        rollback: Option<RollbackOutcome>,
    ) -> Result<()> {
        self.logs
            .append(
                &session.log_path,
                &LogEntry::Iteration(IterationEntry {
                    timestamp: Utc::now(),
                    iteration,
                    duration_ms: started.elapsed().as_millis() as u64,
                    error,
                    review,
                    fix,
                    rollback,
                }),
            )
            .context("record iteration")
    }

    fn update_lock(&self, session: &Session<'_>, update: LockUpdate) -> Result<()> {
        if !session.request.use_lock {
            return Ok(());
        }
        update_lockfile(
            &session.request.logs_dir,
            &session.project,
            &session.id,
            &update,
        )
    }
}

enum Step {
    Continue { stop: bool },
    Stop(Termination),
}

fn interrupted(reason: String) -> Termination {
    warn!(%reason, "cycle interrupted");
    Termination {
        status: CycleStatus::Interrupted,
        reason,
        failure: None,
    }
}

fn describe(role: &RoleConfig) -> RoleDescriptor {
    RoleDescriptor {
        agent: role.agent.to_string(),
        model: role.model.clone(),
    }
}

fn agent_failure(
    phase: Phase,
    role: AgentRole,
    attempted: &Attempted,
    config: &FixloopConfig,
) -> FailureReport {
    let cause = attempted.result.timed_out.then(|| {
        Box::new(CycleError::AgentTimedOut {
            role,
            timeout_secs: config.agent_timeout_secs,
        })
    });
    FailureReport {
        phase,
        error: CycleError::AgentExhausted {
            role,
            attempts: attempted.attempts,
            exit_code: attempted.result.exit_code,
            cause,
        },
        exit_code: Some(attempted.result.exit_code),
        attempts: attempted.attempts,
        rollback: None,
    }
}

fn iteration_error(failure: &FailureReport) -> IterationError {
    let mut message = failure.error.to_string();
    if let CycleError::AgentExhausted {
        cause: Some(cause), ..
    } = &failure.error
    {
        message = format!("{message} ({cause})");
    }
    IterationError {
        phase: failure.phase,
        message,
        exit_code: failure.exit_code,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(failure: FailureReport) -> CycleOutcome {
        CycleOutcome {
            session_id: "abc".to_string(),
            log_path: PathBuf::from("/tmp/log.jsonl"),
            status: CycleStatus::Failed,
            reason: failure.error.to_string(),
            iterations: 1,
            failure: Some(failure),
        }
    }

    #[test]
    fn fixer_banner_warns_about_tree_and_rollback() {
        let banner = outcome(FailureReport {
            phase: Phase::Fixer,
            error: CycleError::AgentExhausted {
                role: AgentRole::Fixer,
                attempts: 3,
                exit_code: 1,
                cause: None,
            },
            exit_code: Some(1),
            attempts: 3,
            rollback: Some(RollbackOutcome {
                success: false,
                message: Some("git reset failed".to_string()),
            }),
        })
        .failure_banner()
        .expect("banner");
        assert!(banner.starts_with(&"=".repeat(BANNER_WIDTH)));
        assert!(banner.contains("fixer phase"));
        assert!(banner.contains("exit code: 1"));
        assert!(banner.contains("attempts:  3"));
        assert!(banner.contains("inconsistent state"));
        assert!(banner.contains("FAILED: git reset failed"));
        assert!(banner.contains("refs/fixloop/checkpoints/"));
    }

    #[test]
    fn reviewer_banner_has_no_tree_warning() {
        let banner = outcome(FailureReport {
            phase: Phase::Reviewer,
            error: CycleError::AgentExhausted {
                role: AgentRole::Reviewer,
                attempts: 1,
                exit_code: 124,
                cause: Some(Box::new(CycleError::AgentTimedOut {
                    role: AgentRole::Reviewer,
                    timeout_secs: 60,
                })),
            },
            exit_code: Some(124),
            attempts: 1,
            rollback: None,
        })
        .failure_banner()
        .expect("banner");
        assert!(!banner.contains("inconsistent"));
        assert!(!banner.contains("rollback"));
    }

    #[test]
    fn timeout_cause_is_recorded_in_iteration_error() {
        let failure = FailureReport {
            phase: Phase::Reviewer,
            error: CycleError::AgentExhausted {
                role: AgentRole::Reviewer,
                attempts: 2,
                exit_code: 124,
                cause: Some(Box::new(CycleError::AgentTimedOut {
                    role: AgentRole::Reviewer,
                    timeout_secs: 60,
                })),
            },
            exit_code: Some(124),
            attempts: 2,
            rollback: None,
        };
        let err = iteration_error(&failure);
        assert_eq!(err.phase, Phase::Reviewer);
        assert!(err.message.contains("timed out after 60s"), "{}", err.message);
        assert_eq!(err.exit_code, Some(124));
    }

    #[test]
    fn failed_rollback_surfaces_as_typed_error() {
        let failure = FailureReport {
            phase: Phase::Fixer,
            error: CycleError::StructuredOutputMissing {
                role: AgentRole::Fixer,
                reason: "no JSON".to_string(),
            },
            exit_code: Some(0),
            attempts: 2,
            rollback: Some(RollbackOutcome {
                success: false,
                message: Some("boom".to_string()),
            }),
        };
        assert_eq!(
            failure.rollback_error(),
            Some(CycleError::RollbackFailed {
                message: "boom".to_string()
            })
        );
    }
}
