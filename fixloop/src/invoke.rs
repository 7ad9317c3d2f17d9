//! Agent invocation with retry, backoff and structured-output recovery.

use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tracing::{info, instrument, warn};

use crate::core::retry::RetryPolicy;
use crate::core::structured::{Envelope, ParseFailure, Parsed, parse_envelope};
use crate::core::types::{AgentInvocationResult, AgentRole};
use crate::io::agent::AgentRunner;

/// Final invocation result plus how many attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted {
    pub result: AgentInvocationResult,
    pub attempts: u32,
}

/// Result of an invocation whose output must carry a summary of type `T`.
#[derive(Debug, Clone)]
pub enum StructuredOutcome<T> {
    /// Every attempt failed at the process level.
    AgentFailed(Attempted),
    Parsed {
        parsed: Parsed<T>,
        attempts: u32,
        /// The summary only appeared after the format reminder.
        reminded: bool,
    },
    /// The agent ran but no summary could be recovered.
    Missing {
        failure: ParseFailure,
        /// Output of the first successful invocation.
        raw_output: String,
        attempts: u32,
    },
}

/// Invocation settings shared by every role in a cycle.
pub struct Invoker<'a, A: AgentRunner + ?Sized> {
    pub runner: &'a A,
    pub policy: RetryPolicy,
    pub timeout: Duration,
    pub sleep: fn(Duration),
}

impl<A: AgentRunner + ?Sized> Invoker<'_, A> {
    /// Invoke once, then retry failures up to `policy.max_retries` times with backoff.
    #[instrument(skip_all, fields(%role, max_retries = self.policy.max_retries))]
    pub fn invoke(&self, role: AgentRole, prompt: &str) -> Attempted {
        let mut rng = rand::thread_rng();
        let mut attempts = 0u32;
        loop {
            let result = match self.runner.run(role, prompt, self.timeout) {
                Ok(result) => result,
                Err(e) => {
                    warn!(err = %format!("{e:#}"), "agent could not be started");
                    AgentInvocationResult::spawn_failure(format!("{e:#}"))
                }
            };
            attempts += 1;
            if result.success {
                info!(attempts, duration_ms = result.duration_ms, "agent succeeded");
                return Attempted { result, attempts };
            }
            warn!(
                attempt = attempts,
                exit_code = result.exit_code,
                timed_out = result.timed_out,
                "agent attempt failed"
            );
            if attempts > self.policy.max_retries {
                return Attempted { result, attempts };
            }
            let delay = self.policy.delay(attempts - 1, rng.gen_range(0.0..1.0));
            info!(delay_ms = delay.as_millis() as u64, "retrying agent after backoff");
            (self.sleep)(delay);
        }
    }

    /// Invoke and parse a summary, re-invoking once with a format reminder.
    ///
    /// `guaranteed` skips the reminder for agents that always emit valid
    /// structured output. `reminder` builds the full prompt for the second
    /// invocation from the first parse failure.
    #[instrument(skip_all, fields(%role, summary = T::NAME, guaranteed))]
    pub fn invoke_structured<T: Envelope>(
        &self,
        role: AgentRole,
        prompt: &str,
        guaranteed: bool,
        reminder: impl FnOnce(&ParseFailure) -> Result<String>,
    ) -> Result<StructuredOutcome<T>> {
        let first = self.invoke(role, prompt);
        if !first.result.success {
            return Ok(StructuredOutcome::AgentFailed(first));
        }
        let failure = match parse_envelope::<T>(&first.result.raw_output) {
            Ok(parsed) => {
                log_repair(&parsed);
                return Ok(StructuredOutcome::Parsed {
                    parsed,
                    attempts: first.attempts,
                    reminded: false,
                });
            }
            Err(failure) => failure,
        };
        warn!(reason = %failure.reason, "summary not found in agent output");
        if guaranteed {
            return Ok(StructuredOutcome::Missing {
                failure,
                raw_output: first.result.raw_output,
                attempts: first.attempts,
            });
        }

        let reminded_prompt = reminder(&failure)?;
        let second = self.invoke(role, &reminded_prompt);
        let attempts = first.attempts + second.attempts;
        if !second.result.success {
            warn!(exit_code = second.result.exit_code, "format reminder invocation failed");
            return Ok(StructuredOutcome::Missing {
                failure: ParseFailure {
                    reason: format!(
                        "{}; reminder invocation failed with exit code {}",
                        failure.reason, second.result.exit_code
                    ),
                },
                raw_output: first.result.raw_output,
                attempts,
            });
        }
        match parse_envelope::<T>(&second.result.raw_output) {
            Ok(parsed) => {
                log_repair(&parsed);
                info!("summary recovered after format reminder");
                Ok(StructuredOutcome::Parsed {
                    parsed,
                    attempts,
                    reminded: true,
                })
            }
            Err(failure) => {
                warn!(reason = %failure.reason, "summary still missing after format reminder");
                Ok(StructuredOutcome::Missing {
                    failure,
                    raw_output: first.result.raw_output,
                    attempts,
                })
            }
        }
    }
}

fn log_repair<T>(parsed: &Parsed<T>) {
    if parsed.repaired {
        info!(source = ?parsed.source, "accepted summary after local JSON repair");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{FixSummary, ReviewSummary};
    use crate::test_support::{ScriptedAgentRunner, failed_result, ok_result};
    use std::cell::RefCell;

    thread_local! {
        static SLEPT: RefCell<Vec<Duration>> = const { RefCell::new(Vec::new()) };
    }

    fn record_sleep(d: Duration) {
        SLEPT.with(|s| s.borrow_mut().push(d));
    }

    fn invoker(runner: &ScriptedAgentRunner, max_retries: u32) -> Invoker<'_, ScriptedAgentRunner> {
        Invoker {
            runner,
            policy: RetryPolicy {
                max_retries,
                base_delay_ms: 100,
                max_delay_ms: 1_000,
            },
            timeout: Duration::from_secs(5),
            sleep: record_sleep,
        }
    }

    const REVIEW: &str = "```json\n{\"findings\": []}\n```";

    /// Verifies retries stop at the first success and back off in between.
    #[test]
    fn retries_until_success_with_backoff() {
        SLEPT.with(|s| s.borrow_mut().clear());
        let runner = ScriptedAgentRunner::new()
            .with(AgentRole::Reviewer, failed_result(1, ""))
            .with(AgentRole::Reviewer, failed_result(1, ""))
            .with(AgentRole::Reviewer, ok_result(REVIEW));
        let attempted = invoker(&runner, 3).invoke(AgentRole::Reviewer, "p");
        assert!(attempted.result.success);
        assert_eq!(attempted.attempts, 3);

        let slept = SLEPT.with(|s| s.borrow().clone());
        assert_eq!(slept.len(), 2);
        assert!(slept[0] >= Duration::from_millis(100) && slept[0] <= Duration::from_millis(150));
        assert!(slept[1] >= Duration::from_millis(200) && slept[1] <= Duration::from_millis(300));
    }

    /// Verifies the last failure is returned once retries are exhausted.
    #[test]
    fn exhausted_retries_return_last_failure() {
        let runner = ScriptedAgentRunner::new()
            .with(AgentRole::Fixer, failed_result(2, ""))
            .with(AgentRole::Fixer, failed_result(7, ""));
        let attempted = invoker(&runner, 1).invoke(AgentRole::Fixer, "p");
        assert!(!attempted.result.success);
        assert_eq!(attempted.result.exit_code, 7);
        assert_eq!(attempted.attempts, 2);
        assert_eq!(runner.calls(AgentRole::Fixer).len(), 2);
    }

    /// Verifies the reminder prompt is sent once and its summary accepted.
    #[test]
    fn reminder_recovers_missing_summary() {
        let runner = ScriptedAgentRunner::new()
            .with(AgentRole::Reviewer, ok_result("looks fine to me"))
            .with(AgentRole::Reviewer, ok_result(REVIEW));
        let outcome = invoker(&runner, 0)
            .invoke_structured::<ReviewSummary>(AgentRole::Reviewer, "review", false, |f| {
                Ok(format!("review\nREMIND: {}", f.reason))
            })
            .expect("invoke");
        match outcome {
            StructuredOutcome::Parsed {
                reminded, attempts, ..
            } => {
                assert!(reminded);
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        let calls = runner.calls(AgentRole::Reviewer);
        assert!(calls[1].starts_with("review\nREMIND: review summary"));
    }

    /// Verifies agents with guaranteed output are not re-invoked.
    #[test]
    fn guaranteed_output_skips_reminder() {
        let runner = ScriptedAgentRunner::new().with(AgentRole::Fixer, ok_result("no json"));
        let outcome = invoker(&runner, 0)
            .invoke_structured::<FixSummary>(AgentRole::Fixer, "fix", true, |_| {
                Ok("unused".to_string())
            })
            .expect("invoke");
        assert!(matches!(outcome, StructuredOutcome::Missing { attempts: 1, .. }));
        assert_eq!(runner.calls(AgentRole::Fixer).len(), 1);
    }
}
