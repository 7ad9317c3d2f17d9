//! Automated review → fix loop for coding agents.
//!
//! A reviewer agent inspects the working tree, a fixer agent applies fixes,
//! and the cycle repeats until the fixer reports nothing left to do or the
//! iteration budget runs out. Every fixer run is guarded by a git checkpoint
//! and rolled back on failure. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (envelope parsing, log records,
//!   summaries, backoff). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, git, process execution,
//!   locks). Isolated behind traits to enable fakes in tests.
//!
//! [`cycle`] drives the state machine over those collaborators; [`invoke`]
//! adds retries and format-reminder recovery around single agent runs.

pub mod cancel;
pub mod core;
pub mod cycle;
pub mod exit_codes;
pub mod invoke;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
