//! Error types for the harness.
//!
//! The taxonomy mirrors how failures are consumed:
//! - [`ExecError`] wraps an external command failure and carries the full
//!   command line plus captured output, so a failing test is diagnosable
//!   without re-running the suite.
//! - [`PollError`] is a convergence timeout; it embeds the last divergence
//!   reason observed before the deadline.
//! - [`HarnessError`] is the umbrella for capability operations that can
//!   fail beyond plain process execution (e.g. parsing tool output).
//!
//! Semantic absence (a tag that does not exist yet, a release that was
//! already deleted) is never an error here; capabilities express it as a
//! typed `Option` or a best-effort no-op.

use std::time::Duration;

use thiserror::Error;

/// Why an external command failed.
#[derive(Debug, Error)]
pub enum ExecCause {
    #[error("exit status {0}")]
    NonZeroExit(i32),

    #[error("terminated by signal")]
    Signalled,

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("failed to start: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Failure of an external command, with the invocation and combined output
/// preserved for diagnosis.
#[derive(Debug, Error)]
#[error("error running {program} {args:?}: {cause}\nOutput:\n{output}")]
pub struct ExecError {
    /// Program name as invoked.
    pub program: String,
    /// Arguments as invoked.
    pub args: Vec<String>,
    /// Combined stdout and stderr captured before the failure (possibly
    /// partial on timeout).
    pub output: String,
    #[source]
    pub cause: ExecCause,
}

impl ExecError {
    /// The invocation rendered as a single command line.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// A convergence deadline elapsed while the condition still failed.
///
/// `last` is the most recent predicate error, which names the last observed
/// divergence (e.g. the stale revision the sync marker still points at).
#[derive(Debug, Error)]
#[error("condition not met within {timeout:?}; last failure: {last}")]
pub struct PollError {
    pub timeout: Duration,
    pub last: anyhow::Error,
}

/// Capability-layer failure: either the underlying command failed, or the
/// tool produced output the harness could not interpret.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("malformed {what} output: {source}")]
    Parse {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_error_message_contains_program_and_output() {
        let err = ExecError {
            program: "kubectl".to_string(),
            args: vec!["get".to_string(), "pods".to_string()],
            output: "connection refused".to_string(),
            cause: ExecCause::NonZeroExit(1),
        };
        let msg = err.to_string();
        assert!(msg.contains("kubectl"));
        assert!(msg.contains("connection refused"));
        assert!(msg.contains("exit status 1"));
    }

    #[test]
    fn test_exec_error_command_line() {
        let err = ExecError {
            program: "git".to_string(),
            args: vec!["fetch".to_string(), "--tags".to_string()],
            output: String::new(),
            cause: ExecCause::NonZeroExit(128),
        };
        assert_eq!(err.command_line(), "git fetch --tags");
    }

    #[test]
    fn test_poll_error_preserves_last_failure() {
        let err = PollError {
            timeout: Duration::from_secs(5),
            last: anyhow::anyhow!("sync marker still at def456"),
        };
        assert!(err.to_string().contains("def456"));
    }
}
