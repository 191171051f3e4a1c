//! External command execution with deadlines and output capture.
//!
//! All tool capabilities funnel through [`CommandRunner`]; test code never
//! touches `std::process` directly. Each invocation is logged to the
//! runner's sink before it starts, bounded by an explicit timeout, and
//! reported with its combined output on failure.

use std::ffi::OsStr;
use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::errors::{ExecCause, ExecError};
use crate::logging::Logger;

/// Environment overrides applied to a single invocation.
pub type EnvOverrides = [(String, String)];

/// Runs external commands, capturing combined stdout+stderr.
///
/// Stateless between calls: no process pooling, no working-directory
/// memory. Cheap to construct per scope so each test can bind its own
/// logger.
#[derive(Clone)]
pub struct CommandRunner {
    logger: Logger,
}

impl CommandRunner {
    pub fn new(logger: Logger) -> Self {
        Self { logger }
    }

    /// Run `program` with `args`, killing it if `timeout` elapses first.
    ///
    /// Returns the combined output on exit status zero. On non-zero exit,
    /// spawn failure, or timeout, the [`ExecError`] preserves whatever
    /// output was captured so callers can diagnose without re-running.
    pub fn run<I, S>(
        &self,
        timeout: Duration,
        env: &EnvOverrides,
        program: &str,
        args: I,
    ) -> Result<String, ExecError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<String> = args
            .into_iter()
            .map(|a| a.as_ref().to_string_lossy().into_owned())
            .collect();

        self.logger
            .debug(&format!("running: {} {}", program, args.join(" ")));

        let exec_err = |output: String, cause: ExecCause| ExecError {
            program: program.to_string(),
            args: args.clone(),
            output,
            cause,
        };

        let mut cmd = Command::new(program);
        cmd.args(&args).stdout(Stdio::piped()).stderr(Stdio::piped());
        for (key, value) in env {
            cmd.env(key, value);
        }

        let start = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => return Err(exec_err(String::new(), ExecCause::Spawn(err))),
        };

        let stdout_handle = child
            .stdout
            .take()
            .map(|mut out| thread::spawn(move || read_all(&mut out)));
        let stderr_handle = child
            .stderr
            .take()
            .map(|mut err| thread::spawn(move || read_all(&mut err)));

        let mut timed_out = false;
        let exit_status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {}
                Err(err) => return Err(exec_err(String::new(), ExecCause::Spawn(err))),
            }
            if start.elapsed() >= timeout {
                timed_out = true;
                let _ = child.kill();
                break child.wait().ok();
            }
            thread::sleep(Duration::from_millis(10));
        };

        let stdout = join_output(stdout_handle);
        let stderr = join_output(stderr_handle);
        let mut output = stdout;
        if !stderr.is_empty() {
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&stderr);
        }

        if timed_out {
            self.logger.warn(&format!(
                "command timed out after {timeout:?}: {program}"
            ));
            return Err(exec_err(output, ExecCause::TimedOut(timeout)));
        }

        match exit_status.map(|status| status.code()) {
            Some(Some(0)) => Ok(output),
            Some(Some(code)) => Err(exec_err(output, ExecCause::NonZeroExit(code))),
            _ => Err(exec_err(output, ExecCause::Signalled)),
        }
    }

    /// Like [`run`](Self::run), but any failure immediately fails the
    /// enclosing unit of work (test or suite) with the full error.
    pub fn must<I, S>(&self, timeout: Duration, env: &EnvOverrides, program: &str, args: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        match self.run(timeout, env, program, args) {
            Ok(output) => output,
            Err(err) => {
                self.logger.error(&err.to_string());
                panic!("{err}");
            }
        }
    }

    /// Like [`run`](Self::run), but swallows failure and returns the
    /// best-effort output. For idempotent delete-if-exists operations where
    /// absence is not an error.
    pub fn ignore_errors<I, S>(
        &self,
        timeout: Duration,
        env: &EnvOverrides,
        program: &str,
        args: I,
    ) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        match self.run(timeout, env, program, args) {
            Ok(output) => output,
            Err(err) => {
                self.logger
                    .debug(&format!("ignoring failure: {}", err.command_line()));
                err.output
            }
        }
    }
}

fn read_all<R: Read>(reader: &mut R) -> String {
    let mut buffer = Vec::new();
    if reader.read_to_end(&mut buffer).is_ok() {
        String::from_utf8_lossy(&buffer).into_owned()
    } else {
        String::new()
    }
}

fn join_output(handle: Option<thread::JoinHandle<String>>) -> String {
    match handle {
        Some(handle) => handle.join().unwrap_or_default(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ExecCause;
    use crate::logging::{MemorySink, NullSink};

    const TIMEOUT: Duration = Duration::from_secs(10);
    const NO_ENV: &EnvOverrides = &[];

    fn runner() -> CommandRunner {
        CommandRunner::new(NullSink::logger())
    }

    #[test]
    fn test_run_captures_stdout() {
        let out = runner()
            .run(TIMEOUT, NO_ENV, "sh", ["-c", "echo hello"])
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn test_run_combines_stdout_and_stderr() {
        let out = runner()
            .run(TIMEOUT, NO_ENV, "sh", ["-c", "echo out; echo err >&2"])
            .unwrap();
        assert!(out.contains("out"));
        assert!(out.contains("err"));
    }

    #[test]
    fn test_run_nonzero_exit_preserves_output_verbatim() {
        let err = runner()
            .run(TIMEOUT, NO_ENV, "sh", ["-c", "echo partial result; exit 3"])
            .unwrap_err();
        assert!(matches!(err.cause, ExecCause::NonZeroExit(3)));
        assert!(err.output.contains("partial result"));
        let msg = err.to_string();
        assert!(msg.contains("sh"));
        assert!(msg.contains("partial result"));
    }

    #[test]
    fn test_run_applies_env_overrides() {
        let env = [("HARNESS_PROBE".to_string(), "42".to_string())];
        let out = runner()
            .run(TIMEOUT, &env, "sh", ["-c", "echo $HARNESS_PROBE"])
            .unwrap();
        assert_eq!(out.trim(), "42");
    }

    #[test]
    fn test_run_kills_on_timeout() {
        let start = Instant::now();
        let err = runner()
            .run(Duration::from_millis(200), NO_ENV, "sleep", ["5"])
            .unwrap_err();
        assert!(matches!(err.cause, ExecCause::TimedOut(_)));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_run_missing_program_is_spawn_error() {
        let err = runner()
            .run(TIMEOUT, NO_ENV, "definitely-not-a-real-program-xyz", [""; 0])
            .unwrap_err();
        assert!(matches!(err.cause, ExecCause::Spawn(_)));
    }

    #[test]
    fn test_run_logs_command_line_before_execution() {
        let sink = MemorySink::new();
        let runner = CommandRunner::new(sink.clone());
        let _ = runner.run(TIMEOUT, NO_ENV, "sh", ["-c", "true"]);
        assert!(sink.contains("sh -c true"));
    }

    #[test]
    fn test_ignore_errors_returns_best_effort_output() {
        let out = runner().ignore_errors(TIMEOUT, NO_ENV, "sh", ["-c", "echo leftovers; exit 1"]);
        assert!(out.contains("leftovers"));
    }

    #[test]
    #[should_panic(expected = "exit status 7")]
    fn test_must_panics_on_failure() {
        runner().must(TIMEOUT, NO_ENV, "sh", ["-c", "exit 7"]);
    }
}
