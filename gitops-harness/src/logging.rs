//! Logging for the harness.
//!
//! No component depends on ambient global state: every constructor takes an
//! explicit [`Logger`], so capabilities are unit-testable with a null or
//! capturing sink. The production sink forwards to `tracing`; [`init`]
//! installs a process-wide subscriber once (call it from suite setup or a
//! `#[ctor::ctor]` in tests).

use std::fmt;
use std::sync::{Arc, Mutex, Once};

use tracing_subscriber::prelude::*;

/// Log severity levels for harness events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

/// A log destination. Threaded through every constructor in the harness
/// instead of a hidden singleton, so each test can capture its own output.
pub trait EventSink: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);

    fn trace(&self, message: &str) {
        self.log(LogLevel::Trace, message);
    }
    fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }
    fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }
    fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }
    fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }
}

/// Shared handle to a sink.
pub type Logger = Arc<dyn EventSink>;

/// Production sink: forwards to `tracing` with a scope field identifying
/// the owning unit of work (the suite, or a single test).
pub struct TracingSink {
    scope: String,
}

impl TracingSink {
    pub fn scoped(scope: impl Into<String>) -> Logger {
        Arc::new(Self {
            scope: scope.into(),
        })
    }
}

impl EventSink for TracingSink {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Trace => tracing::trace!(scope = %self.scope, "{message}"),
            LogLevel::Debug => tracing::debug!(scope = %self.scope, "{message}"),
            LogLevel::Info => tracing::info!(scope = %self.scope, "{message}"),
            LogLevel::Warn => tracing::warn!(scope = %self.scope, "{message}"),
            LogLevel::Error => tracing::error!(scope = %self.scope, "{message}"),
        }
    }
}

/// Discards everything. For unit tests that don't inspect log output.
pub struct NullSink;

impl NullSink {
    pub fn logger() -> Logger {
        Arc::new(NullSink)
    }
}

impl EventSink for NullSink {
    fn log(&self, _level: LogLevel, _message: &str) {}
}

/// Captures entries in memory so tests can assert on what was logged.
#[derive(Default)]
pub struct MemorySink {
    entries: Mutex<Vec<(LogLevel, String)>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn entries(&self) -> Vec<(LogLevel, String)> {
        self.entries.lock().unwrap().clone()
    }

    /// True if any captured message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .any(|(_, msg)| msg.contains(needle))
    }
}

impl EventSink for MemorySink {
    fn log(&self, level: LogLevel, message: &str) {
        self.entries
            .lock()
            .unwrap()
            .push((level, message.to_string()));
    }
}

static INIT: Once = Once::new();

/// Install the process-wide `tracing` subscriber.
///
/// Level filtering comes from `GITOPS_E2E_LOG` (EnvFilter syntax, default
/// `info`). Safe to call multiple times; initialization happens once.
pub fn init() {
    INIT.call_once(|| {
        let filter = std::env::var("GITOPS_E2E_LOG")
            .ok()
            .and_then(|spec| tracing_subscriber::EnvFilter::try_new(spec).ok())
            .unwrap_or_else(|| tracing_subscriber::EnvFilter::new("info"));

        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_target(false)
            .with_level(true)
            .compact();

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer);

        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}
