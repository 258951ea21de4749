//! Observability port (spec.md §6.2).
//!
//! Mirrors `domain::ports::logger::Logger`: a small leveled logging surface
//! plus a `.for_subject()` method that derives a child logger carrying
//! richer context (e.g. a task id), rather than a bag of ad hoc `format!`
//! calls scattered through the engine.

use std::fmt;

/// Log level, ordered from most verbose to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Verbose,
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Verbose => "VERBOSE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

/// Structured logging port consumed by the engine.
///
/// The default adapter (`crate::logging`) wires this onto `tracing`.
pub trait Logger: Send + Sync {
    fn log(&self, level: Level, message: &str);

    fn verbose(&self, message: &str) {
        self.log(Level::Verbose, message);
    }
    fn debug(&self, message: &str) {
        self.log(Level::Debug, message);
    }
    fn info(&self, message: &str) {
        self.log(Level::Info, message);
    }
    fn warn(&self, message: &str) {
        self.log(Level::Warn, message);
    }
    fn error(&self, message: &str) {
        self.log(Level::Error, message);
    }

    /// Derive a child logger carrying additional context (e.g. a task id),
    /// the way `.for(subject)` does in the source system.
    fn for_subject(&self, subject: &str) -> Box<dyn Logger>;
}

/// Logger implementation that forwards to the `tracing` macros, scoping
/// messages with an optional subject prefix.
pub struct TracingLogger {
    subject: Option<String>,
}

impl TracingLogger {
    pub fn new() -> Self {
        Self { subject: None }
    }

    fn format(&self, message: &str) -> String {
        match &self.subject {
            Some(subject) => format!("[{subject}] {message}"),
            None => message.to_string(),
        }
    }
}

impl Default for TracingLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger for TracingLogger {
    fn log(&self, level: Level, message: &str) {
        let formatted = self.format(message);
        match level {
            Level::Verbose | Level::Debug => tracing::debug!("{formatted}"),
            Level::Info => tracing::info!("{formatted}"),
            Level::Warn => tracing::warn!("{formatted}"),
            Level::Error => tracing::error!("{formatted}"),
        }
    }

    fn for_subject(&self, subject: &str) -> Box<dyn Logger> {
        Box::new(TracingLogger {
            subject: Some(subject.to_string()),
        })
    }
}

impl fmt::Debug for TracingLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracingLogger").field("subject", &self.subject).finish()
    }
}
