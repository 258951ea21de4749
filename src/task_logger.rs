//! Task Logger (spec.md §4.4).
//!
//! A bounded ring of `(level, msg, meta)` triples with two thresholds:
//! `stream_buffer_size` (soft — signals the caller it should flush) and
//! `max_logging_buffer` (hard cap — oldest entries are dropped, retaining the
//! newest `max_logging_buffer - logging_buffer_truncation`).

use std::sync::Mutex;

use chrono::Utc;
use serde_json::Value;

use crate::domain::models::{LogEntry, LogLevel};

/// Bounded per-task log ring, flushed through a pipe sink.
pub struct TaskLogger {
    buffer: Mutex<Vec<LogEntry>>,
    stream_buffer_size: usize,
    max_logging_buffer: usize,
    logging_buffer_truncation: usize,
}

impl TaskLogger {
    pub fn new(stream_buffer_size: usize, max_logging_buffer: usize, logging_buffer_truncation: usize) -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            stream_buffer_size,
            max_logging_buffer,
            logging_buffer_truncation,
        }
    }

    /// Append one entry. Returns `true` if the soft `stream_buffer_size`
    /// threshold has been reached (the caller should flush).
    pub fn push(&self, level: LogLevel, msg: impl Into<String>, meta: Option<Value>) -> bool {
        let mut buffer = self.buffer.lock().unwrap();
        buffer.push(LogEntry { ts: Utc::now(), level, msg: msg.into(), meta });

        if buffer.len() > self.max_logging_buffer {
            let keep = self.max_logging_buffer.saturating_sub(self.logging_buffer_truncation);
            let excess = buffer.len() - keep;
            buffer.drain(..excess);
        }

        buffer.len() >= self.stream_buffer_size
    }

    pub fn info(&self, msg: impl Into<String>) -> bool {
        self.push(LogLevel::Info, msg, None)
    }
    pub fn warn(&self, msg: impl Into<String>) -> bool {
        self.push(LogLevel::Warn, msg, None)
    }
    pub fn error(&self, msg: impl Into<String>) -> bool {
        self.push(LogLevel::Error, msg, None)
    }
    pub fn debug(&self, msg: impl Into<String>) -> bool {
        self.push(LogLevel::Debug, msg, None)
    }

    /// Atomically extract and clear the buffer. The caller is responsible for
    /// piping the result through persistence; the buffer is cleared
    /// regardless of what the caller does with it afterward (spec.md §4.4:
    /// "clears the buffer even on pipe error").
    pub fn drain(&self) -> Vec<LogEntry> {
        std::mem::take(&mut self.buffer.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_signals_flush_at_soft_threshold() {
        let logger = TaskLogger::new(3, 100, 10);
        assert!(!logger.info("one"));
        assert!(!logger.info("two"));
        assert!(logger.info("three"));
    }

    #[test]
    fn hard_cap_drops_oldest_retaining_newest() {
        let logger = TaskLogger::new(1000, 5, 2);
        for i in 0..10 {
            logger.info(format!("line {i}"));
        }
        let entries = logger.drain();
        // keep = max(5) - truncation(2) = 3, so the last push truncates down
        // to 3 entries before the new entry is counted... buffer len check
        // happens after push, so length stays within max_logging_buffer.
        assert!(entries.len() <= 5);
        assert_eq!(entries.last().unwrap().msg, "line 9");
    }

    #[test]
    fn drain_clears_buffer() {
        let logger = TaskLogger::new(10, 100, 10);
        logger.info("a");
        logger.info("b");
        assert_eq!(logger.drain().len(), 2);
        assert!(logger.is_empty());
    }
}
