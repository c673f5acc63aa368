//! Bounded session log.
//!
//! The supervisor keeps the last few hundred lines of a live session so they
//! survive a crash. Every entry is also emitted through `tracing`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lines kept before the oldest are evicted.
pub const LOG_CAPACITY: usize = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    /// Monotonic across clears, so pollers can tell new lines from old.
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug)]
struct Inner {
    entries: VecDeque<LogEntry>,
    next_seq: u64,
}

/// Shared, append-only ring of log lines.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    inner: Arc<Mutex<Inner>>,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::with_capacity(LOG_CAPACITY)
    }
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: VecDeque::with_capacity(capacity),
                next_seq: 0,
            })),
            capacity,
        }
    }

    pub fn push(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!(target: "chatterbox::live", "{}", message),
            LogLevel::Info => tracing::info!(target: "chatterbox::live", "{}", message),
            LogLevel::Warn => tracing::warn!(target: "chatterbox::live", "{}", message),
            LogLevel::Error => tracing::error!(target: "chatterbox::live", "{}", message),
        }

        let mut inner = crate::lock(&self.inner);
        if inner.entries.len() == self.capacity {
            inner.entries.pop_front();
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.push_back(LogEntry {
            seq,
            at: Utc::now(),
            level,
            message,
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.push(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.push(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.push(LogLevel::Error, message);
    }

    /// The newest `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> Vec<LogEntry> {
        let inner = crate::lock(&self.inner);
        let skip = inner.entries.len().saturating_sub(n);
        inner.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        crate::lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        crate::lock(&self.inner).entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_oldest() {
        let log = LogBuffer::with_capacity(3);
        for i in 0..5 {
            log.info(format!("line {i}"));
        }
        let tail = log.tail(10);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].message, "line 2");
        assert_eq!(tail[2].seq, 4);
    }

    #[test]
    fn test_tail_returns_newest() {
        let log = LogBuffer::new();
        log.info("a");
        log.warn("b");
        log.error("c");
        let tail = log.tail(2);
        assert_eq!(
            tail.iter().map(|e| e.message.as_str()).collect::<Vec<_>>(),
            ["b", "c"]
        );
        assert_eq!(tail[1].level, LogLevel::Error);
    }

    #[test]
    fn test_seq_survives_clear() {
        let log = LogBuffer::new();
        log.info("before");
        log.clear();
        assert!(log.is_empty());
        log.info("after");
        assert_eq!(log.tail(1)[0].seq, 1);
    }
}
