use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::types::LogLevel;

/// Default number of entries retained per workflow.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }

    pub fn debug(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Debug, message)
    }
}

/// Append-only, capacity-bounded log for a single workflow.
///
/// When full, the oldest entry is evicted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
}

impl LogBuffer {
    pub fn push(&mut self, entry: LogEntry, capacity: usize) {
        let capacity = capacity.max(1);
        while self.entries.len() >= capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_insertion_order() {
        let mut buf = LogBuffer::default();
        buf.push(LogEntry::info("first"), 10);
        buf.push(LogEntry::warn("second"), 10);
        let msgs: Vec<_> = buf.snapshot().into_iter().map(|e| e.message).collect();
        assert_eq!(msgs, vec!["first", "second"]);
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut buf = LogBuffer::default();
        for i in 0..5 {
            buf.push(LogEntry::info(format!("m{i}")), 3);
        }
        let msgs: Vec<_> = buf.snapshot().into_iter().map(|e| e.message).collect();
        assert_eq!(msgs, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn zero_capacity_keeps_latest_entry() {
        let mut buf = LogBuffer::default();
        buf.push(LogEntry::info("a"), 0);
        buf.push(LogEntry::info("b"), 0);
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.snapshot()[0].message, "b");
    }
}
