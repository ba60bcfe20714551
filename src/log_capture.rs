//! Bounded store of user-visible messages for display.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::device::Severity;

const MAX_LOG_ENTRIES: usize = 1000;

/// Represents a single message.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub severity: Severity,
    pub device: String,
    pub message: String,
}

impl LogEntry {
    /// One line with the severity-colored tag, as shown in the terminal.
    pub fn render(&self) -> String {
        format!(
            "{} {} {}: {}",
            self.timestamp.format("%H:%M:%S"),
            self.severity.tag(),
            self.device,
            self.message
        )
    }
}

/// A thread-safe, fixed-capacity message buffer. The oldest entries are dropped.
#[derive(Debug, Clone)]
pub struct MessageLog(Arc<Mutex<VecDeque<LogEntry>>>);

impl Default for MessageLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageLog {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(VecDeque::with_capacity(MAX_LOG_ENTRIES))))
    }

    pub fn push(&self, severity: Severity, device: &str, message: &str) {
        let mut buffer = self.0.lock();
        if buffer.len() >= MAX_LOG_ENTRIES {
            buffer.pop_front();
        }
        buffer.push_back(LogEntry {
            timestamp: Local::now(),
            severity,
            device: device.to_string(),
            message: message.to_string(),
        });
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.0.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.0.lock().iter().filter(|e| e.severity == severity).count()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}
