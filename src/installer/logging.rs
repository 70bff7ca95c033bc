//! Logging sink handed to each installation session
//!
//! Sessions never reach for a global logger; the host passes a sink in.
//! [`TracingSink`] forwards to `tracing`, [`MemorySink`] keeps messages
//! for inspection.

use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// Severity accepted by a [`LogSink`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSeverity {
    Info,
    Warning,
    Error,
}

/// Destination for session progress and error messages
pub trait LogSink: Send + Sync {
    fn log(&self, message: &str, severity: LogSeverity);

    fn info(&self, message: &str) {
        self.log(message, LogSeverity::Info);
    }

    fn warn(&self, message: &str) {
        self.log(message, LogSeverity::Warning);
    }

    fn error(&self, message: &str) {
        self.log(message, LogSeverity::Error);
    }
}

/// Forwards messages to the `tracing` subscriber
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, message: &str, severity: LogSeverity) {
        match severity {
            LogSeverity::Info => info!("{}", message),
            LogSeverity::Warning => warn!("{}", message),
            LogSeverity::Error => error!("{}", message),
        }
    }
}

/// Collects messages in memory
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    entries: Arc<Mutex<Vec<(LogSeverity, String)>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything logged so far
    pub fn entries(&self) -> Vec<(LogSeverity, String)> {
        self.entries
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, severity: LogSeverity) -> usize {
        self.entries().iter().filter(|(s, _)| *s == severity).count()
    }
}

impl LogSink for MemorySink {
    fn log(&self, message: &str, severity: LogSeverity) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push((severity, message.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_records_in_order() {
        let sink = MemorySink::new();
        sink.info("planning");
        sink.warn("overlap");
        sink.error("failed");

        let entries = sink.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], (LogSeverity::Info, "planning".to_string()));
        assert_eq!(sink.count(LogSeverity::Warning), 1);
    }

    #[test]
    fn test_clones_share_storage() {
        let sink = MemorySink::new();
        let shared: Arc<dyn LogSink> = Arc::new(sink.clone());
        shared.info("from session");
        assert_eq!(sink.entries().len(), 1);
    }
}
