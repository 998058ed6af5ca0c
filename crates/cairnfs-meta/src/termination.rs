//! Process termination on unrecoverable replay faults.
//!
//! The edit log tailer never calls `std::process::exit` directly; it goes
//! through a [`TerminationSink`] so tests can substitute a recorder and assert
//! the sink fires only on genuine faults.

use std::sync::Mutex;

/// Receiver of fatal termination requests.
pub trait TerminationSink: Send + Sync {
    /// Requests that the process stop with `status`.
    fn terminate(&self, status: i32, reason: &str);
}

/// Exits the process.
pub struct ProcessExit;

impl TerminationSink for ProcessExit {
    fn terminate(&self, status: i32, reason: &str) {
        tracing::error!(status, reason, "terminating process");
        std::process::exit(status);
    }
}

/// A recorded termination request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TerminationRecord {
    /// Requested exit status
    pub status: i32,
    /// Reason given by the caller
    pub reason: String,
}

/// Records termination requests instead of exiting.
#[derive(Default)]
pub struct RecordingTerminationSink {
    calls: Mutex<Vec<TerminationRecord>>,
}

impl RecordingTerminationSink {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of termination requests seen.
    pub fn count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// All recorded requests.
    pub fn calls(&self) -> Vec<TerminationRecord> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl TerminationSink for RecordingTerminationSink {
    fn terminate(&self, status: i32, reason: &str) {
        tracing::warn!(status, reason, "termination requested (recorded)");
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(TerminationRecord {
                status,
                reason: reason.to_string(),
            });
        }
    }
}
