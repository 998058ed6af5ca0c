//! Delay gate between reaching the safe block threshold and leaving safe mode.

/// Holds safe mode in its extension phase for a fixed duration.
///
/// The timer is lazy: nothing fires on its own. Callers ask
/// [`expired`](Self::expired) with the current time whenever they query or
/// mutate safe mode state.
#[derive(Clone, Debug)]
pub struct ExtensionTimer {
    duration_ms: u64,
    deadline_ms: Option<u64>,
}

impl ExtensionTimer {
    /// Creates an idle timer.
    pub fn new(duration_ms: u64) -> Self {
        Self {
            duration_ms,
            deadline_ms: None,
        }
    }

    /// Configured hold duration.
    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    /// Starts a fresh deadline at `now_ms + duration`. Returns the deadline.
    pub fn start(&mut self, now_ms: u64) -> u64 {
        let deadline = now_ms.saturating_add(self.duration_ms);
        self.deadline_ms = Some(deadline);
        deadline
    }

    /// Drops any pending deadline.
    pub fn cancel(&mut self) {
        self.deadline_ms = None;
    }

    /// Pending deadline, if the timer is running.
    pub fn deadline_ms(&self) -> Option<u64> {
        self.deadline_ms
    }

    /// Returns true once a running timer has reached its deadline.
    pub fn expired(&self, now_ms: u64) -> bool {
        matches!(self.deadline_ms, Some(deadline) if now_ms >= deadline)
    }

    /// Milliseconds left before the deadline (0 when idle or expired).
    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        self.deadline_ms
            .map(|deadline| deadline.saturating_sub(now_ms))
            .unwrap_or(0)
    }
}
