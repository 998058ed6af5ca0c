//! Safe mode threshold state machine.
//!
//! The tracker owns the safe/total block counters and a three-state machine
//! (ON, ON_EXTENSION, OFF). Every counter mutation is followed by
//! [`SafeModeTracker::recompute`], the only place state changes. The tracker
//! itself is not synchronized; [`crate::namesystem::Namesystem`] keeps it
//! under the same lock as the namespace and replica map.

use serde::{Deserialize, Serialize};

use crate::config::SafeModeConfig;
use crate::extension::ExtensionTimer;

/// Relative tolerance when turning `total * threshold` into a block count.
const THRESHOLD_EPSILON: f64 = 1e-9;

/// Safe mode phase.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafeModeState {
    /// Not enough blocks reported yet.
    On,
    /// Threshold reached; waiting for the extension period to elapse.
    OnExtension,
    /// Mutations allowed. Terminal until an explicit reset.
    Off,
}

/// State change produced by a recompute.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SafeModeTransition {
    /// ON -> ON_EXTENSION, with the new deadline.
    ExtensionStarted {
        /// Deadline on the tracker's clock
        deadline_ms: u64,
    },
    /// ON_EXTENSION -> ON after the ratio dropped below threshold.
    ExtensionCancelled,
    /// -> OFF.
    Left,
}

/// Point-in-time view of safe mode for diagnostics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SafeModeReport {
    /// Current phase
    pub state: SafeModeState,
    /// Whether an operator forced safe mode on
    pub manual: bool,
    /// Blocks in the namespace
    pub total_blocks: u64,
    /// Blocks with enough verified replicas
    pub safe_blocks: u64,
    /// Configured threshold ratio
    pub threshold_pct: f64,
    /// Safe blocks still missing before the threshold is met
    pub blocks_needed: u64,
    /// Time left in the extension period (0 outside ON_EXTENSION)
    pub extension_remaining_ms: u64,
}

/// Safe mode counters and state machine for one metadata node.
#[derive(Clone, Debug)]
pub struct SafeModeTracker {
    threshold: f64,
    total_blocks: u64,
    safe_blocks: u64,
    state: SafeModeState,
    extension: ExtensionTimer,
    manual: bool,
}

impl SafeModeTracker {
    /// Creates a tracker in the ON state with no blocks.
    pub fn new(config: &SafeModeConfig) -> Self {
        Self {
            threshold: config.threshold_pct,
            total_blocks: 0,
            safe_blocks: 0,
            state: SafeModeState::On,
            extension: ExtensionTimer::new(config.extension_ms),
            manual: false,
        }
    }

    /// Enters safe mode for a freshly loaded namespace of `total_blocks` blocks.
    pub fn enter(&mut self, total_blocks: u64) {
        self.reset(total_blocks, 0);
    }

    /// Forces the tracker back to ON with the given tallies, discarding any
    /// extension deadline and manual flag.
    pub fn reset(&mut self, total_blocks: u64, safe_blocks: u64) {
        self.total_blocks = total_blocks;
        self.safe_blocks = safe_blocks.min(total_blocks);
        self.state = SafeModeState::On;
        self.extension.cancel();
        self.manual = false;
        tracing::info!(
            total_blocks = self.total_blocks,
            safe_blocks = self.safe_blocks,
            "safe mode ON"
        );
    }

    /// Replaces the block total, keeping the state.
    pub fn set_block_total(&mut self, total_blocks: u64) {
        self.total_blocks = total_blocks;
        if self.safe_blocks > total_blocks {
            tracing::warn!(
                safe_blocks = self.safe_blocks,
                total_blocks,
                "safe block count exceeds total, clamping"
            );
            self.safe_blocks = total_blocks;
        }
    }

    /// A block reached the safe replication level.
    pub fn increment_safe(&mut self) {
        if self.safe_blocks < self.total_blocks {
            self.safe_blocks += 1;
        } else {
            tracing::warn!(
                safe_blocks = self.safe_blocks,
                total_blocks = self.total_blocks,
                "ignoring safe block increment beyond total"
            );
        }
    }

    /// A block dropped below the safe replication level.
    pub fn decrement_safe(&mut self) {
        if self.safe_blocks == 0 {
            tracing::warn!("ignoring safe block decrement below zero");
            return;
        }
        self.safe_blocks -= 1;
    }

    /// A new block appeared in the namespace; no replica has been counted yet.
    pub fn block_added(&mut self) {
        self.total_blocks += 1;
    }

    /// A block left the namespace. `was_safe` says whether it had been counted.
    pub fn block_removed(&mut self, was_safe: bool) {
        if was_safe {
            self.decrement_safe();
        }
        if self.total_blocks == 0 {
            tracing::warn!("ignoring block removal with zero total");
            return;
        }
        self.total_blocks -= 1;
        if self.safe_blocks > self.total_blocks {
            self.safe_blocks = self.total_blocks;
        }
    }

    /// Operator override: hold safe mode ON until explicitly left.
    pub fn enter_manual(&mut self) {
        self.manual = true;
        self.extension.cancel();
        if self.state != SafeModeState::On {
            tracing::info!("safe mode ON (manual)");
        }
        self.state = SafeModeState::On;
    }

    /// Operator override: leave safe mode now. Returns false if already OFF.
    pub fn leave(&mut self) -> bool {
        self.manual = false;
        self.extension.cancel();
        if self.state == SafeModeState::Off {
            return false;
        }
        self.state = SafeModeState::Off;
        tracing::info!(
            total_blocks = self.total_blocks,
            safe_blocks = self.safe_blocks,
            "safe mode OFF (forced)"
        );
        true
    }

    /// The single transition function. Call after every mutation and before
    /// every query so an elapsed deadline is observed without new input.
    pub fn recompute(&mut self, now_ms: u64) -> Option<SafeModeTransition> {
        if self.manual {
            return None;
        }
        match self.state {
            SafeModeState::Off => None,
            SafeModeState::On => {
                if !self.threshold_met() {
                    return None;
                }
                if self.threshold <= 0.0 || self.extension.duration_ms() == 0 {
                    self.state = SafeModeState::Off;
                    tracing::info!(
                        total_blocks = self.total_blocks,
                        safe_blocks = self.safe_blocks,
                        "safe mode OFF (no extension)"
                    );
                    return Some(SafeModeTransition::Left);
                }
                let deadline_ms = self.extension.start(now_ms);
                self.state = SafeModeState::OnExtension;
                tracing::info!(
                    total_blocks = self.total_blocks,
                    safe_blocks = self.safe_blocks,
                    extension_ms = self.extension.duration_ms(),
                    "safe block threshold reached, entering extension"
                );
                Some(SafeModeTransition::ExtensionStarted { deadline_ms })
            }
            SafeModeState::OnExtension => {
                if !self.threshold_met() {
                    self.extension.cancel();
                    self.state = SafeModeState::On;
                    tracing::info!(
                        total_blocks = self.total_blocks,
                        safe_blocks = self.safe_blocks,
                        "safe block ratio dropped below threshold, extension cancelled"
                    );
                    return Some(SafeModeTransition::ExtensionCancelled);
                }
                if self.extension.expired(now_ms) {
                    self.extension.cancel();
                    self.state = SafeModeState::Off;
                    tracing::info!(
                        total_blocks = self.total_blocks,
                        safe_blocks = self.safe_blocks,
                        "extension elapsed, safe mode OFF"
                    );
                    return Some(SafeModeTransition::Left);
                }
                None
            }
        }
    }

    /// Number of safe blocks required: `ceil(total * threshold)`.
    pub fn block_threshold(&self) -> u64 {
        if self.threshold <= 0.0 {
            return 0;
        }
        let raw = self.total_blocks as f64 * self.threshold;
        let rounded = raw.round();
        let needed = if (raw - rounded).abs() <= THRESHOLD_EPSILON * rounded.max(1.0) {
            rounded
        } else {
            raw.ceil()
        } as u64;
        if self.threshold <= 1.0 {
            needed.min(self.total_blocks)
        } else {
            needed
        }
    }

    /// True when `safe / total >= threshold`. An empty namespace always qualifies,
    /// unless the threshold is above 1.
    pub fn threshold_met(&self) -> bool {
        if self.threshold > 1.0 {
            return false;
        }
        self.safe_blocks >= self.block_threshold()
    }

    /// Safe blocks still missing before the threshold is met.
    pub fn blocks_needed(&self) -> u64 {
        self.block_threshold().saturating_sub(self.safe_blocks)
    }

    /// Current phase.
    pub fn state(&self) -> SafeModeState {
        self.state
    }

    /// True unless safe mode is OFF.
    pub fn is_on(&self) -> bool {
        self.state != SafeModeState::Off
    }

    /// True if an operator forced safe mode on.
    pub fn is_manual(&self) -> bool {
        self.manual
    }

    /// Blocks in the namespace.
    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// Blocks counted as safe.
    pub fn safe_blocks(&self) -> u64 {
        self.safe_blocks
    }

    /// Pending extension deadline.
    pub fn extension_deadline_ms(&self) -> Option<u64> {
        self.extension.deadline_ms()
    }

    /// Human readable status. Empty when safe mode is OFF.
    pub fn status(&self) -> String {
        if self.manual {
            return "Safe mode is ON. It was turned on manually. \
                    Use \"safemode leave\" to turn safe mode off."
                .to_string();
        }
        match self.state {
            SafeModeState::Off => String::new(),
            SafeModeState::On => format!(
                "Safe mode is ON. The reported blocks {} needs additional {} blocks \
                 to reach {:.4} of total blocks {}.",
                self.safe_blocks,
                self.blocks_needed(),
                self.threshold,
                self.total_blocks
            ),
            SafeModeState::OnExtension => format!(
                "Safe mode is ON. The reported blocks {} has reached the threshold {:.4} \
                 of total blocks {}. Safe mode will be turned off automatically once \
                 the extension period ({}) has elapsed.",
                self.safe_blocks,
                self.threshold,
                self.total_blocks,
                self.extension.duration_ms().div_ceil(1000)
            ),
        }
    }

    /// Snapshot of counters and state.
    pub fn report(&self, now_ms: u64) -> SafeModeReport {
        SafeModeReport {
            state: self.state,
            manual: self.manual,
            total_blocks: self.total_blocks,
            safe_blocks: self.safe_blocks,
            threshold_pct: self.threshold,
            blocks_needed: self.blocks_needed(),
            extension_remaining_ms: self.extension.remaining_ms(now_ms),
        }
    }
}
