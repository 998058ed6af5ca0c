//! Standby edit log replay.
//!
//! The tailer reads segments the active node wrote to shared storage and
//! applies them to the [`Namesystem`] one whole segment at a time. As a
//! background task it sleeps for the poll interval between passes; the sleep
//! can be cut short through [`TailerHandle::wake`].
//!
//! A corrupt or out-of-order segment halts the tailer and is reported to the
//! [`TerminationSink`]. Errors reading shared storage are retried on the next
//! pass.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::config::ReplayConfig;
use crate::editlog::{EditLogSegment, SegmentSource};
use crate::namesystem::Namesystem;
use crate::termination::TerminationSink;
use crate::types::{MetaError, TxId};

/// Exit status requested from the termination sink on a replay fault.
pub const REPLAY_FAULT_EXIT_STATUS: i32 = 1;

/// Counters published by the tailer after every pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailerStats {
    /// Segments that applied at least one transaction.
    pub segments_applied: u64,
    /// Transactions applied.
    pub transactions_applied: u64,
    /// Last txid in the namespace after the most recent pass.
    pub last_applied_txid: u64,
    /// Passes that failed with a retryable error.
    pub transient_errors: u64,
    /// Whether a fatal fault stopped replay.
    pub halted: bool,
}

/// Result of one catch-up pass.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CatchUpSummary {
    /// Segments that applied at least one transaction
    pub segments: usize,
    /// Transactions applied
    pub transactions: usize,
    /// Last applied txid afterwards
    pub last_applied: TxId,
}

/// Replays the shared edit log into a namesystem.
pub struct EditLogTailer {
    namesystem: Arc<Namesystem>,
    source: Arc<dyn SegmentSource>,
    sink: Arc<dyn TerminationSink>,
    config: ReplayConfig,
    stats: TailerStats,
    stats_tx: watch::Sender<TailerStats>,
    fault: Option<String>,
}

impl EditLogTailer {
    /// Creates a tailer. Nothing is read until [`catch_up`](Self::catch_up)
    /// or [`start`](Self::start).
    pub fn new(
        namesystem: Arc<Namesystem>,
        source: Arc<dyn SegmentSource>,
        sink: Arc<dyn TerminationSink>,
        config: ReplayConfig,
    ) -> Self {
        let (stats_tx, _) = watch::channel(TailerStats::default());
        Self {
            namesystem,
            source,
            sink,
            config,
            stats: TailerStats::default(),
            stats_tx,
            fault: None,
        }
    }

    /// Counters so far.
    pub fn stats(&self) -> &TailerStats {
        &self.stats
    }

    /// The fault that halted replay, if any.
    pub fn fault(&self) -> Option<&str> {
        self.fault.as_deref()
    }

    /// Applies every available segment after the namespace's last txid.
    ///
    /// `include_in_progress` also reads the segment the active node is still
    /// writing, as done once during promotion. A fatal fault is handed to the
    /// termination sink before the error is returned. Once halted, every
    /// further call fails with [`MetaError::ReplayHalted`] without reading
    /// or reporting again.
    pub fn catch_up(&mut self, include_in_progress: bool) -> Result<CatchUpSummary, MetaError> {
        if let Some(fault) = &self.fault {
            return Err(MetaError::ReplayHalted(fault.clone()));
        }
        let result = self.replay_available(include_in_progress);
        self.record(result)
    }

    /// Background variant of [`catch_up`](Self::catch_up) for finalized
    /// segments. Storage is read on the blocking pool.
    async fn catch_up_finalized(&mut self) -> Result<CatchUpSummary, MetaError> {
        if let Some(fault) = &self.fault {
            return Err(MetaError::ReplayHalted(fault.clone()));
        }
        let result = self.replay_finalized().await;
        self.record(result)
    }

    fn replay_available(&mut self, include_in_progress: bool) -> Result<CatchUpSummary, MetaError> {
        let from = self.namesystem.last_applied_txid()?.next();
        let segments = self.source.segments_from(from, include_in_progress)?;
        self.apply_segments(from, &segments)
    }

    async fn replay_finalized(&mut self) -> Result<CatchUpSummary, MetaError> {
        let from = self.namesystem.last_applied_txid()?.next();
        let source = self.source.clone();
        let segments = tokio::task::spawn_blocking(move || source.segments_from(from, false))
            .await
            .map_err(|e| MetaError::TaskFailed(e.to_string()))??;
        self.apply_segments(from, &segments)
    }

    fn apply_segments(
        &mut self,
        from: TxId,
        segments: &[EditLogSegment],
    ) -> Result<CatchUpSummary, MetaError> {
        let mut summary = CatchUpSummary {
            segments: 0,
            transactions: 0,
            last_applied: TxId::new(from.as_u64() - 1),
        };
        for segment in segments {
            let outcome = self.namesystem.apply_segment(segment)?;
            if outcome.applied > 0 {
                summary.segments += 1;
                summary.transactions += outcome.applied;
                self.stats.segments_applied += 1;
                self.stats.transactions_applied += outcome.applied as u64;
            }
            summary.last_applied = outcome.last_applied;
            self.stats.last_applied_txid = outcome.last_applied.as_u64();
        }
        Ok(summary)
    }

    fn record(
        &mut self,
        result: Result<CatchUpSummary, MetaError>,
    ) -> Result<CatchUpSummary, MetaError> {
        match &result {
            Ok(summary) if summary.transactions > 0 => {
                tracing::info!(
                    segments = summary.segments,
                    transactions = summary.transactions,
                    last_applied = %summary.last_applied,
                    "caught up on edit log"
                );
            }
            Ok(_) => {}
            Err(e) if e.is_fatal_replay() => {
                self.stats.halted = true;
                self.fault = Some(e.to_string());
                tracing::error!(error = %e, "unrecoverable edit log replay fault");
                self.sink
                    .terminate(REPLAY_FAULT_EXIT_STATUS, &format!("edit log replay failed: {}", e));
            }
            Err(e) => {
                self.stats.transient_errors += 1;
                tracing::warn!(error = %e, "edit log tailing failed, will retry");
            }
        }
        self.stats_tx.send_replace(self.stats.clone());
        result
    }

    /// Spawns the polling loop on the tokio runtime.
    pub fn start(self) -> TailerHandle {
        let wake = Arc::new(Notify::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.stats_tx.subscribe();
        let join = tokio::spawn(self.run(wake.clone(), shutdown_rx));
        TailerHandle {
            wake,
            shutdown: shutdown_tx,
            stats,
            join,
        }
    }

    async fn run(mut self, wake: Arc<Notify>, mut shutdown: watch::Receiver<bool>) -> Self {
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        tracing::info!(
            poll_interval_ms = self.config.poll_interval_ms,
            "edit log tailer started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.catch_up_finalized().await {
                if e.is_fatal_replay() {
                    break;
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = wake.notified() => {
                    tracing::debug!("edit log tailer woken early");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(halted = self.stats.halted, "edit log tailer stopped");
        self
    }
}

/// Control handle for a running tailer.
pub struct TailerHandle {
    wake: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    stats: watch::Receiver<TailerStats>,
    join: JoinHandle<EditLogTailer>,
}

impl TailerHandle {
    /// Cuts the current sleep short so the next pass starts now.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Latest published counters.
    pub fn stats(&self) -> TailerStats {
        self.stats.borrow().clone()
    }

    /// Waits until the published counters satisfy `pred`.
    pub async fn wait_for_stats<F>(&mut self, mut pred: F) -> Result<TailerStats, MetaError>
    where
        F: FnMut(&TailerStats) -> bool,
    {
        let stats = self
            .stats
            .wait_for(|s| pred(s))
            .await
            .map_err(|e| MetaError::TaskFailed(e.to_string()))?;
        Ok(stats.clone())
    }

    /// True while the loop is still running (not stopped, not halted).
    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }

    /// Stops the loop after the segment in flight and returns the tailer.
    pub async fn stop(self) -> Result<EditLogTailer, MetaError> {
        let _ = self.shutdown.send(true);
        self.join
            .await
            .map_err(|e| MetaError::TaskFailed(e.to_string()))
    }
}
