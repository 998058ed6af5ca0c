//! Per-instance namesystem state: namespace snapshot, replica map, pending
//! storage node messages and the safe mode tracker, all behind one lock.
//!
//! Block report ingestion (see [`crate::block_report`]), edit log replay and
//! role transitions all take the same lock, so every counter mutation and
//! the recompute that follows it happen in one serialization order.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::blockmap::{PendingReports, ReplicaMap};
use crate::clock::Clock;
use crate::config::SafeModeConfig;
use crate::editlog::EditLogSegment;
use crate::namespace::{NamespaceChange, NamespaceSnapshot};
use crate::safemode::{SafeModeReport, SafeModeState, SafeModeTracker, SafeModeTransition};
use crate::types::{BlockId, GenStamp, HaRole, MetaError, OperationCategory, StorageNodeId, TxId};

/// Result of applying one edit log segment.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SegmentOutcome {
    /// Transactions applied from this segment
    pub applied: usize,
    /// Transactions skipped because they were already applied
    pub skipped: usize,
    /// Last applied txid after the segment
    pub last_applied: TxId,
    /// Safe mode transition caused by the recompute, if any
    pub transition: Option<SafeModeTransition>,
}

pub(crate) struct NamesystemInner {
    pub(crate) role: HaRole,
    pub(crate) namespace: NamespaceSnapshot,
    pub(crate) replicas: ReplicaMap,
    pub(crate) pending: PendingReports,
    pub(crate) safe_mode: SafeModeTracker,
    pub(crate) min_replication: usize,
}

impl NamesystemInner {
    /// Records a verified replica, counting the block as safe when it reaches
    /// the minimum replication. Returns false for a duplicate.
    pub(crate) fn add_replica(&mut self, node: StorageNodeId, block: BlockId) -> bool {
        match self.replicas.add(block, node) {
            Some(count) => {
                if count == self.min_replication {
                    self.safe_mode.increment_safe();
                }
                true
            }
            None => false,
        }
    }

    /// Forgets a replica, uncounting the block if it falls below the minimum.
    /// Returns false if the replica was not recorded.
    pub(crate) fn remove_replica(&mut self, node: StorageNodeId, block: BlockId) -> bool {
        match self.replicas.remove(block, node) {
            Some(before) => {
                if before == self.min_replication {
                    self.safe_mode.decrement_safe();
                }
                true
            }
            None => false,
        }
    }

    fn drop_block_replicas(&mut self, block: BlockId) -> bool {
        let count = self.replicas.remove_block(block);
        count >= self.min_replication
    }

    fn apply_change(&mut self, change: NamespaceChange) {
        match change {
            NamespaceChange::BlockAdded { .. } => self.safe_mode.block_added(),
            NamespaceChange::BlockRemoved { block } => {
                let was_safe = self.drop_block_replicas(block);
                self.safe_mode.block_removed(was_safe);
            }
            NamespaceChange::BlockUpdated {
                block,
                previous,
                current,
            } => {
                if previous != current && self.drop_block_replicas(block) {
                    self.safe_mode.decrement_safe();
                }
            }
            NamespaceChange::GenStampAdvanced(_) => {}
        }
    }

    /// Re-judges queued messages whose stamps the namespace may now recognize.
    fn process_pending(&mut self) {
        let gen_stamp = self.namespace.gen_stamp();
        for report in self.pending.take_full_reports_up_to(gen_stamp) {
            tracing::debug!(
                node = %report.node,
                blocks = report.blocks.len(),
                "replaying postponed full block report"
            );
            self.apply_full_report(report.node, report.blocks);
        }
        for queued in self.pending.take_replicas_up_to(gen_stamp) {
            self.receive_replica(queued.node, queued.reported);
        }
    }

    fn recount(&self) -> (u64, u64) {
        (
            self.namespace.block_count(),
            self.replicas.safe_block_count(self.min_replication),
        )
    }
}

/// The metadata node's lock-guarded block and safe mode state.
pub struct Namesystem {
    clock: Arc<dyn Clock>,
    inner: Mutex<NamesystemInner>,
}

impl Namesystem {
    /// Creates a namesystem over a loaded namespace and enters safe mode.
    pub fn new(
        config: &SafeModeConfig,
        namespace: NamespaceSnapshot,
        role: HaRole,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, MetaError> {
        config.validate()?;
        let mut safe_mode = SafeModeTracker::new(config);
        safe_mode.enter(namespace.block_count());
        safe_mode.recompute(clock.now_ms());
        tracing::info!(
            role = %role,
            blocks = namespace.block_count(),
            last_applied = %namespace.last_applied(),
            "namesystem loaded"
        );
        Ok(Self {
            clock,
            inner: Mutex::new(NamesystemInner {
                role,
                namespace,
                replicas: ReplicaMap::new(),
                pending: PendingReports::new(),
                safe_mode,
                min_replication: config.min_replication,
            }),
        })
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, NamesystemInner>, MetaError> {
        self.inner
            .lock()
            .map_err(|e| MetaError::LockPoisoned(e.to_string()))
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Current HA role.
    pub fn role(&self) -> Result<HaRole, MetaError> {
        Ok(self.lock()?.role)
    }

    /// Last transaction replayed into the namespace.
    pub fn last_applied_txid(&self) -> Result<TxId, MetaError> {
        Ok(self.lock()?.namespace.last_applied())
    }

    /// Highest generation stamp the namespace knows.
    pub fn gen_stamp(&self) -> Result<GenStamp, MetaError> {
        Ok(self.lock()?.namespace.gen_stamp())
    }

    /// Copy of the current namespace.
    pub fn namespace(&self) -> Result<NamespaceSnapshot, MetaError> {
        Ok(self.lock()?.namespace.clone())
    }

    /// Verified replicas currently recorded for a block.
    pub fn replica_count(&self, block: BlockId) -> Result<usize, MetaError> {
        Ok(self.lock()?.replicas.count(block))
    }

    /// Queued incremental replicas and postponed full reports.
    pub fn pending_counts(&self) -> Result<(usize, usize), MetaError> {
        let inner = self.lock()?;
        Ok((
            inner.pending.replica_count(),
            inner.pending.full_report_count(),
        ))
    }

    /// Applies one edit log segment: every new transaction updates the
    /// namespace and the tracker, queued reports are re-judged, and safe mode
    /// is recomputed once at the end.
    ///
    /// Transactions at or before the last applied txid are skipped. A segment
    /// starting past the next expected txid is an [`MetaError::OutOfOrderSegment`].
    pub fn apply_segment(&self, segment: &EditLogSegment) -> Result<SegmentOutcome, MetaError> {
        segment.verify()?;

        let mut inner = self.lock()?;
        let expected = inner.namespace.last_applied().next();
        if segment.first_txid > expected {
            return Err(MetaError::OutOfOrderSegment {
                expected,
                found: segment.first_txid,
            });
        }

        let mut applied = 0;
        let mut skipped = 0;
        for tx in &segment.transactions {
            if tx.txid < expected {
                skipped += 1;
                continue;
            }
            let change = inner.namespace.apply(tx)?;
            inner.apply_change(change);
            applied += 1;
        }

        if applied > 0 {
            inner.process_pending();
        }
        let transition = inner.safe_mode.recompute(self.now_ms());
        let last_applied = inner.namespace.last_applied();

        tracing::debug!(
            first_txid = %segment.first_txid,
            last_txid = %segment.last_txid,
            applied,
            skipped,
            total_blocks = inner.safe_mode.total_blocks(),
            safe_blocks = inner.safe_mode.safe_blocks(),
            "applied edit log segment"
        );

        Ok(SegmentOutcome {
            applied,
            skipped,
            last_applied,
            transition,
        })
    }

    /// Standby -> active. The namespace as replayed so far becomes
    /// authoritative: queued storage node messages are judged one last time
    /// and safe mode is recomputed from the accumulated tally.
    ///
    /// Callers finish replay before calling this.
    pub fn on_promoted(&self) -> Result<(), MetaError> {
        let now = self.now_ms();
        let mut inner = self.lock()?;
        inner.role = HaRole::Active;

        let (replicas, full_reports) = inner.pending.drain_all();
        for report in full_reports {
            inner.apply_full_report(report.node, report.blocks);
        }
        for queued in replicas {
            inner.receive_replica(queued.node, queued.reported);
        }

        let (total, safe) = inner.recount();
        if inner.safe_mode.state() == SafeModeState::Off || inner.safe_mode.is_manual() {
            inner.safe_mode.set_block_total(total);
        } else {
            inner.safe_mode.reset(total, safe);
        }
        inner.safe_mode.recompute(now);

        tracing::info!(
            last_applied = %inner.namespace.last_applied(),
            total_blocks = inner.safe_mode.total_blocks(),
            safe_blocks = inner.safe_mode.safe_blocks(),
            state = ?inner.safe_mode.state(),
            "transitioned to active"
        );
        Ok(())
    }

    /// Active -> standby. Safe mode goes back to ON with the namespace's
    /// current totals and has to be earned again.
    pub fn on_demoted(&self) -> Result<(), MetaError> {
        let now = self.now_ms();
        let mut inner = self.lock()?;
        inner.role = HaRole::Standby;
        let (total, safe) = inner.recount();
        inner.safe_mode.reset(total, safe);
        inner.safe_mode.recompute(now);
        tracing::info!(
            last_applied = %inner.namespace.last_applied(),
            total_blocks = total,
            safe_blocks = safe,
            "transitioned to standby"
        );
        Ok(())
    }

    /// Replaces the namespace wholesale (image reload). Replica state and
    /// queued messages are discarded; storage nodes must report again.
    pub fn reload(&self, namespace: NamespaceSnapshot) -> Result<(), MetaError> {
        let now = self.now_ms();
        let mut inner = self.lock()?;
        inner.replicas = ReplicaMap::new();
        inner.pending = PendingReports::new();
        inner.safe_mode.enter(namespace.block_count());
        inner.namespace = namespace;
        inner.safe_mode.recompute(now);
        tracing::info!(
            blocks = inner.namespace.block_count(),
            last_applied = %inner.namespace.last_applied(),
            "namespace reloaded"
        );
        Ok(())
    }

    /// Safe mode status message; empty when safe mode is off. Re-evaluates an
    /// elapsed extension deadline first.
    pub fn safe_mode_status(&self) -> Result<String, MetaError> {
        let mut inner = self.lock()?;
        inner.safe_mode.recompute(self.now_ms());
        Ok(inner.safe_mode.status())
    }

    /// Current safe mode phase, after re-evaluating the deadline.
    pub fn safe_mode_state(&self) -> Result<SafeModeState, MetaError> {
        let mut inner = self.lock()?;
        inner.safe_mode.recompute(self.now_ms());
        Ok(inner.safe_mode.state())
    }

    /// True unless safe mode is off.
    pub fn is_in_safe_mode(&self) -> Result<bool, MetaError> {
        Ok(self.safe_mode_state()? != SafeModeState::Off)
    }

    /// Counters and state for diagnostics.
    pub fn safe_mode_report(&self) -> Result<SafeModeReport, MetaError> {
        let now = self.now_ms();
        let mut inner = self.lock()?;
        inner.safe_mode.recompute(now);
        Ok(inner.safe_mode.report(now))
    }

    /// Operator command: hold safe mode on until [`leave_safe_mode`](Self::leave_safe_mode).
    pub fn enter_manual_safe_mode(&self) -> Result<(), MetaError> {
        self.lock()?.safe_mode.enter_manual();
        Ok(())
    }

    /// Operator command: leave safe mode regardless of counters.
    pub fn leave_safe_mode(&self) -> Result<bool, MetaError> {
        Ok(self.lock()?.safe_mode.leave())
    }

    /// Gate for client operations. Writes are refused on a standby and while
    /// safe mode is on; reads always pass.
    pub fn check_operation(&self, category: OperationCategory) -> Result<(), MetaError> {
        if category == OperationCategory::Read {
            return Ok(());
        }
        let mut inner = self.lock()?;
        if inner.role == HaRole::Standby {
            return Err(MetaError::StandbyState(category));
        }
        inner.safe_mode.recompute(self.now_ms());
        if inner.safe_mode.is_on() {
            return Err(MetaError::SafeModeOn {
                tip: inner.safe_mode.status(),
            });
        }
        Ok(())
    }
}
