//! Block report ingestion from storage nodes.
//!
//! A full report replaces everything the namesystem believes a storage node
//! holds and is followed by one safe mode recompute. Incremental
//! received/deleted notifications are applied one at a time, each followed by
//! a recompute. Both are idempotent per block.
//!
//! While standby, replicas stamped beyond what replay has reached are queued
//! (a full report naming any such replica is postponed as a whole) and judged
//! again after each applied segment. Stale and unknown replicas are ignored.

use std::collections::HashSet;

use crate::blockmap::{classify, PendingFullReport, ReplicaVerdict};
use crate::namesystem::{Namesystem, NamesystemInner};
use crate::types::{BlockId, HaRole, MetaError, ReportedBlock, StorageNodeId};

/// What happened to one incremental notification.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Replica recorded as verified-current.
    Counted,
    /// Replica was already recorded.
    Duplicate,
    /// Stamp is ahead of replay; queued for later.
    Postponed,
    /// Stamp older than the namespace's.
    Stale,
    /// Block not in the namespace.
    Unknown,
    /// Future stamp on an active node; dropped.
    Ignored,
    /// Replica forgotten after a deletion notice.
    Removed,
    /// Deletion notice for a replica that was not recorded.
    NotFound,
}

/// Tally of one full block report.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FullReportSummary {
    /// Whole report queued until replay catches up
    pub postponed: bool,
    /// Replicas newly recorded
    pub added: usize,
    /// Replicas that were already recorded
    pub unchanged: usize,
    /// Previously recorded replicas the node no longer lists
    pub removed: usize,
    /// Replicas with superseded stamps
    pub stale: usize,
    /// Replicas of blocks not in the namespace
    pub unknown: usize,
    /// Future-stamped replicas dropped by an active node
    pub ignored: usize,
}

impl NamesystemInner {
    pub(crate) fn receive_replica(
        &mut self,
        node: StorageNodeId,
        reported: ReportedBlock,
    ) -> IngestOutcome {
        match classify(&self.namespace, &reported) {
            ReplicaVerdict::Current => {
                if self.add_replica(node, reported.block_id) {
                    IngestOutcome::Counted
                } else {
                    IngestOutcome::Duplicate
                }
            }
            ReplicaVerdict::Stale => IngestOutcome::Stale,
            ReplicaVerdict::Unknown => IngestOutcome::Unknown,
            ReplicaVerdict::Future if self.role == HaRole::Standby => {
                self.pending.enqueue_replica(node, reported);
                IngestOutcome::Postponed
            }
            ReplicaVerdict::Future => {
                tracing::warn!(
                    node = %node,
                    block = %reported.block_id,
                    gen_stamp = %reported.gen_stamp,
                    "ignoring replica with future generation stamp on active node"
                );
                IngestOutcome::Ignored
            }
        }
    }

    pub(crate) fn apply_full_report(
        &mut self,
        node: StorageNodeId,
        blocks: Vec<ReportedBlock>,
    ) -> FullReportSummary {
        let mut summary = FullReportSummary::default();

        if self.role == HaRole::Standby {
            let future_max = blocks
                .iter()
                .filter(|b| classify(&self.namespace, b) == ReplicaVerdict::Future)
                .map(|b| b.gen_stamp)
                .max();
            if let Some(max_gen_stamp) = future_max {
                tracing::debug!(
                    node = %node,
                    blocks = blocks.len(),
                    max_gen_stamp = %max_gen_stamp,
                    namespace_gen_stamp = %self.namespace.gen_stamp(),
                    "postponing full block report with future generation stamps"
                );
                self.pending.postpone_full_report(PendingFullReport {
                    node,
                    blocks,
                    max_gen_stamp,
                });
                summary.postponed = true;
                return summary;
            }
        }

        let mut current: HashSet<BlockId> = HashSet::with_capacity(blocks.len());
        for reported in blocks {
            match self.receive_replica(node, reported) {
                IngestOutcome::Counted => {
                    summary.added += 1;
                    current.insert(reported.block_id);
                }
                IngestOutcome::Duplicate => {
                    summary.unchanged += 1;
                    current.insert(reported.block_id);
                }
                IngestOutcome::Stale => summary.stale += 1,
                IngestOutcome::Unknown => summary.unknown += 1,
                IngestOutcome::Ignored | IngestOutcome::Postponed => summary.ignored += 1,
                IngestOutcome::Removed | IngestOutcome::NotFound => {}
            }
        }

        for block in self.replicas.blocks_on(node) {
            if !current.contains(&block) && self.remove_replica(node, block) {
                summary.removed += 1;
            }
        }
        summary
    }
}

impl Namesystem {
    /// Applies a storage node's full block report, then recomputes safe mode once.
    pub fn process_full_report(
        &self,
        node: StorageNodeId,
        blocks: Vec<ReportedBlock>,
    ) -> Result<FullReportSummary, MetaError> {
        let now = self.now_ms();
        let mut inner = self.lock()?;
        let summary = inner.apply_full_report(node, blocks);
        inner.safe_mode.recompute(now);
        tracing::debug!(
            node = %node,
            ?summary,
            safe_blocks = inner.safe_mode.safe_blocks(),
            total_blocks = inner.safe_mode.total_blocks(),
            "processed full block report"
        );
        Ok(summary)
    }

    /// Applies a "block received" notification, then recomputes safe mode.
    pub fn block_received(
        &self,
        node: StorageNodeId,
        reported: ReportedBlock,
    ) -> Result<IngestOutcome, MetaError> {
        let now = self.now_ms();
        let mut inner = self.lock()?;
        let outcome = inner.receive_replica(node, reported);
        inner.safe_mode.recompute(now);
        tracing::debug!(
            node = %node,
            block = %reported.block_id,
            gen_stamp = %reported.gen_stamp,
            ?outcome,
            "block received"
        );
        Ok(outcome)
    }

    /// Applies a "block deleted" notification, then recomputes safe mode.
    pub fn block_deleted(
        &self,
        node: StorageNodeId,
        block: BlockId,
    ) -> Result<IngestOutcome, MetaError> {
        let now = self.now_ms();
        let mut inner = self.lock()?;
        inner.pending.discard_replica(node, block);
        let outcome = if inner.remove_replica(node, block) {
            IngestOutcome::Removed
        } else {
            IngestOutcome::NotFound
        };
        inner.safe_mode.recompute(now);
        tracing::debug!(node = %node, block = %block, ?outcome, "block deleted");
        Ok(outcome)
    }

    /// Drops every replica of a storage node declared dead. Returns how many
    /// replicas were forgotten.
    pub fn remove_storage_node(&self, node: StorageNodeId) -> Result<usize, MetaError> {
        let now = self.now_ms();
        let mut inner = self.lock()?;
        inner.pending.discard_node(node);
        let mut removed = 0;
        for block in inner.replicas.blocks_on(node) {
            if inner.remove_replica(node, block) {
                removed += 1;
            }
        }
        inner.safe_mode.recompute(now);
        tracing::info!(node = %node, removed, "removed storage node");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SafeModeConfig;
    use crate::editlog::{EditLogSegment, EditOp, Transaction};
    use crate::namespace::{BlockInfo, NamespaceSnapshot};
    use crate::safemode::SafeModeState;
    use crate::types::{GenStamp, TxId};
    use std::sync::Arc;

    fn rb(block: u64, gs: u64) -> ReportedBlock {
        ReportedBlock::new(BlockId::new(block), GenStamp::new(gs))
    }

    fn standby(blocks: &[(u64, u64)], min_replication: usize) -> Namesystem {
        let ns = NamespaceSnapshot::from_blocks(
            blocks.iter().map(|(b, gs)| {
                (
                    BlockId::new(*b),
                    BlockInfo {
                        gen_stamp: GenStamp::new(*gs),
                        expected_replicas: 3,
                    },
                )
            }),
            TxId::new(blocks.len() as u64),
        );
        let config = SafeModeConfig {
            min_replication,
            ..Default::default()
        };
        Namesystem::new(
            &config,
            ns,
            HaRole::Standby,
            Arc::new(ManualClock::new(0)),
        )
        .unwrap()
    }

    fn safe_blocks(fs: &Namesystem) -> u64 {
        fs.safe_mode_report().unwrap().safe_blocks
    }

    #[test]
    fn test_received_is_idempotent() {
        let fs = standby(&[(1, 1001)], 1);
        let node = StorageNodeId::random();
        assert_eq!(fs.block_received(node, rb(1, 1001)).unwrap(), IngestOutcome::Counted);
        assert_eq!(fs.block_received(node, rb(1, 1001)).unwrap(), IngestOutcome::Duplicate);
        assert_eq!(safe_blocks(&fs), 1);
        assert_eq!(fs.replica_count(BlockId::new(1)).unwrap(), 1);
    }

    #[test]
    fn test_deleted_is_idempotent() {
        let fs = standby(&[(1, 1001)], 1);
        let node = StorageNodeId::random();
        fs.block_received(node, rb(1, 1001)).unwrap();
        assert_eq!(fs.block_deleted(node, BlockId::new(1)).unwrap(), IngestOutcome::Removed);
        assert_eq!(fs.block_deleted(node, BlockId::new(1)).unwrap(), IngestOutcome::NotFound);
        assert_eq!(safe_blocks(&fs), 0);
    }

    #[test]
    fn test_stale_and_unknown_ignored() {
        let fs = standby(&[(1, 1001)], 1);
        let node = StorageNodeId::random();
        assert_eq!(fs.block_received(node, rb(1, 1000)).unwrap(), IngestOutcome::Stale);
        assert_eq!(fs.block_received(node, rb(9, 900)).unwrap(), IngestOutcome::Unknown);
        assert_eq!(safe_blocks(&fs), 0);
        assert_eq!(fs.pending_counts().unwrap(), (0, 0));
    }

    #[test]
    fn test_future_received_postponed_then_counted_after_replay() {
        let fs = standby(&[(1, 1001)], 1);
        let node = StorageNodeId::random();
        assert_eq!(fs.block_received(node, rb(2, 1002)).unwrap(), IngestOutcome::Postponed);
        assert_eq!(fs.pending_counts().unwrap(), (1, 0));

        let segment = EditLogSegment::new(
            vec![Transaction::new(
                TxId::new(2),
                EditOp::AddBlock {
                    block: BlockId::new(2),
                    gen_stamp: GenStamp::new(1002),
                    expected_replicas: 3,
                },
            )],
            false,
        )
        .unwrap();
        fs.apply_segment(&segment).unwrap();
        assert_eq!(fs.pending_counts().unwrap(), (0, 0));
        assert_eq!(safe_blocks(&fs), 1);
        assert_eq!(fs.replica_count(BlockId::new(2)).unwrap(), 1);
    }

    #[test]
    fn test_full_report_with_future_block_postponed_whole() {
        let fs = standby(&[(1, 1001), (2, 1001), (3, 1001)], 1);
        let node = StorageNodeId::random();
        let summary = fs
            .process_full_report(node, vec![rb(1, 1001), rb(2, 1001), rb(3, 1001), rb(4, 1004)])
            .unwrap();
        assert!(summary.postponed);
        assert_eq!(safe_blocks(&fs), 0);
        assert!(fs
            .safe_mode_status()
            .unwrap()
            .starts_with("Safe mode is ON. The reported blocks 0 needs additional 3 blocks"));
        assert_eq!(fs.pending_counts().unwrap(), (0, 1));
    }

    #[test]
    fn test_full_report_replaces_node_set() {
        let fs = standby(&[(1, 1001), (2, 1001)], 1);
        let node = StorageNodeId::random();
        let first = fs
            .process_full_report(node, vec![rb(1, 1001), rb(2, 1001)])
            .unwrap();
        assert_eq!(first.added, 2);
        assert_eq!(safe_blocks(&fs), 2);

        let second = fs.process_full_report(node, vec![rb(2, 1001)]).unwrap();
        assert_eq!(second.unchanged, 1);
        assert_eq!(second.removed, 1);
        assert_eq!(safe_blocks(&fs), 1);
    }

    #[test]
    fn test_min_replication_counts_at_threshold() {
        let fs = standby(&[(1, 1001)], 2);
        let a = StorageNodeId::random();
        let b = StorageNodeId::random();
        fs.block_received(a, rb(1, 1001)).unwrap();
        assert_eq!(safe_blocks(&fs), 0);
        fs.block_received(b, rb(1, 1001)).unwrap();
        assert_eq!(safe_blocks(&fs), 1);
        fs.block_deleted(a, BlockId::new(1)).unwrap();
        assert_eq!(safe_blocks(&fs), 0);
    }

    #[test]
    fn test_remove_storage_node() {
        let fs = standby(&[(1, 1001), (2, 1001)], 1);
        let node = StorageNodeId::random();
        fs.process_full_report(node, vec![rb(1, 1001), rb(2, 1001)])
            .unwrap();
        assert_eq!(fs.safe_mode_state().unwrap(), SafeModeState::OnExtension);
        assert_eq!(fs.remove_storage_node(node).unwrap(), 2);
        assert_eq!(safe_blocks(&fs), 0);
        assert_eq!(fs.safe_mode_state().unwrap(), SafeModeState::On);
    }

    #[test]
    fn test_deleted_discards_pending() {
        let fs = standby(&[(1, 1001)], 1);
        let node = StorageNodeId::random();
        fs.block_received(node, rb(5, 1005)).unwrap();
        assert_eq!(fs.block_deleted(node, BlockId::new(5)).unwrap(), IngestOutcome::NotFound);
        assert_eq!(fs.pending_counts().unwrap(), (0, 0));
    }

    #[test]
    fn test_active_ignores_future() {
        let fs = standby(&[(1, 1001)], 1);
        fs.on_promoted().unwrap();
        let node = StorageNodeId::random();
        assert_eq!(fs.block_received(node, rb(7, 2000)).unwrap(), IngestOutcome::Ignored);
        assert_eq!(fs.pending_counts().unwrap(), (0, 0));
    }
}
