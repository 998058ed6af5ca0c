//! Verified replica locations and the queue of storage node messages that
//! cannot be judged until edit log replay catches up.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::namespace::NamespaceSnapshot;
use crate::types::{BlockId, GenStamp, ReportedBlock, StorageNodeId};

/// How a reported replica relates to the namespace.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReplicaVerdict {
    /// Stamp matches the namespace: the replica counts.
    Current,
    /// Stamp is older than the namespace's: superseded data.
    Stale,
    /// Stamp is newer than replay has reached: judge again later.
    Future,
    /// Block is not in the namespace and its stamp is not in the future.
    Unknown,
}

/// Classifies a reported replica against the namespace.
pub fn classify(namespace: &NamespaceSnapshot, reported: &ReportedBlock) -> ReplicaVerdict {
    match namespace.block(reported.block_id) {
        Some(info) => match reported.gen_stamp.cmp(&info.gen_stamp) {
            std::cmp::Ordering::Equal => ReplicaVerdict::Current,
            std::cmp::Ordering::Less => ReplicaVerdict::Stale,
            std::cmp::Ordering::Greater => ReplicaVerdict::Future,
        },
        None if namespace.is_gen_stamp_in_future(reported.gen_stamp) => ReplicaVerdict::Future,
        None => ReplicaVerdict::Unknown,
    }
}

/// Storage nodes holding a verified-current replica of each block.
#[derive(Clone, Debug, Default)]
pub struct ReplicaMap {
    by_block: HashMap<BlockId, BTreeSet<StorageNodeId>>,
    by_node: HashMap<StorageNodeId, BTreeSet<BlockId>>,
}

impl ReplicaMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a replica. Returns the new replica count, or None if it was
    /// already recorded.
    pub fn add(&mut self, block: BlockId, node: StorageNodeId) -> Option<usize> {
        let holders = self.by_block.entry(block).or_default();
        if !holders.insert(node) {
            return None;
        }
        self.by_node.entry(node).or_default().insert(block);
        Some(holders.len())
    }

    /// Forgets a replica. Returns the count before removal, or None if the
    /// replica was not recorded.
    pub fn remove(&mut self, block: BlockId, node: StorageNodeId) -> Option<usize> {
        let holders = self.by_block.get_mut(&block)?;
        let before = holders.len();
        if !holders.remove(&node) {
            return None;
        }
        if holders.is_empty() {
            self.by_block.remove(&block);
        }
        if let Some(blocks) = self.by_node.get_mut(&node) {
            blocks.remove(&block);
            if blocks.is_empty() {
                self.by_node.remove(&node);
            }
        }
        Some(before)
    }

    /// Drops every replica of a block. Returns how many there were.
    pub fn remove_block(&mut self, block: BlockId) -> usize {
        let Some(holders) = self.by_block.remove(&block) else {
            return 0;
        };
        for node in &holders {
            if let Some(blocks) = self.by_node.get_mut(node) {
                blocks.remove(&block);
                if blocks.is_empty() {
                    self.by_node.remove(node);
                }
            }
        }
        holders.len()
    }

    /// Number of verified replicas of a block.
    pub fn count(&self, block: BlockId) -> usize {
        self.by_block.get(&block).map(|h| h.len()).unwrap_or(0)
    }

    /// Blocks for which `node` holds a verified replica.
    pub fn blocks_on(&self, node: StorageNodeId) -> Vec<BlockId> {
        self.by_node
            .get(&node)
            .map(|blocks| blocks.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of blocks with at least `min_replication` replicas.
    pub fn safe_block_count(&self, min_replication: usize) -> u64 {
        self.by_block
            .values()
            .filter(|holders| holders.len() >= min_replication)
            .count() as u64
    }

    /// Number of distinct storage nodes with at least one replica.
    pub fn node_count(&self) -> usize {
        self.by_node.len()
    }
}

/// An incremental "block received" message waiting for replay.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PendingReplica {
    /// Reporting storage node
    pub node: StorageNodeId,
    /// The replica as reported
    pub reported: ReportedBlock,
}

/// A full block report postponed because it names future-stamped blocks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingFullReport {
    /// Reporting storage node
    pub node: StorageNodeId,
    /// Every replica in the report
    pub blocks: Vec<ReportedBlock>,
    /// Highest stamp in the report
    pub max_gen_stamp: GenStamp,
}

/// Storage node messages queued until the namespace recognizes their stamps.
#[derive(Clone, Debug, Default)]
pub struct PendingReports {
    replicas: BTreeMap<GenStamp, Vec<PendingReplica>>,
    full_reports: HashMap<StorageNodeId, PendingFullReport>,
}

impl PendingReports {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an incremental replica. Duplicates are dropped.
    pub fn enqueue_replica(&mut self, node: StorageNodeId, reported: ReportedBlock) {
        let entry = PendingReplica { node, reported };
        let queue = self.replicas.entry(reported.gen_stamp).or_default();
        if !queue.contains(&entry) {
            queue.push(entry);
        }
    }

    /// Queues a full report, replacing any earlier one from the same node.
    pub fn postpone_full_report(&mut self, report: PendingFullReport) {
        self.full_reports.insert(report.node, report);
    }

    /// Forgets queued messages about a replica the node says it deleted.
    pub fn discard_replica(&mut self, node: StorageNodeId, block: BlockId) {
        self.replicas.retain(|_, queue| {
            queue.retain(|p| !(p.node == node && p.reported.block_id == block));
            !queue.is_empty()
        });
        if let Some(report) = self.full_reports.get_mut(&node) {
            report.blocks.retain(|b| b.block_id != block);
        }
    }

    /// Forgets everything queued for a storage node.
    pub fn discard_node(&mut self, node: StorageNodeId) {
        self.replicas.retain(|_, queue| {
            queue.retain(|p| p.node != node);
            !queue.is_empty()
        });
        self.full_reports.remove(&node);
    }

    /// Removes and returns queued replicas with stamps up to `gen_stamp`.
    pub fn take_replicas_up_to(&mut self, gen_stamp: GenStamp) -> Vec<PendingReplica> {
        let later = match gen_stamp.as_u64().checked_add(1) {
            Some(next) => self.replicas.split_off(&GenStamp::new(next)),
            None => BTreeMap::new(),
        };
        let ready = std::mem::replace(&mut self.replicas, later);
        ready.into_values().flatten().collect()
    }

    /// Removes and returns full reports whose stamps are all up to `gen_stamp`.
    pub fn take_full_reports_up_to(&mut self, gen_stamp: GenStamp) -> Vec<PendingFullReport> {
        let ready: Vec<StorageNodeId> = self
            .full_reports
            .iter()
            .filter(|(_, r)| r.max_gen_stamp <= gen_stamp)
            .map(|(node, _)| *node)
            .collect();
        ready
            .into_iter()
            .filter_map(|node| self.full_reports.remove(&node))
            .collect()
    }

    /// Empties the queue.
    pub fn drain_all(&mut self) -> (Vec<PendingReplica>, Vec<PendingFullReport>) {
        let replicas = std::mem::take(&mut self.replicas)
            .into_values()
            .flatten()
            .collect();
        let full_reports = std::mem::take(&mut self.full_reports)
            .into_values()
            .collect();
        (replicas, full_reports)
    }

    /// Number of queued incremental replicas.
    pub fn replica_count(&self) -> usize {
        self.replicas.values().map(|q| q.len()).sum()
    }

    /// Number of postponed full reports.
    pub fn full_report_count(&self) -> usize {
        self.full_reports.len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty() && self.full_reports.is_empty()
    }
}
