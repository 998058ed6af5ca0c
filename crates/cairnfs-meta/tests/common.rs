//! Common test utilities and fixtures for integration tests.
//!
//! [`TestCluster`] models one active node writing the shared edit log, three
//! storage nodes holding replicas, and one standby namesystem that replays the
//! log. Replay is driven explicitly so safe mode status can be asserted at
//! each step.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use cairnfs_meta::{
    BlockId, EditLogTailer, EditOp, GenStamp, HaController, HaRole, ManualClock, Namesystem,
    NamespaceSnapshot, RecordingTerminationSink, ReplayConfig, ReportedBlock, SafeModeConfig,
    SharedEditLog, StorageNodeId, Transaction,
};

/// Replication factor of every block the harness creates.
pub const REPLICATION: u16 = 3;

/// Test configuration with sensible defaults for fast testing
pub struct TestConfig {
    pub storage_nodes: usize,
    pub safe_mode: SafeModeConfig,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            storage_nodes: REPLICATION as usize,
            safe_mode: SafeModeConfig {
                threshold_pct: 0.999,
                extension_ms: 30_000,
                min_replication: 1,
            },
        }
    }
}

/// A storage node's replica inventory.
pub struct StorageNode {
    pub id: StorageNodeId,
    replicas: BTreeMap<BlockId, GenStamp>,
}

impl StorageNode {
    fn new() -> Self {
        Self {
            id: StorageNodeId::random(),
            replicas: BTreeMap::new(),
        }
    }

    /// Everything this node holds, as it would appear in a full report.
    pub fn report(&self) -> Vec<ReportedBlock> {
        self.replicas
            .iter()
            .map(|(block, gs)| ReportedBlock::new(*block, *gs))
            .collect()
    }
}

/// An in-process active/standby pair sharing one edit log.
pub struct TestCluster {
    pub log: Arc<SharedEditLog>,
    pub clock: Arc<ManualClock>,
    pub sink: Arc<RecordingTerminationSink>,
    pub standby: Arc<Namesystem>,
    pub nodes: Vec<StorageNode>,
    safe_mode: SafeModeConfig,
    tailer: EditLogTailer,
    active: NamespaceSnapshot,
    next_block: u64,
    next_gen_stamp: u64,
}

impl TestCluster {
    /// Create a new cluster with an empty namespace
    pub fn new(config: TestConfig) -> Self {
        let log = Arc::new(SharedEditLog::new());
        let clock = Arc::new(ManualClock::new(0));
        let sink = Arc::new(RecordingTerminationSink::new());
        let standby = Arc::new(
            Namesystem::new(
                &config.safe_mode,
                NamespaceSnapshot::new(),
                HaRole::Standby,
                clock.clone(),
            )
            .expect("namesystem"),
        );
        let tailer = new_tailer(&standby, &log, &sink);
        Self {
            log,
            clock,
            sink,
            standby,
            nodes: (0..config.storage_nodes).map(|_| StorageNode::new()).collect(),
            safe_mode: config.safe_mode,
            tailer,
            active: NamespaceSnapshot::new(),
            next_block: 1,
            next_gen_stamp: 1000,
        }
    }

    fn log_op(&mut self, op: EditOp) {
        let txid = self.log.log(op).expect("log edit");
        self.active
            .apply(&Transaction::new(txid, op))
            .expect("active namespace accepts its own edit");
    }

    /// Allocates `count` blocks on the active node, each with a fresh
    /// generation stamp, and places a replica on every storage node.
    pub fn create_blocks(&mut self, count: usize) -> Vec<ReportedBlock> {
        let mut created = Vec::with_capacity(count);
        for _ in 0..count {
            self.next_gen_stamp += 1;
            let gen_stamp = GenStamp::new(self.next_gen_stamp);
            let block = BlockId::new(self.next_block);
            self.next_block += 1;

            self.log_op(EditOp::SetGenStamp { gen_stamp });
            self.log_op(EditOp::AddBlock {
                block,
                gen_stamp,
                expected_replicas: REPLICATION,
            });
            for node in &mut self.nodes {
                node.replicas.insert(block, gen_stamp);
            }
            created.push(ReportedBlock::new(block, gen_stamp));
        }
        created
    }

    /// Deletes blocks on the active node and drops their replicas.
    pub fn delete_blocks(&mut self, blocks: &[ReportedBlock]) {
        for reported in blocks {
            self.log_op(EditOp::DeleteBlock {
                block: reported.block_id,
            });
            for node in &mut self.nodes {
                node.replicas.remove(&reported.block_id);
            }
        }
    }

    /// Every storage node tells the standby it received `blocks`.
    pub fn notify_received(&self, blocks: &[ReportedBlock]) {
        for node in &self.nodes {
            for reported in blocks {
                self.standby
                    .block_received(node.id, *reported)
                    .expect("block received");
            }
        }
    }

    /// Every storage node tells the standby it deleted `blocks`.
    pub fn notify_deleted(&self, blocks: &[ReportedBlock]) {
        for node in &self.nodes {
            for reported in blocks {
                self.standby
                    .block_deleted(node.id, reported.block_id)
                    .expect("block deleted");
            }
        }
    }

    /// Every storage node sends a full report to the standby.
    pub fn send_full_reports(&self) {
        for node in &self.nodes {
            self.standby
                .process_full_report(node.id, node.report())
                .expect("full report");
        }
    }

    /// Active finalizes its open segment; standby replays everything finalized.
    pub fn roll_and_catch_up(&mut self) {
        self.log.roll().expect("roll");
        self.tailer.catch_up(false).expect("catch up");
        assert_eq!(
            self.standby.last_applied_txid().expect("txid"),
            self.active.last_applied(),
            "standby did not reach the active's last txid"
        );
    }

    /// Restarts the standby from an image of its current namespace. The
    /// restarted standby replays finalized segments and then receives a full
    /// report from every storage node.
    pub fn restart_standby(&mut self) {
        let image = self
            .standby
            .namespace()
            .expect("namespace")
            .encode_image()
            .expect("encode image");
        let namespace = NamespaceSnapshot::decode_image(&image).expect("decode image");
        self.standby = Arc::new(
            Namesystem::new(
                &self.safe_mode,
                namespace,
                HaRole::Standby,
                self.clock.clone(),
            )
            .expect("namesystem"),
        );
        self.tailer = new_tailer(&self.standby, &self.log, &self.sink);
        self.tailer.catch_up(false).expect("catch up after restart");
        self.send_full_reports();
    }

    /// Fails over to the standby: final catch-up including the open segment,
    /// then promotion.
    pub async fn promote_standby(&self) {
        let controller = HaController::new(
            self.standby.clone(),
            self.log.clone(),
            self.sink.clone(),
            ReplayConfig::default(),
        );
        controller.transition_to_active().await.expect("promote");
    }

    /// The standby's safe mode status, with the deadline re-evaluated.
    pub fn status(&self) -> String {
        self.standby.safe_mode_status().expect("status")
    }

    /// Asserts the status contains `expected`.
    pub fn assert_status(&self, expected: &str) {
        let status = self.status();
        assert!(
            status.contains(expected),
            "bad safe mode status\n  expected to contain: {}\n  actual: {}",
            expected,
            status
        );
    }
}

fn new_tailer(
    standby: &Arc<Namesystem>,
    log: &Arc<SharedEditLog>,
    sink: &Arc<RecordingTerminationSink>,
) -> EditLogTailer {
    EditLogTailer::new(
        standby.clone(),
        log.clone(),
        sink.clone(),
        ReplayConfig::default(),
    )
}

/// "The reported blocks N needs additional M blocks ..." fragment.
pub fn needs(safe: u64, additional: u64) -> String {
    format!(
        "The reported blocks {} needs additional {} blocks",
        safe, additional
    )
}

/// "... has reached the threshold 0.9990 of total blocks N" fragment.
pub fn reached(safe: u64, total: u64) -> String {
    format!(
        "The reported blocks {} has reached the threshold 0.9990 of total blocks {}",
        safe, total
    )
}
