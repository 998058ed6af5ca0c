//! Property-based tests for safe mode accounting using proptest.
//!
//! Arbitrary interleavings of storage node messages must keep the safe block
//! counter equal to a from-scratch recount of the replica map.

use std::sync::Arc;

use cairnfs_meta::{
    BlockId, BlockInfo, GenStamp, HaRole, ManualClock, Namesystem, NamespaceSnapshot,
    ReportedBlock, SafeModeConfig, SafeModeTracker, StorageNodeId, TxId,
};
use proptest::prelude::*;

const NODES: usize = 3;

#[derive(Clone, Debug)]
enum Event {
    Received { node: usize, block: u64, skew: i8 },
    Deleted { node: usize, block: u64 },
    FullReport { node: usize, blocks: Vec<u64> },
    RemoveNode { node: usize },
}

/// Generator for storage node messages over `blocks` blocks.
fn any_event(blocks: u64) -> impl Strategy<Value = Event> {
    prop_oneof![
        4 => (0..NODES, 0..blocks + 2, -1i8..=1).prop_map(|(node, block, skew)| Event::Received {
            node,
            block,
            skew
        }),
        2 => (0..NODES, 0..blocks + 2).prop_map(|(node, block)| Event::Deleted { node, block }),
        1 => (0..NODES, proptest::collection::vec(0..blocks + 2, 0..8))
            .prop_map(|(node, blocks)| Event::FullReport { node, blocks }),
        1 => (0..NODES).prop_map(|node| Event::RemoveNode { node }),
    ]
}

fn gen_stamp_of(block: u64) -> u64 {
    1000 + block
}

fn reported(block: u64, skew: i8) -> ReportedBlock {
    let gs = (gen_stamp_of(block) as i64 + skew as i64) as u64;
    ReportedBlock::new(BlockId::new(block), GenStamp::new(gs))
}

fn namesystem(blocks: u64) -> Namesystem {
    let namespace = NamespaceSnapshot::from_blocks(
        (0..blocks).map(|b| {
            (
                BlockId::new(b),
                BlockInfo {
                    gen_stamp: GenStamp::new(gen_stamp_of(b)),
                    expected_replicas: 3,
                },
            )
        }),
        TxId::new(blocks),
    );
    Namesystem::new(
        &SafeModeConfig::default(),
        namespace,
        HaRole::Standby,
        Arc::new(ManualClock::new(0)),
    )
    .unwrap()
}

fn apply(fs: &Namesystem, nodes: &[StorageNodeId], event: &Event) {
    match event {
        Event::Received { node, block, skew } => {
            fs.block_received(nodes[*node], reported(*block, *skew))
                .unwrap();
        }
        Event::Deleted { node, block } => {
            fs.block_deleted(nodes[*node], BlockId::new(*block)).unwrap();
        }
        Event::FullReport { node, blocks } => {
            let report = blocks.iter().map(|b| reported(*b, 0)).collect();
            fs.process_full_report(nodes[*node], report).unwrap();
        }
        Event::RemoveNode { node } => {
            fs.remove_storage_node(nodes[*node]).unwrap();
        }
    }
}

proptest! {
    /// Test: the safe counter always matches a recount and never exceeds the total
    #[test]
    fn test_safe_counter_matches_recount(
        (blocks, events) in (1u64..12).prop_flat_map(|blocks| {
            (Just(blocks), proptest::collection::vec(any_event(blocks), 0..60))
        })
    ) {
        let fs = namesystem(blocks);
        let nodes: Vec<StorageNodeId> = (0..NODES).map(|_| StorageNodeId::random()).collect();

        for event in &events {
            apply(&fs, &nodes, event);

            let report = fs.safe_mode_report().unwrap();
            let recount = (0..blocks)
                .filter(|b| fs.replica_count(BlockId::new(*b)).unwrap() >= 1)
                .count() as u64;
            prop_assert_eq!(report.total_blocks, blocks);
            prop_assert!(report.safe_blocks <= report.total_blocks);
            prop_assert_eq!(report.safe_blocks, recount);
            prop_assert!(fs.replica_count(BlockId::new(blocks)).unwrap() == 0);
        }
    }

    /// Test: delivering any message a second time changes nothing
    #[test]
    fn test_messages_are_idempotent(
        (blocks, events) in (1u64..12).prop_flat_map(|blocks| {
            (Just(blocks), proptest::collection::vec(any_event(blocks), 1..40))
        })
    ) {
        let fs = namesystem(blocks);
        let nodes: Vec<StorageNodeId> = (0..NODES).map(|_| StorageNodeId::random()).collect();

        for event in &events {
            apply(&fs, &nodes, event);
            let once = fs.safe_mode_report().unwrap();
            let pending_once = fs.pending_counts().unwrap();
            apply(&fs, &nodes, event);
            prop_assert_eq!(fs.safe_mode_report().unwrap(), once);
            prop_assert_eq!(fs.pending_counts().unwrap(), pending_once);
        }
    }

    /// Test: blocks needed is exactly the gap to the threshold count
    #[test]
    fn test_threshold_arithmetic(
        total in 0u64..100_000,
        safe_frac in 0.0f64..=1.0,
        threshold_pct in 0.0f64..=1.0,
    ) {
        let safe = (total as f64 * safe_frac) as u64;
        let mut tracker = SafeModeTracker::new(&SafeModeConfig {
            threshold_pct,
            extension_ms: 30_000,
            min_replication: 1,
        });
        tracker.reset(total, safe);

        let threshold = tracker.block_threshold();
        prop_assert!(threshold <= total);
        prop_assert_eq!(tracker.threshold_met(), safe >= threshold);
        prop_assert_eq!(tracker.blocks_needed(), threshold.saturating_sub(safe));
    }
}
