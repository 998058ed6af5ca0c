//! The replica's view of which blocks exist and at which generation stamp.
//!
//! The snapshot only moves forward through edit log replay (or a full image
//! reload). Block reports never change it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::editlog::{EditOp, Transaction};
use crate::types::{BlockId, GenStamp, MetaError, TxId};

const IMAGE_VERSION: u32 = 1;

/// Per-block metadata known to the namespace.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    /// Currently valid generation stamp.
    pub gen_stamp: GenStamp,
    /// Replication factor requested for the block.
    pub expected_replicas: u16,
}

/// Effect of one applied transaction on the block set.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NamespaceChange {
    /// A new block became visible.
    BlockAdded {
        /// The new block
        block: BlockId,
        /// Its generation stamp
        gen_stamp: GenStamp,
    },
    /// A block was deleted.
    BlockRemoved {
        /// The deleted block
        block: BlockId,
    },
    /// A block moved to a newer generation stamp; older replicas are now stale.
    BlockUpdated {
        /// The updated block
        block: BlockId,
        /// Stamp before the update
        previous: GenStamp,
        /// Stamp after the update
        current: GenStamp,
    },
    /// Only the namespace-wide generation stamp moved.
    GenStampAdvanced(GenStamp),
}

/// Snapshot of block existence and expected generation stamps.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NamespaceSnapshot {
    blocks: BTreeMap<BlockId, BlockInfo>,
    gen_stamp: GenStamp,
    last_applied: TxId,
}

#[derive(Serialize, Deserialize)]
struct ImageFile {
    version: u32,
    checksum: [u8; 32],
    payload: Vec<u8>,
}

impl NamespaceSnapshot {
    /// Creates an empty namespace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a namespace from a loaded block list, positioned after `last_applied`.
    pub fn from_blocks<I>(blocks: I, last_applied: TxId) -> Self
    where
        I: IntoIterator<Item = (BlockId, BlockInfo)>,
    {
        let blocks: BTreeMap<BlockId, BlockInfo> = blocks.into_iter().collect();
        let gen_stamp = blocks
            .values()
            .map(|info| info.gen_stamp)
            .max()
            .unwrap_or(GenStamp::ZERO);
        Self {
            blocks,
            gen_stamp,
            last_applied,
        }
    }

    /// Number of blocks in the namespace.
    pub fn block_count(&self) -> u64 {
        self.blocks.len() as u64
    }

    /// Looks up a block.
    pub fn block(&self, id: BlockId) -> Option<&BlockInfo> {
        self.blocks.get(&id)
    }

    /// Iterates all blocks in id order.
    pub fn blocks(&self) -> impl Iterator<Item = (&BlockId, &BlockInfo)> {
        self.blocks.iter()
    }

    /// Highest generation stamp the namespace has seen.
    pub fn gen_stamp(&self) -> GenStamp {
        self.gen_stamp
    }

    /// Last transaction applied to this snapshot.
    pub fn last_applied(&self) -> TxId {
        self.last_applied
    }

    /// Returns true if `gen_stamp` is newer than anything replayed so far.
    pub fn is_gen_stamp_in_future(&self, gen_stamp: GenStamp) -> bool {
        gen_stamp > self.gen_stamp
    }

    /// Applies the next transaction in sequence.
    ///
    /// Transactions must arrive in txid order without gaps. Edits that
    /// contradict the snapshot are reported as [`MetaError::InconsistentEdit`].
    pub fn apply(&mut self, tx: &Transaction) -> Result<NamespaceChange, MetaError> {
        let expected = self.last_applied.next();
        if tx.txid != expected {
            return Err(MetaError::OutOfOrderSegment {
                expected,
                found: tx.txid,
            });
        }

        let change = match tx.op {
            EditOp::AddBlock {
                block,
                gen_stamp,
                expected_replicas,
            } => {
                if self.blocks.contains_key(&block) {
                    return Err(MetaError::InconsistentEdit {
                        txid: tx.txid,
                        reason: format!("{} already exists", block),
                    });
                }
                self.blocks.insert(
                    block,
                    BlockInfo {
                        gen_stamp,
                        expected_replicas,
                    },
                );
                self.gen_stamp = self.gen_stamp.max(gen_stamp);
                NamespaceChange::BlockAdded { block, gen_stamp }
            }
            EditOp::UpdateBlock { block, gen_stamp } => {
                let info = self
                    .blocks
                    .get_mut(&block)
                    .ok_or_else(|| MetaError::InconsistentEdit {
                        txid: tx.txid,
                        reason: format!("update of unknown {}", block),
                    })?;
                if gen_stamp < info.gen_stamp {
                    return Err(MetaError::InconsistentEdit {
                        txid: tx.txid,
                        reason: format!(
                            "{} stamp moves backwards from {} to {}",
                            block, info.gen_stamp, gen_stamp
                        ),
                    });
                }
                let previous = info.gen_stamp;
                info.gen_stamp = gen_stamp;
                self.gen_stamp = self.gen_stamp.max(gen_stamp);
                NamespaceChange::BlockUpdated {
                    block,
                    previous,
                    current: gen_stamp,
                }
            }
            EditOp::DeleteBlock { block } => {
                if self.blocks.remove(&block).is_none() {
                    return Err(MetaError::InconsistentEdit {
                        txid: tx.txid,
                        reason: format!("delete of unknown {}", block),
                    });
                }
                NamespaceChange::BlockRemoved { block }
            }
            EditOp::SetGenStamp { gen_stamp } => {
                self.gen_stamp = self.gen_stamp.max(gen_stamp);
                NamespaceChange::GenStampAdvanced(self.gen_stamp)
            }
        };

        self.last_applied = tx.txid;
        Ok(change)
    }

    /// Serializes the snapshot into a checksummed image.
    pub fn encode_image(&self) -> Result<Vec<u8>, MetaError> {
        let payload =
            bincode::serialize(self).map_err(|e| MetaError::InvalidImage(e.to_string()))?;
        let image = ImageFile {
            version: IMAGE_VERSION,
            checksum: *blake3::hash(&payload).as_bytes(),
            payload,
        };
        bincode::serialize(&image).map_err(|e| MetaError::InvalidImage(e.to_string()))
    }

    /// Decodes and verifies an image produced by [`encode_image`](Self::encode_image).
    pub fn decode_image(bytes: &[u8]) -> Result<Self, MetaError> {
        let image: ImageFile =
            bincode::deserialize(bytes).map_err(|e| MetaError::InvalidImage(e.to_string()))?;
        if image.version != IMAGE_VERSION {
            return Err(MetaError::InvalidImage(format!(
                "unsupported image version {}",
                image.version
            )));
        }
        if *blake3::hash(&image.payload).as_bytes() != image.checksum {
            return Err(MetaError::InvalidImage("checksum mismatch".to_string()));
        }
        bincode::deserialize(&image.payload).map_err(|e| MetaError::InvalidImage(e.to_string()))
    }
}
