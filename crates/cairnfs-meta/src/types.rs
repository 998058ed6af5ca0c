use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Represents a unique identifier for a data block in the namespace
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(u64);

impl BlockId {
    /// Creates a new BlockId from a raw u64 value
    pub fn new(id: u64) -> Self {
        BlockId(id)
    }

    /// Returns the raw u64 value of this block ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blk_{}", self.0)
    }
}

/// Monotonically increasing version tag on a block.
///
/// A replica is only current when its stamp equals the stamp the namespace
/// currently records for the block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct GenStamp(u64);

impl GenStamp {
    /// The stamp of an empty namespace
    pub const ZERO: GenStamp = GenStamp(0);

    /// Creates a new GenStamp from a raw u64 value
    pub fn new(gs: u64) -> Self {
        GenStamp(gs)
    }

    /// Returns the raw u64 value of this generation stamp
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for GenStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction id of a committed namespace edit
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct TxId(u64);

impl TxId {
    /// Position before the first transaction
    pub const ZERO: TxId = TxId(0);

    /// Creates a new TxId from a raw u64 value
    pub fn new(id: u64) -> Self {
        TxId(id)
    }

    /// Returns the raw u64 value of this transaction id
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the transaction id immediately after this one
    pub fn next(self) -> Self {
        TxId(self.0 + 1)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Represents a unique identifier for a metadata server node in the cluster
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    /// Creates a new NodeId from a raw u64 value
    pub fn new(id: u64) -> Self {
        NodeId(id)
    }

    /// Returns the raw u64 value of this node ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a storage node that holds block replicas
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageNodeId(Uuid);

impl StorageNodeId {
    /// Generates a fresh random storage node id
    pub fn random() -> Self {
        StorageNodeId(Uuid::new_v4())
    }

    /// Wraps an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        StorageNodeId(id)
    }

    /// Returns the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for StorageNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mutually exclusive replica roles of a metadata node
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HaRole {
    /// Accepts mutations and produces the edit log
    Active,
    /// Replays the edit log written by the active node
    Standby,
}

impl fmt::Display for HaRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaRole::Active => write!(f, "active"),
            HaRole::Standby => write!(f, "standby"),
        }
    }
}

/// Category of a client operation, used by the operation gate
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperationCategory {
    /// Read-only namespace access
    Read,
    /// Namespace mutation
    Write,
}

/// A replica as declared by a storage node in a block report
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedBlock {
    /// Block the replica belongs to
    pub block_id: BlockId,
    /// Generation stamp of the replica on the storage node
    pub gen_stamp: GenStamp,
}

impl ReportedBlock {
    /// Creates a reported replica
    pub fn new(block_id: BlockId, gen_stamp: GenStamp) -> Self {
        Self {
            block_id,
            gen_stamp,
        }
    }
}

/// Error types for the metadata service
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// A mutating operation was attempted while safe mode is on.
    #[error("cannot perform operation: {tip}")]
    SafeModeOn {
        /// Current safe mode status message
        tip: String,
    },

    /// A mutating operation was sent to a standby node.
    #[error("operation category {0:?} is not supported in state standby")]
    StandbyState(OperationCategory),

    /// An edit log segment failed its integrity check.
    #[error("corrupt edit log segment starting at txid {first_txid}: {reason}")]
    CorruptSegment {
        /// First transaction id of the segment
        first_txid: TxId,
        /// What was wrong with it
        reason: String,
    },

    /// The next segment does not continue where replay stopped.
    #[error("out of order edit log segment: expected txid {expected}, found {found}")]
    OutOfOrderSegment {
        /// Transaction id replay expected next
        expected: TxId,
        /// Transaction id the segment starts with
        found: TxId,
    },

    /// A transaction cannot be applied to the current namespace.
    #[error("inconsistent edit at txid {txid}: {reason}")]
    InconsistentEdit {
        /// Offending transaction
        txid: TxId,
        /// Why it cannot be applied
        reason: String,
    },

    /// Replay stopped on an earlier fault and will not resume.
    #[error("edit log replay halted: {0}")]
    ReplayHalted(String),

    /// Reading from the shared edit log storage failed.
    #[error("edit log source error: {0}")]
    SourceError(String),

    /// A namespace image could not be decoded or verified.
    #[error("invalid namespace image: {0}")]
    InvalidImage(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A background task panicked or was cancelled.
    #[error("background task failed: {0}")]
    TaskFailed(String),

    /// A lock guarding shared state was poisoned.
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),

    /// A lower-level I/O error occurred.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl MetaError {
    /// Returns true for replay faults that must halt the edit log tailer.
    ///
    /// Source errors are transient and retried on the next poll.
    pub fn is_fatal_replay(&self) -> bool {
        matches!(
            self,
            MetaError::CorruptSegment { .. }
                | MetaError::OutOfOrderSegment { .. }
                | MetaError::InconsistentEdit { .. }
                | MetaError::ReplayHalted(_)
        )
    }
}
