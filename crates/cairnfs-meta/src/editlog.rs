//! Edit log segments written by the active node to shared storage.
//!
//! The active node appends transactions to an open (in-progress) segment and
//! periodically rolls it into a finalized segment. Standbys normally read only
//! finalized segments; the final catch-up during promotion also reads the
//! in-progress tail.
//!
//! Every segment carries a BLAKE3 checksum over its bincode-encoded
//! transactions so a standby can tell a damaged segment from a valid one.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::types::{BlockId, GenStamp, MetaError, TxId};

/// A namespace mutation affecting block existence or versions.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditOp {
    /// Allocate a new block.
    AddBlock {
        /// New block id
        block: BlockId,
        /// Its initial generation stamp
        gen_stamp: GenStamp,
        /// Requested replication factor
        expected_replicas: u16,
    },
    /// Bump a block to a newer generation stamp (append, recovery).
    UpdateBlock {
        /// Block being updated
        block: BlockId,
        /// New generation stamp
        gen_stamp: GenStamp,
    },
    /// Delete a block.
    DeleteBlock {
        /// Block being deleted
        block: BlockId,
    },
    /// Advance the namespace-wide generation stamp.
    SetGenStamp {
        /// New stamp
        gen_stamp: GenStamp,
    },
}

/// One committed transaction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Position in the log
    pub txid: TxId,
    /// The mutation
    pub op: EditOp,
}

impl Transaction {
    /// Creates a transaction.
    pub fn new(txid: TxId, op: EditOp) -> Self {
        Self { txid, op }
    }
}

/// A contiguous batch of committed transactions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditLogSegment {
    /// First transaction id in the segment
    pub first_txid: TxId,
    /// Last transaction id in the segment
    pub last_txid: TxId,
    /// True while the active node may still append to it
    pub in_progress: bool,
    /// Transactions in txid order
    pub transactions: Vec<Transaction>,
    /// BLAKE3 over the bincode encoding of `transactions`
    pub checksum: [u8; 32],
}

impl EditLogSegment {
    /// Builds a checksummed segment from a non-empty, contiguous batch.
    pub fn new(transactions: Vec<Transaction>, in_progress: bool) -> Result<Self, MetaError> {
        let (first_txid, last_txid) = match (transactions.first(), transactions.last()) {
            (Some(first), Some(last)) => (first.txid, last.txid),
            _ => {
                return Err(MetaError::CorruptSegment {
                    first_txid: TxId::ZERO,
                    reason: "empty segment".to_string(),
                })
            }
        };
        let checksum = checksum_of(&transactions, first_txid)?;
        let segment = Self {
            first_txid,
            last_txid,
            in_progress,
            transactions,
            checksum,
        };
        segment.verify()?;
        Ok(segment)
    }

    /// Checks checksum, bounds and txid contiguity.
    pub fn verify(&self) -> Result<(), MetaError> {
        let corrupt = |reason: String| MetaError::CorruptSegment {
            first_txid: self.first_txid,
            reason,
        };

        if self.transactions.is_empty() {
            return Err(corrupt("empty segment".to_string()));
        }
        if checksum_of(&self.transactions, self.first_txid)? != self.checksum {
            return Err(corrupt("checksum mismatch".to_string()));
        }
        let mut expected = self.first_txid;
        for tx in &self.transactions {
            if tx.txid != expected {
                return Err(corrupt(format!(
                    "txid {} found where {} expected",
                    tx.txid, expected
                )));
            }
            expected = expected.next();
        }
        if self.transactions.last().map(|t| t.txid) != Some(self.last_txid) {
            return Err(corrupt(format!(
                "segment claims to end at {} but does not",
                self.last_txid
            )));
        }
        Ok(())
    }

    /// Number of transactions.
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    /// True if the segment has no transactions.
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

fn checksum_of(transactions: &[Transaction], first_txid: TxId) -> Result<[u8; 32], MetaError> {
    let encoded = bincode::serialize(transactions).map_err(|e| MetaError::CorruptSegment {
        first_txid,
        reason: e.to_string(),
    })?;
    Ok(*blake3::hash(&encoded).as_bytes())
}

/// Durable, append-only source of edit log segments.
pub trait SegmentSource: Send + Sync {
    /// Returns, in txid order, every segment that contains transactions at or
    /// after `from`. In-progress segments are included only when asked.
    fn segments_from(
        &self,
        from: TxId,
        include_in_progress: bool,
    ) -> Result<Vec<EditLogSegment>, MetaError>;
}

struct LogInner {
    finalized: Vec<EditLogSegment>,
    open: Vec<Transaction>,
    next_txid: TxId,
}

/// In-memory shared edit log, written by the active node and read by standbys.
pub struct SharedEditLog {
    inner: Arc<RwLock<LogInner>>,
}

impl SharedEditLog {
    /// Creates an empty log whose first transaction will be txid 1.
    pub fn new() -> Self {
        Self::starting_after(TxId::ZERO)
    }

    /// Creates an empty log continuing after `last_txid` (e.g. after an image).
    pub fn starting_after(last_txid: TxId) -> Self {
        Self {
            inner: Arc::new(RwLock::new(LogInner {
                finalized: Vec::new(),
                open: Vec::new(),
                next_txid: last_txid.next(),
            })),
        }
    }

    /// Appends a transaction to the open segment. Returns its txid.
    pub fn log(&self, op: EditOp) -> Result<TxId, MetaError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| MetaError::LockPoisoned(e.to_string()))?;
        let txid = inner.next_txid;
        inner.next_txid = txid.next();
        inner.open.push(Transaction::new(txid, op));
        Ok(txid)
    }

    /// Finalizes the open segment. Returns its last txid, or None if it was empty.
    pub fn roll(&self) -> Result<Option<TxId>, MetaError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| MetaError::LockPoisoned(e.to_string()))?;
        if inner.open.is_empty() {
            return Ok(None);
        }
        let transactions = std::mem::take(&mut inner.open);
        let segment = EditLogSegment::new(transactions, false)?;
        let last = segment.last_txid;
        tracing::debug!(
            first_txid = %segment.first_txid,
            last_txid = %last,
            "rolled edit log segment"
        );
        inner.finalized.push(segment);
        Ok(Some(last))
    }

    /// Appends an already built segment as finalized, bypassing checks.
    /// Used to simulate damaged shared storage.
    pub fn push_raw_segment(&self, segment: EditLogSegment) -> Result<(), MetaError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| MetaError::LockPoisoned(e.to_string()))?;
        if segment.last_txid >= inner.next_txid {
            inner.next_txid = segment.last_txid.next();
        }
        inner.finalized.push(segment);
        Ok(())
    }

    /// Last txid handed out.
    pub fn last_written_txid(&self) -> Result<TxId, MetaError> {
        let inner = self
            .inner
            .read()
            .map_err(|e| MetaError::LockPoisoned(e.to_string()))?;
        Ok(TxId::new(inner.next_txid.as_u64().saturating_sub(1)))
    }

    /// Number of finalized segments.
    pub fn finalized_count(&self) -> Result<usize, MetaError> {
        let inner = self
            .inner
            .read()
            .map_err(|e| MetaError::LockPoisoned(e.to_string()))?;
        Ok(inner.finalized.len())
    }
}

impl Default for SharedEditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentSource for SharedEditLog {
    fn segments_from(
        &self,
        from: TxId,
        include_in_progress: bool,
    ) -> Result<Vec<EditLogSegment>, MetaError> {
        let inner = self
            .inner
            .read()
            .map_err(|e| MetaError::LockPoisoned(e.to_string()))?;
        let mut segments: Vec<EditLogSegment> = inner
            .finalized
            .iter()
            .filter(|s| s.last_txid >= from)
            .cloned()
            .collect();
        if include_in_progress && !inner.open.is_empty() {
            let open = EditLogSegment::new(inner.open.clone(), true)?;
            if open.last_txid >= from {
                segments.push(open);
            }
        }
        Ok(segments)
    }
}

/// Segment source backed by JSON files in a shared directory.
///
/// Finalized segments are named `edits_<first>-<last>.json`, the open one
/// `edits_inprogress_<first>.json`, with zero-padded txids.
pub struct DirSegmentSource {
    dir: PathBuf,
}

enum SegmentFile {
    Finalized { first: u64, last: u64 },
    InProgress { first: u64 },
}

impl DirSegmentSource {
    /// Reads segments from `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory being read.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes a segment file atomically (temp file + rename).
    pub fn write_segment(&self, segment: &EditLogSegment) -> Result<PathBuf, MetaError> {
        let name = if segment.in_progress {
            format!("edits_inprogress_{:020}.json", segment.first_txid.as_u64())
        } else {
            format!(
                "edits_{:020}-{:020}.json",
                segment.first_txid.as_u64(),
                segment.last_txid.as_u64()
            )
        };
        let path = self.dir.join(&name);
        let tmp = self.dir.join(format!(".{}.tmp", name));
        let json = serde_json::to_vec(segment).map_err(|e| MetaError::SourceError(e.to_string()))?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        if !segment.in_progress {
            let open = self.dir.join(format!(
                "edits_inprogress_{:020}.json",
                segment.first_txid.as_u64()
            ));
            if open.exists() {
                std::fs::remove_file(open)?;
            }
        }
        Ok(path)
    }

    fn parse_name(name: &str) -> Option<SegmentFile> {
        let stem = name.strip_prefix("edits_")?.strip_suffix(".json")?;
        if let Some(first) = stem.strip_prefix("inprogress_") {
            return Some(SegmentFile::InProgress {
                first: first.parse().ok()?,
            });
        }
        let (first, last) = stem.split_once('-')?;
        Some(SegmentFile::Finalized {
            first: first.parse().ok()?,
            last: last.parse().ok()?,
        })
    }

    fn read_file(&self, path: &Path, in_progress: bool) -> Result<EditLogSegment, MetaError> {
        let bytes = std::fs::read(path)
            .map_err(|e| MetaError::SourceError(format!("{}: {}", path.display(), e)))?;
        serde_json::from_slice(&bytes).map_err(|e| {
            let reason = format!("{}: {}", path.display(), e);
            if in_progress {
                // The writer may be mid-flush; try again next poll.
                MetaError::SourceError(reason)
            } else {
                MetaError::CorruptSegment {
                    first_txid: TxId::ZERO,
                    reason,
                }
            }
        })
    }
}

impl SegmentSource for DirSegmentSource {
    fn segments_from(
        &self,
        from: TxId,
        include_in_progress: bool,
    ) -> Result<Vec<EditLogSegment>, MetaError> {
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| MetaError::SourceError(format!("{}: {}", self.dir.display(), e)))?;

        let mut finalized = Vec::new();
        let mut open = None;
        for entry in entries {
            let entry = entry.map_err(|e| MetaError::SourceError(e.to_string()))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            match Self::parse_name(name) {
                Some(SegmentFile::Finalized { first, last }) if last >= from.as_u64() => {
                    finalized.push((first, entry.path()));
                }
                Some(SegmentFile::InProgress { first }) => {
                    // An older open file can outlive a writer crash; the newest is live.
                    if open.as_ref().map_or(true, |(current, _)| first > *current) {
                        open = Some((first, entry.path()));
                    }
                }
                _ => {}
            }
        }
        finalized.sort_by_key(|(first, _)| *first);

        let mut segments = Vec::with_capacity(finalized.len() + 1);
        for (_, path) in &finalized {
            segments.push(self.read_file(path, false)?);
        }
        if include_in_progress {
            if let Some((first, path)) = open {
                let already_final = finalized.iter().any(|(f, _)| *f == first);
                if !already_final {
                    let segment = self.read_file(&path, true)?;
                    if segment.last_txid >= from {
                        segments.push(segment);
                    }
                }
            }
        }
        Ok(segments)
    }
}
