#![warn(missing_docs)]

//! CairnFS metadata node: HA block accounting and safe mode.
//!
//! A standby replays the shared edit log written by the active node while
//! storage nodes report the replicas they hold. Safe mode stays on until
//! enough blocks have a verified replica; replicas stamped with a generation
//! the standby has not replayed yet are queued until the edit log catches up.
//!
//! Replay path:   SegmentSource → EditLogTailer → Namesystem::apply_segment → SafeModeTracker
//! Report path:   storage node → Namesystem::{process_full_report, block_received} → ReplicaMap

pub mod block_report;
pub mod blockmap;
pub mod clock;
pub mod config;
pub mod editlog;
pub mod extension;
pub mod ha;
pub mod namespace;
pub mod namesystem;
pub mod safemode;
pub mod tailer;
pub mod termination;
pub mod types;

pub use block_report::{FullReportSummary, IngestOutcome};
pub use blockmap::{classify, PendingReports, ReplicaMap, ReplicaVerdict};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{NamenodeConfig, ReplayConfig, SafeModeConfig};
pub use editlog::{DirSegmentSource, EditLogSegment, EditOp, SegmentSource, SharedEditLog, Transaction};
pub use extension::ExtensionTimer;
pub use ha::HaController;
pub use namespace::{BlockInfo, NamespaceChange, NamespaceSnapshot};
pub use namesystem::{Namesystem, SegmentOutcome};
pub use safemode::{SafeModeReport, SafeModeState, SafeModeTracker, SafeModeTransition};
pub use tailer::{CatchUpSummary, EditLogTailer, TailerHandle, TailerStats};
pub use termination::{ProcessExit, RecordingTerminationSink, TerminationRecord, TerminationSink};
pub use types::{
    BlockId, GenStamp, HaRole, MetaError, NodeId, OperationCategory, ReportedBlock, StorageNodeId, TxId,
};
