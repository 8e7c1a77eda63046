//! Binary formats for CRDT logs and snapshots.

pub mod log_codec;
pub mod snapshot_codec;

pub use log_codec::{LogRecord, ReadAllResult, ValidateSequencesReport};
pub use snapshot_codec::SnapshotCodec;
