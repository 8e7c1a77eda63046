//! `.crdtsnapshot` framing: a zstd-compressed CRDT state vector, no header.

use crate::error::{Result, SdError};

/// Compression level used for every snapshot written by this crate.
const ZSTD_LEVEL: i32 = 3;

/// Codec for `.crdtsnapshot` files.
///
/// Unlike log files, snapshots carry no magic or version byte: the whole
/// file is a zstd frame (or, for snapshots written before compression was
/// added, raw bytes — see [`SnapshotCodec::decompress_with_fallback`]).
pub struct SnapshotCodec;

impl SnapshotCodec {
    /// Compress a CRDT state vector for storage.
    pub fn compress(state: &[u8]) -> Result<Vec<u8>> {
        zstd::stream::encode_all(state, ZSTD_LEVEL).map_err(SdError::Io)
    }

    /// Decompress a snapshot file's bytes.
    pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
        zstd::stream::decode_all(bytes).map_err(SdError::Io)
    }

    /// Decompress, falling back to the input unchanged if it isn't a valid
    /// zstd frame. Legacy snapshots written before compression was
    /// introduced are stored raw.
    pub fn decompress_with_fallback(bytes: &[u8]) -> Vec<u8> {
        match Self::decompress(bytes) {
            Ok(state) => state,
            Err(_) => bytes.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_bytes() {
        let state = b"a fairly representative crdt state vector payload".repeat(4);
        let compressed = SnapshotCodec::compress(&state).unwrap();
        assert_ne!(compressed, state);
        let decompressed = SnapshotCodec::decompress(&compressed).unwrap();
        assert_eq!(decompressed, state);
    }

    #[test]
    fn fallback_returns_raw_bytes_for_non_zstd_input() {
        let legacy = b"not a zstd frame".to_vec();
        assert_eq!(SnapshotCodec::decompress_with_fallback(&legacy), legacy);
    }

    #[test]
    fn fallback_still_decompresses_real_frames() {
        let state = b"hello snapshot".to_vec();
        let compressed = SnapshotCodec::compress(&state).unwrap();
        assert_eq!(SnapshotCodec::decompress_with_fallback(&compressed), state);
    }
}
