//! Per-instance activity breadcrumbs used for cross-instance discovery.
//!
//! Every CRDT write appends one line to `activity/<instanceId>.log`. Readers
//! (principally [`crate::activity_sync::ActivitySync`]) tail these files to
//! learn which notes changed and to what sequence, without reading the
//! (potentially large) `.crdtlog` files themselves.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;
use crate::fs::FileSystemAdapter;
use crate::ids::{InstanceId, NoteId};

/// One decoded line from an activity file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityRecord {
    /// Note the write affected.
    pub note_id: NoteId,
    /// Instance that performed the write (parsed from the line, not the
    /// filename — both should agree but the line is authoritative).
    pub instance_id: InstanceId,
    /// Sequence number of the underlying `.crdtlog` record.
    pub sequence: u64,
}

/// Writer/reader for one SD's `activity/` directory.
pub struct ActivityLog {
    fs: Arc<dyn FileSystemAdapter>,
    sd_path: PathBuf,
}

impl ActivityLog {
    /// Build an activity log accessor rooted at `sd_path`.
    pub fn new(fs: Arc<dyn FileSystemAdapter>, sd_path: PathBuf) -> Self {
        Self { fs, sd_path }
    }

    /// Path to a given instance's activity file.
    pub fn path_for(&self, instance_id: &InstanceId) -> PathBuf {
        self.sd_path.join("activity").join(format!("{instance_id}.log"))
    }

    /// The instance id a filename under `activity/` encodes, or `None` if it
    /// isn't a `.log` file. The id is whatever remains after stripping the
    /// `.log` suffix — no length or separator assumptions beyond that, per
    /// §4.6's "filename parser accepts any non-empty id" requirement.
    pub fn instance_id_from_filename(filename: &str) -> Option<InstanceId> {
        filename.strip_suffix(".log").filter(|s| !s.is_empty()).map(InstanceId::from_raw)
    }

    /// Append one record for a write this instance just made.
    pub async fn append(&self, note_id: &NoteId, instance_id: &InstanceId, sequence: u64) -> Result<()> {
        let line = format!("{note_id}|{instance_id}_{sequence}\n");
        self.fs.append_file(&self.path_for(instance_id), line.as_bytes()).await
    }

    /// List the instance ids with an activity file in this SD.
    pub async fn list_instances(&self) -> Result<Vec<InstanceId>> {
        let dir = self.sd_path.join("activity");
        let names = self.fs.list_dir(&dir).await?;
        Ok(names.iter().filter_map(|n| Self::instance_id_from_filename(n)).collect())
    }

    /// Read whatever complete lines exist past `watermark` bytes in
    /// `instance_id`'s activity file.
    ///
    /// Returns the decoded records and the new watermark. A trailing
    /// incomplete line (no writer fsync between readers) is left unconsumed
    /// and will be re-read, complete, on a future call.
    pub async fn read_new(&self, instance_id: &InstanceId, watermark: u64) -> Result<(Vec<ActivityRecord>, u64)> {
        let path = self.path_for(instance_id);
        if !self.fs.exists(&path).await {
            return Ok((Vec::new(), watermark));
        }
        let bytes = self.fs.read_file(&path).await?;
        let start = (watermark as usize).min(bytes.len());
        let tail = &bytes[start..];
        let text = String::from_utf8_lossy(tail);

        let mut records = Vec::new();
        let mut consumed = 0usize;
        for line in text.split_inclusive('\n') {
            if !line.ends_with('\n') {
                break;
            }
            consumed += line.len();
            if let Some(record) = parse_line(line.trim_end_matches('\n')) {
                records.push(record);
            }
        }

        Ok((records, watermark + consumed as u64))
    }

    /// Borrow the filesystem adapter backing this log (used by
    /// [`crate::activity_sync::ActivitySync`] to access raw `.crdtlog`
    /// files directly).
    pub fn fs(&self) -> &Arc<dyn FileSystemAdapter> {
        &self.fs
    }

    /// The SD root this log belongs to.
    pub fn sd_path(&self) -> &Path {
        &self.sd_path
    }
}

fn parse_line(line: &str) -> Option<ActivityRecord> {
    let (note_id, rest) = line.split_once('|')?;
    if note_id.is_empty() {
        return None;
    }
    let (instance_id, seq) = rest.rsplit_once('_')?;
    if instance_id.is_empty() {
        return None;
    }
    let sequence: u64 = seq.parse().ok()?;
    Some(ActivityRecord {
        note_id: NoteId::from_raw(note_id),
        instance_id: InstanceId::from_raw(instance_id),
        sequence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFsAdapter;

    #[tokio::test]
    async fn append_and_read_round_trips() {
        let fs = Arc::new(MemoryFsAdapter::new());
        let log = ActivityLog::new(fs.clone(), PathBuf::from("/sd"));
        let me = InstanceId::from_raw("inst-a");
        let note = NoteId::from_raw("note-1");

        log.append(&note, &me, 1).await.unwrap();
        log.append(&note, &me, 2).await.unwrap();

        let (records, watermark) = log.read_new(&me, 0).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].sequence, 1);
        assert_eq!(records[1].sequence, 2);

        let (more, watermark2) = log.read_new(&me, watermark).await.unwrap();
        assert!(more.is_empty());
        assert_eq!(watermark, watermark2);
    }

    #[test]
    fn filename_parsing_has_no_length_assumption() {
        assert_eq!(
            ActivityLog::instance_id_from_filename("short.log"),
            Some(InstanceId::from_raw("short"))
        );
        assert_eq!(
            ActivityLog::instance_id_from_filename("peerId_peerId.log"),
            Some(InstanceId::from_raw("peerId_peerId"))
        );
        assert_eq!(ActivityLog::instance_id_from_filename("not-a-log-file"), None);
    }

    #[test]
    fn partial_trailing_line_is_not_parsed() {
        // Simulates the unflushed-writer case: no trailing newline yet.
        let text = "note-1|inst-a_1\nnote-1|inst-a_2";
        let mut records = Vec::new();
        let mut consumed = 0usize;
        for line in text.split_inclusive('\n') {
            if !line.ends_with('\n') {
                break;
            }
            consumed += line.len();
            if let Some(r) = parse_line(line.trim_end_matches('\n')) {
                records.push(r);
            }
        }
        assert_eq!(records.len(), 1);
        assert_eq!(consumed, "note-1|inst-a_1\n".len());
    }
}
