//! Cross-instance deletion tombstones.
//!
//! Each instance appends JSON-per-line records to its own
//! `deletions/<instanceId>.log`; readers merge every peer's file and resolve
//! the current state of a note by taking the latest op by timestamp,
//! tiebreaking by instance id when timestamps collide.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::fs::FileSystemAdapter;
use crate::ids::{InstanceId, NoteId};

/// The deletion-state transition recorded for a note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletionOp {
    /// Soft delete.
    Delete,
    /// Undo a soft delete.
    Restore,
    /// Hard delete. Terminal: a `permanent` tombstone is final, and a later
    /// recreation of the same `noteId` is rejected rather than un-deleting it.
    Permanent,
}

/// One line of a deletion log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionRecord {
    /// Note the tombstone applies to.
    pub note_id: NoteId,
    /// The transition recorded.
    pub op: DeletionOp,
    /// Epoch milliseconds.
    pub ts: i64,
    /// Instance that wrote this record, used only to tiebreak equal `ts`.
    #[serde(default)]
    pub instance_id: Option<InstanceId>,
}

/// Resolved deletion state of a note after merging every peer's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteDeletionState {
    /// No tombstone recorded; the note is live.
    Live,
    /// Soft-deleted; may still be restored.
    Deleted,
    /// Hard-deleted; terminal.
    Permanent,
}

/// Writer/reader for one SD's `deletion/` directory.
pub struct DeletionLog {
    fs: Arc<dyn FileSystemAdapter>,
    sd_path: PathBuf,
    instance_id: InstanceId,
}

impl DeletionLog {
    /// Build a deletion log accessor rooted at `sd_path`, writing as
    /// `instance_id`.
    pub fn new(fs: Arc<dyn FileSystemAdapter>, sd_path: PathBuf, instance_id: InstanceId) -> Self {
        Self { fs, sd_path, instance_id }
    }

    fn path_for(&self, instance_id: &InstanceId) -> PathBuf {
        self.sd_path.join("deletions").join(format!("{instance_id}.log"))
    }

    /// Append a tombstone transition for `note_id`, attributed to this
    /// instance and the given timestamp.
    pub async fn append(&self, note_id: &NoteId, op: DeletionOp, ts: i64) -> Result<()> {
        let record = DeletionRecord {
            note_id: note_id.clone(),
            op,
            ts,
            instance_id: Some(self.instance_id.clone()),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        self.fs.append_file(&self.path_for(&self.instance_id), line.as_bytes()).await
    }

    /// Every record from every peer's deletion log, tolerating a partial
    /// final line the same way [`crate::activity_log::ActivityLog`] does.
    pub async fn read_all(&self) -> Result<Vec<DeletionRecord>> {
        let dir = self.sd_path.join("deletions");
        let names = self.fs.list_dir(&dir).await?;
        let mut out = Vec::new();
        for name in names {
            if !name.ends_with(".log") {
                continue;
            }
            let bytes = self.fs.read_file(&dir.join(&name)).await?;
            let text = String::from_utf8_lossy(&bytes);
            for line in text.split_inclusive('\n') {
                if !line.ends_with('\n') {
                    continue;
                }
                let trimmed = line.trim_end_matches('\n');
                if trimmed.is_empty() {
                    continue;
                }
                if let Ok(record) = serde_json::from_str::<DeletionRecord>(trimmed) {
                    out.push(record);
                }
            }
        }
        Ok(out)
    }

    /// Resolve every note's current deletion state by taking, per
    /// `noteId`, the latest record by `ts` (tiebreaking by `instanceId`).
    pub async fn resolve_states(&self) -> Result<std::collections::HashMap<NoteId, NoteDeletionState>> {
        let records = self.read_all().await?;
        let mut latest: std::collections::HashMap<NoteId, &DeletionRecord> = std::collections::HashMap::new();
        for record in &records {
            match latest.get(&record.note_id) {
                None => {
                    latest.insert(record.note_id.clone(), record);
                }
                Some(existing) => {
                    if is_newer(record, existing) {
                        latest.insert(record.note_id.clone(), record);
                    }
                }
            }
        }
        Ok(latest
            .into_iter()
            .map(|(note_id, record)| {
                let state = match record.op {
                    DeletionOp::Delete => NoteDeletionState::Deleted,
                    DeletionOp::Restore => NoteDeletionState::Live,
                    DeletionOp::Permanent => NoteDeletionState::Permanent,
                };
                (note_id, state)
            })
            .collect())
    }

    /// Resolved state for a single note; `Live` if no tombstone exists.
    pub async fn state_of(&self, note_id: &NoteId) -> Result<NoteDeletionState> {
        Ok(self.resolve_states().await?.remove(note_id).unwrap_or(NoteDeletionState::Live))
    }

    /// The SD root this log belongs to.
    pub fn sd_path(&self) -> &Path {
        &self.sd_path
    }
}

fn is_newer(candidate: &DeletionRecord, existing: &DeletionRecord) -> bool {
    match candidate.ts.cmp(&existing.ts) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => candidate.instance_id.as_ref().map(|i| i.as_str()) > existing.instance_id.as_ref().map(|i| i.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFsAdapter;

    #[tokio::test]
    async fn latest_op_wins_across_peers() {
        let fs = Arc::new(MemoryFsAdapter::new());
        let note = NoteId::generate();

        let a = DeletionLog::new(fs.clone(), PathBuf::from("/sd"), InstanceId::from_raw("a"));
        let b = DeletionLog::new(fs.clone(), PathBuf::from("/sd"), InstanceId::from_raw("b"));

        a.append(&note, DeletionOp::Delete, 100).await.unwrap();
        b.append(&note, DeletionOp::Restore, 200).await.unwrap();

        assert_eq!(a.state_of(&note).await.unwrap(), NoteDeletionState::Live);
    }

    #[tokio::test]
    async fn permanent_is_terminal() {
        let fs = Arc::new(MemoryFsAdapter::new());
        let note = NoteId::generate();
        let a = DeletionLog::new(fs.clone(), PathBuf::from("/sd"), InstanceId::from_raw("a"));

        a.append(&note, DeletionOp::Permanent, 100).await.unwrap();
        assert_eq!(a.state_of(&note).await.unwrap(), NoteDeletionState::Permanent);
    }

    #[tokio::test]
    async fn equal_timestamps_tiebreak_by_instance_id() {
        let fs = Arc::new(MemoryFsAdapter::new());
        let note = NoteId::generate();
        let a = DeletionLog::new(fs.clone(), PathBuf::from("/sd"), InstanceId::from_raw("aaa"));
        let b = DeletionLog::new(fs.clone(), PathBuf::from("/sd"), InstanceId::from_raw("zzz"));

        a.append(&note, DeletionOp::Delete, 100).await.unwrap();
        b.append(&note, DeletionOp::Restore, 100).await.unwrap();

        // "zzz" > "aaa" lexicographically, so Restore wins the tie.
        assert_eq!(a.state_of(&note).await.unwrap(), NoteDeletionState::Live);
    }
}
