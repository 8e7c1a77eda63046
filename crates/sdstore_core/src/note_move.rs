//! Cross-SD note moves (§4.10).
//!
//! Moving a note between storage directories touches several independent
//! pieces of state (CRDT log/snapshot files, referenced images, the
//! metadata cache, deletion/activity tombstones) that can't be updated in
//! one atomic filesystem operation. `NoteMoveManager` persists its progress
//! as JSON under the source SD's `.moves/` directory so a crash mid-move
//! resumes exactly where it left off instead of leaving the note in limbo.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SdError};
use crate::fs::FileSystemAdapter;
use crate::ids::{NoteId, SdId};

/// What to do when the destination SD already has a note occupying the
/// target path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictPolicy {
    /// Overwrite whatever is at the destination.
    Replace,
    /// Write the incoming note under a fresh id, leaving the existing one.
    KeepBoth,
    /// Abort the move rather than touch an existing destination note.
    Error,
}

/// The move's state machine, persisted after every step so a crash resumes
/// rather than restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveState {
    Initiated,
    ImagesCopied,
    FilesCopied,
    DbUpdated,
    SourceTombstoned,
    Cleaning,
    Completed,
    FailedRollback,
}

/// Persisted progress record for one in-flight (or completed) move.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveRecord {
    pub note_id: NoteId,
    pub source_sd: SdId,
    pub dest_sd: SdId,
    pub conflict_policy: ConflictPolicy,
    pub state: MoveState,
    /// Images copied so far, tracked for rollback.
    #[serde(default)]
    pub copied_image_ids: Vec<String>,
    /// Destination note id actually used (differs from `note_id` only under
    /// [`ConflictPolicy::KeepBoth`]).
    pub dest_note_id: NoteId,
    pub started_at_ms: i64,
}

/// Drives one SD-to-SD note move through its state machine, persisting
/// progress under the source SD's `.moves/` directory.
pub struct NoteMoveManager {
    fs: Arc<dyn FileSystemAdapter>,
}

impl NoteMoveManager {
    /// Build a move manager over a shared filesystem adapter.
    pub fn new(fs: Arc<dyn FileSystemAdapter>) -> Self {
        Self { fs }
    }

    fn move_path(source_sd_path: &std::path::Path, note_id: &NoteId) -> PathBuf {
        source_sd_path.join(".moves").join(format!("{note_id}.json"))
    }

    /// Begin a move, persisting the initial `initiated` record. Returns the
    /// record so callers can drive the remaining steps.
    pub async fn initiate(
        &self,
        source_sd_path: &std::path::Path,
        source_sd: SdId,
        dest_sd: SdId,
        note_id: NoteId,
        conflict_policy: ConflictPolicy,
        started_at_ms: i64,
    ) -> Result<MoveRecord> {
        let record = MoveRecord {
            dest_note_id: note_id.clone(),
            note_id,
            source_sd,
            dest_sd,
            conflict_policy,
            state: MoveState::Initiated,
            copied_image_ids: Vec::new(),
            started_at_ms,
        };
        self.persist(source_sd_path, &record).await?;
        Ok(record)
    }

    async fn persist(&self, source_sd_path: &std::path::Path, record: &MoveRecord) -> Result<()> {
        let path = Self::move_path(source_sd_path, &record.note_id);
        let bytes = serde_json::to_vec_pretty(record)?;
        self.fs.write_file(&path, &bytes).await
    }

    /// Load a previously persisted move record, used on startup to resume
    /// any move left in a non-terminal state by a crash.
    pub async fn load(&self, source_sd_path: &std::path::Path, note_id: &NoteId) -> Result<Option<MoveRecord>> {
        let path = Self::move_path(source_sd_path, note_id);
        if !self.fs.exists(&path).await {
            return Ok(None);
        }
        let bytes = self.fs.read_file(&path).await?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// List every move record left behind under `source_sd_path`, including
    /// completed ones not yet cleaned up. Used for startup crash recovery.
    pub async fn list_in_progress(&self, source_sd_path: &std::path::Path) -> Result<Vec<MoveRecord>> {
        let dir = source_sd_path.join(".moves");
        let names = self.fs.list_dir(&dir).await?;
        let mut out = Vec::new();
        for name in names {
            if !name.ends_with(".json") {
                continue;
            }
            let bytes = self.fs.read_file(&dir.join(&name)).await?;
            if let Ok(record) = serde_json::from_slice::<MoveRecord>(&bytes) {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Copy every image referenced by the note's current CRDT state into
    /// the destination SD's `media/` directory, skipping any whose content
    /// hash already exists there (content-addressed dedup makes this safe
    /// to re-run after a crash).
    pub async fn copy_images(
        &self,
        source_sd_path: &std::path::Path,
        dest_sd_path: &std::path::Path,
        mut record: MoveRecord,
        image_ids: &[String],
    ) -> Result<MoveRecord> {
        debug_assert_eq!(record.state, MoveState::Initiated);
        for image_id in image_ids {
            if record.copied_image_ids.contains(image_id) {
                continue;
            }
            if let Some(bytes) = self.find_image(source_sd_path, image_id).await? {
                let dest_path = dest_sd_path.join("media").join(format!("{image_id}.bin"));
                if !self.fs.exists(&dest_path).await {
                    self.fs.write_file(&dest_path, &bytes).await?;
                }
                record.copied_image_ids.push(image_id.clone());
            }
        }
        record.state = MoveState::ImagesCopied;
        self.persist(source_sd_path, &record).await?;
        Ok(record)
    }

    async fn find_image(&self, sd_path: &std::path::Path, image_id: &str) -> Result<Option<Vec<u8>>> {
        let dir = sd_path.join("media");
        let names = self.fs.list_dir(&dir).await?;
        for name in names {
            if name.starts_with(image_id) {
                return Ok(Some(self.fs.read_file(&dir.join(&name)).await?));
            }
        }
        Ok(None)
    }

    /// Copy the note's CRDT directory (`logs/`, `snapshots/`) into the
    /// destination SD, applying the flag-byte protocol on every file via
    /// `write_file` (never a raw byte copy, so a crash mid-copy still
    /// leaves only complete or absent files on the destination).
    pub async fn copy_note_files(
        &self,
        source_sd_path: &std::path::Path,
        dest_sd_path: &std::path::Path,
        mut record: MoveRecord,
    ) -> Result<MoveRecord> {
        debug_assert_eq!(record.state, MoveState::ImagesCopied);

        let dest_dir = dest_sd_path.join("notes").join(record.dest_note_id.as_str());
        if self.fs.exists(&dest_dir).await {
            match record.conflict_policy {
                ConflictPolicy::Error => {
                    return Err(SdError::Conflict(format!(
                        "note '{}' already exists at destination",
                        record.dest_note_id
                    )));
                }
                ConflictPolicy::Replace => {}
                ConflictPolicy::KeepBoth => {
                    record.dest_note_id = NoteId::generate();
                }
            }
        }

        let source_dir = source_sd_path.join("notes").join(record.note_id.as_str());
        for sub in ["logs", "snapshots"] {
            let source_sub = source_dir.join(sub);
            let names = self.fs.list_dir(&source_sub).await?;
            for name in names {
                let bytes = self.fs.read_file(&source_sub.join(&name)).await?;
                let dest_path = dest_sd_path.join("notes").join(record.dest_note_id.as_str()).join(sub).join(&name);
                self.fs.write_file(&dest_path, &bytes).await?;
            }
        }

        record.state = MoveState::FilesCopied;
        self.persist(source_sd_path, &record).await?;
        Ok(record)
    }

    /// Advance the state machine once the caller has updated the metadata
    /// cache to reflect the note's new SD.
    pub async fn mark_db_updated(&self, source_sd_path: &std::path::Path, mut record: MoveRecord) -> Result<MoveRecord> {
        debug_assert_eq!(record.state, MoveState::FilesCopied);
        record.state = MoveState::DbUpdated;
        self.persist(source_sd_path, &record).await?;
        Ok(record)
    }

    /// Advance the state machine once the caller has written the source
    /// SD's deletion/activity tombstones for the moved note.
    pub async fn mark_source_tombstoned(&self, source_sd_path: &std::path::Path, mut record: MoveRecord) -> Result<MoveRecord> {
        debug_assert_eq!(record.state, MoveState::DbUpdated);
        record.state = MoveState::SourceTombstoned;
        self.persist(source_sd_path, &record).await?;
        Ok(record)
    }

    /// Delete the source SD's physical note directory (logs, snapshots) and
    /// advance to `cleaning`.
    pub async fn clean_source_files(&self, source_sd_path: &std::path::Path, mut record: MoveRecord) -> Result<MoveRecord> {
        debug_assert_eq!(record.state, MoveState::SourceTombstoned);
        let source_dir = source_sd_path.join("notes").join(record.note_id.as_str());
        for sub in ["logs", "snapshots"] {
            let dir = source_dir.join(sub);
            let names = self.fs.list_dir(&dir).await?;
            for name in names {
                self.fs.delete_file(&dir.join(&name)).await?;
            }
        }
        record.state = MoveState::Cleaning;
        self.persist(source_sd_path, &record).await?;
        Ok(record)
    }

    /// Mark the move fully complete and remove its persisted state file.
    pub async fn complete(&self, source_sd_path: &std::path::Path, mut record: MoveRecord) -> Result<MoveRecord> {
        debug_assert_eq!(record.state, MoveState::Cleaning);
        record.state = MoveState::Completed;
        self.fs.delete_file(&Self::move_path(source_sd_path, &record.note_id)).await?;
        Ok(record)
    }

    /// Undo a move that failed before `db_updated`: delete whatever was
    /// copied to the destination and mark the record `failed_rollback`.
    /// Moves past `db_updated` are not rolled back automatically — the
    /// metadata cache already points elsewhere and an automatic reversal
    /// risks losing concurrent edits; the caller surfaces this for manual
    /// resolution instead.
    pub async fn rollback(
        &self,
        source_sd_path: &std::path::Path,
        dest_sd_path: &std::path::Path,
        mut record: MoveRecord,
    ) -> Result<MoveRecord> {
        if matches!(record.state, MoveState::DbUpdated | MoveState::SourceTombstoned | MoveState::Cleaning) {
            return Err(SdError::Internal(format!(
                "cannot auto-rollback a move past db_updated (note {})",
                record.note_id
            )));
        }

        if matches!(record.state, MoveState::ImagesCopied | MoveState::FilesCopied) {
            let dest_dir = dest_sd_path.join("notes").join(record.dest_note_id.as_str());
            for sub in ["logs", "snapshots"] {
                let dir = dest_dir.join(sub);
                let names = self.fs.list_dir(&dir).await?;
                for name in names {
                    self.fs.delete_file(&dir.join(&name)).await?;
                }
            }
            for image_id in &record.copied_image_ids {
                let dir = dest_sd_path.join("media");
                let names = self.fs.list_dir(&dir).await?;
                for name in names {
                    if name.starts_with(image_id) {
                        self.fs.delete_file(&dir.join(&name)).await?;
                    }
                }
            }
        }

        record.state = MoveState::FailedRollback;
        self.persist(source_sd_path, &record).await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFsAdapter;

    #[tokio::test]
    async fn move_progresses_through_every_state_and_cleans_up() {
        let fs = Arc::new(MemoryFsAdapter::new());
        let manager = NoteMoveManager::new(fs.clone());
        let source = PathBuf::from("/source");
        let dest = PathBuf::from("/dest");
        let note = NoteId::from_raw("n1");

        fs.write_file(&source.join("notes").join("n1").join("logs").join("a_1.crdtlog"), b"NCLGx").await.unwrap();

        let record = manager
            .initiate(&source, SdId::from_raw("s"), SdId::from_raw("d"), note.clone(), ConflictPolicy::Replace, 1000)
            .await
            .unwrap();
        assert_eq!(record.state, MoveState::Initiated);

        let record = manager.copy_images(&source, &dest, record, &[]).await.unwrap();
        assert_eq!(record.state, MoveState::ImagesCopied);

        let record = manager.copy_note_files(&source, &dest, record).await.unwrap();
        assert_eq!(record.state, MoveState::FilesCopied);
        assert!(fs.exists(&dest.join("notes").join("n1").join("logs").join("a_1.crdtlog")).await);

        let record = manager.mark_db_updated(&source, record).await.unwrap();
        let record = manager.mark_source_tombstoned(&source, record).await.unwrap();
        let record = manager.clean_source_files(&source, record).await.unwrap();
        assert!(!fs.exists(&source.join("notes").join("n1").join("logs").join("a_1.crdtlog")).await);

        let record = manager.complete(&source, record).await.unwrap();
        assert_eq!(record.state, MoveState::Completed);
        assert!(manager.load(&source, &note).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rollback_before_db_update_removes_destination_copies() {
        let fs = Arc::new(MemoryFsAdapter::new());
        let manager = NoteMoveManager::new(fs.clone());
        let source = PathBuf::from("/source");
        let dest = PathBuf::from("/dest");
        let note = NoteId::from_raw("n1");

        fs.write_file(&source.join("notes").join("n1").join("logs").join("a_1.crdtlog"), b"NCLGx").await.unwrap();

        let record = manager
            .initiate(&source, SdId::from_raw("s"), SdId::from_raw("d"), note, ConflictPolicy::Replace, 1000)
            .await
            .unwrap();
        let record = manager.copy_images(&source, &dest, record, &[]).await.unwrap();
        let record = manager.copy_note_files(&source, &dest, record).await.unwrap();

        let record = manager.rollback(&source, &dest, record).await.unwrap();
        assert_eq!(record.state, MoveState::FailedRollback);
        assert!(!fs.exists(&dest.join("notes").join("n1").join("logs").join("a_1.crdtlog")).await);
    }

    #[tokio::test]
    async fn keep_both_conflict_policy_assigns_a_fresh_dest_id() {
        let fs = Arc::new(MemoryFsAdapter::new());
        let manager = NoteMoveManager::new(fs.clone());
        let source = PathBuf::from("/source");
        let dest = PathBuf::from("/dest");
        let note = NoteId::from_raw("n1");

        fs.write_file(&dest.join("notes").join("n1").join("logs").join("x.crdtlog"), b"existing").await.unwrap();
        fs.write_file(&source.join("notes").join("n1").join("logs").join("a_1.crdtlog"), b"NCLGx").await.unwrap();

        let record = manager
            .initiate(&source, SdId::from_raw("s"), SdId::from_raw("d"), note.clone(), ConflictPolicy::KeepBoth, 1000)
            .await
            .unwrap();
        let record = manager.copy_images(&source, &dest, record, &[]).await.unwrap();
        let record = manager.copy_note_files(&source, &dest, record).await.unwrap();
        assert_ne!(record.dest_note_id, note);
    }
}
