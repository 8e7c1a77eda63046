//! One CRDT document per SD holding the folder hierarchy and the
//! note→folder mapping.
//!
//! A note's folder is authoritative here, in `FolderTreeDoc`'s
//! `noteFolders` map — not in the `folderId` attribute
//! [`crate::crdt::NoteDoc`] also carries. Keeping both gives callers a
//! locally-cheap hint on the note itself while giving the system one place
//! to resolve disagreement after a concurrent move.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use yrs::{Map, ReadTxn, Transact};

use super::doc::{CrdtDoc, UpdateOrigin};
use super::note_doc::latest_snapshot_name;
use crate::activity_log::ActivityLog;
use crate::codec::{log_codec, snapshot_codec::SnapshotCodec};
use crate::error::{Result, SdError};
use crate::fs::FileSystemAdapter;
use crate::ids::{FolderId, InstanceId, NoteId};

const FOLDERS_MAP_NAME: &str = "folders";
const NOTE_FOLDERS_MAP_NAME: &str = "noteFolders";

/// One folder's state: `folderId → {name, parentId, order, deleted}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderRecord {
    /// Display name.
    pub name: String,
    /// Parent folder, or `None` for a root-level folder.
    pub parent_id: Option<FolderId>,
    /// Sibling ordering hint.
    pub order: i64,
    /// Tombstone: deleted folders are hidden from enumeration but kept in
    /// the CRDT, per §3's FolderTreeDoc invariant.
    pub deleted: bool,
}

/// Strategy for [`FolderTreeDoc::delete_folder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteFolderMode {
    /// Mark the folder and every descendant deleted; reparent their notes
    /// to the deleted folder's parent.
    Cascade,
    /// Mark only the folder deleted; move its immediate children (folders
    /// and notes) to its parent.
    Reparent,
    /// Mark only the folder deleted; descendants become hidden (they have
    /// a deleted ancestor) but are not reparented or touched.
    Simple,
}

struct Inner {
    crdt: CrdtDoc,
}

#[derive(Default)]
struct PersistState {
    own_log_path: Option<PathBuf>,
    next_seq: u64,
}

/// The single per-SD folder hierarchy document.
pub struct FolderTreeDoc {
    sd_path: PathBuf,
    instance_id: InstanceId,
    fs: Arc<dyn FileSystemAdapter>,
    activity_log: Option<Arc<ActivityLog>>,
    inner: Mutex<Inner>,
    persist: tokio::sync::Mutex<PersistState>,
}

impl FolderTreeDoc {
    fn root_dir(sd_path: &std::path::Path) -> PathBuf {
        sd_path.join("folders")
    }

    fn logs_dir(&self) -> PathBuf {
        Self::root_dir(&self.sd_path).join("logs")
    }

    fn snapshots_dir(&self) -> PathBuf {
        Self::root_dir(&self.sd_path).join("snapshots")
    }

    /// Load the SD's folder tree from disk (same persistence shape as
    /// [`crate::crdt::NoteDoc`]: latest snapshot, then every log file in
    /// lexicographic order).
    pub async fn load(
        fs: Arc<dyn FileSystemAdapter>,
        sd_path: PathBuf,
        instance_id: InstanceId,
        activity_log: Option<Arc<ActivityLog>>,
    ) -> Result<Self> {
        let doc = Self {
            sd_path,
            instance_id,
            fs,
            activity_log,
            inner: Mutex::new(Inner { crdt: CrdtDoc::new() }),
            persist: tokio::sync::Mutex::new(PersistState::default()),
        };
        doc.replay_disk().await?;
        Ok(doc)
    }

    async fn replay_disk(&self) -> Result<()> {
        let snapshots_dir = self.snapshots_dir();
        let snapshot_names = self.fs.list_dir(&snapshots_dir).await?;
        if let Some(latest) = latest_snapshot_name(&snapshot_names) {
            let bytes = self.fs.read_file(&snapshots_dir.join(&latest)).await?;
            let state = SnapshotCodec::decompress_with_fallback(&bytes);
            if !state.is_empty() {
                let inner = self.inner.lock().unwrap();
                inner.crdt.apply_update(&state, UpdateOrigin::Local)?;
            }
        }

        let logs_dir = self.logs_dir();
        let mut log_names = self.fs.list_dir(&logs_dir).await?;
        log_names.sort();

        let own_prefix = format!("{}_", self.instance_id);
        let mut own_log_path = None;
        let mut own_next_seq = 0u64;

        for name in &log_names {
            let path = logs_dir.join(name);
            let bytes = self.fs.read_file(&path).await?;
            let read = log_codec::read_all(&path, &bytes);
            {
                let inner = self.inner.lock().unwrap();
                for record in &read.records {
                    inner.crdt.apply_update(&record.data, UpdateOrigin::Local)?;
                }
            }
            if name.starts_with(&own_prefix) && name.ends_with(".crdtlog") {
                own_log_path = Some(path);
                if let Some(max_seq) = read.records.iter().map(|r| r.sequence).max() {
                    own_next_seq = own_next_seq.max(max_seq + 1);
                }
            }
            if let Some(err) = read.error {
                log::warn!("folder tree log {name} ended early: {err}");
            }
        }

        let mut persist = self.persist.lock().await;
        persist.own_log_path = own_log_path;
        persist.next_seq = own_next_seq;
        Ok(())
    }

    /// Re-scan disk into the existing document. Idempotent by CRDT merge.
    pub async fn reload(&self) -> Result<()> {
        self.replay_disk().await
    }

    /// Drop in-memory state.
    pub fn unload(&self) {
        self.inner.lock().unwrap().crdt = CrdtDoc::new();
    }

    async fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<()> {
        {
            let inner = self.inner.lock().unwrap();
            inner.crdt.apply_update(update, origin)?;
        }
        if origin.persists() {
            self.persist_update(update).await?;
        }
        Ok(())
    }

    async fn persist_update(&self, update: &[u8]) -> Result<()> {
        let mut persist = self.persist.lock().await;

        let log_path = match &persist.own_log_path {
            Some(p) => p.clone(),
            None => {
                let first_ts = chrono::Utc::now().timestamp_millis() as u64;
                let path = self.logs_dir().join(format!("{}_{first_ts}.crdtlog", self.instance_id));
                persist.own_log_path = Some(path.clone());
                path
            }
        };

        let sequence = persist.next_seq;
        persist.next_seq += 1;
        let timestamp = chrono::Utc::now().timestamp_millis() as u64;
        let record = log_codec::encode_record(timestamp, sequence, update);

        if self.fs.exists(&log_path).await {
            self.fs.append_file(&log_path, &record).await?;
        } else {
            self.fs.mkdir_recursive(&self.logs_dir()).await?;
            let mut full = log_codec::encode_header();
            full.extend_from_slice(&record);
            self.fs.write_file(&log_path, &full).await?;
        }
        drop(persist);

        if let Some(activity) = &self.activity_log {
            // FolderTreeDoc activity entries use the fixed sentinel note id
            // "folders" so ActivitySync can fast-path folder-tree changes
            // the same way it does note changes.
            activity.append(&NoteId::from_raw("folders"), &self.instance_id, sequence).await?;
        }
        Ok(())
    }

    /// Write the current state as a new snapshot; logs are kept.
    pub async fn snapshot(&self) -> Result<()> {
        let state = self.inner.lock().unwrap().crdt.encode_state_as_update();
        let compressed = SnapshotCodec::compress(&state)?;
        let ts = chrono::Utc::now().timestamp_millis();
        let path = self.snapshots_dir().join(format!("{ts}.crdtsnapshot"));
        self.fs.mkdir_recursive(&self.snapshots_dir()).await?;
        self.fs.write_file(&path, &compressed).await
    }

    fn read_folder(&self, folder_id: &FolderId) -> Option<FolderRecord> {
        let inner = self.inner.lock().unwrap();
        let doc = inner.crdt.doc();
        let txn = doc.transact();
        let folders = doc.get_or_insert_map(FOLDERS_MAP_NAME);
        let raw = folders.get(&txn, folder_id.as_str())?.to_string(&txn);
        serde_json::from_str(&raw).ok()
    }

    fn all_folders_raw(&self) -> HashMap<FolderId, FolderRecord> {
        let inner = self.inner.lock().unwrap();
        let doc = inner.crdt.doc();
        let txn = doc.transact();
        let folders = doc.get_or_insert_map(FOLDERS_MAP_NAME);
        folders
            .iter(&txn)
            .filter_map(|(key, value)| {
                let record: FolderRecord = serde_json::from_str(&value.to_string(&txn)).ok()?;
                Some((FolderId::from_raw(key), record))
            })
            .collect()
    }

    async fn write_folder(&self, folder_id: &FolderId, record: &FolderRecord) -> Result<()> {
        let update = {
            let inner = self.inner.lock().unwrap();
            let doc = inner.crdt.doc();
            let sv_before = doc.transact().state_vector();
            {
                let mut txn = doc.transact_mut();
                let folders = doc.get_or_insert_map(FOLDERS_MAP_NAME);
                let json = serde_json::to_string(record).unwrap();
                folders.insert(&mut txn, folder_id.as_str(), json);
            }
            let txn = doc.transact();
            txn.encode_state_as_update_v1(&sv_before)
        };
        self.apply_update(&update, UpdateOrigin::Edit).await
    }

    /// Non-deleted folders with no deleted ancestor.
    pub fn list_folders(&self) -> Vec<(FolderId, FolderRecord)> {
        let all = self.all_folders_raw();
        all.iter()
            .filter(|(id, record)| !record.deleted && !Self::has_deleted_ancestor_in(&all, id))
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect()
    }

    /// Every folder, including deleted ones.
    pub fn list_all_folders(&self) -> Vec<(FolderId, FolderRecord)> {
        self.all_folders_raw().into_iter().collect()
    }

    /// Whether `folder_id` has a deleted ancestor (it is itself hidden from
    /// [`Self::list_folders`] even if not deleted).
    pub fn has_deleted_ancestor(&self, folder_id: &FolderId) -> bool {
        Self::has_deleted_ancestor_in(&self.all_folders_raw(), folder_id)
    }

    fn has_deleted_ancestor_in(all: &HashMap<FolderId, FolderRecord>, folder_id: &FolderId) -> bool {
        let mut current = all.get(folder_id).and_then(|r| r.parent_id.clone());
        let mut guard = 0;
        while let Some(parent_id) = current {
            guard += 1;
            if guard > all.len() + 1 {
                // Cyclic parent chain; treat as hidden rather than loop forever.
                return true;
            }
            match all.get(&parent_id) {
                Some(parent) if parent.deleted => return true,
                Some(parent) => current = parent.parent_id.clone(),
                None => return false,
            }
        }
        false
    }

    /// All descendants of `folder_id` (folders, not notes), any depth.
    pub fn get_descendants(&self, folder_id: &FolderId) -> Vec<FolderId> {
        let all = self.all_folders_raw();
        let mut out = Vec::new();
        let mut frontier = vec![folder_id.clone()];
        while let Some(current) = frontier.pop() {
            for (id, record) in &all {
                if record.parent_id.as_ref() == Some(&current) {
                    out.push(id.clone());
                    frontier.push(id.clone());
                }
            }
        }
        out
    }

    /// Create a new folder and return its id.
    pub async fn add_folder(&self, name: &str, parent_id: Option<FolderId>) -> Result<FolderId> {
        let folder_id = FolderId::generate();
        let order = self.all_folders_raw().values().filter(|r| r.parent_id == parent_id).count() as i64;
        let record = FolderRecord {
            name: name.to_string(),
            parent_id,
            order,
            deleted: false,
        };
        self.write_folder(&folder_id, &record).await?;
        Ok(folder_id)
    }

    /// Move a folder under a new parent (or to the root with `None`).
    pub async fn move_folder(&self, folder_id: &FolderId, new_parent_id: Option<FolderId>) -> Result<()> {
        let mut record = self
            .read_folder(folder_id)
            .ok_or_else(|| SdError::NotFound(format!("folder '{folder_id}'")))?;
        if new_parent_id.as_ref() == Some(folder_id) {
            return Err(SdError::Conflict(format!("folder '{folder_id}' cannot be its own parent")));
        }
        record.parent_id = new_parent_id;
        self.write_folder(folder_id, &record).await
    }

    /// Rename a folder.
    pub async fn rename_folder(&self, folder_id: &FolderId, new_name: &str) -> Result<()> {
        let mut record = self
            .read_folder(folder_id)
            .ok_or_else(|| SdError::NotFound(format!("folder '{folder_id}'")))?;
        record.name = new_name.to_string();
        self.write_folder(folder_id, &record).await
    }

    /// Delete a folder per `mode`; see [`DeleteFolderMode`].
    pub async fn delete_folder(&self, folder_id: &FolderId, mode: DeleteFolderMode) -> Result<()> {
        let record = self
            .read_folder(folder_id)
            .ok_or_else(|| SdError::NotFound(format!("folder '{folder_id}'")))?;
        let parent_id = record.parent_id.clone();

        match mode {
            DeleteFolderMode::Simple => {
                let mut updated = record;
                updated.deleted = true;
                self.write_folder(folder_id, &updated).await
            }
            DeleteFolderMode::Reparent => {
                let mut updated = record;
                updated.deleted = true;
                self.write_folder(folder_id, &updated).await?;

                let children: Vec<FolderId> = self
                    .all_folders_raw()
                    .iter()
                    .filter(|(_, r)| r.parent_id.as_ref() == Some(folder_id))
                    .map(|(id, _)| id.clone())
                    .collect();
                for child in children {
                    self.move_folder(&child, parent_id.clone()).await?;
                }
                self.reparent_notes(folder_id, parent_id.as_ref(), false).await
            }
            DeleteFolderMode::Cascade => {
                let mut to_delete = vec![folder_id.clone()];
                to_delete.extend(self.get_descendants(folder_id));
                for id in &to_delete {
                    if let Some(mut r) = self.read_folder(id) {
                        r.deleted = true;
                        self.write_folder(id, &r).await?;
                    }
                }
                for id in &to_delete {
                    self.reparent_notes(id, parent_id.as_ref(), true).await?;
                }
                Ok(())
            }
        }
    }

    async fn reparent_notes(&self, from: &FolderId, to: Option<&FolderId>, only_this_folder: bool) -> Result<()> {
        let _ = only_this_folder;
        let mapping = self.all_note_folders_raw();
        for (note_id, folder) in mapping {
            if folder.as_ref() == Some(from) {
                self.set_note_folder(&note_id, to).await?;
            }
        }
        Ok(())
    }

    fn all_note_folders_raw(&self) -> HashMap<NoteId, Option<FolderId>> {
        let inner = self.inner.lock().unwrap();
        let doc = inner.crdt.doc();
        let txn = doc.transact();
        let map = doc.get_or_insert_map(NOTE_FOLDERS_MAP_NAME);
        map.iter(&txn)
            .filter_map(|(key, value)| {
                let folder: Option<String> = serde_json::from_str(&value.to_string(&txn)).ok()?;
                Some((NoteId::from_raw(key), folder.map(FolderId::from_raw)))
            })
            .collect()
    }

    /// The authoritative folder for a note.
    pub fn get_note_folder(&self, note_id: &NoteId) -> Option<FolderId> {
        let inner = self.inner.lock().unwrap();
        let doc = inner.crdt.doc();
        let txn = doc.transact();
        let map = doc.get_or_insert_map(NOTE_FOLDERS_MAP_NAME);
        let raw = map.get(&txn, note_id.as_str())?.to_string(&txn);
        serde_json::from_str::<Option<String>>(&raw).ok().flatten().map(FolderId::from_raw)
    }

    /// Set (or clear) the authoritative folder for a note.
    pub async fn set_note_folder(&self, note_id: &NoteId, folder_id: Option<&FolderId>) -> Result<()> {
        let update = {
            let inner = self.inner.lock().unwrap();
            let doc = inner.crdt.doc();
            let sv_before = doc.transact().state_vector();
            {
                let mut txn = doc.transact_mut();
                let map = doc.get_or_insert_map(NOTE_FOLDERS_MAP_NAME);
                let json = serde_json::to_string(&folder_id.map(|f| f.as_str().to_string())).unwrap();
                map.insert(&mut txn, note_id.as_str(), json);
            }
            let txn = doc.transact();
            txn.encode_state_as_update_v1(&sv_before)
        };
        self.apply_update(&update, UpdateOrigin::Edit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFsAdapter;

    fn sd() -> (Arc<MemoryFsAdapter>, PathBuf, InstanceId) {
        (Arc::new(MemoryFsAdapter::new()), PathBuf::from("/sd"), InstanceId::from_raw("inst-a"))
    }

    #[tokio::test]
    async fn add_move_rename_round_trip() {
        let (fs, sd_path, instance) = sd();
        let tree = FolderTreeDoc::load(fs, sd_path, instance, None).await.unwrap();

        let root = tree.add_folder("Root", None).await.unwrap();
        let child = tree.add_folder("Child", Some(root.clone())).await.unwrap();

        let folders = tree.list_folders();
        assert_eq!(folders.len(), 2);

        tree.rename_folder(&child, "Renamed").await.unwrap();
        assert_eq!(tree.list_all_folders().into_iter().find(|(id, _)| *id == child).unwrap().1.name, "Renamed");

        let other_root = tree.add_folder("Other", None).await.unwrap();
        tree.move_folder(&child, Some(other_root.clone())).await.unwrap();
        assert_eq!(tree.get_descendants(&other_root), vec![child.clone()]);
    }

    #[tokio::test]
    async fn cascade_delete_hides_descendants_and_reparents_notes() {
        let (fs, sd_path, instance) = sd();
        let tree = FolderTreeDoc::load(fs, sd_path, instance, None).await.unwrap();

        let root = tree.add_folder("Root", None).await.unwrap();
        let child = tree.add_folder("Child", Some(root.clone())).await.unwrap();
        let note = NoteId::generate();
        tree.set_note_folder(&note, Some(&child)).await.unwrap();

        tree.delete_folder(&root, DeleteFolderMode::Cascade).await.unwrap();

        assert!(tree.list_folders().is_empty());
        assert!(tree.has_deleted_ancestor(&child));
        assert_eq!(tree.get_note_folder(&note), None);
    }

    #[tokio::test]
    async fn reparent_delete_moves_immediate_children_up() {
        let (fs, sd_path, instance) = sd();
        let tree = FolderTreeDoc::load(fs, sd_path, instance, None).await.unwrap();

        let root = tree.add_folder("Root", None).await.unwrap();
        let child = tree.add_folder("Child", Some(root.clone())).await.unwrap();
        let grandchild = tree.add_folder("Grandchild", Some(child.clone())).await.unwrap();

        tree.delete_folder(&child, DeleteFolderMode::Reparent).await.unwrap();

        let folders = tree.list_folders();
        assert!(folders.iter().any(|(id, _)| *id == grandchild));
        let grandchild_record = tree.list_all_folders().into_iter().find(|(id, _)| *id == grandchild).unwrap().1;
        assert_eq!(grandchild_record.parent_id, Some(root));
    }

    #[tokio::test]
    async fn simple_delete_only_marks_the_folder() {
        let (fs, sd_path, instance) = sd();
        let tree = FolderTreeDoc::load(fs, sd_path, instance, None).await.unwrap();

        let root = tree.add_folder("Root", None).await.unwrap();
        let child = tree.add_folder("Child", Some(root.clone())).await.unwrap();

        tree.delete_folder(&root, DeleteFolderMode::Simple).await.unwrap();

        assert!(tree.has_deleted_ancestor(&child));
        let child_record = tree.list_all_folders().into_iter().find(|(id, _)| *id == child).unwrap().1;
        assert!(!child_record.deleted);
    }
}
