//! One CRDT document per note: in-memory state, disk persistence, and the
//! derived fields (`title`, `contentText`, `folderId`) callers need without
//! understanding the underlying CRDT shape.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use yrs::{GetString, Map, ReadTxn, Text, Transact};

use super::doc::{CrdtDoc, UpdateOrigin};
use crate::activity_log::ActivityLog;
use crate::codec::{log_codec, snapshot_codec::SnapshotCodec};
use crate::error::Result;
use crate::fs::FileSystemAdapter;
use crate::ids::{FolderId, InstanceId, NoteId};

const CONTENT_TEXT_NAME: &str = "content";
const ATTRS_MAP_NAME: &str = "attrs";
const FOLDER_ID_KEY: &str = "folderId";

struct Inner {
    crdt: CrdtDoc,
}

#[derive(Default)]
struct PersistState {
    own_log_path: Option<PathBuf>,
    next_seq: u64,
}

/// A single note's CRDT document plus its on-disk log/snapshot files.
///
/// Per §4.4, at-most-one writer per note per instance is guaranteed by
/// always appending to this instance's own log file
/// (`<instanceId>_<firstTs>.crdtlog`); concurrent writers from other
/// instances land in separate files and merge by CRDT semantics on reload.
pub struct NoteDoc {
    note_id: NoteId,
    sd_path: PathBuf,
    instance_id: InstanceId,
    fs: Arc<dyn FileSystemAdapter>,
    activity_log: Option<Arc<ActivityLog>>,
    inner: Mutex<Inner>,
    persist: tokio::sync::Mutex<PersistState>,
}

impl NoteDoc {
    /// Directory holding this note's log and snapshot subdirectories.
    pub fn note_dir(sd_path: &Path, note_id: &NoteId) -> PathBuf {
        sd_path.join("notes").join(note_id.as_str())
    }

    fn logs_dir(&self) -> PathBuf {
        Self::note_dir(&self.sd_path, &self.note_id).join("logs")
    }

    fn snapshots_dir(&self) -> PathBuf {
        Self::note_dir(&self.sd_path, &self.note_id).join("snapshots")
    }

    /// Materialize a note's CRDT state by decompressing its latest snapshot
    /// (if any) then replaying every `.crdtlog` file in `logs/` in
    /// lexicographic filename order. Missing files produce an empty doc.
    pub async fn load(
        fs: Arc<dyn FileSystemAdapter>,
        sd_path: PathBuf,
        instance_id: InstanceId,
        note_id: NoteId,
        activity_log: Option<Arc<ActivityLog>>,
    ) -> Result<Self> {
        let crdt = CrdtDoc::new();
        let note = Self {
            note_id,
            sd_path,
            instance_id,
            fs,
            activity_log,
            inner: Mutex::new(Inner { crdt }),
            persist: tokio::sync::Mutex::new(PersistState::default()),
        };
        note.replay_disk().await?;
        Ok(note)
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
                log::warn!("note {} log {} ended early: {err}", self.note_id, name);
            }
        }

        let mut persist = self.persist.lock().await;
        persist.own_log_path = own_log_path;
        persist.next_seq = own_next_seq;
        Ok(())
    }

    /// Re-run `load`'s disk scan against the existing in-memory doc. CRDT
    /// merge semantics make this idempotent: records already applied are a
    /// no-op the second time.
    pub async fn reload(&self) -> Result<()> {
        self.replay_disk().await
    }

    /// Drop in-memory state; a subsequent `reload` re-reads everything from
    /// disk into a fresh, empty document.
    pub fn unload(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.crdt = CrdtDoc::new();
    }

    /// Apply a CRDT update to the in-memory document. Only `origin ==
    /// Edit` (a change from the owning editor) appends to this instance's
    /// log file and activity breadcrumb; `Local`/`Ipc` origins update memory
    /// only, avoiding re-persisting data that came from disk or another
    /// process.
    pub async fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<()> {
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
            activity.append(&self.note_id, &self.instance_id, sequence).await?;
        }
        Ok(())
    }

    /// Register a subscriber notified on every applied update (any origin).
    pub fn observe_updates(&self, callback: super::doc::UpdateCallback) {
        self.inner.lock().unwrap().crdt.observe_updates(callback);
    }

    /// Full current state, encoded as a single update — used for IPC and
    /// snapshotting.
    pub fn encode_state(&self) -> Vec<u8> {
        self.inner.lock().unwrap().crdt.encode_state_as_update()
    }

    /// Write the current state as a new `<ts>.crdtsnapshot`. Existing logs
    /// are left in place; compaction is a separate, out-of-scope concern.
    pub async fn snapshot(&self) -> Result<()> {
        let state = self.encode_state();
        let compressed = SnapshotCodec::compress(&state)?;
        let ts = chrono::Utc::now().timestamp_millis();
        let path = self.snapshots_dir().join(format!("{ts}.crdtsnapshot"));
        self.fs.mkdir_recursive(&self.snapshots_dir()).await?;
        self.fs.write_file(&path, &compressed).await
    }

    /// First non-empty line of the content text.
    pub fn title(&self) -> String {
        self.content_text()
            .lines()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("")
            .to_string()
    }

    /// Plain-text flattening of the note body.
    pub fn content_text(&self) -> String {
        let inner = self.inner.lock().unwrap();
        let doc = inner.crdt.doc();
        let txn = doc.transact();
        doc.get_or_insert_text(CONTENT_TEXT_NAME).get_string(&txn)
    }

    /// Replace the note body, recorded as an `Edit`-origin update so it
    /// persists to this instance's log.
    pub async fn set_content_text(&self, text: &str) -> Result<()> {
        let update = {
            let inner = self.inner.lock().unwrap();
            let doc = inner.crdt.doc();
            let body = doc.get_or_insert_text(CONTENT_TEXT_NAME);
            let sv_before = doc.transact().state_vector();
            {
                let mut txn = doc.transact_mut();
                let len = body.get_string(&txn).len() as u32;
                if len > 0 {
                    body.remove_range(&mut txn, 0, len);
                }
                body.insert(&mut txn, 0, text);
            }
            let txn = doc.transact();
            txn.encode_state_as_update_v1(&sv_before)
        };
        self.apply_update(&update, UpdateOrigin::Edit).await
    }

    /// The note's folder attribute, if set. This is advisory only:
    /// [`crate::crdt::FolderTreeDoc`]'s note→folder mapping is authoritative
    /// when the two disagree.
    pub fn folder_id(&self) -> Option<FolderId> {
        let inner = self.inner.lock().unwrap();
        let doc = inner.crdt.doc();
        let txn = doc.transact();
        let attrs = doc.get_or_insert_map(ATTRS_MAP_NAME);
        let raw = attrs.get(&txn, FOLDER_ID_KEY)?.to_string(&txn);
        serde_json::from_str::<Option<String>>(&raw).ok().flatten().map(FolderId::from_raw)
    }

    /// Set (or clear, with `None`) the note's folder attribute.
    pub async fn set_folder_id(&self, folder_id: Option<&FolderId>) -> Result<()> {
        let update = {
            let inner = self.inner.lock().unwrap();
            let doc = inner.crdt.doc();
            let sv_before = doc.transact().state_vector();
            {
                let mut txn = doc.transact_mut();
                let attrs = doc.get_or_insert_map(ATTRS_MAP_NAME);
                let json = serde_json::to_string(&folder_id.map(|f| f.as_str().to_string())).unwrap();
                attrs.insert(&mut txn, FOLDER_ID_KEY, json);
            }
            let txn = doc.transact();
            txn.encode_state_as_update_v1(&sv_before)
        };
        self.apply_update(&update, UpdateOrigin::Edit).await
    }

    /// This note's id.
    pub fn note_id(&self) -> &NoteId {
        &self.note_id
    }
}

/// Pick the snapshot with the numerically largest `<ts>` prefix.
pub(super) fn latest_snapshot_name(names: &[String]) -> Option<String> {
    names
        .iter()
        .filter_map(|n| n.strip_suffix(".crdtsnapshot").and_then(|ts| ts.parse::<i64>().ok()).map(|ts| (ts, n.clone())))
        .max_by_key(|(ts, _)| *ts)
        .map(|(_, name)| name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFsAdapter;

    fn instance(id: &str) -> InstanceId {
        InstanceId::from_raw(id)
    }

    #[tokio::test]
    async fn set_content_and_reload_round_trips() {
        let fs = Arc::new(MemoryFsAdapter::new());
        let note_id = NoteId::generate();
        let note = NoteDoc::load(fs.clone(), PathBuf::from("/sd"), instance("inst-a"), note_id.clone(), None)
            .await
            .unwrap();

        note.set_content_text("hello world\nmore text").await.unwrap();
        assert_eq!(note.title(), "hello world");
        assert_eq!(note.content_text(), "hello world\nmore text");

        note.unload();
        assert_eq!(note.content_text(), "");

        note.reload().await.unwrap();
        assert_eq!(note.content_text(), "hello world\nmore text");
    }

    #[tokio::test]
    async fn concurrent_instances_converge_via_reload() {
        let fs = Arc::new(MemoryFsAdapter::new());
        let note_id = NoteId::generate();

        let a = NoteDoc::load(fs.clone(), PathBuf::from("/sd"), instance("inst-a"), note_id.clone(), None)
            .await
            .unwrap();
        a.set_content_text("from a").await.unwrap();

        let b = NoteDoc::load(fs.clone(), PathBuf::from("/sd"), instance("inst-b"), note_id.clone(), None)
            .await
            .unwrap();
        // b started empty; reload should pick up a's log file.
        b.reload().await.unwrap();
        assert_eq!(b.content_text(), "from a");
    }

    #[tokio::test]
    async fn snapshot_then_load_fresh_recovers_state() {
        let fs = Arc::new(MemoryFsAdapter::new());
        let note_id = NoteId::generate();

        let a = NoteDoc::load(fs.clone(), PathBuf::from("/sd"), instance("inst-a"), note_id.clone(), None)
            .await
            .unwrap();
        a.set_content_text("snapshot me").await.unwrap();
        a.snapshot().await.unwrap();

        let b = NoteDoc::load(fs.clone(), PathBuf::from("/sd"), instance("inst-b"), note_id.clone(), None)
            .await
            .unwrap();
        assert_eq!(b.content_text(), "snapshot me");
    }

    #[tokio::test]
    async fn folder_id_round_trips_through_attrs() {
        let fs = Arc::new(MemoryFsAdapter::new());
        let note_id = NoteId::generate();
        let note = NoteDoc::load(fs.clone(), PathBuf::from("/sd"), instance("inst-a"), note_id, None)
            .await
            .unwrap();

        assert_eq!(note.folder_id(), None);
        let folder = FolderId::generate();
        note.set_folder_id(Some(&folder)).await.unwrap();
        assert_eq!(note.folder_id(), Some(folder));

        note.set_folder_id(None).await.unwrap();
        assert_eq!(note.folder_id(), None);
    }
}
