//! Single process-wide owner tying every component together (§4.14).
//!
//! `Coordinator` is the one entry point a host (CLI, desktop shell, mobile
//! bridge) talks to. It owns the [`SdRegistry`], the process-wide
//! [`PollingGroup`], the [`ImageStore`], the [`NoteMoveManager`], and one
//! [`MetadataCache`], plus a lazily-populated per-SD state map holding each
//! SD's [`FolderTreeDoc`], [`DeletionLog`], [`ActivityLog`]/[`ActivitySync`]
//! pair, and whichever [`NoteDoc`]s have been loaded so far. Every method
//! here corresponds to one row of the external interface table; a thin IPC
//! or CLI layer wraps these methods directly rather than re-implementing
//! any of their logic.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::activity_log::ActivityLog;
use crate::activity_sync::{ActivitySync, HandoffCallback, ReloadCallback};
use crate::crdt::{DeleteFolderMode, FolderRecord, FolderTreeDoc, NoteDoc, UpdateCallback, UpdateOrigin};
use crate::deletion_log::{DeletionLog, DeletionOp, NoteDeletionState};
use crate::error::{Result, SdError};
use crate::fs::{FileSystemAdapter, WatchEvent};
use crate::ids::{FolderId, InstanceId, NoteId, SdId};
use crate::image_store::{ImageId, ImageStore};
use crate::metadata_cache::{FolderMetadata, MetadataCache, NoteMetadata};
use crate::note_move::{ConflictPolicy, MoveRecord, MoveState, NoteMoveManager};
use crate::polling_group::{PollReason, PollingGroup, PollingSettings};
use crate::sd_registry::SdRegistry;
use crate::sd_version::{self, VersionCheck};

/// Everything the coordinator keeps loaded for one registered SD.
struct SdState {
    path: PathBuf,
    folder_tree: Arc<FolderTreeDoc>,
    deletion_log: Arc<DeletionLog>,
    activity_log: Arc<ActivityLog>,
    activity_sync: Arc<ActivitySync>,
    /// The `activity/` watch started in `load_sd_state`; drained by
    /// [`Coordinator::run_fast_path_watch`]. `None` once a host has taken it.
    activity_watch: tokio::sync::Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<WatchEvent>>>,
    notes: tokio::sync::Mutex<HashMap<NoteId, Arc<NoteDoc>>>,
}

/// Outcome of driving [`ActivitySync::poll_and_reload`] for one note,
/// captured synchronously from its callbacks and acted on afterward since
/// those callbacks cannot themselves await.
enum PumpOutcome {
    Reloaded,
    HandedOff(HashMap<InstanceId, u64>),
}

/// Serializable mirror of [`PollingSettings`] (which is not itself `Serialize`).
#[derive(Debug, Clone, Serialize)]
pub struct PollingSettingsView {
    pub poll_rate_per_minute: u32,
    pub hit_rate_multiplier: f64,
    pub max_burst_per_second: u32,
    pub normal_priority_reserve: f64,
}

impl From<PollingSettings> for PollingSettingsView {
    fn from(s: PollingSettings) -> Self {
        Self {
            poll_rate_per_minute: s.poll_rate_per_minute,
            hit_rate_multiplier: s.hit_rate_multiplier,
            max_burst_per_second: s.max_burst_per_second,
            normal_priority_reserve: s.normal_priority_reserve,
        }
    }
}

/// Snapshot of the polling subsystem, returned by [`Coordinator::polling_status`].
#[derive(Debug, Clone, Serialize)]
pub struct PollingStatus {
    pub queued_entries: usize,
    pub over_memory_bound: bool,
    pub settings: PollingSettingsView,
}

/// A diagnostics export, per `diagnostics.exportPackage`: enough state to
/// file a useful bug report without shipping note content.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsPackage {
    pub instance_id: String,
    pub registered_sds: Vec<(String, PathBuf)>,
    pub polling: PollingStatus,
}

/// The single owner of shared mutable state for this process (§5). Every
/// method takes `&self`; interior state is behind per-SD async mutexes so
/// unrelated SDs never block each other.
pub struct Coordinator {
    fs: Arc<dyn FileSystemAdapter>,
    instance_id: InstanceId,
    registry: SdRegistry,
    polling: Arc<PollingGroup>,
    image_store: ImageStore,
    move_manager: NoteMoveManager,
    metadata: MetadataCache,
    sds: tokio::sync::Mutex<HashMap<SdId, Arc<SdState>>>,
}

impl Coordinator {
    /// Build a coordinator with no SDs registered yet.
    pub fn new(fs: Arc<dyn FileSystemAdapter>, instance_id: InstanceId, metadata: MetadataCache) -> Self {
        Self {
            image_store: ImageStore::new(fs.clone()),
            move_manager: NoteMoveManager::new(fs.clone()),
            polling: Arc::new(PollingGroup::new(PollingSettings::default())),
            fs,
            instance_id,
            registry: SdRegistry::new(),
            metadata,
            sds: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// This install's per-profile instance id, per §3's identity rules.
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// The process-wide Tier 2 reconciler. Neither `drain_ready` nor
    /// `mark_polled` is driven by anything inside this crate: a host is
    /// expected to run its own timer loop that calls `drain_ready`, performs
    /// whatever "is this note now satisfied" check the host considers a poll
    /// (typically re-running the same fast-path reconciliation this
    /// coordinator does in [`Coordinator::pump_activity_sync`]), and reports
    /// the result back via `mark_polled(.., hit)`. This accessor is that
    /// contract's only entry point.
    pub fn polling_group(&self) -> &Arc<PollingGroup> {
        &self.polling
    }

    // ------------------------------------------------------------------
    // sd.*
    // ------------------------------------------------------------------

    /// Register an SD at `path`. Checks its on-disk version first; a
    /// `VersionCheck` with `compatible: false` is returned without loading
    /// any state — callers migrate (`migrate_sd`) or surface the mismatch
    /// to the user before retrying.
    pub async fn register_sd(&self, sd_id: SdId, path: PathBuf) -> Result<VersionCheck> {
        let check = sd_version::check_sd_version(self.fs.as_ref(), &path).await?;
        if !check.compatible {
            return Ok(check);
        }

        self.registry.register(sd_id.clone(), path.clone());
        self.load_sd_state(sd_id, path).await?;
        Ok(check)
    }

    async fn load_sd_state(&self, sd_id: SdId, path: PathBuf) -> Result<Arc<SdState>> {
        let activity_log = Arc::new(ActivityLog::new(self.fs.clone(), path.clone()));
        let deletion_log = Arc::new(DeletionLog::new(self.fs.clone(), path.clone(), self.instance_id.clone()));
        let activity_sync = Arc::new(ActivitySync::new(self.fs.clone(), activity_log.clone(), self.instance_id.clone()));
        let folder_tree = Arc::new(
            FolderTreeDoc::load(self.fs.clone(), path.clone(), self.instance_id.clone(), Some(activity_log.clone())).await?,
        );

        // `watch` requires the directory to already exist (a native watcher
        // can't watch a path that isn't there yet).
        let activity_dir = path.join("activity");
        self.fs.mkdir_recursive(&activity_dir).await?;
        let activity_watch = self.fs.watch(&activity_dir)?;

        let state = Arc::new(SdState {
            path: path.clone(),
            folder_tree,
            deletion_log,
            activity_log,
            activity_sync,
            activity_watch: tokio::sync::Mutex::new(Some(activity_watch)),
            notes: tokio::sync::Mutex::new(HashMap::new()),
        });

        // Queue every existing note for a one-time full-SD sweep so Tier 2
        // reconciles anything this instance missed while it was offline.
        let note_ids = self.fs.list_dir(&path.join("notes")).await?;
        self.polling.queue_full_repoll(sd_id.clone(), note_ids.into_iter().map(NoteId::from_raw)).await;

        self.sds.lock().await.insert(sd_id, state.clone());
        Ok(state)
    }

    /// Drop an SD from the registry and release its in-memory state. Leaves
    /// everything on disk untouched.
    pub async fn unregister_sd(&self, sd_id: &SdId) {
        self.registry.unregister(sd_id);
        self.sds.lock().await.remove(sd_id);
    }

    /// Check whether the SD at a registered path can be mounted as-is,
    /// without loading it.
    pub async fn check_sd_version(&self, sd_id: &SdId) -> Result<VersionCheck> {
        let path = self.sd_path(sd_id)?;
        sd_version::check_sd_version(self.fs.as_ref(), &path).await
    }

    /// Migrate a registered-but-incompatible SD forward, then load it if it
    /// wasn't already.
    pub async fn migrate_sd(&self, sd_id: SdId, now_ms: i64) -> Result<u32> {
        let path = self.sd_path(&sd_id)?;
        let version = sd_version::migrate(self.fs.as_ref(), &path, now_ms).await?;
        let already_loaded = self.sds.lock().await.contains_key(&sd_id);
        if !already_loaded {
            self.load_sd_state(sd_id, path).await?;
        }
        Ok(version)
    }

    fn sd_path(&self, sd_id: &SdId) -> Result<PathBuf> {
        self.registry.path_of(sd_id).ok_or_else(|| SdError::NotFound(format!("sd '{sd_id}'")))
    }

    async fn sd_state(&self, sd_id: &SdId) -> Result<Arc<SdState>> {
        self.sds.lock().await.get(sd_id).cloned().ok_or_else(|| SdError::NotFound(format!("sd '{sd_id}' not registered or not loaded")))
    }

    /// Wake-from-sleep discovery (§5). Walks `notes/*/` in every registered
    /// SD and, for each directory not yet reflected in the metadata cache,
    /// loads the note and refreshes its metadata — unless the DeletionLog
    /// says it was tombstoned, in which case it is skipped. A host calls
    /// this on OS resume or ~5s after cold start to pick up notes a peer
    /// created while this instance could not otherwise have noticed.
    pub async fn wake_from_sleep(&self) -> Result<Vec<NoteId>> {
        let sd_ids: Vec<SdId> = self.sds.lock().await.keys().cloned().collect();
        let mut discovered = Vec::new();
        for sd_id in sd_ids {
            discovered.extend(self.wake_from_sleep_for_sd(&sd_id).await?);
        }
        Ok(discovered)
    }

    async fn wake_from_sleep_for_sd(&self, sd_id: &SdId) -> Result<Vec<NoteId>> {
        let state = self.sd_state(sd_id).await?;
        let note_dirs = self.fs.list_dir(&state.path.join("notes")).await?;

        let mut discovered = Vec::new();
        for raw_id in note_dirs {
            let note_id = NoteId::from_raw(raw_id);
            if self.metadata.get_note(&note_id)?.is_some() {
                continue;
            }
            if !matches!(state.deletion_log.state_of(&note_id).await?, NoteDeletionState::Live) {
                continue;
            }
            let note = self.load_note(sd_id, &note_id).await?;
            self.refresh_note_metadata(sd_id, &note_id, &note).await?;
            discovered.push(note_id);
        }
        Ok(discovered)
    }

    // ------------------------------------------------------------------
    // Tier 1 fast path (§4.8)
    // ------------------------------------------------------------------

    /// Take ownership of the `activity/` watch receiver started for `sd_id`
    /// in `load_sd_state`, if a host hasn't already taken it. A host spawns
    /// a loop over the returned receiver and calls
    /// [`Coordinator::pump_activity_sync`] on each batch of events (or just
    /// on a timer, since `pump_activity_sync` re-reads everything new since
    /// the last call regardless of what woke it).
    pub async fn take_activity_watch(&self, sd_id: &SdId) -> Result<tokio::sync::mpsc::UnboundedReceiver<WatchEvent>> {
        let state = self.sd_state(sd_id).await?;
        state
            .activity_watch
            .lock()
            .await
            .take()
            .ok_or_else(|| SdError::Conflict(format!("activity watch for sd '{sd_id}' already taken")))
    }

    /// Drive one pass of the Tier 1 reconciler for `sd_id`: ingest whatever
    /// is new in every peer's `activity/<id>.log`, then try to satisfy (or
    /// hand off to Tier 2) every note currently being tracked. Call this
    /// from a loop over the receiver returned by
    /// [`Coordinator::take_activity_watch`], or on a timer, or both.
    pub async fn pump_activity_sync(&self, sd_id: &SdId) -> Result<()> {
        let state = self.sd_state(sd_id).await?;
        state.activity_sync.ingest_activity().await?;

        for note_id in state.activity_sync.pending_notes().await {
            self.poll_one_note_fast_path(sd_id, &state, &note_id).await?;
        }
        Ok(())
    }

    async fn poll_one_note_fast_path(&self, sd_id: &SdId, state: &Arc<SdState>, note_id: &NoteId) -> Result<()> {
        let logs_dir = NoteDoc::note_dir(&state.path, note_id).join("logs");
        let note_logs_dir = move |_peer: &InstanceId| logs_dir.clone();

        let outcome: Arc<std::sync::Mutex<Option<PumpOutcome>>> = Arc::new(std::sync::Mutex::new(None));

        let outcome_reload = outcome.clone();
        let on_reload: ReloadCallback = Arc::new(move |_note_id| {
            *outcome_reload.lock().unwrap() = Some(PumpOutcome::Reloaded);
        });

        let outcome_handoff = outcome.clone();
        let on_handoff: HandoffCallback = Arc::new(move |_note_id, expected| {
            *outcome_handoff.lock().unwrap() = Some(PumpOutcome::HandedOff(expected));
        });

        state.activity_sync.poll_and_reload(note_id, note_logs_dir, &on_reload, &on_handoff).await?;

        match outcome.lock().unwrap().take() {
            Some(PumpOutcome::Reloaded) => self.reload_note_from_fast_path(sd_id, note_id).await?,
            Some(PumpOutcome::HandedOff(expected)) => {
                self.polling.add_entry(sd_id.clone(), note_id.clone(), expected, PollReason::FastPathHandoff).await;
            }
            None => {}
        }
        Ok(())
    }

    /// Reload a note that the fast path just confirmed is fully caught up,
    /// and refresh its metadata. A no-op for a note that hasn't been loaded
    /// into memory yet (it'll pick up the new state the next time it is).
    async fn reload_note_from_fast_path(&self, sd_id: &SdId, note_id: &NoteId) -> Result<()> {
        let state = self.sd_state(sd_id).await?;
        let note = state.notes.lock().await.get(note_id).cloned();
        if let Some(note) = note {
            note.reload().await?;
            self.refresh_note_metadata(sd_id, note_id, &note).await?;
        }
        Ok(())
    }

    /// Run the Tier 1 watch loop for `sd_id` until its watch channel closes,
    /// calling [`Coordinator::pump_activity_sync`] on every batch of
    /// filesystem events. Intended to be spawned by a host that has wrapped
    /// its `Coordinator` in an `Arc` (this crate doesn't assume one).
    pub async fn run_fast_path_watch(&self, sd_id: &SdId) -> Result<()> {
        let mut rx = self.take_activity_watch(sd_id).await?;
        while rx.recv().await.is_some() {
            // Drain whatever else already queued up before acting, so a
            // burst of writes triggers one pump instead of one per event.
            while rx.try_recv().is_ok() {}
            self.pump_activity_sync(sd_id).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // note.*
    // ------------------------------------------------------------------

    /// Load (or return the already-loaded) [`NoteDoc`] for one note.
    pub async fn load_note(&self, sd_id: &SdId, note_id: &NoteId) -> Result<Arc<NoteDoc>> {
        let state = self.sd_state(sd_id).await?;
        let mut notes = state.notes.lock().await;
        if let Some(existing) = notes.get(note_id) {
            return Ok(existing.clone());
        }
        let note = Arc::new(
            NoteDoc::load(
                self.fs.clone(),
                state.path.clone(),
                self.instance_id.clone(),
                note_id.clone(),
                Some(state.activity_log.clone()),
            )
            .await?,
        );
        notes.insert(note_id.clone(), note.clone());
        Ok(note)
    }

    /// Apply a CRDT update to a note, then (for `Edit`-origin updates, which
    /// persist) refresh the metadata cache so search/listing stays current.
    pub async fn apply_note_update(&self, sd_id: &SdId, note_id: &NoteId, update: &[u8], origin: UpdateOrigin) -> Result<()> {
        let note = self.load_note(sd_id, note_id).await?;
        note.apply_update(update, origin).await?;
        if origin.persists() {
            self.refresh_note_metadata(sd_id, note_id, &note).await?;
        }
        Ok(())
    }

    async fn refresh_note_metadata(&self, sd_id: &SdId, note_id: &NoteId, note: &NoteDoc) -> Result<()> {
        let state = self.sd_state(sd_id).await?;
        // FolderTreeDoc wins over the note's own (advisory) folderId attribute.
        let folder_id = state.folder_tree.get_note_folder(note_id).or_else(|| note.folder_id());
        let deleted = !matches!(state.deletion_log.state_of(note_id).await?, NoteDeletionState::Live);
        let pinned = self.metadata.get_note(note_id)?.map(|m| m.pinned).unwrap_or(false);

        self.metadata.upsert_note(&NoteMetadata {
            note_id: note_id.clone(),
            sd_id: sd_id.clone(),
            title: note.title(),
            folder_id,
            content_text: note.content_text(),
            modified_ms: chrono::Utc::now().timestamp_millis(),
            deleted,
            pinned,
        })
    }

    /// Subscribe to every future update applied to a note (any origin).
    pub async fn observe_note_updates(&self, sd_id: &SdId, note_id: &NoteId, callback: UpdateCallback) -> Result<()> {
        let note = self.load_note(sd_id, note_id).await?;
        note.observe_updates(callback);
        Ok(())
    }

    /// Force a snapshot of a note's current CRDT state.
    pub async fn snapshot_note(&self, sd_id: &SdId, note_id: &NoteId) -> Result<()> {
        self.load_note(sd_id, note_id).await?.snapshot().await
    }

    /// Soft-delete a note: appends a `delete` tombstone and marks it hidden
    /// in the metadata cache. Rejects a note with a `permanent` tombstone,
    /// since that state is terminal.
    pub async fn soft_delete_note(&self, sd_id: &SdId, note_id: &NoteId, now_ms: i64) -> Result<()> {
        self.transition_deletion(sd_id, note_id, DeletionOp::Delete, now_ms).await
    }

    /// Undo a soft delete.
    pub async fn restore_note(&self, sd_id: &SdId, note_id: &NoteId, now_ms: i64) -> Result<()> {
        self.transition_deletion(sd_id, note_id, DeletionOp::Restore, now_ms).await
    }

    /// Hard-delete a note. Terminal: no further transition is accepted for
    /// this `noteId` afterward.
    pub async fn permanent_delete_note(&self, sd_id: &SdId, note_id: &NoteId, now_ms: i64) -> Result<()> {
        self.transition_deletion(sd_id, note_id, DeletionOp::Permanent, now_ms).await?;
        self.metadata.remove_note(note_id)?;
        Ok(())
    }

    async fn transition_deletion(&self, sd_id: &SdId, note_id: &NoteId, op: DeletionOp, now_ms: i64) -> Result<()> {
        let state = self.sd_state(sd_id).await?;
        if matches!(state.deletion_log.state_of(note_id).await?, NoteDeletionState::Permanent) {
            return Err(SdError::Conflict(format!("note '{note_id}' has a permanent tombstone")));
        }
        state.deletion_log.append(note_id, op, now_ms).await?;
        if let Some(mut meta) = self.metadata.get_note(note_id)? {
            meta.deleted = !matches!(op, DeletionOp::Restore);
            self.metadata.upsert_note(&meta)?;
        }
        Ok(())
    }

    /// Move a note from one registered SD to another, driving
    /// [`NoteMoveManager`] through its full state machine and rolling back
    /// on any failure that occurs before `db_updated`. `image_ids` are the
    /// content-addressed ids referenced by the note; the caller, closer to
    /// the editor's rendering of the note body, is in the best position to
    /// enumerate these.
    pub async fn move_note(
        &self,
        note_id: NoteId,
        source_sd: SdId,
        dest_sd: SdId,
        conflict_policy: ConflictPolicy,
        image_ids: &[String],
        now_ms: i64,
    ) -> Result<MoveRecord> {
        let source_path = self.sd_path(&source_sd)?;
        let dest_path = self.sd_path(&dest_sd)?;

        let record = self
            .move_manager
            .initiate(&source_path, source_sd.clone(), dest_sd.clone(), note_id.clone(), conflict_policy, now_ms)
            .await?;

        match self.run_move_steps(&source_path, &dest_path, record, image_ids).await {
            Ok(record) => Ok(record),
            Err(err) => {
                // The failing step never persisted past its starting state,
                // so the last record written to disk reflects exactly how
                // far the move actually got.
                if let Some(persisted) = self.move_manager.load(&source_path, &note_id).await? {
                    if matches!(persisted.state, MoveState::Initiated | MoveState::ImagesCopied | MoveState::FilesCopied) {
                        self.move_manager.rollback(&source_path, &dest_path, persisted).await?;
                    }
                }
                Err(err)
            }
        }
    }

    async fn run_move_steps(
        &self,
        source_path: &Path,
        dest_path: &Path,
        record: MoveRecord,
        image_ids: &[String],
    ) -> Result<MoveRecord> {
        let record = self.move_manager.copy_images(source_path, dest_path, record, image_ids).await?;
        let record = self.move_manager.copy_note_files(source_path, dest_path, record).await?;

        self.apply_move_metadata(&record).await?;
        let record = self.move_manager.mark_db_updated(source_path, record).await?;

        let source_state = self.sd_state(&record.source_sd).await?;
        let now_ms = record.started_at_ms;
        source_state.deletion_log.append(&record.note_id, DeletionOp::Permanent, now_ms).await?;
        let record = self.move_manager.mark_source_tombstoned(source_path, record).await?;

        let record = self.move_manager.clean_source_files(source_path, record).await?;

        // Evict any cached in-memory NoteDoc for the source SD; its backing
        // files are gone and a future load must target the destination SD.
        source_state.notes.lock().await.remove(&record.note_id);

        self.move_manager.complete(source_path, record).await
    }

    async fn apply_move_metadata(&self, record: &MoveRecord) -> Result<()> {
        if let Some(mut meta) = self.metadata.get_note(&record.note_id)? {
            meta.note_id = record.dest_note_id.clone();
            meta.sd_id = record.dest_sd.clone();
            self.metadata.upsert_note(&meta)?;
            if record.dest_note_id != record.note_id {
                self.metadata.remove_note(&record.note_id)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // folder.*
    // ------------------------------------------------------------------

    /// Create a folder and mirror it into the metadata cache.
    pub async fn add_folder(&self, sd_id: &SdId, name: &str, parent_id: Option<FolderId>) -> Result<FolderId> {
        let state = self.sd_state(sd_id).await?;
        let folder_id = state.folder_tree.add_folder(name, parent_id).await?;
        self.sync_folder_metadata(sd_id, &state, &folder_id)?;
        Ok(folder_id)
    }

    /// Move a folder under a new parent.
    pub async fn move_folder(&self, sd_id: &SdId, folder_id: &FolderId, new_parent_id: Option<FolderId>) -> Result<()> {
        let state = self.sd_state(sd_id).await?;
        state.folder_tree.move_folder(folder_id, new_parent_id).await?;
        self.sync_folder_metadata(sd_id, &state, folder_id)
    }

    /// Rename a folder.
    pub async fn rename_folder(&self, sd_id: &SdId, folder_id: &FolderId, new_name: &str) -> Result<()> {
        let state = self.sd_state(sd_id).await?;
        state.folder_tree.rename_folder(folder_id, new_name).await?;
        self.sync_folder_metadata(sd_id, &state, folder_id)
    }

    /// Delete a folder per the given [`DeleteFolderMode`].
    pub async fn delete_folder(&self, sd_id: &SdId, folder_id: &FolderId, mode: DeleteFolderMode) -> Result<()> {
        let state = self.sd_state(sd_id).await?;
        state.folder_tree.delete_folder(folder_id, mode).await?;
        self.resync_all_folder_metadata(sd_id, &state)
    }

    /// Non-deleted, non-hidden folders in an SD.
    pub async fn list_folders(&self, sd_id: &SdId) -> Result<Vec<(FolderId, FolderRecord)>> {
        Ok(self.sd_state(sd_id).await?.folder_tree.list_folders())
    }

    fn sync_folder_metadata(&self, sd_id: &SdId, state: &SdState, folder_id: &FolderId) -> Result<()> {
        let record = state
            .folder_tree
            .list_all_folders()
            .into_iter()
            .find(|(id, _)| id == folder_id)
            .map(|(_, record)| record);
        if let Some(record) = record {
            self.write_folder_metadata(sd_id, folder_id, &record)?;
        }
        Ok(())
    }

    fn resync_all_folder_metadata(&self, sd_id: &SdId, state: &SdState) -> Result<()> {
        for (folder_id, record) in state.folder_tree.list_all_folders() {
            self.write_folder_metadata(sd_id, &folder_id, &record)?;
        }
        Ok(())
    }

    fn write_folder_metadata(&self, sd_id: &SdId, folder_id: &FolderId, record: &FolderRecord) -> Result<()> {
        self.metadata.upsert_folder(&FolderMetadata {
            folder_id: folder_id.clone(),
            sd_id: sd_id.clone(),
            parent_id: record.parent_id.clone(),
            name: record.name.clone(),
            order: record.order,
            deleted: record.deleted,
        })
    }

    // ------------------------------------------------------------------
    // image.*
    // ------------------------------------------------------------------

    /// Store image bytes in an SD's `media/` directory.
    pub async fn put_image(&self, sd_id: &SdId, bytes: &[u8], ext: &str) -> Result<ImageId> {
        let path = self.sd_path(sd_id)?;
        self.image_store.put(&path, bytes, ext).await
    }

    /// Fetch an image by id, falling back to every other registered SD.
    pub async fn get_image(&self, sd_id: &SdId, image_id: &str) -> Result<Vec<u8>> {
        let path = self.sd_path(sd_id)?;
        let others = self.registry.all_except(sd_id);
        self.image_store.get(&path, image_id, &others).await
    }

    /// Delete every orphaned (unreferenced, past the grace period) image in
    /// an SD's `media/` directory. The caller enumerates `referenced_ids`
    /// since only it knows which images the current note bodies still cite.
    pub async fn sweep_orphan_images(&self, sd_id: &SdId, referenced_ids: &HashSet<String>, now_ms: i64) -> Result<Vec<String>> {
        let path = self.sd_path(sd_id)?;
        self.image_store.sweep_orphans(&path, referenced_ids, now_ms).await
    }

    // ------------------------------------------------------------------
    // polling.*
    // ------------------------------------------------------------------

    /// Record that a note is currently open in the host's UI, giving it
    /// [`PollReason::OpenNote`] priority in Tier 2.
    pub async fn report_open_notes(&self, sd_id: &SdId, note_ids: impl IntoIterator<Item = NoteId>) {
        for note_id in note_ids {
            self.polling.add_entry(sd_id.clone(), note_id, HashMap::new(), PollReason::OpenNote).await;
        }
    }

    /// Record that notes are visible in a list (but not necessarily open),
    /// giving them [`PollReason::NotesList`] priority.
    pub async fn report_notes_in_list(&self, sd_id: &SdId, note_ids: impl IntoIterator<Item = NoteId>) {
        for note_id in note_ids {
            self.polling.add_entry(sd_id.clone(), note_id, HashMap::new(), PollReason::NotesList).await;
        }
    }

    /// Current Tier 2 queue depth and settings, for host-side monitoring.
    pub async fn polling_status(&self) -> PollingStatus {
        PollingStatus {
            queued_entries: self.polling.len().await,
            over_memory_bound: self.polling.is_over_memory_bound().await,
            settings: self.polling.settings().await.into(),
        }
    }

    /// Replace the process-wide Tier 2 rate-limiting settings.
    pub async fn set_polling_settings(&self, settings: PollingSettings) {
        self.polling.set_settings(settings).await;
    }

    // ------------------------------------------------------------------
    // diagnostics.*
    // ------------------------------------------------------------------

    /// Build a diagnostics package summarizing process state (no note
    /// content) for bug reports.
    pub async fn export_diagnostics(&self) -> DiagnosticsPackage {
        DiagnosticsPackage {
            instance_id: self.instance_id.to_string(),
            registered_sds: self.registry.all().into_iter().map(|(id, path)| (id.to_string(), path)).collect(),
            polling: self.polling_status().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFsAdapter;

    fn coordinator() -> (Coordinator, Arc<MemoryFsAdapter>) {
        let fs = Arc::new(MemoryFsAdapter::new());
        let metadata = MetadataCache::in_memory().unwrap();
        let coordinator = Coordinator::new(fs.clone(), InstanceId::from_raw("inst-a"), metadata);
        (coordinator, fs)
    }

    #[tokio::test]
    async fn register_load_edit_and_reload_round_trips_through_metadata() {
        let (coordinator, _fs) = coordinator();
        let sd_id = SdId::from_raw("sd-1");
        let check = coordinator.register_sd(sd_id.clone(), PathBuf::from("/sd")).await.unwrap();
        assert!(check.compatible);

        let note_id = NoteId::generate();
        let note = coordinator.load_note(&sd_id, &note_id).await.unwrap();
        note.set_content_text("hello there").await.unwrap();
        coordinator.refresh_note_metadata(&sd_id, &note_id, &note).await.unwrap();

        let meta = coordinator.metadata.get_note(&note_id).unwrap().unwrap();
        assert_eq!(meta.title, "hello there");
        assert!(!meta.deleted);
    }

    #[tokio::test]
    async fn register_rejects_an_incompatible_future_version() {
        let (coordinator, fs) = coordinator();
        fs.write_file(&PathBuf::from("/sd/SD_VERSION"), b"99\n").await.unwrap();
        let check = coordinator.register_sd(SdId::from_raw("sd-1"), PathBuf::from("/sd")).await.unwrap();
        assert!(!check.compatible);
        assert_eq!(check.reason.as_deref(), Some("too-new"));
    }

    #[tokio::test]
    async fn permanent_delete_rejects_further_transitions() {
        let (coordinator, _fs) = coordinator();
        let sd_id = SdId::from_raw("sd-1");
        coordinator.register_sd(sd_id.clone(), PathBuf::from("/sd")).await.unwrap();
        let note_id = NoteId::generate();

        coordinator.permanent_delete_note(&sd_id, &note_id, 1000).await.unwrap();
        let err = coordinator.restore_note(&sd_id, &note_id, 2000).await.unwrap_err();
        assert!(matches!(err, SdError::Conflict(_)));
    }

    #[tokio::test]
    async fn folder_lifecycle_mirrors_into_metadata_cache() {
        let (coordinator, _fs) = coordinator();
        let sd_id = SdId::from_raw("sd-1");
        coordinator.register_sd(sd_id.clone(), PathBuf::from("/sd")).await.unwrap();

        let folder_id = coordinator.add_folder(&sd_id, "Work", None).await.unwrap();
        let folders = coordinator.metadata.list_folders(&sd_id).unwrap();
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].name, "Work");

        coordinator.rename_folder(&sd_id, &folder_id, "Personal").await.unwrap();
        let folders = coordinator.metadata.list_folders(&sd_id).unwrap();
        assert_eq!(folders[0].name, "Personal");
    }

    #[tokio::test]
    async fn move_note_copies_files_and_updates_metadata() {
        let (coordinator, fs) = coordinator();
        let source = SdId::from_raw("source");
        let dest = SdId::from_raw("dest");
        coordinator.register_sd(source.clone(), PathBuf::from("/source")).await.unwrap();
        coordinator.register_sd(dest.clone(), PathBuf::from("/dest")).await.unwrap();

        let note_id = NoteId::generate();
        let note = coordinator.load_note(&source, &note_id).await.unwrap();
        note.set_content_text("movable").await.unwrap();
        coordinator.refresh_note_metadata(&source, &note_id, &note).await.unwrap();

        let record = coordinator.move_note(note_id.clone(), source.clone(), dest.clone(), ConflictPolicy::Replace, &[], 1000).await.unwrap();
        assert_eq!(record.state, MoveState::Completed);

        let meta = coordinator.metadata.get_note(&note_id).unwrap().unwrap();
        assert_eq!(meta.sd_id, dest);

        let dest_note = coordinator.load_note(&dest, &note_id).await.unwrap();
        assert_eq!(dest_note.content_text(), "movable");
        let _ = fs;
    }

    #[tokio::test]
    async fn put_then_get_image_round_trips_through_coordinator() {
        let (coordinator, _fs) = coordinator();
        let sd_id = SdId::from_raw("sd-1");
        coordinator.register_sd(sd_id.clone(), PathBuf::from("/sd")).await.unwrap();

        let image_id = coordinator.put_image(&sd_id, b"bytes", "png").await.unwrap();
        let fetched = coordinator.get_image(&sd_id, &image_id).await.unwrap();
        assert_eq!(fetched, b"bytes");
    }

    #[tokio::test]
    async fn polling_status_reflects_reported_open_notes() {
        let (coordinator, _fs) = coordinator();
        let sd_id = SdId::from_raw("sd-1");
        coordinator.register_sd(sd_id.clone(), PathBuf::from("/sd")).await.unwrap();
        coordinator.report_open_notes(&sd_id, vec![NoteId::generate()]).await;

        let status = coordinator.polling_status().await;
        assert!(status.queued_entries >= 1);
    }

    #[tokio::test]
    async fn wake_from_sleep_discovers_a_note_a_peer_created_while_asleep() {
        let fs = Arc::new(MemoryFsAdapter::new());
        let sd_id = SdId::from_raw("sd-1");
        let sd_path = PathBuf::from("/sd");

        // Instance A creates and edits a note while this process (B) is asleep.
        let a = Coordinator::new(fs.clone(), InstanceId::from_raw("inst-a"), MetadataCache::in_memory().unwrap());
        a.register_sd(sd_id.clone(), sd_path.clone()).await.unwrap();
        let note_id = NoteId::generate();
        let note = a.load_note(&sd_id, &note_id).await.unwrap();
        note.set_content_text("Hello").await.unwrap();

        // Instance B wakes, registers the same SD, and has no idea this note exists yet.
        let b = Coordinator::new(fs.clone(), InstanceId::from_raw("inst-b"), MetadataCache::in_memory().unwrap());
        b.register_sd(sd_id.clone(), sd_path.clone()).await.unwrap();
        assert!(b.metadata.get_note(&note_id).unwrap().is_none());

        let discovered = b.wake_from_sleep().await.unwrap();
        assert_eq!(discovered, vec![note_id.clone()]);

        let meta = b.metadata.get_note(&note_id).unwrap().unwrap();
        assert_eq!(meta.title, "Hello");
        assert!(!meta.deleted);
    }

    #[tokio::test]
    async fn wake_from_sleep_skips_a_tombstoned_note() {
        let fs = Arc::new(MemoryFsAdapter::new());
        let sd_id = SdId::from_raw("sd-1");
        let sd_path = PathBuf::from("/sd");

        let a = Coordinator::new(fs.clone(), InstanceId::from_raw("inst-a"), MetadataCache::in_memory().unwrap());
        a.register_sd(sd_id.clone(), sd_path.clone()).await.unwrap();
        let note_id = NoteId::generate();
        a.load_note(&sd_id, &note_id).await.unwrap().set_content_text("gone").await.unwrap();
        a.soft_delete_note(&sd_id, &note_id, 1000).await.unwrap();

        let b = Coordinator::new(fs.clone(), InstanceId::from_raw("inst-b"), MetadataCache::in_memory().unwrap());
        b.register_sd(sd_id.clone(), sd_path.clone()).await.unwrap();

        let discovered = b.wake_from_sleep().await.unwrap();
        assert!(discovered.is_empty());
        assert!(b.metadata.get_note(&note_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn unregister_drops_state_but_leaves_disk_alone() {
        let (coordinator, fs) = coordinator();
        let sd_id = SdId::from_raw("sd-1");
        coordinator.register_sd(sd_id.clone(), PathBuf::from("/sd")).await.unwrap();
        coordinator.put_image(&sd_id, b"x", "png").await.unwrap();

        coordinator.unregister_sd(&sd_id).await;
        assert!(coordinator.sd_state(&sd_id).await.is_err());
        assert!(fs.list_dir(&PathBuf::from("/sd/media")).await.unwrap().len() == 1);
    }

    #[tokio::test]
    async fn pump_activity_sync_reloads_a_note_once_a_peer_catches_up() {
        let fs = Arc::new(MemoryFsAdapter::new());
        let sd_id = SdId::from_raw("sd-1");
        let sd_path = PathBuf::from("/sd");

        let a = Coordinator::new(fs.clone(), InstanceId::from_raw("inst-a"), MetadataCache::in_memory().unwrap());
        a.register_sd(sd_id.clone(), sd_path.clone()).await.unwrap();
        let note_id = NoteId::generate();
        let note_a = a.load_note(&sd_id, &note_id).await.unwrap();
        note_a.set_content_text("from a").await.unwrap();
        a.refresh_note_metadata(&sd_id, &note_id, &note_a).await.unwrap();

        // Instance B writes to the same note, appending to the shared
        // activity log the way a real peer would.
        let activity_log = Arc::new(ActivityLog::new(fs.clone(), sd_path.clone()));
        let note_b = NoteDoc::load(
            fs.clone(),
            sd_path.clone(),
            InstanceId::from_raw("inst-b"),
            note_id.clone(),
            Some(activity_log),
        )
        .await
        .unwrap();
        note_b.set_content_text("from a, then b").await.unwrap();

        assert_eq!(a.load_note(&sd_id, &note_id).await.unwrap().content_text(), "from a");

        a.pump_activity_sync(&sd_id).await.unwrap();

        assert_eq!(a.load_note(&sd_id, &note_id).await.unwrap().content_text(), "from a, then b");
        assert_eq!(a.metadata.get_note(&note_id).unwrap().unwrap().title, "from a, then b");
    }

    #[tokio::test]
    async fn pump_activity_sync_hands_an_unreachable_note_off_to_tier_two() {
        let fs = Arc::new(MemoryFsAdapter::new());
        let sd_id = SdId::from_raw("sd-1");
        let sd_path = PathBuf::from("/sd");

        let a = Coordinator::new(fs.clone(), InstanceId::from_raw("inst-a"), MetadataCache::in_memory().unwrap());
        a.register_sd(sd_id.clone(), sd_path.clone()).await.unwrap();
        let note_id = NoteId::generate();

        // A peer claims a sequence far beyond anything actually on disk, so
        // the gap exceeds SEQUENCE_GAP_THRESHOLD and Tier 1 gives up at once.
        let activity_log = ActivityLog::new(fs.clone(), sd_path.clone());
        activity_log.append(&note_id, &InstanceId::from_raw("inst-b"), 1000).await.unwrap();

        let queued_before = a.polling_group().len().await;
        a.pump_activity_sync(&sd_id).await.unwrap();
        assert!(a.polling_group().len().await > queued_before);
    }

    #[tokio::test]
    async fn take_activity_watch_can_only_be_taken_once() {
        let (coordinator, _fs) = coordinator();
        let sd_id = SdId::from_raw("sd-1");
        coordinator.register_sd(sd_id.clone(), PathBuf::from("/sd")).await.unwrap();

        assert!(coordinator.take_activity_watch(&sd_id).await.is_ok());
        assert!(coordinator.take_activity_watch(&sd_id).await.is_err());
    }
}
