//! `sdstore note` — load, edit, snapshot, move, and delete notes.

use sdstore_core::crdt::UpdateOrigin;
use sdstore_core::ids::{NoteId, SdId};
use sdstore_core::note_move::ConflictPolicy;

use super::args::{ConflictPolicyArg, NoteCommands, UpdateOriginArg};
use super::util::{build_coordinator, fail};

impl From<UpdateOriginArg> for UpdateOrigin {
    fn from(value: UpdateOriginArg) -> Self {
        match value {
            UpdateOriginArg::Edit => UpdateOrigin::Edit,
            UpdateOriginArg::Local => UpdateOrigin::Local,
            UpdateOriginArg::Ipc => UpdateOrigin::Ipc,
        }
    }
}

impl From<ConflictPolicyArg> for ConflictPolicy {
    fn from(value: ConflictPolicyArg) -> Self {
        match value {
            ConflictPolicyArg::Replace => ConflictPolicy::Replace,
            ConflictPolicyArg::KeepBoth => ConflictPolicy::KeepBoth,
            ConflictPolicyArg::Error => ConflictPolicy::Error,
        }
    }
}

pub async fn handle(command: NoteCommands) {
    match command {
        NoteCommands::Load { sd, note } => load(sd, note).await,
        NoteCommands::ApplyUpdate { sd, note, update_file, origin } => apply_update(sd, note, update_file, origin).await,
        NoteCommands::Snapshot { sd, note } => snapshot(sd, note).await,
        NoteCommands::Move { note, from, to, conflict, images } => mv(note, from, to, conflict, images).await,
        NoteCommands::Delete { sd, note, permanent } => delete(sd, note, permanent).await,
        NoteCommands::Restore { sd, note } => restore(sd, note).await,
    }
}

async fn load(sd: String, note: String) {
    let (coordinator, _config) = match build_coordinator().await {
        Ok(pair) => pair,
        Err(err) => fail(&err),
    };
    let sd_id = SdId::from_raw(sd);
    let note_id = NoteId::from_raw(note);

    match coordinator.load_note(&sd_id, &note_id).await {
        Ok(doc) => {
            println!("title: {}", doc.title());
            println!("folder: {}", doc.folder_id().map(|id| id.to_string()).unwrap_or_else(|| "(none)".to_string()));
            println!("content:\n{}", doc.content_text());
        }
        Err(err) => fail(&err),
    }
}

async fn apply_update(sd: String, note: String, update_file: std::path::PathBuf, origin: UpdateOriginArg) {
    let (coordinator, _config) = match build_coordinator().await {
        Ok(pair) => pair,
        Err(err) => fail(&err),
    };
    let sd_id = SdId::from_raw(sd);
    let note_id = NoteId::from_raw(note);

    let bytes = match std::fs::read(&update_file) {
        Ok(bytes) => bytes,
        Err(err) => fail(&err.into()),
    };

    match coordinator.apply_note_update(&sd_id, &note_id, &bytes, origin.into()).await {
        Ok(()) => println!("✓ applied update to '{note_id}'"),
        Err(err) => fail(&err),
    }
}

async fn snapshot(sd: String, note: String) {
    let (coordinator, _config) = match build_coordinator().await {
        Ok(pair) => pair,
        Err(err) => fail(&err),
    };
    let sd_id = SdId::from_raw(sd);
    let note_id = NoteId::from_raw(note);

    match coordinator.snapshot_note(&sd_id, &note_id).await {
        Ok(()) => println!("✓ snapshotted '{note_id}'"),
        Err(err) => fail(&err),
    }
}

async fn mv(note: String, from: String, to: String, conflict: ConflictPolicyArg, images: Vec<String>) {
    let (coordinator, _config) = match build_coordinator().await {
        Ok(pair) => pair,
        Err(err) => fail(&err),
    };
    let note_id = NoteId::from_raw(note);
    let source = SdId::from_raw(from);
    let dest = SdId::from_raw(to);
    let now_ms = chrono::Utc::now().timestamp_millis();

    match coordinator.move_note(note_id, source, dest, conflict.into(), &images, now_ms).await {
        Ok(record) => println!("✓ moved to '{}' (state: {:?})", record.dest_note_id, record.state),
        Err(err) => fail(&err),
    }
}

async fn delete(sd: String, note: String, permanent: bool) {
    let (coordinator, _config) = match build_coordinator().await {
        Ok(pair) => pair,
        Err(err) => fail(&err),
    };
    let sd_id = SdId::from_raw(sd);
    let note_id = NoteId::from_raw(note);
    let now_ms = chrono::Utc::now().timestamp_millis();

    let result = if permanent {
        coordinator.permanent_delete_note(&sd_id, &note_id, now_ms).await
    } else {
        coordinator.soft_delete_note(&sd_id, &note_id, now_ms).await
    };

    match result {
        Ok(()) => println!("✓ deleted '{note_id}'{}", if permanent { " (permanent)" } else { "" }),
        Err(err) => fail(&err),
    }
}

async fn restore(sd: String, note: String) {
    let (coordinator, _config) = match build_coordinator().await {
        Ok(pair) => pair,
        Err(err) => fail(&err),
    };
    let sd_id = SdId::from_raw(sd);
    let note_id = NoteId::from_raw(note);
    let now_ms = chrono::Utc::now().timestamp_millis();

    match coordinator.restore_note(&sd_id, &note_id, now_ms).await {
        Ok(()) => println!("✓ restored '{note_id}'"),
        Err(err) => fail(&err),
    }
}
