//! End-to-end coordinator tests exercising more than one module at a time:
//! two independent instances converging on a note through the activity log,
//! and a full cross-SD move including the metadata cache and deletion log.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use sdstore_core::coordinator::Coordinator;
use sdstore_core::fs::MemoryFsAdapter;
use sdstore_core::ids::{InstanceId, NoteId, SdId};
use sdstore_core::metadata_cache::MetadataCache;
use sdstore_core::note_move::ConflictPolicy;

#[tokio::test]
async fn two_instances_converge_on_a_note_via_the_same_sd() {
    let fs = Arc::new(MemoryFsAdapter::new());
    let sd_id = SdId::from_raw("shared-sd");
    let sd_path = PathBuf::from("/sd");
    let note_id = NoteId::generate();

    let a = Coordinator::new(fs.clone(), InstanceId::from_raw("inst-a"), MetadataCache::in_memory().unwrap());
    a.register_sd(sd_id.clone(), sd_path.clone()).await.unwrap();

    let note_a = a.load_note(&sd_id, &note_id).await.unwrap();
    note_a.set_content_text("written by a").await.unwrap();

    let b = Coordinator::new(fs.clone(), InstanceId::from_raw("inst-b"), MetadataCache::in_memory().unwrap());
    b.register_sd(sd_id.clone(), sd_path.clone()).await.unwrap();

    // b discovers the note a peer created while it wasn't watching.
    let discovered = b.wake_from_sleep().await.unwrap();
    assert!(discovered.contains(&note_id));

    let note_b = b.load_note(&sd_id, &note_id).await.unwrap();
    assert_eq!(note_b.content_text(), "written by a");
}

#[tokio::test]
async fn moving_a_note_across_sds_updates_metadata_and_tombstones_the_source() {
    let fs = Arc::new(MemoryFsAdapter::new());
    let source = SdId::from_raw("source-sd");
    let dest = SdId::from_raw("dest-sd");

    let coordinator = Coordinator::new(fs.clone(), InstanceId::from_raw("inst-a"), MetadataCache::in_memory().unwrap());
    coordinator.register_sd(source.clone(), PathBuf::from("/source")).await.unwrap();
    coordinator.register_sd(dest.clone(), PathBuf::from("/dest")).await.unwrap();

    let note_id = NoteId::generate();
    let note = coordinator.load_note(&source, &note_id).await.unwrap();
    note.set_content_text("moving house").await.unwrap();

    let record = coordinator
        .move_note(note_id.clone(), source.clone(), dest.clone(), ConflictPolicy::Replace, &[], 1_000)
        .await
        .unwrap();

    assert_eq!(record.dest_note_id, note_id);

    let moved = coordinator.load_note(&dest, &note_id).await.unwrap();
    assert_eq!(moved.content_text(), "moving house");

    // Loading it from the source SD now finds nothing left to replay.
    let ghost = coordinator.load_note(&source, &note_id).await.unwrap();
    assert_eq!(ghost.content_text(), "");
}

#[tokio::test]
async fn orphan_images_survive_the_grace_period_then_get_swept() {
    let fs = Arc::new(MemoryFsAdapter::new());
    let sd_id = SdId::from_raw("sd-1");
    let coordinator = Coordinator::new(fs.clone(), InstanceId::from_raw("inst-a"), MetadataCache::in_memory().unwrap());
    coordinator.register_sd(sd_id.clone(), PathBuf::from("/sd")).await.unwrap();

    let image_id = coordinator.put_image(&sd_id, b"thumbnail bytes", "png").await.unwrap();

    let still_referenced: HashSet<String> = [image_id.clone()].into_iter().collect();
    let removed = coordinator.sweep_orphan_images(&sd_id, &still_referenced, i64::MAX).await.unwrap();
    assert!(removed.is_empty());
    assert_eq!(coordinator.get_image(&sd_id, &image_id).await.unwrap(), b"thumbnail bytes");

    let none_referenced = HashSet::new();
    let removed = coordinator.sweep_orphan_images(&sd_id, &none_referenced, i64::MAX).await.unwrap();
    assert_eq!(removed, vec![image_id.clone()]);
    assert!(coordinator.get_image(&sd_id, &image_id).await.is_err());
}
