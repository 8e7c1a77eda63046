//! `sdstore image` — content-addressed image store administration.

use std::collections::HashSet;

use sdstore_core::ids::SdId;

use super::args::ImageCommands;
use super::util::{build_coordinator, fail};

pub async fn handle(command: ImageCommands) {
    match command {
        ImageCommands::Put { sd, file } => put(sd, file).await,
        ImageCommands::Get { sd, image, out } => get(sd, image, out).await,
        ImageCommands::Gc { sd, referenced } => gc(sd, referenced).await,
    }
}

async fn put(sd: String, file: std::path::PathBuf) {
    let (coordinator, _config) = match build_coordinator().await {
        Ok(pair) => pair,
        Err(err) => fail(&err),
    };
    let sd_id = SdId::from_raw(sd);

    let bytes = match std::fs::read(&file) {
        Ok(bytes) => bytes,
        Err(err) => fail(&err.into()),
    };
    let ext = file.extension().and_then(|e| e.to_str()).unwrap_or("bin");

    match coordinator.put_image(&sd_id, &bytes, ext).await {
        Ok(image_id) => println!("{image_id}"),
        Err(err) => fail(&err),
    }
}

async fn get(sd: String, image: String, out: std::path::PathBuf) {
    let (coordinator, _config) = match build_coordinator().await {
        Ok(pair) => pair,
        Err(err) => fail(&err),
    };
    let sd_id = SdId::from_raw(sd);

    match coordinator.get_image(&sd_id, &image).await {
        Ok(bytes) => match std::fs::write(&out, bytes) {
            Ok(()) => println!("✓ wrote {}", out.display()),
            Err(err) => fail(&err.into()),
        },
        Err(err) => fail(&err),
    }
}

async fn gc(sd: String, referenced: Vec<String>) {
    let (coordinator, _config) = match build_coordinator().await {
        Ok(pair) => pair,
        Err(err) => fail(&err),
    };
    let sd_id = SdId::from_raw(sd);
    let referenced_ids: HashSet<String> = referenced.into_iter().collect();
    let now_ms = chrono::Utc::now().timestamp_millis();

    match coordinator.sweep_orphan_images(&sd_id, &referenced_ids, now_ms).await {
        Ok(removed) => {
            for id in &removed {
                println!("removed {id}");
            }
            println!("✓ swept {} orphaned image(s)", removed.len());
        }
        Err(err) => fail(&err),
    }
}
