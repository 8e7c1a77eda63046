//! `sdstore sd` — register, unregister, check, and migrate Storage Directories.

use sdstore_core::ids::SdId;

use super::args::SdCommands;
use super::util::{build_coordinator, fail};

pub async fn handle(command: SdCommands) {
    match command {
        SdCommands::Register { id, path } => register(id, path).await,
        SdCommands::Unregister { id } => unregister(id).await,
        SdCommands::CheckVersion { id } => check_version(id).await,
        SdCommands::Migrate { id } => migrate(id).await,
    }
}

async fn register(id: String, path: std::path::PathBuf) {
    let (coordinator, mut config) = match build_coordinator().await {
        Ok(pair) => pair,
        Err(err) => fail(&err),
    };
    let sd_id = SdId::from_raw(id);

    let absolute = path.canonicalize().unwrap_or(path);
    match coordinator.register_sd(sd_id.clone(), absolute.clone()).await {
        Ok(check) if check.compatible => {
            config.upsert_sd(sd_id.clone(), absolute);
            if let Err(err) = config.save() {
                fail(&err);
            }
            println!("✓ registered '{sd_id}' (version {})", check.found_version);
        }
        Ok(check) => {
            eprintln!("✗ cannot mount '{sd_id}': {}", check.reason.as_deref().unwrap_or("incompatible"));
            std::process::exit(1);
        }
        Err(err) => fail(&err),
    }
}

async fn unregister(id: String) {
    let (coordinator, mut config) = match build_coordinator().await {
        Ok(pair) => pair,
        Err(err) => fail(&err),
    };
    let sd_id = SdId::from_raw(id);

    coordinator.unregister_sd(&sd_id).await;
    config.remove_sd(&sd_id);
    if let Err(err) = config.save() {
        fail(&err);
    }
    println!("✓ unregistered '{sd_id}'");
}

async fn check_version(id: String) {
    let (coordinator, _config) = match build_coordinator().await {
        Ok(pair) => pair,
        Err(err) => fail(&err),
    };
    let sd_id = SdId::from_raw(id);

    match coordinator.check_sd_version(&sd_id).await {
        Ok(check) if check.compatible => println!("✓ compatible (version {})", check.found_version),
        Ok(check) => println!("✗ {} (version {})", check.reason.as_deref().unwrap_or("incompatible"), check.found_version),
        Err(err) => fail(&err),
    }
}

async fn migrate(id: String) {
    let (coordinator, _config) = match build_coordinator().await {
        Ok(pair) => pair,
        Err(err) => fail(&err),
    };
    let sd_id = SdId::from_raw(id);
    let now_ms = chrono::Utc::now().timestamp_millis();

    match coordinator.migrate_sd(sd_id.clone(), now_ms).await {
        Ok(version) => println!("✓ '{sd_id}' migrated to version {version}"),
        Err(err) => fail(&err),
    }
}
