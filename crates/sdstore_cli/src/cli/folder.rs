//! `sdstore folder` — list, create, move, rename, and delete folders.

use sdstore_core::crdt::DeleteFolderMode;
use sdstore_core::ids::{FolderId, SdId};

use super::args::{DeleteFolderModeArg, FolderCommands};
use super::util::{build_coordinator, fail};

impl From<DeleteFolderModeArg> for DeleteFolderMode {
    fn from(value: DeleteFolderModeArg) -> Self {
        match value {
            DeleteFolderModeArg::Cascade => DeleteFolderMode::Cascade,
            DeleteFolderModeArg::Reparent => DeleteFolderMode::Reparent,
            DeleteFolderModeArg::Simple => DeleteFolderMode::Simple,
        }
    }
}

pub async fn handle(command: FolderCommands) {
    match command {
        FolderCommands::List { sd } => list(sd).await,
        FolderCommands::Add { sd, name, parent } => add(sd, name, parent).await,
        FolderCommands::Move { sd, folder, parent } => mv(sd, folder, parent).await,
        FolderCommands::Rename { sd, folder, name } => rename(sd, folder, name).await,
        FolderCommands::Delete { sd, folder, mode } => delete(sd, folder, mode).await,
    }
}

async fn list(sd: String) {
    let (coordinator, _config) = match build_coordinator().await {
        Ok(pair) => pair,
        Err(err) => fail(&err),
    };
    let sd_id = SdId::from_raw(sd);

    match coordinator.list_folders(&sd_id).await {
        Ok(folders) => {
            for (id, record) in folders {
                let parent = record.parent_id.map(|p| p.to_string()).unwrap_or_else(|| "(root)".to_string());
                println!("{id}\t{}\tparent={parent}", record.name);
            }
        }
        Err(err) => fail(&err),
    }
}

async fn add(sd: String, name: String, parent: Option<String>) {
    let (coordinator, _config) = match build_coordinator().await {
        Ok(pair) => pair,
        Err(err) => fail(&err),
    };
    let sd_id = SdId::from_raw(sd);
    let parent_id = parent.map(FolderId::from_raw);

    match coordinator.add_folder(&sd_id, &name, parent_id).await {
        Ok(folder_id) => println!("✓ created '{folder_id}'"),
        Err(err) => fail(&err),
    }
}

async fn mv(sd: String, folder: String, parent: Option<String>) {
    let (coordinator, _config) = match build_coordinator().await {
        Ok(pair) => pair,
        Err(err) => fail(&err),
    };
    let sd_id = SdId::from_raw(sd);
    let folder_id = FolderId::from_raw(folder);
    let parent_id = parent.map(FolderId::from_raw);

    match coordinator.move_folder(&sd_id, &folder_id, parent_id).await {
        Ok(()) => println!("✓ moved '{folder_id}'"),
        Err(err) => fail(&err),
    }
}

async fn rename(sd: String, folder: String, name: String) {
    let (coordinator, _config) = match build_coordinator().await {
        Ok(pair) => pair,
        Err(err) => fail(&err),
    };
    let sd_id = SdId::from_raw(sd);
    let folder_id = FolderId::from_raw(folder);

    match coordinator.rename_folder(&sd_id, &folder_id, &name).await {
        Ok(()) => println!("✓ renamed '{folder_id}' to '{name}'"),
        Err(err) => fail(&err),
    }
}

async fn delete(sd: String, folder: String, mode: DeleteFolderModeArg) {
    let (coordinator, _config) = match build_coordinator().await {
        Ok(pair) => pair,
        Err(err) => fail(&err),
    };
    let sd_id = SdId::from_raw(sd);
    let folder_id = FolderId::from_raw(folder);

    match coordinator.delete_folder(&sd_id, &folder_id, mode.into()).await {
        Ok(()) => println!("✓ deleted '{folder_id}'"),
        Err(err) => fail(&err),
    }
}
