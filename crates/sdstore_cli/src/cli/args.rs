//! Clap argument definitions for the `sdstore` ops tool.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "sdstore")]
#[command(version)]
#[command(about = "Inspect and administer sdstore Storage Directories", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Register, unregister, and migrate Storage Directories
    Sd {
        #[command(subcommand)]
        command: SdCommands,
    },

    /// Load, edit, move, and delete notes
    Note {
        #[command(subcommand)]
        command: NoteCommands,
    },

    /// List, create, move, rename, and delete folders
    Folder {
        #[command(subcommand)]
        command: FolderCommands,
    },

    /// Content-addressed image store administration
    Image {
        #[command(subcommand)]
        command: ImageCommands,
    },

    /// Tier 2 polling group status and tuning
    Polling {
        #[command(subcommand)]
        command: PollingCommands,
    },

    /// Bug-report diagnostics export
    Diagnostics {
        #[command(subcommand)]
        command: DiagnosticsCommands,
    },
}

#[derive(Subcommand)]
pub enum SdCommands {
    /// Register an SD at `path` under `id`, re-mounting it on future runs
    Register {
        /// Identifier to register the SD under
        id: String,
        /// Path to the SD root directory
        path: PathBuf,
    },

    /// Drop an SD from the registry; leaves everything on disk untouched
    Unregister {
        /// Identifier the SD was registered under
        id: String,
    },

    /// Check whether a registered SD can be mounted as-is
    CheckVersion {
        /// Identifier the SD was registered under
        id: String,
    },

    /// Migrate a registered SD forward to the current on-disk format
    Migrate {
        /// Identifier the SD was registered under
        id: String,
    },
}

#[derive(Subcommand)]
pub enum NoteCommands {
    /// Load (or lazily create) a note and print its derived title/content
    Load {
        /// SD the note belongs to
        sd: String,
        /// Note identifier
        note: String,
    },

    /// Apply a raw CRDT update read from a file
    ApplyUpdate {
        /// SD the note belongs to
        sd: String,
        /// Note identifier
        note: String,
        /// Path to the raw update bytes
        #[arg(long)]
        update_file: PathBuf,
        /// Origin to tag the update with
        #[arg(long, value_enum, default_value = "edit")]
        origin: UpdateOriginArg,
    },

    /// Force a snapshot of a note's current CRDT state
    Snapshot {
        /// SD the note belongs to
        sd: String,
        /// Note identifier
        note: String,
    },

    /// Move a note from one registered SD to another
    Move {
        /// Note identifier
        note: String,
        /// Source SD identifier
        #[arg(long)]
        from: String,
        /// Destination SD identifier
        #[arg(long)]
        to: String,
        /// How to handle an existing note at the destination
        #[arg(long, value_enum, default_value = "replace")]
        conflict: ConflictPolicyArg,
        /// Content-addressed image id referenced by the note (repeatable)
        #[arg(long = "image")]
        images: Vec<String>,
    },

    /// Soft-delete a note
    Delete {
        /// SD the note belongs to
        sd: String,
        /// Note identifier
        note: String,
        /// Hard-delete instead of soft-delete; terminal, cannot be undone
        #[arg(long)]
        permanent: bool,
    },

    /// Undo a soft delete
    Restore {
        /// SD the note belongs to
        sd: String,
        /// Note identifier
        note: String,
    },
}

#[derive(Subcommand)]
pub enum FolderCommands {
    /// List non-deleted, non-hidden folders in an SD
    List {
        /// SD to list folders in
        sd: String,
    },

    /// Create a folder
    Add {
        /// SD to create the folder in
        sd: String,
        /// Folder name
        name: String,
        /// Parent folder identifier (root if omitted)
        #[arg(long)]
        parent: Option<String>,
    },

    /// Move a folder under a new parent
    Move {
        /// SD the folder belongs to
        sd: String,
        /// Folder identifier
        folder: String,
        /// New parent folder identifier (root if omitted)
        #[arg(long)]
        parent: Option<String>,
    },

    /// Rename a folder
    Rename {
        /// SD the folder belongs to
        sd: String,
        /// Folder identifier
        folder: String,
        /// New name
        name: String,
    },

    /// Delete a folder
    Delete {
        /// SD the folder belongs to
        sd: String,
        /// Folder identifier
        folder: String,
        /// How descendants and contained notes are handled
        #[arg(long, value_enum, default_value = "cascade")]
        mode: DeleteFolderModeArg,
    },
}

#[derive(Subcommand)]
pub enum ImageCommands {
    /// Store an image file's bytes in an SD's media store
    Put {
        /// SD to store the image in
        sd: String,
        /// Path to the image file on the local filesystem
        file: PathBuf,
    },

    /// Fetch an image by id and write its bytes to a file
    Get {
        /// SD to look the image up in (falls back to every other registered SD)
        sd: String,
        /// Content-addressed image id
        image: String,
        /// Destination path for the fetched bytes
        #[arg(long)]
        out: PathBuf,
    },

    /// Delete orphaned images past the grace period
    Gc {
        /// SD to sweep
        sd: String,
        /// Image id still referenced by a note (repeatable); anything else
        /// past the grace period is considered orphaned
        #[arg(long = "keep")]
        referenced: Vec<String>,
    },
}

#[derive(Subcommand)]
pub enum PollingCommands {
    /// Print the current Tier 2 queue depth and rate-limiting settings
    Status,
}

#[derive(Subcommand)]
pub enum DiagnosticsCommands {
    /// Print a diagnostics package (instance id, registered SDs, polling
    /// status) as JSON, suitable for attaching to a bug report
    Export,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum UpdateOriginArg {
    /// Persisted to disk as a user edit
    Edit,
    /// Applied locally but not persisted (e.g. replaying a peer's update)
    Local,
    /// Received over an external transport; not persisted
    Ipc,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ConflictPolicyArg {
    /// Overwrite whatever is at the destination
    Replace,
    /// Write the incoming note under a fresh id, leaving the existing one
    KeepBoth,
    /// Abort the move rather than touch an existing destination note
    Error,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DeleteFolderModeArg {
    /// Delete the folder and every descendant; reparent their notes
    Cascade,
    /// Delete only the folder; move its children to its parent
    Reparent,
    /// Delete only the folder; descendants become hidden but are left
    /// where they are
    Simple,
}
