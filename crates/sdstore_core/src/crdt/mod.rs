//! Per-note and per-SD CRDT documents, built on a thin [`CrdtDoc`] wrapper
//! around `yrs`.

mod doc;
mod folder_tree_doc;
mod note_doc;

pub use doc::{CrdtDoc, UpdateCallback, UpdateOrigin};
pub use folder_tree_doc::{DeleteFolderMode, FolderRecord, FolderTreeDoc};
pub use note_doc::NoteDoc;
