//! Storage directory engine for a local-first, multi-device CRDT note store.
//!
//! This crate owns everything below the editor: the on-disk layout of a
//! Storage Directory (SD), the binary log/snapshot formats, the flag-byte
//! readiness protocol for cloud-synced files, cross-instance discovery and
//! polling, deletion tombstones, cross-SD note moves, the content-addressed
//! image store, and the local SQL metadata mirror. [`coordinator::Coordinator`]
//! is the single entry point a host (CLI, desktop shell, mobile bridge) talks
//! to; every other module is an implementation detail it wires together.
#![warn(missing_docs)]

/// Cross-instance activity log: per-instance append-only files used to
/// discover peer edits and drive the fast-path sync handoff.
pub mod activity_log;

/// Tier 1 sync: tails peer activity logs and hands unresolved work off to
/// the process-wide polling group.
pub mod activity_sync;

/// Binary framing for `.crdtlog` append logs and `.crdtsnapshot` files.
pub mod codec;

/// Per-profile and per-SD configuration, TOML-persisted.
pub mod config;

/// Single process-wide owner tying every other module into the external
/// interface a host calls.
pub mod coordinator;

/// CRDT document algebra built on `yrs`.
pub mod crdt;

/// Cross-instance deletion tombstones.
pub mod deletion_log;

/// Unified error type and its serializable projection.
pub mod error;

/// Filesystem abstraction and the flag-byte readiness protocol.
pub mod fs;

/// Opaque, unbounded-length identifiers (`NoteId`, `FolderId`, `SdId`, ...).
pub mod ids;

/// Content-addressed store for note-attached images.
pub mod image_store;

/// Local SQL mirror of notes/folders/tags/presence for fast queries.
pub mod metadata_cache;

/// Crash-safe state machine for moving a note between Storage Directories.
pub mod note_move;

/// Tier 2 sync: process-wide rate-limited reconciliation poller.
pub mod polling_group;

/// In-memory registry of the SDs this process has mounted.
pub mod sd_registry;

/// SD format version, compatibility checks, and forward migration.
pub mod sd_version;
