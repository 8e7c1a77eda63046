//! Thin wrapper around a `yrs::Doc` used by every persisted CRDT document.
//!
//! Every persisted document treats the CRDT algebra as an opaque "apply
//! update / encode state / subscribe to updates" contract. `yrs` is this
//! crate's concrete choice for that contract; `CrdtDoc` is the seam a
//! different library would be substituted behind.

use std::sync::{Arc, Mutex};

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::error::{Result, SdError};

/// Tag carried alongside an applied update, controlling whether it should
/// re-trigger persistence. Per §4.4: only `Edit` (a change from the owning
/// editor) appends to this instance's log; `Local` (replayed from disk) and
/// `Ipc` (delivered across a process boundary) never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Change made by the owning editor.
    Edit,
    /// Change replayed from disk during load/reload.
    Local,
    /// Change delivered over IPC from another process.
    Ipc,
}

impl UpdateOrigin {
    /// Whether applying an update with this origin should be persisted to
    /// this instance's own log file.
    pub fn persists(self) -> bool {
        matches!(self, UpdateOrigin::Edit)
    }
}

/// Subscriber callback for [`CrdtDoc::observe_updates`].
pub type UpdateCallback = Box<dyn Fn(&[u8], UpdateOrigin) + Send + Sync>;

/// A `yrs::Doc` plus the observer bookkeeping every persisted document needs.
///
/// Observers are plain callbacks rather than `yrs::Subscription`s because
/// origin tagging is domain-specific: `yrs`'s own update event carries no
/// notion of edit-vs-replay, so `CrdtDoc` notifies subscribers itself after
/// every successful `apply_update`.
pub struct CrdtDoc {
    doc: Doc,
    observers: Arc<Mutex<Vec<UpdateCallback>>>,
}

impl CrdtDoc {
    /// Create a fresh, empty document.
    pub fn new() -> Self {
        Self {
            doc: Doc::new(),
            observers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Borrow the underlying `yrs::Doc` for type-specific shared structures
    /// (`get_or_insert_text`, `get_or_insert_map`, ...).
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Decode and apply an update, notifying subscribers with `origin`.
    /// Callers decide separately whether `origin` warrants persistence.
    pub fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<()> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| SdError::Internal(format!("invalid CRDT update: {e}")))?;
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| SdError::Internal(format!("failed to apply CRDT update: {e}")))?;
        }
        let observers = self.observers.lock().unwrap();
        for cb in observers.iter() {
            cb(update, origin);
        }
        Ok(())
    }

    /// Encode the full document state as a single update, for snapshotting
    /// and cross-process IPC.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode the current state vector, for computing a diff against a peer.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode the update needed to bring a peer at `remote_state_vector` up
    /// to date with this document.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| SdError::Internal(format!("invalid state vector: {e}")))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Register a subscriber, notified on every future `apply_update` call.
    pub fn observe_updates(&self, callback: UpdateCallback) {
        self.observers.lock().unwrap().push(callback);
    }
}

impl Default for CrdtDoc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_docs_converge_after_exchanging_updates() {
        let a = CrdtDoc::new();
        let b = CrdtDoc::new();

        let text_a = a.doc().get_or_insert_text("content");
        let text_b = b.doc().get_or_insert_text("content");

        {
            let mut txn = a.doc().transact_mut();
            text_a.insert(&mut txn, 0, "hello");
        }
        {
            let mut txn = b.doc().transact_mut();
            text_b.insert(&mut txn, 0, "world");
        }

        let update_from_a = a.encode_state_as_update();
        let update_from_b = b.encode_state_as_update();

        b.apply_update(&update_from_a, UpdateOrigin::Local).unwrap();
        a.apply_update(&update_from_b, UpdateOrigin::Local).unwrap();

        assert_eq!(a.encode_state_as_update(), b.encode_state_as_update());
    }

    #[test]
    fn observers_receive_origin() {
        let doc = CrdtDoc::new();
        let text = doc.doc().get_or_insert_text("content");
        let other = CrdtDoc::new();
        let other_text = other.doc().get_or_insert_text("content");
        {
            let mut txn = other.doc().transact_mut();
            other_text.insert(&mut txn, 0, "hi");
        }
        let update = other.encode_state_as_update();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        doc.observe_updates(Box::new(move |_u, origin| {
            seen2.lock().unwrap().push(origin);
        }));

        doc.apply_update(&update, UpdateOrigin::Edit).unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), &[UpdateOrigin::Edit]);
        let _ = text;
    }
}
