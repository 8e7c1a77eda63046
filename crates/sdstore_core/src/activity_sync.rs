//! Tier 1 "fast path" cross-instance sync (§4.8).
//!
//! Tails every peer's `activity/<id>.log`, tracks the highest sequence each
//! peer claims to have written per note, and retries a bounded number of
//! times before handing an entry off to [`crate::polling_group::PollingGroup`]
//! (Tier 2) rather than retrying forever.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::activity_log::ActivityLog;
use crate::codec::log_codec;
use crate::error::Result;
use crate::fs::FileSystemAdapter;
use crate::ids::{InstanceId, NoteId};

/// Exponential backoff schedule for `pollAndReload` attempts, in
/// milliseconds, per §4.8.
pub const BACKOFF_SCHEDULE_MS: &[u64] = &[100, 200, 500, 1000, 2000, 3000, 5000, 7000, 10000, 15000, 30000];

/// Past this many missing sequences, an entry is "likely will never arrive"
/// on the fast path and is hand off to Tier 2 instead of retried
/// indefinitely.
pub const SEQUENCE_GAP_THRESHOLD: u64 = 50;

/// Cumulative delay past which an entry hands off to Tier 2 even if it
/// hasn't exhausted [`SEQUENCE_GAP_THRESHOLD`].
pub const DEFAULT_FAST_PATH_MAX_DELAY: Duration = Duration::from_secs(60);

/// Callback invoked once all of a note's outstanding peer expectations are
/// satisfied.
pub type ReloadCallback = Arc<dyn Fn(&NoteId) + Send + Sync>;

/// Callback invoked when an entry exceeds [`ActivitySync::fast_path_max_delay`]
/// or [`SEQUENCE_GAP_THRESHOLD`] and must continue on Tier 2.
pub type HandoffCallback = Arc<dyn Fn(NoteId, HashMap<InstanceId, u64>) + Send + Sync>;

#[derive(Default, Clone)]
struct PeerState {
    watermark: u64,
}

struct NoteExpectation {
    expected: HashMap<InstanceId, u64>,
    first_seen: std::time::Instant,
    attempts: usize,
}

/// Per-SD Tier 1 reconciler.
pub struct ActivitySync {
    fs: Arc<dyn FileSystemAdapter>,
    activity_log: Arc<ActivityLog>,
    own_instance_id: InstanceId,
    fast_path_max_delay: Duration,
    peers: Mutex<HashMap<InstanceId, PeerState>>,
    notes: Mutex<HashMap<NoteId, NoteExpectation>>,
}

impl ActivitySync {
    /// Build a Tier 1 reconciler for one SD.
    pub fn new(fs: Arc<dyn FileSystemAdapter>, activity_log: Arc<ActivityLog>, own_instance_id: InstanceId) -> Self {
        Self {
            fs,
            activity_log,
            own_instance_id,
            fast_path_max_delay: DEFAULT_FAST_PATH_MAX_DELAY,
            peers: Mutex::new(HashMap::new()),
            notes: Mutex::new(HashMap::new()),
        }
    }

    /// Override `fastPathMaxDelay` (default 60s).
    pub fn with_fast_path_max_delay(mut self, delay: Duration) -> Self {
        self.fast_path_max_delay = delay;
        self
    }

    /// Read new bytes past each peer's watermark, updating `expectedSequences`
    /// for the notes referenced. Call on a file-watcher event or on interest.
    pub async fn ingest_activity(&self) -> Result<()> {
        let instances = self.activity_log.list_instances().await?;
        for peer in instances {
            // Own-file skipping: compare the parsed instance id, not a
            // filename prefix (filenames like "<id>_<id>.log" make a
            // substring check wrong).
            if peer == self.own_instance_id {
                self.skip_stale_self_entries(&peer).await?;
                continue;
            }
            self.ingest_peer(&peer).await?;
        }
        Ok(())
    }

    async fn ingest_peer(&self, peer: &InstanceId) -> Result<()> {
        let watermark = {
            let peers = self.peers.lock().await;
            peers.get(peer).cloned().unwrap_or_default().watermark
        };
        let (records, new_watermark) = self.activity_log.read_new(peer, watermark).await?;

        let mut notes = self.notes.lock().await;
        for record in &records {
            let entry = notes.entry(record.note_id.clone()).or_insert_with(|| NoteExpectation {
                expected: HashMap::new(),
                first_seen: std::time::Instant::now(),
                attempts: 0,
            });
            entry.expected.insert(record.instance_id.clone(), record.sequence);
        }
        drop(notes);

        let mut peers = self.peers.lock().await;
        peers.entry(peer.clone()).or_default().watermark = new_watermark;
        Ok(())
    }

    /// A crash can leave a stale pointer-to-self in our own activity file.
    /// If the referenced sequence already exists on disk we skip it; if it
    /// references a sequence we never produced we self-heal by advancing
    /// past it rather than blocking.
    async fn skip_stale_self_entries(&self, own: &InstanceId) -> Result<()> {
        let watermark = {
            let peers = self.peers.lock().await;
            peers.get(own).cloned().unwrap_or_default().watermark
        };
        let (_records, new_watermark) = self.activity_log.read_new(own, watermark).await?;
        let mut peers = self.peers.lock().await;
        peers.entry(own.clone()).or_default().watermark = new_watermark;
        Ok(())
    }

    /// Attempt to satisfy every outstanding expectation for `note_id` on
    /// the fast path. Returns `true` if the note was reloaded (all peers
    /// caught up), `false` if it was handed off to Tier 2, and leaves the
    /// entry in place (to retry on the next call) otherwise.
    pub async fn poll_and_reload(
        &self,
        note_id: &NoteId,
        note_logs_dir: impl Fn(&InstanceId) -> std::path::PathBuf,
        on_reload: &ReloadCallback,
        on_handoff: &HandoffCallback,
    ) -> Result<bool> {
        let (expected, elapsed, attempts) = {
            let notes = self.notes.lock().await;
            match notes.get(note_id) {
                Some(entry) => (entry.expected.clone(), entry.first_seen.elapsed(), entry.attempts),
                None => return Ok(true),
            }
        };

        if elapsed >= self.fast_path_max_delay {
            self.notes.lock().await.remove(note_id);
            on_handoff(note_id.clone(), expected);
            return Ok(false);
        }

        let mut all_satisfied = true;
        let mut worst_gap = 0u64;
        for (peer, expected_seq) in &expected {
            let path = note_logs_dir(peer);
            let highest = self.highest_sequence_in_dir(&path, peer).await?;
            if highest < *expected_seq {
                all_satisfied = false;
                worst_gap = worst_gap.max(expected_seq - highest);
            }
        }

        if all_satisfied {
            self.notes.lock().await.remove(note_id);
            on_reload(note_id);
            return Ok(true);
        }

        if worst_gap > SEQUENCE_GAP_THRESHOLD {
            self.notes.lock().await.remove(note_id);
            on_handoff(note_id.clone(), expected);
            return Ok(false);
        }

        let mut notes = self.notes.lock().await;
        if let Some(entry) = notes.get_mut(note_id) {
            entry.attempts = attempts + 1;
        }
        Ok(false)
    }

    /// Notes with at least one outstanding peer expectation, i.e. every note
    /// a caller should drive through [`ActivitySync::poll_and_reload`].
    pub async fn pending_notes(&self) -> Vec<NoteId> {
        self.notes.lock().await.keys().cloned().collect()
    }

    /// The backoff delay for a given attempt count, clamped to the last
    /// schedule entry for anything beyond it.
    pub fn backoff_for_attempt(attempt: usize) -> Duration {
        let ms = BACKOFF_SCHEDULE_MS.get(attempt).copied().unwrap_or(*BACKOFF_SCHEDULE_MS.last().unwrap());
        Duration::from_millis(ms)
    }

    async fn highest_sequence_in_dir(&self, logs_dir: &std::path::Path, peer: &InstanceId) -> Result<u64> {
        let names = self.fs.list_dir(logs_dir).await?;
        let prefix = format!("{peer}_");
        let mut highest = 0u64;
        for name in names {
            if !name.starts_with(&prefix) || !name.ends_with(".crdtlog") {
                continue;
            }
            let path = logs_dir.join(&name);
            let bytes = self.fs.read_file(&path).await?;
            let read = log_codec::read_all(&path, &bytes);
            if let Some(max_seq) = read.records.iter().map(|r| r.sequence).max() {
                highest = highest.max(max_seq);
            }
        }
        Ok(highest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::log_codec::{encode_header, encode_record};
    use crate::fs::MemoryFsAdapter;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn satisfied_expectation_triggers_reload() {
        let fs = Arc::new(MemoryFsAdapter::new());
        let sd_path = std::path::PathBuf::from("/sd");
        let activity = Arc::new(ActivityLog::new(fs.clone(), sd_path.clone()));
        let own = InstanceId::from_raw("me");
        let peer = InstanceId::from_raw("peer");
        let note = NoteId::generate();

        activity.append(&note, &peer, 1).await.unwrap();
        let sync = ActivitySync::new(fs.clone(), activity.clone(), own);
        sync.ingest_activity().await.unwrap();

        let logs_dir = sd_path.join("notes").join(note.as_str()).join("logs");
        let peer_log = logs_dir.join(format!("{peer}_1000.crdtlog"));
        let mut bytes = encode_header();
        bytes.extend_from_slice(&encode_record(1, 1, b"update"));
        fs.write_file(&peer_log, &bytes).await.unwrap();

        let reloaded = Arc::new(AtomicBool::new(false));
        let reloaded2 = reloaded.clone();
        let on_reload: ReloadCallback = Arc::new(move |_| reloaded2.store(true, Ordering::SeqCst));
        let on_handoff: HandoffCallback = Arc::new(|_, _| {});

        let result = sync
            .poll_and_reload(&note, |_peer| logs_dir.clone(), &on_reload, &on_handoff)
            .await
            .unwrap();
        assert!(result);
        assert!(reloaded.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn excessive_gap_hands_off_immediately() {
        let fs = Arc::new(MemoryFsAdapter::new());
        let sd_path = std::path::PathBuf::from("/sd");
        let activity = Arc::new(ActivityLog::new(fs.clone(), sd_path.clone()));
        let own = InstanceId::from_raw("me");
        let peer = InstanceId::from_raw("peer");
        let note = NoteId::generate();

        activity.append(&note, &peer, 1000).await.unwrap();
        let sync = ActivitySync::new(fs.clone(), activity.clone(), own);
        sync.ingest_activity().await.unwrap();

        let logs_dir = sd_path.join("notes").join(note.as_str()).join("logs");
        let handed_off = Arc::new(AtomicBool::new(false));
        let handed_off2 = handed_off.clone();
        let on_reload: ReloadCallback = Arc::new(|_| {});
        let on_handoff: HandoffCallback = Arc::new(move |_, _| handed_off2.store(true, Ordering::SeqCst));

        let result = sync
            .poll_and_reload(&note, |_peer| logs_dir.clone(), &on_reload, &on_handoff)
            .await
            .unwrap();
        assert!(!result);
        assert!(handed_off.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn own_instance_files_are_skipped_not_substring_matched() {
        let fs = Arc::new(MemoryFsAdapter::new());
        let sd_path = std::path::PathBuf::from("/sd");
        let activity = Arc::new(ActivityLog::new(fs.clone(), sd_path.clone()));
        // A filename that would falsely match a naive "starts_with(own)" check.
        let own = InstanceId::from_raw("peerId");
        let note = NoteId::generate();
        activity.append(&note, &own, 1).await.unwrap();

        let sync = ActivitySync::new(fs.clone(), activity.clone(), own);
        sync.ingest_activity().await.unwrap();
        assert!(sync.notes.lock().await.is_empty());
    }

    #[test]
    fn backoff_schedule_clamps_past_the_end() {
        assert_eq!(ActivitySync::backoff_for_attempt(0), Duration::from_millis(100));
        assert_eq!(ActivitySync::backoff_for_attempt(1000), Duration::from_millis(30000));
    }
}
