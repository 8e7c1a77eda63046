//! Tier 2 process-wide reconciler (§4.9).
//!
//! Where [`crate::activity_sync::ActivitySync`] is a per-note fast path, the
//! `PollingGroup` is the single process-wide fallback: a rate-limited queue
//! of `(noteId, sdId)` entries, each polled until its reason's exit
//! criterion is met, drained through a token bucket shared across every SD
//! so one busy SD can't starve the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::ids::{InstanceId, NoteId, SdId};

/// Why an entry was added to the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollReason {
    /// Tier 1 gave up (timeout or sequence gap) and handed the note here.
    FastPathHandoff,
    /// The note is currently open in a UI.
    OpenNote,
    /// The note is visible in a notes list but not open.
    NotesList,
    /// The note was edited recently enough to warrant elevated attention.
    RecentEdit,
    /// Periodic whole-SD sweep.
    FullRepoll,
}

/// Scheduling priority. `High` entries are served from a reserved slice of
/// the token bucket so `Normal` entries never fully starve them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Normal,
}

impl PollReason {
    fn priority(self) -> Priority {
        match self {
            PollReason::OpenNote | PollReason::FastPathHandoff => Priority::High,
            PollReason::NotesList | PollReason::RecentEdit | PollReason::FullRepoll => Priority::Normal,
        }
    }
}

/// Tunable rate-limiting and sweep settings (§4.9's settings table).
#[derive(Debug, Clone, Copy)]
pub struct PollingSettings {
    /// Overall poll budget across every SD.
    pub poll_rate_per_minute: u32,
    /// Fraction of a full token a *hit* poll costs (refunded back into the
    /// bucket via [`PollingGroup::mark_polled`]'s `hit` flag once the poll's
    /// outcome is known). A poll that turns out to be a miss still costs a
    /// full token; hits are cheaper so a note mid-active-sync gets reloaded
    /// faster instead of waiting out the same budget as cold entries.
    pub hit_rate_multiplier: f64,
    /// Hard ceiling on tokens released within any one second.
    pub max_burst_per_second: u32,
    /// Fraction of the bucket reserved exclusively for `Normal` priority
    /// entries so `High` priority traffic can't monopolize it.
    pub normal_priority_reserve: f64,
    /// Interval between full-SD sweeps; `None` disables periodic sweeping.
    pub full_repoll_interval: Option<Duration>,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            poll_rate_per_minute: 120,
            hit_rate_multiplier: 0.25,
            max_burst_per_second: 10,
            normal_priority_reserve: 0.2,
            full_repoll_interval: Some(Duration::from_secs(30 * 60)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollEntry {
    pub note_id: NoteId,
    pub sd_id: SdId,
    pub expected_sequences: HashMap<InstanceId, u64>,
    pub added_at: Instant,
    pub last_polled_at: Option<Instant>,
    pub reason: PollReason,
    pub priority: Priority,
}

/// Simple token-bucket limiter: tokens accrue continuously up to the burst
/// cap. A full token is charged up front on every admitted poll; a
/// subsequent [`TokenBucket::refund`] gives part of it back when that poll
/// turns out to be a hit, so the *net* cost of a hit is
/// `1.0 - hit_rate_multiplier` less than a miss (§4.9).
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_minute: u32, burst_cap: u32) -> Self {
        Self {
            tokens: burst_cap as f64,
            capacity: burst_cap as f64,
            refill_per_sec: rate_per_minute as f64 / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Credit part of a previously-taken token back, capped at capacity.
    fn refund(&mut self, amount: f64) {
        self.tokens = (self.tokens + amount).min(self.capacity);
    }
}

/// Process-wide Tier 2 reconciler.
pub struct PollingGroup {
    settings: Mutex<PollingSettings>,
    entries: Mutex<HashMap<(SdId, NoteId), PollEntry>>,
    high_bucket: Mutex<TokenBucket>,
    normal_bucket: Mutex<TokenBucket>,
}

impl PollingGroup {
    /// Build a polling group with the given settings.
    pub fn new(settings: PollingSettings) -> Self {
        let normal_rate = settings.poll_rate_per_minute as f64 * settings.normal_priority_reserve;
        let high_rate = settings.poll_rate_per_minute as f64 - normal_rate;
        let normal_burst = ((settings.max_burst_per_second as f64) * settings.normal_priority_reserve).max(1.0) as u32;
        let high_burst = settings.max_burst_per_second.saturating_sub(normal_burst).max(1);
        Self {
            high_bucket: Mutex::new(TokenBucket::new(high_rate.round() as u32, high_burst)),
            normal_bucket: Mutex::new(TokenBucket::new(normal_rate.round() as u32, normal_burst)),
            settings: Mutex::new(settings),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Current settings.
    pub async fn settings(&self) -> PollingSettings {
        *self.settings.lock().await
    }

    /// Replace settings at runtime (`polling.setSettings`).
    pub async fn set_settings(&self, settings: PollingSettings) {
        *self.settings.lock().await = settings;
    }

    /// Add or refresh an entry (idempotent: a higher-priority reason
    /// replaces a lower one, a lower-priority one never downgrades an
    /// existing high-priority entry).
    pub async fn add_entry(&self, sd_id: SdId, note_id: NoteId, expected: HashMap<InstanceId, u64>, reason: PollReason) {
        let mut entries = self.entries.lock().await;
        let key = (sd_id.clone(), note_id.clone());
        let priority = reason.priority();
        match entries.get_mut(&key) {
            Some(existing) if existing.priority == Priority::High && priority == Priority::Normal => {
                for (peer, seq) in expected {
                    existing.expected_sequences.entry(peer).and_modify(|e| *e = (*e).max(seq)).or_insert(seq);
                }
            }
            Some(existing) => {
                for (peer, seq) in expected {
                    existing.expected_sequences.entry(peer).and_modify(|e| *e = (*e).max(seq)).or_insert(seq);
                }
                existing.reason = reason;
                existing.priority = priority;
            }
            None => {
                entries.insert(
                    key,
                    PollEntry {
                        note_id,
                        sd_id,
                        expected_sequences: expected,
                        added_at: Instant::now(),
                        last_polled_at: None,
                        reason,
                        priority,
                    },
                );
            }
        }
    }

    /// Remove an entry once its exit criterion is satisfied.
    pub async fn remove_entry(&self, sd_id: &SdId, note_id: &NoteId) {
        self.entries.lock().await.remove(&(sd_id.clone(), note_id.clone()));
    }

    /// Current queue size, for memory-bound monitoring. §4.9 expects a
    /// warning logged once this crosses roughly 10x the steady-state
    /// estimate (~200 bytes/entry, so 10,000 entries ≈ 2MB).
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether the queue size warrants a memory-pressure warning.
    pub async fn is_over_memory_bound(&self) -> bool {
        self.len().await > 10_000
    }

    /// Drain up to the current token budget's worth of entries ready to be
    /// polled, highest priority first, oldest-`last_polled_at` first within
    /// a priority tier. Callers poll the returned entries and then call
    /// [`PollingGroup::remove_entry`] or leave them for the next drain.
    pub async fn drain_ready(&self, now: Instant) -> Vec<PollEntry> {
        let mut entries: Vec<PollEntry> = self.entries.lock().await.values().cloned().collect();
        entries.sort_by(|a, b| {
            b.priority_rank().cmp(&a.priority_rank()).then_with(|| {
                a.last_polled_at.unwrap_or(a.added_at).cmp(&b.last_polled_at.unwrap_or(b.added_at))
            })
        });

        let mut ready = Vec::new();
        let mut high_bucket = self.high_bucket.lock().await;
        let mut normal_bucket = self.normal_bucket.lock().await;
        for entry in entries {
            let admitted = match entry.priority {
                Priority::High => high_bucket.try_take(now),
                Priority::Normal => normal_bucket.try_take(now),
            };
            if admitted {
                ready.push(entry);
            }
        }
        ready
    }

    /// Mark an entry as just having been polled (updates ordering for the
    /// next `drain_ready` call) and record whether the poll was a hit. A hit
    /// refunds `1.0 - hit_rate_multiplier` back into the bucket it was
    /// admitted from, so a note mid-active-sync gets reloaded on a tighter
    /// budget than one that keeps missing.
    pub async fn mark_polled(&self, sd_id: &SdId, note_id: &NoteId, when: Instant, hit: bool) {
        let priority = {
            let mut entries = self.entries.lock().await;
            entries.get_mut(&(sd_id.clone(), note_id.clone())).map(|entry| {
                entry.last_polled_at = Some(when);
                entry.priority
            })
        };

        let Some(priority) = priority else { return };
        if !hit {
            return;
        }

        let multiplier = self.settings.lock().await.hit_rate_multiplier;
        let refund = (1.0 - multiplier).max(0.0);
        match priority {
            Priority::High => self.high_bucket.lock().await.refund(refund),
            Priority::Normal => self.normal_bucket.lock().await.refund(refund),
        }
    }

    /// Queue a startup or periodic full-repoll sweep for every note in an
    /// SD's `notes/` directory.
    pub async fn queue_full_repoll(&self, sd_id: SdId, note_ids: impl IntoIterator<Item = NoteId>) {
        for note_id in note_ids {
            self.add_entry(sd_id.clone(), note_id, HashMap::new(), PollReason::FullRepoll).await;
        }
    }
}

impl PollEntry {
    fn priority_rank(&self) -> u8 {
        match self.priority {
            Priority::High => 1,
            Priority::Normal => 0,
        }
    }
}
