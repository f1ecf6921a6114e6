//! Per-channel conversation memory.
//!
//! Each channel keeps a capped, ordered history. Crossing the compaction
//! trigger summarizes the older part of the history in the background;
//! every change marks the channel dirty and schedules one delayed flush
//! that persists all dirty channels at once.
//!
//! Appends land in the order their [`AppendSlot`]s were reserved, even when
//! the first access to a channel has to wait for a snapshot restore.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::compactor::{self, CompactionResult};
use super::entry::ConversationEntry;
use super::errors::CompactionError;
use super::summarizer::Summarizer;
use crate::config::MemoryConfig;
use crate::state::{SharedKvStore, SCOPE_CONVERSATIONS};

#[derive(Default)]
struct ChannelLog {
    entries: VecDeque<ConversationEntry>,
    next_seq: u64,
}

impl ChannelLog {
    fn restored(entries: Vec<ConversationEntry>) -> Self {
        let next_seq = entries.iter().map(|e| e.seq).max().map_or(1, |s| s + 1);
        Self {
            entries: entries.into(),
            next_seq,
        }
    }
}

/// Arrival order of one channel's appends.
#[derive(Default)]
struct AppendOrder {
    issued: u64,
    turn: u64,
    /// Tickets given up before their turn came.
    released: BTreeSet<u64>,
}

impl AppendOrder {
    fn issue(&mut self) -> u64 {
        let ticket = self.issued;
        self.issued += 1;
        ticket
    }

    fn finish(&mut self, ticket: u64) {
        if ticket != self.turn {
            self.released.insert(ticket);
            return;
        }
        self.turn += 1;
        while self.released.remove(&self.turn) {
            self.turn += 1;
        }
    }
}

#[derive(Default)]
struct StoreState {
    channels: HashMap<String, ChannelLog>,
    order: HashMap<String, AppendOrder>,
    dirty: HashSet<String>,
    flush_scheduled: bool,
    compacting: HashSet<String>,
}

struct StoreInner {
    config: MemoryConfig,
    kv: SharedKvStore,
    summarizer: Arc<dyn Summarizer>,
    state: Mutex<StoreState>,
    turns: Notify,
}

/// Bounded, self-compacting conversation history. Cheap to clone.
#[derive(Clone)]
pub struct ConversationStore {
    inner: Arc<StoreInner>,
}

impl ConversationStore {
    pub fn new(config: MemoryConfig, kv: SharedKvStore, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                config,
                kv,
                summarizer,
                state: Mutex::new(StoreState::default()),
                turns: Notify::new(),
            }),
        }
    }

    /// Reserve the next place in `channel`'s append order.
    ///
    /// Never waits, so callers can reserve in the order messages arrive and
    /// append later from concurrent tasks.
    pub fn reserve(&self, channel: &str) -> AppendSlot {
        let ticket = self
            .lock()
            .order
            .entry(channel.to_string())
            .or_default()
            .issue();
        AppendSlot {
            store: self.clone(),
            channel: channel.to_string(),
            ticket,
            used: false,
        }
    }

    /// Append an entry, evicting the oldest beyond the cap.
    ///
    /// Returns the stored entry with its sequence number. Starts a
    /// background compaction when the history reaches the trigger length.
    pub async fn append(&self, channel: &str, entry: ConversationEntry) -> ConversationEntry {
        self.reserve(channel).append(entry).await
    }

    async fn wait_turn(&self, channel: &str, ticket: u64) {
        loop {
            let notified = self.inner.turns.notified();
            let turn = self.lock().order.get(channel).map_or(ticket, |o| o.turn);
            if turn >= ticket {
                return;
            }
            notified.await;
        }
    }

    fn finish_turn(&self, channel: &str, ticket: u64) {
        if let Some(order) = self.lock().order.get_mut(channel) {
            order.finish(ticket);
        }
        self.inner.turns.notify_waiters();
    }

    fn commit(
        &self,
        channel: &str,
        ticket: u64,
        mut entry: ConversationEntry,
    ) -> ConversationEntry {
        let (len, needs_flush) = {
            let mut state = self.lock();
            if let Some(order) = state.order.get_mut(channel) {
                order.finish(ticket);
            }
            let log = state.channels.entry(channel.to_string()).or_default();
            entry.seq = log.next_seq;
            log.next_seq += 1;
            log.entries.push_back(entry.clone());
            while log.entries.len() > self.inner.config.max_entries {
                log.entries.pop_front();
            }
            let len = log.entries.len();
            (len, self.mark_dirty(&mut state, channel))
        };
        self.inner.turns.notify_waiters();

        if needs_flush {
            self.spawn_flush();
        }
        if len >= self.inner.config.compaction_trigger && !self.is_compacting(channel) {
            let store = self.clone();
            let channel = channel.to_string();
            tokio::spawn(async move {
                if let Err(e) = store.compact(&channel).await {
                    if !e.is_skip() {
                        warn!(channel = %channel, error = %e, "Compaction failed; history unchanged");
                    }
                }
            });
        }
        entry
    }

    /// Current history for `channel`, oldest first.
    pub async fn history(&self, channel: &str) -> Vec<ConversationEntry> {
        self.ensure_loaded(channel).await;
        self.lock()
            .channels
            .get(channel)
            .map(|log| log.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, channel: &str) -> usize {
        self.lock()
            .channels
            .get(channel)
            .map_or(0, |log| log.entries.len())
    }

    pub fn is_compacting(&self, channel: &str) -> bool {
        self.lock().compacting.contains(channel)
    }

    /// Summarize all but the most recent entries of `channel`.
    ///
    /// At most one compaction runs per channel. If summarization fails the
    /// history is left exactly as it was.
    pub async fn compact(&self, channel: &str) -> Result<CompactionResult, CompactionError> {
        let entries = {
            let mut state = self.lock();
            if !state.compacting.insert(channel.to_string()) {
                return Err(CompactionError::InProgress(channel.to_string()));
            }
            state
                .channels
                .get(channel)
                .map(|log| log.entries.clone())
                .unwrap_or_default()
        };
        let _guard = CompactionGuard {
            store: self,
            channel,
        };

        let keep_recent = self.inner.config.keep_recent;
        let plan =
            compactor::plan(&entries, keep_recent).ok_or(CompactionError::TooShort {
                len: entries.len(),
                keep_recent,
            })?;

        let summary = self.inner.summarizer.summarize(&plan.older).await?;

        let (result, needs_flush) = {
            let mut state = self.lock();
            let log = state.channels.entry(channel.to_string()).or_default();
            let (rewritten, result) = compactor::splice(
                &log.entries,
                ConversationEntry::summary(summary, plan.cutoff_seq),
            );
            log.entries = rewritten;
            while log.entries.len() > self.inner.config.max_entries {
                log.entries.pop_front();
            }
            (result, self.mark_dirty(&mut state, channel))
        };
        if needs_flush {
            self.spawn_flush();
        }

        info!(
            channel,
            compacted = result.entries_compacted,
            retained = result.entries_retained,
            "Compacted conversation history"
        );
        Ok(result)
    }

    /// Persist every dirty channel now. Returns how many were written.
    ///
    /// Persistence failures are logged and otherwise ignored.
    pub async fn flush_now(&self) -> usize {
        let snapshots: Vec<(String, Vec<ConversationEntry>)> = {
            let mut state = self.lock();
            state.flush_scheduled = false;
            let dirty: Vec<String> = state.dirty.drain().collect();
            dirty
                .into_iter()
                .map(|channel| {
                    let entries = state
                        .channels
                        .get(&channel)
                        .map(|log| log.entries.iter().cloned().collect())
                        .unwrap_or_default();
                    (channel, entries)
                })
                .collect()
        };

        let mut written = 0;
        for (channel, entries) in snapshots {
            let json = match serde_json::to_string(&entries) {
                Ok(json) => json,
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Failed to serialize conversation");
                    continue;
                }
            };
            match self.inner.kv.set(SCOPE_CONVERSATIONS, &channel, &json).await {
                Ok(()) => written += 1,
                Err(e) => warn!(channel = %channel, error = %e, "Failed to persist conversation"),
            }
        }
        if written > 0 {
            debug!(channels = written, "Flushed conversation memory");
        }
        written
    }

    /// Returns true when the caller must schedule a flush.
    fn mark_dirty(&self, state: &mut StoreState, channel: &str) -> bool {
        state.dirty.insert(channel.to_string());
        !std::mem::replace(&mut state.flush_scheduled, true)
    }

    fn spawn_flush(&self) {
        let store = self.clone();
        let delay = self.inner.config.flush_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            store.flush_now().await;
        });
    }

    async fn ensure_loaded(&self, channel: &str) {
        if self.lock().channels.contains_key(channel) {
            return;
        }
        let restored = match self.inner.kv.get(SCOPE_CONVERSATIONS, channel).await {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<ConversationEntry>>(&raw) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(channel, error = %e, "Discarding unreadable conversation snapshot");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(channel, error = %e, "Failed to load conversation snapshot");
                Vec::new()
            }
        };
        if !restored.is_empty() {
            debug!(channel, entries = restored.len(), "Restored conversation");
        }
        self.lock()
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| ChannelLog::restored(restored));
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A reserved place in one channel's append order.
///
/// Dropping a slot without appending gives the place up, so later slots
/// are never blocked by a message that was shed or cancelled.
pub struct AppendSlot {
    store: ConversationStore,
    channel: String,
    ticket: u64,
    used: bool,
}

impl AppendSlot {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Append once every earlier slot on the channel has been used or dropped.
    pub async fn append(mut self, entry: ConversationEntry) -> ConversationEntry {
        self.store.ensure_loaded(&self.channel).await;
        self.store.wait_turn(&self.channel, self.ticket).await;
        self.used = true;
        self.store.commit(&self.channel, self.ticket, entry)
    }
}

impl Drop for AppendSlot {
    fn drop(&mut self) {
        if !self.used {
            self.store.finish_turn(&self.channel, self.ticket);
        }
    }
}

/// Clears the per-channel compaction flag, including on cancellation.
struct CompactionGuard<'a> {
    store: &'a ConversationStore,
    channel: &'a str,
}

impl Drop for CompactionGuard<'_> {
    fn drop(&mut self) {
        self.store.lock().compacting.remove(self.channel);
    }
}
