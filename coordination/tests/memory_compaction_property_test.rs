//! Conversation memory property tests: invariants of capping, compaction
//! and persistence across varied append volumes.
//!
//! Tests verify:
//! - History never exceeds the cap
//! - A summary, when present, is always first and unique
//! - Sequence numbers stay strictly increasing
//! - Failed summarization never alters history
//! - Persisted snapshots restore into a fresh store

use std::sync::Arc;

use coordination::config::MemoryConfig;
use coordination::memory::{ConversationEntry, ConversationStore, MockSummarizer};
use coordination::state::SCOPE_CONVERSATIONS;
use coordination::{KvStore, MemoryKvStore};

fn new_store(summarizer: MockSummarizer) -> (ConversationStore, Arc<MemoryKvStore>) {
    let kv = Arc::new(MemoryKvStore::new());
    let store = ConversationStore::new(MemoryConfig::default(), kv.clone(), Arc::new(summarizer));
    (store, kv)
}

async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

async fn fill(store: &ConversationStore, channel: &str, count: usize) {
    for i in 0..count {
        let entry = if i % 2 == 0 {
            ConversationEntry::user("founder", format!("question {i}"))
        } else {
            ConversationEntry::assistant("arbiter", format!("answer {i}"))
        };
        store.append(channel, entry).await;
        settle().await;
    }
}

// ── Property: cap, summary placement, ordering ─────────────────────

#[tokio::test(start_paused = true)]
async fn prop_history_shape_holds_for_any_volume() {
    for count in [1, 10, 19, 20, 21, 35, 60, 120] {
        let (store, _) = new_store(MockSummarizer::new());
        fill(&store, "general", count).await;

        let history = store.history("general").await;
        assert!(history.len() <= 25, "count={count} len={}", history.len());

        let summaries = history.iter().filter(|e| e.is_summary()).count();
        assert!(summaries <= 1, "count={count} summaries={summaries}");
        if summaries == 1 {
            assert!(history[0].is_summary(), "count={count}");
        }

        for pair in history.windows(2) {
            assert!(pair[0].seq < pair[1].seq, "count={count}");
        }

        // The newest entry always survives.
        let last = history.last().unwrap();
        assert!(last.text.ends_with(&(count - 1).to_string()), "count={count}");
    }
}

#[tokio::test(start_paused = true)]
async fn prop_below_trigger_nothing_is_summarized() {
    for count in [1, 5, 19] {
        let summarizer = Arc::new(MockSummarizer::new());
        let kv = Arc::new(MemoryKvStore::new());
        let store = ConversationStore::new(MemoryConfig::default(), kv, summarizer.clone());
        fill(&store, "general", count).await;

        assert_eq!(store.history("general").await.len(), count);
        assert_eq!(summarizer.calls(), 0);
    }
}

// ── Property: failed summarization is invisible ────────────────────

#[tokio::test(start_paused = true)]
async fn prop_failed_summaries_only_cap() {
    for count in [20, 25, 40] {
        let (store, _) = new_store(MockSummarizer::failing());
        fill(&store, "general", count).await;

        let history = store.history("general").await;
        assert_eq!(history.len(), count.min(25));
        assert!(history.iter().all(|e| !e.is_summary()));
        assert!(!store.is_compacting("general"));
    }
}

// ── Property: channels are independent ─────────────────────────────

#[tokio::test(start_paused = true)]
async fn prop_channels_do_not_share_history() {
    let (store, _) = new_store(MockSummarizer::new());
    fill(&store, "general", 22).await;
    fill(&store, "treasury", 3).await;

    assert_eq!(store.history("treasury").await.len(), 3);
    assert!(store.history("general").await[0].is_summary());
    assert!(store
        .history("treasury")
        .await
        .iter()
        .all(|e| !e.is_summary()));
}

// ── Property: persistence round trip ───────────────────────────────

#[tokio::test(start_paused = true)]
async fn prop_flushed_history_restores_in_a_fresh_store() {
    let (first, kv) = new_store(MockSummarizer::new());
    fill(&first, "general", 30).await;
    let expected = first.history("general").await;
    first.flush_now().await;
    assert!(kv
        .get(SCOPE_CONVERSATIONS, "general")
        .await
        .unwrap()
        .is_some());

    let second = ConversationStore::new(
        MemoryConfig::default(),
        kv.clone(),
        Arc::new(MockSummarizer::new()),
    );
    assert_eq!(second.history("general").await, expected);

    // Sequence numbering continues after a restore.
    let appended = second
        .append("general", ConversationEntry::user("founder", "after restart"))
        .await;
    assert!(appended.seq > expected.last().unwrap().seq);
}
