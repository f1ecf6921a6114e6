//! History rewrite around summary entries.
//!
//! Compaction is split into a pure plan (which entries get summarized) and a
//! pure splice (how the summary replaces them). Neither step touches locks or
//! awaits, so the store can snapshot, summarize outside the lock, and splice
//! against whatever the history looks like by the time the summary arrives.

use std::collections::VecDeque;

use serde::Serialize;

use super::entry::ConversationEntry;

/// Entries selected for summarization.
#[derive(Debug, Clone)]
pub struct CompactionPlan {
    pub older: Vec<ConversationEntry>,
    /// Highest sequence number covered by the summary.
    pub cutoff_seq: u64,
}

/// What a completed compaction did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompactionResult {
    pub entries_compacted: usize,
    pub entries_retained: usize,
}

/// Select everything except the most recent `keep_recent` entries.
pub fn plan(entries: &VecDeque<ConversationEntry>, keep_recent: usize) -> Option<CompactionPlan> {
    if entries.len() <= keep_recent {
        return None;
    }
    let split = entries.len() - keep_recent;
    let older: Vec<ConversationEntry> = entries.iter().take(split).cloned().collect();
    let cutoff_seq = older.last()?.seq;
    Some(CompactionPlan { older, cutoff_seq })
}

/// Replace every entry at or below the cutoff with `summary`.
///
/// Entries appended after the plan was taken have higher sequence numbers
/// and survive untouched.
pub fn splice(
    current: &VecDeque<ConversationEntry>,
    summary: ConversationEntry,
) -> (VecDeque<ConversationEntry>, CompactionResult) {
    let cutoff = summary.seq;
    let mut rewritten = VecDeque::with_capacity(current.len());
    rewritten.push_back(summary);
    let mut compacted = 0;
    for entry in current {
        if entry.seq > cutoff {
            rewritten.push_back(entry.clone());
        } else {
            compacted += 1;
        }
    }
    let result = CompactionResult {
        entries_compacted: compacted,
        entries_retained: rewritten.len() - 1,
    };
    (rewritten, result)
}
