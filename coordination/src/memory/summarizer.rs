//! Summarizers used by conversation compaction.
//!
//! [`CompletionSummarizer`] asks the completion API directly rather than
//! through the request queue, so compaction neither competes for the single
//! completion slot nor counts toward the circuit breaker.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing::debug;

use super::entry::ConversationEntry;
use super::errors::SummarizationError;
use crate::completion::{ChatTurn, CompletionRequest, SharedCompletionClient};

const SUMMARY_INSTRUCTIONS: &str = "You condense chat history for an agent's memory. \
Summarize the conversation below in at most a few short paragraphs. Keep every decision, \
proposal, address, amount and open question. Do not add commentary.";

#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Produce a summary of `entries`, oldest first.
    async fn summarize(&self, entries: &[ConversationEntry]) -> Result<String, SummarizationError>;
}

/// Summarizer backed by the completion API.
pub struct CompletionSummarizer {
    client: SharedCompletionClient,
    max_tokens: u32,
}

impl CompletionSummarizer {
    pub fn new(client: SharedCompletionClient, max_tokens: u32) -> Self {
        Self { client, max_tokens }
    }

    fn request_for(&self, entries: &[ConversationEntry]) -> CompletionRequest {
        let transcript = entries
            .iter()
            .map(ConversationEntry::transcript_line)
            .collect::<Vec<_>>()
            .join("\n");
        CompletionRequest::new(vec![
            ChatTurn::system(SUMMARY_INSTRUCTIONS),
            ChatTurn::user(transcript),
        ])
        .with_max_tokens(self.max_tokens)
    }
}

#[async_trait]
impl Summarizer for CompletionSummarizer {
    async fn summarize(&self, entries: &[ConversationEntry]) -> Result<String, SummarizationError> {
        let request = self.request_for(entries);
        let summary = self.client.complete(&request).await?;
        let summary = summary.trim();
        if summary.is_empty() {
            return Err(SummarizationError::Empty);
        }
        debug!(
            entries = entries.len(),
            chars = summary.len(),
            "Summarized conversation slice"
        );
        Ok(summary.to_string())
    }
}

/// Deterministic summarizer for tests and offline simulation.
///
/// Joins the speakers and first words of each entry.
#[derive(Default)]
pub struct MockSummarizer {
    pub should_fail: bool,
    calls: AtomicUsize,
}

impl MockSummarizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A summarizer whose every call fails.
    pub fn failing() -> Self {
        Self {
            should_fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Summarizer for MockSummarizer {
    async fn summarize(&self, entries: &[ConversationEntry]) -> Result<String, SummarizationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.should_fail {
            return Err(SummarizationError::Unavailable(
                "mock summarizer configured to fail".into(),
            ));
        }
        let gist = entries
            .iter()
            .map(|e| {
                let head: Vec<&str> = e.text.split_whitespace().take(3).collect();
                format!("{} said {}", e.identity_label, head.join(" "))
            })
            .collect::<Vec<_>>()
            .join("; ");
        Ok(format!("{} entries: {gist}", entries.len()))
    }
}
