//! Compaction error taxonomy.

use crate::completion::CompletionError;

/// Why a summary could not be produced.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SummarizationError {
    #[error("summarization request failed: {0}")]
    Completion(#[from] CompletionError),

    #[error("summary was empty")]
    Empty,

    #[error("summarizer unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of a compaction attempt that did not rewrite history.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CompactionError {
    #[error("compaction already running for channel {0}")]
    InProgress(String),

    #[error("nothing to compact: {len} entries, {keep_recent} kept verbatim")]
    TooShort { len: usize, keep_recent: usize },

    #[error(transparent)]
    Summarization(#[from] SummarizationError),
}

impl CompactionError {
    /// Failures that leave history untouched by design rather than by fault.
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::InProgress(_) | Self::TooShort { .. })
    }
}
