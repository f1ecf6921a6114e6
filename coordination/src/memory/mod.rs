//! Conversation memory.
//!
//! Bounded per-channel history with debounced persistence and lossy
//! compaction into summary entries.
//!
//! # Modules
//!
//! - [`entry`]: ConversationEntry and its rendering as completion turns
//! - [`store`]: ConversationStore: cap, lazy restore, debounced flush
//! - [`compactor`]: pure plan/splice steps of a compaction
//! - [`summarizer`]: Summarizer trait, completion-backed and mock implementations
//! - [`errors`]: typed compaction and summarization failures

pub mod compactor;
pub mod entry;
pub mod errors;
pub mod store;
pub mod summarizer;

pub use compactor::CompactionResult;
pub use entry::{ConversationEntry, SUMMARY_LABEL};
pub use errors::{CompactionError, SummarizationError};
pub use store::{AppendSlot, ConversationStore};
pub use summarizer::{CompletionSummarizer, MockSummarizer, Summarizer};
