//! Shared chat channel seam.
//!
//! Agents never talk to each other directly. Everything they agree on flows
//! through posts and annotations on a shared, append-only channel. The
//! transport itself is external; [`local`] provides an in-process hub for
//! tests and local simulation.

pub mod local;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub use local::{LocalChannel, LocalChannelHub};

/// Annotation symbols with protocol meaning.
pub mod symbols {
    /// Approve a proposal.
    pub const APPROVE: &str = "✅";
    /// Deny a proposal.
    pub const DENY: &str = "❌";
    /// The agent is shedding load; try again later.
    pub const BUSY: &str = "⏳";
}

/// Error type for channel operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("channel not found: {0}")]
    NotFound(String),

    #[error("delivery to {channel} failed: {reason}")]
    Delivery { channel: String, reason: String },

    #[error("message not found: {0}")]
    MessageNotFound(String),
}

/// Resolved destination for posts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelHandle {
    pub channel_id: String,
}

/// Address of a posted message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageHandle {
    pub channel_id: String,
    pub message_id: String,
}

/// A message observed on the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub handle: MessageHandle,
    pub author: String,
    pub content: String,
    /// Identities mentioned with `@name`.
    pub mentions: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    pub fn mentions(&self, identity: &str) -> bool {
        self.mentions.iter().any(|m| m == identity)
    }
}

/// An annotation added to, or withdrawn from, a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationEvent {
    pub handle: MessageHandle,
    pub author: String,
    pub symbol: String,
    /// `false` when the annotation was withdrawn.
    pub added: bool,
}

/// Inbound channel traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelEvent {
    Message(InboundMessage),
    Annotation(AnnotationEvent),
}

/// A participant's view of the shared channel.
#[async_trait]
pub trait ChatChannel: Send + Sync {
    /// Identity this view posts and annotates as.
    fn identity(&self) -> &str;

    /// Resolve a channel id to a postable handle.
    async fn fetch(&self, channel_id: &str) -> Result<ChannelHandle, ChannelError>;

    /// Post `content` and return the new message's handle.
    async fn post(
        &self,
        channel: &ChannelHandle,
        content: &str,
    ) -> Result<MessageHandle, ChannelError>;

    /// Add an annotation to a message.
    async fn annotate(&self, message: &MessageHandle, symbol: &str) -> Result<(), ChannelError>;

    /// Subscribe to all inbound events, including this participant's own.
    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent>;
}

/// Collect `@name` mentions from message text.
pub fn parse_mentions(content: &str) -> Vec<String> {
    let mut mentions: Vec<String> = content
        .split_whitespace()
        .filter_map(|word| word.strip_prefix('@'))
        .map(|name| {
            name.trim_end_matches(|c: char| !c.is_alphanumeric() && c != '_' && c != '-')
                .to_string()
        })
        .filter(|name| !name.is_empty())
        .collect();
    mentions.sort();
    mentions.dedup();
    mentions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mentions() {
        assert_eq!(
            parse_mentions("@sentinel and @arbiter, please check @sentinel."),
            vec!["arbiter".to_string(), "sentinel".to_string()]
        );
        assert!(parse_mentions("email me at a@b.c or @ alone").is_empty());
    }

    #[test]
    fn test_event_serde_tag() {
        let event = ChannelEvent::Annotation(AnnotationEvent {
            handle: MessageHandle {
                channel_id: "proposals".into(),
                message_id: "7".into(),
            },
            author: "founder".into(),
            symbol: symbols::APPROVE.into(),
            added: true,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "annotation");
        assert_eq!(json["author"], "founder");
    }
}
