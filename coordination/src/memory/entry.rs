//! Conversation entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::completion::{ChatTurn, TurnRole};

/// Label carried by compaction summaries.
pub const SUMMARY_LABEL: &str = "summary";

/// One line of a channel's conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub role: TurnRole,
    /// Who said it: an agent or user identity, or [`SUMMARY_LABEL`].
    pub identity_label: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Per-channel sequence number, assigned by the store.
    #[serde(default)]
    pub seq: u64,
}

impl ConversationEntry {
    pub fn new(role: TurnRole, identity_label: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role,
            identity_label: identity_label.into(),
            text: text.into(),
            timestamp: Utc::now(),
            seq: 0,
        }
    }

    pub fn user(identity: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(TurnRole::User, identity, text)
    }

    pub fn assistant(identity: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(TurnRole::Assistant, identity, text)
    }

    /// A summary standing in for every entry up to and including `seq`.
    pub fn summary(text: impl Into<String>, seq: u64) -> Self {
        Self {
            seq,
            ..Self::new(TurnRole::System, SUMMARY_LABEL, text)
        }
    }

    pub fn is_summary(&self) -> bool {
        self.role == TurnRole::System && self.identity_label == SUMMARY_LABEL
    }

    /// Render as a completion turn. User lines keep their speaker.
    pub fn to_turn(&self) -> ChatTurn {
        match self.role {
            TurnRole::User => ChatTurn::user(format!("[{}] {}", self.identity_label, self.text)),
            TurnRole::Assistant => ChatTurn::assistant(self.text.clone()),
            TurnRole::System => {
                ChatTurn::system(format!("Earlier conversation, summarized: {}", self.text))
            }
        }
    }

    /// Single transcript line, used as summarizer input.
    pub fn transcript_line(&self) -> String {
        format!("{}: {}", self.identity_label, self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_rendering() {
        let user = ConversationEntry::user("founder", "ship it");
        assert_eq!(user.to_turn().content, "[founder] ship it");
        assert_eq!(user.to_turn().role, TurnRole::User);

        let summary = ConversationEntry::summary("we agreed on a budget", 7);
        assert!(summary.is_summary());
        assert_eq!(summary.seq, 7);
        assert_eq!(summary.to_turn().role, TurnRole::System);
        assert!(!ConversationEntry::assistant("arbiter", "ok").is_summary());
    }

    #[test]
    fn test_snapshot_without_seq_still_parses() {
        let raw = r#"{"role":"user","identity_label":"founder","text":"hi","timestamp":"2026-01-01T00:00:00Z"}"#;
        let entry: ConversationEntry = serde_json::from_str(raw).unwrap();
        assert_eq!(entry.seq, 0);
        assert_eq!(entry.transcript_line(), "founder: hi");
    }
}
