//! Proposal artifacts as posted to the shared channel.
//!
//! An artifact is a short human-readable header followed by one payload
//! line carrying the same data as JSON, so peers can parse it back without
//! scraping prose:
//!
//! ```text
//! 🗳️ Proposal from arbiter: transfer 0x… 25
//! Reason: pay the audit invoice
//! React ✅ to approve or ❌ to deny.
//! tribunal-proposal: {"tool":"transfer","args":"0x… 25",...}
//! ```

use serde::{Deserialize, Serialize};

use super::action::ProposalSource;
use crate::channel::symbols;
use crate::tools::ToolKind;

/// Prefix of the machine-readable payload line.
pub const PAYLOAD_PREFIX: &str = "tribunal-proposal: ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalArtifact {
    pub tool: ToolKind,
    pub args: String,
    pub rationale: String,
    pub proposer: String,
    pub origin_channel: String,
    pub source: ProposalSource,
    #[serde(default)]
    pub founder_initiated: bool,
}

impl ProposalArtifact {
    pub fn render(&self) -> String {
        // Serializing plain strings and enums cannot fail.
        let payload = serde_json::to_string(self).unwrap_or_default();
        let origin = match self.source {
            ProposalSource::Organic => format!("from {}", self.proposer),
            ProposalSource::External => format!("via {} (external request)", self.proposer),
        };
        format!(
            "🗳️ Proposal {origin}: {} {}\nReason: {}\nReact {} to approve or {} to deny.\n{PAYLOAD_PREFIX}{payload}",
            self.tool,
            self.args,
            self.rationale,
            symbols::APPROVE,
            symbols::DENY,
        )
    }

    /// Recover the artifact from a posted message, if it is one.
    pub fn parse(content: &str) -> Option<Self> {
        content
            .lines()
            .rev()
            .find_map(|line| line.trim().strip_prefix(PAYLOAD_PREFIX))
            .and_then(|payload| serde_json::from_str(payload).ok())
    }

    pub fn is_artifact(content: &str) -> bool {
        Self::parse(content).is_some()
    }
}
