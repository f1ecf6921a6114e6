//! Pending actions and the votes cast on them.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::channel::MessageHandle;
use crate::tools::ToolKind;

/// Where a proposal came from. Decides how long it stays open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalSource {
    /// Raised by an agent during a conversation.
    Organic,
    /// An approval request submitted from outside the agent roster.
    External,
}

impl std::fmt::Display for ProposalSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Organic => write!(f, "organic"),
            Self::External => write!(f, "external"),
        }
    }
}

/// A binary judgement on a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    Deny,
}

/// A write action waiting for consensus.
///
/// Exists from the moment its proposal is posted until it is executed,
/// denied or swept as expired.
#[derive(Debug, Clone)]
pub struct PendingAction {
    /// Message id of the proposal artifact.
    pub id: String,
    pub tool: ToolKind,
    pub args: String,
    pub rationale: String,
    /// Channel the request originated in.
    pub origin_channel: String,
    /// Where the artifact was actually posted.
    pub proposal: MessageHandle,
    pub proposer: String,
    pub founder_initiated: bool,
    pub source: ProposalSource,
    pub created_at: DateTime<Utc>,
    pub expires_at: Instant,
    pub approvals: BTreeSet<String>,
    pub denials: BTreeSet<String>,
}

impl PendingAction {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Whether this action proposes exactly `tool` with `args`.
    pub fn matches(&self, tool: ToolKind, args: &str) -> bool {
        self.tool == tool && self.args.trim() == args.trim()
    }

    /// Record `voter`'s verdict; the last vote per voter wins.
    pub fn cast(&mut self, voter: &str, verdict: Verdict) {
        match verdict {
            Verdict::Approve => {
                self.denials.remove(voter);
                self.approvals.insert(voter.to_string());
            }
            Verdict::Deny => {
                self.approvals.remove(voter);
                self.denials.insert(voter.to_string());
            }
        }
    }

    /// Drop `voter`'s verdict if it matches the withdrawn one.
    pub fn withdraw(&mut self, voter: &str, verdict: Verdict) {
        match verdict {
            Verdict::Approve => self.approvals.remove(voter),
            Verdict::Deny => self.denials.remove(voter),
        };
    }

    /// Short `tool args` rendering for notices.
    pub fn summary(&self) -> String {
        if self.args.is_empty() {
            self.tool.to_string()
        } else {
            format!("{} {}", self.tool, self.args)
        }
    }
}

/// Status line for one pending action, suitable for status snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingSummary {
    pub id: String,
    pub tool: ToolKind,
    pub proposer: String,
    pub source: ProposalSource,
    pub approvals: usize,
    pub denials: usize,
    pub created_at: DateTime<Utc>,
}

impl From<&PendingAction> for PendingSummary {
    fn from(action: &PendingAction) -> Self {
        Self {
            id: action.id.clone(),
            tool: action.tool,
            proposer: action.proposer.clone(),
            source: action.source,
            approvals: action.approvals.len(),
            denials: action.denials.len(),
            created_at: action.created_at,
        }
    }
}
