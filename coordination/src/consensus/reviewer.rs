//! Peer judgement on proposals raised by other agents.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

use super::action::Verdict;
use super::artifact::ProposalArtifact;
use crate::admission::SharedRequestQueue;
use crate::completion::{ChatTurn, CompletionRequest, SharedCompletionClient};

static VERDICT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(APPROVE|DENY)\b").unwrap());

/// Decides how this agent votes on a peer's proposal.
#[async_trait]
pub trait ProposalReviewer: Send + Sync {
    /// `None` abstains: no annotation is cast.
    async fn review(&self, artifact: &ProposalArtifact) -> Option<Verdict>;
}

/// Asks the completion API for an APPROVE/DENY verdict.
///
/// Runs through the request queue like any other completion call, so a
/// saturated queue or open breaker means abstaining.
pub struct CompletionReviewer {
    identity: String,
    client: SharedCompletionClient,
    queue: SharedRequestQueue,
    max_tokens: u32,
}

impl CompletionReviewer {
    pub fn new(
        identity: impl Into<String>,
        client: SharedCompletionClient,
        queue: SharedRequestQueue,
        max_tokens: u32,
    ) -> Self {
        Self {
            identity: identity.into(),
            client,
            queue,
            max_tokens,
        }
    }

    fn request_for(&self, artifact: &ProposalArtifact) -> CompletionRequest {
        let system = format!(
            "You are {}, one of the agents that must co-sign privileged actions. \
             Judge the proposal below on its merits and its risk. Answer with the single \
             word APPROVE or DENY on the first line, then one sentence of reasoning.",
            self.identity
        );
        let user = format!(
            "Proposer: {}\nAction: {} {}\nReason given: {}\nRequested from channel: {}",
            artifact.proposer, artifact.tool, artifact.args, artifact.rationale, artifact.origin_channel
        );
        CompletionRequest::new(vec![ChatTurn::system(system), ChatTurn::user(user)])
            .with_max_tokens(self.max_tokens)
    }
}

#[async_trait]
impl ProposalReviewer for CompletionReviewer {
    async fn review(&self, artifact: &ProposalArtifact) -> Option<Verdict> {
        let request = self.request_for(artifact);
        let client = self.client.clone();
        match self.queue.enqueue(async move { client.complete(&request).await }).await {
            Ok(text) => {
                let verdict = parse_verdict(&text);
                debug!(tool = %artifact.tool, ?verdict, "Reviewed proposal");
                verdict
            }
            Err(e) => {
                warn!(tool = %artifact.tool, error = %e, "Review unavailable, abstaining");
                None
            }
        }
    }
}

/// First APPROVE or DENY keyword in `text`. Ambiguous answers abstain.
pub fn parse_verdict(text: &str) -> Option<Verdict> {
    let mut found = VERDICT_RE.find_iter(text).map(|m| m.as_str());
    let first = found.next()?;
    if found.any(|other| other != first) {
        return None;
    }
    match first {
        "APPROVE" => Some(Verdict::Approve),
        _ => Some(Verdict::Deny),
    }
}

/// Reviewer that always returns the same answer.
pub struct StaticReviewer(pub Option<Verdict>);

#[async_trait]
impl ProposalReviewer for StaticReviewer {
    async fn review(&self, _artifact: &ProposalArtifact) -> Option<Verdict> {
        self.0
    }
}
