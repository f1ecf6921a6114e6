//! Proposal state machine.
//!
//! Each process tracks only the proposals it raised and drives them from the
//! annotations it observes on the shared channel. Peer proposals are only
//! reviewed and voted on. A PendingAction is removed from the map before its
//! side effect runs, which is what makes execution happen at most once.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::action::{PendingAction, PendingSummary, ProposalSource, Verdict};
use super::artifact::ProposalArtifact;
use super::reviewer::ProposalReviewer;
use crate::channel::{
    symbols, AnnotationEvent, ChannelError, ChannelHandle, ChatChannel, InboundMessage,
    MessageHandle,
};
use crate::config::TribunalConfig;
use crate::tools::{is_error_result, ToolError, ToolKind, ToolRegistry};

/// Errors raised while submitting a proposal.
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error(transparent)]
    InvalidArguments(#[from] ToolError),

    #[error("{tool} is restricted to the {role} role")]
    Forbidden { tool: ToolKind, role: &'static str },

    #[error("{0} does not need consensus")]
    NotGated(ToolKind),

    #[error("could not post proposal: {0}")]
    Delivery(#[from] ChannelError),
}

/// Static inputs of the state machine.
#[derive(Debug, Clone)]
pub struct ConsensusSettings {
    pub identity: String,
    pub override_identity: String,
    pub roster: BTreeSet<String>,
    pub roles: BTreeMap<String, String>,
    pub proposal_channel: String,
    pub required_approvals: usize,
    pub organic_ttl: Duration,
    pub external_ttl: Duration,
}

impl ConsensusSettings {
    pub fn from_config(config: &TribunalConfig) -> Self {
        Self {
            identity: config.agent.identity.clone(),
            override_identity: config.agent.override_identity.clone(),
            roster: config.agent.roster.iter().cloned().collect(),
            roles: config.agent.roles.clone(),
            proposal_channel: config.agent.proposal_channel.clone(),
            required_approvals: config.consensus.required_approvals,
            organic_ttl: config.consensus.organic_ttl(),
            external_ttl: config.consensus.external_ttl(),
        }
    }

    fn role_of(&self, identity: &str) -> Option<&str> {
        self.roles.get(identity).map(String::as_str)
    }

    fn ttl_for(&self, source: ProposalSource) -> Duration {
        match source {
            ProposalSource::Organic => self.organic_ttl,
            ProposalSource::External => self.external_ttl,
        }
    }
}

/// A request to put a write action to the vote.
#[derive(Debug, Clone)]
pub struct ProposalRequest {
    pub tool: ToolKind,
    pub args: String,
    pub rationale: String,
    pub origin_channel: String,
    pub source: ProposalSource,
    pub founder_initiated: bool,
}

/// Result of [`ConsensusCoordinator::propose`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposalOutcome {
    /// Posted and registered; voting is open.
    Pending { handle: MessageHandle },
    /// An identical proposal is already open.
    Duplicate { id: String },
}

/// What an observed annotation did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VoteOutcome {
    /// Not a vote on a proposal this process is tracking.
    Ignored,
    /// The vote was counted; the proposal stays open.
    Recorded { approvals: usize, denials: usize },
    Executed { result: String },
    /// Approved, but the tool reported an error.
    ExecutionFailed { result: String },
    Denied { by: String },
    Expired,
}

/// Terminal transitions, for notices and logs.
enum Resolution {
    Execute { by_override: bool },
    Deny { by: String },
}

enum Step {
    Done(VoteOutcome),
    Expired(PendingAction),
    Resolve(PendingAction, Resolution),
}

/// Per-process proposal tracker.
pub struct ConsensusCoordinator {
    settings: ConsensusSettings,
    channel: Arc<dyn ChatChannel>,
    tools: ToolRegistry,
    reviewer: Arc<dyn ProposalReviewer>,
    pending: Mutex<HashMap<String, PendingAction>>,
}

impl ConsensusCoordinator {
    pub fn new(
        settings: ConsensusSettings,
        channel: Arc<dyn ChatChannel>,
        tools: ToolRegistry,
        reviewer: Arc<dyn ProposalReviewer>,
    ) -> Self {
        Self {
            settings,
            channel,
            tools,
            reviewer,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ConsensusSettings {
        &self.settings
    }

    /// Post a proposal and open it for voting.
    ///
    /// Skips posting when an identical, unexpired proposal is already open.
    /// Falls back to the originating channel when the proposal channel
    /// rejects the post.
    pub async fn propose(
        &self,
        request: ProposalRequest,
    ) -> Result<ProposalOutcome, ConsensusError> {
        if !request.tool.is_write() || request.tool.is_self_service() {
            return Err(ConsensusError::NotGated(request.tool));
        }
        if let Some(role) = request.tool.restricted_role() {
            if self.settings.role_of(&self.settings.identity) != Some(role) {
                return Err(ConsensusError::Forbidden {
                    tool: request.tool,
                    role,
                });
            }
        }
        self.tools.validate(request.tool, &request.args)?;

        if let Some(id) = self.find_duplicate(request.tool, &request.args) {
            debug!(tool = %request.tool, id = %id, "Identical proposal already open");
            return Ok(ProposalOutcome::Duplicate { id });
        }

        let artifact = ProposalArtifact {
            tool: request.tool,
            args: request.args.trim().to_string(),
            rationale: request.rationale.clone(),
            proposer: self.settings.identity.clone(),
            origin_channel: request.origin_channel.clone(),
            source: request.source,
            founder_initiated: request.founder_initiated,
        };
        let handle = self
            .post_artifact(&artifact.render(), &request.origin_channel)
            .await?;

        // Registered before any other await so no vote can race past it.
        let action = PendingAction {
            id: handle.message_id.clone(),
            tool: artifact.tool,
            args: artifact.args,
            rationale: artifact.rationale,
            origin_channel: artifact.origin_channel,
            proposal: handle.clone(),
            proposer: artifact.proposer,
            founder_initiated: artifact.founder_initiated,
            source: artifact.source,
            created_at: Utc::now(),
            expires_at: Instant::now() + self.settings.ttl_for(request.source),
            approvals: BTreeSet::from([self.settings.identity.clone()]),
            denials: BTreeSet::new(),
        };
        self.lock().insert(action.id.clone(), action);

        info!(
            tool = %request.tool,
            id = %handle.message_id,
            channel = %handle.channel_id,
            source = %request.source,
            "Proposal opened"
        );
        Ok(ProposalOutcome::Pending { handle })
    }

    /// Feed an observed annotation into the state machine.
    pub async fn on_annotation(&self, event: &AnnotationEvent) -> VoteOutcome {
        let verdict = match event.symbol.as_str() {
            symbols::APPROVE => Verdict::Approve,
            symbols::DENY => Verdict::Deny,
            _ => return VoteOutcome::Ignored,
        };
        let is_override = event.author == self.settings.override_identity;
        if !is_override && !self.settings.roster.contains(&event.author) {
            return VoteOutcome::Ignored;
        }

        match self.apply_vote(event, verdict, is_override) {
            Step::Done(outcome) => outcome,
            Step::Expired(action) => {
                info!(id = %action.id, voter = %event.author, "Vote arrived after expiry");
                self.notify(
                    &action,
                    &format!(
                        "⌛ Proposal `{}` has expired; the vote from {} was not counted.",
                        action.summary(),
                        event.author
                    ),
                )
                .await;
                VoteOutcome::Expired
            }
            Step::Resolve(action, resolution) => self.resolve(action, resolution).await,
        }
    }

    /// Synchronous part of [`Self::on_annotation`]. Terminal transitions
    /// take the action out of the map before returning it.
    fn apply_vote(&self, event: &AnnotationEvent, verdict: Verdict, is_override: bool) -> Step {
        let mut pending = self.lock();
        let id = &event.handle.message_id;
        let Some(action) = pending.get_mut(id) else {
            return Step::Done(VoteOutcome::Ignored);
        };

        if action.is_expired(Instant::now()) {
            return match pending.remove(id) {
                Some(action) => Step::Expired(action),
                None => Step::Done(VoteOutcome::Ignored),
            };
        }

        let resolution = if is_override {
            if !event.added {
                return Step::Done(VoteOutcome::Ignored);
            }
            match verdict {
                Verdict::Approve => Resolution::Execute { by_override: true },
                Verdict::Deny => Resolution::Deny {
                    by: event.author.clone(),
                },
            }
        } else if !event.added {
            action.withdraw(&event.author, verdict);
            debug!(id = %action.id, voter = %event.author, "Vote withdrawn");
            return Step::Done(VoteOutcome::Recorded {
                approvals: action.approvals.len(),
                denials: action.denials.len(),
            });
        } else {
            action.cast(&event.author, verdict);
            debug!(
                id = %action.id,
                voter = %event.author,
                ?verdict,
                approvals = action.approvals.len(),
                "Vote recorded"
            );
            if !action.denials.is_empty() {
                Resolution::Deny {
                    by: event.author.clone(),
                }
            } else if action.approvals.len() >= self.settings.required_approvals {
                Resolution::Execute { by_override: false }
            } else {
                return Step::Done(VoteOutcome::Recorded {
                    approvals: action.approvals.len(),
                    denials: action.denials.len(),
                });
            }
        };

        match pending.remove(id) {
            Some(action) => Step::Resolve(action, resolution),
            None => Step::Done(VoteOutcome::Ignored),
        }
    }

    /// Drop every proposal past its expiry and announce it.
    pub async fn sweep_expired(&self) -> Vec<PendingAction> {
        let now = Instant::now();
        let expired: Vec<PendingAction> = {
            let mut pending = self.lock();
            let ids: Vec<String> = pending
                .values()
                .filter(|a| a.is_expired(now))
                .map(|a| a.id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        for action in &expired {
            info!(id = %action.id, tool = %action.tool, "Proposal expired");
            self.notify(
                action,
                &format!("⌛ Proposal `{}` expired without a decision.", action.summary()),
            )
            .await;
        }
        expired
    }

    /// Judge a peer's proposal and cast this agent's vote on it.
    ///
    /// Own proposals, proposals from outside the roster, non-artifacts and
    /// abstentions cast nothing.
    pub async fn review_proposal(&self, message: &InboundMessage) -> Option<Verdict> {
        if message.author == self.settings.identity {
            return None;
        }
        if !self.settings.roster.contains(&message.author) {
            debug!(author = %message.author, "Ignoring proposal from outside the roster");
            return None;
        }
        let artifact = ProposalArtifact::parse(&message.content)?;
        if artifact.proposer != message.author {
            warn!(author = %message.author, proposer = %artifact.proposer, "Proposal author mismatch");
            return None;
        }

        let verdict = if let Err(e) = self.tools.validate(artifact.tool, &artifact.args) {
            debug!(error = %e, "Denying proposal with invalid arguments");
            Some(Verdict::Deny)
        } else if artifact
            .tool
            .restricted_role()
            .is_some_and(|role| self.settings.role_of(&artifact.proposer) != Some(role))
        {
            debug!(tool = %artifact.tool, proposer = %artifact.proposer, "Denying proposal outside proposer's role");
            Some(Verdict::Deny)
        } else {
            self.reviewer.review(&artifact).await
        };

        let symbol = match verdict? {
            Verdict::Approve => symbols::APPROVE,
            Verdict::Deny => symbols::DENY,
        };
        if let Err(e) = self.channel.annotate(&message.handle, symbol).await {
            warn!(error = %e, "Failed to cast vote");
            return None;
        }
        info!(id = %message.handle.message_id, proposer = %artifact.proposer, ?verdict, "Vote cast");
        verdict
    }

    /// Open proposals raised by this process.
    pub fn pending(&self) -> Vec<PendingSummary> {
        let mut summaries: Vec<PendingSummary> =
            self.lock().values().map(PendingSummary::from).collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    async fn resolve(&self, action: PendingAction, resolution: Resolution) -> VoteOutcome {
        match resolution {
            Resolution::Execute { by_override } => {
                let result = self
                    .tools
                    .execute(action.tool, &action.args, &action.proposer)
                    .await;
                let how = if by_override {
                    format!("by {}", self.settings.override_identity)
                } else {
                    format!("with {} approvals", action.approvals.len())
                };
                if is_error_result(&result) {
                    warn!(
                        id = %action.id,
                        tool = %action.tool,
                        by_override,
                        result = %result,
                        "Approved proposal failed to execute"
                    );
                    let notice =
                        format!("⚠️ Approved `{}` {how} but it failed: {result}", action.summary());
                    self.notify(&action, &notice).await;
                    return VoteOutcome::ExecutionFailed { result };
                }
                info!(
                    id = %action.id,
                    tool = %action.tool,
                    by_override,
                    approvals = action.approvals.len(),
                    "Proposal executed"
                );
                self.notify(
                    &action,
                    &format!("{} Executed `{}` {how}: {result}", symbols::APPROVE, action.summary()),
                )
                .await;
                VoteOutcome::Executed { result }
            }
            Resolution::Deny { by } => {
                info!(id = %action.id, tool = %action.tool, by = %by, "Proposal denied");
                self.notify(
                    &action,
                    &format!("{} Denied `{}` by {by}.", symbols::DENY, action.summary()),
                )
                .await;
                VoteOutcome::Denied { by }
            }
        }
    }

    async fn post_artifact(
        &self,
        content: &str,
        origin_channel: &str,
    ) -> Result<MessageHandle, ChannelError> {
        let primary = async {
            let channel = self.channel.fetch(&self.settings.proposal_channel).await?;
            self.channel.post(&channel, content).await
        };
        match primary.await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                warn!(
                    channel = %self.settings.proposal_channel,
                    fallback = %origin_channel,
                    error = %e,
                    "Proposal channel unavailable, posting to origin"
                );
                let origin = self.channel.fetch(origin_channel).await?;
                self.channel.post(&origin, content).await
            }
        }
    }

    async fn notify(&self, action: &PendingAction, text: &str) {
        let channel = ChannelHandle {
            channel_id: action.proposal.channel_id.clone(),
        };
        if let Err(e) = self.channel.post(&channel, text).await {
            warn!(id = %action.id, error = %e, "Failed to post proposal notice");
        }
    }

    fn find_duplicate(&self, tool: ToolKind, args: &str) -> Option<String> {
        let now = Instant::now();
        self.lock()
            .values()
            .find(|a| !a.is_expired(now) && a.matches(tool, args))
            .map(|a| a.id.clone())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingAction>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
