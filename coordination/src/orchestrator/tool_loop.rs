//! The tool-call loop.
//!
//! Each round sends the accumulated turns to the completion API through the
//! request queue. A reply without a tool directive is the final answer. A
//! reply with one is dispatched by tool class: reads and self-service writes
//! run inline and their result is appended as a system turn; consensus
//! writes are handed to the coordinator and the model is told they are
//! pending. Nothing gated by consensus ever runs from inside the loop.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use super::directive::{parse_directive, ToolDirective};
use crate::admission::{QueueError, RateLimiter, SharedRequestQueue};
use crate::completion::{ChatTurn, CompletionError, CompletionRequest, SharedCompletionClient};
use crate::consensus::{ConsensusCoordinator, ProposalOutcome, ProposalRequest, ProposalSource};
use crate::tools::{is_error_result, ToolClass, ToolKind, ToolRegistry, ERROR_MARKER};

/// Why a loop produced no answer.
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("completion capacity unavailable: {0}")]
    Capacity(String),

    #[error("completion failed: {0}")]
    Upstream(CompletionError),

    #[error("completion returned an empty response")]
    EmptyResponse,

    #[error("no final answer after {rounds} rounds")]
    RoundsExhausted { rounds: usize },
}

impl LoopError {
    /// Capacity failures are signaled with a busy annotation, not a notice.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::Capacity(_))
    }
}

impl From<QueueError<CompletionError>> for LoopError {
    fn from(e: QueueError<CompletionError>) -> Self {
        match e {
            QueueError::Failed(inner) => Self::Upstream(inner),
            other => Self::Capacity(other.to_string()),
        }
    }
}

/// Who triggered the loop, and where.
#[derive(Debug, Clone)]
pub struct LoopContext {
    /// Author of the message being answered.
    pub caller: String,
    pub channel_id: String,
    pub founder_initiated: bool,
}

/// What happened to one directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCallOutcome {
    Executed { tool: ToolKind, result: String },
    /// Ran inline, but the tool reported an error.
    Failed { tool: ToolKind, result: String },
    Proposed { tool: ToolKind, proposal_id: String },
    Rejected { name: String, reason: String },
}

/// Final answer of a loop run.
#[derive(Debug, Clone)]
pub struct LoopReply {
    pub text: String,
    pub rounds: usize,
    pub calls: Vec<ToolCallOutcome>,
}

/// Shared, synchronously locked tool-invocation limiter.
pub type SharedRateLimiter = Arc<Mutex<RateLimiter>>;

pub struct ToolLoop {
    identity: String,
    roles: BTreeMap<String, String>,
    client: SharedCompletionClient,
    queue: SharedRequestQueue,
    tools: ToolRegistry,
    coordinator: Arc<ConsensusCoordinator>,
    tool_limiter: SharedRateLimiter,
    max_rounds: usize,
}

impl ToolLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: impl Into<String>,
        roles: BTreeMap<String, String>,
        client: SharedCompletionClient,
        queue: SharedRequestQueue,
        tools: ToolRegistry,
        coordinator: Arc<ConsensusCoordinator>,
        tool_limiter: SharedRateLimiter,
        max_rounds: usize,
    ) -> Self {
        Self {
            identity: identity.into(),
            roles,
            client,
            queue,
            tools,
            coordinator,
            tool_limiter,
            max_rounds: max_rounds.max(1),
        }
    }

    /// Drive completion rounds until a final answer or a failure.
    pub async fn run(
        &self,
        mut turns: Vec<ChatTurn>,
        ctx: &LoopContext,
    ) -> Result<LoopReply, LoopError> {
        let mut calls = Vec::new();

        for round in 1..=self.max_rounds {
            let request = CompletionRequest::new(turns.clone());
            let client = self.client.clone();
            let response = self
                .queue
                .enqueue(async move { client.complete(&request).await })
                .await?;

            let response = response.trim().to_string();
            if response.is_empty() {
                return Err(LoopError::EmptyResponse);
            }

            let Some(directive) = parse_directive(&response) else {
                debug!(round, caller = %ctx.caller, "Loop produced final answer");
                return Ok(LoopReply {
                    text: response,
                    rounds: round,
                    calls,
                });
            };

            turns.push(ChatTurn::assistant(response.clone()));
            let (note, outcome) = self.dispatch(&directive, ctx).await;
            debug!(round, tool = %directive.name, ?outcome, "Tool directive handled");
            turns.push(ChatTurn::system(note));
            calls.push(outcome);
        }

        warn!(caller = %ctx.caller, rounds = self.max_rounds, "Tool loop exhausted its rounds");
        Err(LoopError::RoundsExhausted {
            rounds: self.max_rounds,
        })
    }

    /// Handle one directive, returning the synthetic turn for the model.
    async fn dispatch(
        &self,
        directive: &ToolDirective,
        ctx: &LoopContext,
    ) -> (String, ToolCallOutcome) {
        let rejected = |reason: String| {
            (
                format!("{ERROR_MARKER} {reason}"),
                ToolCallOutcome::Rejected {
                    name: directive.name.clone(),
                    reason,
                },
            )
        };

        let allowed = self
            .tool_limiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .allow(&ctx.caller);
        if !allowed {
            return rejected(
                "tool rate limit reached. Answer without using tools for now.".to_string(),
            );
        }

        let Some(kind) = directive.kind() else {
            return rejected(format!(
                "unknown tool `{}`. Available tools: {}",
                directive.name,
                self.tools.tool_names().collect::<Vec<_>>().join(", ")
            ));
        };

        if let Some(role) = kind.restricted_role() {
            let own_role = self.roles.get(&self.identity).map(String::as_str);
            if own_role != Some(role) {
                return rejected(format!(
                    "{kind} may only be requested by an agent with the {role} role; \
                     {} does not hold it.",
                    self.identity
                ));
            }
        }

        match kind.class() {
            ToolClass::Read | ToolClass::SelfService => {
                let result = self.tools.execute(kind, &directive.args, &ctx.caller).await;
                let outcome = if is_error_result(&result) {
                    warn!(
                        tool = %kind,
                        caller = %ctx.caller,
                        result = %result,
                        "Inline tool call failed"
                    );
                    ToolCallOutcome::Failed {
                        tool: kind,
                        result: result.clone(),
                    }
                } else {
                    debug!(tool = %kind, caller = %ctx.caller, "Inline tool call succeeded");
                    ToolCallOutcome::Executed {
                        tool: kind,
                        result: result.clone(),
                    }
                };
                (format!("Result of {kind}: {result}"), outcome)
            }
            ToolClass::Consensus => self.propose(kind, directive, ctx).await,
        }
    }

    async fn propose(
        &self,
        kind: ToolKind,
        directive: &ToolDirective,
        ctx: &LoopContext,
    ) -> (String, ToolCallOutcome) {
        let rationale = if directive.remainder.is_empty() {
            format!("Requested by {} in {}", ctx.caller, ctx.channel_id)
        } else {
            directive.remainder.clone()
        };
        let request = ProposalRequest {
            tool: kind,
            args: directive.args.clone(),
            rationale,
            origin_channel: ctx.channel_id.clone(),
            source: ProposalSource::Organic,
            founder_initiated: ctx.founder_initiated,
        };

        match self.coordinator.propose(request).await {
            Ok(ProposalOutcome::Pending { handle }) => {
                info!(tool = %kind, id = %handle.message_id, "Write routed to consensus");
                (
                    format!(
                        "{kind} needs approval from the other agents. A proposal was posted \
                         and is now pending. It has NOT been executed; tell the user it is \
                         awaiting votes."
                    ),
                    ToolCallOutcome::Proposed {
                        tool: kind,
                        proposal_id: handle.message_id,
                    },
                )
            }
            Ok(ProposalOutcome::Duplicate { id }) => (
                format!(
                    "An identical {kind} proposal is already pending a vote. \
                     Do not propose it again."
                ),
                ToolCallOutcome::Proposed {
                    tool: kind,
                    proposal_id: id,
                },
            ),
            Err(e) => (
                format!("{ERROR_MARKER} could not propose {kind}: {e}"),
                ToolCallOutcome::Rejected {
                    name: kind.name().to_string(),
                    reason: e.to_string(),
                },
            ),
        }
    }
}
