//! Tool-call orchestration.
//!
//! [`directive`] extracts tool calls from model output and [`tool_loop`]
//! drives completion rounds until the model gives a final answer.

pub mod directive;
pub mod tool_loop;

pub use directive::{parse_directive, ToolDirective};
pub use tool_loop::{
    LoopContext, LoopError, LoopReply, SharedRateLimiter, ToolCallOutcome, ToolLoop,
};

use crate::completion::ChatTurn;
use crate::memory::ConversationEntry;

/// Opening system turn for an agent.
pub fn system_prompt(identity: &str, role: Option<&str>, catalogue: &str) -> String {
    let role_line = match role {
        Some(role) => format!("You hold the {role} role."),
        None => "You hold no special role.".to_string(),
    };
    format!(
        "You are {identity}, one of several agents that share a treasury. {role_line} \
         Writes that move funds or act on-chain are put to a vote among the agents; \
         never claim such an action is done until a notice says it was executed.\n\n{catalogue}"
    )
}

/// Turns for a completion request: system prompt, then history.
pub fn compose_turns(system: &str, history: &[ConversationEntry]) -> Vec<ChatTurn> {
    std::iter::once(ChatTurn::system(system))
        .chain(history.iter().map(ConversationEntry::to_turn))
        .collect()
}
