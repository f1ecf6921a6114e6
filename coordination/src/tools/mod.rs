//! Tool catalogue.
//!
//! The set of tools is closed and known at compile time. Each [`ToolKind`]
//! carries its own classification (read, self-service write, or
//! consensus-gated write), optional role restriction and argument shape.
//! [`ToolRegistry`] binds the catalogue to a [`ToolBackend`] and guarantees
//! that execution always yields a string, never an error.

pub mod backend;
pub mod registry;
pub mod validate;

use serde::{Deserialize, Serialize};

pub use backend::{CliBackend, RecordingBackend, ToolBackend, ToolInvocation};
pub use registry::{is_error_result, ToolDescriptor, ToolRegistry, ERROR_MARKER};

/// Errors that can occur while validating or running a tool.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: &'static str, reason: String },

    #[error("failed to launch backend: {0}")]
    Launch(String),

    #[error("command timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("command failed (exit {code}): {stderr}")]
    CommandFailed { code: i32, stderr: String },
}

/// How a tool may be dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolClass {
    /// No side effects; runs inline.
    Read,
    /// Writes confined to the invoker's own data; runs inline.
    SelfService,
    /// Writes that need the roster's agreement before they run.
    Consensus,
}

/// Every tool an agent can invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    CheckBalance,
    GetProposal,
    GetTransaction,
    RegisterWallet,
    SetStatus,
    Transfer,
    CastGovernanceVote,
    DeployContract,
    MintReward,
}

impl ToolKind {
    pub const ALL: &'static [ToolKind] = &[
        Self::CheckBalance,
        Self::GetProposal,
        Self::GetTransaction,
        Self::RegisterWallet,
        Self::SetStatus,
        Self::Transfer,
        Self::CastGovernanceVote,
        Self::DeployContract,
        Self::MintReward,
    ];

    /// Name used in tool directives and proposal artifacts.
    pub fn name(self) -> &'static str {
        match self {
            Self::CheckBalance => "check_balance",
            Self::GetProposal => "get_proposal",
            Self::GetTransaction => "get_transaction",
            Self::RegisterWallet => "register_wallet",
            Self::SetStatus => "set_status",
            Self::Transfer => "transfer",
            Self::CastGovernanceVote => "cast_governance_vote",
            Self::DeployContract => "deploy_contract",
            Self::MintReward => "mint_reward",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.name() == name)
    }

    /// Subcommand passed to the backend CLI.
    pub fn subcommand(self) -> &'static str {
        match self {
            Self::CheckBalance => "balance",
            Self::GetProposal => "proposal",
            Self::GetTransaction => "tx",
            Self::RegisterWallet => "register-wallet",
            Self::SetStatus => "set-status",
            Self::Transfer => "transfer",
            Self::CastGovernanceVote => "vote",
            Self::DeployContract => "deploy",
            Self::MintReward => "mint",
        }
    }

    pub fn class(self) -> ToolClass {
        match self {
            Self::CheckBalance | Self::GetProposal | Self::GetTransaction => ToolClass::Read,
            Self::RegisterWallet | Self::SetStatus => ToolClass::SelfService,
            Self::Transfer | Self::CastGovernanceVote | Self::DeployContract | Self::MintReward => {
                ToolClass::Consensus
            }
        }
    }

    pub fn is_write(self) -> bool {
        self.class() != ToolClass::Read
    }

    pub fn is_self_service(self) -> bool {
        self.class() == ToolClass::SelfService
    }

    /// Role an invoker must hold, if the tool is restricted.
    pub fn restricted_role(self) -> Option<&'static str> {
        match self {
            Self::MintReward => Some("treasurer"),
            _ => None,
        }
    }

    /// Operations that may take minutes (proving, deployment).
    pub fn is_long_running(self) -> bool {
        matches!(self, Self::DeployContract)
    }

    pub fn usage(self) -> &'static str {
        match self {
            Self::CheckBalance => "check_balance <address>",
            Self::GetProposal => "get_proposal <proposal-id>",
            Self::GetTransaction => "get_transaction <tx-hash>",
            Self::RegisterWallet => "register_wallet <address>",
            Self::SetStatus => "set_status <text>",
            Self::Transfer => "transfer <address> <amount>",
            Self::CastGovernanceVote => "cast_governance_vote <proposal-id> <yes|no|abstain>",
            Self::DeployContract => "deploy_contract <0x-bytecode>",
            Self::MintReward => "mint_reward <address> <amount>",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::CheckBalance => "Read the token balance of an address.",
            Self::GetProposal => "Read an on-chain governance proposal.",
            Self::GetTransaction => "Read the status of a transaction.",
            Self::RegisterWallet => "Register your own payout wallet.",
            Self::SetStatus => "Set your own status line.",
            Self::Transfer => "Send tokens from the treasury. Requires consensus.",
            Self::CastGovernanceVote => "Vote on a governance proposal. Requires consensus.",
            Self::DeployContract => "Deploy contract bytecode. Requires consensus.",
            Self::MintReward => "Mint reward tokens. Treasurer only; requires consensus.",
        }
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
