//! Multi-agent consensus on privileged actions.
//!
//! A proposal lives as a message on the shared channel; votes are
//! annotations on that message. The proposing process alone resolves it:
//! execution at the required approval count, termination on any denial,
//! immediate resolution on an override vote, and expiry by periodic sweep.

pub mod action;
pub mod artifact;
pub mod coordinator;
pub mod reviewer;

pub use action::{PendingAction, PendingSummary, ProposalSource, Verdict};
pub use artifact::ProposalArtifact;
pub use coordinator::{
    ConsensusCoordinator, ConsensusError, ConsensusSettings, ProposalOutcome, ProposalRequest,
    VoteOutcome,
};
pub use reviewer::{parse_verdict, CompletionReviewer, ProposalReviewer, StaticReviewer};
