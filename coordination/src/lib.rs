//! Tribunal coordination library
//!
//! This library provides the runtime of one agent in a small roster of
//! chat-driven agents that share a treasury:
//! - Admission control: per-identity rate limits, a circuit breaker and a
//!   bounded request queue in front of the completion API
//! - A tool loop that lets the model call read, self-service and
//!   consensus-gated tools
//! - Multi-agent consensus on privileged actions, voted with annotations on
//!   a shared channel
//! - Bounded conversation memory with debounced persistence and compaction
//!
//! # Usage
//!
//! ```bash
//! # Run a whole roster in one process against an in-memory channel
//! tribunal-agent simulate --config tribunal.toml
//!
//! # Print the effective configuration
//! tribunal-agent config
//! ```

pub mod admission;
pub mod channel;
pub mod completion;
pub mod config;
pub mod consensus;
pub mod memory;
pub mod orchestrator;
pub mod service;
pub mod state;
pub mod tools;

pub use admission::{
    CircuitBreaker, CircuitState, PressureGauge, QueueError, RateLimiter, RequestQueue,
};
pub use channel::{
    AnnotationEvent, ChannelError, ChannelEvent, ChatChannel, InboundMessage, LocalChannel,
    LocalChannelHub, MessageHandle,
};
pub use completion::{
    CompletionClient, CompletionError, HttpCompletionClient, ScriptedCompletionClient,
    SharedCompletionClient,
};
pub use config::{ConfigError, TribunalConfig};
pub use consensus::{
    ConsensusCoordinator, ConsensusError, ProposalOutcome, ProposalSource, Verdict, VoteOutcome,
};
pub use memory::{ConversationEntry, ConversationStore};
pub use service::{
    MessageDisposition, OrchestratorService, ServiceDeps, ServiceHandle, ServiceStatus,
};
pub use state::{FileKvStore, KvStore, MemoryKvStore, SharedKvStore};
pub use tools::{CliBackend, RecordingBackend, ToolBackend, ToolKind, ToolRegistry};
