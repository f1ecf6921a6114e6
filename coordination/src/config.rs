//! Runtime configuration for a tribunal agent process.
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration. Environment variables (`TRIBUNAL_*`) override the file for
//! the handful of values that differ per deployment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TribunalConfig {
    pub agent: AgentConfig,
    pub limits: LimitsConfig,
    pub breaker: BreakerConfig,
    pub queue: QueueConfig,
    pub consensus: ConsensusConfig,
    pub memory: MemoryConfig,
    pub completion: CompletionConfig,
    pub tools: ToolsConfig,
    pub storage: StorageConfig,
}

/// Identity of this process and of the roster it votes with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Identity this process posts and votes as.
    pub identity: String,
    /// Human override authority. Always admitted, and its votes short-circuit consensus.
    pub override_identity: String,
    /// All agent identities taking part in consensus.
    pub roster: Vec<String>,
    /// Role assignments, keyed by identity. Agents without an entry have no role.
    pub roles: BTreeMap<String, String>,
    /// Shared channel proposals are posted to.
    pub proposal_channel: String,
    /// Channels where every message is treated as addressed to this agent.
    pub listen_channels: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let mut roles = BTreeMap::new();
        roles.insert("steward".to_string(), "treasurer".to_string());
        Self {
            identity: "arbiter".to_string(),
            override_identity: "founder".to_string(),
            roster: vec![
                "arbiter".to_string(),
                "sentinel".to_string(),
                "steward".to_string(),
            ],
            roles,
            proposal_channel: "proposals".to_string(),
            listen_channels: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Role assigned to `identity`, if any.
    pub fn role_of(&self, identity: &str) -> Option<&str> {
        self.roles.get(identity).map(String::as_str)
    }

    /// Copy of this config re-targeted at another roster member.
    pub fn for_identity(&self, identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            ..self.clone()
        }
    }
}

/// Sliding-window rate limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub message_window_secs: u64,
    pub message_max: usize,
    pub tool_window_secs: u64,
    pub tool_max: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            message_window_secs: 600,
            message_max: 8,
            tool_window_secs: 60,
            tool_max: 10,
        }
    }
}

impl LimitsConfig {
    pub fn message_window(&self) -> Duration {
        Duration::from_secs(self.message_window_secs)
    }

    pub fn tool_window(&self) -> Duration {
        Duration::from_secs(self.tool_window_secs)
    }
}

/// Circuit breaker guarding the completion API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_secs: 120,
        }
    }
}

/// Request queue in front of the completion API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    pub max_queued: usize,
    /// Queue depth at which the process reports itself under pressure.
    pub pressure_depth: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            max_queued: 5,
            pressure_depth: 3,
        }
    }
}

/// Proposal voting parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub required_approvals: usize,
    /// Lifetime of proposals raised during conversation.
    pub organic_ttl_secs: u64,
    /// Lifetime of approval requests that arrive from outside the roster.
    pub external_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            required_approvals: 3,
            organic_ttl_secs: 30 * 60,
            external_ttl_secs: 24 * 60 * 60,
            sweep_interval_secs: 60,
        }
    }
}

impl ConsensusConfig {
    pub fn organic_ttl(&self) -> Duration {
        Duration::from_secs(self.organic_ttl_secs)
    }

    pub fn external_ttl(&self) -> Duration {
        Duration::from_secs(self.external_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Conversation memory bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub max_entries: usize,
    pub compaction_trigger: usize,
    pub keep_recent: usize,
    pub flush_delay_secs: u64,
    pub summary_max_tokens: u32,
    /// Resident set size above which the process reports itself under pressure.
    pub pressure_threshold_mb: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_entries: 25,
            compaction_trigger: 20,
            keep_recent: 10,
            flush_delay_secs: 10,
            summary_max_tokens: 400,
            pressure_threshold_mb: 512,
        }
    }
}

impl MemoryConfig {
    pub fn flush_delay(&self) -> Duration {
        Duration::from_secs(self.flush_delay_secs)
    }
}

/// OpenAI-compatible completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
    /// Completion rounds allowed per tool loop.
    pub max_rounds: usize,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/v1".to_string(),
            model: "default".to_string(),
            api_key: None,
            max_tokens: 1024,
            temperature: 0.4,
            timeout_secs: 60,
            max_rounds: 6,
        }
    }
}

impl CompletionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Side-effecting tool backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// CLI invoked for every tool, as `<program> <subcommand> <args...>`.
    pub program: String,
    pub timeout_secs: u64,
    /// Timeout for deployment-style operations.
    pub long_timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            program: "chainctl".to_string(),
            timeout_secs: 30,
            long_timeout_secs: 600,
        }
    }
}

/// Key/value persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./tribunal-state"),
        }
    }
}

impl TribunalConfig {
    /// Parse a TOML document. Missing sections fall back to defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an optional file, then apply `TRIBUNAL_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                toml::from_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a lookup function (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(identity) = lookup("TRIBUNAL_IDENTITY") {
            self.agent.identity = identity;
        }
        if let Some(url) = lookup("TRIBUNAL_COMPLETION_URL") {
            self.completion.base_url = url;
        }
        if let Some(model) = lookup("TRIBUNAL_COMPLETION_MODEL") {
            self.completion.model = model;
        }
        if let Some(key) = lookup("TRIBUNAL_API_KEY") {
            self.completion.api_key = Some(key);
        }
        if let Some(program) = lookup("TRIBUNAL_TOOL_PROGRAM") {
            self.tools.program = program;
        }
        if let Some(dir) = lookup("TRIBUNAL_STATE_DIR") {
            self.storage.dir = PathBuf::from(dir);
        }
    }

    /// Reject combinations the runtime cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.identity.trim().is_empty() {
            return Err(ConfigError::Invalid("agent.identity is empty".into()));
        }
        if self.agent.identity == self.agent.override_identity {
            return Err(ConfigError::Invalid(
                "agent.identity must differ from agent.override_identity".into(),
            ));
        }
        if self.consensus.required_approvals == 0 {
            return Err(ConfigError::Invalid(
                "consensus.required_approvals must be at least 1".into(),
            ));
        }
        if self.queue.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "queue.max_concurrent must be at least 1".into(),
            ));
        }
        if self.memory.compaction_trigger > self.memory.max_entries {
            return Err(ConfigError::Invalid(format!(
                "memory.compaction_trigger ({}) exceeds memory.max_entries ({})",
                self.memory.compaction_trigger, self.memory.max_entries
            )));
        }
        if self.memory.keep_recent >= self.memory.compaction_trigger {
            return Err(ConfigError::Invalid(format!(
                "memory.keep_recent ({}) must be below memory.compaction_trigger ({})",
                self.memory.keep_recent, self.memory.compaction_trigger
            )));
        }
        if self.completion.max_rounds == 0 {
            return Err(ConfigError::Invalid(
                "completion.max_rounds must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
