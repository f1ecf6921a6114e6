//! Side-effecting backends behind the tool catalogue.
//!
//! The registry validates arguments and then hands a [`ToolInvocation`] to a
//! [`ToolBackend`]. [`CliBackend`] shells out to the chain CLI with a hard
//! timeout; [`RecordingBackend`] keeps an in-memory log for simulation and
//! tests.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{ToolError, ToolKind};
use crate::config::ToolsConfig;

/// Validated request to run one tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub kind: ToolKind,
    /// Tokens produced by argument validation.
    pub argv: Vec<String>,
    /// Identity on whose behalf the tool runs.
    pub invoker: String,
}

#[async_trait]
pub trait ToolBackend: Send + Sync {
    /// Run the side effect and return its textual output.
    async fn execute(&self, invocation: &ToolInvocation) -> Result<String, ToolError>;
}

/// Runs `<program> <subcommand> --as <invoker> <argv...>` without a shell.
pub struct CliBackend {
    program: String,
    timeout: Duration,
    long_timeout: Duration,
}

impl CliBackend {
    pub fn new(config: &ToolsConfig) -> Self {
        Self {
            program: config.program.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            long_timeout: Duration::from_secs(config.long_timeout_secs),
        }
    }

    fn timeout_for(&self, kind: ToolKind) -> Duration {
        if kind.is_long_running() {
            self.long_timeout
        } else {
            self.timeout
        }
    }
}

#[async_trait]
impl ToolBackend for CliBackend {
    async fn execute(&self, invocation: &ToolInvocation) -> Result<String, ToolError> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.arg(invocation.kind.subcommand())
            .arg("--as")
            .arg(&invocation.invoker)
            .args(&invocation.argv)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let limit = self.timeout_for(invocation.kind);
        debug!(
            tool = %invocation.kind,
            program = %self.program,
            timeout_secs = limit.as_secs(),
            "Launching tool backend"
        );

        let output = match tokio::time::timeout(limit, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ToolError::Launch(e.to_string())),
            Err(_) => {
                warn!(tool = %invocation.kind, "Tool backend timed out");
                return Err(ToolError::Timeout {
                    seconds: limit.as_secs(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() {
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(ToolError::CommandFailed {
                code: output.status.code().unwrap_or(-1),
                stderr: if stderr.is_empty() { stdout } else { stderr },
            })
        }
    }
}

#[derive(Default)]
struct RecordingState {
    calls: Vec<ToolInvocation>,
    responses: HashMap<ToolKind, Result<String, String>>,
}

/// In-memory backend that records every invocation.
///
/// Tools answer `ok <tool> <args>` unless a response was scripted with
/// [`RecordingBackend::respond`] or [`RecordingBackend::fail`].
#[derive(Clone, Default)]
pub struct RecordingBackend {
    state: Arc<Mutex<RecordingState>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, kind: ToolKind, output: impl Into<String>) {
        self.lock().responses.insert(kind, Ok(output.into()));
    }

    pub fn fail(&self, kind: ToolKind, stderr: impl Into<String>) {
        self.lock().responses.insert(kind, Err(stderr.into()));
    }

    pub fn calls(&self) -> Vec<ToolInvocation> {
        self.lock().calls.clone()
    }

    /// How many times `kind` has run.
    pub fn count(&self, kind: ToolKind) -> usize {
        self.lock().calls.iter().filter(|c| c.kind == kind).count()
    }

    fn lock(&self) -> MutexGuard<'_, RecordingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ToolBackend for RecordingBackend {
    async fn execute(&self, invocation: &ToolInvocation) -> Result<String, ToolError> {
        let mut state = self.lock();
        state.calls.push(invocation.clone());
        match state.responses.get(&invocation.kind) {
            Some(Ok(output)) => Ok(output.clone()),
            Some(Err(stderr)) => Err(ToolError::CommandFailed {
                code: 1,
                stderr: stderr.clone(),
            }),
            None => Ok(format!(
                "ok {} {}",
                invocation.kind,
                invocation.argv.join(" ")
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(kind: ToolKind) -> ToolInvocation {
        ToolInvocation {
            kind,
            argv: vec!["42".into(), "yes".into()],
            invoker: "arbiter".into(),
        }
    }

    #[tokio::test]
    async fn test_recording_backend_scripts_and_counts() {
        let backend = RecordingBackend::new();
        let out = backend
            .execute(&invocation(ToolKind::CastGovernanceVote))
            .await
            .unwrap();
        assert_eq!(out, "ok cast_governance_vote 42 yes");

        backend.fail(ToolKind::Transfer, "insufficient funds");
        let err = backend
            .execute(&invocation(ToolKind::Transfer))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("insufficient funds"));
        assert_eq!(backend.count(ToolKind::Transfer), 1);
        assert_eq!(backend.calls().len(), 2);
    }

    #[test]
    fn test_cli_backend_uses_long_timeout_for_deployments() {
        let backend = CliBackend::new(&ToolsConfig::default());
        assert_eq!(
            backend.timeout_for(ToolKind::DeployContract),
            Duration::from_secs(600)
        );
        assert_eq!(
            backend.timeout_for(ToolKind::Transfer),
            Duration::from_secs(30)
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_backend_reports_exit_status() {
        let config = ToolsConfig {
            program: "false".into(),
            ..ToolsConfig::default()
        };
        let backend = CliBackend::new(&config);
        let err = backend
            .execute(&invocation(ToolKind::CheckBalance))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::CommandFailed { code: 1, .. }));
    }

    #[tokio::test]
    async fn test_cli_backend_missing_program() {
        let config = ToolsConfig {
            program: "/nonexistent/tribunal-chainctl".into(),
            ..ToolsConfig::default()
        };
        let backend = CliBackend::new(&config);
        let err = backend
            .execute(&invocation(ToolKind::CheckBalance))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Launch(_)));
    }
}
