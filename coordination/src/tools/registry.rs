//! Tool registry: validation plus dispatch, with string-only results.

use std::fmt::Write as _;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use super::backend::{ToolBackend, ToolInvocation};
use super::validate::validate;
use super::{ToolClass, ToolError, ToolKind};

/// Prefix carried by every failed tool result.
pub const ERROR_MARKER: &str = "Error:";

/// Whether a tool result string reports a failure.
pub fn is_error_result(result: &str) -> bool {
    result.contains(ERROR_MARKER)
}

/// Immutable description of one tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub class: ToolClass,
    pub is_write: bool,
    pub is_self_service: bool,
    pub restricted_role: Option<&'static str>,
    pub usage: &'static str,
    pub description: &'static str,
}

impl From<ToolKind> for ToolDescriptor {
    fn from(kind: ToolKind) -> Self {
        Self {
            name: kind.name(),
            class: kind.class(),
            is_write: kind.is_write(),
            is_self_service: kind.is_self_service(),
            restricted_role: kind.restricted_role(),
            usage: kind.usage(),
            description: kind.description(),
        }
    }
}

/// Process-wide tool table. Built once at startup and never mutated.
#[derive(Clone)]
pub struct ToolRegistry {
    backend: Arc<dyn ToolBackend>,
    descriptors: Arc<[ToolDescriptor]>,
}

impl ToolRegistry {
    pub fn new(backend: Arc<dyn ToolBackend>) -> Self {
        let descriptors = ToolKind::ALL
            .iter()
            .copied()
            .map(ToolDescriptor::from)
            .collect();
        Self {
            backend,
            descriptors,
        }
    }

    pub fn descriptors(&self) -> &[ToolDescriptor] {
        &self.descriptors
    }

    pub fn tool_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.descriptors.iter().map(|d| d.name)
    }

    /// Check arguments without running anything.
    pub fn validate(&self, kind: ToolKind, args: &str) -> Result<Vec<String>, ToolError> {
        validate(kind, args)
    }

    /// Catalogue text for the system prompt.
    pub fn catalogue_prompt(&self) -> String {
        let mut out = String::from(
            "To use a tool, reply with a single line `TOOL: <name> <args>` and nothing else.\n\
             Available tools:\n",
        );
        for d in self.descriptors() {
            let _ = writeln!(out, "- {}: {}", d.usage, d.description);
        }
        out
    }

    /// Validate and run a tool. Never fails: errors come back as strings
    /// starting with [`ERROR_MARKER`].
    pub async fn execute(&self, kind: ToolKind, args: &str, invoker: &str) -> String {
        let argv = match validate(kind, args) {
            Ok(argv) => argv,
            Err(e) => {
                debug!(tool = %kind, error = %e, "Rejected tool arguments");
                return format!("{ERROR_MARKER} {e}");
            }
        };

        let invocation = ToolInvocation {
            kind,
            argv,
            invoker: invoker.to_string(),
        };
        match self.backend.execute(&invocation).await {
            Ok(output) if output.is_empty() => format!("{kind} completed"),
            Ok(output) => output,
            Err(e) => {
                warn!(tool = %kind, invoker, error = %e, "Tool execution failed");
                format!("{ERROR_MARKER} {e}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::RecordingBackend;

    const ADDR: &str = "0x52908400098527886E0F7030069857D2E4169EE7";

    fn registry() -> (ToolRegistry, RecordingBackend) {
        let backend = RecordingBackend::new();
        (ToolRegistry::new(Arc::new(backend.clone())), backend)
    }

    #[tokio::test]
    async fn test_invalid_arguments_never_reach_backend() {
        let (registry, backend) = registry();
        let result = registry
            .execute(ToolKind::Transfer, "not-an-address 5", "arbiter")
            .await;
        assert!(result.starts_with(ERROR_MARKER));
        assert!(is_error_result(&result));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_backend_failure_becomes_error_string() {
        let (registry, backend) = registry();
        backend.fail(ToolKind::CheckBalance, "rpc unavailable");
        let result = registry
            .execute(ToolKind::CheckBalance, ADDR, "sentinel")
            .await;
        assert!(result.starts_with("Error:"));
        assert!(result.contains("rpc unavailable"));
    }

    #[tokio::test]
    async fn test_successful_execution_passes_invoker() {
        let (registry, backend) = registry();
        backend.respond(ToolKind::CheckBalance, "1200.5 TRB");
        let result = registry
            .execute(ToolKind::CheckBalance, ADDR, "sentinel")
            .await;
        assert_eq!(result, "1200.5 TRB");
        assert!(!is_error_result(&result));

        let calls = backend.calls();
        assert_eq!(calls[0].invoker, "sentinel");
        assert_eq!(calls[0].argv, vec![ADDR.to_string()]);
    }

    #[tokio::test]
    async fn test_empty_output_is_reported_as_completion() {
        let (registry, backend) = registry();
        backend.respond(ToolKind::SetStatus, "");
        let result = registry
            .execute(ToolKind::SetStatus, "watching the mempool", "steward")
            .await;
        assert_eq!(result, "set_status completed");
    }

    #[test]
    fn test_catalogue_lists_every_tool() {
        let (registry, _) = registry();
        let prompt = registry.catalogue_prompt();
        for name in registry.tool_names() {
            assert!(prompt.contains(name), "missing {name}");
        }
        assert_eq!(registry.descriptors().len(), ToolKind::ALL.len());
        let mint = registry
            .descriptors()
            .iter()
            .find(|d| d.name == "mint_reward")
            .unwrap();
        assert_eq!(mint.restricted_role, Some("treasurer"));
        assert!(mint.is_write && !mint.is_self_service);
    }
}
