use async_trait::async_trait;
use serde_json::Value;

use parley_types::ToolDefinition;

/// Lists the tools the external tool service currently offers.
#[async_trait]
pub trait RemoteToolRegistry: Send + Sync {
    async fn list_available(&self) -> anyhow::Result<Vec<ToolDefinition>>;
}

/// Executes a tool on the external tool service. The returned payload is
/// opaque, typically JSON text.
#[async_trait]
pub trait RemoteToolExecutor: Send + Sync {
    async fn execute(&self, tool_name: &str, arguments: Value) -> anyhow::Result<String>;
}

/// Stand-in used when no external tool service is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableRemoteTools;

#[async_trait]
impl RemoteToolRegistry for UnavailableRemoteTools {
    async fn list_available(&self) -> anyhow::Result<Vec<ToolDefinition>> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl RemoteToolExecutor for UnavailableRemoteTools {
    async fn execute(&self, tool_name: &str, _arguments: Value) -> anyhow::Result<String> {
        anyhow::bail!("no external tool service is configured to run `{tool_name}`")
    }
}
