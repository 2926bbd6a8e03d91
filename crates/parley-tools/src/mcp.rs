use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use parley_types::{ParameterSchema, ToolDefinition};

use crate::remote::{RemoteToolExecutor, RemoteToolRegistry};

const MCP_PROTOCOL_VERSION: &str = "2025-06-18";
const MCP_CLIENT_NAME: &str = "parley";
const MCP_CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");
const MCP_REQUEST_TIMEOUT: Duration = Duration::from_secs(12);

struct CachedTools {
    fetched_at: Instant,
    tools: Vec<ToolDefinition>,
}

/// External tool service spoken to over MCP's HTTP JSON-RPC transport.
/// `tools/list` results are cached for `cache_ttl`.
#[derive(Clone)]
pub struct McpToolService {
    endpoint: String,
    headers: HashMap<String, String>,
    cache_ttl: Duration,
    cache: Arc<RwLock<Option<CachedTools>>>,
}

impl McpToolService {
    pub fn new(endpoint: impl Into<String>, headers: HashMap<String, String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            headers,
            cache_ttl: Duration::from_secs(60),
            cache: Arc::new(RwLock::new(None)),
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn invalidate_cache(&self) {
        *self.cache.write().await = None;
    }

    async fn discover_tools(&self) -> anyhow::Result<Vec<ToolDefinition>> {
        let initialize = json!({
            "jsonrpc": "2.0",
            "id": "initialize-1",
            "method": "initialize",
            "params": {
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": MCP_CLIENT_NAME,
                    "version": MCP_CLIENT_VERSION,
                }
            }
        });
        let init_response = post_json_rpc(&self.endpoint, &self.headers, initialize).await?;
        rpc_result(&init_response, "MCP initialize failed")?;

        let tools_list = json!({
            "jsonrpc": "2.0",
            "id": "tools-list-1",
            "method": "tools/list",
            "params": {}
        });
        let tools_response = post_json_rpc(&self.endpoint, &self.headers, tools_list).await?;
        let result = rpc_result(&tools_response, "MCP tools/list failed")?;
        parse_tool_list(&result)
    }
}

#[async_trait]
impl RemoteToolRegistry for McpToolService {
    async fn list_available(&self) -> anyhow::Result<Vec<ToolDefinition>> {
        if let Some(cached) = self.cache.read().await.as_ref() {
            if cached.fetched_at.elapsed() < self.cache_ttl {
                return Ok(cached.tools.clone());
            }
        }
        let tools = self.discover_tools().await?;
        tracing::debug!(
            "discovered {} external tools from {}",
            tools.len(),
            self.endpoint
        );
        *self.cache.write().await = Some(CachedTools {
            fetched_at: Instant::now(),
            tools: tools.clone(),
        });
        Ok(tools)
    }
}

#[async_trait]
impl RemoteToolExecutor for McpToolService {
    async fn execute(&self, tool_name: &str, arguments: Value) -> anyhow::Result<String> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": format!("call-{}-{}", tool_name, now_ms()),
            "method": "tools/call",
            "params": {
                "name": tool_name,
                "arguments": arguments
            }
        });
        let response = post_json_rpc(&self.endpoint, &self.headers, request).await?;
        let result = rpc_result(&response, "MCP tools/call failed")?;
        if result.get("isError").and_then(|v| v.as_bool()) == Some(true) {
            let message = result
                .get("content")
                .map(render_mcp_content)
                .unwrap_or_else(|| format!("tool `{tool_name}` reported an error"));
            anyhow::bail!(message);
        }
        Ok(result
            .get("content")
            .map(render_mcp_content)
            .or_else(|| result.get("output").map(|v| v.to_string()))
            .unwrap_or_else(|| result.to_string()))
    }
}

fn rpc_result(response: &Value, fallback: &str) -> anyhow::Result<Value> {
    if let Some(err) = response.get("error") {
        let message = err
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or(fallback);
        anyhow::bail!(message.to_string());
    }
    Ok(response.get("result").cloned().unwrap_or(Value::Null))
}

fn parse_tool_list(result: &Value) -> anyhow::Result<Vec<ToolDefinition>> {
    let Some(tools) = result.get("tools").and_then(|v| v.as_array()) else {
        anyhow::bail!("MCP tools/list result missing tools array");
    };
    let mut out = Vec::new();
    for row in tools {
        let Some(tool_name) = row.get("name").and_then(|v| v.as_str()) else {
            continue;
        };
        let description = row
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let input_schema = row
            .get("inputSchema")
            .or_else(|| row.get("input_schema"))
            .cloned()
            .unwrap_or_else(|| json!({"type":"object"}));
        out.push(ToolDefinition::new(
            tool_name,
            description,
            ParameterSchema::from_json_schema(&input_schema),
        ));
    }
    Ok(out)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn build_headers(headers: &HashMap<String, String>) -> anyhow::Result<HeaderMap> {
    let mut map = HeaderMap::new();
    map.insert(
        ACCEPT,
        HeaderValue::from_static("application/json, text/event-stream"),
    );
    map.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.trim().as_bytes())
            .map_err(|e| anyhow::anyhow!("Invalid header name '{key}': {e}"))?;
        let header = HeaderValue::from_str(value.trim())
            .map_err(|e| anyhow::anyhow!("Invalid header value for '{key}': {e}"))?;
        map.insert(name, header);
    }
    Ok(map)
}

pub(crate) async fn post_json_rpc(
    endpoint: &str,
    headers: &HashMap<String, String>,
    request: Value,
) -> anyhow::Result<Value> {
    let client = reqwest::Client::builder()
        .timeout(MCP_REQUEST_TIMEOUT)
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {e}"))?;
    let response = client
        .post(endpoint)
        .headers(build_headers(headers)?)
        .json(&request)
        .send()
        .await
        .map_err(|e| anyhow::anyhow!("MCP request failed: {e}"))?;
    let status = response.status();
    let payload = response
        .text()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read MCP response: {e}"))?;
    if !status.is_success() {
        anyhow::bail!(
            "MCP endpoint returned HTTP {}: {}",
            status.as_u16(),
            payload.chars().take(400).collect::<String>()
        );
    }
    parse_json_rpc_payload(&payload)
}

/// Accepts either a plain JSON body or an SSE body whose `data:` lines carry
/// JSON-RPC messages; the last message that parses wins.
pub(crate) fn parse_json_rpc_payload(payload: &str) -> anyhow::Result<Value> {
    let trimmed = payload.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }
    trimmed
        .lines()
        .filter_map(|line| line.trim().strip_prefix("data:"))
        .filter_map(|data| serde_json::from_str::<Value>(data.trim()).ok())
        .last()
        .ok_or_else(|| {
            anyhow::anyhow!(
                "Invalid MCP response: {}",
                trimmed.chars().take(200).collect::<String>()
            )
        })
}

pub(crate) fn render_mcp_content(value: &Value) -> String {
    let Some(items) = value.as_array() else {
        return value.to_string();
    };
    let mut chunks = Vec::new();
    for item in items {
        if let Some(text) = item.get("text").and_then(|v| v.as_str()) {
            chunks.push(text.to_string());
            continue;
        }
        chunks.push(item.to_string());
    }
    if chunks.is_empty() {
        value.to_string()
    } else {
        chunks.join("\n")
    }
}
