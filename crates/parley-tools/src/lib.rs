use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use parley_types::{ParameterSchema, PropertySchema, ToolDefinition};

pub mod fetch;
pub mod mcp;
pub mod remote;
pub mod search;

pub use fetch::{reduce_html_to_text, HttpPageFetcher, PageFetcher, DEFAULT_FETCH_MAX_CHARS};
pub use mcp::McpToolService;
pub use remote::{RemoteToolExecutor, RemoteToolRegistry, UnavailableRemoteTools};
pub use search::{
    extract_urls, ExaSearchBackend, SearchBackend, DEFAULT_SEARCH_ENDPOINT,
    DEFAULT_SEARCH_RESULT_LIMIT,
};

pub const WEB_SEARCH_TOOL: &str = "web_search";
pub const FETCH_PAGE_TOOL: &str = "fetch_page";

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolDefinition;
    async fn execute(&self, args: Value) -> anyhow::Result<Value>;
}

#[derive(Clone)]
pub struct LocalToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl LocalToolRegistry {
    pub fn new(search: Arc<dyn SearchBackend>, fetcher: Arc<dyn PageFetcher>) -> Self {
        let mut tools: HashMap<String, Arc<dyn Tool>> = HashMap::new();
        tools.insert(
            WEB_SEARCH_TOOL.to_string(),
            Arc::new(WebSearchTool::new(search)),
        );
        tools.insert(
            FETCH_PAGE_TOOL.to_string(),
            Arc::new(FetchPageTool::new(fetcher)),
        );
        Self { tools }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn list(&self) -> Vec<ToolDefinition> {
        let mut schemas = self.tools.values().map(|t| t.schema()).collect::<Vec<_>>();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }
}

fn missing_parameter(name: &str) -> Value {
    json!({ "error": format!("Missing {name} parameter") })
}

fn non_blank_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub struct WebSearchTool {
    backend: Arc<dyn SearchBackend>,
}

impl WebSearchTool {
    pub fn new(backend: Arc<dyn SearchBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn schema(&self) -> ToolDefinition {
        ToolDefinition::new(
            WEB_SEARCH_TOOL,
            "Search the web and return result URLs",
            ParameterSchema::default()
                .property("query", PropertySchema::new("string", "Search query"))
                .property(
                    "file_type",
                    PropertySchema::new("string", "Restrict results to a file type, e.g. pdf"),
                )
                .require("query"),
        )
    }

    async fn execute(&self, args: Value) -> anyhow::Result<Value> {
        let Some(query) = non_blank_str(&args, "query") else {
            tracing::warn!("web_search missing query. Args: {}", args);
            return Ok(missing_parameter("query"));
        };
        let file_type = non_blank_str(&args, "file_type");
        let effective_query = match file_type {
            Some(kind) => format!("{query} filetype:{kind}"),
            None => query.to_string(),
        };
        let results = self.backend.search(&effective_query, file_type).await?;
        Ok(json!({
            "results": results,
            "originalQuery": query,
        }))
    }
}

pub struct FetchPageTool {
    fetcher: Arc<dyn PageFetcher>,
}

impl FetchPageTool {
    pub fn new(fetcher: Arc<dyn PageFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl Tool for FetchPageTool {
    fn schema(&self) -> ToolDefinition {
        ToolDefinition::new(
            FETCH_PAGE_TOOL,
            "Fetch a web page and return its text content",
            ParameterSchema::default()
                .property("url", PropertySchema::new("string", "Absolute URL to fetch"))
                .require("url"),
        )
    }

    async fn execute(&self, args: Value) -> anyhow::Result<Value> {
        let Some(url) = non_blank_str(&args, "url") else {
            tracing::warn!("fetch_page missing url. Args: {}", args);
            return Ok(missing_parameter("url"));
        };
        let content = self.fetcher.fetch(url).await?;
        Ok(json!({
            "url": url,
            "content": content,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSchemaValidationError {
    pub tool_name: String,
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for ToolSchemaValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid tool schema `{}` at `{}`: {}",
            self.tool_name, self.path, self.reason
        )
    }
}

impl std::error::Error for ToolSchemaValidationError {}

pub fn validate_tool_schema(tool: &ToolDefinition) -> Result<(), ToolSchemaValidationError> {
    if tool.name.trim().is_empty() {
        return Err(ToolSchemaValidationError {
            tool_name: tool.name.clone(),
            path: "$".to_string(),
            reason: "tool name is empty".to_string(),
        });
    }
    validate_schema_node(&tool.name, "$", &tool.parameter_schema.to_json())
}

fn validate_schema_node(
    tool_name: &str,
    path: &str,
    value: &Value,
) -> Result<(), ToolSchemaValidationError> {
    let Some(obj) = value.as_object() else {
        if let Some(arr) = value.as_array() {
            for (idx, item) in arr.iter().enumerate() {
                validate_schema_node(tool_name, &format!("{path}[{idx}]"), item)?;
            }
        }
        return Ok(());
    };

    if obj.get("type").and_then(|t| t.as_str()) == Some("array") && !obj.contains_key("items") {
        return Err(ToolSchemaValidationError {
            tool_name: tool_name.to_string(),
            path: path.to_string(),
            reason: "array schema missing items".to_string(),
        });
    }

    if let Some(items) = obj.get("items") {
        validate_schema_node(tool_name, &format!("{path}.items"), items)?;
    }
    if let Some(props) = obj.get("properties").and_then(|v| v.as_object()) {
        for (key, child) in props {
            validate_schema_node(tool_name, &format!("{path}.properties.{key}"), child)?;
        }
    }
    for combinator in ["oneOf", "anyOf", "allOf"] {
        if let Some(children) = obj.get(combinator).and_then(|v| v.as_array()) {
            for (idx, child) in children.iter().enumerate() {
                validate_schema_node(tool_name, &format!("{path}.{combinator}[{idx}]"), child)?;
            }
        }
    }

    Ok(())
}
