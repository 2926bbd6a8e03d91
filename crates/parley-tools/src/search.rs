use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

pub const DEFAULT_SEARCH_ENDPOINT: &str = "https://mcp.exa.ai/mcp";
pub const DEFAULT_SEARCH_RESULT_LIMIT: usize = 8;

/// Web search collaborator. Returns result URLs in rank order.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, query: &str, file_type: Option<&str>) -> anyhow::Result<Vec<String>>;
}

/// Search through Exa's hosted MCP endpoint (`web_search_exa`).
#[derive(Clone)]
pub struct ExaSearchBackend {
    endpoint: String,
    result_limit: usize,
    chunk_timeout: Duration,
    client: reqwest::Client,
}

impl ExaSearchBackend {
    pub fn new(endpoint: impl Into<String>, result_limit: usize) -> Self {
        Self {
            endpoint: endpoint.into(),
            result_limit: result_limit.clamp(1, 25),
            chunk_timeout: Duration::from_secs(10),
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ExaSearchBackend {
    fn default() -> Self {
        Self::new(DEFAULT_SEARCH_ENDPOINT, DEFAULT_SEARCH_RESULT_LIMIT)
    }
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    jsonrpc: &'static str,
    id: u32,
    method: &'static str,
    params: SearchParams<'a>,
}

#[derive(Serialize)]
struct SearchParams<'a> {
    name: &'static str,
    arguments: SearchArgs<'a>,
}

#[derive(Serialize)]
struct SearchArgs<'a> {
    query: &'a str,
    #[serde(rename = "numResults")]
    num_results: usize,
}

#[async_trait]
impl SearchBackend for ExaSearchBackend {
    async fn search(&self, query: &str, _file_type: Option<&str>) -> anyhow::Result<Vec<String>> {
        let request = SearchRequest {
            jsonrpc: "2.0",
            id: 1,
            method: "tools/call",
            params: SearchParams {
                name: "web_search_exa",
                arguments: SearchArgs {
                    query,
                    num_results: self.result_limit,
                },
            },
        };

        let res = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .json(&request)
            .send()
            .await?;

        if !res.status().is_success() {
            let error_text = res.text().await?;
            anyhow::bail!("Search error: {}", error_text);
        }

        let mut stream = res.bytes_stream();
        let mut buffer = Vec::new();
        loop {
            match tokio::time::timeout(self.chunk_timeout, stream.next()).await {
                Ok(Some(chunk)) => {
                    buffer.extend_from_slice(&chunk?);
                    while let Some(idx) = buffer.iter().position(|&b| b == b'\n') {
                        let line_bytes: Vec<u8> = buffer.drain(..=idx).collect();
                        let line = String::from_utf8_lossy(&line_bytes);
                        if let Some(text) = search_text_from_line(line.trim()) {
                            return Ok(extract_urls(&text, self.result_limit));
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!("search stream timed out waiting for chunk");
                    anyhow::bail!("search timed out after {:?}", self.chunk_timeout);
                }
            }
        }

        // Plain JSON replies arrive without a trailing newline.
        let rest = String::from_utf8_lossy(&buffer);
        match search_text_from_line(rest.trim()) {
            Some(text) => Ok(extract_urls(&text, self.result_limit)),
            None => {
                tracing::info!("search stream ended without result");
                Ok(Vec::new())
            }
        }
    }
}

fn search_text_from_line(line: &str) -> Option<String> {
    let data = line.strip_prefix("data:").unwrap_or(line).trim();
    let value = serde_json::from_str::<Value>(data).ok()?;
    let content = value.get("result")?.get("content")?.as_array()?;
    let text = content
        .iter()
        .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join("\n");
    (!text.is_empty()).then_some(text)
}

/// Pulls distinct http(s) URLs out of free text, keeping first-seen order.
pub fn extract_urls(text: &str, limit: usize) -> Vec<String> {
    let Ok(re) = Regex::new(r#"https?://[^\s"'<>\)\]]+"#) else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    re.find_iter(text)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';']).to_string())
        .filter(|url| seen.insert(url.clone()))
        .take(limit)
        .collect()
}
