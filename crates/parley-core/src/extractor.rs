use std::collections::HashSet;

use regex::Regex;
use serde_json::Value;

use parley_types::{ToolArgValue, ToolArguments, ToolCallRequest, ToolDefinition};

/// Tools that may be called without arguments.
pub const DEFAULT_PARAMETERLESS_TOOLS: [&str; 1] = ["get_page_posts"];

const ACTION_MARKER: &str = "ACTION:";
const PARAMETERS_MARKER: &str = "PARAMETERS:";
const EXPLANATION_MARKER: &str = "EXPLANATION:";

/// One level of brace nesting, enough for `{"function":..,"parameters":{..}}`.
const EMBEDDED_OBJECT_PATTERN: &str = r"\{(?:[^{}]|\{[^{}]*\})*\}";

/// Closed allow-list of tool names exempt from the "at least one argument"
/// rule. Not derived from schema `required` sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterlessPolicy {
    names: HashSet<String>,
}

impl ParameterlessPolicy {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names
                .into_iter()
                .map(Into::into)
                .map(|name: String| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect(),
        }
    }

    pub fn allows(&self, tool_name: &str) -> bool {
        self.names.contains(tool_name)
    }

    /// Whether an extracted call is worth emitting.
    pub fn accepts(&self, tool_name: &str, arguments: &ToolArguments) -> bool {
        !tool_name.is_empty() && (!arguments.is_empty() || self.allows(tool_name))
    }
}

impl Default for ParameterlessPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_PARAMETERLESS_TOOLS)
    }
}

/// A surface grammar for tool calls embedded in assistant text. Malformed
/// input yields an empty vec, never an error.
pub trait ToolCallExtractor: Send + Sync {
    fn name(&self) -> &'static str;
    fn extract(&self, content: &str, policy: &ParameterlessPolicy) -> Vec<ToolCallRequest>;
}

/// `ACTION:` / `PARAMETERS:` / `EXPLANATION:` blocks with `key=value` lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActionBlockExtractor;

struct OpenBlock {
    tool_name: String,
    arguments: ToolArguments,
}

impl OpenBlock {
    fn close(self, policy: &ParameterlessPolicy, out: &mut Vec<ToolCallRequest>) {
        if policy.accepts(&self.tool_name, &self.arguments) {
            out.push(ToolCallRequest::new(self.tool_name, self.arguments));
        } else {
            tracing::debug!(
                "dropping action block `{}` with no arguments",
                self.tool_name
            );
        }
    }
}

impl ToolCallExtractor for ActionBlockExtractor {
    fn name(&self) -> &'static str {
        "action_block"
    }

    fn extract(&self, content: &str, policy: &ParameterlessPolicy) -> Vec<ToolCallRequest> {
        let mut calls = Vec::new();
        let mut open: Option<OpenBlock> = None;

        for raw_line in content.lines() {
            let line = raw_line.trim();
            if let Some(rest) = strip_marker(line, ACTION_MARKER) {
                if let Some(block) = open.take() {
                    block.close(policy, &mut calls);
                }
                open = Some(OpenBlock {
                    tool_name: rest.trim().to_string(),
                    arguments: ToolArguments::new(),
                });
                continue;
            }
            if strip_marker(line, PARAMETERS_MARKER).is_some() {
                continue;
            }
            if strip_marker(line, EXPLANATION_MARKER).is_some() {
                if let Some(block) = open.take() {
                    block.close(policy, &mut calls);
                }
                continue;
            }
            let Some(block) = open.as_mut() else {
                continue;
            };
            if line.matches('=').count() != 1 {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                if key.is_empty() {
                    continue;
                }
                block
                    .arguments
                    .insert(key.to_string(), ToolArgValue::from(value.trim()));
            }
        }
        if let Some(block) = open.take() {
            block.close(policy, &mut calls);
        }
        calls
    }
}

/// Case-insensitive marker match at the start of an already trimmed line.
fn strip_marker<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    let head = line.get(..marker.len())?;
    if head.eq_ignore_ascii_case(marker) {
        line.get(marker.len()..)
    } else {
        None
    }
}

/// `{"function": "...", "parameters": {...}}` objects anywhere in the text.
#[derive(Debug, Clone)]
pub struct EmbeddedJsonExtractor {
    pattern: Option<Regex>,
}

impl Default for EmbeddedJsonExtractor {
    fn default() -> Self {
        Self {
            pattern: Regex::new(EMBEDDED_OBJECT_PATTERN).ok(),
        }
    }
}

impl ToolCallExtractor for EmbeddedJsonExtractor {
    fn name(&self) -> &'static str {
        "embedded_json"
    }

    fn extract(&self, content: &str, policy: &ParameterlessPolicy) -> Vec<ToolCallRequest> {
        let Some(pattern) = self.pattern.as_ref() else {
            return Vec::new();
        };
        let mut calls = Vec::new();
        for candidate in pattern.find_iter(content) {
            let value = match serde_json::from_str::<Value>(candidate.as_str()) {
                Ok(value) => value,
                Err(err) => {
                    tracing::debug!("skipping unparsable JSON candidate: {}", err);
                    continue;
                }
            };
            let Some(function) = value.get("function").and_then(|v| v.as_str()) else {
                continue;
            };
            let tool_name = function.trim();
            let arguments = value
                .get("parameters")
                .and_then(|v| v.as_object())
                .map(|params| {
                    params
                        .iter()
                        .map(|(key, value)| (key.clone(), textual_argument(value)))
                        .collect::<ToolArguments>()
                })
                .unwrap_or_default();
            if policy.accepts(tool_name, &arguments) {
                calls.push(ToolCallRequest::new(tool_name, arguments));
            }
        }
        calls
    }
}

/// Scalars become their textual spelling; arrays and objects stay raw JSON.
fn textual_argument(value: &Value) -> ToolArgValue {
    match value {
        Value::Array(_) | Value::Object(_) => ToolArgValue::Json(value.to_string()),
        other => ToolArgValue::String(ToolArgValue::from_json(other).as_text()),
    }
}

/// Ordered extractor strategies; the first one that finds any call wins and
/// results from different grammars are never merged.
pub struct ExtractorChain {
    strategies: Vec<Box<dyn ToolCallExtractor>>,
    policy: ParameterlessPolicy,
}

impl ExtractorChain {
    pub fn new(policy: ParameterlessPolicy) -> Self {
        Self {
            strategies: vec![
                Box::new(ActionBlockExtractor),
                Box::new(EmbeddedJsonExtractor::default()),
            ],
            policy,
        }
    }

    pub fn with_strategies(
        strategies: Vec<Box<dyn ToolCallExtractor>>,
        policy: ParameterlessPolicy,
    ) -> Self {
        Self { strategies, policy }
    }

    pub fn policy(&self) -> &ParameterlessPolicy {
        &self.policy
    }

    /// `available_tools` only canonicalizes spelling; calls naming tools
    /// outside the list are still returned.
    pub fn extract(&self, content: &str, available_tools: &[ToolDefinition]) -> Vec<ToolCallRequest> {
        self.extract_filtered(content, available_tools, |_| true)
    }

    /// Like [`extract`](Self::extract), but `keep` is applied to each
    /// strategy's calls before precedence is decided, so a grammar whose
    /// calls are all rejected yields to the next one.
    pub fn extract_filtered<F>(
        &self,
        content: &str,
        available_tools: &[ToolDefinition],
        keep: F,
    ) -> Vec<ToolCallRequest>
    where
        F: Fn(&ToolCallRequest) -> bool,
    {
        for strategy in &self.strategies {
            let calls = strategy
                .extract(content, &self.policy)
                .into_iter()
                .map(|mut call| {
                    call.tool_name = canonical_tool_name(&call.tool_name, available_tools);
                    call
                })
                .filter(|call| keep(call))
                .collect::<Vec<_>>();
            if calls.is_empty() {
                continue;
            }
            tracing::debug!(
                "extractor `{}` found {} tool call(s)",
                strategy.name(),
                calls.len()
            );
            return calls;
        }
        Vec::new()
    }
}

impl Default for ExtractorChain {
    fn default() -> Self {
        Self::new(ParameterlessPolicy::default())
    }
}

/// Trims `name` and adopts the catalog's spelling on a case-insensitive match.
pub fn canonical_tool_name(name: &str, available_tools: &[ToolDefinition]) -> String {
    let trimmed = name.trim();
    available_tools
        .iter()
        .find(|tool| tool.name == trimmed)
        .or_else(|| {
            available_tools
                .iter()
                .find(|tool| tool.name.eq_ignore_ascii_case(trimmed))
        })
        .map(|tool| tool.name.clone())
        .unwrap_or_else(|| trimmed.to_string())
}

/// Both line-grammar markers appear verbatim somewhere in `content`.
pub fn has_action_markers(content: &str) -> bool {
    content.contains(ACTION_MARKER) && content.contains(PARAMETERS_MARKER)
}
