use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use parley_types::{
    arguments_to_json, parse_tool_arguments, Message, MessageRole, ModelInfo, ProviderInfo,
    ToolCallRequest, ToolDefinition,
};

use crate::{ChatChoice, ChatRequest, ChatResponse, Provider, TokenUsage};

pub struct OpenAICompatibleProvider {
    id: String,
    name: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: Client,
}

impl OpenAICompatibleProvider {
    pub fn new(
        id: &str,
        name: &str,
        base_url: &str,
        api_key: Option<String>,
        default_model: &str,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            base_url: normalize_base(base_url),
            api_key,
            default_model: default_model.to_string(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl Provider for OpenAICompatibleProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            models: vec![ModelInfo {
                id: self.default_model.clone(),
                provider_id: self.id.clone(),
                supports_tools: true,
            }],
        }
    }

    async fn chat(&self, request: ChatRequest) -> anyhow::Result<ChatResponse> {
        let model = request
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str())
            .to_string();
        let url = format!("{}/chat/completions", self.base_url);

        let wire_messages = request
            .messages
            .iter()
            .map(message_to_wire)
            .collect::<Vec<_>>();
        let wire_tools = request
            .tools
            .unwrap_or_default()
            .iter()
            .map(tool_to_wire)
            .collect::<Vec<_>>();

        let mut body = json!({
            "model": model,
            "messages": wire_messages,
            "max_tokens": request.max_tokens,
            "stream": false,
        });
        if !wire_tools.is_empty() {
            body["tools"] = Value::Array(wire_tools);
            body["tool_choice"] = json!("auto");
        }

        let mut req = self.client.post(url).json(&body);
        if self.id == "openrouter" {
            req = req.header("X-Title", "Parley");
        }
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }

        tracing::debug!(
            provider = %self.id,
            model = %model,
            messages = request.messages.len(),
            "sending chat completion"
        );
        let response = req.send().await?;
        let status = response.status();
        let text = response.text().await?;
        let value = serde_json::from_str::<Value>(&text).unwrap_or(Value::Null);

        if !status.is_success() {
            let detail = extract_openai_error(&value).unwrap_or_else(|| {
                format!(
                    "provider request failed with status {}: {}",
                    status,
                    truncate_for_error(&text, 500)
                )
            });
            tracing::warn!(provider = %self.id, %status, "chat completion failed");
            anyhow::bail!(detail);
        }
        if let Some(detail) = extract_openai_error(&value) {
            anyhow::bail!(detail);
        }
        if value.is_null() {
            anyhow::bail!(
                "provider returned a non-JSON body for model `{}`: {}",
                model,
                truncate_for_error(&text, 500)
            );
        }

        Ok(parse_chat_response(&value))
    }
}

pub fn message_to_wire(message: &Message) -> Value {
    let mut wire = json!({
        "role": message.role.as_str(),
        "content": message.content.clone().unwrap_or_default(),
    });
    if let Some(calls) = message.tool_calls.as_ref().filter(|c| !c.is_empty()) {
        wire["tool_calls"] = Value::Array(
            calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id.clone().unwrap_or_default(),
                        "type": "function",
                        "function": {
                            "name": call.tool_name,
                            "arguments": arguments_to_json(&call.arguments).to_string(),
                        }
                    })
                })
                .collect(),
        );
    }
    if let Some(id) = &message.tool_call_id {
        wire["tool_call_id"] = json!(id);
    }
    if let Some(name) = &message.name {
        wire["name"] = json!(name);
    }
    wire
}

pub fn tool_to_wire(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameter_schema.to_json(),
        }
    })
}

/// Reads an OpenAI-style `chat/completions` body. Choices that cannot be read
/// are skipped, so a malformed body yields zero choices rather than an error.
pub fn parse_chat_response(value: &Value) -> ChatResponse {
    let choices = value
        .get("choices")
        .and_then(|v| v.as_array())
        .map(|choices| choices.iter().filter_map(parse_choice).collect())
        .unwrap_or_default();
    ChatResponse {
        choices,
        usage: extract_usage(value),
    }
}

fn parse_choice(choice: &Value) -> Option<ChatChoice> {
    let message = choice.get("message")?;
    let role = match message.get("role").and_then(|v| v.as_str()) {
        Some("tool") => MessageRole::Tool,
        Some("user") => MessageRole::User,
        Some("system") => MessageRole::System,
        _ => MessageRole::Assistant,
    };
    let content = message
        .get("content")
        .and_then(|v| v.as_str())
        .map(ToString::to_string);
    let tool_calls = message
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .map(|calls| calls.iter().filter_map(parse_wire_tool_call).collect::<Vec<_>>())
        .filter(|calls| !calls.is_empty());
    let finish_reason = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .unwrap_or("stop")
        .to_string();

    let message = Message {
        role,
        content: if tool_calls.is_some() {
            Some(content.unwrap_or_default())
        } else {
            content
        },
        tool_calls,
        tool_call_id: None,
        name: None,
    };
    Some(ChatChoice {
        message,
        finish_reason,
    })
}

fn parse_wire_tool_call(call: &Value) -> Option<ToolCallRequest> {
    let function = call.get("function")?;
    let name = function.get("name").and_then(|v| v.as_str())?.trim();
    if name.is_empty() {
        return None;
    }
    let arguments = match function.get("arguments") {
        Some(Value::String(raw)) => parse_tool_arguments(raw),
        Some(Value::Object(obj)) => parley_types::arguments_from_object(obj),
        _ => Default::default(),
    };
    let mut request = ToolCallRequest::new(name, arguments);
    request.id = call
        .get("id")
        .and_then(|v| v.as_str())
        .filter(|id| !id.trim().is_empty())
        .map(ToString::to_string);
    Some(request)
}

fn normalize_base(input: &str) -> String {
    if input.ends_with("/v1") {
        input.trim_end_matches('/').to_string()
    } else {
        format!("{}/v1", input.trim_end_matches('/'))
    }
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.chars().count() <= max_len {
        input.to_string()
    } else {
        format!("{}...", input.chars().take(max_len).collect::<String>())
    }
}

fn extract_usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    let prompt_tokens = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion_tokens = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(prompt_tokens.saturating_add(completion_tokens));
    Some(TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    })
}

fn extract_openai_error(value: &Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_types::{ParameterSchema, PropertySchema, ToolArgValue, ToolArguments};

    #[test]
    fn parses_structured_tool_calls_with_string_arguments() {
        let body = json!({
            "choices": [{
                "finish_reason": "tool_calls",
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "web_search", "arguments": "{\"query\":\"rust\"}"}
                    }, {
                        "id": "call_2",
                        "type": "function",
                        "function": {"name": "fetch_page", "arguments": "{broken"}
                    }]
                }
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5}
        });
        let response = parse_chat_response(&body);
        assert_eq!(response.choices.len(), 1);
        let choice = &response.choices[0];
        assert!(choice.requests_tool_calls());
        assert_eq!(choice.message.content.as_deref(), Some(""));
        let calls = choice.message.tool_calls.as_ref().expect("tool calls");
        assert_eq!(calls[0].id.as_deref(), Some("call_1"));
        assert_eq!(
            calls[0].arguments.get("query"),
            Some(&ToolArgValue::String("rust".to_string()))
        );
        assert!(calls[1].arguments.is_empty());
        assert_eq!(response.usage.map(|u| u.total_tokens), Some(15));
    }

    #[test]
    fn missing_choices_yield_empty_response() {
        let response = parse_chat_response(&json!({"id": "x"}));
        assert!(response.choices.is_empty());
    }

    #[test]
    fn tool_messages_serialize_call_id_and_name() {
        let wire = message_to_wire(&Message::tool("call_9", "fetch_page", "{\"ok\":true}"));
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "call_9");
        assert_eq!(wire["name"], "fetch_page");
    }

    #[test]
    fn assistant_tool_calls_serialize_arguments_as_json_string() {
        let mut args = ToolArguments::new();
        args.insert("url".to_string(), ToolArgValue::from("https://example.com"));
        let msg = Message::assistant_with_tool_calls(
            None,
            vec![ToolCallRequest::new("fetch_page", args).with_id("call_3")],
        );
        let wire = message_to_wire(&msg);
        assert_eq!(wire["content"], "");
        let raw = wire["tool_calls"][0]["function"]["arguments"]
            .as_str()
            .expect("arguments string");
        assert_eq!(
            serde_json::from_str::<Value>(raw).expect("json"),
            json!({"url": "https://example.com"})
        );
    }

    #[test]
    fn tool_definitions_serialize_as_functions() {
        let tool = ToolDefinition::new(
            "web_search",
            "Search the web",
            ParameterSchema::default()
                .property("query", PropertySchema::new("string", "Search query"))
                .require("query"),
        );
        let wire = tool_to_wire(&tool);
        assert_eq!(wire["type"], "function");
        assert_eq!(wire["function"]["parameters"]["required"][0], "query");
    }

    #[test]
    fn base_url_gains_version_suffix() {
        assert_eq!(normalize_base("http://localhost:11434"), "http://localhost:11434/v1");
        assert_eq!(normalize_base("https://api.openai.com/v1"), "https://api.openai.com/v1");
    }
}
