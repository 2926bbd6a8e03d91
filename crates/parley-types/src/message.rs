use serde::{Deserialize, Serialize};

use crate::ToolArguments;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }
}

/// A normalized request to invoke one tool, produced either by the text
/// extractors or by the backend's structured tool-call field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: ToolArguments,
}

impl ToolCallRequest {
    pub fn new(tool_name: impl Into<String>, arguments: ToolArguments) -> Self {
        Self {
            id: None,
            tool_name: tool_name.into(),
            arguments,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn generate_id() -> String {
        format!("call_{}", uuid::Uuid::new_v4().simple())
    }
}

/// One entry of the conversation history sent to the text-generation backend.
///
/// A `tool` message always carries `tool_call_id` and `name`. An `assistant`
/// message that carries `tool_calls` has non-null (possibly empty) content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: MessageRole,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    fn with_role(role: MessageRole, content: Option<String>) -> Self {
        Self {
            role,
            content,
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::System, Some(content.into()))
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::User, Some(content.into()))
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::Assistant, Some(content.into()))
    }

    pub fn assistant_with_tool_calls(
        content: Option<String>,
        tool_calls: Vec<ToolCallRequest>,
    ) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: Some(content.unwrap_or_default()),
            tool_calls: Some(tool_calls),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn tool(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: MessageRole::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
        }
    }

    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls
            .as_ref()
            .map(|calls| !calls.is_empty())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_with_tool_calls_never_has_null_content() {
        let msg = Message::assistant_with_tool_calls(None, vec![]);
        assert_eq!(msg.content.as_deref(), Some(""));
        assert!(!msg.has_tool_calls());
    }

    #[test]
    fn tool_message_carries_call_id_and_name() {
        let msg = Message::tool("call_1", "web_search", "{}");
        assert_eq!(msg.role, MessageRole::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(msg.name.as_deref(), Some("web_search"));
    }

    #[test]
    fn generated_ids_are_prefixed_and_unique() {
        let a = ToolCallRequest::generate_id();
        let b = ToolCallRequest::generate_id();
        assert!(a.starts_with("call_"));
        assert_ne!(a, b);
    }
}
