use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Number, Value};

/// A single tool argument. Extractors produce `String` for line-oriented
/// `key=value` pairs; JSON sources keep scalars typed and nested structures
/// as raw JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum ToolArgValue {
    String(String),
    Number(Number),
    Bool(bool),
    Null,
    Json(String),
}

pub type ToolArguments = BTreeMap<String, ToolArgValue>;

impl ToolArgValue {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::String(s) => ToolArgValue::String(s.clone()),
            Value::Number(n) => ToolArgValue::Number(n.clone()),
            Value::Bool(b) => ToolArgValue::Bool(*b),
            Value::Null => ToolArgValue::Null,
            Value::Array(_) | Value::Object(_) => ToolArgValue::Json(value.to_string()),
        }
    }

    /// Textual form of the value: strings verbatim, scalars as their JSON
    /// spelling, nested values as raw JSON.
    pub fn as_text(&self) -> String {
        match self {
            ToolArgValue::String(s) => s.clone(),
            ToolArgValue::Number(n) => n.to_string(),
            ToolArgValue::Bool(b) => b.to_string(),
            ToolArgValue::Null => "null".to_string(),
            ToolArgValue::Json(raw) => raw.clone(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ToolArgValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ToolArgValue::String(s) => Value::String(s.clone()),
            ToolArgValue::Number(n) => Value::Number(n.clone()),
            ToolArgValue::Bool(b) => Value::Bool(*b),
            ToolArgValue::Null => Value::Null,
            ToolArgValue::Json(raw) => {
                serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.clone()))
            }
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            ToolArgValue::String(s) => s.trim().is_empty(),
            ToolArgValue::Null => true,
            _ => false,
        }
    }
}

impl From<Value> for ToolArgValue {
    fn from(value: Value) -> Self {
        ToolArgValue::from_json(&value)
    }
}

impl From<ToolArgValue> for Value {
    fn from(value: ToolArgValue) -> Self {
        value.to_json()
    }
}

impl From<&str> for ToolArgValue {
    fn from(value: &str) -> Self {
        ToolArgValue::String(value.to_string())
    }
}

impl From<String> for ToolArgValue {
    fn from(value: String) -> Self {
        ToolArgValue::String(value)
    }
}

pub fn arguments_from_object(obj: &Map<String, Value>) -> ToolArguments {
    obj.iter()
        .map(|(k, v)| (k.clone(), ToolArgValue::from_json(v)))
        .collect()
}

pub fn arguments_to_json(args: &ToolArguments) -> Value {
    Value::Object(
        args.iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect::<Map<String, Value>>(),
    )
}

/// Parses a backend-supplied JSON argument string. Anything that is not a
/// JSON object yields an empty map.
pub fn parse_tool_arguments(raw: &str) -> ToolArguments {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return ToolArguments::new();
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(obj)) => arguments_from_object(&obj),
        Ok(other) => {
            tracing::warn!("tool arguments are not a JSON object: {}", other);
            ToolArguments::new()
        }
        Err(err) => {
            tracing::warn!("failed to parse tool arguments: {}", err);
            ToolArguments::new()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PropertySchema {
    #[serde(rename = "type", default = "default_property_type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_property_type() -> String {
    "string".to_string()
}

fn default_schema_type() -> String {
    "object".to_string()
}

impl PropertySchema {
    pub fn new(kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            description: description.into(),
            allowed: None,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterSchema {
    #[serde(rename = "type", default = "default_schema_type")]
    pub kind: String,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySchema>,
    #[serde(default)]
    pub required: Vec<String>,
}

impl Default for ParameterSchema {
    fn default() -> Self {
        Self {
            kind: default_schema_type(),
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }
}

impl ParameterSchema {
    pub fn property(mut self, name: impl Into<String>, schema: PropertySchema) -> Self {
        self.properties.insert(name.into(), schema);
        self
    }

    pub fn require(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.required.contains(&name) {
            self.required.push(name);
        }
        self
    }

    /// Lenient conversion from an arbitrary JSON schema. Unknown shapes fall
    /// back to an empty object schema.
    pub fn from_json_schema(value: &Value) -> Self {
        let mut schema = serde_json::from_value::<ParameterSchema>(value.clone())
            .unwrap_or_default();
        schema.required.sort();
        schema.required.dedup();
        schema
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({"type": "object"}))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameter_schema: ParameterSchema,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameter_schema: ParameterSchema,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameter_schema,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecutionResult {
    pub function_name: String,
    pub parameters: ToolArguments,
    pub success: bool,
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub executed_at: DateTime<Utc>,
}

impl ToolExecutionResult {
    pub fn succeeded(
        function_name: impl Into<String>,
        parameters: ToolArguments,
        result: impl Into<String>,
    ) -> Self {
        Self {
            function_name: function_name.into(),
            parameters,
            success: true,
            result: result.into(),
            error_message: None,
            executed_at: Utc::now(),
        }
    }

    pub fn failed(
        function_name: impl Into<String>,
        parameters: ToolArguments,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        Self {
            function_name: function_name.into(),
            parameters,
            success: false,
            result: json!({ "error": message }).to_string(),
            error_message: Some(message),
            executed_at: Utc::now(),
        }
    }

    /// An `error` string inside the JSON payload. Local handlers report
    /// missing arguments this way while `success` stays true.
    pub fn payload_error(&self) -> Option<String> {
        serde_json::from_str::<Value>(&self.result)
            .ok()?
            .get("error")?
            .as_str()
            .map(ToString::to_string)
    }

    /// Text placed into a `tool` history message for this result.
    pub fn history_text(&self) -> String {
        match (&self.error_message, self.success) {
            (Some(message), false) => format!("Error: {message}"),
            _ => self.result.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_scalars_keep_their_textual_form() {
        let args = parse_tool_arguments(r#"{"a":true,"b":42,"c":null,"d":[1,2],"e":"x"}"#);
        assert_eq!(args["a"].as_text(), "true");
        assert_eq!(args["b"].as_text(), "42");
        assert_eq!(args["c"].as_text(), "null");
        assert_eq!(args["d"].as_text(), "[1,2]");
        assert_eq!(args["e"].as_text(), "x");
        assert!(matches!(args["d"], ToolArgValue::Json(_)));
    }

    #[test]
    fn malformed_arguments_yield_empty_map() {
        assert!(parse_tool_arguments("{not json").is_empty());
        assert!(parse_tool_arguments("[1,2,3]").is_empty());
        assert!(parse_tool_arguments("   ").is_empty());
    }

    #[test]
    fn raw_json_values_serialize_as_structured_json() {
        let mut args = ToolArguments::new();
        args.insert("tags".to_string(), ToolArgValue::Json("[\"a\",\"b\"]".to_string()));
        args.insert("count".to_string(), ToolArgValue::String("3".to_string()));
        let value = arguments_to_json(&args);
        assert_eq!(value, json!({"tags": ["a", "b"], "count": "3"}));
    }

    #[test]
    fn failed_result_wraps_message_in_error_payload() {
        let result = ToolExecutionResult::failed("post", ToolArguments::new(), "boom");
        assert!(!result.success);
        assert_eq!(result.error_message.as_deref(), Some("boom"));
        assert_eq!(result.payload_error().as_deref(), Some("boom"));
        assert_eq!(result.history_text(), "Error: boom");
    }

    #[test]
    fn schema_from_json_keeps_property_extras() {
        let schema = ParameterSchema::from_json_schema(&json!({
            "type": "object",
            "properties": {
                "tags": {"type": "array", "items": {"type": "string"}},
                "mode": {"type": "string", "enum": ["a", "b"]}
            },
            "required": ["tags", "tags"]
        }));
        assert_eq!(schema.required, vec!["tags".to_string()]);
        assert!(schema.properties["tags"].extra.contains_key("items"));
        assert_eq!(schema.properties["mode"].allowed.as_ref().map(Vec::len), Some(2));
    }
}
