use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Number, Value};
use tracing::Level;

use parley_observability::{emit_event, ObservabilityEvent, ProcessKind};
use parley_tools::{LocalToolRegistry, RemoteToolExecutor};
use parley_types::{
    ParameterSchema, ToolArgValue, ToolArguments, ToolCallRequest, ToolDefinition,
    ToolExecutionResult,
};

const SUMMARY_MAX_CHARS: usize = 500;

/// Resolves each call to a local handler or the external tool service and
/// records the outcome. Failures become failed results, never errors.
#[derive(Clone)]
pub struct ToolExecutor {
    local: LocalToolRegistry,
    remote: Arc<dyn RemoteToolExecutor>,
    schemas: Arc<HashMap<String, ParameterSchema>>,
}

impl ToolExecutor {
    pub fn new(local: LocalToolRegistry, remote: Arc<dyn RemoteToolExecutor>) -> Self {
        let schemas = local
            .list()
            .into_iter()
            .map(|tool| (tool.name, tool.parameter_schema))
            .collect::<HashMap<_, _>>();
        Self {
            local,
            remote,
            schemas: Arc::new(schemas),
        }
    }

    /// Copy that also knows the parameter schemas of `tools`, used to
    /// coerce arguments before dispatch.
    pub fn for_catalog(&self, tools: &[ToolDefinition]) -> Self {
        let mut schemas = (*self.schemas).clone();
        for tool in tools {
            schemas
                .entry(tool.name.clone())
                .or_insert_with(|| tool.parameter_schema.clone());
        }
        Self {
            local: self.local.clone(),
            remote: self.remote.clone(),
            schemas: Arc::new(schemas),
        }
    }

    pub async fn execute(&self, tool_name: &str, arguments: ToolArguments) -> ToolExecutionResult {
        let payload = coerce_arguments(&arguments, self.schemas.get(tool_name));
        emit_event(
            Level::DEBUG,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "tool.exec.start",
                component: "executor",
                tool_name: Some(tool_name),
                ..Default::default()
            },
        );

        let outcome = match self.local.get(tool_name) {
            Some(tool) => tool.execute(payload).await.map(|value| value.to_string()),
            None => self.remote.execute(tool_name, payload).await,
        };

        match outcome {
            Ok(result) => {
                let result = ToolExecutionResult::succeeded(tool_name, arguments, result);
                let status = if result.payload_error().is_some() {
                    "payload_error"
                } else {
                    "ok"
                };
                emit_event(
                    Level::INFO,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        event: "tool.exec.finish",
                        component: "executor",
                        tool_name: Some(tool_name),
                        status: Some(status),
                        ..Default::default()
                    },
                );
                result
            }
            Err(err) => {
                let message = err.to_string();
                emit_event(
                    Level::WARN,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        event: "tool.exec.error",
                        component: "executor",
                        tool_name: Some(tool_name),
                        status: Some("failed"),
                        detail: Some(&message),
                        ..Default::default()
                    },
                );
                ToolExecutionResult::failed(tool_name, arguments, message)
            }
        }
    }

    /// Runs `calls` strictly in order. Returns one result and one summary
    /// per call.
    pub async fn execute_batch(
        &self,
        calls: &[ToolCallRequest],
    ) -> (Vec<ToolExecutionResult>, Vec<String>) {
        let mut results = Vec::with_capacity(calls.len());
        let mut summaries = Vec::with_capacity(calls.len());
        for call in calls {
            let result = self.execute(&call.tool_name, call.arguments.clone()).await;
            summaries.push(render_execution_summary(&result));
            results.push(result);
        }
        (results, summaries)
    }
}

/// Human-readable line describing one execution.
pub fn render_execution_summary(result: &ToolExecutionResult) -> String {
    if !result.success {
        let message = result.error_message.as_deref().unwrap_or("unknown error");
        return format!("Tool `{}` failed: {}", result.function_name, message);
    }
    if let Some(error) = result.payload_error() {
        return format!("Tool `{}` reported an error: {}", result.function_name, error);
    }
    format!(
        "Tool `{}` executed successfully: {}",
        result.function_name,
        truncate_chars(&result.result, SUMMARY_MAX_CHARS)
    )
}

fn truncate_chars(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        input.to_string()
    } else {
        format!("{}...", input.chars().take(max_chars).collect::<String>())
    }
}

/// Builds the JSON argument object sent to a handler. Declared property types
/// drive conversion of textual values; values that do not convert are passed
/// through unchanged.
pub fn coerce_arguments(arguments: &ToolArguments, schema: Option<&ParameterSchema>) -> Value {
    let mut out = Map::new();
    for (key, value) in arguments {
        let kind = schema
            .and_then(|s| s.properties.get(key))
            .map(|p| p.kind.as_str());
        out.insert(key.clone(), coerce_value(value, kind));
    }
    Value::Object(out)
}

fn coerce_value(value: &ToolArgValue, kind: Option<&str>) -> Value {
    let text = match value {
        ToolArgValue::String(s) => Some(s.trim()),
        ToolArgValue::Json(raw) => Some(raw.trim()),
        _ => None,
    };
    match (kind, text) {
        (Some("integer"), Some(text)) => text
            .parse::<i64>()
            .map(|n| Value::Number(n.into()))
            .unwrap_or_else(|_| value.to_json()),
        (Some("number"), Some(text)) => text
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| value.to_json()),
        (Some("boolean"), Some(text)) => match text.to_ascii_lowercase().as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => value.to_json(),
        },
        (Some("array") | Some("object"), Some(text)) => {
            serde_json::from_str::<Value>(text).unwrap_or_else(|_| value.to_json())
        }
        (Some("string"), None) => Value::String(value.as_text()),
        (Some("string"), Some(_)) if matches!(value, ToolArgValue::Json(_)) => {
            Value::String(value.as_text())
        }
        _ => value.to_json(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parley_tools::{PageFetcher, SearchBackend};
    use parley_types::PropertySchema;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSearch {
        queries: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SearchBackend for RecordingSearch {
        async fn search(&self, query: &str, _file_type: Option<&str>) -> anyhow::Result<Vec<String>> {
            self.queries.lock().expect("lock").push(query.to_string());
            Ok(vec!["https://example.com/a.pdf".to_string()])
        }
    }

    struct FailingFetch;

    #[async_trait]
    impl PageFetcher for FailingFetch {
        async fn fetch(&self, url: &str) -> anyhow::Result<String> {
            anyhow::bail!("fetch of {url} failed with HTTP 503")
        }
    }

    #[derive(Default)]
    struct RecordingRemote {
        calls: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl RemoteToolExecutor for RecordingRemote {
        async fn execute(&self, tool_name: &str, arguments: Value) -> anyhow::Result<String> {
            self.calls
                .lock()
                .expect("lock")
                .push((tool_name.to_string(), arguments));
            if tool_name == "explode" {
                anyhow::bail!("remote service rejected `{tool_name}`");
            }
            Ok(json!({"ok": true}).to_string())
        }
    }

    fn executor(search: Arc<RecordingSearch>, remote: Arc<RecordingRemote>) -> ToolExecutor {
        ToolExecutor::new(LocalToolRegistry::new(search, Arc::new(FailingFetch)), remote)
    }

    fn args(pairs: &[(&str, &str)]) -> ToolArguments {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), ToolArgValue::from(*v)))
            .collect()
    }

    #[tokio::test]
    async fn local_search_applies_file_type_qualifier() {
        let search = Arc::new(RecordingSearch::default());
        let exec = executor(search.clone(), Arc::new(RecordingRemote::default()));
        let result = exec
            .execute(
                "web_search",
                args(&[("query", "climate change"), ("file_type", "pdf")]),
            )
            .await;
        assert!(result.success);
        assert_eq!(
            search.queries.lock().expect("lock").clone(),
            vec!["climate change filetype:pdf".to_string()]
        );
        let payload: Value = serde_json::from_str(&result.result).expect("json");
        assert_eq!(payload["originalQuery"], "climate change");
    }

    #[tokio::test]
    async fn missing_argument_is_a_successful_result_with_error_body() {
        let exec = executor(
            Arc::new(RecordingSearch::default()),
            Arc::new(RecordingRemote::default()),
        );
        let result = exec.execute("fetch_page", ToolArguments::new()).await;
        assert!(result.success);
        assert_eq!(result.payload_error().as_deref(), Some("Missing url parameter"));
        assert!(render_execution_summary(&result).contains("reported an error"));
    }

    #[tokio::test]
    async fn handler_failures_are_captured() {
        let exec = executor(
            Arc::new(RecordingSearch::default()),
            Arc::new(RecordingRemote::default()),
        );
        let result = exec
            .execute("fetch_page", args(&[("url", "https://example.com")]))
            .await;
        assert!(!result.success);
        assert_eq!(
            result.error_message.as_deref(),
            Some("fetch of https://example.com failed with HTTP 503")
        );
        assert_eq!(
            result.payload_error().as_deref(),
            result.error_message.as_deref()
        );
    }

    #[tokio::test]
    async fn batch_returns_one_result_per_call_in_order() {
        let remote = Arc::new(RecordingRemote::default());
        let exec = executor(Arc::new(RecordingSearch::default()), remote.clone());
        let calls = vec![
            ToolCallRequest::new("post_to_facebook", args(&[("message", "hi")])),
            ToolCallRequest::new("explode", ToolArguments::new()),
            ToolCallRequest::new("web_search", args(&[("query", "rust")])),
        ];
        let (results, summaries) = exec.execute_batch(&calls).await;
        assert_eq!(results.len(), 3);
        assert_eq!(summaries.len(), 3);
        assert_eq!(
            results.iter().map(|r| r.function_name.as_str()).collect::<Vec<_>>(),
            vec!["post_to_facebook", "explode", "web_search"]
        );
        assert!(results[0].success);
        assert!(!results[1].success);
        assert!(results[2].success);
        assert!(summaries[1].starts_with("Tool `explode` failed"));
        assert_eq!(remote.calls.lock().expect("lock").len(), 2);
    }

    #[tokio::test]
    async fn catalog_schemas_drive_coercion_for_remote_calls() {
        let remote = Arc::new(RecordingRemote::default());
        let exec = executor(Arc::new(RecordingSearch::default()), remote.clone()).for_catalog(&[
            ToolDefinition::new(
                "schedule_post",
                "",
                ParameterSchema::default()
                    .property("delay", PropertySchema::new("integer", ""))
                    .property("draft", PropertySchema::new("boolean", ""))
                    .property("tags", PropertySchema::new("array", ""))
                    .property("message", PropertySchema::new("string", "")),
            ),
        ]);
        exec.execute(
            "schedule_post",
            args(&[
                ("delay", "30"),
                ("draft", "TRUE"),
                ("tags", "[\"a\"]"),
                ("message", "42"),
                ("unknown", "x"),
            ]),
        )
        .await;
        let calls = remote.calls.lock().expect("lock").clone();
        assert_eq!(
            calls[0].1,
            json!({"delay": 30, "draft": true, "tags": ["a"], "message": "42", "unknown": "x"})
        );
    }

    #[test]
    fn coercion_never_rejects() {
        let schema = ParameterSchema::default()
            .property("count", PropertySchema::new("integer", ""))
            .property("label", PropertySchema::new("string", ""));
        let mut arguments = args(&[("count", "many")]);
        arguments.insert("label".to_string(), ToolArgValue::Bool(true));
        assert_eq!(
            coerce_arguments(&arguments, Some(&schema)),
            json!({"count": "many", "label": "true"})
        );
    }

    #[test]
    fn summaries_truncate_long_payloads() {
        let result = ToolExecutionResult::succeeded("fetch_page", ToolArguments::new(), "x".repeat(900));
        let summary = render_execution_summary(&result);
        assert!(summary.ends_with("..."));
        assert!(summary.chars().count() < 600);
    }
}
