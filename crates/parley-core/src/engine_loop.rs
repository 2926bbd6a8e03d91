use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::Level;

use parley_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use parley_providers::{ChatChoice, ChatRequest, Provider, ProviderRegistry};
use parley_types::{
    AgentResponse, Message, MessageRole, ToolCallRequest, ToolDefinition, ToolExecutionResult,
};

use crate::catalog::{CatalogBuilder, CatalogRequest, ToolCatalog};
use crate::config::{EngineConfig, DEFAULT_MAX_ITERATIONS};
use crate::executor::ToolExecutor;
use crate::extractor::{canonical_tool_name, has_action_markers, ExtractorChain, ParameterlessPolicy};
use crate::sanitize::{
    clean_assistant_content, collapse_consecutive_assistants, sanitize_history,
    strip_delimiter_tokens,
};

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub max_iterations: usize,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_tokens: parley_providers::DEFAULT_MAX_TOKENS,
            system_prompt: None,
        }
    }
}

impl From<&EngineConfig> for LoopConfig {
    fn from(value: &EngineConfig) -> Self {
        Self {
            max_iterations: value.max_iterations.max(1),
            max_tokens: value.max_tokens,
            system_prompt: value
                .system_prompt
                .clone()
                .filter(|prompt| !prompt.trim().is_empty()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    NoChoices,
    IterationCap { iterations: usize },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::NoChoices => write!(f, "the model returned no choices"),
            AbortReason::IterationCap { iterations } => write!(
                f,
                "no final answer after {iterations} model turns"
            ),
        }
    }
}

/// Terminal state of one loop run. `Aborted` carries no partial history.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopOutcome {
    Completed(AgentResponse),
    Aborted(AbortReason),
}

impl LoopOutcome {
    pub fn into_response(self) -> Option<AgentResponse> {
        match self {
            LoopOutcome::Completed(response) => Some(response),
            LoopOutcome::Aborted(_) => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, LoopOutcome::Completed(_))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRequest {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

impl ConversationRequest {
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::user(prompt)],
            ..Default::default()
        }
    }
}

/// Per-run routing and identification, kept separate from history.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub conversation_id: String,
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
}

#[derive(Default)]
struct Accumulated {
    used_tools: bool,
    tools_used: BTreeSet<String>,
    executions: Vec<ToolExecutionResult>,
}

impl Accumulated {
    fn record(&mut self, results: &[ToolExecutionResult]) {
        self.used_tools = true;
        for result in results {
            self.tools_used.insert(result.function_name.clone());
        }
        self.executions.extend_from_slice(results);
    }

    fn finish(self, response: String, mut history: Vec<Message>) -> AgentResponse {
        collapse_consecutive_assistants(&mut history);
        AgentResponse {
            response,
            conversation_history: history,
            used_tools: self.used_tools,
            tools_used: self.tools_used,
            function_executions: self.executions,
        }
    }
}

/// Which classification branch a model response took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classified {
    StructuredCalls,
    ActionMarkers,
    ExternalMention,
    Plain,
}

impl Classified {
    fn as_str(self) -> &'static str {
        match self {
            Classified::StructuredCalls => "structured_calls",
            Classified::ActionMarkers => "action_markers",
            Classified::ExternalMention => "external_mention",
            Classified::Plain => "plain",
        }
    }
}

#[derive(Clone)]
pub struct ConversationLoop {
    providers: ProviderRegistry,
    catalog_builder: CatalogBuilder,
    executor: ToolExecutor,
    extractors: Arc<ExtractorChain>,
    config: LoopConfig,
}

impl ConversationLoop {
    pub fn new(
        providers: ProviderRegistry,
        catalog_builder: CatalogBuilder,
        executor: ToolExecutor,
        extractors: ExtractorChain,
        config: LoopConfig,
    ) -> Self {
        Self {
            providers,
            catalog_builder,
            executor,
            extractors: Arc::new(extractors),
            config,
        }
    }

    pub fn from_engine_config(
        providers: ProviderRegistry,
        catalog_builder: CatalogBuilder,
        executor: ToolExecutor,
        config: &EngineConfig,
    ) -> Self {
        let policy = ParameterlessPolicy::new(config.parameterless_tools.iter().cloned());
        Self::new(
            providers,
            catalog_builder,
            executor,
            ExtractorChain::new(policy),
            LoopConfig::from(config),
        )
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Builds the catalog for the request, then drives the loop.
    pub async fn run_conversation(
        &self,
        request: ConversationRequest,
    ) -> anyhow::Result<LoopOutcome> {
        let catalog = self
            .catalog_builder
            .build(&CatalogRequest {
                allowed_tools: request.allowed_tools.clone(),
            })
            .await;
        let mut history = request.messages;
        if let Some(prompt) = &self.config.system_prompt {
            if !history.iter().any(|m| m.role == MessageRole::System) {
                history.insert(0, Message::system(prompt.clone()));
            }
        }
        let ctx = RunContext {
            conversation_id: request
                .conversation_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            provider_id: request.provider_id,
            model_id: request.model_id,
        };
        self.run(history, &catalog, &ctx).await
    }

    /// Runs the bounded turn loop over `history`. Only a backend failure is
    /// an `Err`; tool failures are folded into history.
    pub async fn run(
        &self,
        mut history: Vec<Message>,
        catalog: &ToolCatalog,
        ctx: &RunContext,
    ) -> anyhow::Result<LoopOutcome> {
        let provider = self
            .providers
            .select_provider(ctx.provider_id.as_deref())
            .await?;
        let info = provider.info();
        let provider_id = info.id.clone();
        let model_id = ctx
            .model_id
            .clone()
            .or_else(|| info.default_model().map(str::to_string));
        let ctx = &RunContext {
            model_id,
            ..ctx.clone()
        };
        let chosen_model = ctx
            .model_id
            .as_deref()
            .and_then(|id| info.models.iter().find(|m| m.id == id))
            .or_else(|| info.models.first());
        // Models that reject a `tools` array still get text-protocol calls.
        let advertised: &[ToolDefinition] = match chosen_model {
            Some(model) if !model.supports_tools => &[],
            _ => catalog.merged.as_slice(),
        };
        let executor = self.executor.for_catalog(&catalog.merged);
        let external_names = catalog.external_names();
        let mut acc = Accumulated::default();

        let prompt_preview = history
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| redact_text(m.text()))
            .unwrap_or_default();
        self.emit(
            Level::INFO,
            ctx,
            &provider_id,
            None,
            "loop.start",
            None,
            Some(&prompt_preview),
        );

        for iteration in 1..=self.config.max_iterations {
            sanitize_history(&mut history);

            let Some(choice) = self
                .dispatch(provider.as_ref(), &history, advertised, ctx, &provider_id, iteration)
                .await?
            else {
                self.emit(
                    Level::WARN,
                    ctx,
                    &provider_id,
                    Some(iteration),
                    "loop.aborted",
                    Some("no_choices"),
                    None,
                );
                return Ok(LoopOutcome::Aborted(AbortReason::NoChoices));
            };

            let message = &choice.message;
            if message.has_tool_calls() || choice.requests_tool_calls() {
                self.classified(ctx, &provider_id, iteration, Classified::StructuredCalls);
                let calls = message
                    .tool_calls
                    .clone()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|mut call| {
                        call.tool_name = canonical_tool_name(&call.tool_name, &catalog.merged);
                        if call.id.as_deref().map(str::trim).unwrap_or("").is_empty() {
                            call.id = Some(ToolCallRequest::generate_id());
                        }
                        call
                    })
                    .collect::<Vec<_>>();
                let content = message.content.as_deref().map(strip_delimiter_tokens);
                if calls.is_empty() {
                    history.push(Message::assistant(content.unwrap_or_default()));
                    continue;
                }
                history.push(Message::assistant_with_tool_calls(content, calls.clone()));
                let (results, _) = executor.execute_batch(&calls).await;
                for (call, result) in calls.iter().zip(results.iter()) {
                    history.push(Message::tool(
                        call.id.clone().unwrap_or_default(),
                        call.tool_name.clone(),
                        result.history_text(),
                    ));
                }
                acc.record(&results);
                continue;
            }

            let content = clean_assistant_content(message.text());

            if has_action_markers(&content) {
                self.classified(ctx, &provider_id, iteration, Classified::ActionMarkers);
                let calls = self.extractors.extract(&content, &catalog.merged);
                let mut assistant = Message::assistant(content.clone());
                if calls.is_empty() {
                    tracing::debug!("action markers present but no call could be extracted");
                    acc.used_tools = true;
                } else {
                    let (results, summaries) = executor.execute_batch(&calls).await;
                    if let Some(last) = summaries.last() {
                        assistant.content = Some(last.clone());
                    }
                    acc.record(&results);
                }
                history.push(assistant);
                continue;
            }

            if !content.is_empty() && external_names.iter().any(|name| content.contains(name)) {
                let calls = self.extractors.extract_filtered(&content, &catalog.external, |call| {
                    external_names.contains(&call.tool_name.as_str())
                });
                if !calls.is_empty() {
                    self.classified(ctx, &provider_id, iteration, Classified::ExternalMention);
                    let (results, summaries) = executor.execute_batch(&calls).await;
                    acc.record(&results);
                    let mut response = content;
                    for summary in &summaries {
                        response.push_str("\n\n");
                        response.push_str(summary);
                    }
                    history.push(Message::assistant(response.clone()));
                    return Ok(self.complete(ctx, &provider_id, iteration, acc, response, history));
                }
            }

            self.classified(ctx, &provider_id, iteration, Classified::Plain);
            history.push(Message::assistant(content.clone()));
            return Ok(self.complete(ctx, &provider_id, iteration, acc, content, history));
        }

        let iterations = self.config.max_iterations;
        let detail = format!("iteration cap {iterations} reached");
        self.emit(
            Level::WARN,
            ctx,
            &provider_id,
            Some(iterations),
            "loop.aborted",
            Some("iteration_cap"),
            Some(&detail),
        );
        Ok(LoopOutcome::Aborted(AbortReason::IterationCap { iterations }))
    }

    /// One backend call. `None` when the response carried no choices.
    async fn dispatch(
        &self,
        provider: &dyn Provider,
        history: &[Message],
        tools: &[ToolDefinition],
        ctx: &RunContext,
        provider_id: &str,
        iteration: usize,
    ) -> anyhow::Result<Option<ChatChoice>> {
        let mut request = ChatRequest::new(history.to_vec());
        request.max_tokens = self.config.max_tokens;
        request.model = ctx.model_id.clone();
        if !tools.is_empty() {
            request.tools = Some(tools.to_vec());
        }

        self.emit(
            Level::DEBUG,
            ctx,
            provider_id,
            Some(iteration),
            "provider.call.start",
            None,
            None,
        );
        let response = match provider.chat(request).await {
            Ok(response) => response,
            Err(err) => {
                let detail = err.to_string();
                self.emit(
                    Level::ERROR,
                    ctx,
                    provider_id,
                    Some(iteration),
                    "provider.call.error",
                    Some("failed"),
                    Some(&detail),
                );
                return Err(err).with_context(|| {
                    format!("text generation via `{provider_id}` failed on turn {iteration}")
                });
            }
        };
        let choice_count = response.choices.len().to_string();
        self.emit(
            Level::DEBUG,
            ctx,
            provider_id,
            Some(iteration),
            "provider.call.finish",
            Some("ok"),
            Some(&choice_count),
        );

        Ok(response.choices.into_iter().next().map(|mut choice| {
            choice.message.role = MessageRole::Assistant;
            choice
        }))
    }

    fn complete(
        &self,
        ctx: &RunContext,
        provider_id: &str,
        iteration: usize,
        acc: Accumulated,
        response: String,
        history: Vec<Message>,
    ) -> LoopOutcome {
        self.emit(
            Level::INFO,
            ctx,
            provider_id,
            Some(iteration),
            "loop.finish",
            Some("final"),
            None,
        );
        LoopOutcome::Completed(acc.finish(response, history))
    }

    fn classified(&self, ctx: &RunContext, provider_id: &str, iteration: usize, path: Classified) {
        self.emit(
            Level::DEBUG,
            ctx,
            provider_id,
            Some(iteration),
            "loop.classified",
            None,
            Some(path.as_str()),
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn emit(
        &self,
        level: Level,
        ctx: &RunContext,
        provider_id: &str,
        iteration: Option<usize>,
        event: &str,
        status: Option<&str>,
        detail: Option<&str>,
    ) {
        emit_event(
            level,
            ProcessKind::Engine,
            ObservabilityEvent {
                event,
                component: "engine.loop",
                conversation_id: Some(&ctx.conversation_id),
                iteration,
                provider_id: Some(provider_id),
                model_id: ctx.model_id.as_deref(),
                status,
                detail,
                ..Default::default()
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_reasons_render_for_callers() {
        assert_eq!(
            AbortReason::IterationCap { iterations: 10 }.to_string(),
            "no final answer after 10 model turns"
        );
        assert_eq!(
            serde_json::to_value(AbortReason::NoChoices).expect("json"),
            serde_json::json!({"reason": "no_choices"})
        );
    }

    #[test]
    fn loop_config_follows_engine_config() {
        let mut engine = EngineConfig::default();
        engine.max_iterations = 0;
        engine.system_prompt = Some("  ".to_string());
        let config = LoopConfig::from(&engine);
        assert_eq!(config.max_iterations, 1);
        assert!(config.system_prompt.is_none());
        assert_eq!(LoopConfig::default().max_iterations, 10);
    }

    #[test]
    fn accumulated_state_dedupes_tool_names() {
        let mut acc = Accumulated::default();
        acc.record(&[
            ToolExecutionResult::succeeded("web_search", Default::default(), "{}"),
            ToolExecutionResult::failed("web_search", Default::default(), "boom"),
        ]);
        let response = acc.finish(
            "done".to_string(),
            vec![Message::assistant("a"), Message::assistant("b")],
        );
        assert!(response.used_tools);
        assert_eq!(response.tools_used.len(), 1);
        assert_eq!(response.function_executions.len(), 2);
        assert_eq!(response.conversation_history.len(), 1);
    }
}
