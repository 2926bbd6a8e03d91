use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use parley_types::{Message, ModelInfo, ProviderInfo, ToolDefinition};

mod openai;

pub use openai::{message_to_wire, parse_chat_response, tool_to_wire, OpenAICompatibleProvider};

/// Finish reason a backend reports when it wants tool calls executed.
pub const FINISH_REASON_TOOL_CALLS: &str = "tool_calls";

pub const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderSettings {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Option<Vec<ToolDefinition>>,
    pub max_tokens: u32,
    pub model: Option<String>,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            tools: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            model: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatChoice {
    pub message: Message,
    pub finish_reason: String,
}

impl ChatChoice {
    pub fn requests_tool_calls(&self) -> bool {
        self.finish_reason == FINISH_REASON_TOOL_CALLS
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub choices: Vec<ChatChoice>,
    pub usage: Option<TokenUsage>,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> ProviderInfo;

    async fn chat(&self, request: ChatRequest) -> anyhow::Result<ChatResponse>;
}

#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Arc<RwLock<Vec<Arc<dyn Provider>>>>,
    default_provider: Arc<RwLock<Option<String>>>,
}

impl ProviderRegistry {
    pub fn new(settings: ProviderSettings) -> Self {
        let providers = build_providers(&settings);
        Self::with_providers(providers, settings.default_provider)
    }

    pub fn with_providers(
        providers: Vec<Arc<dyn Provider>>,
        default_provider: Option<String>,
    ) -> Self {
        Self {
            providers: Arc::new(RwLock::new(providers)),
            default_provider: Arc::new(RwLock::new(default_provider)),
        }
    }

    pub async fn select_provider(
        &self,
        provider_id: Option<&str>,
    ) -> anyhow::Result<Arc<dyn Provider>> {
        let providers = self.providers.read().await;
        let available = providers.iter().map(|p| p.info().id).collect::<Vec<_>>();

        if let Some(id) = provider_id {
            if let Some(provider) = providers.iter().find(|p| p.info().id == id) {
                return Ok(provider.clone());
            }
            anyhow::bail!(
                "provider `{}` is not configured. configured providers: {}",
                id,
                available.join(", ")
            );
        };

        let configured_default = self.default_provider.read().await.clone();
        if let Some(default_id) = configured_default {
            if let Some(provider) = providers.iter().find(|p| p.info().id == default_id) {
                return Ok(provider.clone());
            }
        };

        let Some(provider) = providers.first() else {
            anyhow::bail!("No provider configured.");
        };
        Ok(provider.clone())
    }
}

/// Provider ids accepted in configuration and on the command line.
pub const SUPPORTED_PROVIDER_IDS: [&str; 6] =
    ["openai", "openrouter", "ollama", "groq", "mistral", "together"];

fn build_providers(settings: &ProviderSettings) -> Vec<Arc<dyn Provider>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

    add_openai_provider(
        settings,
        &mut providers,
        "ollama",
        "Ollama",
        "http://127.0.0.1:11434/v1",
        "llama3.1:8b",
        false,
    );
    add_openai_provider(
        settings,
        &mut providers,
        "openai",
        "OpenAI",
        "https://api.openai.com/v1",
        "gpt-4o-mini",
        true,
    );
    add_openai_provider(
        settings,
        &mut providers,
        "openrouter",
        "OpenRouter",
        "https://openrouter.ai/api/v1",
        "openai/gpt-4o-mini",
        true,
    );
    add_openai_provider(
        settings,
        &mut providers,
        "groq",
        "Groq",
        "https://api.groq.com/openai/v1",
        "llama-3.1-8b-instant",
        true,
    );
    add_openai_provider(
        settings,
        &mut providers,
        "mistral",
        "Mistral",
        "https://api.mistral.ai/v1",
        "mistral-small-latest",
        true,
    );
    add_openai_provider(
        settings,
        &mut providers,
        "together",
        "Together",
        "https://api.together.xyz/v1",
        "meta-llama/Llama-3.1-8B-Instruct-Turbo",
        true,
    );

    if providers.is_empty() {
        providers.push(Arc::new(LocalEchoProvider));
    }

    providers
}

fn add_openai_provider(
    settings: &ProviderSettings,
    providers: &mut Vec<Arc<dyn Provider>>,
    id: &str,
    name: &str,
    default_url: &str,
    default_model: &str,
    use_api_key: bool,
) {
    let Some(entry) = settings.providers.get(id) else {
        return;
    };
    let api_key = if use_api_key {
        entry
            .api_key
            .as_deref()
            .filter(|key| !is_placeholder_api_key(key))
            .map(|key| key.to_string())
            .or_else(|| env_api_key_for_provider(id))
    } else {
        None
    };
    providers.push(Arc::new(OpenAICompatibleProvider::new(
        id,
        name,
        entry.url.as_deref().unwrap_or(default_url),
        api_key,
        entry.default_model.as_deref().unwrap_or(default_model),
    )));
}

fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}

pub fn provider_api_key_env(id: &str) -> Option<&'static str> {
    match id {
        "openai" => Some("OPENAI_API_KEY"),
        "openrouter" => Some("OPENROUTER_API_KEY"),
        "groq" => Some("GROQ_API_KEY"),
        "mistral" => Some("MISTRAL_API_KEY"),
        "together" => Some("TOGETHER_API_KEY"),
        _ => None,
    }
}

fn env_api_key_for_provider(id: &str) -> Option<String> {
    let env_name = provider_api_key_env(id)?;
    std::env::var(env_name)
        .ok()
        .filter(|v| !v.trim().is_empty())
}

/// Fallback used when no provider is configured: answers with the last user
/// message and never requests tools.
struct LocalEchoProvider;

#[async_trait]
impl Provider for LocalEchoProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "local".to_string(),
            name: "Local Echo".to_string(),
            models: vec![ModelInfo {
                id: "echo-1".to_string(),
                provider_id: "local".to_string(),
                supports_tools: false,
            }],
        }
    }

    async fn chat(&self, request: ChatRequest) -> anyhow::Result<ChatResponse> {
        let prompt = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == parley_types::MessageRole::User)
            .map(|m| m.text().to_string())
            .unwrap_or_default();
        Ok(ChatResponse {
            choices: vec![ChatChoice {
                message: Message::assistant(format!("Echo: {prompt}")),
                finish_reason: "stop".to_string(),
            }],
            usage: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(
        provider_ids: &[&str],
        default_provider: Option<&str>,
        include_openai_key: bool,
    ) -> ProviderSettings {
        let mut providers = HashMap::new();
        for id in provider_ids {
            let api_key = if *id == "openai" && include_openai_key {
                Some("sk-test".to_string())
            } else {
                None
            };
            providers.insert(
                (*id).to_string(),
                ProviderConfig {
                    api_key,
                    url: None,
                    default_model: Some(format!("{id}-model")),
                },
            );
        }
        ProviderSettings {
            providers,
            default_provider: default_provider.map(|s| s.to_string()),
        }
    }

    #[tokio::test]
    async fn explicit_provider_wins_over_default_provider() {
        let registry = ProviderRegistry::new(cfg(&["openai", "openrouter"], Some("openai"), true));
        let provider = registry
            .select_provider(Some("openrouter"))
            .await
            .expect("provider");
        assert_eq!(provider.info().id, "openrouter");
    }

    #[tokio::test]
    async fn uses_default_provider_when_explicit_provider_missing() {
        let registry =
            ProviderRegistry::new(cfg(&["openai", "openrouter"], Some("openrouter"), true));
        let provider = registry.select_provider(None).await.expect("provider");
        assert_eq!(provider.info().id, "openrouter");
    }

    #[tokio::test]
    async fn falls_back_to_first_provider_when_default_provider_missing() {
        let registry = ProviderRegistry::new(cfg(&["openai"], Some("groq"), true));
        let provider = registry.select_provider(None).await.expect("provider");
        assert_eq!(provider.info().id, "openai");
    }

    #[tokio::test]
    async fn explicit_unknown_provider_errors() {
        let registry = ProviderRegistry::new(cfg(&["openai"], None, true));
        let err = registry
            .select_provider(Some("openruter"))
            .await
            .err()
            .expect("expected error");
        assert!(err
            .to_string()
            .contains("provider `openruter` is not configured"));
    }

    #[tokio::test]
    async fn empty_settings_fall_back_to_local_echo() {
        let registry = ProviderRegistry::new(ProviderSettings::default());
        let provider = registry.select_provider(None).await.expect("provider");
        let response = provider
            .chat(ChatRequest::new(vec![Message::user("hello")]))
            .await
            .expect("echo reply");
        assert_eq!(response.choices[0].message.text(), "Echo: hello");
        assert!(!response.choices[0].requests_tool_calls());
    }

    #[tokio::test]
    async fn local_echo_advertises_no_tool_support() {
        let registry = ProviderRegistry::new(ProviderSettings::default());
        let info = registry.select_provider(None).await.expect("provider").info();
        assert_eq!(info.default_model(), Some("echo-1"));
        assert!(!info.models[0].supports_tools);
    }

    #[test]
    fn placeholder_keys_are_ignored() {
        assert!(is_placeholder_api_key(""));
        assert!(is_placeholder_api_key(" X "));
        assert!(is_placeholder_api_key("placeholder"));
        assert!(!is_placeholder_api_key("sk-live"));
    }
}
