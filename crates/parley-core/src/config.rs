use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

pub use parley_providers::ProviderConfig;
use parley_providers::provider_api_key_env;
use parley_tools::{DEFAULT_FETCH_MAX_CHARS, DEFAULT_SEARCH_ENDPOINT, DEFAULT_SEARCH_RESULT_LIMIT};

use crate::extractor::DEFAULT_PARAMETERLESS_TOOLS;

pub const DEFAULT_MAX_ITERATIONS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Hard bound on model turns per conversation.
    pub max_iterations: usize,
    pub max_tokens: u32,
    pub parameterless_tools: Vec<String>,
    pub system_prompt: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_tokens: parley_providers::DEFAULT_MAX_TOKENS,
            parameterless_tools: DEFAULT_PARAMETERLESS_TOOLS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub mcp_endpoint: Option<String>,
    pub mcp_headers: HashMap<String, String>,
    pub search_endpoint: String,
    pub search_result_limit: usize,
    pub fetch_max_chars: usize,
    pub enablement_file: Option<PathBuf>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            mcp_endpoint: None,
            mcp_headers: HashMap::new(),
            search_endpoint: DEFAULT_SEARCH_ENDPOINT.to_string(),
            search_result_limit: DEFAULT_SEARCH_RESULT_LIMIT,
            fetch_max_chars: DEFAULT_FETCH_MAX_CHARS,
            enablement_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
    pub default_model: Option<String>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    cli: Value,
}

/// Layered JSON configuration: global, project, environment, then CLI
/// overrides, each deep-merged over the previous one.
#[derive(Clone)]
pub struct ConfigStore {
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let global_path = resolve_global_config_path();
        Self::with_global_path(path, global_path, cli_overrides).await
    }

    pub async fn with_global_path(
        path: impl AsRef<Path>,
        global_path: impl AsRef<Path>,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let project_path = path.as_ref().to_path_buf();
        let global_path = global_path.as_ref();

        let mut global = read_json_file(global_path).await?;
        let mut project = read_json_file(&project_path).await?;
        scrub_persisted_secrets(&mut global, global_path).await?;
        scrub_persisted_secrets(&mut project, &project_path).await?;

        let layers = ConfigLayers {
            global,
            project,
            env: env_layer(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };
        Ok(Self {
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub async fn get(&self) -> AppConfig {
        let merged = self.get_effective_value().await;
        match serde_json::from_value(merged) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("invalid configuration, using defaults: {}", err);
                AppConfig::default()
            }
        }
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    match serde_json::from_str::<Value>(&raw) {
        Ok(value) => Ok(value),
        Err(err) => {
            tracing::warn!("ignoring unreadable config {}: {}", path.display(), err);
            Ok(empty_object())
        }
    }
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut to_write = value.clone();
    strip_persisted_secrets(&mut to_write);
    let raw = serde_json::to_string_pretty(&to_write)?;
    fs::write(path, raw).await?;
    Ok(())
}

/// Drops provider API keys from a persisted layer when the same key is
/// available from the environment.
fn strip_persisted_secrets(value: &mut Value) {
    let Some(providers) = value
        .as_object_mut()
        .and_then(|root| root.get_mut("providers"))
        .and_then(|v| v.as_object_mut())
    else {
        return;
    };
    for (provider_id, provider_cfg) in providers.iter_mut() {
        let Value::Object(cfg) = provider_cfg else {
            continue;
        };
        if !cfg.contains_key("api_key") && !cfg.contains_key("apiKey") {
            continue;
        }
        if provider_has_runtime_secret(provider_id) {
            cfg.remove("api_key");
            cfg.remove("apiKey");
        }
    }
}

async fn scrub_persisted_secrets(value: &mut Value, path: &Path) -> anyhow::Result<()> {
    let before = value.clone();
    strip_persisted_secrets(value);
    if *value != before {
        write_json_file(path, value).await?;
    }
    Ok(())
}

fn provider_has_runtime_secret(provider_id: &str) -> bool {
    provider_api_key_env(&provider_id.to_ascii_lowercase())
        .and_then(|key| std::env::var(key).ok())
        .map(|v| !v.trim().is_empty())
        .unwrap_or(false)
}

fn resolve_global_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("PARLEY_GLOBAL_CONFIG") {
        return PathBuf::from(path);
    }
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("parley").join("config.json");
    }
    PathBuf::from(".parley/global_config.json")
}

fn env_layer() -> Value {
    let mut root = empty_object();

    if let Some(provider) = non_empty_env("PARLEY_PROVIDER") {
        deep_merge(&mut root, &json!({ "default_provider": provider }));
    }
    if let Some(model) = non_empty_env("PARLEY_MODEL") {
        deep_merge(&mut root, &json!({ "default_model": model }));
    }
    if let Some(raw) = non_empty_env("PARLEY_MAX_ITERATIONS") {
        match raw.trim().parse::<usize>() {
            Ok(n) if n > 0 => {
                deep_merge(&mut root, &json!({ "engine": { "max_iterations": n } }));
            }
            _ => tracing::warn!("ignoring invalid PARLEY_MAX_ITERATIONS={}", raw),
        }
    }
    if let Some(endpoint) = non_empty_env("PARLEY_MCP_ENDPOINT") {
        deep_merge(&mut root, &json!({ "tools": { "mcp_endpoint": endpoint } }));
    }
    if let Some(endpoint) = non_empty_env("PARLEY_SEARCH_ENDPOINT") {
        deep_merge(&mut root, &json!({ "tools": { "search_endpoint": endpoint } }));
    }
    if let Some(raw) = non_empty_env("PARLEY_PARAMETERLESS_TOOLS") {
        deep_merge(
            &mut root,
            &json!({ "engine": { "parameterless_tools": parse_csv(&raw) } }),
        );
    }

    for provider in ["openai", "openrouter", "groq", "mistral", "together"] {
        let Some(key_env) = provider_api_key_env(provider) else {
            continue;
        };
        if let Some(api_key) = non_empty_env(key_env) {
            deep_merge(
                &mut root,
                &json!({ "providers": { provider: { "api_key": api_key } } }),
            );
        }
    }
    if let Some(ollama_url) = non_empty_env("OLLAMA_URL") {
        deep_merge(
            &mut root,
            &json!({ "providers": { "ollama": { "url": ollama_url } } }),
        );
    }

    root
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub(crate) fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

impl From<&AppConfig> for parley_providers::ProviderSettings {
    fn from(value: &AppConfig) -> Self {
        Self {
            providers: value.providers.clone(),
            default_provider: value.default_provider.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_merge_overlays_nested_objects_and_skips_nulls() {
        let mut base = json!({"engine": {"max_iterations": 10, "max_tokens": 4096}});
        deep_merge(
            &mut base,
            &json!({"engine": {"max_iterations": 3, "system_prompt": null}}),
        );
        assert_eq!(base["engine"]["max_iterations"], 3);
        assert_eq!(base["engine"]["max_tokens"], 4096);
        assert!(base["engine"].get("system_prompt").is_none());
    }

    #[test]
    fn app_config_defaults_missing_sections() {
        let config: AppConfig =
            serde_json::from_value(json!({"engine": {"max_iterations": 4}})).expect("config");
        assert_eq!(config.engine.max_iterations, 4);
        assert_eq!(config.engine.max_tokens, 4096);
        assert_eq!(config.engine.parameterless_tools, vec!["get_page_posts"]);
        assert_eq!(config.tools.fetch_max_chars, 20_000);
        assert_eq!(config.tools.search_endpoint, DEFAULT_SEARCH_ENDPOINT);
        assert!(config.tools.mcp_endpoint.is_none());
    }

    #[tokio::test]
    async fn layers_merge_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let global_path = dir.path().join("global.json");
        let project_path = dir.path().join("project.json");
        fs::write(
            &global_path,
            r#"{"default_provider":"openai","engine":{"max_iterations":7}}"#,
        )
        .await
        .expect("write global");
        fs::write(&project_path, r#"{"engine":{"max_iterations":5}}"#)
            .await
            .expect("write project");

        let store = ConfigStore::with_global_path(
            &project_path,
            &global_path,
            Some(json!({"default_provider": "ollama"})),
        )
        .await
        .expect("store");
        let config = store.get().await;
        assert_eq!(config.engine.max_iterations, 5);
        assert_eq!(config.default_provider.as_deref(), Some("ollama"));
    }

    #[test]
    fn persisted_keys_survive_without_a_runtime_secret() {
        let mut value = json!({"providers": {"local-llm": {"api_key": "k", "url": "http://x"}}});
        strip_persisted_secrets(&mut value);
        assert_eq!(value["providers"]["local-llm"]["api_key"], "k");
    }

    #[test]
    fn provider_settings_carry_keys_and_default() {
        let mut config = AppConfig::default();
        config.providers.insert(
            "groq".to_string(),
            ProviderConfig {
                api_key: Some("gsk".to_string()),
                url: None,
                default_model: None,
            },
        );
        config.default_provider = Some("groq".to_string());
        let settings = parley_providers::ProviderSettings::from(&config);
        assert_eq!(settings.default_provider.as_deref(), Some("groq"));
        assert_eq!(
            settings.providers.get("groq").and_then(|p| p.api_key.as_deref()),
            Some("gsk")
        );
    }

    #[test]
    fn csv_values_are_trimmed() {
        assert_eq!(
            parse_csv(" get_page_posts, list_pages ,,"),
            vec!["get_page_posts".to_string(), "list_pages".to_string()]
        );
    }
}
