use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use std::{fs, io::Read};

use anyhow::Context;
use clap::{Parser, Subcommand};
use parley_core::{
    AppConfig, CatalogBuilder, CatalogRequest, ConfigStore, ConversationLoop, ConversationRequest,
    ExtractorChain, FileEnablementStore, LoopOutcome, ParameterlessPolicy, ToolExecutor,
};
use parley_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use parley_providers::{ProviderRegistry, SUPPORTED_PROVIDER_IDS};
use parley_tools::{
    ExaSearchBackend, HttpPageFetcher, LocalToolRegistry, McpToolService, RemoteToolExecutor,
    RemoteToolRegistry, UnavailableRemoteTools,
};
use parley_types::{arguments_from_object, Message};
use tracing::info;

const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser, Debug)]
#[command(name = "parley-engine")]
#[command(about = "Tool-calling conversation engine")]
struct Cli {
    #[arg(long, global = true)]
    state_dir: Option<String>,
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one conversation and print the response as JSON.
    Run {
        prompt: String,
        #[arg(long)]
        system: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long = "allow-tool")]
        allow_tools: Vec<String>,
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,
    },
    /// Print the tool calls found in text (`-` or no text reads stdin).
    Extract {
        #[arg(long)]
        text: Option<String>,
    },
    /// Execute one tool: `{"tool": "...", "args": {...}}`, `@file`, or `-`.
    Tool {
        #[arg(long)]
        json: String,
    },
    /// Print the tool catalog a conversation would see.
    Catalog {
        #[arg(long = "allow-tool")]
        allow_tools: Vec<String>,
    },
    Enable {
        name: String,
    },
    Disable {
        name: String,
    },
}

struct Runtime {
    config: AppConfig,
    catalog_builder: CatalogBuilder,
    executor: ToolExecutor,
    engine: ConversationLoop,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let state_dir = resolve_state_dir(cli.state_dir);
    let config_path = cli.config.map(PathBuf::from);

    let process = match cli.command {
        Command::Run { .. } | Command::Tool { .. } => ProcessKind::Engine,
        _ => ProcessKind::Cli,
    };
    let logs_dir = canonical_logs_dir_from_root(&state_dir);
    let (_log_guard, log_info) = init_process_logging(process, &logs_dir, LOG_RETENTION_DAYS)?;
    emit_event(
        tracing::Level::INFO,
        process,
        ObservabilityEvent {
            event: "logging.initialized",
            component: "engine.main",
            status: Some("ok"),
            detail: Some("jsonl logging initialized"),
            ..Default::default()
        },
    );
    info!("logging initialized: {:?}", log_info);

    match cli.command {
        Command::Run {
            prompt,
            system,
            api_key,
            provider,
            model,
            allow_tools,
            timeout_secs,
        } => {
            let provider = normalize_and_validate_provider(provider)?;
            let overrides = build_cli_overrides(api_key, provider.clone(), model.clone())?;
            let runtime = build_runtime(&state_dir, overrides, config_path).await?;

            let mut messages = Vec::new();
            if let Some(system) = system.filter(|s| !s.trim().is_empty()) {
                messages.push(Message::system(system));
            }
            messages.push(Message::user(prompt));
            let request = ConversationRequest {
                messages,
                allowed_tools: allow_list(allow_tools),
                provider_id: provider,
                model_id: model.or_else(|| runtime.config.default_model.clone()),
                conversation_id: Some(uuid::Uuid::new_v4().to_string()),
            };

            let outcome = tokio::time::timeout(
                Duration::from_secs(timeout_secs.max(1)),
                runtime.engine.run_conversation(request),
            )
            .await
            .map_err(|_| anyhow::anyhow!("conversation timed out after {timeout_secs}s"))??;
            match outcome {
                LoopOutcome::Completed(response) => {
                    println!("{}", serde_json::to_string_pretty(&response)?);
                }
                LoopOutcome::Aborted(reason) => {
                    anyhow::bail!("conversation aborted: {reason}");
                }
            }
        }
        Command::Extract { text } => {
            let content = match text.as_deref() {
                Some(text) if text.trim() != "-" => text.to_string(),
                _ => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            let store = ConfigStore::new(project_config_path(&state_dir, config_path), None).await?;
            let config = store.get().await;
            let chain = ExtractorChain::new(ParameterlessPolicy::new(
                config.engine.parameterless_tools.iter().cloned(),
            ));
            let calls = chain.extract(&content, &[]);
            println!("{}", serde_json::to_string_pretty(&calls)?);
        }
        Command::Tool { json } => {
            let runtime = build_runtime(&state_dir, None, config_path).await?;
            let payload = read_tool_json(&json)?;
            let tool = payload
                .get("tool")
                .and_then(|v| v.as_str())
                .map(str::trim)
                .unwrap_or("")
                .to_string();
            if tool.is_empty() {
                anyhow::bail!("tool is required in input json");
            }
            let args = payload
                .get("args")
                .and_then(|v| v.as_object())
                .map(arguments_from_object)
                .unwrap_or_default();
            let catalog = runtime
                .catalog_builder
                .build(&CatalogRequest::default())
                .await;
            let result = runtime
                .executor
                .for_catalog(&catalog.merged)
                .execute(&tool, args)
                .await;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Catalog { allow_tools } => {
            let runtime = build_runtime(&state_dir, None, config_path).await?;
            let catalog = runtime
                .catalog_builder
                .build(&CatalogRequest {
                    allowed_tools: allow_list(allow_tools),
                })
                .await;
            println!("{}", serde_json::to_string_pretty(&catalog)?);
        }
        Command::Enable { name } => {
            set_tool_enabled(&state_dir, config_path, &name, true).await?;
        }
        Command::Disable { name } => {
            set_tool_enabled(&state_dir, config_path, &name, false).await?;
        }
    }

    Ok(())
}

fn allow_list(names: Vec<String>) -> Option<Vec<String>> {
    let names = names
        .into_iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect::<Vec<_>>();
    (!names.is_empty()).then_some(names)
}

async fn set_tool_enabled(
    state_dir: &Path,
    config_path: Option<PathBuf>,
    name: &str,
    enabled: bool,
) -> anyhow::Result<()> {
    let store = ConfigStore::new(project_config_path(state_dir, config_path), None).await?;
    let config = store.get().await;
    let enablement = FileEnablementStore::new(enablement_path(state_dir, &config));
    enablement.set_enabled(name, enabled).await?;
    println!(
        "{} `{}` in {}",
        if enabled { "enabled" } else { "disabled" },
        name.trim(),
        enablement.path().display()
    );
    Ok(())
}

async fn build_runtime(
    state_dir: &Path,
    cli_overrides: Option<serde_json::Value>,
    config_path: Option<PathBuf>,
) -> anyhow::Result<Runtime> {
    let store = ConfigStore::new(project_config_path(state_dir, config_path), cli_overrides)
        .await
        .context("failed to load configuration")?;
    let config = store.get().await;

    let providers = ProviderRegistry::new((&config).into());
    let search = Arc::new(ExaSearchBackend::new(
        config.tools.search_endpoint.clone(),
        config.tools.search_result_limit,
    ));
    let fetcher = Arc::new(HttpPageFetcher::new(config.tools.fetch_max_chars)?);
    let local = LocalToolRegistry::new(search, fetcher);

    let (registry, remote): (Arc<dyn RemoteToolRegistry>, Arc<dyn RemoteToolExecutor>) =
        match config
            .tools
            .mcp_endpoint
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
        {
            Some(endpoint) => {
                info!("external tool service: {}", endpoint);
                let service = Arc::new(McpToolService::new(
                    endpoint,
                    config.tools.mcp_headers.clone(),
                ));
                (
                    service.clone() as Arc<dyn RemoteToolRegistry>,
                    service as Arc<dyn RemoteToolExecutor>,
                )
            }
            None => {
                info!("no external tool service configured");
                (
                    Arc::new(UnavailableRemoteTools) as Arc<dyn RemoteToolRegistry>,
                    Arc::new(UnavailableRemoteTools) as Arc<dyn RemoteToolExecutor>,
                )
            }
        };

    let enablement = Arc::new(FileEnablementStore::new(enablement_path(state_dir, &config)));
    let catalog_builder = CatalogBuilder::new(local.clone(), registry).with_enablement(enablement);
    let executor = ToolExecutor::new(local, remote);
    let engine = ConversationLoop::from_engine_config(
        providers,
        catalog_builder.clone(),
        executor.clone(),
        &config.engine,
    );

    Ok(Runtime {
        config,
        catalog_builder,
        executor,
        engine,
    })
}

fn project_config_path(state_dir: &Path, flag: Option<PathBuf>) -> PathBuf {
    flag.unwrap_or_else(|| state_dir.join("config.json"))
}

fn enablement_path(state_dir: &Path, config: &AppConfig) -> PathBuf {
    config
        .tools
        .enablement_file
        .clone()
        .unwrap_or_else(|| state_dir.join("tool_enablement.json"))
}

fn build_cli_overrides(
    api_key: Option<String>,
    provider: Option<String>,
    model: Option<String>,
) -> anyhow::Result<Option<serde_json::Value>> {
    let provider = normalize_and_validate_provider(provider)?;

    if api_key.is_none() && provider.is_none() && model.is_none() {
        return Ok(None);
    }
    let mut root = serde_json::Map::new();

    if let Some(p) = &provider {
        root.insert(
            "default_provider".to_string(),
            serde_json::Value::String(p.clone()),
        );
    }

    // Key and model without a provider apply to openai.
    let target_provider = provider.as_deref().unwrap_or("openai");

    if api_key.is_some() || model.is_some() {
        let mut provider_config = serde_json::Map::new();
        if let Some(k) = api_key {
            provider_config.insert("api_key".to_string(), serde_json::Value::String(k));
        }
        if let Some(m) = model {
            provider_config.insert("default_model".to_string(), serde_json::Value::String(m));
        }

        let mut providers = serde_json::Map::new();
        providers.insert(
            target_provider.to_string(),
            serde_json::Value::Object(provider_config),
        );
        root.insert(
            "providers".to_string(),
            serde_json::Value::Object(providers),
        );
    }

    Ok(Some(serde_json::Value::Object(root)))
}

fn normalize_and_validate_provider(provider: Option<String>) -> anyhow::Result<Option<String>> {
    let Some(provider) = provider else {
        return Ok(None);
    };
    let normalized = provider.trim().to_lowercase();
    if normalized.is_empty() {
        anyhow::bail!(
            "provider cannot be empty. supported providers: {}",
            SUPPORTED_PROVIDER_IDS.join(", ")
        );
    }
    if SUPPORTED_PROVIDER_IDS.contains(&normalized.as_str()) {
        return Ok(Some(normalized));
    }
    anyhow::bail!(
        "unsupported provider `{}`. supported providers: {}",
        provider,
        SUPPORTED_PROVIDER_IDS.join(", ")
    );
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("PARLEY_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::data_local_dir()
        .map(|d| d.join("parley"))
        .unwrap_or_else(|| PathBuf::from(".parley"))
}

fn read_tool_json(input: &str) -> anyhow::Result<serde_json::Value> {
    if input.trim() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(serde_json::from_str(&buf)?);
    }
    if let Some(path) = input.strip_prefix('@') {
        let raw = fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
        return Ok(serde_json::from_str(&raw)?);
    }
    Ok(serde_json::from_str(input)?)
}
