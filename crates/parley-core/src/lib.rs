pub mod catalog;
pub mod config;
pub mod enablement;
pub mod engine_loop;
pub mod executor;
pub mod extractor;
pub mod sanitize;

pub use catalog::{CatalogBuilder, CatalogRequest, ToolCatalog};
pub use config::{AppConfig, ConfigStore, EngineConfig, ProviderConfig, ToolsConfig};
pub use enablement::{EnablementStore, FileEnablementStore, MemoryEnablementStore};
pub use engine_loop::{
    AbortReason, ConversationLoop, ConversationRequest, LoopConfig, LoopOutcome, RunContext,
};
pub use executor::{coerce_arguments, render_execution_summary, ToolExecutor};
pub use extractor::{
    canonical_tool_name, has_action_markers, ActionBlockExtractor, EmbeddedJsonExtractor,
    ExtractorChain, ParameterlessPolicy, ToolCallExtractor, DEFAULT_PARAMETERLESS_TOOLS,
};
pub use sanitize::{
    clean_assistant_content, is_degenerate_echo, sanitize_history, strip_delimiter_tokens,
    DEGENERATE_ECHO_FALLBACK,
};
