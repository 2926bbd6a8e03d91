use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use parley_tools::{validate_tool_schema, LocalToolRegistry, RemoteToolRegistry};
use parley_types::ToolDefinition;

use crate::enablement::EnablementStore;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogRequest {
    /// When present the catalog is limited to these names, even if that
    /// leaves it empty.
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
}

impl CatalogRequest {
    pub fn allowing<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_tools: Some(names.into_iter().map(Into::into).collect()),
        }
    }
}

/// Tool set advertised for one request. `external` and `local` are the
/// filtered halves of `merged`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCatalog {
    pub external: Vec<ToolDefinition>,
    pub local: Vec<ToolDefinition>,
    pub merged: Vec<ToolDefinition>,
}

impl ToolCatalog {
    pub fn contains(&self, name: &str) -> bool {
        self.merged.iter().any(|tool| tool.name == name)
    }

    pub fn external_names(&self) -> Vec<&str> {
        self.external.iter().map(|tool| tool.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.merged.is_empty()
    }
}

#[derive(Clone)]
pub struct CatalogBuilder {
    local: LocalToolRegistry,
    registry: Arc<dyn RemoteToolRegistry>,
    enablement: Option<Arc<dyn EnablementStore>>,
}

impl CatalogBuilder {
    pub fn new(local: LocalToolRegistry, registry: Arc<dyn RemoteToolRegistry>) -> Self {
        Self {
            local,
            registry,
            enablement: None,
        }
    }

    pub fn with_enablement(mut self, store: Arc<dyn EnablementStore>) -> Self {
        self.enablement = Some(store);
        self
    }

    pub async fn build(&self, request: &CatalogRequest) -> ToolCatalog {
        let local = self.local.list();
        let local_names = local
            .iter()
            .map(|tool| tool.name.clone())
            .collect::<HashSet<_>>();
        let external = self.external_tools(&local_names).await;

        let filter = match &request.allowed_tools {
            Some(allowed) => Some(
                allowed
                    .iter()
                    .map(|name| name.trim().to_string())
                    .collect::<HashSet<_>>(),
            ),
            None => self.enabled_names().await,
        };

        let keep = |tool: &ToolDefinition| {
            filter
                .as_ref()
                .map(|names| names.contains(&tool.name))
                .unwrap_or(true)
        };
        let local = local.into_iter().filter(|t| keep(t)).collect::<Vec<_>>();
        let external = external.into_iter().filter(|t| keep(t)).collect::<Vec<_>>();
        let merged = local.iter().chain(external.iter()).cloned().collect::<Vec<_>>();
        tracing::debug!(
            "catalog built: {} local, {} external",
            local.len(),
            external.len()
        );
        ToolCatalog {
            external,
            local,
            merged,
        }
    }

    /// Registry failures degrade to no external tools. Invalid schemas,
    /// duplicates, and names shadowed by a local tool are dropped.
    async fn external_tools(&self, local_names: &HashSet<String>) -> Vec<ToolDefinition> {
        let listed = match self.registry.list_available().await {
            Ok(tools) => tools,
            Err(err) => {
                tracing::warn!("external tool registry unavailable: {}", err);
                return Vec::new();
            }
        };
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for tool in listed {
            if local_names.contains(&tool.name) {
                tracing::debug!("external tool `{}` shadowed by local tool", tool.name);
                continue;
            }
            if let Err(err) = validate_tool_schema(&tool) {
                tracing::warn!("dropping external tool: {}", err);
                continue;
            }
            if seen.insert(tool.name.clone()) {
                out.push(tool);
            }
        }
        out
    }

    /// `None` means "no filtering". An empty or unreadable store fails open.
    async fn enabled_names(&self) -> Option<HashSet<String>> {
        let store = self.enablement.as_ref()?;
        match store.list_enabled_names().await {
            Ok(names) if !names.is_empty() => Some(names),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!("tool enablement store unreadable, not filtering: {}", err);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parley_tools::{PageFetcher, SearchBackend};
    use parley_types::{ParameterSchema, PropertySchema};

    use crate::enablement::MemoryEnablementStore;

    struct NoSearch;

    #[async_trait]
    impl SearchBackend for NoSearch {
        async fn search(&self, _query: &str, _file_type: Option<&str>) -> anyhow::Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    struct NoFetch;

    #[async_trait]
    impl PageFetcher for NoFetch {
        async fn fetch(&self, _url: &str) -> anyhow::Result<String> {
            Ok(String::new())
        }
    }

    struct StaticRegistry(anyhow::Result<Vec<ToolDefinition>>);

    #[async_trait]
    impl RemoteToolRegistry for StaticRegistry {
        async fn list_available(&self) -> anyhow::Result<Vec<ToolDefinition>> {
            match &self.0 {
                Ok(tools) => Ok(tools.clone()),
                Err(err) => anyhow::bail!(err.to_string()),
            }
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl EnablementStore for BrokenStore {
        async fn list_enabled_names(&self) -> anyhow::Result<HashSet<String>> {
            anyhow::bail!("disk on fire")
        }
    }

    fn external(name: &str) -> ToolDefinition {
        ToolDefinition::new(name, format!("{name} tool"), ParameterSchema::default())
    }

    fn builder(remote: Vec<ToolDefinition>) -> CatalogBuilder {
        CatalogBuilder::new(
            LocalToolRegistry::new(Arc::new(NoSearch), Arc::new(NoFetch)),
            Arc::new(StaticRegistry(Ok(remote))),
        )
    }

    fn names(tools: &[ToolDefinition]) -> Vec<&str> {
        tools.iter().map(|t| t.name.as_str()).collect()
    }

    fn three_external() -> Vec<ToolDefinition> {
        vec![
            external("post_to_facebook"),
            external("get_page_posts"),
            external("schedule_post"),
        ]
    }

    #[tokio::test]
    async fn merges_local_and_external_tools() {
        let catalog = builder(three_external()).build(&CatalogRequest::default()).await;
        assert_eq!(catalog.local.len(), 2);
        assert_eq!(catalog.external.len(), 3);
        assert_eq!(
            names(&catalog.merged),
            vec![
                "fetch_page",
                "web_search",
                "post_to_facebook",
                "get_page_posts",
                "schedule_post"
            ]
        );
    }

    #[tokio::test]
    async fn allow_list_filters_merged_set() {
        let builder = builder(three_external());
        let catalog = builder.build(&CatalogRequest::allowing(["web_search"])).await;
        assert_eq!(names(&catalog.merged), vec!["web_search"]);
        assert!(catalog.external.is_empty());

        let empty = builder.build(&CatalogRequest::allowing(Vec::<String>::new())).await;
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn enablement_filters_but_fails_open() {
        let enabled = builder(three_external())
            .with_enablement(Arc::new(MemoryEnablementStore::new(["schedule_post"])))
            .build(&CatalogRequest::default())
            .await;
        assert_eq!(names(&enabled.merged), vec!["schedule_post"]);

        let none_enabled = builder(three_external())
            .with_enablement(Arc::new(MemoryEnablementStore::default()))
            .build(&CatalogRequest::default())
            .await;
        assert_eq!(none_enabled.merged.len(), 5);

        let broken = builder(three_external())
            .with_enablement(Arc::new(BrokenStore))
            .build(&CatalogRequest::default())
            .await;
        assert_eq!(broken.merged.len(), 5);
    }

    #[tokio::test]
    async fn allow_list_takes_precedence_over_enablement() {
        let catalog = builder(three_external())
            .with_enablement(Arc::new(MemoryEnablementStore::new(["schedule_post"])))
            .build(&CatalogRequest::allowing(["post_to_facebook"]))
            .await;
        assert_eq!(names(&catalog.merged), vec!["post_to_facebook"]);
    }

    #[tokio::test]
    async fn registry_failure_and_bad_schemas_degrade() {
        let failing = CatalogBuilder::new(
            LocalToolRegistry::new(Arc::new(NoSearch), Arc::new(NoFetch)),
            Arc::new(StaticRegistry(Err(anyhow::anyhow!("connection refused")))),
        );
        let catalog = failing.build(&CatalogRequest::default()).await;
        assert!(catalog.external.is_empty());
        assert_eq!(catalog.local.len(), 2);

        let bad = ToolDefinition::new(
            "bulk_post",
            "",
            ParameterSchema::default().property("posts", PropertySchema::new("array", "")),
        );
        let catalog = builder(vec![
            bad,
            external("web_search"),
            external("schedule_post"),
            external("schedule_post"),
        ])
        .build(&CatalogRequest::default())
        .await;
        assert_eq!(catalog.external_names(), vec!["schedule_post"]);
        assert!(catalog.contains("web_search"));
    }
}
