use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

/// Persisted per-tool enable/disable switches.
#[async_trait]
pub trait EnablementStore: Send + Sync {
    async fn list_enabled_names(&self) -> anyhow::Result<HashSet<String>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct EnablementFile {
    #[serde(default)]
    tools: BTreeMap<String, bool>,
}

/// `{ "tools": { "<name>": true|false } }` on disk, written pretty-printed.
#[derive(Clone)]
pub struct FileEnablementStore {
    path: PathBuf,
    lock: Arc<RwLock<()>>,
}

impl FileEnablementStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Arc::new(RwLock::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn set_enabled(&self, tool_name: &str, enabled: bool) -> anyhow::Result<()> {
        let name = tool_name.trim();
        if name.is_empty() {
            anyhow::bail!("tool name must not be empty");
        }
        let _guard = self.lock.write().await;
        let mut file = self.read_file().await?;
        file.tools.insert(name.to_string(), enabled);
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_string_pretty(&file)?;
        fs::write(&self.path, raw)
            .await
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        tracing::info!("tool `{}` enabled={}", name, enabled);
        Ok(())
    }

    pub async fn entries(&self) -> anyhow::Result<BTreeMap<String, bool>> {
        let _guard = self.lock.read().await;
        Ok(self.read_file().await?.tools)
    }

    async fn read_file(&self) -> anyhow::Result<EnablementFile> {
        if !self.path.exists() {
            return Ok(EnablementFile::default());
        }
        let raw = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid enablement file {}", self.path.display()))
    }
}

#[async_trait]
impl EnablementStore for FileEnablementStore {
    async fn list_enabled_names(&self) -> anyhow::Result<HashSet<String>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(|(_, enabled)| *enabled)
            .map(|(name, _)| name)
            .collect())
    }
}

#[derive(Clone, Default)]
pub struct MemoryEnablementStore {
    enabled: Arc<RwLock<HashSet<String>>>,
}

impl MemoryEnablementStore {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            enabled: Arc::new(RwLock::new(names.into_iter().map(Into::into).collect())),
        }
    }

    pub async fn set_enabled(&self, tool_name: &str, enabled: bool) {
        let mut names = self.enabled.write().await;
        if enabled {
            names.insert(tool_name.to_string());
        } else {
            names.remove(tool_name);
        }
    }
}

#[async_trait]
impl EnablementStore for MemoryEnablementStore {
    async fn list_enabled_names(&self) -> anyhow::Result<HashSet<String>> {
        Ok(self.enabled.read().await.clone())
    }
}
