//! File-backed registry store (`db.json`)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};
use url::Url;

use super::{ProviderRecord, ProviderRegistry, RegistryControl, TraceMirror};
use crate::error::{MultiApiError, Result};
use crate::trace::TraceEntry;

/// On-disk layout of `db.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreData {
    #[serde(default)]
    pub api_configs: Vec<ProviderRecord>,
    /// Id of the active provider; empty when nothing is active
    #[serde(default)]
    pub active_config: String,
    #[serde(default)]
    pub debug_mode: bool,
    #[serde(default)]
    pub debug_logs: Vec<serde_json::Value>,
}

/// Mirrored trace entries kept by default
pub const DEFAULT_TRACE_LIMIT: usize = 1000;

/// Registry store persisted as a single JSON document.
///
/// Every mutation is applied to a copy, written to disk, and only then
/// published, so a failed save leaves the in-memory state untouched.
/// Readers never wait on disk I/O: mutations are serialized by their own
/// lock and take the data lock only to snapshot and to publish.
pub struct JsonStore {
    path: PathBuf,
    data: RwLock<StoreData>,
    writer: Mutex<()>,
    trace_limit: usize,
}

impl JsonStore {
    /// Load the store from `path`, creating it (and its parent directory) if missing
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                MultiApiError::Storage(format!(
                    "Failed to create data directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let data = if tokio::fs::try_exists(&path).await? {
            let content = tokio::fs::read(&path).await?;
            serde_json::from_slice(&content).map_err(|e| {
                MultiApiError::Storage(format!("Failed to parse {}: {}", path.display(), e))
            })?
        } else {
            tracing::info!("Creating registry store at {}", path.display());
            let data = StoreData::default();
            write_atomically(&path, &data).await?;
            data
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
            writer: Mutex::new(()),
            trace_limit: DEFAULT_TRACE_LIMIT,
        })
    }

    /// Keep at most `limit` mirrored trace entries, dropping the oldest
    pub fn with_trace_limit(mut self, limit: usize) -> Self {
        self.trace_limit = limit;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All provider records
    pub async fn providers(&self) -> Vec<ProviderRecord> {
        self.data.read().await.api_configs.clone()
    }

    pub async fn get(&self, id: &str) -> Option<ProviderRecord> {
        let data = self.data.read().await;
        data.api_configs.iter().find(|p| p.id == id).cloned()
    }

    /// Upsert providers declared in the config file.
    ///
    /// Records whose endpoint is not an absolute http(s) URL are skipped.
    /// Returns the number of records written.
    pub async fn seed(&self, records: &[ProviderRecord]) -> Result<usize> {
        self.update(|next| {
            let mut seeded = 0;
            for record in records {
                if let Err(reason) = validate_endpoint(&record.endpoint) {
                    tracing::warn!(provider = %record.id, "Skipping provider: {reason}");
                    continue;
                }
                match next.api_configs.iter_mut().find(|p| p.id == record.id) {
                    Some(existing) => *existing = record.clone(),
                    None => next.api_configs.push(record.clone()),
                }
                seeded += 1;
            }

            if next.active_config.is_empty() {
                if let Some(first) = next.api_configs.first() {
                    next.active_config = first.id.clone();
                }
            }
            Ok(seeded)
        })
        .await
    }

    /// Number of mirrored trace entries
    pub async fn trace_count(&self) -> usize {
        self.data.read().await.debug_logs.len()
    }

    /// Apply `change` to a copy of the data, save it, then publish it
    async fn update<T>(&self, change: impl FnOnce(&mut StoreData) -> Result<T>) -> Result<T> {
        let _writer = self.writer.lock().await;
        let mut next = self.data.read().await.clone();
        let out = change(&mut next)?;
        write_atomically(&self.path, &next).await?;
        *self.data.write().await = next;
        Ok(out)
    }
}

#[async_trait]
impl ProviderRegistry for JsonStore {
    async fn get_active(&self) -> Option<ProviderRecord> {
        let data = self.data.read().await;
        if data.active_config.is_empty() {
            return None;
        }
        data.api_configs
            .iter()
            .find(|p| p.id == data.active_config)
            .cloned()
    }
}

#[async_trait]
impl RegistryControl for JsonStore {
    async fn provider(&self, id: &str) -> Option<ProviderRecord> {
        self.get(id).await
    }

    async fn activate(&self, id: &str) -> Result<()> {
        self.update(|next| {
            if !next.api_configs.iter().any(|p| p.id == id) {
                return Err(MultiApiError::NotFound(format!("provider {id}")));
            }
            next.active_config = id.to_string();
            Ok(())
        })
        .await?;

        tracing::info!(provider = %id, "Active provider changed");
        Ok(())
    }

    async fn debug_mode(&self) -> bool {
        self.data.read().await.debug_mode
    }

    async fn set_debug_mode(&self, enabled: bool) -> Result<()> {
        self.update(|next| {
            next.debug_mode = enabled;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl TraceMirror for JsonStore {
    async fn append_traces(&self, entries: &[TraceEntry]) -> Result<()> {
        let values = entries
            .iter()
            .map(serde_json::to_value)
            .collect::<serde_json::Result<Vec<_>>>()?;
        let limit = self.trace_limit;

        self.update(|next| {
            next.debug_logs.extend(values);
            let excess = next.debug_logs.len().saturating_sub(limit);
            next.debug_logs.drain(..excess);
            Ok(())
        })
        .await
    }
}

fn validate_endpoint(endpoint: &str) -> std::result::Result<(), String> {
    let url = Url::parse(endpoint).map_err(|e| format!("invalid endpoint '{endpoint}': {e}"))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(format!("unsupported endpoint scheme '{other}'")),
    }
}

async fn write_atomically(path: &Path, data: &StoreData) -> Result<()> {
    let json = serde_json::to_vec_pretty(data)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await.map_err(|e| {
        MultiApiError::Storage(format!("Failed to write {}: {}", tmp.display(), e))
    })?;
    tokio::fs::rename(&tmp, path).await.map_err(|e| {
        MultiApiError::Storage(format!("Failed to replace {}: {}", path.display(), e))
    })?;
    Ok(())
}
