//! Test utilities for multiapi - in-memory registry and fixtures
//!
//! [`MemoryRegistry`] stands in for the file-backed store so router and
//! dispatcher tests never touch `db.json`.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};

use crate::config::ProxyConfig;
use crate::error::{MultiApiError, Result};
use crate::proxy::AppState;
use crate::registry::{ProviderRecord, ProviderRegistry, RegistryControl, TraceMirror};
use crate::trace::{TraceEntry, TraceRecorder};

#[derive(Debug, Default)]
struct Selection {
    providers: Vec<ProviderRecord>,
    active: Option<String>,
    debug_mode: bool,
}

/// Registry kept entirely in memory
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    selection: RwLock<Selection>,
    traces: Mutex<Vec<TraceEntry>>,
    fail_mirror: AtomicBool,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding `record` as its only, active, provider
    pub fn with_active(record: ProviderRecord) -> Self {
        let mut registry = Self::default();
        {
            let selection = registry.selection.get_mut();
            selection.active = Some(record.id.clone());
            selection.providers.push(record);
        }
        registry
    }

    /// Make every mirrored trace append fail
    pub fn failing_mirror(self) -> Self {
        self.fail_mirror.store(true, Ordering::SeqCst);
        self
    }

    pub async fn add(&self, record: ProviderRecord) {
        self.selection.write().await.providers.push(record);
    }

    /// Trace entries mirrored so far
    pub async fn traces(&self) -> Vec<TraceEntry> {
        self.traces.lock().await.clone()
    }

    /// The persisted debug flag, as the store would have it
    pub async fn persisted_debug_mode(&self) -> bool {
        self.selection.read().await.debug_mode
    }
}

#[async_trait]
impl ProviderRegistry for MemoryRegistry {
    async fn get_active(&self) -> Option<ProviderRecord> {
        let selection = self.selection.read().await;
        let active = selection.active.as_deref()?;
        selection.providers.iter().find(|p| p.id == active).cloned()
    }
}

#[async_trait]
impl RegistryControl for MemoryRegistry {
    async fn provider(&self, id: &str) -> Option<ProviderRecord> {
        let selection = self.selection.read().await;
        selection.providers.iter().find(|p| p.id == id).cloned()
    }

    async fn activate(&self, id: &str) -> Result<()> {
        let mut selection = self.selection.write().await;
        if !selection.providers.iter().any(|p| p.id == id) {
            return Err(MultiApiError::NotFound(format!("provider {id}")));
        }
        selection.active = Some(id.to_string());
        Ok(())
    }

    async fn debug_mode(&self) -> bool {
        self.selection.read().await.debug_mode
    }

    async fn set_debug_mode(&self, enabled: bool) -> Result<()> {
        self.selection.write().await.debug_mode = enabled;
        Ok(())
    }
}

#[async_trait]
impl TraceMirror for MemoryRegistry {
    async fn append_traces(&self, entries: &[TraceEntry]) -> Result<()> {
        if self.fail_mirror.load(Ordering::SeqCst) {
            return Err(MultiApiError::Storage("mirror unavailable".to_string()));
        }
        self.traces.lock().await.extend_from_slice(entries);
        Ok(())
    }
}

/// Provider fixture with a fixed, recognizable credential
pub fn provider(id: &str, endpoint: &str, model: Option<&str>) -> ProviderRecord {
    ProviderRecord {
        id: id.to_string(),
        name: format!("Provider {id}"),
        endpoint: endpoint.to_string(),
        api_key: format!("sk-test-{id}-secret"),
        model: model.map(str::to_string),
    }
}

/// Application state over `registry`, tracing into `logs_dir` and mirroring into the registry
pub fn test_state(registry: MemoryRegistry, logs_dir: &Path) -> Arc<AppState> {
    test_state_shared(Arc::new(registry), logs_dir)
}

/// Like [`test_state`], keeping a handle on the registry for assertions
pub fn test_state_shared(registry: Arc<MemoryRegistry>, logs_dir: &Path) -> Arc<AppState> {
    let recorder = Arc::new(TraceRecorder::new(
        logs_dir,
        Some(registry.clone() as Arc<dyn TraceMirror>),
    ));
    let state = AppState::new(&ProxyConfig::default(), registry.clone(), registry, recorder)
        .expect("Failed to build test state");
    Arc::new(state)
}
