use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{MultiApiError, Result};
use crate::registry::ProviderRecord;

/// Main configuration structure for Multi-API
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Provider id to activate at startup (must name a seeded or stored provider)
    #[serde(default)]
    pub active_provider: Option<String>,
    /// HTTP proxy configuration
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Registry store configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Debug trace configuration
    #[serde(default)]
    pub debug: DebugConfig,
    /// Providers upserted into the registry store at startup
    #[serde(default)]
    pub providers: Vec<ProviderRecord>,
}

impl Config {
    /// Read and parse a TOML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MultiApiError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        toml::from_str(&content)
            .map_err(|e| MultiApiError::Config(format!("Failed to parse config: {e}")))
    }

    /// Directory that receives one trace file per debug session
    pub fn debug_logs_dir(&self) -> PathBuf {
        self.debug
            .logs_dir
            .clone()
            .unwrap_or_else(|| self.storage.data_dir.join("debug_logs"))
    }
}

/// HTTP proxy server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Address to listen on (e.g., "127.0.0.1:3000")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Size of the intermediate buffer used when relaying streamed responses
    #[serde(default = "default_stream_buffer_size")]
    pub stream_buffer_size: usize,
    /// Upstream connect timeout in seconds (the exchange itself is never timed out)
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Id reported by the synthetic model list
    #[serde(default = "default_placeholder_model_id")]
    pub placeholder_model_id: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            stream_buffer_size: default_stream_buffer_size(),
            connect_timeout_secs: default_connect_timeout_secs(),
            placeholder_model_id: default_placeholder_model_id(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_stream_buffer_size() -> usize {
    4096
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_placeholder_model_id() -> String {
    "configure-models-in-the-gateway".to_string()
}

/// Registry store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Base directory for db.json and debug logs
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl StorageConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db.json")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

/// Debug trace configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DebugConfig {
    /// Override for the trace directory (defaults to `<data_dir>/debug_logs`)
    #[serde(default)]
    pub logs_dir: Option<PathBuf>,
    /// Also copy every trace entry into the registry store
    #[serde(default = "default_mirror_to_store")]
    pub mirror_to_store: bool,
    /// Most recent mirrored entries kept in the store; older ones are dropped
    #[serde(default = "default_mirror_limit")]
    pub mirror_limit: usize,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            logs_dir: None,
            mirror_to_store: default_mirror_to_store(),
            mirror_limit: default_mirror_limit(),
        }
    }
}

fn default_mirror_to_store() -> bool {
    true
}

fn default_mirror_limit() -> usize {
    1000
}
