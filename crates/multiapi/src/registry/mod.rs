//! Provider registry: the records the gateway forwards to and the single
//! active selection.
//!
//! The forwarding core only ever reads from the registry through
//! [`ProviderRegistry`], and hands trace entries to it through
//! [`TraceMirror`]. [`JsonStore`] is the file-backed implementation used by
//! the daemon.

mod store;

pub use store::{JsonStore, StoreData};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;
use crate::trace::TraceEntry;

/// One configured upstream provider
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRecord {
    /// Opaque unique identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Base endpoint URL, e.g. `https://api.openai.com/v1`
    pub endpoint: String,
    /// Credential sent upstream as a bearer token
    #[serde(rename = "apiKey", alias = "api_key")]
    pub api_key: String,
    /// Model name that replaces the `model` field of forwarded bodies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ProviderRecord {
    /// The model override, if one is configured and non-empty
    pub fn model_override(&self) -> Option<&str> {
        self.model.as_deref().filter(|m| !m.is_empty())
    }

    /// A copy safe to hand to admin clients: the credential is masked
    pub fn redacted(&self) -> Self {
        Self {
            api_key: mask_secret(&self.api_key),
            ..self.clone()
        }
    }
}

impl fmt::Debug for ProviderRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("api_key", &mask_secret(&self.api_key))
            .field("model", &self.model)
            .finish()
    }
}

/// Mask a secret for display, keeping a short prefix and suffix when long enough
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}****{tail}")
}

/// Read access to the active provider
#[async_trait]
pub trait ProviderRegistry: Send + Sync {
    /// The currently active provider, or `None` when no selection exists
    async fn get_active(&self) -> Option<ProviderRecord>;
}

/// State transitions on the registry, used by the admin surface only
#[async_trait]
pub trait RegistryControl: Send + Sync {
    /// Look up any configured provider by id
    async fn provider(&self, id: &str) -> Option<ProviderRecord>;

    /// Change the active selection; fails with `NotFound` for unknown ids
    async fn activate(&self, id: &str) -> Result<()>;

    /// Persisted debug-mode flag, used to restore tracing after a restart
    async fn debug_mode(&self) -> bool;

    async fn set_debug_mode(&self, enabled: bool) -> Result<()>;
}

/// Secondary, best-effort destination for trace entries
///
/// Entries arrive in batches, in the order they were written to the trace file.
#[async_trait]
pub trait TraceMirror: Send + Sync {
    async fn append_traces(&self, entries: &[TraceEntry]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(model: Option<&str>) -> ProviderRecord {
        ProviderRecord {
            id: "p1".to_string(),
            name: "Provider".to_string(),
            endpoint: "https://up.example/v1".to_string(),
            api_key: "sk-abcdefghijklmnop".to_string(),
            model: model.map(str::to_string),
        }
    }

    #[test]
    fn test_model_override_ignores_empty() {
        assert_eq!(record(Some("gpt-x")).model_override(), Some("gpt-x"));
        assert_eq!(record(Some("")).model_override(), None);
        assert_eq!(record(None).model_override(), None);
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("sk-abcdefghijklmnop"), "sk-****mnop");
        assert_eq!(mask_secret("short"), "****");
        assert_eq!(mask_secret(""), "****");
    }

    #[test]
    fn test_debug_never_prints_credential() {
        let debug = format!("{:?}", record(None));
        assert!(!debug.contains("sk-abcdefghijklmnop"));
        assert!(debug.contains("sk-****mnop"));
    }

    #[test]
    fn test_serializes_with_store_field_names() {
        let json = serde_json::to_value(record(None)).unwrap();
        assert_eq!(json["apiKey"], "sk-abcdefghijklmnop");
        assert!(json.get("model").is_none());

        let parsed: ProviderRecord = serde_json::from_value(serde_json::json!({
            "id": "p2",
            "name": "Other",
            "endpoint": "https://other.example",
            "api_key": "key",
        }))
        .unwrap();
        assert_eq!(parsed.api_key, "key");
    }

    #[test]
    fn test_redacted_masks_only_the_key() {
        let redacted = record(Some("gpt-x")).redacted();
        assert_eq!(redacted.api_key, "sk-****mnop");
        assert_eq!(redacted.endpoint, "https://up.example/v1");
        assert_eq!(redacted.model.as_deref(), Some("gpt-x"));
    }
}
