//! Admin surface: debug-mode toggling, active-provider selection and model
//! discovery
//!
//! Only reads and state transitions live here; provider records themselves
//! are seeded from the config file.

pub mod handlers;

use axum::{
    Router,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::proxy::AppState;

/// Body of `POST /api/debug-mode`
#[derive(Debug, Clone, Deserialize)]
pub struct DebugModeRequest {
    pub enabled: bool,
}

/// Current debug-mode state
#[derive(Debug, Clone, Serialize)]
pub struct DebugModeStatus {
    pub enabled: bool,
    /// Trace file of the open session
    pub log_file: Option<PathBuf>,
}

/// Outcome of an admin state transition
#[derive(Debug, Clone, Serialize)]
pub struct AdminAck {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<String>,
}

impl AdminAck {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
            enabled: None,
            log_file: None,
            active: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            ..Self::ok()
        }
    }
}

/// One model offered by a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub name: String,
}

/// Response of `GET /api/models/{id}`
#[derive(Debug, Clone, Serialize)]
pub struct ModelList {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<ModelEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Error document returned by the provider, when it sent JSON
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
}

impl ModelList {
    pub fn found(models: Vec<ModelEntry>) -> Self {
        Self {
            success: true,
            data: Some(models),
            message: None,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>, error: Option<serde_json::Value>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message.into()),
            error,
        }
    }
}

/// Routes mounted under `/api`
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/debug-mode",
            get(handlers::get_debug_mode).post(handlers::set_debug_mode),
        )
        .route("/active-config", get(handlers::active_config))
        .route("/configs/{id}/activate", post(handlers::activate))
        .route("/models/{id}", get(handlers::provider_models))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_ack_serialization() {
        let json = serde_json::to_value(AdminAck::failed("boom")).unwrap();
        assert_eq!(json, serde_json::json!({"success": false, "message": "boom"}));
    }

    #[test]
    fn test_model_list_serialization() {
        let found = ModelList::found(vec![ModelEntry {
            id: "gpt-4o".to_string(),
            name: "gpt-4o".to_string(),
        }]);
        assert_eq!(
            serde_json::to_value(found).unwrap(),
            serde_json::json!({"success": true, "data": [{"id": "gpt-4o", "name": "gpt-4o"}]})
        );

        let failed = ModelList::failed("denied", None);
        assert_eq!(
            serde_json::to_value(failed).unwrap(),
            serde_json::json!({"success": false, "message": "denied"})
        );
    }

    #[test]
    fn test_debug_mode_request_requires_enabled() {
        assert!(serde_json::from_str::<DebugModeRequest>(r#"{"enabled":true}"#).unwrap().enabled);
        assert!(serde_json::from_str::<DebugModeRequest>("{}").is_err());
    }
}
