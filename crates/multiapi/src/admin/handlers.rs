use axum::{
    Json,
    body::Body,
    extract::{Path, State, rejection::JsonRejection},
    http::{Response, StatusCode},
    response::IntoResponse,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::admin::{AdminAck, DebugModeRequest, DebugModeStatus, ModelEntry, ModelList};
use crate::error::MultiApiError;
use crate::proxy::{AppState, error_response};

pub async fn get_debug_mode(State(state): State<Arc<AppState>>) -> Json<DebugModeStatus> {
    let session = state.recorder.session_info().await;
    Json(DebugModeStatus {
        enabled: session.is_some(),
        log_file: session.map(|s| s.log_file),
    })
}

pub async fn set_debug_mode(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DebugModeRequest>, JsonRejection>,
) -> Response<Body> {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(AdminAck::failed(rejection.body_text())),
            )
                .into_response();
        }
    };

    match state.set_debug_mode(request.enabled).await {
        Ok(session) => Json(AdminAck {
            enabled: Some(request.enabled),
            log_file: session.map(|s| s.log_file),
            ..AdminAck::ok()
        })
        .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to change debug mode");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(AdminAck::failed(e.to_string())),
            )
                .into_response()
        }
    }
}

/// The active provider with its credential masked
pub async fn active_config(State(state): State<Arc<AppState>>) -> Response<Body> {
    match state.registry.get_active().await {
        Some(provider) => Json(provider.redacted()).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            "no_active_provider",
            "No active provider is configured",
        ),
    }
}

pub async fn activate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response<Body> {
    match state.control.activate(&id).await {
        Ok(()) => Json(AdminAck {
            active: Some(id),
            ..AdminAck::ok()
        })
        .into_response(),
        Err(MultiApiError::NotFound(what)) => (
            StatusCode::NOT_FOUND,
            Json(AdminAck::failed(format!("Unknown {what}"))),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(provider = %id, error = %e, "Failed to activate provider");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(AdminAck::failed(e.to_string())),
            )
                .into_response()
        }
    }
}

/// Model list as returned by an OpenAI-compatible `/models` route
#[derive(Deserialize)]
struct UpstreamModels {
    #[serde(default)]
    data: Vec<UpstreamModel>,
}

#[derive(Deserialize)]
struct UpstreamModel {
    id: String,
}

/// Models offered by a configured provider, fetched from its `/models` route
pub async fn provider_models(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response<Body> {
    let Some(provider) = state.control.provider(&id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(ModelList::failed(format!("Unknown provider {id}"), None)),
        )
            .into_response();
    };

    let url = format!("{}/models", provider.endpoint);
    let upstream = match state
        .dispatcher
        .client()
        .get(&url)
        .bearer_auth(&provider.api_key)
        .send()
        .await
    {
        Ok(upstream) => upstream,
        Err(e) => {
            tracing::warn!(provider = %id, error = %e, "Failed to fetch model list");
            return (
                StatusCode::BAD_GATEWAY,
                Json(ModelList::failed(format!("Failed to fetch models: {e}"), None)),
            )
                .into_response();
        }
    };

    let status = upstream.status();
    let body = match upstream.bytes().await {
        Ok(body) => body,
        Err(e) => {
            return (
                StatusCode::BAD_GATEWAY,
                Json(ModelList::failed(format!("Failed to read model list: {e}"), None)),
            )
                .into_response();
        }
    };

    if status != StatusCode::OK {
        tracing::debug!(
            provider = %id,
            status = status.as_u16(),
            "Provider rejected model list request"
        );
        let failure = match serde_json::from_slice::<serde_json::Value>(&body) {
            Ok(error) => ModelList::failed("Provider returned an error", Some(error)),
            Err(_) => ModelList::failed(
                format!(
                    "Provider returned an error: {}",
                    String::from_utf8_lossy(&body)
                ),
                None,
            ),
        };
        return (status, Json(failure)).into_response();
    }

    match serde_json::from_slice::<UpstreamModels>(&body) {
        Ok(list) => {
            let models = list
                .data
                .into_iter()
                .map(|m| ModelEntry {
                    name: m.id.clone(),
                    id: m.id,
                })
                .collect();
            Json(ModelList::found(models)).into_response()
        }
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(ModelList::failed(format!("Failed to parse model list: {e}"), None)),
        )
            .into_response(),
    }
}
