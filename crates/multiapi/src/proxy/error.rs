//! Errors surfaced to callers of the forwarding route
//!
//! Every variant is raised before the first response byte is written, so it
//! always becomes a complete JSON error payload. Failures after a streamed
//! response has started end the stream instead (see `dispatch`).

use axum::{
    Json,
    body::Body,
    http::{Response, StatusCode},
    response::IntoResponse,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    /// No provider is marked active; nothing was sent upstream
    #[error("No active provider is configured")]
    NoActiveProvider,

    /// Connecting to or talking with the upstream failed
    #[error("Upstream request failed: {0}")]
    Gateway(String),

    /// The active provider's endpoint does not form a valid URL
    #[error("Invalid upstream URL: {0}")]
    InvalidTarget(String),

    /// The inbound request could not be read
    #[error("Invalid request: {0}")]
    Request(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NoActiveProvider | ProxyError::Request(_) => StatusCode::BAD_REQUEST,
            ProxyError::Gateway(_) => StatusCode::BAD_GATEWAY,
            ProxyError::InvalidTarget(_) | ProxyError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine-readable error type for the response body
    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::NoActiveProvider => "no_active_provider",
            ProxyError::Gateway(_) => "gateway_error",
            ProxyError::InvalidTarget(_) => "invalid_upstream_config",
            ProxyError::Request(_) => "invalid_request",
            ProxyError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response<Body> {
        error_response(self.status(), self.error_type(), &self.to_string())
    }
}

/// Create a JSON error response
pub fn error_response(status: StatusCode, error_type: &str, message: &str) -> Response<Body> {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
        }
    });
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response<Body>) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(ProxyError::NoActiveProvider.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ProxyError::Gateway("refused".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::InvalidTarget("bad".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ProxyError::Request("truncated".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn test_gateway_error_carries_underlying_text() {
        let response = ProxyError::Gateway("connection refused".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "gateway_error");
        assert!(
            json["error"]["message"]
                .as_str()
                .unwrap()
                .contains("connection refused")
        );
    }

    #[tokio::test]
    async fn test_no_active_provider_payload() {
        let response = ProxyError::NoActiveProvider.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers()["content-type"],
            "application/json"
        );

        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "no_active_provider");
    }
}
