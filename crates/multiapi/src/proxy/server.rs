//! HTTP server for the gateway
//!
//! Routes:
//! - `/proxy/{*path}` (any method) forwards to the active provider
//! - `/health` liveness probe
//! - `/api/...` admin reads and state transitions

use axum::{
    Json, Router,
    body::Body,
    extract::{Request, State},
    http::Response,
    response::IntoResponse,
    routing::{any, get},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::admin;
use crate::config::ProxyConfig;
use crate::error::{MultiApiError, Result};
use crate::registry::{ProviderRegistry, RegistryControl};
use crate::trace::{SessionInfo, TraceRecorder};

use super::ProxyError;
use super::classify::classify;
use super::dispatch::{Dispatcher, is_models_request};
use super::transform::{InboundRequest, resolve_active, transform};

/// Route prefix of the forwarding endpoint
const PROXY_PREFIX: &str = "/proxy";

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// Read access to the active provider
    pub registry: Arc<dyn ProviderRegistry>,
    /// Active-selection and debug-flag transitions
    pub control: Arc<dyn RegistryControl>,
    pub recorder: Arc<TraceRecorder>,
    pub dispatcher: Dispatcher,
    /// Serializes debug-mode transitions so the persisted flag follows the recorder
    debug_toggle: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(
        config: &ProxyConfig,
        registry: Arc<dyn ProviderRegistry>,
        control: Arc<dyn RegistryControl>,
        recorder: Arc<TraceRecorder>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| MultiApiError::Proxy(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            registry,
            control,
            dispatcher: Dispatcher::new(client, Arc::clone(&recorder), config),
            recorder,
            debug_toggle: Arc::new(Mutex::new(())),
        })
    }

    /// Enable or disable debug tracing.
    ///
    /// Enabling opens a new trace session first; if that fails the error is
    /// returned and tracing stays off. The persisted flag is updated after the
    /// recorder, best-effort.
    pub async fn set_debug_mode(&self, enabled: bool) -> Result<Option<SessionInfo>> {
        let _guard = self.debug_toggle.lock().await;

        let session = if enabled {
            Some(self.recorder.begin().await?)
        } else {
            self.recorder.end().await;
            None
        };

        if let Err(e) = self.control.set_debug_mode(enabled).await {
            tracing::warn!(enabled, error = %e, "Failed to persist debug mode");
        }
        Ok(session)
    }

    pub async fn debug_mode(&self) -> bool {
        self.recorder.is_active().await
    }
}

/// The gateway server
pub struct ProxyServer {
    config: ProxyConfig,
    state: Arc<AppState>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig, state: Arc<AppState>) -> Self {
        Self { config, state }
    }

    /// Listen until Ctrl+C or SIGTERM, then close any open trace session
    pub async fn serve(&self) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .listen_addr
            .parse()
            .map_err(|e| MultiApiError::Config(format!("Invalid listen address: {e}")))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| MultiApiError::Proxy(format!("Failed to bind to {addr}: {e}")))?;

        tracing::info!("Gateway listening on {addr}");
        tracing::info!("Forwarding route: {PROXY_PREFIX}/{{path}}");

        let app = create_router(Arc::clone(&self.state));
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| MultiApiError::Proxy(format!("Server error: {e}")))?;

        if let Some(elapsed) = self.state.recorder.end().await {
            tracing::info!("Closed debug session after {}s", elapsed.as_secs());
        }
        tracing::info!("Gateway shut down gracefully");
        Ok(())
    }
}

/// Create the router with all routes configured
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(PROXY_PREFIX, any(proxy_handler))
        .route("/proxy/{*path}", any(proxy_handler))
        .nest("/api", admin::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Forward one call to the active provider
async fn proxy_handler(State(state): State<Arc<AppState>>, request: Request) -> Response<Body> {
    match forward(&state, request).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(error = %e, "Forwarding failed");
            e.into_response()
        }
    }
}

async fn forward(state: &AppState, request: Request) -> std::result::Result<Response<Body>, ProxyError> {
    let provider = resolve_active(state.registry.as_ref()).await?;

    let (parts, body) = request.into_parts();
    let sub_path = sub_path(parts.uri.path()).to_string();

    if is_models_request(&sub_path) {
        tracing::debug!("Answering model list locally");
        return Ok(state.dispatcher.placeholder_models());
    }

    let body = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| ProxyError::Request(format!("Failed to read request body: {e}")))?;

    let inbound = InboundRequest {
        method: parts.method,
        sub_path,
        query: parts.uri.query().map(str::to_string),
        headers: parts.headers,
        body,
    };

    let outbound = transform(inbound, &provider)?;
    let mode = classify(&outbound.headers, &outbound.body);

    let span = tracing::info_span!(
        "forward",
        request_id = %outbound.request_id,
        provider = %outbound.provider_id,
    );
    state.dispatcher.dispatch(outbound, mode).instrument(span).await
}

/// The raw, still percent-encoded path after the route prefix
fn sub_path(path: &str) -> &str {
    path.strip_prefix(PROXY_PREFIX).unwrap_or(path)
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryRegistry, provider, test_state};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn body_json(response: Response<Body>) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_sub_path_keeps_raw_encoding() {
        assert_eq!(sub_path("/proxy/chat/completions"), "/chat/completions");
        assert_eq!(sub_path("/proxy/models/a%2Fb"), "/models/a%2Fb");
        assert_eq!(sub_path("/proxy"), "");
    }

    #[tokio::test]
    async fn test_health_check() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(test_state(MemoryRegistry::new(), dir.path()));

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_no_active_provider_is_client_error() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(test_state(MemoryRegistry::new(), dir.path()));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/proxy/chat/completions")
                    .body(Body::from(r#"{"model":"x"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["type"], "no_active_provider");
    }

    #[tokio::test]
    async fn test_models_call_needs_active_provider() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(test_state(MemoryRegistry::new(), dir.path()));

        let response = app
            .oneshot(Request::builder().uri("/proxy/models").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_models_call_is_answered_locally() {
        let dir = tempfile::tempdir().unwrap();
        // Port 9 (discard) is never contacted for the model list
        let registry = MemoryRegistry::with_active(provider("p1", "http://127.0.0.1:9/v1", None));
        let app = create_router(test_state(registry, dir.path()));

        let response = app
            .oneshot(Request::builder().uri("/proxy/models").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["object"], "list");
        assert_eq!(json["data"].as_array().unwrap().len(), 1);
        assert_eq!(json["data"][0]["owned_by"], "system");
    }
}
