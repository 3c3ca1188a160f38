//! Forwarding engine: transform, classify, dispatch.

mod classify;
mod dispatch;
mod error;
mod server;
mod transform;

pub use classify::{ExchangeMode, classify};
pub use dispatch::{Dispatcher, RelayStats, is_models_request, relay_stream};
pub use error::{ProxyError, error_response};
pub use server::{AppState, ProxyServer, create_router};
pub use transform::{
    InboundRequest, OutboundRequest, TransformError, override_model, resolve_active, transform,
};
