//! Forwarding dispatcher: sends the outbound request and relays the upstream
//! response, buffered or streamed.
//!
//! A streamed response is relayed by a spawned task that reads the upstream
//! body, cuts it into pieces of at most `stream_buffer_size` bytes and hands
//! each piece to the caller through a single-slot channel. The relay runs at
//! most one piece ahead of the caller: it blocks on the full slot until the
//! caller body has taken the previous piece. A dropped caller closes the
//! channel and stops the relay.

use axum::{
    Json,
    body::Body,
    http::{
        HeaderMap, Response, StatusCode,
        header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING},
    },
    response::IntoResponse,
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::fmt::Display;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

use super::ProxyError;
use super::classify::ExchangeMode;
use super::transform::OutboundRequest;
use crate::config::ProxyConfig;
use crate::trace::{TraceEntry, TraceRecorder, request_snapshot, response_snapshot};

/// True when the sub-path is the "list available models" call
pub fn is_models_request(sub_path: &str) -> bool {
    sub_path.ends_with("/models")
}

/// Counters reported when a streamed relay ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Pieces delivered to the caller
    pub chunks: usize,
    pub bytes: usize,
    /// The caller went away before the upstream finished
    pub caller_disconnected: bool,
    /// The upstream body ended with a read error
    pub upstream_failed: bool,
}

#[derive(Clone)]
pub struct Dispatcher {
    client: reqwest::Client,
    recorder: Arc<TraceRecorder>,
    buffer_size: usize,
    placeholder_model_id: String,
    /// Unix timestamp reported for the placeholder model
    created: i64,
}

impl Dispatcher {
    pub fn new(client: reqwest::Client, recorder: Arc<TraceRecorder>, config: &ProxyConfig) -> Self {
        Self {
            client,
            recorder,
            buffer_size: config.stream_buffer_size.max(1),
            placeholder_model_id: config.placeholder_model_id.clone(),
            created: chrono::Utc::now().timestamp(),
        }
    }

    /// Client shared by every upstream call
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// The synthetic single-entry model list; identical on every call
    pub fn placeholder_models(&self) -> Response<Body> {
        let id = self.placeholder_model_id.as_str();
        Json(serde_json::json!({
            "object": "list",
            "data": [{
                "id": id,
                "object": "model",
                "created": self.created,
                "owned_by": "system",
                "permission": [],
                "root": id,
                "parent": null,
            }],
        }))
        .into_response()
    }

    /// Send `outbound` upstream and relay the result according to `mode`
    pub async fn dispatch(
        &self,
        outbound: OutboundRequest,
        mode: ExchangeMode,
    ) -> Result<Response<Body>, ProxyError> {
        let trace_request = if self.recorder.is_active().await {
            Some(request_snapshot(
                &outbound.request_id,
                outbound.method.as_str(),
                outbound.url.as_str(),
                &outbound.headers,
                &outbound.body,
            ))
        } else {
            None
        };

        tracing::debug!(url = %outbound.url, mode = mode.as_str(), "Forwarding request");

        let mut request = self
            .client
            .request(outbound.method, outbound.url)
            .headers(outbound.headers);
        if !outbound.body.is_empty() {
            request = request.body(outbound.body);
        }

        let upstream = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProxyError::Gateway(format!("Request timed out: {e}"))
            } else if e.is_connect() {
                ProxyError::Gateway(format!("Failed to connect to upstream: {e}"))
            } else {
                ProxyError::Gateway(format!("Request failed: {e}"))
            }
        })?;

        match mode {
            ExchangeMode::Buffered => self.relay_buffered(upstream, trace_request).await,
            ExchangeMode::Streamed => Ok(self.relay_streamed(upstream, trace_request)),
        }
    }

    async fn relay_buffered(
        &self,
        upstream: reqwest::Response,
        trace_request: Option<Value>,
    ) -> Result<Response<Body>, ProxyError> {
        let status = upstream.status();
        let headers = upstream.headers().clone();
        let body = upstream
            .bytes()
            .await
            .map_err(|e| ProxyError::Gateway(format!("Failed to read response body: {e}")))?;

        // Captured before the response leaves the handler
        if let Some(request) = trace_request {
            let response = response_snapshot(status.as_u16(), &headers, &body);
            self.recorder
                .record(TraceEntry::request_response(request, response))
                .await;
        }

        tracing::debug!(status = status.as_u16(), bytes = body.len(), "Upstream response relayed");
        Ok(build_response(status, &headers, Body::from(body)))
    }

    fn relay_streamed(
        &self,
        upstream: reqwest::Response,
        trace_request: Option<Value>,
    ) -> Response<Body> {
        let status = upstream.status();
        let headers = upstream.headers().clone();

        let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(1);
        let recorder = Arc::clone(&self.recorder);
        let buffer_size = self.buffer_size;

        tokio::spawn(
            async move {
                let stats = relay_stream(
                    upstream.bytes_stream(),
                    tx,
                    buffer_size,
                    &recorder,
                    trace_request,
                )
                .await;
                tracing::debug!(
                    chunks = stats.chunks,
                    bytes = stats.bytes,
                    caller_disconnected = stats.caller_disconnected,
                    upstream_failed = stats.upstream_failed,
                    "Stream relay finished"
                );
            }
            .instrument(tracing::Span::current()),
        );

        build_response(status, &headers, Body::from_stream(ReceiverStream::new(rx)))
    }
}

/// Copy `upstream` to `tx` in pieces of at most `buffer_size` bytes.
///
/// With `trace_request` set, each piece is recorded as a `stream_chunk`
/// immediately before it is handed to the caller. The relay ends on upstream
/// end-of-stream, on the first upstream read error (silently, the caller just
/// sees the body end), or as soon as the caller side of `tx` is dropped.
pub async fn relay_stream<S, E>(
    upstream: S,
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
    buffer_size: usize,
    recorder: &TraceRecorder,
    trace_request: Option<Value>,
) -> RelayStats
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let buffer_size = buffer_size.max(1);
    let mut upstream = std::pin::pin!(upstream);
    let mut stats = RelayStats::default();

    'relay: loop {
        let next = tokio::select! {
            _ = tx.closed() => {
                stats.caller_disconnected = true;
                break 'relay;
            }
            next = upstream.next() => next,
        };

        let mut bytes = match next {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                tracing::debug!(error = %e, "Upstream stream ended with error");
                stats.upstream_failed = true;
                break 'relay;
            }
            None => break 'relay,
        };

        while !bytes.is_empty() {
            let piece = bytes.split_to(bytes.len().min(buffer_size));

            if let Some(request) = &trace_request {
                recorder
                    .record(TraceEntry::stream_chunk(request.clone(), &piece))
                    .await;
            }

            let len = piece.len();
            if tx.send(Ok(piece)).await.is_err() {
                stats.caller_disconnected = true;
                break 'relay;
            }
            stats.chunks += 1;
            stats.bytes += len;
        }
    }

    stats
}

fn build_response(status: StatusCode, upstream_headers: &HeaderMap, body: Body) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in upstream_headers.iter() {
        // Framing is recomputed for the caller connection
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING || name == CONNECTION {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    response
}
