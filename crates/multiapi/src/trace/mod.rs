//! Debug traces: a diagnostic copy of every exchange made while a debug
//! session is open.
//!
//! Entries are written one JSON object per line to a per-session file and
//! mirrored, best-effort, into the registry store.

mod recorder;

pub use recorder::{SessionInfo, TraceRecorder};

use axum::http::{HeaderMap, header::AUTHORIZATION};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::registry::mask_secret;

/// Errors raised by the trace sink
#[derive(Error, Debug)]
pub enum TraceError {
    /// The session destination could not be created; tracing stays disabled
    #[error("Failed to start debug session: {0}")]
    Init(String),

    /// A single entry could not be appended
    #[error("Failed to write trace entry: {0}")]
    Write(String),
}

/// One append-only trace record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: TraceKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceKind {
    SessionStart {
        session_id: String,
        message: String,
    },
    SessionEnd {
        session_id: String,
        duration_secs: u64,
        duration: String,
        message: String,
    },
    RequestResponse {
        request: Value,
        response: Value,
    },
    StreamChunk {
        request: Value,
        response: Value,
    },
}

impl TraceEntry {
    pub fn now(kind: TraceKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn request_response(request: Value, response: Value) -> Self {
        Self::now(TraceKind::RequestResponse { request, response })
    }

    /// A raw chunk of a streamed response, carried as (lossy) text
    pub fn stream_chunk(request: Value, chunk: &[u8]) -> Self {
        let response = serde_json::json!({
            "chunk": String::from_utf8_lossy(chunk),
        });
        Self::now(TraceKind::StreamChunk { request, response })
    }

    /// The serialized `type` tag
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            TraceKind::SessionStart { .. } => "session_start",
            TraceKind::SessionEnd { .. } => "session_end",
            TraceKind::RequestResponse { .. } => "request_response",
            TraceKind::StreamChunk { .. } => "stream_chunk",
        }
    }
}

/// Request metadata as recorded in traces
pub fn request_snapshot(
    request_id: &str,
    method: &str,
    url: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Value {
    let mut snapshot = Map::new();
    snapshot.insert("request_id".to_string(), Value::from(request_id));
    snapshot.insert("method".to_string(), Value::from(method));
    snapshot.insert("url".to_string(), Value::from(url));
    snapshot.insert("headers".to_string(), headers_snapshot(headers));
    if !body.is_empty() {
        snapshot.insert("body".to_string(), body_snapshot(body));
    }
    Value::Object(snapshot)
}

/// Response metadata as recorded in traces
pub fn response_snapshot(status: u16, headers: &HeaderMap, body: &[u8]) -> Value {
    let mut snapshot = Map::new();
    snapshot.insert("status".to_string(), Value::from(status));
    snapshot.insert("headers".to_string(), headers_snapshot(headers));
    if !body.is_empty() {
        snapshot.insert("body".to_string(), body_snapshot(body));
    }
    Value::Object(snapshot)
}

/// Decode a body as JSON, falling back to its text
pub fn body_snapshot(body: &[u8]) -> Value {
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

/// Headers as `name -> [values...]`, with credentials masked
fn headers_snapshot(headers: &HeaderMap) -> Value {
    let mut map = Map::new();
    for name in headers.keys() {
        let values = headers
            .get_all(name)
            .iter()
            .map(|value| {
                let text = String::from_utf8_lossy(value.as_bytes()).into_owned();
                if name == AUTHORIZATION {
                    Value::String(mask_authorization(&text))
                } else {
                    Value::String(text)
                }
            })
            .collect();
        map.insert(name.as_str().to_string(), Value::Array(values));
    }
    Value::Object(map)
}

fn mask_authorization(value: &str) -> String {
    match value.split_once(' ') {
        Some((scheme, token)) => format!("{scheme} {}", mask_secret(token)),
        None => mask_secret(value),
    }
}
