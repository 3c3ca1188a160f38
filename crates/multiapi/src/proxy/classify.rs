//! Decide whether an exchange is relayed incrementally or buffered.

use axum::http::{HeaderMap, header::ACCEPT};
use serde_json::Value;

const EVENT_STREAM: &str = "text/event-stream";

/// How the upstream response is delivered to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeMode {
    /// Read the whole upstream response, then answer once
    Buffered,
    /// Relay upstream bytes as they arrive
    Streamed,
}

impl ExchangeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeMode::Buffered => "buffered",
            ExchangeMode::Streamed => "streamed",
        }
    }
}

/// Streamed when the caller accepts an event stream, or the JSON body asks
/// for `"stream": true`. A body that does not parse counts as not asking.
pub fn classify(headers: &HeaderMap, body: &[u8]) -> ExchangeMode {
    if accepts_event_stream(headers) || body_requests_stream(body) {
        ExchangeMode::Streamed
    } else {
        ExchangeMode::Buffered
    }
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|media| media.split(';').next().unwrap_or_default().trim())
        .any(|media| media.eq_ignore_ascii_case(EVENT_STREAM))
}

fn body_requests_stream(body: &[u8]) -> bool {
    if body.is_empty() {
        return false;
    }
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|json| json.get("stream").and_then(Value::as_bool))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn accept(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn test_accept_event_stream_is_streamed() {
        assert_eq!(
            classify(&accept("text/event-stream"), b""),
            ExchangeMode::Streamed
        );
    }

    #[test]
    fn test_accept_with_params_and_list() {
        assert_eq!(
            classify(&accept("application/json, Text/Event-Stream; charset=utf-8"), b""),
            ExchangeMode::Streamed
        );
        assert_eq!(
            classify(&accept("application/json"), b""),
            ExchangeMode::Buffered
        );
    }

    #[test]
    fn test_stream_flag_in_body() {
        let headers = HeaderMap::new();
        assert_eq!(
            classify(&headers, br#"{"model":"x","stream":true}"#),
            ExchangeMode::Streamed
        );
        assert_eq!(
            classify(&headers, br#"{"model":"x","stream":false}"#),
            ExchangeMode::Buffered
        );
        assert_eq!(classify(&headers, br#"{"model":"x"}"#), ExchangeMode::Buffered);
    }

    #[test]
    fn test_non_boolean_stream_flag_is_ignored() {
        assert_eq!(
            classify(&HeaderMap::new(), br#"{"stream":"true"}"#),
            ExchangeMode::Buffered
        );
    }

    #[test]
    fn test_unparseable_body_counts_as_absent() {
        assert_eq!(
            classify(&HeaderMap::new(), b"{\"stream\": tru"),
            ExchangeMode::Buffered
        );
        assert_eq!(
            classify(&accept("text/event-stream"), b"not json"),
            ExchangeMode::Streamed
        );
    }
}
