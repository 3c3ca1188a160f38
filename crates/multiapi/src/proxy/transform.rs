//! Turns an inbound call into an outbound request against the active provider.

use axum::http::{
    HeaderMap, HeaderName, HeaderValue, Method,
    header::{AUTHORIZATION, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING},
};
use bytes::{Bytes, BytesMut};
use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
use serde_json::{error::Category, value::RawValue};
use std::fmt;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use super::ProxyError;
use crate::registry::{ProviderRecord, ProviderRegistry};

/// Why a model override was not applied. Never fatal: the body is forwarded as-is.
#[derive(Error, Debug, PartialEq)]
pub enum TransformError {
    #[error("body is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("body is not a JSON object")]
    NotAnObject,

    #[error("body has no model field")]
    NoModelField,

    #[error("failed to re-serialize body: {0}")]
    Serialize(String),
}

/// The caller's request as received on the forwarding route
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    /// Path after the route prefix, e.g. `/chat/completions`
    pub sub_path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Fully resolved request to send upstream
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// Correlates log lines and trace entries of one exchange
    pub request_id: String,
    pub provider_id: String,
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Look up the active provider, failing before any network I/O when there is none
pub async fn resolve_active(
    registry: &dyn ProviderRegistry,
) -> Result<ProviderRecord, ProxyError> {
    registry
        .get_active()
        .await
        .ok_or(ProxyError::NoActiveProvider)
}

/// Build the outbound request for `provider`.
///
/// The target is the provider endpoint with the sub-path appended verbatim.
/// Caller headers are copied (client-managed framing headers excepted) and
/// the authorization header is always replaced by the provider credential.
pub fn transform(
    inbound: InboundRequest,
    provider: &ProviderRecord,
) -> Result<OutboundRequest, ProxyError> {
    let mut target = format!("{}{}", provider.endpoint, inbound.sub_path);
    if let Some(query) = inbound.query.as_deref().filter(|q| !q.is_empty()) {
        target.push('?');
        target.push_str(query);
    }
    let url =
        Url::parse(&target).map_err(|e| ProxyError::InvalidTarget(format!("{target}: {e}")))?;

    let mut headers = HeaderMap::with_capacity(inbound.headers.len() + 1);
    for (name, value) in inbound.headers.iter() {
        if !is_client_managed(name) {
            headers.append(name.clone(), value.clone());
        }
    }

    let mut credential = HeaderValue::from_str(&format!("Bearer {}", provider.api_key))
        .map_err(|_| {
            ProxyError::Internal(format!(
                "credential of provider '{}' is not a valid header value",
                provider.id
            ))
        })?;
    credential.set_sensitive(true);
    headers.insert(AUTHORIZATION, credential);

    let body = match provider.model_override() {
        Some(model) if !inbound.body.is_empty() => {
            match override_model(&inbound.body, model) {
                Ok(patched) => patched,
                Err(e) => {
                    tracing::debug!("Model override skipped: {e}");
                    inbound.body
                }
            }
        }
        _ => inbound.body,
    };

    Ok(OutboundRequest {
        request_id: Uuid::new_v4().to_string(),
        provider_id: provider.id.clone(),
        method: inbound.method,
        url,
        headers,
        body,
    })
}

/// Headers owned by the HTTP client; recomputed for the outbound request
fn is_client_managed(name: &HeaderName) -> bool {
    *name == HOST || *name == CONTENT_LENGTH || *name == TRANSFER_ENCODING || *name == CONNECTION
}

/// Top-level members of a JSON object, values borrowed unparsed from the input
struct TopLevelMembers<'a>(Vec<(String, &'a RawValue)>);

impl<'de> Deserialize<'de> for TopLevelMembers<'de> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct MembersVisitor;

        impl<'de> Visitor<'de> for MembersVisitor {
            type Value = TopLevelMembers<'de>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut members = Vec::new();
                while let Some(member) = map.next_entry::<String, &'de RawValue>()? {
                    members.push(member);
                }
                Ok(TopLevelMembers(members))
            }
        }

        deserializer.deserialize_map(MembersVisitor)
    }
}

/// Replace the value of the top-level `model` field of a JSON object body.
///
/// Only the bytes of that value change: whitespace, key order, number
/// spelling and nested objects are carried over exactly as received. A body
/// whose model already equals `model` is returned unchanged.
pub fn override_model(body: &Bytes, model: &str) -> Result<Bytes, TransformError> {
    let members: TopLevelMembers<'_> =
        serde_json::from_slice(body).map_err(|e| match e.classify() {
            Category::Data => TransformError::NotAnObject,
            _ => TransformError::InvalidJson(e.to_string()),
        })?;

    let base = body.as_ptr() as usize;
    let mut has_model = false;
    let mut spans = Vec::new();
    for (key, value) in &members.0 {
        if key != "model" {
            continue;
        }
        has_model = true;
        let current = serde_json::from_str::<String>(value.get()).ok();
        if current.as_deref() == Some(model) {
            continue;
        }
        // Borrowed raw values point into `body`
        let start = value.get().as_ptr() as usize - base;
        spans.push(start..start + value.get().len());
    }

    if !has_model {
        return Err(TransformError::NoModelField);
    }
    if spans.is_empty() {
        return Ok(body.clone());
    }

    let replacement =
        serde_json::to_vec(model).map_err(|e| TransformError::Serialize(e.to_string()))?;
    let mut patched = BytesMut::with_capacity(body.len() + replacement.len() * spans.len());
    let mut cursor = 0;
    for span in spans {
        patched.extend_from_slice(&body[cursor..span.start]);
        patched.extend_from_slice(&replacement);
        cursor = span.end;
    }
    patched.extend_from_slice(&body[cursor..]);
    Ok(patched.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(model: Option<&str>) -> ProviderRecord {
        ProviderRecord {
            id: "up".to_string(),
            name: "Upstream".to_string(),
            endpoint: "https://up.example/v1".to_string(),
            api_key: "sk-provider-secret".to_string(),
            model: model.map(str::to_string),
        }
    }

    fn inbound(body: &'static str) -> InboundRequest {
        InboundRequest {
            method: Method::POST,
            sub_path: "/chat/completions".to_string(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    #[test]
    fn test_scenario_override_and_url() {
        let out = transform(inbound(r#"{"model":"x","stream":false}"#), &provider(Some("gpt-x")))
            .unwrap();

        assert_eq!(out.url.as_str(), "https://up.example/v1/chat/completions");
        assert_eq!(&out.body[..], br#"{"model":"gpt-x","stream":false}"#);
        assert_eq!(out.method, Method::POST);
        assert_eq!(out.provider_id, "up");
    }

    #[test]
    fn test_override_preserves_key_order_and_other_fields() {
        let body = Bytes::from_static(
            br#"{"temperature":0.7,"model":"x","messages":[{"role":"user","content":"hi"}],"n":1}"#,
        );
        let patched = override_model(&body, "gpt-x").unwrap();
        assert_eq!(
            &patched[..],
            br#"{"temperature":0.7,"model":"gpt-x","messages":[{"role":"user","content":"hi"}],"n":1}"#
        );
    }

    #[test]
    fn test_body_without_model_field_is_untouched() {
        let raw = "{ \"messages\": [] ,\n \"stream\": true }";
        let out = transform(inbound(raw), &provider(Some("gpt-x"))).unwrap();
        assert_eq!(&out.body[..], raw.as_bytes());
    }

    #[test]
    fn test_malformed_json_is_forwarded_unmodified() {
        let raw = r#"{"model": "x", "#;
        let out = transform(inbound(raw), &provider(Some("gpt-x"))).unwrap();
        assert_eq!(&out.body[..], raw.as_bytes());

        let err = override_model(&Bytes::from_static(raw.as_bytes()), "gpt-x").unwrap_err();
        assert!(matches!(err, TransformError::InvalidJson(_)));
    }

    #[test]
    fn test_non_object_json_is_untouched() {
        let err = override_model(&Bytes::from_static(b"[1,2,3]"), "gpt-x").unwrap_err();
        assert_eq!(err, TransformError::NotAnObject);
    }

    #[test]
    fn test_no_override_configured_keeps_bytes() {
        let raw = "{\"model\" : \"x\"}";
        let out = transform(inbound(raw), &provider(None)).unwrap();
        assert_eq!(&out.body[..], raw.as_bytes());

        let out = transform(inbound(raw), &provider(Some(""))).unwrap();
        assert_eq!(&out.body[..], raw.as_bytes());
    }

    #[test]
    fn test_override_keeps_every_other_byte() {
        let body = Bytes::from_static(
            b"{\"model\": \"x\", \"temperature\": 1e0, \"seed\": 123456789012345678901234}",
        );
        let patched = override_model(&body, "gpt-x").unwrap();
        assert_eq!(
            &patched[..],
            &b"{\"model\": \"gpt-x\", \"temperature\": 1e0, \"seed\": 123456789012345678901234}"[..]
        );
    }

    #[test]
    fn test_override_leaves_nested_model_fields_alone() {
        let body = Bytes::from_static(
            b"{\n  \"tools\": [{\"model\": \"inner\"}],\n  \"model\" :\t\"x\",\n  \"top_p\": 0.10\n}",
        );
        let patched = override_model(&body, "gpt-x").unwrap();
        assert_eq!(
            &patched[..],
            &b"{\n  \"tools\": [{\"model\": \"inner\"}],\n  \"model\" :\t\"gpt-x\",\n  \"top_p\": 0.10\n}"[..]
        );
    }

    #[test]
    fn test_override_escapes_model_name() {
        let body = Bytes::from_static(br#"{"model":"x"}"#);
        let patched = override_model(&body, "team\"a\"/m").unwrap();
        let json: serde_json::Value = serde_json::from_slice(&patched).unwrap();
        assert_eq!(json["model"], "team\"a\"/m");
    }

    #[test]
    fn test_matching_model_keeps_original_bytes() {
        let raw = Bytes::from_static(b"{ \"model\": \"gpt-x\" }");
        assert_eq!(override_model(&raw, "gpt-x").unwrap(), raw);
    }

    #[test]
    fn test_credential_replaces_caller_authorization() {
        let mut request = inbound("");
        request
            .headers
            .insert(AUTHORIZATION, HeaderValue::from_static("Bearer caller-token"));

        let out = transform(request, &provider(None)).unwrap();
        let values: Vec<_> = out.headers.get_all(AUTHORIZATION).iter().collect();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0], "Bearer sk-provider-secret");
        assert!(values[0].is_sensitive());
    }

    #[test]
    fn test_headers_copied_with_multi_values_in_order() {
        let mut request = inbound("");
        request
            .headers
            .append("x-trace", HeaderValue::from_static("first"));
        request
            .headers
            .append("x-trace", HeaderValue::from_static("second"));
        request
            .headers
            .insert("accept", HeaderValue::from_static("text/event-stream"));
        request
            .headers
            .insert(HOST, HeaderValue::from_static("gateway.local"));
        request
            .headers
            .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));

        let out = transform(request, &provider(None)).unwrap();
        let traces: Vec<_> = out.headers.get_all("x-trace").iter().collect();
        assert_eq!(traces, vec!["first", "second"]);
        assert_eq!(out.headers["accept"], "text/event-stream");
        assert!(out.headers.get(HOST).is_none());
        assert!(out.headers.get(CONTENT_LENGTH).is_none());
    }

    #[test]
    fn test_sub_path_is_concatenated_verbatim_with_query() {
        let mut request = inbound("");
        request.sub_path = "/models/gpt-4%2Fturbo".to_string();
        request.query = Some("limit=5".to_string());

        let out = transform(request, &provider(None)).unwrap();
        assert_eq!(
            out.url.as_str(),
            "https://up.example/v1/models/gpt-4%2Fturbo?limit=5"
        );
    }

    #[test]
    fn test_invalid_endpoint_is_reported() {
        let mut bad = provider(None);
        bad.endpoint = "not a url".to_string();
        let err = transform(inbound(""), &bad).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidTarget(_)));
    }

    #[test]
    fn test_each_request_gets_its_own_id() {
        let a = transform(inbound(""), &provider(None)).unwrap();
        let b = transform(inbound(""), &provider(None)).unwrap();
        assert_ne!(a.request_id, b.request_id);
    }
}
