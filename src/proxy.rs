use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Response, StatusCode, header};
use bytes::Bytes;
use futures_util::TryStreamExt as _;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::auth::{self, AuthError};
use crate::probe::adapter;
use crate::router::{self, KeyCycler};
use crate::storage::EndpointKind;
use crate::transport::{FetchError, OutboundRequest, Transport};

#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    #[error("missing api key")]
    AuthMissing,
    #[error("invalid api key")]
    AuthInvalid,
    #[error("{0}")]
    BadRequest(String),
    #[error("model not found")]
    ModelNotFound,
    #[error("{message}")]
    Upstream {
        status: Option<StatusCode>,
        message: String,
    },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<AuthError> for RelayError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Missing => RelayError::AuthMissing,
            AuthError::Invalid => RelayError::AuthInvalid,
            AuthError::Storage(e) => RelayError::Storage(e),
        }
    }
}

/// One inbound request on the proxy surface. Gemini carries the model and
/// stream flag in the URL path; the OpenAI-shaped protocols carry both in
/// the body.
pub struct RelayRequest {
    pub endpoint: EndpointKind,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub path_model: Option<String>,
    pub path_stream: bool,
}

/// Protocol-preserving forwarder: authorize, route, rewrite the model name,
/// relay the response with the transport semantics of the upstream intact.
pub async fn forward(
    db_path: PathBuf,
    transport: &Transport,
    cycler: &KeyCycler,
    req: RelayRequest,
) -> Result<Response<Body>, RelayError> {
    let policy = auth::authenticate(db_path.clone(), &req.headers).await?;

    let mut body_json: Option<serde_json::Value> = if req.body.is_empty() {
        None
    } else {
        Some(
            serde_json::from_slice(&req.body)
                .map_err(|e| RelayError::BadRequest(format!("请求体不是合法 JSON：{e}")))?,
        )
    };

    let model_spec = match (&req.path_model, &body_json) {
        (Some(model), _) => model.clone(),
        (None, Some(v)) => v
            .get("model")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RelayError::BadRequest("请求体缺少 model 字段".to_string()))?,
        (None, None) => return Err(RelayError::BadRequest("请求体缺少 model 字段".to_string())),
    };

    let Some(target) = router::resolve(db_path, cycler, &policy, &model_spec).await? else {
        return Err(RelayError::ModelNotFound);
    };

    let is_stream = if req.endpoint == EndpointKind::Gemini {
        req.path_stream
    } else {
        body_json
            .as_ref()
            .and_then(|v| v.get("stream"))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    };

    // The upstream sees the channel-local model name, not the routed spec.
    let out_body = match (req.endpoint, body_json.as_mut()) {
        (EndpointKind::Gemini, _) => req.body.clone(),
        (_, Some(v)) => {
            if let Some(obj) = v.as_object_mut() {
                obj.insert(
                    "model".to_string(),
                    serde_json::Value::String(target.actual_model.clone()),
                );
            }
            Bytes::from(serde_json::to_vec(&*v).unwrap_or_else(|_| req.body.to_vec()))
        }
        (_, None) => req.body.clone(),
    };

    let url = format!(
        "{}{}",
        target.base_url,
        adapter::endpoint_path(req.endpoint, &target.actual_model, is_stream)
    );
    let mut headers = adapter::endpoint_headers(req.endpoint, &target.upstream_key);
    propagate_anthropic_headers(&req.headers, &mut headers);

    tracing::debug!(
        channel = %target.channel_name,
        model = %target.actual_model,
        endpoint = %req.endpoint,
        stream = is_stream,
        "relaying request"
    );

    // Dropping this future on client disconnect cancels the upstream call.
    let cancel = CancellationToken::new();
    let upstream = transport
        .send(
            OutboundRequest {
                method: reqwest::Method::POST,
                url,
                headers,
                body: Some(out_body),
                proxy: target.channel_proxy.clone(),
                timeout: None,
            },
            &cancel,
        )
        .await
        .map_err(|e| map_fetch_error(&e))?;

    let status = upstream.status();
    if !status.is_success() {
        let body = upstream.bytes().await.unwrap_or_default();
        let message = upstream_error_message(&body, status);
        return Err(RelayError::Upstream {
            status: Some(status),
            message,
        });
    }

    if is_stream {
        return Ok(streaming_response(upstream));
    }

    let body = upstream
        .bytes()
        .await
        .map_err(|e| map_fetch_error(&FetchError::classify(&e)))?;
    let parsed: serde_json::Value = serde_json::from_slice(&body).map_err(|e| {
        RelayError::Upstream {
            status: None,
            message: format!("上游响应不是合法 JSON：{e}"),
        }
    })?;

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(parsed.to_string()))
        .map_err(|e| RelayError::Storage(anyhow::anyhow!(e)))
}

/// Byte-faithful passthrough: no line buffering, no aggregation. The
/// upstream content type survives (SSE for the OpenAI/Anthropic shapes,
/// JSON array streaming for Gemini).
fn streaming_response(upstream: reqwest::Response) -> Response<Body> {
    let status = upstream.status();
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("text/event-stream"));
    let chunked = upstream
        .headers()
        .get(header::TRANSFER_ENCODING)
        .is_some_and(|v| v.to_str().is_ok_and(|s| s.contains("chunked")));

    let stream = upstream.bytes_stream().map_err(std::io::Error::other);

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive");
    if chunked {
        builder = builder.header(header::TRANSFER_ENCODING, "chunked");
    }

    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn propagate_anthropic_headers(inbound: &HeaderMap, outbound: &mut HeaderMap) {
    for name in ["anthropic-version", "anthropic-beta"] {
        if let Some(v) = inbound.get(name) {
            outbound.insert(HeaderName::from_static(name), v.clone());
        }
    }
}

fn map_fetch_error(e: &FetchError) -> RelayError {
    let status = match e {
        FetchError::Timeout => Some(StatusCode::GATEWAY_TIMEOUT),
        _ => None,
    };
    RelayError::Upstream {
        status,
        message: e.to_string(),
    }
}

fn upstream_error_message(body: &[u8], status: StatusCode) -> String {
    if let Ok(v) = serde_json::from_slice::<serde_json::Value>(body)
        && let Some(message) = adapter::body_error_message(&v)
    {
        return message;
    }
    match String::from_utf8_lossy(body).trim() {
        "" => format!("HTTP {}", status.as_u16()),
        text => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_error_prefers_body_message() {
        let body = br#"{"error":{"message":"quota exceeded"}}"#;
        assert_eq!(
            upstream_error_message(body, StatusCode::TOO_MANY_REQUESTS),
            "quota exceeded"
        );
        assert_eq!(
            upstream_error_message(b"", StatusCode::BAD_GATEWAY),
            "HTTP 502"
        );
    }

    #[test]
    fn anthropic_headers_are_propagated() {
        let mut inbound = HeaderMap::new();
        inbound.insert("anthropic-version", HeaderValue::from_static("2024-01-01"));
        inbound.insert("anthropic-beta", HeaderValue::from_static("tools-2024"));
        let mut outbound = adapter::endpoint_headers(EndpointKind::Claude, "k");
        propagate_anthropic_headers(&inbound, &mut outbound);
        assert_eq!(outbound.get("anthropic-version").unwrap(), "2024-01-01");
        assert_eq!(outbound.get("anthropic-beta").unwrap(), "tools-2024");
    }
}
