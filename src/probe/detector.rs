use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::storage::EndpointKind;
use crate::transport::{FetchError, OutboundRequest, Transport};

use super::adapter;

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a probe needs to hit one `(channel, model, endpoint)` triple.
#[derive(Debug, Clone)]
pub struct ProbeSpec {
    pub base_url: String,
    pub api_key: String,
    pub proxy: Option<String>,
    pub model_name: String,
    pub endpoint: EndpointKind,
    pub prompt: String,
}

/// Protocol-level outcome of a single probe. Transport failures are
/// reported separately (`FetchError`) so the caller can retry them.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub success: bool,
    pub latency_ms: i64,
    pub upstream_status: Option<i64>,
    pub error_message: Option<String>,
    pub response_preview: Option<String>,
}

/// Run one probe end to end: build the request, send it, decode the body and
/// classify the result. Latency spans from pre-send to full body decode.
pub async fn run_probe(
    transport: &Transport,
    spec: &ProbeSpec,
    cancel: &CancellationToken,
) -> Result<ProbeOutcome, FetchError> {
    let url = format!(
        "{}{}",
        spec.base_url,
        adapter::endpoint_path(spec.endpoint, &spec.model_name, false)
    );
    let headers = adapter::endpoint_headers(spec.endpoint, &spec.api_key);
    let body = adapter::probe_body(spec.endpoint, &spec.model_name, &spec.prompt);

    let started = Instant::now();
    let (status, body) = transport
        .send_and_read(
            OutboundRequest {
                method: reqwest::Method::POST,
                url,
                headers,
                body: Some(body),
                proxy: spec.proxy.clone(),
                timeout: Some(PROBE_TIMEOUT),
            },
            cancel,
        )
        .await?;
    let latency_ms = started.elapsed().as_millis() as i64;
    let upstream_status = Some(status.as_u16() as i64);

    let parsed: Option<serde_json::Value> = serde_json::from_slice(&body).ok();

    // Body-reported errors override the HTTP status, 200 included.
    if let Some(v) = parsed.as_ref()
        && let Some(message) = adapter::body_error_message(v)
    {
        return Ok(ProbeOutcome {
            success: false,
            latency_ms,
            upstream_status,
            error_message: Some(message),
            response_preview: None,
        });
    }

    if !status.is_success() {
        let message = match String::from_utf8_lossy(&body).trim() {
            "" => format!("HTTP {}", status.as_u16()),
            text => text.to_string(),
        };
        return Ok(ProbeOutcome {
            success: false,
            latency_ms,
            upstream_status,
            error_message: Some(message),
            response_preview: None,
        });
    }

    let Some(v) = parsed else {
        return Ok(ProbeOutcome {
            success: false,
            latency_ms,
            upstream_status,
            error_message: Some("响应不是合法 JSON".to_string()),
            response_preview: None,
        });
    };

    if spec.endpoint == EndpointKind::Image && !adapter::image_response_ok(&v) {
        return Ok(ProbeOutcome {
            success: false,
            latency_ms,
            upstream_status,
            error_message: Some("image response missing data[0].url/b64_json".to_string()),
            response_preview: None,
        });
    }

    Ok(ProbeOutcome {
        success: true,
        latency_ms,
        upstream_status,
        error_message: None,
        response_preview: adapter::response_preview(spec.endpoint, &v),
    })
}

/// Fetch the channel's model listing (`GET /v1/models`).
pub async fn fetch_model_list(
    transport: &Transport,
    base_url: &str,
    api_key: &str,
    proxy: Option<String>,
) -> Result<Vec<String>, anyhow::Error> {
    let url = format!("{base_url}/v1/models");
    let mut headers = reqwest::header::HeaderMap::new();
    if let Ok(v) = reqwest::header::HeaderValue::from_str(&format!("Bearer {api_key}")) {
        headers.insert(reqwest::header::AUTHORIZATION, v);
    }

    let cancel = CancellationToken::new();
    let (status, body) = transport
        .send_and_read(
            OutboundRequest {
                method: reqwest::Method::GET,
                url,
                headers,
                body: None,
                proxy,
                timeout: Some(PROBE_TIMEOUT),
            },
            &cancel,
        )
        .await?;

    if !status.is_success() {
        anyhow::bail!("model list HTTP {}", status.as_u16());
    }
    adapter::parse_model_list(&body)
}
