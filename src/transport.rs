use bytes::Bytes;
use reqwest::header::HeaderMap;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Probes must give up quickly; relayed conversations may idle for minutes
/// between chunks.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RELAY_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("timeout")]
    Timeout,
    #[error("cancelled")]
    Cancelled,
    #[error("connect error: {0}")]
    Connect(String),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("代理地址无效：{0}")]
    InvalidProxy(String),
}

impl FetchError {
    pub fn classify(e: &reqwest::Error) -> FetchError {
        if e.is_timeout() {
            return FetchError::Timeout;
        }
        if is_tls_error(e) {
            return FetchError::Tls(short_message(e));
        }
        if e.is_connect() {
            return FetchError::Connect(short_message(e));
        }
        FetchError::Io(short_message(e))
    }
}

fn is_tls_error(e: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(e);
    while let Some(err) = source {
        let text = err.to_string().to_ascii_lowercase();
        if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
            return true;
        }
        source = err.source();
    }
    false
}

fn short_message(e: &reqwest::Error) -> String {
    // The innermost source carries the useful diagnostic ("connection
    // refused"), the outer layers only repeat the URL.
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(e);
    let mut last = e.to_string();
    while let Some(err) = source {
        last = err.to_string();
        source = err.source();
    }
    last
}

pub struct OutboundRequest {
    pub method: reqwest::Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Per-call outbound proxy; falls back to the process-wide default.
    pub proxy: Option<String>,
    /// Total deadline covering connect through body completion. `None`
    /// leaves only the idle read timeout.
    pub timeout: Option<Duration>,
}

/// Shared outbound HTTP client. One reqwest client is built (and cached) per
/// effective proxy URL; the URL scheme picks the tunneling mode
/// (`http(s)://` CONNECT, `socks5://` SOCKS5, optional userinfo in both).
pub struct Transport {
    default_proxy: Option<String>,
    clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl Transport {
    pub fn new(default_proxy: Option<String>) -> Self {
        Self {
            default_proxy,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, proxy: Option<&str>) -> Result<reqwest::Client, FetchError> {
        let effective = proxy
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .or(self.default_proxy.as_deref())
            .unwrap_or("");

        let mut clients = self.clients.lock().expect("transport client cache lock");
        if let Some(client) = clients.get(effective) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(RELAY_IDLE_TIMEOUT);
        if !effective.is_empty() {
            let proxy = reqwest::Proxy::all(effective)
                .map_err(|e| FetchError::InvalidProxy(format!("{effective} ({e})")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| FetchError::Io(e.to_string()))?;

        clients.insert(effective.to_string(), client.clone());
        Ok(client)
    }

    /// Send a request. The cancellation handle aborts connect, TLS and
    /// response-header phases; body reads are cancelled by dropping the
    /// response.
    pub async fn send(
        &self,
        req: OutboundRequest,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, FetchError> {
        let client = self.client_for(req.proxy.as_deref())?;

        let mut builder = client
            .request(req.method, &req.url)
            .headers(req.headers);
        if let Some(timeout) = req.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = req.body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            res = builder.send() => res.map_err(|e| FetchError::classify(&e)),
        }
    }

    /// Send and read the whole body, still honoring the cancellation handle
    /// while the body streams in.
    pub async fn send_and_read(
        &self,
        req: OutboundRequest,
        cancel: &CancellationToken,
    ) -> Result<(reqwest::StatusCode, Bytes), FetchError> {
        let resp = self.send(req, cancel).await?;
        let status = resp.status();
        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            body = resp.bytes() => body.map_err(|e| FetchError::classify(&e))?,
        };
        Ok((status, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_before_send() {
        let transport = Transport::new(None);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = transport
            .send(
                OutboundRequest {
                    method: reqwest::Method::GET,
                    // Unroutable; the select must still resolve via the token.
                    url: "http://10.255.255.1:9/".to_string(),
                    headers: HeaderMap::new(),
                    body: None,
                    proxy: None,
                    timeout: Some(Duration::from_secs(30)),
                },
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Cancelled));
    }

    #[test]
    fn invalid_proxy_is_reported() {
        let transport = Transport::new(None);
        let err = transport.client_for(Some("::not-a-url::")).unwrap_err();
        assert!(matches!(err, FetchError::InvalidProxy(_)));
    }

    #[test]
    fn per_call_proxy_overrides_default() {
        let transport = Transport::new(Some("http://default.proxy:8080".to_string()));
        // Distinct cache entries per effective proxy URL.
        transport.client_for(None).unwrap();
        transport
            .client_for(Some("socks5://127.0.0.1:1080"))
            .unwrap();
        assert_eq!(transport.clients.lock().unwrap().len(), 2);
    }
}
