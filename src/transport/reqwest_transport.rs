//! Reqwest-backed implementation of the [`Transport`] trait.
//!
//! Keeps one `reqwest::Client` per (proxy, verification) pair since both are
//! client-level settings in reqwest, and maps reqwest errors onto the
//! [`FailureKind`] taxonomy.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use http::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::Mutex;

use super::{
    FailureKind, RequestBody, Transport, TransportFailure, TransportRequest, TransportResponse,
    too_large,
};

type ClientKey = (Option<String>, bool);

/// Reqwest transport with a small client cache.
pub struct ReqwestTransport {
    timeout: Option<Duration>,
    clients: Mutex<HashMap<ClientKey, reqwest::Client>>,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            timeout: None,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Applies a total per-request timeout to every client built from now on.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    async fn client(
        &self,
        proxy: Option<&str>,
        verify_tls: bool,
    ) -> Result<reqwest::Client, TransportFailure> {
        let mut guard = self.clients.lock().await;
        let key = (proxy.map(|p| p.to_string()), verify_tls);
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .cookie_store(true)
            .danger_accept_invalid_certs(!verify_tls);

        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        if let Some(endpoint) = proxy {
            let proxy = reqwest::Proxy::all(endpoint)
                .map_err(|err| TransportFailure::new(FailureKind::Proxy, err.to_string()))?;
            builder = builder.proxy(proxy);
        } else {
            builder = builder.no_proxy();
        }

        let client = builder
            .build()
            .map_err(|err| TransportFailure::new(FailureKind::Other, err.to_string()))?;
        guard.insert(key, client.clone());
        Ok(client)
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, TransportFailure> {
        let proxied = request.proxy.is_some();
        let client = self
            .client(request.proxy.as_deref(), request.verify_tls)
            .await?;

        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|err| TransportFailure::new(FailureKind::Other, err.to_string()))?;
        let mut builder = client
            .request(method, request.url.as_str())
            .headers(convert_headers(&request.headers)?);

        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Form(fields) => builder.form(&fields),
            RequestBody::Json(value) => builder.json(&value),
        };

        let mut response = builder
            .send()
            .await
            .map_err(|err| classify(&err, proxied))?;

        let status = response.status().as_u16();
        let headers = convert_back_headers(response.headers())?;
        let url = response.url().clone();
        let limit = request.max_content_length;

        if let (Some(limit), Some(declared)) = (limit, response.content_length()) {
            if declared > limit {
                return Err(too_large(limit));
            }
        }

        let body = if request.stream {
            let mut buffer = BytesMut::new();
            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|err| classify(&err, proxied))?
            {
                buffer.extend_from_slice(&chunk);
                if let Some(limit) = limit.filter(|limit| buffer.len() as u64 > *limit) {
                    return Err(too_large(limit));
                }
            }
            buffer.freeze()
        } else {
            response
                .bytes()
                .await
                .map_err(|err| classify(&err, proxied))?
        };

        Ok(TransportResponse {
            status,
            headers,
            body,
            url,
        })
    }
}

/// Maps a reqwest error onto the retry taxonomy.
///
/// Only the error kind and its source chain are consulted. The top-level
/// message embeds the request URL and is never matched against.
pub(crate) fn classify(err: &reqwest::Error, proxied: bool) -> TransportFailure {
    let chain = source_chain(err);
    let mentions = |needles: &[&str]| needles.iter().any(|needle| chain.contains(needle));

    let kind = if err.is_body() || err.is_decode() {
        FailureKind::ChunkedEncoding
    } else if mentions(&["certificate", "ssl", "tls", "handshake"]) {
        FailureKind::Ssl
    } else if mentions(&["tunnel", "proxy"]) || (proxied && err.is_connect()) {
        FailureKind::Proxy
    } else if err.is_connect() || err.is_timeout() || err.is_request() {
        FailureKind::Connection
    } else {
        FailureKind::Other
    };

    TransportFailure::new(kind, err.to_string())
}

fn source_chain(err: &reqwest::Error) -> String {
    let mut parts = Vec::new();
    let mut source = err.source();
    while let Some(inner) = source {
        parts.push(inner.to_string());
        source = inner.source();
    }
    parts.join(" | ").to_lowercase()
}

fn convert_headers(headers: &HeaderMap) -> Result<reqwest::header::HeaderMap, TransportFailure> {
    let mut map = reqwest::header::HeaderMap::new();
    for (name, value) in headers.iter() {
        let name = reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes())
            .map_err(|err| TransportFailure::new(FailureKind::Other, err.to_string()))?;
        let value = reqwest::header::HeaderValue::from_bytes(value.as_bytes())
            .map_err(|err| TransportFailure::new(FailureKind::Other, err.to_string()))?;
        map.append(name, value);
    }
    Ok(map)
}

fn convert_back_headers(map: &reqwest::header::HeaderMap) -> Result<HeaderMap, TransportFailure> {
    let mut headers = HeaderMap::new();
    for (name, value) in map.iter() {
        let http_name = HeaderName::from_bytes(name.as_str().as_bytes())
            .map_err(|err| TransportFailure::new(FailureKind::Other, err.to_string()))?;
        let http_value = HeaderValue::from_bytes(value.as_bytes())
            .map_err(|err| TransportFailure::new(FailureKind::Other, err.to_string()))?;
        headers.append(http_name, http_value);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn get(url: &str) -> TransportRequest {
        TransportRequest {
            method: http::Method::GET,
            url: url::Url::parse(url).unwrap(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            verify_tls: true,
            proxy: None,
            stream: true,
            max_content_length: None,
        }
    }

    /// Serves one response of `body_len` bytes with no Content-Length.
    async fn serve_body(body_len: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 2048];
            let _ = socket.read(&mut request).await;
            if socket
                .write_all(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n")
                .await
                .is_err()
            {
                return;
            }
            let chunk = vec![b'x'; 1024];
            for _ in 0..body_len / 1024 {
                if socket.write_all(&chunk).await.is_err() {
                    return;
                }
            }
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}/download")
    }

    #[tokio::test]
    async fn caches_clients_per_proxy_and_verification() {
        let transport = ReqwestTransport::new();
        transport.client(None, true).await.unwrap();
        transport.client(None, false).await.unwrap();
        transport.client(None, true).await.unwrap();
        transport
            .client(Some("http://127.0.0.1:3128"), true)
            .await
            .unwrap();
        assert_eq!(transport.clients.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn refused_connection_is_a_connection_failure() {
        let transport = ReqwestTransport::new().with_timeout(Some(Duration::from_secs(5)));
        let failure = transport
            .execute(get("http://127.0.0.1:9/"))
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Connection);
    }

    #[tokio::test]
    async fn url_words_do_not_change_classification() {
        let transport = ReqwestTransport::new().with_timeout(Some(Duration::from_secs(5)));
        for path in ["/openssl-docs", "/proxy-list", "/tls-handshake", "/certificate?tunnel=1"] {
            let failure = transport
                .execute(get(&format!("http://127.0.0.1:9{path}")))
                .await
                .unwrap_err();
            assert_eq!(failure.kind, FailureKind::Connection, "{path}");
        }
    }

    #[tokio::test]
    async fn streamed_body_stops_at_ceiling() {
        let transport = ReqwestTransport::new().with_timeout(Some(Duration::from_secs(5)));
        let mut request = get(&serve_body(256 * 1024).await);
        request.max_content_length = Some(16 * 1024);
        let failure = transport.execute(request).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::TooLarge);
    }

    #[tokio::test]
    async fn streamed_body_within_ceiling_is_returned() {
        let transport = ReqwestTransport::new().with_timeout(Some(Duration::from_secs(5)));
        let mut request = get(&serve_body(8 * 1024).await);
        request.max_content_length = Some(16 * 1024);
        let response = transport.execute(request).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body.len(), 8 * 1024);
    }
}
