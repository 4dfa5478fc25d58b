//! Single-attempt request dispatch.
//!
//! Turns a caller level call into transport arguments (TLS verification,
//! streaming, proxy, payload placement) and performs exactly one attempt.
//! Retrying is the retry engine's business.

use std::sync::Arc;

use http::{HeaderMap, Method};
use url::Url;

use crate::modules::proxy::ProxyRecord;
use crate::transport::{
    RequestBody, Transport, TransportFailure, TransportRequest, TransportResponse, too_large,
};

/// Data sent along with a request.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Payload {
    #[default]
    None,
    /// Key/value pairs: query parameters for GET, a form body for POST/PUT.
    Form(Vec<(String, String)>),
    /// JSON document; only ever placed in a POST/PUT body.
    Json(serde_json::Value),
}

impl Payload {
    pub fn form<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Payload::Form(
            pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Payload::None => true,
            Payload::Form(pairs) => pairs.is_empty(),
            Payload::Json(value) => value.is_null(),
        }
    }

    /// Approximate encoded size, recorded in the manifest.
    pub fn size(&self) -> usize {
        match self {
            Payload::None => 0,
            Payload::Form(pairs) => pairs
                .iter()
                .map(|(key, value)| key.len() + value.len() + 1)
                .sum::<usize>()
                + pairs.len().saturating_sub(1),
            Payload::Json(value) => value.to_string().len(),
        }
    }
}

/// A call as the orchestrator sees it, before per-attempt decisions.
#[derive(Debug, Clone)]
pub struct OutboundCall {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub payload: Payload,
}

impl OutboundCall {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            payload: Payload::None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }
}

/// Builds and sends single transport attempts.
#[derive(Clone)]
pub struct RequestDispatcher {
    transport: Arc<dyn Transport>,
    ssl_verify: bool,
    force_skip_ssl_verify: bool,
    max_content_length: Option<u64>,
}

impl RequestDispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            ssl_verify: true,
            force_skip_ssl_verify: false,
            max_content_length: None,
        }
    }

    pub fn with_max_content_length(mut self, limit: Option<u64>) -> Self {
        self.max_content_length = limit;
        self
    }

    pub fn with_ssl_verify(mut self, ssl_verify: bool) -> Self {
        self.ssl_verify = ssl_verify;
        self
    }

    pub fn with_force_skip_ssl_verify(mut self, force: bool) -> Self {
        self.force_skip_ssl_verify = force;
        self
    }

    pub fn ssl_verify(&self) -> bool {
        self.ssl_verify
    }

    pub fn set_ssl_verify(&mut self, ssl_verify: bool) {
        self.ssl_verify = ssl_verify;
    }

    pub fn force_skip_ssl_verify(&self) -> bool {
        self.force_skip_ssl_verify
    }

    pub fn set_force_skip_ssl_verify(&mut self, force: bool) {
        self.force_skip_ssl_verify = force;
    }

    /// TLS verification for a given attempt.
    ///
    /// The first attempt always verifies; later attempts follow `ssl_verify`.
    /// Internal calls and the global override never verify.
    pub fn verify_tls(&self, attempt: u32, internal: bool) -> bool {
        if self.force_skip_ssl_verify || internal {
            return false;
        }
        if attempt == 0 { true } else { self.ssl_verify }
    }

    /// Resolves the transport arguments for one attempt.
    pub fn build(
        &self,
        call: &OutboundCall,
        attempt: u32,
        proxy: Option<&ProxyRecord>,
        internal: bool,
    ) -> TransportRequest {
        let mut url = call.url.clone();
        let mut body = RequestBody::Empty;

        if !call.payload.is_empty() {
            let carries_body = call.method == Method::POST || call.method == Method::PUT;
            match &call.payload {
                Payload::Form(pairs) if call.method == Method::GET => {
                    url.query_pairs_mut().extend_pairs(pairs.iter());
                }
                Payload::Form(pairs) if carries_body => {
                    body = RequestBody::Form(pairs.clone());
                }
                Payload::Json(value) if carries_body => {
                    body = RequestBody::Json(value.clone());
                }
                _ => {
                    log::debug!("payload ignored for {} request to {}", call.method, url);
                }
            }
        }

        TransportRequest {
            method: call.method.clone(),
            url,
            headers: call.headers.clone(),
            body,
            verify_tls: self.verify_tls(attempt, internal),
            proxy: if internal {
                None
            } else {
                proxy.map(ProxyRecord::endpoint)
            },
            stream: call.method == Method::GET,
            max_content_length: if internal {
                None
            } else {
                self.max_content_length
            },
        }
    }

    /// Performs exactly one transport attempt.
    pub async fn send(
        &self,
        call: &OutboundCall,
        attempt: u32,
        proxy: Option<&ProxyRecord>,
        internal: bool,
    ) -> Result<TransportResponse, TransportFailure> {
        let request = self.build(call, attempt, proxy, internal);
        log::debug!(
            "making request: {} {} (attempt {}, verify={})",
            request.method,
            request.url,
            attempt,
            request.verify_tls
        );
        let limit = request.max_content_length;
        let response = self.transport.execute(request).await?;
        match limit {
            Some(limit) if response.body.len() as u64 > limit => Err(too_large(limit)),
            _ => Ok(response),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NoopTransport;

    #[async_trait]
    impl Transport for NoopTransport {
        async fn execute(
            &self,
            request: TransportRequest,
        ) -> Result<TransportResponse, TransportFailure> {
            Ok(TransportResponse {
                status: 204,
                headers: HeaderMap::new(),
                body: bytes::Bytes::new(),
                url: request.url,
            })
        }
    }

    /// Ignores the size ceiling, like a transport that cannot stream.
    struct BulkyTransport;

    #[async_trait]
    impl Transport for BulkyTransport {
        async fn execute(
            &self,
            request: TransportRequest,
        ) -> Result<TransportResponse, TransportFailure> {
            Ok(TransportResponse {
                status: 200,
                headers: HeaderMap::new(),
                body: bytes::Bytes::from(vec![b'x'; 4096]),
                url: request.url,
            })
        }
    }

    fn dispatcher() -> RequestDispatcher {
        RequestDispatcher::new(Arc::new(NoopTransport))
    }

    fn proxy() -> ProxyRecord {
        ProxyRecord::from_endpoint("http://10.1.1.1:3128").unwrap()
    }

    fn call(method: Method) -> OutboundCall {
        OutboundCall::new(method, Url::parse("https://example.com/search").unwrap())
            .with_payload(Payload::form([("q", "rust"), ("page", "2")]))
    }

    #[test]
    fn first_attempt_always_verifies() {
        let dispatcher = dispatcher().with_ssl_verify(false);
        assert!(dispatcher.verify_tls(0, false));
        assert!(!dispatcher.verify_tls(1, false));
    }

    #[test]
    fn internal_and_forced_calls_skip_verification() {
        let dispatcher = dispatcher();
        assert!(!dispatcher.verify_tls(0, true));
        let forced = dispatcher.with_force_skip_ssl_verify(true);
        assert!(!forced.verify_tls(0, false));
        assert!(!forced.verify_tls(3, false));
    }

    #[test]
    fn get_payload_becomes_query_and_streams() {
        let request = dispatcher().build(&call(Method::GET), 0, None, false);
        assert_eq!(request.url.query(), Some("q=rust&page=2"));
        assert!(request.body.is_empty());
        assert!(request.stream);
    }

    #[test]
    fn post_payload_becomes_body() {
        let request = dispatcher().build(&call(Method::POST), 0, None, false);
        assert_eq!(request.url.query(), None);
        assert_eq!(
            request.body,
            RequestBody::Form(vec![
                ("q".into(), "rust".into()),
                ("page".into(), "2".into())
            ])
        );
        assert!(!request.stream);
    }

    #[test]
    fn delete_payload_is_dropped() {
        let request = dispatcher().build(&call(Method::DELETE), 0, None, false);
        assert_eq!(request.url.query(), None);
        assert!(request.body.is_empty());
    }

    #[test]
    fn proxy_attached_except_for_internal_calls() {
        let proxy = proxy();
        let external = dispatcher().build(&call(Method::GET), 0, Some(&proxy), false);
        assert_eq!(external.proxy.as_deref(), Some("http://10.1.1.1:3128"));

        let internal = dispatcher().build(&call(Method::GET), 0, Some(&proxy), true);
        assert_eq!(internal.proxy, None);
        assert!(!internal.verify_tls);
    }

    #[test]
    fn payload_size_counts_encoded_pairs() {
        assert_eq!(Payload::form([("a", "1"), ("bb", "22")]).size(), "a=1&bb=22".len());
        assert_eq!(Payload::None.size(), 0);
    }

    #[test]
    fn content_ceiling_skips_internal_calls() {
        let dispatcher = dispatcher().with_max_content_length(Some(1024));
        let external = dispatcher.build(&call(Method::GET), 0, None, false);
        assert_eq!(external.max_content_length, Some(1024));
        let internal = dispatcher.build(&call(Method::GET), 0, None, true);
        assert_eq!(internal.max_content_length, None);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let dispatcher = RequestDispatcher::new(Arc::new(BulkyTransport));
        let ok = dispatcher.send(&call(Method::GET), 0, None, false).await;
        assert_eq!(ok.unwrap().body.len(), 4096);

        let capped = dispatcher.with_max_content_length(Some(1024));
        let failure = capped
            .send(&call(Method::GET), 0, None, false)
            .await
            .unwrap_err();
        assert_eq!(failure.kind, crate::transport::FailureKind::TooLarge);
    }

    #[tokio::test]
    async fn send_performs_one_attempt() {
        let response = dispatcher()
            .send(&call(Method::GET), 0, None, false)
            .await
            .unwrap();
        assert_eq!(response.status, 204);
    }
}
