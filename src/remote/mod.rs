//! Clients for the remote proxy supply and telemetry services.
//!
//! Both services sit behind one API root. Proxy listings are fetched with a
//! Flask-Restless style `q` filter and returned under `objects`; usage
//! reports are posted as JSON. All traffic goes through the dispatcher as
//! internal calls: no proxy, no TLS verification.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use http::{HeaderMap, HeaderValue, Method, header};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use url::Url;

use crate::modules::dispatcher::{OutboundCall, Payload, RequestDispatcher};
use crate::modules::proxy::{ProxyQuery, ProxyRecord};
use crate::modules::usage::UsageReport;
use crate::transport::TransportResponse;

pub const DEFAULT_REMOTE_SERVICE_API: &str = "https://bas.bitgel.com/api";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteServiceError {
    #[error("cannot connect to remote services: {0}")]
    NoRemoteServicesConnection(String),
    #[error("invalid response from remote services: {0}")]
    InvalidResponse(String),
}

/// Source of public proxy candidates.
#[async_trait]
pub trait ProxySupply: Send + Sync {
    async fn fetch_proxies(&self, query: &ProxyQuery) -> Result<Vec<ProxyRecord>, RemoteServiceError>;
}

/// Receiver of proxy usage reports. Returns the HTTP status of the submit.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn submit(&self, report: &UsageReport) -> Result<u16, RemoteServiceError>;
}

/// reqwest backed client for the remote services.
#[derive(Clone)]
pub struct RemoteServices {
    api_base: Url,
    api_key: Option<String>,
    dispatcher: RequestDispatcher,
}

impl RemoteServices {
    pub fn new(api_base: Url, dispatcher: RequestDispatcher) -> Self {
        Self {
            api_base,
            api_key: None,
            dispatcher,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn api_base(&self) -> &Url {
        &self.api_base
    }

    /// `{api}/{segment}`, tolerating a trailing slash on the root.
    pub fn endpoint(&self, segment: &str) -> Result<Url, RemoteServiceError> {
        let base = self.api_base.as_str().trim_end_matches('/');
        Url::parse(&format!("{base}/{segment}"))
            .map_err(|err| RemoteServiceError::InvalidResponse(err.to_string()))
    }

    /// The IP echo endpoint lives beside the API root rather than under it.
    pub fn ip_endpoint(&self) -> Url {
        let mut url = self.api_base.clone();
        let trimmed = url.path().trim_end_matches('/').to_string();
        let path = match trimmed.rsplit_once('/') {
            Some((parent, "api")) => format!("{parent}/ip"),
            _ => format!("{trimmed}/ip"),
        };
        url.set_path(&path);
        url
    }

    /// Asks the remote service which IP it sees for direct traffic.
    pub async fn outbound_ip(&self) -> Result<String, RemoteServiceError> {
        let call = OutboundCall::new(Method::GET, self.ip_endpoint()).with_headers(self.headers());
        let response = self.send(&call).await?;
        if !is_accepted(response.status) {
            return Err(RemoteServiceError::InvalidResponse(format!(
                "ip lookup returned status {}",
                response.status
            )));
        }

        let ip = String::from_utf8_lossy(&response.body).trim().to_string();
        if ip.is_empty() {
            return Err(RemoteServiceError::InvalidResponse("empty ip response".into()));
        }
        Ok(ip)
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(agent) = HeaderValue::from_str(&crate::user_agents::default_user_agent()) {
            headers.insert(header::USER_AGENT, agent);
        }
        if let Some(key) = &self.api_key {
            match HeaderValue::from_str(key) {
                Ok(value) => {
                    headers.insert("Api-Key", value);
                }
                Err(_) => log::warn!("usage stats api key is not a valid header value, omitting"),
            }
        }
        headers
    }

    async fn send(&self, call: &OutboundCall) -> Result<TransportResponse, RemoteServiceError> {
        self.dispatcher
            .send(call, 0, None, true)
            .await
            .map_err(|failure| {
                log::error!("cannot connect to remote services at {}: {}", call.url, failure);
                RemoteServiceError::NoRemoteServicesConnection(failure.message)
            })
    }
}

fn is_accepted(status: u16) -> bool {
    status == 200 || status == 201
}

/// Builds the Flask-Restless `q` document for a proxy listing.
pub fn proxy_query_document(query: &ProxyQuery) -> Value {
    let mut filters = Vec::new();

    match query.continents.as_slice() {
        [] => {}
        [single] => filters.push(json!({"name": "continent", "op": "eq", "val": single.as_str()})),
        several => {
            let names: Vec<&str> = several.iter().map(|continent| continent.as_str()).collect();
            filters.push(json!({"name": "continent", "op": "in", "val": names}));
        }
    }

    filters.push(json!({
        "name": "last_tested",
        "op": ">",
        "val": query.last_tested_after.to_rfc3339_opts(SecondsFormat::Secs, true),
    }));
    filters.push(json!({"name": "quality", "op": ">", "val": query.quality_gt}));

    json!({
        "filters": filters,
        "order_by": [{"field": "quality", "direction": "desc"}],
    })
}

#[derive(Debug, Deserialize)]
struct ProxyListing {
    #[serde(default)]
    objects: Vec<WireProxy>,
}

#[derive(Debug, Deserialize)]
struct WireProxy {
    id: Option<i64>,
    #[serde(alias = "address", alias = "host")]
    ip: String,
    port: u16,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    quality: Option<i64>,
    #[serde(default)]
    last_tested: Option<String>,
    #[serde(default)]
    continent: Option<String>,
}

impl From<WireProxy> for ProxyRecord {
    fn from(wire: WireProxy) -> Self {
        ProxyRecord {
            id: wire.id,
            scheme: wire.protocol.unwrap_or_else(|| "http".to_string()),
            host: wire.ip,
            port: wire.port,
            quality: wire.quality.unwrap_or(0),
            last_tested: wire.last_tested.as_deref().and_then(parse_timestamp),
            continent: wire.continent,
        }
    }
}

/// Accepts RFC 3339 as well as the naive timestamps the service emits.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

/// Decodes a proxy listing body.
pub fn parse_proxy_listing(body: &[u8]) -> Result<Vec<ProxyRecord>, RemoteServiceError> {
    let listing: ProxyListing = serde_json::from_slice(body)
        .map_err(|err| RemoteServiceError::InvalidResponse(err.to_string()))?;
    Ok(listing.objects.into_iter().map(ProxyRecord::from).collect())
}

#[async_trait]
impl ProxySupply for RemoteServices {
    async fn fetch_proxies(&self, query: &ProxyQuery) -> Result<Vec<ProxyRecord>, RemoteServiceError> {
        let document = proxy_query_document(query);
        let call = OutboundCall::new(Method::GET, self.endpoint("proxies")?)
            .with_headers(self.headers())
            .with_payload(Payload::form([("q", document.to_string())]));

        let response = self.send(&call).await?;
        if !is_accepted(response.status) {
            return Err(RemoteServiceError::InvalidResponse(format!(
                "proxy listing returned status {}",
                response.status
            )));
        }
        parse_proxy_listing(&response.body)
    }
}

#[async_trait]
impl TelemetrySink for RemoteServices {
    async fn submit(&self, report: &UsageReport) -> Result<u16, RemoteServiceError> {
        let body = serde_json::to_value(report)
            .map_err(|err| RemoteServiceError::InvalidResponse(err.to_string()))?;
        let call = OutboundCall::new(Method::POST, self.endpoint("proxy_reports")?)
            .with_headers(self.headers())
            .with_payload(Payload::Json(body));

        let response = self.send(&call).await?;
        if !is_accepted(response.status) {
            log::debug!(
                "proxy report rejected: {}",
                String::from_utf8_lossy(&response.body)
            );
        }
        Ok(response.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::proxy::{Continent, ProxyFilter};
    use crate::transport::{Transport, TransportFailure, TransportRequest};
    use bytes::Bytes;
    use std::sync::{Arc, Mutex};

    struct Recorder {
        requests: Mutex<Vec<TransportRequest>>,
        status: u16,
        body: &'static str,
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn execute(
            &self,
            request: TransportRequest,
        ) -> Result<TransportResponse, TransportFailure> {
            let url = request.url.clone();
            self.requests.lock().unwrap().push(request);
            Ok(TransportResponse {
                status: self.status,
                headers: HeaderMap::new(),
                body: Bytes::from_static(self.body.as_bytes()),
                url,
            })
        }
    }

    fn services(status: u16, body: &'static str) -> (RemoteServices, Arc<Recorder>) {
        let recorder = Arc::new(Recorder {
            requests: Mutex::new(Vec::new()),
            status,
            body,
        });
        let dispatcher = RequestDispatcher::new(recorder.clone());
        let services = RemoteServices::new(
            Url::parse(DEFAULT_REMOTE_SERVICE_API).unwrap(),
            dispatcher,
        );
        (services, recorder)
    }

    #[test]
    fn ip_endpoint_replaces_api_segment() {
        let (services, _) = services(200, "");
        assert_eq!(
            services.ip_endpoint().as_str(),
            "https://bas.bitgel.com/ip"
        );
        assert_eq!(
            services.endpoint("proxies").unwrap().as_str(),
            "https://bas.bitgel.com/api/proxies"
        );
    }

    #[test]
    fn query_document_filters() {
        let query = ProxyFilter::default()
            .with_continents(vec![Continent::Europe])
            .query(Utc::now());
        let document = proxy_query_document(&query);
        let filters = document["filters"].as_array().unwrap();
        assert_eq!(filters.len(), 3);
        assert_eq!(filters[0]["op"], "eq");
        assert_eq!(filters[0]["val"], "Europe");
        assert_eq!(filters[1]["name"], "last_tested");
        assert_eq!(filters[2], json!({"name": "quality", "op": ">", "val": 0}));
        assert_eq!(document["order_by"][0]["direction"], "desc");
    }

    #[test]
    fn query_document_uses_in_for_several_continents() {
        let query = ProxyFilter::default()
            .with_continents(vec![Continent::Asia, Continent::Africa])
            .query(Utc::now());
        let document = proxy_query_document(&query);
        assert_eq!(document["filters"][0]["op"], "in");
        assert_eq!(document["filters"][0]["val"], json!(["Asia", "Africa"]));
    }

    #[test]
    fn parses_listing_leniently() {
        let records = parse_proxy_listing(
            br#"{"objects": [
                {"id": 4, "ip": "1.2.3.4", "port": 80, "quality": 3,
                 "last_tested": "2024-01-02T03:04:05.123456", "continent": "Asia"},
                {"id": 5, "address": "5.6.7.8", "port": 3128, "protocol": "https"}
            ]}"#,
        )
        .unwrap();

        assert_eq!(records[0].endpoint(), "http://1.2.3.4:80");
        assert!(records[0].last_tested.is_some());
        assert_eq!(records[1].endpoint(), "https://5.6.7.8:3128");
        assert_eq!(records[1].quality, 0);
        assert!(parse_proxy_listing(b"<html>").is_err());
    }

    #[tokio::test]
    async fn fetch_proxies_is_internal_get() {
        let (services, recorder) = services(200, r#"{"objects": []}"#);
        let query = ProxyFilter::default().query(Utc::now());
        let records = services.fetch_proxies(&query).await.unwrap();
        assert!(records.is_empty());

        let requests = recorder.requests.lock().unwrap();
        let request = &requests[0];
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.url.path(), "/api/proxies");
        assert!(request.url.query_pairs().any(|(key, _)| key == "q"));
        assert!(request.proxy.is_none());
        assert!(!request.verify_tls);
    }

    #[tokio::test]
    async fn outbound_ip_trims_body() {
        let (services, _) = services(200, "203.0.113.9\n");
        assert_eq!(services.outbound_ip().await.unwrap(), "203.0.113.9");
    }

    #[tokio::test]
    async fn api_key_header_is_sent() {
        let (services, recorder) = services(201, "{}");
        let services = services.with_api_key(Some("secret".into()));
        let report = UsageReport {
            proxy_id: Some(1),
            request_url: "https://example.com/".into(),
            request_method: "GET".into(),
            response_time_seconds: Some(0.5),
            response_success: true,
            user_ip: None,
            score: 4,
        };
        assert_eq!(services.submit(&report).await.unwrap(), 201);

        let requests = recorder.requests.lock().unwrap();
        assert_eq!(requests[0].method, Method::POST);
        assert_eq!(requests[0].headers["Api-Key"], "secret");
    }
}
