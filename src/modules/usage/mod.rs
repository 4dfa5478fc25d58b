//! Fire-and-forget proxy performance reports.

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::modules::manifest::ManifestEntry;
use crate::modules::proxy::ProxyRecord;
use crate::remote::TelemetrySink;

/// One report about how a public proxy handled a dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageReport {
    pub proxy_id: Option<i64>,
    pub request_url: String,
    pub request_method: String,
    #[serde(rename = "response_time")]
    pub response_time_seconds: Option<f64>,
    pub response_success: bool,
    pub user_ip: Option<String>,
    pub score: i64,
}

impl UsageReport {
    /// Builds a report from a closed manifest entry. Open entries yield
    /// nothing.
    pub fn from_dispatch(
        proxy: &ProxyRecord,
        entry: &ManifestEntry,
        user_ip: Option<&str>,
    ) -> Option<Self> {
        let success = entry.success?;
        let (score, response_time_seconds) = if success {
            (
                proxy.quality + 1,
                entry.roundtrip.map(|roundtrip| roundtrip.as_secs_f64()),
            )
        } else {
            (proxy.quality, None)
        };

        Some(Self {
            proxy_id: proxy.id,
            request_url: entry.url.to_string(),
            request_method: entry.method.to_string(),
            response_time_seconds,
            response_success: success,
            user_ip: user_ip.map(str::to_string),
            score,
        })
    }
}

/// Submits reports in the background. Failures are logged, never returned.
#[derive(Clone)]
pub struct UsageReporter {
    sink: Arc<dyn TelemetrySink>,
}

impl UsageReporter {
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        Self { sink }
    }

    pub fn report(&self, report: UsageReport) -> JoinHandle<()> {
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            match sink.submit(&report).await {
                Ok(200 | 201) => log::debug!("saved proxy report for {}", report.request_url),
                Ok(status) => log::error!("had an issue saving proxy report: status {status}"),
                Err(err) => log::error!("could not send proxy report: {err}"),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::manifest::ManifestRecorder;
    use crate::remote::RemoteServiceError;
    use async_trait::async_trait;
    use http::Method;
    use std::sync::Mutex;
    use std::time::Duration;
    use url::Url;

    fn proxy() -> ProxyRecord {
        ProxyRecord {
            id: Some(12),
            scheme: "http".into(),
            host: "10.0.0.12".into(),
            port: 8080,
            quality: 4,
            last_tested: None,
            continent: None,
        }
    }

    fn closed_entry(success: bool) -> ManifestEntry {
        let mut manifest = ManifestRecorder::default();
        let handle = manifest.open(Method::GET, Url::parse("https://example.com/a").unwrap(), 0);
        manifest.close(handle, None, Duration::from_millis(1500), success);
        manifest.get(handle).unwrap().clone()
    }

    #[test]
    fn success_bumps_score_and_reports_time() {
        let report = UsageReport::from_dispatch(&proxy(), &closed_entry(true), Some("1.1.1.1")).unwrap();
        assert_eq!(report.score, 5);
        assert_eq!(report.response_time_seconds, Some(1.5));
        assert_eq!(report.proxy_id, Some(12));
        assert_eq!(report.user_ip.as_deref(), Some("1.1.1.1"));
    }

    #[test]
    fn failure_keeps_score_without_time() {
        let report = UsageReport::from_dispatch(&proxy(), &closed_entry(false), None).unwrap();
        assert_eq!(report.score, 4);
        assert_eq!(report.response_time_seconds, None);
        assert!(!report.response_success);
    }

    #[test]
    fn open_entry_yields_no_report() {
        let mut manifest = ManifestRecorder::default();
        let handle = manifest.open(Method::GET, Url::parse("https://example.com").unwrap(), 0);
        assert!(UsageReport::from_dispatch(&proxy(), manifest.get(handle).unwrap(), None).is_none());
    }

    #[test]
    fn serializes_wire_field_names() {
        let report = UsageReport::from_dispatch(&proxy(), &closed_entry(true), None).unwrap();
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["response_time"], 1.5);
        assert_eq!(value["request_method"], "GET");
    }

    struct FailingSink(Mutex<u32>);

    #[async_trait]
    impl TelemetrySink for FailingSink {
        async fn submit(&self, _report: &UsageReport) -> Result<u16, RemoteServiceError> {
            *self.0.lock().unwrap() += 1;
            Err(RemoteServiceError::NoRemoteServicesConnection("down".into()))
        }
    }

    #[tokio::test]
    async fn sink_errors_are_swallowed() {
        let sink = Arc::new(FailingSink(Mutex::new(0)));
        let reporter = UsageReporter::new(sink.clone());
        let report = UsageReport::from_dispatch(&proxy(), &closed_entry(true), None).unwrap();
        reporter.report(report).await.unwrap();
        assert_eq!(*sink.0.lock().unwrap(), 1);
    }
}
