//! High level request orchestration.
//!
//! Wires the rate limiter, manifest, proxy rotation, retry engine and usage
//! reporting together behind a small async client. Callers see a plain
//! response or a classified error; retries, proxy swaps and TLS downgrades
//! happen underneath.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use http::{HeaderMap, HeaderName, HeaderValue, Method, header};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{CarpetBagConfig, ConfigError};
use crate::modules::dispatcher::{OutboundCall, Payload, RequestDispatcher};
use crate::modules::events::{
	DispatchEvent, EventDispatcher, EventHandler, FailureEvent, LoggingHandler, PostResponseEvent,
};
use crate::modules::manifest::{EntryHandle, ManifestRecorder, ManifestResponse};
use crate::modules::proxy::{
	LoadBagError, ProxyBag, ProxyBagError, ProxyFilter, ProxyRecord, ProxyRotationManager,
	validate_continents,
};
use crate::modules::rate_limit::RateLimiter;
use crate::modules::retry::{Abandoned, AbortSignal, Attempted, RetryEngine};
use crate::modules::usage::{UsageReport, UsageReporter};
use crate::remote::{ProxySupply, RemoteServiceError, RemoteServices, TelemetrySink};
use crate::transport::{FailureKind, ReqwestTransport, Transport, TransportFailure};
use crate::urls::{parse_url, registered_domain};
use crate::user_agents::UserAgentRotator;

/// Result alias used across the orchestration layer.
pub type CarpetBagResult<T> = Result<T, CarpetBagError>;

/// Errors surfaced to callers.
#[derive(Debug, Error)]
pub enum CarpetBagError {
	#[error("unknown continent: {0}")]
	InvalidContinent(String),
	#[error("random proxy bag enabled but the proxy bag is empty")]
	EmptyProxyBag,
	#[error("cannot connect to remote services: {0}")]
	NoRemoteServicesConnection(String),
	#[error("proxy error requesting {url}: {message}")]
	Proxy { url: Url, message: String },
	#[error("ssl error requesting {url}: {message}")]
	Ssl { url: Url, message: String },
	#[error("connection error requesting {url} after {attempts} attempt(s): {message}")]
	Connection {
		url: Url,
		attempts: u32,
		message: String,
	},
	#[error("truncated response from {url}: {message}")]
	ChunkedEncoding { url: Url, message: String },
	#[error("response from {url} too large: {message}")]
	ContentTooLarge { url: Url, message: String },
	#[error("transport error requesting {url}: {message}")]
	Transport { url: Url, message: String },
	#[error("request cancelled")]
	Cancelled,
	#[error("request deadline exceeded")]
	DeadlineExceeded,
	#[error("url parse error: {0}")]
	Url(#[from] url::ParseError),
	#[error("invalid proxy: {0}")]
	InvalidProxy(String),
	#[error("header conversion failed: {0}")]
	InvalidHeader(String),
	#[error("invalid response from remote services: {0}")]
	InvalidRemoteResponse(String),
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),
}

impl CarpetBagError {
	/// Maps a failure the retry engine gave up on.
	pub fn exhausted(failure: TransportFailure, url: &Url, attempts: u32) -> Self {
		let url = url.clone();
		let message = failure.message;
		match failure.kind {
			FailureKind::Proxy => CarpetBagError::Proxy { url, message },
			FailureKind::Ssl => CarpetBagError::Ssl { url, message },
			FailureKind::Connection => CarpetBagError::Connection {
				url,
				attempts,
				message,
			},
			FailureKind::ChunkedEncoding => CarpetBagError::ChunkedEncoding { url, message },
			FailureKind::TooLarge => CarpetBagError::ContentTooLarge { url, message },
			FailureKind::Other => CarpetBagError::Transport { url, message },
		}
	}
}

impl From<ProxyBagError> for CarpetBagError {
	fn from(err: ProxyBagError) -> Self {
		match err {
			ProxyBagError::InvalidContinent(name) => CarpetBagError::InvalidContinent(name),
			ProxyBagError::EmptyProxyBag => CarpetBagError::EmptyProxyBag,
			ProxyBagError::InvalidEndpoint(endpoint) => CarpetBagError::InvalidProxy(endpoint),
		}
	}
}

impl From<RemoteServiceError> for CarpetBagError {
	fn from(err: RemoteServiceError) -> Self {
		match err {
			RemoteServiceError::NoRemoteServicesConnection(message) => {
				CarpetBagError::NoRemoteServicesConnection(message)
			}
			RemoteServiceError::InvalidResponse(message) => {
				CarpetBagError::InvalidRemoteResponse(message)
			}
		}
	}
}

impl From<LoadBagError> for CarpetBagError {
	fn from(err: LoadBagError) -> Self {
		match err {
			LoadBagError::Bag(err) => err.into(),
			LoadBagError::Remote(err) => err.into(),
		}
	}
}

/// Response returned to callers. 5xx statuses are returned here too.
#[derive(Debug, Clone)]
pub struct Response {
	status: u16,
	headers: HeaderMap,
	body: Bytes,
	url: Url,
	roundtrip: Duration,
	domain: Option<String>,
}

impl Response {
	pub fn status(&self) -> u16 {
		self.status
	}

	/// Final URL after redirects.
	pub fn url(&self) -> &Url {
		&self.url
	}

	pub fn headers(&self) -> &HeaderMap {
		&self.headers
	}

	/// Wall time of the whole dispatch, retries and waits included.
	pub fn roundtrip(&self) -> Duration {
		self.roundtrip
	}

	/// Registered domain of the final URL.
	pub fn domain(&self) -> Option<&str> {
		self.domain.as_deref()
	}

	pub fn bytes(&self) -> Bytes {
		self.body.clone()
	}

	/// Body as text, replacing invalid UTF-8.
	pub fn text(&self) -> String {
		String::from_utf8_lossy(&self.body).into_owned()
	}

	pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
		serde_json::from_slice(&self.body)
	}

	pub fn is_server_error(&self) -> bool {
		self.status >= 500
	}
}

/// Builder for [`CarpetBag`].
pub struct CarpetBagBuilder {
	config: CarpetBagConfig,
	transport: Option<Arc<dyn Transport>>,
	proxy_supply: Option<Arc<dyn ProxySupply>>,
	telemetry_sink: Option<Arc<dyn TelemetrySink>>,
	handlers: Vec<Arc<dyn EventHandler>>,
	cancellation: Option<CancellationToken>,
}

impl CarpetBagBuilder {
	pub fn new() -> Self {
		Self {
			config: CarpetBagConfig::default(),
			transport: None,
			proxy_supply: None,
			telemetry_sink: None,
			handlers: Vec::new(),
			cancellation: None,
		}
	}

	pub fn with_config(mut self, config: CarpetBagConfig) -> Self {
		self.config = config;
		self
	}

	/// Replaces the reqwest transport, mostly for tests.
	pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
		self.transport = Some(transport);
		self
	}

	pub fn with_proxy_supply(mut self, supply: Arc<dyn ProxySupply>) -> Self {
		self.proxy_supply = Some(supply);
		self
	}

	pub fn with_telemetry_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
		self.telemetry_sink = Some(sink);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	/// Token that aborts every in-flight and future request when cancelled.
	pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
		self.cancellation = Some(token);
		self
	}

	pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.config.headers.insert(name.into(), value.into());
		self
	}

	pub fn with_user_agent(mut self, agent: Option<String>) -> Self {
		self.config.user_agent = agent;
		self
	}

	pub fn with_random_user_agent(mut self, enabled: bool) -> Self {
		self.config.random_user_agent = enabled;
		self
	}

	pub fn with_minimum_wait(mut self, wait: Duration) -> Self {
		self.config.minimum_wait_time = wait;
		self
	}

	pub fn with_retries_on_connection_failure(mut self, retries: u32) -> Self {
		self.config.retries_on_connection_failure = retries;
		self
	}

	pub fn with_wait_on_connection_error(mut self, wait: Duration) -> Self {
		self.config.wait_and_retry_on_connection_error = wait;
		self
	}

	pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
		self.config.proxy = Some(proxy.into());
		self
	}

	pub fn with_ssl_verify(mut self, verify: bool) -> Self {
		self.config.ssl_verify = verify;
		self
	}

	pub fn with_retry_on_proxy_failure(mut self, retry: bool) -> Self {
		self.config.retry_on_proxy_failure = retry;
		self
	}

	pub fn with_max_rotation_attempts(mut self, max: Option<u32>) -> Self {
		self.config.max_rotation_attempts = max;
		self
	}

	pub fn with_manifest_capacity(mut self, capacity: usize) -> Self {
		self.config.manifest_capacity = capacity;
		self
	}

	pub fn with_remote_service_api(mut self, api: impl Into<String>) -> Self {
		self.config.remote_service_api = api.into();
		self
	}

	pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
		self.config.request_timeout = Some(timeout);
		self
	}

	pub fn build(self) -> CarpetBagResult<CarpetBag> {
		CarpetBag::from_parts(self)
	}
}

impl Default for CarpetBagBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Stateful request client. Not shared: use one per task.
pub struct CarpetBag {
	config: CarpetBagConfig,
	headers: HeaderMap,
	one_time_headers: Vec<HeaderName>,
	user_agents: UserAgentRotator,
	dispatcher: RequestDispatcher,
	rate_limiter: RateLimiter,
	proxies: ProxyRotationManager,
	manifest: ManifestRecorder,
	events: EventDispatcher,
	remote: RemoteServices,
	proxy_supply: Arc<dyn ProxySupply>,
	telemetry_sink: Option<Arc<dyn TelemetrySink>>,
	reporter: Option<UsageReporter>,
	cancellation: CancellationToken,
	request_count: u64,
	request_total: u64,
	outbound_ip: Option<String>,
	last_status: Option<u16>,
	last_response_domain: Option<String>,
}

impl CarpetBag {
	/// Client with default configuration.
	pub fn new() -> CarpetBagResult<Self> {
		CarpetBagBuilder::new().build()
	}

	pub fn builder() -> CarpetBagBuilder {
		CarpetBagBuilder::new()
	}

	pub fn with_config(config: CarpetBagConfig) -> CarpetBagResult<Self> {
		CarpetBagBuilder::new().with_config(config).build()
	}

	fn from_parts(builder: CarpetBagBuilder) -> CarpetBagResult<Self> {
		let CarpetBagBuilder {
			config,
			transport,
			proxy_supply,
			telemetry_sink,
			handlers,
			cancellation,
		} = builder;
		config.validate()?;

		let transport: Arc<dyn Transport> = match transport {
			Some(transport) => transport,
			None => Arc::new(ReqwestTransport::new().with_timeout(config.request_timeout)),
		};

		let dispatcher = RequestDispatcher::new(transport)
			.with_ssl_verify(config.ssl_verify)
			.with_force_skip_ssl_verify(config.force_skip_ssl_verify)
			.with_max_content_length(Some(config.max_content_length));

		let api_base = Url::parse(&config.remote_service_api)?;
		let remote = RemoteServices::new(api_base, dispatcher.clone())
			.with_api_key(config.usage_stats_api_key.clone());
		let proxy_supply =
			proxy_supply.unwrap_or_else(|| Arc::new(remote.clone()) as Arc<dyn ProxySupply>);

		let mut proxies = ProxyRotationManager::new(config.rotation_strategy);
		if let Some(endpoint) = &config.proxy {
			proxies.set_current(Some(ProxyRecord::from_endpoint(endpoint)?));
		}

		let mut headers = HeaderMap::new();
		for (name, value) in &config.headers {
			let (name, value) = header_pair(name, value)?;
			headers.insert(name, value);
		}

		let user_agents = if config.random_user_agent {
			UserAgentRotator::random(config.user_agent_rotation_interval)
		} else {
			let mut rotator = UserAgentRotator::default();
			rotator.set_fixed(config.user_agent.clone());
			rotator
		};

		let mut events = EventDispatcher::new();
		events.register_handler(Arc::new(LoggingHandler));
		for handler in handlers {
			events.register_handler(handler);
		}

		let mut bag = Self {
			rate_limiter: RateLimiter::new(config.minimum_wait_time),
			manifest: ManifestRecorder::new(config.manifest_capacity),
			headers,
			one_time_headers: Vec::new(),
			user_agents,
			dispatcher,
			proxies,
			events,
			remote,
			proxy_supply,
			telemetry_sink,
			reporter: None,
			cancellation: cancellation.unwrap_or_default(),
			request_count: 0,
			request_total: 0,
			outbound_ip: None,
			last_status: None,
			last_response_domain: None,
			config,
		};
		bag.refresh_reporter();
		Ok(bag)
	}

	pub async fn get(&mut self, url: &str) -> CarpetBagResult<Response> {
		self.request(Method::GET, url, Payload::None).await
	}

	/// GET with headers for this call only.
	pub async fn get_with_headers(&mut self, url: &str, headers: HeaderMap) -> CarpetBagResult<Response> {
		self.request_with_headers(Method::GET, url, Payload::None, headers)
			.await
	}

	pub async fn post(&mut self, url: &str, payload: Payload) -> CarpetBagResult<Response> {
		self.request(Method::POST, url, payload).await
	}

	pub async fn put(&mut self, url: &str, payload: Payload) -> CarpetBagResult<Response> {
		self.request(Method::PUT, url, payload).await
	}

	pub async fn delete(&mut self, url: &str) -> CarpetBagResult<Response> {
		self.request(Method::DELETE, url, Payload::None).await
	}

	/// Performs a request, retrying and rotating proxies as configured.
	pub async fn request(
		&mut self,
		method: Method,
		url: &str,
		payload: Payload,
	) -> CarpetBagResult<Response> {
		let abort = AbortSignal::new(self.cancellation.clone());
		self.dispatch(method, url, payload, HeaderMap::new(), abort)
			.await
	}

	/// Like [`CarpetBag::request`], with extra headers for this call. They
	/// override client headers of the same name and are not kept afterwards.
	pub async fn request_with_headers(
		&mut self,
		method: Method,
		url: &str,
		payload: Payload,
		headers: HeaderMap,
	) -> CarpetBagResult<Response> {
		let abort = AbortSignal::new(self.cancellation.clone());
		self.dispatch(method, url, payload, headers, abort).await
	}

	/// Like [`CarpetBag::request`], giving up once `budget` has elapsed.
	pub async fn request_with_deadline(
		&mut self,
		method: Method,
		url: &str,
		payload: Payload,
		budget: Duration,
	) -> CarpetBagResult<Response> {
		let abort = AbortSignal::new(self.cancellation.clone()).with_deadline(Instant::now() + budget);
		self.dispatch(method, url, payload, HeaderMap::new(), abort)
			.await
	}

	async fn dispatch(
		&mut self,
		method: Method,
		url: &str,
		payload: Payload,
		extra_headers: HeaderMap,
		abort: AbortSignal,
	) -> CarpetBagResult<Response> {
		let result = match parse_url(url) {
			Ok(url) => {
				self.dispatch_url(method, url, payload, extra_headers, &abort)
					.await
			}
			Err(err) => Err(err.into()),
		};
		self.clear_one_time_headers();
		result
	}

	async fn dispatch_url(
		&mut self,
		method: Method,
		url: Url,
		payload: Payload,
		extra_headers: HeaderMap,
		abort: &AbortSignal,
	) -> CarpetBagResult<Response> {
		let domain = registered_domain(&url);
		self.rate_limiter.wait(domain.as_deref(), abort).await?;

		let mut headers = self.outgoing_headers();
		let mut last_name = None;
		for (name, value) in extra_headers {
			// Repeated values of one header arrive with no name after the first.
			if let Some(name) = name {
				headers.insert(name.clone(), value);
				last_name = Some(name);
			} else if let Some(name) = &last_name {
				headers.append(name.clone(), value);
			}
		}
		let call = OutboundCall::new(method.clone(), url.clone())
			.with_headers(headers)
			.with_payload(payload);

		let handle = self.manifest.open(method.clone(), url.clone(), call.payload.size());
		self.request_count += 1;
		self.request_total += 1;

		let policy = self.config.retry_policy();
		let started = Instant::now();
		let outcome = RetryEngine {
			dispatcher: &self.dispatcher,
			proxies: &mut self.proxies,
			manifest: &mut self.manifest,
			events: &self.events,
			policy: &policy,
			abort,
		}
		.run(&call, handle)
		.await;
		let roundtrip = started.elapsed();

		match outcome {
			Ok(Attempted { response, context }) => {
				let final_domain = registered_domain(&response.url);
				if response.status >= 500 {
					log::warn!(
						"URL {} received a server error response <{}>",
						url,
						response.status
					);
				}

				self.manifest.close(
					handle,
					Some(ManifestResponse {
						status: response.status,
						url: response.url.clone(),
						domain: final_domain.clone(),
						content_length: response.body.len(),
					}),
					roundtrip,
					true,
				);
				self.rate_limiter.record(final_domain.as_deref());
				self.last_status = Some(response.status);
				self.last_response_domain = final_domain.clone();

				self.events.dispatch(DispatchEvent::PostResponse(PostResponseEvent {
					url: response.url.clone(),
					method,
					status: response.status,
					attempts: context.sends(),
					latency: roundtrip,
					timestamp: Utc::now(),
				}));
				self.send_usage_stats(handle, context.proxy.as_ref());

				Ok(Response {
					status: response.status,
					headers: response.headers,
					body: response.body,
					url: response.url,
					roundtrip,
					domain: final_domain,
				})
			}
			Err(Abandoned { error: err, context }) => {
				let attempts = context.sends();
				self.manifest.close(handle, None, roundtrip, false);
				self.rate_limiter.record(domain.as_deref());

				self.events.dispatch(DispatchEvent::Failure(FailureEvent {
					url,
					error: err.to_string(),
					attempts,
					timestamp: Utc::now(),
				}));
				self.send_usage_stats(handle, context.proxy.as_ref());

				Err(err)
			}
		}
	}

	fn outgoing_headers(&mut self) -> HeaderMap {
		let mut headers = HeaderMap::new();
		if let Some(agent) = self.user_agents.next_agent() {
			match HeaderValue::from_str(&agent) {
				Ok(value) => {
					headers.insert(header::USER_AGENT, value);
				}
				Err(_) => log::warn!("user agent {agent:?} is not a valid header value"),
			}
		}
		for (name, value) in &self.headers {
			headers.insert(name.clone(), value.clone());
		}
		headers
	}

	fn clear_one_time_headers(&mut self) {
		for name in self.one_time_headers.drain(..) {
			self.headers.remove(&name);
		}
	}

	fn send_usage_stats(&self, handle: EntryHandle, proxy: Option<&ProxyRecord>) {
		let Some(reporter) = &self.reporter else {
			return;
		};
		if !self.config.random_proxy_bag {
			log::debug!("not using a random public proxy, skipping usage stats");
			return;
		}
		let (Some(proxy), Some(entry)) = (proxy, self.manifest.get(handle)) else {
			return;
		};
		if proxy.id.is_none() {
			return;
		}
		if let Some(report) = UsageReport::from_dispatch(proxy, entry, self.outbound_ip.as_deref()) {
			reporter.report(report);
		}
	}

	fn refresh_reporter(&mut self) {
		self.reporter = if self.config.send_usage_stats {
			let sink = match &self.telemetry_sink {
				Some(sink) => Arc::clone(sink),
				None => Arc::new(self.remote.clone()) as Arc<dyn TelemetrySink>,
			};
			Some(UsageReporter::new(sink))
		} else {
			None
		};
	}

	/// Adds or replaces a header sent on every request.
	pub fn set_header(&mut self, name: &str, value: &str) -> CarpetBagResult<()> {
		let (name, value) = header_pair(name, value)?;
		self.headers.insert(name, value);
		Ok(())
	}

	/// Adds a header that is sent on the next request only.
	pub fn set_one_time_header(&mut self, name: &str, value: &str) -> CarpetBagResult<()> {
		let (name, value) = header_pair(name, value)?;
		self.headers.insert(name.clone(), value);
		if !self.one_time_headers.contains(&name) {
			self.one_time_headers.push(name);
		}
		Ok(())
	}

	pub fn remove_header(&mut self, name: &str) -> bool {
		self.headers.remove(name).is_some()
	}

	pub fn headers(&self) -> &HeaderMap {
		&self.headers
	}

	/// Loads a bag of public proxies and switches to random-bag mode.
	///
	/// Returns the number of proxies in the bag.
	pub async fn use_random_public_proxy<S: AsRef<str>>(
		&mut self,
		continents: &[S],
	) -> CarpetBagResult<usize> {
		let continents = validate_continents(continents)?;
		let filter = ProxyFilter {
			continents,
			max_last_tested_weeks: self.config.public_proxies_max_last_test_weeks,
		};

		let best = self
			.proxies
			.load_bag(self.proxy_supply.as_ref(), &filter)
			.await?
			.endpoint();
		self.config.random_proxy_bag = true;

		let size = self.proxies.bag().map(ProxyBag::len).unwrap_or(0);
		log::info!("loaded {size} public proxies, starting with {best}");
		Ok(size)
	}

	/// Swaps the active proxy for another one from the bag.
	pub fn reset_proxy_from_bag(&mut self) -> CarpetBagResult<ProxyRecord> {
		Ok(self.proxies.rotate()?.clone())
	}

	/// Pins a fixed proxy, or goes direct with `None`.
	pub fn set_proxy(&mut self, endpoint: Option<&str>) -> CarpetBagResult<()> {
		let record = endpoint.map(ProxyRecord::from_endpoint).transpose()?;
		self.config.proxy = endpoint.map(str::to_string);
		self.proxies.set_current(record);
		Ok(())
	}

	pub fn current_proxy(&self) -> Option<&ProxyRecord> {
		self.proxies.current()
	}

	pub fn proxy_bag(&self) -> Option<&ProxyBag> {
		self.proxies.bag()
	}

	/// Lets retries after an SSL failure go out unverified. With `force`
	/// nothing is ever verified.
	pub fn use_skip_ssl_verify(&mut self, force: bool) {
		self.config.ssl_verify = false;
		self.dispatcher.set_ssl_verify(false);
		if force {
			self.config.force_skip_ssl_verify = true;
			self.dispatcher.set_force_skip_ssl_verify(true);
		}
	}

	/// Turns on proxy usage reports.
	pub fn enable_usage_stats(&mut self, api_key: Option<String>) {
		self.config.send_usage_stats = true;
		self.config.usage_stats_api_key = api_key.clone();
		self.remote = self.remote.clone().with_api_key(api_key);
		self.refresh_reporter();
	}

	/// Looks up the outbound IP of direct traffic; sent along with usage
	/// reports.
	pub async fn fetch_outbound_ip(&mut self) -> CarpetBagResult<String> {
		let ip = self.remote.outbound_ip().await?;
		self.outbound_ip = Some(ip.clone());
		Ok(ip)
	}

	pub fn outbound_ip(&self) -> Option<&str> {
		self.outbound_ip.as_deref()
	}

	pub fn set_minimum_wait(&mut self, wait: Duration) {
		self.config.minimum_wait_time = wait;
		self.rate_limiter.set_minimum_wait(wait);
	}

	pub fn set_retries_on_connection_failure(&mut self, retries: u32) {
		self.config.retries_on_connection_failure = retries;
	}

	pub fn set_wait_on_connection_error(&mut self, wait: Duration) {
		self.config.wait_and_retry_on_connection_error = wait;
	}

	pub fn set_retry_on_proxy_failure(&mut self, retry: bool) {
		self.config.retry_on_proxy_failure = retry;
	}

	pub fn manifest(&self) -> &ManifestRecorder {
		&self.manifest
	}

	pub fn config(&self) -> &CarpetBagConfig {
		&self.config
	}

	pub fn request_count(&self) -> u64 {
		self.request_count
	}

	pub fn request_total(&self) -> u64 {
		self.request_total
	}

	/// Zeroes the per-session counter; the lifetime total keeps counting.
	pub fn reset_request_count(&mut self) {
		self.request_count = 0;
	}

	pub fn last_status(&self) -> Option<u16> {
		self.last_status
	}

	pub fn last_response_domain(&self) -> Option<&str> {
		self.last_response_domain.as_deref()
	}

	pub fn cancellation_token(&self) -> &CancellationToken {
		&self.cancellation
	}
}

impl fmt::Display for CarpetBag {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.proxies.current() {
			Some(proxy) => write!(f, "<CarpetBag Proxy:{}>", proxy.endpoint()),
			None => f.write_str("<CarpetBag>"),
		}
	}
}

fn header_pair(name: &str, value: &str) -> CarpetBagResult<(HeaderName, HeaderValue)> {
	let header_name = HeaderName::from_bytes(name.as_bytes())
		.map_err(|err| CarpetBagError::InvalidHeader(format!("{name}: {err}")))?;
	let header_value = HeaderValue::from_str(value)
		.map_err(|err| CarpetBagError::InvalidHeader(format!("{name}: {err}")))?;
	Ok((header_name, header_value))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn display_shows_active_proxy() {
		let mut bag = CarpetBag::new().unwrap();
		assert_eq!(bag.to_string(), "<CarpetBag>");
		bag.set_proxy(Some("http://66.98.56.237:8080")).unwrap();
		assert_eq!(bag.to_string(), "<CarpetBag Proxy:http://66.98.56.237:8080>");
	}

	#[test]
	fn invalid_header_is_rejected() {
		let mut bag = CarpetBag::new().unwrap();
		assert!(matches!(
			bag.set_header("bad header", "x"),
			Err(CarpetBagError::InvalidHeader(_))
		));
	}

	#[test]
	fn skip_ssl_verify_updates_flags() {
		let mut bag = CarpetBag::new().unwrap();
		bag.use_skip_ssl_verify(false);
		assert!(!bag.config().ssl_verify);
		assert!(!bag.config().force_skip_ssl_verify);
		bag.use_skip_ssl_verify(true);
		assert!(bag.config().force_skip_ssl_verify);
	}

	#[test]
	fn exhausted_failures_map_to_errors() {
		let url = Url::parse("https://example.com").unwrap();
		let err = CarpetBagError::exhausted(
			TransportFailure::new(FailureKind::Connection, "refused"),
			&url,
			3,
		);
		assert!(matches!(err, CarpetBagError::Connection { attempts: 3, .. }));

		let err = CarpetBagError::exhausted(TransportFailure::new(FailureKind::Other, "boom"), &url, 1);
		assert!(matches!(err, CarpetBagError::Transport { .. }));
	}

	#[test]
	fn bad_proxy_endpoint_fails_build() {
		let result = CarpetBag::builder().with_proxy("nonsense").build();
		assert!(matches!(result, Err(CarpetBagError::InvalidProxy(_))));
	}
}
