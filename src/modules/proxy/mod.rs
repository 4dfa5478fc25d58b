//! Proxy selection and rotation.
//!
//! Holds the active proxy and, in public-proxy mode, a bag of candidates
//! fetched from the proxy supply service ordered by quality. Rotation swaps
//! the active record for another candidate without touching the bag.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::remote::{ProxySupply, RemoteServiceError};

pub const DEFAULT_MAX_LAST_TESTED_WEEKS: u32 = 5;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProxyBagError {
    #[error("unknown continent: {0}")]
    InvalidContinent(String),
    #[error("proxy bag is empty")]
    EmptyProxyBag,
    #[error("invalid proxy endpoint: {0}")]
    InvalidEndpoint(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Continent {
    #[serde(rename = "North America")]
    NorthAmerica,
    #[serde(rename = "South America")]
    SouthAmerica,
    Asia,
    Europe,
    Africa,
    Australia,
    Antarctica,
}

impl Continent {
    pub const ALL: [Continent; 7] = [
        Continent::NorthAmerica,
        Continent::SouthAmerica,
        Continent::Asia,
        Continent::Europe,
        Continent::Africa,
        Continent::Australia,
        Continent::Antarctica,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Continent::NorthAmerica => "North America",
            Continent::SouthAmerica => "South America",
            Continent::Asia => "Asia",
            Continent::Europe => "Europe",
            Continent::Africa => "Africa",
            Continent::Australia => "Australia",
            Continent::Antarctica => "Antarctica",
        }
    }
}

impl fmt::Display for Continent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Continent {
    type Err = ProxyBagError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Continent::ALL
            .iter()
            .copied()
            .find(|continent| continent.as_str() == value)
            .ok_or_else(|| ProxyBagError::InvalidContinent(value.to_string()))
    }
}

/// Validates user supplied continent names before anything goes on the wire.
pub fn validate_continents<S: AsRef<str>>(requested: &[S]) -> Result<Vec<Continent>, ProxyBagError> {
    requested
        .iter()
        .map(|name| {
            name.as_ref().parse::<Continent>().inspect_err(|_| {
                log::error!("unknown continent: {}", name.as_ref());
            })
        })
        .collect()
}

/// A single proxy candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyRecord {
    /// Identifier assigned by the proxy supply service, absent for
    /// user-configured proxies.
    pub id: Option<i64>,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub quality: i64,
    pub last_tested: Option<DateTime<Utc>>,
    pub continent: Option<String>,
}

impl ProxyRecord {
    /// Builds a record for a user-configured proxy such as
    /// `http://10.0.0.1:3128`.
    pub fn from_endpoint(endpoint: &str) -> Result<Self, ProxyBagError> {
        let url = Url::parse(endpoint)
            .map_err(|_| ProxyBagError::InvalidEndpoint(endpoint.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| ProxyBagError::InvalidEndpoint(endpoint.to_string()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ProxyBagError::InvalidEndpoint(endpoint.to_string()))?;

        Ok(Self {
            id: None,
            scheme: url.scheme().to_string(),
            host: host.to_string(),
            port,
            quality: 0,
            last_tested: None,
            continent: None,
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Quality-ordered set of proxy candidates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProxyBag {
    records: Vec<ProxyRecord>,
}

impl ProxyBag {
    pub fn new(mut records: Vec<ProxyRecord>) -> Self {
        records.sort_by(|a, b| b.quality.cmp(&a.quality));
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[ProxyRecord] {
        &self.records
    }

    pub fn best(&self) -> Option<&ProxyRecord> {
        self.records.first()
    }
}

/// Filters applied when loading a bag.
#[derive(Debug, Clone)]
pub struct ProxyFilter {
    pub continents: Vec<Continent>,
    pub max_last_tested_weeks: u32,
}

impl Default for ProxyFilter {
    fn default() -> Self {
        Self {
            continents: Vec::new(),
            max_last_tested_weeks: DEFAULT_MAX_LAST_TESTED_WEEKS,
        }
    }
}

impl ProxyFilter {
    pub fn with_continents(mut self, continents: Vec<Continent>) -> Self {
        self.continents = continents;
        self
    }

    /// Resolves the filter against the current time.
    pub fn query(&self, now: DateTime<Utc>) -> ProxyQuery {
        ProxyQuery {
            continents: self.continents.clone(),
            quality_gt: 0,
            last_tested_after: now - ChronoDuration::weeks(i64::from(self.max_last_tested_weeks)),
        }
    }
}

/// Concrete query sent to the proxy supply service. Results are expected
/// ordered by quality, descending.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyQuery {
    pub continents: Vec<Continent>,
    pub quality_gt: i64,
    pub last_tested_after: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationStrategy {
    /// Pick any other record from the bag.
    #[default]
    Random,
    /// Walk the bag in quality order, wrapping around.
    Ranked,
}

/// Tracks the active proxy and the optional public proxy bag.
#[derive(Debug, Clone, Default)]
pub struct ProxyRotationManager {
    strategy: RotationStrategy,
    bag: Option<ProxyBag>,
    current: Option<ProxyRecord>,
    cursor: usize,
}

impl ProxyRotationManager {
    pub fn new(strategy: RotationStrategy) -> Self {
        Self {
            strategy,
            bag: None,
            current: None,
            cursor: 0,
        }
    }

    pub fn strategy(&self) -> RotationStrategy {
        self.strategy
    }

    pub fn set_strategy(&mut self, strategy: RotationStrategy) {
        self.strategy = strategy;
    }

    /// The active proxy, `None` for direct connections.
    pub fn current(&self) -> Option<&ProxyRecord> {
        self.current.as_ref()
    }

    pub fn bag(&self) -> Option<&ProxyBag> {
        self.bag.as_ref()
    }

    pub fn has_bag(&self) -> bool {
        self.bag.as_ref().is_some_and(|bag| !bag.is_empty())
    }

    /// Pins a fixed proxy, leaving any loaded bag untouched.
    pub fn set_current(&mut self, record: Option<ProxyRecord>) {
        self.current = record;
    }

    /// Installs a bag and activates its highest quality record.
    pub fn install_bag(&mut self, bag: ProxyBag) -> Result<&ProxyRecord, ProxyBagError> {
        let best = bag.best().cloned().ok_or(ProxyBagError::EmptyProxyBag)?;
        self.bag = Some(bag);
        self.cursor = 0;
        Ok(self.current.insert(best))
    }

    /// Fetches a fresh bag from the proxy supply service.
    pub async fn load_bag(
        &mut self,
        supply: &dyn ProxySupply,
        filter: &ProxyFilter,
    ) -> Result<&ProxyRecord, LoadBagError> {
        let query = filter.query(Utc::now());
        let records = supply.fetch_proxies(&query).await?;
        log::debug!("proxy supply returned {} candidates", records.len());

        if records.is_empty() {
            log::error!("proxy supply returned no proxies for {:?}", filter.continents);
            return Err(ProxyBagError::EmptyProxyBag.into());
        }

        Ok(self.install_bag(ProxyBag::new(records))?)
    }

    /// Swaps the active proxy for another candidate from the bag.
    pub fn rotate(&mut self) -> Result<&ProxyRecord, ProxyBagError> {
        let bag = self
            .bag
            .as_ref()
            .filter(|bag| !bag.is_empty())
            .ok_or(ProxyBagError::EmptyProxyBag)?;
        let records = bag.records();

        let next = match self.strategy {
            RotationStrategy::Random => {
                let candidates: Vec<&ProxyRecord> = records
                    .iter()
                    .filter(|record| Some(*record) != self.current.as_ref())
                    .collect();
                let mut rng = rand::thread_rng();
                match candidates.choose(&mut rng) {
                    Some(record) => (*record).clone(),
                    None => records[0].clone(),
                }
            }
            RotationStrategy::Ranked => {
                self.cursor = (self.cursor + 1) % records.len();
                records[self.cursor].clone()
            }
        };

        log::debug!(
            "rotating proxy {} -> {}",
            self.current
                .as_ref()
                .map(ProxyRecord::endpoint)
                .unwrap_or_else(|| "none".into()),
            next.endpoint()
        );
        Ok(self.current.insert(next))
    }
}

/// Failure while loading a bag: either the service or the result was bad.
#[derive(Debug, Error)]
pub enum LoadBagError {
    #[error(transparent)]
    Bag(#[from] ProxyBagError),
    #[error(transparent)]
    Remote(#[from] RemoteServiceError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn record(id: i64, quality: i64) -> ProxyRecord {
        ProxyRecord {
            id: Some(id),
            scheme: "http".into(),
            host: format!("10.0.0.{id}"),
            port: 8080,
            quality,
            last_tested: None,
            continent: Some("Europe".into()),
        }
    }

    struct FixedSupply {
        records: Vec<ProxyRecord>,
        queries: Mutex<Vec<ProxyQuery>>,
    }

    #[async_trait]
    impl ProxySupply for FixedSupply {
        async fn fetch_proxies(
            &self,
            query: &ProxyQuery,
        ) -> Result<Vec<ProxyRecord>, RemoteServiceError> {
            self.queries.lock().unwrap().push(query.clone());
            Ok(self.records.clone())
        }
    }

    #[test]
    fn validates_known_continents() {
        let parsed = validate_continents(&["North America", "Europe"]).unwrap();
        assert_eq!(parsed, vec![Continent::NorthAmerica, Continent::Europe]);
    }

    #[test]
    fn rejects_unknown_continent() {
        let err = validate_continents(&["Europe", "Mars"]).unwrap_err();
        assert_eq!(err, ProxyBagError::InvalidContinent("Mars".into()));
    }

    #[test]
    fn bag_orders_by_quality() {
        let bag = ProxyBag::new(vec![record(1, 2), record(2, 9), record(3, 5)]);
        let qualities: Vec<i64> = bag.records().iter().map(|r| r.quality).collect();
        assert_eq!(qualities, vec![9, 5, 2]);
    }

    #[test]
    fn query_uses_recency_window() {
        let now = Utc::now();
        let query = ProxyFilter::default().query(now);
        assert_eq!(query.quality_gt, 0);
        assert_eq!(now - query.last_tested_after, ChronoDuration::weeks(5));
    }

    #[test]
    fn parses_configured_endpoint() {
        let record = ProxyRecord::from_endpoint("http://66.98.56.237:8080").unwrap();
        assert_eq!(record.endpoint(), "http://66.98.56.237:8080");
        assert!(record.id.is_none());
        assert!(ProxyRecord::from_endpoint("not a proxy").is_err());
    }

    #[test]
    fn rotate_without_bag_is_empty_bag_error() {
        let mut manager = ProxyRotationManager::default();
        assert_eq!(manager.rotate().unwrap_err(), ProxyBagError::EmptyProxyBag);
    }

    #[test]
    fn random_rotation_avoids_current_and_keeps_bag() {
        let mut manager = ProxyRotationManager::new(RotationStrategy::Random);
        manager
            .install_bag(ProxyBag::new(vec![record(1, 9), record(2, 5)]))
            .unwrap();
        assert_eq!(manager.current().unwrap().id, Some(1));

        let next = manager.rotate().unwrap().clone();
        assert_eq!(next.id, Some(2));
        assert_eq!(manager.bag().unwrap().len(), 2);
    }

    #[test]
    fn ranked_rotation_walks_quality_order() {
        let mut manager = ProxyRotationManager::new(RotationStrategy::Ranked);
        manager
            .install_bag(ProxyBag::new(vec![record(1, 1), record(2, 3), record(3, 2)]))
            .unwrap();
        let order: Vec<Option<i64>> = (0..3).map(|_| manager.rotate().unwrap().id).collect();
        assert_eq!(order, vec![Some(3), Some(1), Some(2)]);
    }

    #[tokio::test]
    async fn load_bag_activates_best_record() {
        let supply = FixedSupply {
            records: vec![record(1, 1), record(2, 7)],
            queries: Mutex::new(Vec::new()),
        };
        let mut manager = ProxyRotationManager::default();
        let filter = ProxyFilter::default().with_continents(vec![Continent::Asia]);
        let best = manager.load_bag(&supply, &filter).await.unwrap();
        assert_eq!(best.id, Some(2));

        let queries = supply.queries.lock().unwrap();
        assert_eq!(queries[0].continents, vec![Continent::Asia]);
    }

    #[tokio::test]
    async fn load_bag_fails_on_empty_result() {
        let supply = FixedSupply {
            records: Vec::new(),
            queries: Mutex::new(Vec::new()),
        };
        let mut manager = ProxyRotationManager::default();
        let err = manager
            .load_bag(&supply, &ProxyFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LoadBagError::Bag(ProxyBagError::EmptyProxyBag)));
        assert!(!manager.has_bag());
    }
}
