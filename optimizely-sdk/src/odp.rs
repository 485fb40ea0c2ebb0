//! Audience segments from the ODP (off-device personalization) service.
//!
//! Segments a user qualifies for are fetched on demand and cached per user. They feed the
//! `qualified` audience matcher.

use std::sync::Arc;
use std::time::Duration;

use hyper::{client::connect::Connection, service::Service, Uri};
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::http::{BlockingHttpClient, HttpError};
use crate::project_config::OdpIntegration;

const DEFAULT_SEGMENTS_CACHE_SIZE: u64 = 10_000;
const DEFAULT_SEGMENTS_CACHE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const USER_ID_KEY: &str = "fs_user_id";
const QUALIFIED_STATE: &str = "qualified";
const SEGMENTS_QUERY: &str = "query($userId: String, $audiences: [String]) {customer(fs_user_id: $userId) {audiences(subset: $audiences) {edges {node {name state}}}}}";

#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OdpError {
    #[error("ODP is not integrated with this project")]
    NotIntegrated,

    #[error("ODP is disabled")]
    Disabled,

    #[error("audience segments fetch failed: {0}")]
    FetchFailed(String),
}

/// Tuning of the ODP collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OdpConfig {
    pub disabled: bool,
    pub segments_cache_size: u64,
    pub segments_cache_timeout: Duration,
}

impl Default for OdpConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            segments_cache_size: DEFAULT_SEGMENTS_CACHE_SIZE,
            segments_cache_timeout: DEFAULT_SEGMENTS_CACHE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OdpSegmentOption {
    /// Skip the cache for both read and write.
    IgnoreCache,
    /// Clear the whole cache before fetching.
    ResetCache,
}

/// Trait for the component that asks the segment service which of `segments_to_check` a user
/// qualifies for. Calls block until the service answers or fails.
pub trait SegmentsFetcher: Send + Sync {
    fn fetch_qualified_segments(
        &self,
        api_key: &str,
        api_host: &str,
        user_key: &str,
        user_value: &str,
        segments_to_check: &[String],
    ) -> Result<Vec<String>, OdpError>;
}

/// Caching front of a [SegmentsFetcher].
pub struct OdpSegmentManager {
    cache: Cache<String, Vec<String>>,
    fetcher: Arc<dyn SegmentsFetcher>,
}

impl OdpSegmentManager {
    pub fn new(config: &OdpConfig, fetcher: Arc<dyn SegmentsFetcher>) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.segments_cache_size)
            .time_to_live(config.segments_cache_timeout)
            .build();
        Self { cache, fetcher }
    }

    pub fn fetch_qualified_segments(
        &self,
        integration: &OdpIntegration,
        user_id: &str,
        options: &[OdpSegmentOption],
    ) -> Result<Vec<String>, OdpError> {
        let (api_key, api_host) = match (&integration.public_key, &integration.host) {
            (Some(key), Some(host)) => (key, host),
            _ => return Err(OdpError::NotIntegrated),
        };

        if integration.segments_to_check.is_empty() {
            debug!("No segments are used in the project; skipping segments fetch");
            return Ok(Vec::new());
        }

        let cache_key = format!("{}-$-{}", USER_ID_KEY, user_id);
        let ignore_cache = options.contains(&OdpSegmentOption::IgnoreCache);

        if options.contains(&OdpSegmentOption::ResetCache) {
            self.cache.invalidate_all();
        }

        if !ignore_cache {
            if let Some(segments) = self.cache.get(&cache_key) {
                debug!("ODP cache hit for user {}", user_id);
                return Ok(segments);
            }
        }

        let segments = self.fetcher.fetch_qualified_segments(
            api_key,
            api_host,
            USER_ID_KEY,
            user_id,
            &integration.segments_to_check,
        )?;

        if !ignore_cache {
            self.cache.insert(cache_key, segments.clone());
        }
        Ok(segments)
    }

    pub fn reset(&self) {
        self.cache.invalidate_all();
    }
}

#[derive(Deserialize)]
struct GraphQlResponse {
    data: Option<GraphQlData>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Deserialize)]
struct GraphQlError {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct GraphQlData {
    customer: Option<Customer>,
}

#[derive(Deserialize)]
struct Customer {
    audiences: Audiences,
}

#[derive(Deserialize)]
struct Audiences {
    #[serde(default)]
    edges: Vec<Edge>,
}

#[derive(Deserialize)]
struct Edge {
    node: Node,
}

#[derive(Deserialize)]
struct Node {
    name: String,
    state: String,
}

/// [SegmentsFetcher] querying the ODP GraphQL endpoint.
pub struct HyperSegmentsFetcher {
    timeout: Duration,
    http: BlockingHttpClient,
}

impl HyperSegmentsFetcher {
    pub fn new<C>(connector: C) -> Result<Self, std::io::Error>
    where
        C: Service<Uri> + Clone + Send + Sync + 'static,
        C::Response: Connection + AsyncRead + AsyncWrite + Send + Unpin,
        C::Future: Send + Unpin + 'static,
        C::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Ok(Self {
            timeout: DEFAULT_FETCH_TIMEOUT,
            http: BlockingHttpClient::new(connector, "odp-segments")?,
        })
    }
}

impl SegmentsFetcher for HyperSegmentsFetcher {
    fn fetch_qualified_segments(
        &self,
        api_key: &str,
        api_host: &str,
        user_key: &str,
        user_value: &str,
        segments_to_check: &[String],
    ) -> Result<Vec<String>, OdpError> {
        if user_key != USER_ID_KEY {
            return Err(OdpError::FetchFailed(format!(
                "unsupported user key {}",
                user_key
            )));
        }

        let body = json!({
            "query": SEGMENTS_QUERY,
            "variables": {"userId": user_value, "audiences": segments_to_check},
        });
        let body = serde_json::to_vec(&body).map_err(|e| OdpError::FetchFailed(e.to_string()))?;
        let url = format!("{}/v3/graphql", api_host.trim_end_matches('/'));

        let response = self
            .http
            .post_json(&url, &[("x-api-key", api_key)], body, self.timeout)
            .map_err(|e| match e {
                HttpError::Timeout => OdpError::FetchFailed("request timed out".into()),
                e => OdpError::FetchFailed(e.to_string()),
            })?;

        if !response.is_success() {
            return Err(OdpError::FetchFailed(format!(
                "status {}",
                response.status
            )));
        }

        parse_segments(&response.body)
    }
}

fn parse_segments(bytes: &[u8]) -> Result<Vec<String>, OdpError> {
    let response: GraphQlResponse =
        serde_json::from_slice(bytes).map_err(|e| OdpError::FetchFailed(e.to_string()))?;

    if let Some(error) = response.errors.first() {
        return Err(OdpError::FetchFailed(error.message.clone()));
    }

    let customer = response
        .data
        .and_then(|data| data.customer)
        .ok_or_else(|| OdpError::FetchFailed("decode error".into()))?;

    Ok(customer
        .audiences
        .edges
        .into_iter()
        .filter(|edge| edge.node.state == QUALIFIED_STATE)
        .map(|edge| edge.node.name)
        .collect())
}

#[cfg(test)]
pub(crate) mod test_doubles {
    use super::*;
    use parking_lot::Mutex;

    pub struct FakeSegmentsFetcher {
        pub segments: Result<Vec<String>, OdpError>,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeSegmentsFetcher {
        pub fn returning(segments: &[&str]) -> Self {
            Self {
                segments: Ok(segments.iter().map(|s| s.to_string()).collect()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    impl SegmentsFetcher for FakeSegmentsFetcher {
        fn fetch_qualified_segments(
            &self,
            _api_key: &str,
            _api_host: &str,
            _user_key: &str,
            user_value: &str,
            _segments_to_check: &[String],
        ) -> Result<Vec<String>, OdpError> {
            self.calls.lock().push(user_value.to_string());
            self.segments.clone()
        }
    }
}
