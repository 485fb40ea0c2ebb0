//! Contextual multi-armed bandit decisions.
//!
//! Experiments carrying a CMAB spec are resolved by a remote prediction service instead of the
//! local bucketer. Predictions are cached per user, rule and relevant attribute values.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hyper::{client::connect::Connection, service::Service, Uri};
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use crate::http::{BlockingHttpClient, HttpError};
use crate::project_config::{Experiment, ProjectConfig};

use super::options::DecideOptions;
use super::DecisionUser;

const DEFAULT_CACHE_SIZE: u64 = 10_000;
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30 * 60);
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_FETCH_RETRIES: u32 = 1;
const RETRY_BACKOFF: Duration = Duration::from_millis(100);
const CUSTOM_ATTRIBUTE_TYPE: &str = "custom_attribute";

/// Error type used to represent failures talking to the prediction service.
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CmabError {
    #[error("CMAB fetch failed: {0}")]
    FetchFailed(String),

    #[error("invalid CMAB response: {0}")]
    InvalidResponse(String),

    #[error("CMAB request timed out")]
    Timeout,
}

/// Tuning of the CMAB collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmabConfig {
    pub cache_size: u64,
    pub cache_ttl: Duration,
    pub http_timeout: Duration,
    /// Overrides the prediction endpoint; `{rule_id}` is replaced by the experiment id.
    pub prediction_endpoint_template: Option<String>,
}

impl Default for CmabConfig {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
            cache_ttl: DEFAULT_CACHE_TTL,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            prediction_endpoint_template: None,
        }
    }
}

/// A prediction for one user and rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmabDecision {
    pub variation_id: String,
    pub cmab_uuid: String,
}

/// Trait for the remote decision oracle. Calls block until the oracle answers or fails.
pub trait CmabClient: Send + Sync {
    fn fetch_decision(
        &self,
        rule_id: &str,
        user_id: &str,
        attributes: &BTreeMap<String, Value>,
        cmab_uuid: &str,
    ) -> Result<String, CmabError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CmabCacheKey {
    user_id: String,
    rule_id: String,
    attributes_fingerprint: String,
}

/// Caching front of a [CmabClient].
pub struct CmabService {
    cache: Cache<CmabCacheKey, CmabDecision>,
    client: Arc<dyn CmabClient>,
}

impl CmabService {
    pub fn new(config: &CmabConfig, client: Arc<dyn CmabClient>) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.cache_size)
            .time_to_live(config.cache_ttl)
            .support_invalidation_closures()
            .build();
        Self { cache, client }
    }

    /// Returns the prediction for `user` on `experiment`, consulting the cache as `options`
    /// allow.
    pub fn get_decision(
        &self,
        config: &ProjectConfig,
        user: &DecisionUser,
        experiment: &Experiment,
        options: &DecideOptions,
    ) -> Result<CmabDecision, CmabError> {
        let attributes = relevant_attributes(config, user, experiment);

        if options.ignore_cmab_cache {
            return self.fetch(&experiment.id, &user.user_id, &attributes);
        }

        if options.reset_cmab_cache {
            self.reset();
        }
        if options.invalidate_user_cmab_cache {
            self.invalidate_user(&user.user_id);
        }

        let key = CmabCacheKey {
            user_id: user.user_id.clone(),
            rule_id: experiment.id.clone(),
            attributes_fingerprint: serde_json::to_string(&attributes).unwrap_or_default(),
        };

        // Concurrent misses on the same key wait for a single fetch.
        self.cache
            .try_get_with(key, || {
                self.fetch(&experiment.id, &user.user_id, &attributes)
            })
            .map_err(|e| (*e).clone())
    }

    pub fn reset(&self) {
        debug!("Resetting CMAB cache");
        self.cache.invalidate_all();
    }

    pub fn invalidate_user(&self, user_id: &str) {
        let user_id = user_id.to_string();
        if let Err(e) = self
            .cache
            .invalidate_entries_if(move |key, _| key.user_id == user_id)
        {
            warn!("Failed to invalidate CMAB cache entries: {}", e);
        }
    }

    fn fetch(
        &self,
        rule_id: &str,
        user_id: &str,
        attributes: &BTreeMap<String, Value>,
    ) -> Result<CmabDecision, CmabError> {
        let cmab_uuid = Uuid::new_v4().to_string();
        let variation_id = self
            .client
            .fetch_decision(rule_id, user_id, attributes, &cmab_uuid)?;
        Ok(CmabDecision {
            variation_id,
            cmab_uuid,
        })
    }
}

/// The subset of user attributes declared on the experiment's CMAB spec, keyed by attribute key.
fn relevant_attributes(
    config: &ProjectConfig,
    user: &DecisionUser,
    experiment: &Experiment,
) -> BTreeMap<String, Value> {
    let attribute_ids = match &experiment.cmab {
        Some(cmab) => &cmab.attribute_ids,
        None => return BTreeMap::new(),
    };

    attribute_ids
        .iter()
        .filter_map(|id| config.attribute_key(id))
        .filter_map(|key| {
            user.attributes
                .get(key)
                .map(|value| (key.to_string(), value.clone()))
        })
        .collect()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictionAttribute<'a> {
    id: &'a str,
    value: &'a Value,
    #[serde(rename = "type")]
    attribute_type: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictionInstance<'a> {
    visitor_id: &'a str,
    experiment_id: &'a str,
    attributes: Vec<PredictionAttribute<'a>>,
    #[serde(rename = "cmabUUID")]
    cmab_uuid: &'a str,
}

#[derive(Serialize)]
struct PredictionRequest<'a> {
    instances: Vec<PredictionInstance<'a>>,
}

#[derive(Deserialize)]
struct Prediction {
    variation_id: Option<String>,
}

#[derive(Deserialize)]
struct PredictionResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

/// [CmabClient] calling the prediction endpoint over HTTP.
pub struct HyperCmabClient {
    endpoint_template: String,
    timeout: Duration,
    http: BlockingHttpClient,
}

impl HyperCmabClient {
    pub fn new<C>(
        connector: C,
        endpoint_template: &str,
        timeout: Duration,
    ) -> Result<Self, std::io::Error>
    where
        C: Service<Uri> + Clone + Send + Sync + 'static,
        C::Response: Connection + AsyncRead + AsyncWrite + Send + Unpin,
        C::Future: Send + Unpin + 'static,
        C::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Ok(Self {
            endpoint_template: endpoint_template.to_string(),
            timeout,
            http: BlockingHttpClient::new(connector, "cmab-client")?,
        })
    }
}

impl CmabClient for HyperCmabClient {
    fn fetch_decision(
        &self,
        rule_id: &str,
        user_id: &str,
        attributes: &BTreeMap<String, Value>,
        cmab_uuid: &str,
    ) -> Result<String, CmabError> {
        let request = PredictionRequest {
            instances: vec![PredictionInstance {
                visitor_id: user_id,
                experiment_id: rule_id,
                attributes: attributes
                    .iter()
                    .map(|(id, value)| PredictionAttribute {
                        id,
                        value,
                        attribute_type: CUSTOM_ATTRIBUTE_TYPE,
                    })
                    .collect(),
                cmab_uuid,
            }],
        };
        let body =
            serde_json::to_vec(&request).map_err(|e| CmabError::FetchFailed(e.to_string()))?;
        let url = self.endpoint_template.replace("{rule_id}", rule_id);

        let mut last_error = CmabError::FetchFailed("no attempt made".into());
        for attempt in 0..=MAX_FETCH_RETRIES {
            if attempt > 0 {
                thread::sleep(RETRY_BACKOFF * attempt);
            }

            match self.http.post_json(&url, &[], body.clone(), self.timeout) {
                Ok(response) if response.is_success() => return parse_prediction(&response.body),
                Ok(response) => {
                    last_error = CmabError::FetchFailed(format!("status {}", response.status));
                }
                Err(HttpError::Timeout) => last_error = CmabError::Timeout,
                Err(e) => last_error = CmabError::FetchFailed(e.to_string()),
            }
        }
        Err(last_error)
    }
}

fn parse_prediction(bytes: &[u8]) -> Result<String, CmabError> {
    let response: PredictionResponse = serde_json::from_slice(bytes)
        .map_err(|e| CmabError::InvalidResponse(e.to_string()))?;
    response
        .predictions
        .into_iter()
        .next()
        .and_then(|p| p.variation_id)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| CmabError::InvalidResponse("missing variation_id".into()))
}


#[cfg(test)]
mod tests {
    use super::test_doubles::FakeCmabClient;
    use super::*;
    use crate::test_common::everything_config;
    use serde_json::json;

    fn service(client: Arc<FakeCmabClient>) -> CmabService {
        CmabService::new(&CmabConfig::default(), client)
    }

    fn user(id: &str, age: i64, browser: &str) -> DecisionUser {
        let mut user = DecisionUser::new(id);
        user.attributes.insert("age".to_string(), json!(age));
        user.attributes.insert("browser".to_string(), json!(browser));
        user
    }

    #[test]
    fn identical_requests_hit_the_cache() {
        let config = everything_config();
        let experiment = config.experiment_by_key("cmab_exp").unwrap();
        let client = Arc::new(FakeCmabClient::returning("40001"));
        let service = service(client.clone());
        let options = DecideOptions::default();

        let first = service
            .get_decision(&config, &user("u1", 30, "chrome"), experiment, &options)
            .unwrap();
        let second = service
            .get_decision(&config, &user("u1", 30, "chrome"), experiment, &options)
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(client.call_count(), 1);
        assert_eq!(
            client.calls.lock()[0].2,
            BTreeMap::from([("age".to_string(), json!(30))])
        );
    }

    #[test]
    fn concurrent_misses_share_one_fetch() {
        let config = everything_config();
        let experiment = config.experiment_by_key("cmab_exp").unwrap();
        let client = Arc::new(
            FakeCmabClient::returning("40001").with_delay(std::time::Duration::from_millis(200)),
        );
        let service = service(client.clone());
        let options = DecideOptions::default();
        let start = std::sync::Barrier::new(8);

        let decisions: Vec<CmabDecision> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        start.wait();
                        service
                            .get_decision(&config, &user("u1", 30, "chrome"), experiment, &options)
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(client.call_count(), 1);
        assert!(decisions.iter().all(|d| d == &decisions[0]));
        assert_eq!("40001", decisions[0].variation_id);
    }

    #[test]
    fn irrelevant_attributes_do_not_change_the_key() {
        let config = everything_config();
        let experiment = config.experiment_by_key("cmab_exp").unwrap();
        let client = Arc::new(FakeCmabClient::returning("40001"));
        let service = service(client.clone());
        let options = DecideOptions::default();

        service
            .get_decision(&config, &user("u1", 30, "chrome"), experiment, &options)
            .unwrap();
        service
            .get_decision(&config, &user("u1", 30, "firefox"), experiment, &options)
            .unwrap();
        assert_eq!(client.call_count(), 1);

        service
            .get_decision(&config, &user("u1", 31, "firefox"), experiment, &options)
            .unwrap();
        assert_eq!(client.call_count(), 2);
    }

    #[test]
    fn ignore_cache_never_writes() {
        let config = everything_config();
        let experiment = config.experiment_by_key("cmab_exp").unwrap();
        let client = Arc::new(FakeCmabClient::returning("40001"));
        let service = service(client.clone());
        let ignore = DecideOptions {
            ignore_cmab_cache: true,
            ..Default::default()
        };

        service
            .get_decision(&config, &user("u1", 30, "chrome"), experiment, &ignore)
            .unwrap();
        service
            .get_decision(&config, &user("u1", 30, "chrome"), experiment, &DecideOptions::default())
            .unwrap();
        assert_eq!(client.call_count(), 2);
    }

    #[test]
    fn invalidate_user_evicts_only_that_user() {
        let config = everything_config();
        let experiment = config.experiment_by_key("cmab_exp").unwrap();
        let client = Arc::new(FakeCmabClient::returning("40001"));
        let service = service(client.clone());
        let options = DecideOptions::default();

        service
            .get_decision(&config, &user("u1", 30, "chrome"), experiment, &options)
            .unwrap();
        service
            .get_decision(&config, &user("u2", 30, "chrome"), experiment, &options)
            .unwrap();
        assert_eq!(client.call_count(), 2);

        let invalidate = DecideOptions {
            invalidate_user_cmab_cache: true,
            ..Default::default()
        };
        service
            .get_decision(&config, &user("u1", 30, "chrome"), experiment, &invalidate)
            .unwrap();
        assert_eq!(client.call_count(), 3);

        service
            .get_decision(&config, &user("u2", 30, "chrome"), experiment, &options)
            .unwrap();
        assert_eq!(client.call_count(), 3);
    }

    #[test]
    fn reset_clears_every_entry() {
        let config = everything_config();
        let experiment = config.experiment_by_key("cmab_exp").unwrap();
        let client = Arc::new(FakeCmabClient::returning("40001"));
        let service = service(client.clone());

        service
            .get_decision(&config, &user("u1", 30, "chrome"), experiment, &DecideOptions::default())
            .unwrap();
        let reset = DecideOptions {
            reset_cmab_cache: true,
            ..Default::default()
        };
        service
            .get_decision(&config, &user("u1", 30, "chrome"), experiment, &reset)
            .unwrap();
        assert_eq!(client.call_count(), 2);
    }

    #[test]
    fn failures_are_not_cached() {
        let config = everything_config();
        let experiment = config.experiment_by_key("cmab_exp").unwrap();
        let client = Arc::new(FakeCmabClient::failing());
        let service = service(client.clone());

        for _ in 0..2 {
            let result = service.get_decision(
                &config,
                &user("u1", 30, "chrome"),
                experiment,
                &DecideOptions::default(),
            );
            assert!(matches!(result, Err(CmabError::FetchFailed(_))));
        }
        assert_eq!(client.call_count(), 2);
    }

    #[test]
    fn parses_prediction_payloads() {
        assert_eq!(
            parse_prediction(br#"{"predictions": [{"variation_id": "40002"}]}"#),
            Ok("40002".to_string())
        );
        assert!(matches!(
            parse_prediction(br#"{"predictions": []}"#),
            Err(CmabError::InvalidResponse(_))
        ));
        assert!(matches!(
            parse_prediction(b"not json"),
            Err(CmabError::InvalidResponse(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn hyper_client_posts_prediction_requests() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/predict/exp-cmab")
            .match_body(mockito::Matcher::PartialJson(json!({
                "instances": [{"visitorId": "u1", "experimentId": "exp-cmab"}]
            })))
            .with_status(200)
            .with_body(r#"{"predictions": [{"variation_id": "40002"}]}"#)
            .create_async()
            .await;

        let client = HyperCmabClient::new(
            hyper::client::HttpConnector::new(),
            &format!("{}/predict/{{rule_id}}", server.url()),
            Duration::from_secs(5),
        )
        .expect("client should start");

        let result = tokio::task::spawn_blocking(move || {
            client.fetch_decision("exp-cmab", "u1", &BTreeMap::new(), "uuid-1")
        })
        .await
        .unwrap();

        assert_eq!(result, Ok("40002".to_string()));
        mock.assert_async().await;
    }
}
