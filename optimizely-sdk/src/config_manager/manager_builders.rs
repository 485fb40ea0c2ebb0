use super::manager::{PollingConfigManager, ProjectConfigManager, StaticConfigManager};
use super::requester_builders::{DatafileRequesterFactory, HyperDatafileRequesterBuilder};
use crate::notification::NotificationCenter;
use crate::service_endpoints::ServiceEndpoints;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[cfg(test)]
use super::manager;

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("config manager factory failed to build: {0}")]
    InvalidConfig(String),
}

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);
const MINIMUM_POLL_INTERVAL: Duration = Duration::from_secs(30);

pub trait ProjectConfigManagerFactory {
    fn build(
        &self,
        endpoints: &ServiceEndpoints,
        sdk_key: &str,
        notification_center: Arc<NotificationCenter>,
    ) -> Result<Arc<dyn ProjectConfigManager>, BuildError>;
    fn to_owned(&self) -> Box<dyn ProjectConfigManagerFactory>;
}

/// Serves a single datafile for the life of the client. Nothing is fetched.
#[derive(Clone)]
pub struct StaticConfigManagerBuilder {
    datafile: Vec<u8>,
}

impl StaticConfigManagerBuilder {
    pub fn new(datafile: impl Into<Vec<u8>>) -> Self {
        Self {
            datafile: datafile.into(),
        }
    }
}

impl ProjectConfigManagerFactory for StaticConfigManagerBuilder {
    fn build(
        &self,
        _: &ServiceEndpoints,
        _: &str,
        _: Arc<NotificationCenter>,
    ) -> Result<Arc<dyn ProjectConfigManager>, BuildError> {
        let manager = StaticConfigManager::new(&self.datafile)
            .map_err(|e| BuildError::InvalidConfig(e.to_string()))?;
        Ok(Arc::new(manager))
    }

    fn to_owned(&self) -> Box<dyn ProjectConfigManagerFactory> {
        Box::new(self.clone())
    }
}

/// Contains methods for configuring the polling config manager.
///
/// The SDK periodically requests the datafile for its SDK key. HTTP caching allows it to avoid
/// redundantly downloading the datafile if there have been no changes.
///
/// To configure polling, create a builder with [PollingConfigManagerBuilder::new], set its
/// properties with the methods of this class, and pass it to [crate::ConfigBuilder::config_manager].
///
/// # Examples
///
/// Adjust the poll interval.
/// ```
/// # use optimizely_sdk::{PollingConfigManagerBuilder, ConfigBuilder};
/// # use std::time::Duration;
/// # fn main() {
///     ConfigBuilder::new("sdk-key").config_manager(PollingConfigManagerBuilder::new()
///         .poll_interval(Duration::from_secs(60)));
/// # }
/// ```
#[derive(Clone)]
pub struct PollingConfigManagerBuilder {
    poll_interval: Duration,
    datafile: Option<Vec<u8>>,
    access_token: Option<String>,
    requester_factory: Option<Arc<Mutex<Box<dyn DatafileRequesterFactory>>>>,
}

impl PollingConfigManagerBuilder {
    /// Create a new instance of the [PollingConfigManagerBuilder] with default values.
    pub fn new() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            datafile: None,
            access_token: None,
            requester_factory: None,
        }
    }

    /// Sets the poll interval.
    ///
    /// The default is 5 minutes and the minimum value is 30 seconds. Values less than this will
    /// be set to the minimum.
    pub fn poll_interval(&mut self, poll_interval: Duration) -> &mut Self {
        self.poll_interval = std::cmp::max(poll_interval, MINIMUM_POLL_INTERVAL);
        self
    }

    /// Bootstrap datafile served until the first successful poll.
    pub fn datafile(&mut self, datafile: impl Into<Vec<u8>>) -> &mut Self {
        self.datafile = Some(datafile.into());
        self
    }

    /// Token for authenticated datafiles. Setting one switches to the authenticated datafile URL.
    pub fn access_token(&mut self, access_token: &str) -> &mut Self {
        self.access_token = Some(access_token.to_string());
        self
    }

    /// Sets the datafile requester factory for use by this config manager.
    ///
    /// The default implementation relies on hyper and handles basic caching.
    pub fn requester_factory(
        &mut self,
        requester_factory: Box<dyn DatafileRequesterFactory>,
    ) -> &mut Self {
        self.requester_factory = Some(Arc::new(Mutex::new(requester_factory)));
        self
    }
}

impl ProjectConfigManagerFactory for PollingConfigManagerBuilder {
    fn build(
        &self,
        endpoints: &ServiceEndpoints,
        sdk_key: &str,
        notification_center: Arc<NotificationCenter>,
    ) -> Result<Arc<dyn ProjectConfigManager>, BuildError> {
        if sdk_key.is_empty() && self.datafile.is_none() {
            return Err(BuildError::InvalidConfig(
                "an SDK key or a datafile is required".into(),
            ));
        }

        let requester_factory: Arc<Mutex<Box<dyn DatafileRequesterFactory>>> =
            match &self.requester_factory {
                Some(factory) => factory.clone(),
                _ => Arc::new(Mutex::new(Box::new(HyperDatafileRequesterBuilder::new()))),
            };

        let url = endpoints.datafile_url(sdk_key, self.access_token.is_some());
        let manager = PollingConfigManager::new(
            requester_factory,
            url,
            self.access_token.clone(),
            self.poll_interval,
            notification_center,
        );

        let manager = match &self.datafile {
            Some(datafile) => manager
                .with_datafile(datafile)
                .map_err(|e| BuildError::InvalidConfig(format!("invalid datafile: {}", e)))?,
            None => manager,
        };
        Ok(Arc::new(manager))
    }

    fn to_owned(&self) -> Box<dyn ProjectConfigManagerFactory> {
        Box::new(self.clone())
    }
}

impl Default for PollingConfigManagerBuilder {
    fn default() -> Self {
        PollingConfigManagerBuilder::new()
    }
}

/// For testing you can use this builder to inject the MockConfigManager.
#[cfg(test)]
#[derive(Clone)]
pub(crate) struct MockConfigManagerBuilder {
    config_manager: Option<Arc<manager::MockConfigManager>>,
}

#[cfg(test)]
impl MockConfigManagerBuilder {
    pub fn new() -> MockConfigManagerBuilder {
        MockConfigManagerBuilder {
            config_manager: None,
        }
    }

    pub fn config_manager(
        &mut self,
        config_manager: Arc<manager::MockConfigManager>,
    ) -> &mut MockConfigManagerBuilder {
        self.config_manager = Some(config_manager);
        self
    }
}

#[cfg(test)]
impl ProjectConfigManagerFactory for MockConfigManagerBuilder {
    fn build(
        &self,
        _endpoints: &ServiceEndpoints,
        _sdk_key: &str,
        _notification_center: Arc<NotificationCenter>,
    ) -> Result<Arc<dyn ProjectConfigManager>, BuildError> {
        return Ok(self.config_manager.as_ref().unwrap().clone());
    }

    fn to_owned(&self) -> Box<dyn ProjectConfigManagerFactory> {
        Box::new(self.clone())
    }
}
