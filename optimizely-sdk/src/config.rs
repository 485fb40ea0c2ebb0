use crate::config_manager::manager_builders::{
    PollingConfigManagerBuilder, ProjectConfigManagerFactory, StaticConfigManagerBuilder,
};
use crate::decision::cmab::{CmabClient, CmabConfig};
use crate::decision::options::DecideOption;
use crate::decision::user_profile::UserProfileService;
use crate::events::processor_builders::{
    EventProcessorBuilder, EventProcessorFactory, NullEventProcessorBuilder,
};
use crate::notification::NotificationCenter;
use crate::odp::{OdpConfig, SegmentsFetcher};
use crate::ServiceEndpointsBuilder;

use std::borrow::Borrow;
use std::sync::Arc;

/// Immutable configuration object for [crate::Client].
///
/// [Config] instances can be created using a [ConfigBuilder].
pub struct Config {
    sdk_key: String,
    service_endpoints_builder: ServiceEndpointsBuilder,
    config_manager_builder: Box<dyn ProjectConfigManagerFactory>,
    event_processor_builder: Box<dyn EventProcessorFactory>,
    default_decide_options: Vec<DecideOption>,
    user_profile_service: Option<Arc<dyn UserProfileService>>,
    odp: OdpConfig,
    segments_fetcher: Option<Arc<dyn SegmentsFetcher>>,
    cmab: CmabConfig,
    cmab_client: Option<Arc<dyn CmabClient>>,
    notification_center: Option<Arc<NotificationCenter>>,
    offline: bool,
}

impl Config {
    /// Returns the sdk key.
    pub fn sdk_key(&self) -> &str {
        &self.sdk_key
    }

    /// Returns the [ServiceEndpointsBuilder]
    pub fn service_endpoints_builder(&self) -> &ServiceEndpointsBuilder {
        &self.service_endpoints_builder
    }

    /// Returns the ProjectConfigManagerFactory
    pub fn config_manager_builder(&self) -> &(dyn ProjectConfigManagerFactory) {
        self.config_manager_builder.borrow()
    }

    /// Returns the EventProcessorFactory
    pub fn event_processor_builder(&self) -> &(dyn EventProcessorFactory) {
        self.event_processor_builder.borrow()
    }

    pub fn default_decide_options(&self) -> &[DecideOption] {
        &self.default_decide_options
    }

    pub fn user_profile_service(&self) -> Option<&Arc<dyn UserProfileService>> {
        self.user_profile_service.as_ref()
    }

    pub fn odp(&self) -> &OdpConfig {
        &self.odp
    }

    pub fn segments_fetcher(&self) -> Option<&Arc<dyn SegmentsFetcher>> {
        self.segments_fetcher.as_ref()
    }

    pub fn cmab(&self) -> &CmabConfig {
        &self.cmab
    }

    pub fn cmab_client(&self) -> Option<&Arc<dyn CmabClient>> {
        self.cmab_client.as_ref()
    }

    pub fn notification_center(&self) -> Option<&Arc<NotificationCenter>> {
        self.notification_center.as_ref()
    }

    /// Returns the offline status
    pub fn offline(&self) -> bool {
        self.offline
    }
}

/// Used to create a [Config] struct for creating [crate::Client] instances.
///
/// For usage examples see:
/// - [Creating service endpoints](crate::ServiceEndpointsBuilder)
/// - [Configuring datafile polling](crate::PollingConfigManagerBuilder)
/// - [Configuring events sent to Optimizely](crate::EventProcessorBuilder)
pub struct ConfigBuilder {
    service_endpoints_builder: Option<ServiceEndpointsBuilder>,
    config_manager_builder: Option<Box<dyn ProjectConfigManagerFactory>>,
    event_processor_builder: Option<Box<dyn EventProcessorFactory>>,
    datafile: Option<Vec<u8>>,
    datafile_access_token: Option<String>,
    default_decide_options: Vec<DecideOption>,
    user_profile_service: Option<Arc<dyn UserProfileService>>,
    odp: OdpConfig,
    segments_fetcher: Option<Arc<dyn SegmentsFetcher>>,
    cmab: CmabConfig,
    cmab_client: Option<Arc<dyn CmabClient>>,
    notification_center: Option<Arc<NotificationCenter>>,
    offline: bool,
    sdk_key: String,
}

impl ConfigBuilder {
    /// Create a new instance of the [ConfigBuilder] with the provided `sdk_key`.
    pub fn new(sdk_key: &str) -> Self {
        Self {
            service_endpoints_builder: None,
            config_manager_builder: None,
            event_processor_builder: None,
            datafile: None,
            datafile_access_token: None,
            default_decide_options: Vec::new(),
            user_profile_service: None,
            odp: OdpConfig::default(),
            segments_fetcher: None,
            cmab: CmabConfig::default(),
            cmab_client: None,
            notification_center: None,
            offline: false,
            sdk_key: sdk_key.to_string(),
        }
    }

    /// Set the URLs to use for this client. For usage see [ServiceEndpointsBuilder]
    pub fn service_endpoints(mut self, builder: &ServiceEndpointsBuilder) -> Self {
        self.service_endpoints_builder = Some(builder.clone());
        self
    }

    /// Bootstrap datafile. Decisions can be made with it before the first poll completes.
    ///
    /// Ignored when a custom config manager is set.
    pub fn datafile(mut self, datafile: impl Into<Vec<u8>>) -> Self {
        self.datafile = Some(datafile.into());
        self
    }

    /// Token for fetching an authenticated datafile.
    ///
    /// Ignored when a custom config manager is set.
    pub fn datafile_access_token(mut self, token: &str) -> Self {
        self.datafile_access_token = Some(token.to_string());
        self
    }

    /// Set the config manager to use for this client.
    /// For the polling config manager, see [PollingConfigManagerBuilder].
    ///
    /// By default the datafile is polled from the CDN.
    pub fn config_manager(mut self, builder: &dyn ProjectConfigManagerFactory) -> Self {
        self.config_manager_builder = Some(builder.to_owned());
        self
    }

    /// Set the event processor to use for this client.
    /// For usage see [EventProcessorBuilder](crate::EventProcessorBuilder).
    ///
    /// If offline mode is enabled, this event processor will be ignored.
    pub fn event_processor(mut self, builder: &dyn EventProcessorFactory) -> Self {
        self.event_processor_builder = Some(builder.to_owned());
        self
    }

    /// Options applied to every decide call in addition to the options of the call.
    pub fn default_decide_options(mut self, options: &[DecideOption]) -> Self {
        self.default_decide_options = options.to_vec();
        self
    }

    pub fn user_profile_service(mut self, service: Arc<dyn UserProfileService>) -> Self {
        self.user_profile_service = Some(service);
        self
    }

    pub fn odp(mut self, odp: OdpConfig) -> Self {
        self.odp = odp;
        self
    }

    /// Replaces the HTTP client used to fetch audience segments.
    pub fn segments_fetcher(mut self, fetcher: Arc<dyn SegmentsFetcher>) -> Self {
        self.segments_fetcher = Some(fetcher);
        self
    }

    pub fn cmab(mut self, cmab: CmabConfig) -> Self {
        self.cmab = cmab;
        self
    }

    /// Replaces the HTTP client used to ask the prediction service for CMAB decisions.
    pub fn cmab_client(mut self, client: Arc<dyn CmabClient>) -> Self {
        self.cmab_client = Some(client);
        self
    }

    /// Use this center instead of the one registered for the SDK key.
    pub fn notification_center(mut self, center: Arc<NotificationCenter>) -> Self {
        self.notification_center = Some(center);
        self
    }

    /// Whether the client should be initialized in offline mode.
    ///
    /// In offline mode no remote network requests are made and no events are sent. Decisions are
    /// made against the bootstrap datafile, if one was given. By default, this is false.
    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    /// Create a new instance of [Config] based on the [ConfigBuilder] configuration.
    pub fn build(self) -> Config {
        let service_endpoints_builder = match &self.service_endpoints_builder {
            None => ServiceEndpointsBuilder::new(),
            Some(service_endpoints_builder) => service_endpoints_builder.clone(),
        };

        let config_manager_builder: Box<dyn ProjectConfigManagerFactory> =
            match (self.config_manager_builder, &self.datafile) {
                (Some(builder), _) => builder,
                (None, Some(datafile)) if self.offline => {
                    Box::new(StaticConfigManagerBuilder::new(datafile.clone()))
                }
                (None, datafile) => {
                    let mut builder = PollingConfigManagerBuilder::new();
                    if let Some(datafile) = datafile {
                        builder.datafile(datafile.clone());
                    }
                    if let Some(token) = &self.datafile_access_token {
                        builder.access_token(token);
                    }
                    Box::new(builder)
                }
            };

        let event_processor_builder: Box<dyn EventProcessorFactory> =
            match self.event_processor_builder {
                None if self.offline => Box::new(NullEventProcessorBuilder::new()),
                Some(_) if self.offline => {
                    warn!("Custom event processor builders will be ignored when in offline mode");
                    Box::new(NullEventProcessorBuilder::new())
                }
                None => Box::new(EventProcessorBuilder::new()),
                Some(event_processor_builder) => event_processor_builder,
            };

        Config {
            sdk_key: self.sdk_key,
            service_endpoints_builder,
            config_manager_builder,
            event_processor_builder,
            default_decide_options: self.default_decide_options,
            user_profile_service: self.user_profile_service,
            odp: self.odp,
            segments_fetcher: self.segments_fetcher,
            cmab: self.cmab,
            cmab_client: self.cmab_client,
            notification_center: self.notification_center,
            offline: self.offline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project_config::Region;
    use crate::service_endpoints::ServiceEndpoints;
    use crate::test_common::DATAFILE_S1;

    #[test]
    fn client_configured_with_custom_endpoints() {
        let config = ConfigBuilder::new("sdk-key")
            .service_endpoints(ServiceEndpointsBuilder::new().events_url("http://localhost/events"))
            .build();

        let endpoints = config.service_endpoints_builder().build().unwrap();
        assert_eq!(endpoints.events_url(Region::US), "http://localhost/events");
        assert_eq!(endpoints.events_url(Region::EU), "http://localhost/events");
    }

    #[test]
    fn bootstrap_datafile_is_available_without_polling() {
        let config = ConfigBuilder::new("sdk-key").datafile(DATAFILE_S1).build();

        let manager = config
            .config_manager_builder()
            .build(
                &ServiceEndpoints::default(),
                config.sdk_key(),
                Arc::new(NotificationCenter::new()),
            )
            .unwrap();

        assert_eq!(manager.get_config().unwrap().revision(), "1");
    }

    #[test]
    fn offline_config_serves_the_static_datafile() {
        let config = ConfigBuilder::new("")
            .offline(true)
            .datafile(DATAFILE_S1)
            .build();

        let manager = config
            .config_manager_builder()
            .build(
                &ServiceEndpoints::default(),
                config.sdk_key(),
                Arc::new(NotificationCenter::new()),
            )
            .unwrap();

        assert!(config.offline());
        assert_eq!(manager.get_config().unwrap().revision(), "1");
    }

    #[test]
    fn default_decide_options_are_kept() {
        let config = ConfigBuilder::new("sdk-key")
            .default_decide_options(&[DecideOption::IncludeReasons])
            .build();

        assert_eq!(
            config.default_decide_options(),
            &[DecideOption::IncludeReasons]
        );
        assert!(!config.odp().disabled);
        assert!(config.cmab_client().is_none());
    }
}
