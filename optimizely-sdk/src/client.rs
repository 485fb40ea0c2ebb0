use parking_lot::RwLock;
use std::any::Any;
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Runtime;

use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::{broadcast, Semaphore};

use super::config::Config;
use super::config_manager::manager::ProjectConfigManager;
use super::config_manager::manager_builders::BuildError as ConfigManagerError;
use super::user_context::{OptimizelyDecision, UserContext};
use crate::decision::cmab::{CmabClient, CmabService};
use crate::decision::options::{DecideOption, DecideOptions};
use crate::decision::reasons::DecisionReasons;
use crate::decision::service::DecisionService;
use crate::decision::{DecisionSource, DecisionUser, FeatureDecision};
use crate::events::event::{EventFactory, ImpressionInput, EXPERIMENT_RULE_TYPE};
use crate::events::processor::EventProcessor;
use crate::events::processor_builders::BuildError as EventProcessorError;
use crate::notification::registry;
use crate::notification::{
    DecisionNotification, Notification, NotificationCenter, TrackNotification,
};
use crate::odp::{OdpError, OdpSegmentManager, OdpSegmentOption, SegmentsFetcher};
use crate::project_config::{
    ConfigError, FeatureFlag, FeatureVariable, ProjectConfig, VariableType, Variation,
};
use crate::version::version_string;

const FLAG_DECISION_TYPE: &str = "flag";
const AB_TEST_DECISION_TYPE: &str = "ab-test";
const FEATURE_DECISION_TYPE: &str = "feature";
const FEATURE_VARIABLE_DECISION_TYPE: &str = "feature-variable";
const ALL_FEATURE_VARIABLES_DECISION_TYPE: &str = "all-feature-variables";

/// Error type used to represent failures when building a [Client] instance.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BuildError {
    /// Error used when a configuration setting is invalid. This typically indicates an invalid
    /// URL or datafile.
    #[error("invalid client config: {0}")]
    InvalidConfig(String),

    /// Error used when a background worker of the client could not be started.
    #[error("couldn't start client worker: {0}")]
    FailedToStart(io::Error),
}

impl From<ConfigManagerError> for BuildError {
    fn from(error: ConfigManagerError) -> Self {
        Self::InvalidConfig(error.to_string())
    }
}

impl From<EventProcessorError> for BuildError {
    fn from(error: EventProcessorError) -> Self {
        Self::InvalidConfig(error.to_string())
    }
}

/// Error type used to represent failures when starting the [Client].
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum StartError {
    /// Error used when spawning a background thread fails.
    #[error("couldn't spawn background thread for client: {0}")]
    SpawnFailed(io::Error),
}

/// Error type returned by the tracking and legacy decision APIs of the [Client].
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// No usable datafile is available.
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Experiment key ({0}) is not in datafile.")]
    ExperimentNotFound(String),

    #[error("No flag was found for key \"{0}\".")]
    FlagNotFound(String),

    #[error("Variable with key \"{variable_key}\" not found in flag \"{flag_key}\".")]
    VariableNotFound {
        flag_key: String,
        variable_key: String,
    },

    #[error("Variable \"{variable_key}\" is of type {actual:?}, not {requested:?}.")]
    VariableTypeMismatch {
        variable_key: String,
        requested: VariableType,
        actual: VariableType,
    },

    #[error("Variable value for key \"{0}\" is invalid or wrong type.")]
    InvalidVariableValue(String),

    /// An unexpected failure was trapped at the API boundary.
    #[error("unexpected failure in {0}")]
    Internal(String),
}

#[derive(PartialEq, Copy, Clone, Debug)]
enum ClientInitState {
    Initializing = 0,
    Initialized = 1,
    InitializationFailed = 2,
}

impl PartialEq<usize> for ClientInitState {
    fn eq(&self, other: &usize) -> bool {
        *self as usize == *other
    }
}

impl From<usize> for ClientInitState {
    fn from(val: usize) -> Self {
        match val {
            0 => ClientInitState::Initializing,
            1 => ClientInitState::Initialized,
            _ => ClientInitState::InitializationFailed,
        }
    }
}

/// A client for Optimizely feature flags and experiments.
///
/// In order to create a client instance you must first create a [crate::Config]. Decisions are
/// made through [UserContext]s created with [Client::create_user_context], which keep a shared
/// handle to the client. Wrap the client in an [Arc] to create them.
///
/// # Examples
///
/// Creating a client, with default configuration.
/// ```
/// # use optimizely_sdk::{Client, ConfigBuilder, BuildError};
/// # fn main() -> Result<(), BuildError> {
///     let client = Client::build(ConfigBuilder::new("sdk-key").build())?;
/// #   Ok(())
/// # }
/// ```
///
/// Creating an instance which sends events to a local collector.
/// ```
/// # use optimizely_sdk::{Client, ConfigBuilder, ServiceEndpointsBuilder, BuildError};
/// # fn main() -> Result<(), BuildError> {
///     let client = Client::build(ConfigBuilder::new("sdk-key")
///         .service_endpoints(ServiceEndpointsBuilder::new()
///             .events_url("http://localhost:8080/v1/events")
///         ).build()
///     )?;
/// #   Ok(())
/// # }
/// ```
///
/// Each builder type includes usage examples for the builder.
pub struct Client {
    config_manager: Arc<dyn ProjectConfigManager>,
    event_processor: Arc<dyn EventProcessor>,
    decision_service: DecisionService,
    notification_center: Arc<NotificationCenter>,
    odp: Option<OdpSegmentManager>,
    event_factory: EventFactory,
    default_decide_options: DecideOptions,
    init_notify: Arc<Semaphore>,
    init_state: Arc<AtomicUsize>,
    started: AtomicBool,
    closed: AtomicBool,
    offline: bool,
    sdk_key: String,
    registered_notification_center: bool,
    shutdown_broadcast: broadcast::Sender<()>,
    runtime: RwLock<Option<Runtime>>,
}

impl Client {
    /// Create a new instance of a [Client] based on the provided [Config] parameter.
    pub fn build(config: Config) -> Result<Self, BuildError> {
        if config.offline() {
            info!("Started Optimizely client in offline mode");
        }

        let endpoints = config.service_endpoints_builder().build()?;

        let (notification_center, registered_notification_center) =
            match config.notification_center() {
                Some(center) => (center.clone(), false),
                None => (registry::get_notification_center(config.sdk_key()), true),
            };

        let config_manager = config.config_manager_builder().build(
            &endpoints,
            config.sdk_key(),
            notification_center.clone(),
        )?;
        let event_processor = config
            .event_processor_builder()
            .build(&endpoints, notification_center.clone())?;

        let cmab_client = match config.cmab_client() {
            Some(client) => Some(client.clone()),
            None if config.offline() => None,
            None => {
                let template = config
                    .cmab()
                    .prediction_endpoint_template
                    .clone()
                    .unwrap_or_else(|| endpoints.cmab_prediction_url_template().to_string());
                default_cmab_client(&template, config.cmab().http_timeout)?
            }
        };
        let cmab_service =
            cmab_client.map(|client| Arc::new(CmabService::new(config.cmab(), client)));

        let odp = if config.odp().disabled || config.offline() {
            None
        } else {
            let fetcher = match config.segments_fetcher() {
                Some(fetcher) => Some(fetcher.clone()),
                None => default_segments_fetcher()?,
            };
            fetcher.map(|fetcher| OdpSegmentManager::new(config.odp(), fetcher))
        };

        let decision_service =
            DecisionService::new(config.user_profile_service().cloned(), cmab_service);

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Client {
            config_manager,
            event_processor,
            decision_service,
            notification_center,
            odp,
            event_factory: EventFactory::new(crate::CLIENT_NAME, version_string()),
            default_decide_options: DecideOptions::from_options(config.default_decide_options()),
            init_notify: Arc::new(Semaphore::new(0)),
            init_state: Arc::new(AtomicUsize::new(ClientInitState::Initializing as usize)),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            offline: config.offline(),
            sdk_key: config.sdk_key().into(),
            registered_notification_center,
            shutdown_broadcast: shutdown_tx,
            runtime: RwLock::new(None),
        })
    }

    /// Starts a client in the current thread, which must have a default tokio runtime.
    pub fn start_with_default_executor(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.start_with_default_executor_internal();
    }

    fn start_with_default_executor_internal(&self) {
        let notify = self.init_notify.clone();
        let init_state = self.init_state.clone();
        let init_complete = Arc::new(move |success: bool| {
            init_state.store(
                (if success {
                    ClientInitState::Initialized
                } else {
                    ClientInitState::InitializationFailed
                }) as usize,
                Ordering::SeqCst,
            );
            notify.add_permits(1);
        });

        if self.offline {
            init_complete(self.config_manager.get_config().is_ok());
            return;
        }

        self.config_manager
            .subscribe(init_complete, self.shutdown_broadcast.subscribe());
    }

    /// Creates a new tokio runtime and then starts the client. Tasks from the client will
    /// be executed on created runtime.
    /// If your application already has a tokio runtime, then you can use
    /// [crate::Client::start_with_default_executor] and the client will dispatch tasks to
    /// your existing runtime.
    pub fn start_with_runtime(&self) -> Result<bool, StartError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(true);
        }

        let runtime = tokio::runtime::Runtime::new().map_err(StartError::SpawnFailed)?;
        let _guard = runtime.enter();
        self.runtime.write().replace(runtime);

        self.start_with_default_executor_internal();

        Ok(true)
    }

    /// This is an async method that will resolve once initialization is complete.
    /// Initialization being complete does not mean that initialization was a success.
    /// The return value from the method indicates if the client has a usable datafile.
    pub async fn initialized_async(&self) -> bool {
        // The permit is not forgotten, so every waiter after the first gets it right away.
        if ClientInitState::Initializing == self.init_state.load(Ordering::SeqCst) {
            let _permit = self.init_notify.acquire().await;
        }
        ClientInitState::Initialized == self.init_state.load(Ordering::SeqCst)
    }

    /// This function synchronously returns if the SDK is initialized.
    /// If the datafile can never be fetched it is possible for the SDK to never become
    /// initialized.
    pub fn initialized(&self) -> bool {
        ClientInitState::Initialized == self.init_state.load(Ordering::SeqCst)
    }

    /// The center that receives decision, track, log event and config update notifications.
    pub fn notification_center(&self) -> &Arc<NotificationCenter> {
        &self.notification_center
    }

    /// The datafile currently in use.
    pub fn project_config(&self) -> Result<Arc<ProjectConfig>, ConfigError> {
        self.config_manager.get_config()
    }

    /// Close shuts down the client. After calling this, the client should no longer be used. The
    /// method will block until all pending events have been sent or the close timeout of the
    /// event processor elapses.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.event_processor.close();

        if self.started.load(Ordering::SeqCst) && !self.offline {
            if let Err(e) = self.shutdown_broadcast.send(()) {
                debug!("No background task to stop: {}", e);
            }
        }

        if self.registered_notification_center {
            registry::release_notification_center(&self.sdk_key);
        }

        // Dropping the runtime we created when starting the client closes out all spawned tasks.
        self.runtime.write().take();
    }

    /// Flush tells the client that all pending events (if any) should be delivered as soon as
    /// possible. Flushing is asynchronous, so this method will return before it is complete.
    /// However, if you call [Client::close], events are guaranteed to be sent before that method
    /// returns, within the close timeout.
    pub fn flush(&self) {
        self.event_processor.flush();
    }

    /// Creates a context to make decisions for `user_id`. The attributes are copied.
    pub fn create_user_context(
        self: &Arc<Self>,
        user_id: impl Into<String>,
        attributes: HashMap<String, Value>,
    ) -> UserContext {
        UserContext::new(self.clone(), user_id.into(), attributes)
    }

    /// Decides `keys` for the user. Every key gets an entry unless `filter_enabled` is set and
    /// [DecideOption::EnabledFlagsOnly] is in effect.
    pub(crate) fn decide_flags(
        &self,
        user_context: &UserContext,
        keys: &[String],
        options: &[DecideOption],
        filter_enabled: bool,
    ) -> HashMap<String, OptimizelyDecision> {
        let options = self
            .default_decide_options
            .merge(&DecideOptions::from_options(options));

        let decisions = error_boundary(
            "decide",
            || self.decide_flags_internal(user_context, keys, &options),
            |message| {
                keys.iter()
                    .map(|key| {
                        OptimizelyDecision::error(
                            key,
                            user_context.clone(),
                            format!("An unexpected error occurred: {}", message),
                        )
                    })
                    .collect()
            },
        );

        decisions
            .into_iter()
            .filter(|decision| {
                !(filter_enabled && options.enabled_flags_only && !decision.enabled)
            })
            .map(|decision| (decision.flag_key.clone(), decision))
            .collect()
    }

    fn decide_flags_internal(
        &self,
        user_context: &UserContext,
        keys: &[String],
        options: &DecideOptions,
    ) -> Vec<OptimizelyDecision> {
        let config = match self.config_manager.get_config() {
            Ok(config) => config,
            Err(e) => {
                return keys
                    .iter()
                    .map(|key| OptimizelyDecision::error(key, user_context.clone(), e.to_string()))
                    .collect()
            }
        };

        let user = user_context.snapshot();
        let flags: Vec<&FeatureFlag> = keys
            .iter()
            .filter_map(|key| config.feature_by_key(key))
            .collect();
        let mut flag_decisions = self
            .decision_service
            .get_variations_for_features(&config, &flags, &user, options)
            .into_iter();

        keys.iter()
            .map(|key| match config.feature_by_key(key) {
                Some(flag) => {
                    let (decision, reasons) = flag_decisions.next().unwrap_or_else(|| {
                        (
                            FeatureDecision::miss(),
                            DecisionReasons::new(options.include_reasons),
                        )
                    });
                    self.complete_decision(
                        &config,
                        flag,
                        &user,
                        user_context,
                        decision,
                        reasons,
                        options,
                    )
                }
                None => OptimizelyDecision::error(
                    key,
                    user_context.clone(),
                    ClientError::FlagNotFound(key.clone()).to_string(),
                ),
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn complete_decision(
        &self,
        config: &ProjectConfig,
        flag: &FeatureFlag,
        user: &DecisionUser,
        user_context: &UserContext,
        decision: FeatureDecision,
        mut reasons: DecisionReasons,
        options: &DecideOptions,
    ) -> OptimizelyDecision {
        let enabled = decision.enabled();

        let mut variables = Map::new();
        if !options.exclude_variables {
            for variable in &flag.variables {
                let raw = raw_variable_value(variable, decision.variation.as_ref());
                let value = match typed_variable_value(variable.variable_type, raw) {
                    Some(value) => value,
                    None => {
                        reasons.add_error(
                            ClientError::InvalidVariableValue(variable.key.clone()).to_string(),
                        );
                        Value::String(raw.to_string())
                    }
                };
                variables.insert(variable.key.clone(), value);
            }
        }

        let mut decision_event_dispatched = false;
        if !options.disable_decision_event && should_send_impression(config, &decision) {
            decision_event_dispatched = self.send_impression(
                config,
                ImpressionInput::for_flag(
                    &flag.key,
                    decision.experiment.as_deref(),
                    decision.variation.as_ref(),
                    decision.source,
                    decision.cmab_uuid.as_deref(),
                ),
                user,
            );
        }

        let variation_key = decision
            .variation
            .as_ref()
            .map(|v| v.key.clone())
            .unwrap_or_default();
        let rule_key = decision.rule_key().to_string();
        let reasons = reasons.into_vec();

        self.send_decision_notification(
            FLAG_DECISION_TYPE,
            user,
            json!({
                "flagKey": flag.key,
                "enabled": enabled,
                "variables": variables,
                "variationKey": variation_key,
                "ruleKey": rule_key,
                "reasons": reasons,
                "decisionEventDispatched": decision_event_dispatched,
                "experimentId": decision.experiment.as_ref().map(|e| e.id.clone()).unwrap_or_default(),
                "variationId": decision.variation.as_ref().map(|v| v.id.clone()).unwrap_or_default(),
            }),
        );

        OptimizelyDecision {
            variation_key,
            enabled,
            variables,
            rule_key,
            flag_key: flag.key.clone(),
            user_context: user_context.clone(),
            reasons,
            cmab_uuid: decision.cmab_uuid,
        }
    }

    pub(crate) fn flag_keys(&self) -> Vec<String> {
        match self.config_manager.get_config() {
            Ok(config) => config.feature_keys().to_vec(),
            Err(e) => {
                warn!("decide_all called without a datafile: {}", e);
                Vec::new()
            }
        }
    }

    pub(crate) fn fetch_qualified_segments(
        &self,
        user_id: &str,
        options: &[OdpSegmentOption],
    ) -> Result<Vec<String>, OdpError> {
        let odp = self.odp.as_ref().ok_or(OdpError::Disabled)?;
        let config = self
            .config_manager
            .get_config()
            .map_err(|e| OdpError::FetchFailed(e.to_string()))?;

        error_boundary(
            "fetch_qualified_segments",
            || odp.fetch_qualified_segments(config.odp_integration(), user_id, options),
            |message| Err(OdpError::FetchFailed(message)),
        )
    }

    /// Reports that a user has performed an event.
    ///
    /// `event_key` must be an event of the datafile; unknown keys are logged and ignored. The
    /// `revenue` and `value` tags are reported as the numeric metrics of the conversion.
    pub fn track(
        &self,
        event_key: &str,
        user_id: &str,
        attributes: &HashMap<String, Value>,
        event_tags: &HashMap<String, Value>,
    ) -> Result<(), ClientError> {
        error_boundary(
            "track",
            || self.track_internal(event_key, user_id, attributes, event_tags),
            |message| Err(ClientError::Internal(message)),
        )
    }

    fn track_internal(
        &self,
        event_key: &str,
        user_id: &str,
        attributes: &HashMap<String, Value>,
        event_tags: &HashMap<String, Value>,
    ) -> Result<(), ClientError> {
        let config = self.config_manager.get_config()?;

        let event_type = match config.event_by_key(event_key) {
            Some(event_type) => event_type,
            None => {
                warn!(
                    "Event key ({}) is not in datafile. Not tracking user ({}).",
                    event_key, user_id
                );
                return Ok(());
            }
        };

        let event = self.event_factory.new_conversion(
            &config,
            event_type,
            user_id,
            attributes,
            event_tags,
        );
        if !self.event_processor.process(event) {
            warn!(
                "Conversion for event \"{}\" was not queued; the event processor is closed or full.",
                event_key
            );
            return Ok(());
        }

        self.notification_center
            .send(Notification::Track(TrackNotification {
                event_key: event_key.to_string(),
                user_id: user_id.to_string(),
                attributes: attributes.clone(),
                event_tags: event_tags.clone(),
            }));
        Ok(())
    }

    /// Buckets the user into an experiment and sends an impression for it. Returns the key of
    /// the variation, or `None` when the user is not part of the experiment.
    pub fn activate(
        &self,
        experiment_key: &str,
        user_id: &str,
        attributes: &HashMap<String, Value>,
    ) -> Result<Option<String>, ClientError> {
        error_boundary(
            "activate",
            || -> Result<Option<String>, ClientError> {
                let config = self.config_manager.get_config()?;
                let variation =
                    match self.experiment_variation(&config, experiment_key, user_id, attributes)? {
                        Some(variation) => variation,
                        None => {
                            info!(
                                "Not activating user ({}) for experiment ({}).",
                                user_id, experiment_key
                            );
                            return Ok(None);
                        }
                    };

                if let Some(experiment) = config.experiment_by_key(experiment_key) {
                    let user = DecisionUser {
                        user_id: user_id.to_string(),
                        attributes: attributes.clone(),
                        ..Default::default()
                    };
                    self.send_impression(
                        &config,
                        ImpressionInput {
                            experiment: Some(experiment.as_ref()),
                            variation: Some(&variation),
                            flag_key: "",
                            rule_type: EXPERIMENT_RULE_TYPE,
                            enabled: variation.feature_enabled,
                            cmab_uuid: None,
                        },
                        &user,
                    );
                }
                Ok(Some(variation.key))
            },
            |message| Err(ClientError::Internal(message)),
        )
    }

    /// Buckets the user into an experiment without sending an impression.
    pub fn get_variation(
        &self,
        experiment_key: &str,
        user_id: &str,
        attributes: &HashMap<String, Value>,
    ) -> Result<Option<String>, ClientError> {
        error_boundary(
            "get_variation",
            || -> Result<Option<String>, ClientError> {
                let config = self.config_manager.get_config()?;
                Ok(self
                    .experiment_variation(&config, experiment_key, user_id, attributes)?
                    .map(|variation| variation.key))
            },
            |message| Err(ClientError::Internal(message)),
        )
    }

    fn experiment_variation(
        &self,
        config: &ProjectConfig,
        experiment_key: &str,
        user_id: &str,
        attributes: &HashMap<String, Value>,
    ) -> Result<Option<Variation>, ClientError> {
        let experiment = config
            .experiment_by_key(experiment_key)
            .ok_or_else(|| ClientError::ExperimentNotFound(experiment_key.to_string()))?;

        let user = DecisionUser {
            user_id: user_id.to_string(),
            attributes: attributes.clone(),
            ..Default::default()
        };
        let options = DecideOptions::default();
        let mut reasons = DecisionReasons::new(false);
        let mut tracker = self.decision_service.profile_tracker(user_id, &options);
        let decision = self.decision_service.get_variation(
            config,
            experiment,
            &user,
            &options,
            &mut tracker,
            &mut reasons,
        );
        tracker.save_if_modified();

        let variation = decision.map(|decision| decision.variation);
        self.send_decision_notification(
            AB_TEST_DECISION_TYPE,
            &user,
            json!({
                "experimentKey": experiment_key,
                "variationKey": variation.as_ref().map(|v| v.key.clone()),
            }),
        );
        Ok(variation)
    }

    /// Forces `user_id` into a variation of an experiment, or clears the mapping when
    /// `variation_key` is `None`. Returns false when the experiment or variation is unknown.
    pub fn set_forced_variation(
        &self,
        experiment_key: &str,
        user_id: &str,
        variation_key: Option<&str>,
    ) -> bool {
        match self.config_manager.get_config() {
            Ok(config) => self.decision_service.set_forced_variation(
                &config,
                experiment_key,
                user_id,
                variation_key,
            ),
            Err(e) => {
                warn!("set_forced_variation: {}", e);
                false
            }
        }
    }

    pub fn get_forced_variation(&self, experiment_key: &str, user_id: &str) -> Option<String> {
        let config = self.config_manager.get_config().ok()?;
        self.decision_service
            .get_forced_variation(&config, experiment_key, user_id)
            .map(|variation| variation.key)
    }

    /// Whether the flag is on for the user. Sends an impression when the user is part of a
    /// feature test, or for every decision when the datafile asks for flag decisions.
    pub fn is_feature_enabled(
        &self,
        flag_key: &str,
        user_id: &str,
        attributes: &HashMap<String, Value>,
    ) -> bool {
        error_boundary(
            "is_feature_enabled",
            || self.is_feature_enabled_internal(flag_key, user_id, attributes),
            |_| false,
        )
    }

    fn is_feature_enabled_internal(
        &self,
        flag_key: &str,
        user_id: &str,
        attributes: &HashMap<String, Value>,
    ) -> bool {
        let config = match self.config_manager.get_config() {
            Ok(config) => config,
            Err(e) => {
                warn!("is_feature_enabled: {}", e);
                return false;
            }
        };
        let flag = match config.feature_by_key(flag_key) {
            Some(flag) => flag,
            None => {
                warn!("{}", ClientError::FlagNotFound(flag_key.to_string()));
                return false;
            }
        };

        let (user, decision) = self.legacy_feature_decision(&config, flag, user_id, attributes);
        let enabled = decision.enabled();

        if should_send_impression(&config, &decision) {
            self.send_impression(
                &config,
                ImpressionInput::for_flag(
                    &flag.key,
                    decision.experiment.as_deref(),
                    decision.variation.as_ref(),
                    decision.source,
                    decision.cmab_uuid.as_deref(),
                ),
                &user,
            );
        }

        self.send_decision_notification(
            FEATURE_DECISION_TYPE,
            &user,
            json!({
                "featureKey": flag_key,
                "featureEnabled": enabled,
                "source": decision.source.rule_type(),
                "sourceInfo": source_info(&decision),
            }),
        );

        enabled
    }

    /// Keys of every flag that is on for the user.
    pub fn get_enabled_features(
        &self,
        user_id: &str,
        attributes: &HashMap<String, Value>,
    ) -> Vec<String> {
        let keys = match self.config_manager.get_config() {
            Ok(config) => config.feature_keys().to_vec(),
            Err(e) => {
                warn!("get_enabled_features: {}", e);
                return Vec::new();
            }
        };
        keys.into_iter()
            .filter(|key| self.is_feature_enabled(key, user_id, attributes))
            .collect()
    }

    pub fn get_feature_variable_boolean(
        &self,
        flag_key: &str,
        variable_key: &str,
        user_id: &str,
        attributes: &HashMap<String, Value>,
    ) -> Result<bool, ClientError> {
        let value = self.feature_variable(
            flag_key,
            variable_key,
            user_id,
            attributes,
            VariableType::Boolean,
        )?;
        value
            .as_bool()
            .ok_or_else(|| ClientError::InvalidVariableValue(variable_key.to_string()))
    }

    pub fn get_feature_variable_double(
        &self,
        flag_key: &str,
        variable_key: &str,
        user_id: &str,
        attributes: &HashMap<String, Value>,
    ) -> Result<f64, ClientError> {
        let value = self.feature_variable(
            flag_key,
            variable_key,
            user_id,
            attributes,
            VariableType::Double,
        )?;
        value
            .as_f64()
            .ok_or_else(|| ClientError::InvalidVariableValue(variable_key.to_string()))
    }

    pub fn get_feature_variable_integer(
        &self,
        flag_key: &str,
        variable_key: &str,
        user_id: &str,
        attributes: &HashMap<String, Value>,
    ) -> Result<i64, ClientError> {
        let value = self.feature_variable(
            flag_key,
            variable_key,
            user_id,
            attributes,
            VariableType::Integer,
        )?;
        value
            .as_i64()
            .ok_or_else(|| ClientError::InvalidVariableValue(variable_key.to_string()))
    }

    pub fn get_feature_variable_string(
        &self,
        flag_key: &str,
        variable_key: &str,
        user_id: &str,
        attributes: &HashMap<String, Value>,
    ) -> Result<String, ClientError> {
        let value = self.feature_variable(
            flag_key,
            variable_key,
            user_id,
            attributes,
            VariableType::String,
        )?;
        match value {
            Value::String(s) => Ok(s),
            _ => Err(ClientError::InvalidVariableValue(variable_key.to_string())),
        }
    }

    pub fn get_feature_variable_json(
        &self,
        flag_key: &str,
        variable_key: &str,
        user_id: &str,
        attributes: &HashMap<String, Value>,
    ) -> Result<Value, ClientError> {
        self.feature_variable(
            flag_key,
            variable_key,
            user_id,
            attributes,
            VariableType::Json,
        )
    }

    fn feature_variable(
        &self,
        flag_key: &str,
        variable_key: &str,
        user_id: &str,
        attributes: &HashMap<String, Value>,
        requested: VariableType,
    ) -> Result<Value, ClientError> {
        error_boundary(
            "get_feature_variable",
            || -> Result<Value, ClientError> {
                let config = self.config_manager.get_config()?;
                let flag = config
                    .feature_by_key(flag_key)
                    .ok_or_else(|| ClientError::FlagNotFound(flag_key.to_string()))?;
                let variable = flag.variable_by_key(variable_key).ok_or_else(|| {
                    ClientError::VariableNotFound {
                        flag_key: flag_key.to_string(),
                        variable_key: variable_key.to_string(),
                    }
                })?;
                if variable.variable_type != requested {
                    return Err(ClientError::VariableTypeMismatch {
                        variable_key: variable_key.to_string(),
                        requested,
                        actual: variable.variable_type,
                    });
                }

                let (user, decision) =
                    self.legacy_feature_decision(&config, flag, user_id, attributes);
                let raw = raw_variable_value(variable, decision.variation.as_ref());
                let value = typed_variable_value(variable.variable_type, raw)
                    .ok_or_else(|| ClientError::InvalidVariableValue(variable_key.to_string()))?;

                self.send_decision_notification(
                    FEATURE_VARIABLE_DECISION_TYPE,
                    &user,
                    json!({
                        "featureKey": flag_key,
                        "featureEnabled": decision.enabled(),
                        "source": decision.source.rule_type(),
                        "variableKey": variable_key,
                        "variableType": variable.variable_type,
                        "variableValue": value,
                        "sourceInfo": source_info(&decision),
                    }),
                );
                Ok(value)
            },
            |message| Err(ClientError::Internal(message)),
        )
    }

    /// Every variable of a flag for the user, typed according to the datafile.
    pub fn get_all_feature_variables(
        &self,
        flag_key: &str,
        user_id: &str,
        attributes: &HashMap<String, Value>,
    ) -> Result<Map<String, Value>, ClientError> {
        error_boundary(
            "get_all_feature_variables",
            || -> Result<Map<String, Value>, ClientError> {
                let config = self.config_manager.get_config()?;
                let flag = config
                    .feature_by_key(flag_key)
                    .ok_or_else(|| ClientError::FlagNotFound(flag_key.to_string()))?;

                let (user, decision) =
                    self.legacy_feature_decision(&config, flag, user_id, attributes);
                let mut variables = Map::new();
                for variable in &flag.variables {
                    let raw = raw_variable_value(variable, decision.variation.as_ref());
                    match typed_variable_value(variable.variable_type, raw) {
                        Some(value) => {
                            variables.insert(variable.key.clone(), value);
                        }
                        None => warn!(
                            "{}",
                            ClientError::InvalidVariableValue(variable.key.clone())
                        ),
                    }
                }

                self.send_decision_notification(
                    ALL_FEATURE_VARIABLES_DECISION_TYPE,
                    &user,
                    json!({
                        "featureKey": flag_key,
                        "featureEnabled": decision.enabled(),
                        "source": decision.source.rule_type(),
                        "variableValues": variables,
                        "sourceInfo": source_info(&decision),
                    }),
                );
                Ok(variables)
            },
            |message| Err(ClientError::Internal(message)),
        )
    }

    fn legacy_feature_decision(
        &self,
        config: &ProjectConfig,
        flag: &FeatureFlag,
        user_id: &str,
        attributes: &HashMap<String, Value>,
    ) -> (DecisionUser, FeatureDecision) {
        let user = DecisionUser {
            user_id: user_id.to_string(),
            attributes: attributes.clone(),
            ..Default::default()
        };
        let (decision, _) = self.decision_service.get_variation_for_feature(
            config,
            flag,
            &user,
            &DecideOptions::default(),
        );
        (user, decision)
    }

    fn send_impression(
        &self,
        config: &ProjectConfig,
        input: ImpressionInput,
        user: &DecisionUser,
    ) -> bool {
        let event =
            self.event_factory
                .new_impression(config, input, &user.user_id, &user.attributes);
        self.event_processor.process(event)
    }

    fn send_decision_notification(&self, decision_type: &str, user: &DecisionUser, info: Value) {
        let decision_info = match info {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.notification_center
            .send(Notification::Decision(DecisionNotification {
                decision_type: decision_type.to_string(),
                user_id: user.user_id.clone(),
                attributes: user.attributes.clone(),
                decision_info,
            }));
    }
}

fn should_send_impression(config: &ProjectConfig, decision: &FeatureDecision) -> bool {
    config.send_flag_decisions()
        || (decision.source == DecisionSource::FeatureTest && decision.variation.is_some())
}

fn source_info(decision: &FeatureDecision) -> Value {
    match (&decision.experiment, &decision.variation) {
        (Some(experiment), Some(variation)) if decision.source == DecisionSource::FeatureTest => {
            json!({"experimentKey": experiment.key, "variationKey": variation.key})
        }
        _ => json!({}),
    }
}

/// The variation's value of a variable when the variation turns the flag on, the default value
/// otherwise.
fn raw_variable_value<'a>(
    variable: &'a FeatureVariable,
    variation: Option<&'a Variation>,
) -> &'a str {
    variation
        .filter(|variation| variation.feature_enabled)
        .and_then(|variation| variation.variables.get(&variable.id))
        .map(String::as_str)
        .unwrap_or(&variable.default_value)
}

fn typed_variable_value(variable_type: VariableType, raw: &str) -> Option<Value> {
    match variable_type {
        VariableType::Boolean => raw.parse::<bool>().ok().map(Value::Bool),
        VariableType::Integer => raw.parse::<i64>().ok().map(Value::from),
        VariableType::Double => raw
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
        VariableType::String => Some(Value::String(raw.to_string())),
        VariableType::Json => serde_json::from_str(raw).ok(),
    }
}

/// Runs `body`, turning a panic into the value built by `on_panic` after logging it.
pub(crate) fn error_boundary<T>(
    operation: &str,
    body: impl FnOnce() -> T,
    on_panic: impl FnOnce(String) -> T,
) -> T {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(value) => value,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(
                "{} failed unexpectedly: {}\n{}",
                operation,
                message,
                Backtrace::force_capture()
            );
            on_panic(message)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(feature = "rustls")]
fn default_cmab_client(
    endpoint_template: &str,
    timeout: std::time::Duration,
) -> Result<Option<Arc<dyn CmabClient>>, BuildError> {
    let client = crate::decision::cmab::HyperCmabClient::new(
        crate::https_connector::create_https_connector(),
        endpoint_template,
        timeout,
    )
    .map_err(BuildError::FailedToStart)?;
    Ok(Some(Arc::new(client)))
}

#[cfg(not(feature = "rustls"))]
fn default_cmab_client(
    _endpoint_template: &str,
    _timeout: std::time::Duration,
) -> Result<Option<Arc<dyn CmabClient>>, BuildError> {
    warn!("CMAB experiments need a CMAB client when the rustls feature is disabled");
    Ok(None)
}

#[cfg(feature = "rustls")]
fn default_segments_fetcher() -> Result<Option<Arc<dyn SegmentsFetcher>>, BuildError> {
    let fetcher = crate::odp::HyperSegmentsFetcher::new(
        crate::https_connector::create_https_connector(),
    )
    .map_err(BuildError::FailedToStart)?;
    Ok(Some(Arc::new(fetcher)))
}

#[cfg(not(feature = "rustls"))]
fn default_segments_fetcher() -> Result<Option<Arc<dyn SegmentsFetcher>>, BuildError> {
    warn!("Audience segments need a segments fetcher when the rustls feature is disabled");
    Ok(None)
}

#[cfg(test)]
pub(crate) mod tests {
    use crossbeam_channel::{unbounded, Receiver};
    use maplit::hashmap;
    use parking_lot::Mutex;
    use std::time::Duration;

    use tokio::time::Instant;

    use crate::config_manager::manager::MockConfigManager;
    use crate::config_manager::manager_builders::MockConfigManagerBuilder;
    use crate::decision::cmab::test_doubles::FakeCmabClient;
    use crate::decision::forced_decisions::{DecisionContext, ForcedDecision};
    use crate::decision::user_profile::{UserProfile, UserProfileService};
    use crate::events::batch::EventBatch;
    use crate::events::dispatcher::test_doubles::InMemoryEventDispatcher;
    use crate::events::processor_builders::EventProcessorBuilder;
    use crate::notification::NotificationType;
    use crate::odp::test_doubles::FakeSegmentsFetcher;
    use crate::test_common::{everything_config, s1_config, s1_datafile_with_revision};
    use crate::ConfigBuilder;
    use test_case::test_case;

    use super::*;

    fn is_send_and_sync<T: Send + Sync>() {}

    #[test]
    fn ensure_client_is_send_and_sync() {
        is_send_and_sync::<Client>();
        is_send_and_sync::<UserContext>();
    }

    pub(crate) fn make_client_with_config(
        config: Option<Arc<ProjectConfig>>,
        customize: impl FnOnce(ConfigBuilder) -> ConfigBuilder,
    ) -> (Arc<Client>, Receiver<EventBatch>) {
        let manager = Arc::new(MockConfigManager::new(config));
        let (batch_tx, batch_rx) = unbounded();

        let builder = ConfigBuilder::new("client-test-key")
            .config_manager(MockConfigManagerBuilder::new().config_manager(manager))
            .event_processor(
                EventProcessorBuilder::new()
                    .dispatcher(Arc::new(InMemoryEventDispatcher::new(batch_tx))),
            )
            .cmab_client(Arc::new(FakeCmabClient::returning("40001")))
            .segments_fetcher(Arc::new(FakeSegmentsFetcher::returning(&[])))
            .notification_center(Arc::new(NotificationCenter::new()));

        let client = Client::build(customize(builder).build()).expect("Should be built.");
        (Arc::new(client), batch_rx)
    }

    pub(crate) fn make_client(
        config: Option<Arc<ProjectConfig>>,
    ) -> (Arc<Client>, Receiver<EventBatch>) {
        make_client_with_config(config, |builder| builder)
    }

    fn dispatched_batches(client: &Client, batch_rx: &Receiver<EventBatch>) -> Vec<EventBatch> {
        client.close();
        batch_rx.try_iter().collect()
    }

    fn record_notifications(
        client: &Client,
        notification_type: NotificationType,
    ) -> Arc<Mutex<Vec<Notification>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        client
            .notification_center()
            .add_handler(notification_type, move |n| sink.lock().push(n.clone()));
        seen
    }

    #[tokio::test]
    async fn client_initializes_from_config_manager() {
        let (client, _rx) = make_client(Some(s1_config()));
        assert!(!client.initialized());

        client.start_with_default_executor();

        let now = Instant::now();
        assert!(client.initialized_async().await);
        assert!(client.initialized());
        assert!(now.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn client_without_datafile_fails_initialization() {
        let (client, _rx) = make_client(None);
        client.start_with_default_executor();

        assert!(!client.initialized_async().await);
        assert!(!client.initialized());
    }

    #[test]
    fn offline_client_decides_from_bootstrap_datafile() {
        let client = Arc::new(
            Client::build(
                ConfigBuilder::new("offline-key")
                    .offline(true)
                    .datafile(s1_datafile_with_revision("9"))
                    .notification_center(Arc::new(NotificationCenter::new()))
                    .build(),
            )
            .expect("Should be built."),
        );
        client.start_with_default_executor();

        assert!(client.initialized());
        let decision = client
            .create_user_context("tester", HashMap::new())
            .decide("feature_2", &[]);
        assert!(decision.enabled);
        client.close();
    }

    #[test]
    fn decide_feature_test_emits_one_impression() {
        let (client, batch_rx) = make_client(Some(s1_config()));
        let user = client.create_user_context("tester", HashMap::new());

        let decision = user.decide("feature_2", &[]);

        assert!(decision.enabled);
        assert_eq!(decision.variation_key, "variation_with_traffic");
        assert_eq!(decision.rule_key, "exp_no_audience");
        assert_eq!(decision.flag_key, "feature_2");
        assert_eq!(decision.user_context.user_id(), "tester");
        assert_eq!(decision.variables.get("label"), Some(&json!("on-value")));

        let batches = dispatched_batches(&client, &batch_rx);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].visitors.len(), 1);
        let metadata = &batches[0].visitors[0].snapshots[0].decisions[0].metadata;
        assert_eq!(metadata.rule_type, "feature-test");
        assert_eq!(metadata.flag_key, "feature_2");
        assert_eq!(metadata.variation_key, "variation_with_traffic");
    }

    #[test]
    fn repeated_decisions_are_stable_and_not_memoized() {
        let (client, batch_rx) = make_client(Some(s1_config()));
        let user = client.create_user_context("tester", hashmap! {"gender".into() => json!("f")});

        let first = user.decide("feature_1", &[]);
        let second = user.decide("feature_1", &[]);

        assert_eq!(first.variation_key, second.variation_key);
        let batches = dispatched_batches(&client, &batch_rx);
        let visitors: usize = batches.iter().map(|b| b.visitors.len()).sum();
        assert_eq!(visitors, 2);
    }

    #[test]
    fn forced_flag_decision_wins() {
        let (client, _rx) = make_client(Some(s1_config()));
        let user = client.create_user_context("tester", HashMap::new());
        user.set_forced_decision(
            &DecisionContext::new("feature_1", None),
            &ForcedDecision::new("b"),
        );

        let decision = user.decide("feature_1", &[DecideOption::IncludeReasons]);

        assert_eq!(decision.variation_key, "b");
        assert_eq!(decision.rule_key, "");
        assert!(decision.reasons.contains(
            &"Variation (b) is mapped to flag (feature_1) and user (tester) in the forced decision map"
                .to_string()
        ));
    }

    #[test_case(true, 1; "flag decisions on")]
    #[test_case(false, 0; "flag decisions off")]
    fn missed_rollout_impressions_follow_send_flag_decisions(
        send_flag_decisions: bool,
        expected_visitors: usize,
    ) {
        let datafile = crate::test_common::DATAFILE_S1.replace(
            "\"sendFlagDecisions\": true",
            &format!("\"sendFlagDecisions\": {}", send_flag_decisions),
        );
        let config = Arc::new(ProjectConfig::from_datafile(datafile).unwrap());
        let (client, batch_rx) = make_client(Some(config));

        let decision = client
            .create_user_context("tester", HashMap::new())
            .decide("feature_3", &[]);

        assert!(!decision.enabled);
        assert_eq!(decision.variation_key, "");
        assert_eq!(decision.rule_key, "");

        let batches = dispatched_batches(&client, &batch_rx);
        let visitors: Vec<_> = batches.iter().flat_map(|b| b.visitors.iter()).collect();
        assert_eq!(visitors.len(), expected_visitors);
        if let Some(visitor) = visitors.first() {
            assert_eq!(visitor.snapshots[0].decisions[0].experiment_id, "");
        }
    }

    #[test]
    fn disable_decision_event_suppresses_impressions() {
        let (client, batch_rx) = make_client(Some(s1_config()));
        let decided = record_notifications(&client, NotificationType::Decision);

        client
            .create_user_context("tester", HashMap::new())
            .decide("feature_2", &[DecideOption::DisableDecisionEvent]);

        assert!(dispatched_batches(&client, &batch_rx).is_empty());
        let decided = decided.lock();
        assert_eq!(decided.len(), 1);
        match &decided[0] {
            Notification::Decision(n) => {
                assert_eq!(n.decision_type, "flag");
                assert_eq!(n.decision_info["decisionEventDispatched"], json!(false));
                assert_eq!(n.decision_info["flagKey"], json!("feature_2"));
                assert_eq!(n.decision_info["experimentId"], json!("10390977673"));
                assert_eq!(n.decision_info["variationId"], json!("10389729780"));
            }
            other => panic!("unexpected notification {:?}", other),
        }
    }

    #[test]
    fn decide_without_datafile_returns_error_decision() {
        let (client, batch_rx) = make_client(None);
        let decision = client
            .create_user_context("tester", HashMap::new())
            .decide("feature_2", &[]);

        assert!(!decision.enabled);
        assert!(decision.variables.is_empty());
        assert_eq!(
            decision.reasons,
            vec!["Optimizely SDK not configured properly yet.".to_string()]
        );
        assert!(dispatched_batches(&client, &batch_rx).is_empty());
    }

    #[test]
    fn decide_unknown_flag_returns_error_decision() {
        let (client, _rx) = make_client(Some(s1_config()));
        let decision = client
            .create_user_context("tester", HashMap::new())
            .decide("missing", &[]);

        assert!(!decision.enabled);
        assert_eq!(decision.flag_key, "missing");
        assert_eq!(
            decision.reasons,
            vec!["No flag was found for key \"missing\".".to_string()]
        );
    }

    #[test]
    fn decide_for_keys_matches_single_decisions() {
        let (client, _rx) = make_client(Some(s1_config()));
        let user = client.create_user_context("tester", HashMap::new());
        let keys = ["feature_1", "feature_2", "feature_3", "missing"];

        let decisions = user.decide_for_keys(&keys, &[DecideOption::DisableDecisionEvent]);

        assert_eq!(decisions.len(), 4);
        for key in keys {
            let single = user.decide(key, &[DecideOption::DisableDecisionEvent]);
            assert_eq!(decisions[key].variation_key, single.variation_key);
            assert_eq!(decisions[key].enabled, single.enabled);
            assert_eq!(decisions[key].reasons, single.reasons);
        }

        let enabled_only = user.decide_for_keys(
            &keys,
            &[
                DecideOption::DisableDecisionEvent,
                DecideOption::EnabledFlagsOnly,
            ],
        );
        assert!(enabled_only.values().all(|d| d.enabled));
        assert!(enabled_only.contains_key("feature_2"));
        assert!(!enabled_only.contains_key("feature_3"));
    }

    #[test]
    fn decide_all_covers_every_flag() {
        let (client, _rx) = make_client(Some(s1_config()));
        let decisions = client
            .create_user_context("tester", HashMap::new())
            .decide_all(&[DecideOption::ExcludeVariables]);

        assert_eq!(decisions.len(), 3);
        assert!(decisions["feature_2"].variables.is_empty());
    }

    #[test]
    fn default_decide_options_are_merged() {
        let (client, batch_rx) = make_client_with_config(Some(s1_config()), |builder| {
            builder.default_decide_options(&[DecideOption::DisableDecisionEvent])
        });

        client
            .create_user_context("tester", HashMap::new())
            .decide("feature_2", &[DecideOption::IncludeReasons]);

        assert!(dispatched_batches(&client, &batch_rx).is_empty());
    }

    struct PanickingProfileService;

    impl UserProfileService for PanickingProfileService {
        fn lookup(&self, _: &str) -> Option<UserProfile> {
            panic!("profile store exploded")
        }

        fn save(&self, _: UserProfile) {}
    }

    #[test]
    fn panics_become_error_decisions() {
        let (client, _rx) = make_client_with_config(Some(s1_config()), |builder| {
            builder.user_profile_service(Arc::new(PanickingProfileService))
        });

        let decision = client
            .create_user_context("tester", HashMap::new())
            .decide("feature_2", &[]);

        assert!(!decision.enabled);
        assert_eq!(decision.reasons.len(), 1);
        assert!(decision.reasons[0].contains("profile store exploded"));
    }

    #[test]
    fn typed_variables_in_decisions() {
        let (client, _rx) = make_client(Some(everything_config()));
        let decision = client
            .create_user_context("tester", HashMap::new())
            .decide("feature_1", &[]);

        assert_eq!(decision.variables["count"], json!(1));
        assert_eq!(decision.variables["title"], json!("hello"));
        assert_eq!(decision.variables["config"], json!({"k": 1}));
        assert_eq!(decision.variables["ratio"], json!(0.5));
        assert_eq!(decision.variables["on"], json!(true));
    }

    #[test]
    fn cmab_decision_carries_uuid() {
        let (client, batch_rx) = make_client(Some(everything_config()));
        let decision = client
            .create_user_context("tester", hashmap! {"age".into() => json!(30)})
            .decide("feature_cmab", &[]);

        assert_eq!(decision.variation_key, "x");
        assert!(decision.cmab_uuid.is_some());

        let batches = dispatched_batches(&client, &batch_rx);
        let metadata = &batches[0].visitors[0].snapshots[0].decisions[0].metadata;
        assert_eq!(metadata.cmab_uuid, decision.cmab_uuid);
    }

    #[test]
    fn track_sends_conversion_and_notification() {
        let (client, batch_rx) = make_client(Some(everything_config()));
        let tracked = record_notifications(&client, NotificationType::Track);

        client
            .create_user_context("tester", hashmap! {"age".into() => json!(30)})
            .track_event(
                "purchase",
                hashmap! {"revenue".into() => json!(4200), "value".into() => json!(2.5)},
            )
            .unwrap();

        assert_eq!(tracked.lock().len(), 1);
        let batches = dispatched_batches(&client, &batch_rx);
        let event = &batches[0].visitors[0].snapshots[0].events[0];
        assert_eq!(event.key, "purchase");
        assert_eq!(event.revenue, Some(4200));
        assert_eq!(event.value, Some(2.5));
    }

    #[test]
    fn track_unknown_event_is_ignored() {
        let (client, batch_rx) = make_client(Some(s1_config()));
        let result = client.track("missing", "tester", &HashMap::new(), &HashMap::new());

        assert_eq!(result, Ok(()));
        assert!(dispatched_batches(&client, &batch_rx).is_empty());
    }

    #[test]
    fn track_without_datafile_fails() {
        let (client, _rx) = make_client(None);
        let result = client.track("event1", "tester", &HashMap::new(), &HashMap::new());
        assert_eq!(result, Err(ClientError::Config(ConfigError::NotReady)));
    }

    #[test]
    fn track_after_close_skips_notification() {
        let (client, batch_rx) = make_client(Some(everything_config()));
        let tracked = record_notifications(&client, NotificationType::Track);
        client.close();

        let result = client.track("purchase", "tester", &HashMap::new(), &HashMap::new());

        assert_eq!(result, Ok(()));
        assert!(tracked.lock().is_empty());
        assert!(batch_rx.try_iter().next().is_none());
    }

    #[test]
    fn activate_sends_experiment_impression() {
        let (client, batch_rx) = make_client(Some(s1_config()));
        let decided = record_notifications(&client, NotificationType::Decision);

        let variation = client
            .activate("exp_no_audience", "tester", &HashMap::new())
            .unwrap();

        assert_eq!(variation.as_deref(), Some("variation_with_traffic"));
        assert!(matches!(
            &decided.lock()[0],
            Notification::Decision(n) if n.decision_type == "ab-test"
        ));
        let batches = dispatched_batches(&client, &batch_rx);
        let metadata = &batches[0].visitors[0].snapshots[0].decisions[0].metadata;
        assert_eq!(metadata.rule_type, "experiment");
        assert_eq!(metadata.flag_key, "");
    }

    #[test]
    fn get_variation_does_not_send_impressions() {
        let (client, batch_rx) = make_client(Some(s1_config()));

        let variation = client
            .get_variation("exp_no_audience", "tester", &HashMap::new())
            .unwrap();

        assert_eq!(variation.as_deref(), Some("variation_with_traffic"));
        assert!(dispatched_batches(&client, &batch_rx).is_empty());
    }

    #[test]
    fn unknown_experiment_is_an_error() {
        let (client, _rx) = make_client(Some(s1_config()));
        assert_eq!(
            client.activate("missing", "tester", &HashMap::new()),
            Err(ClientError::ExperimentNotFound("missing".into()))
        );
    }

    #[test]
    fn forced_variations_override_bucketing() {
        let (client, _rx) = make_client(Some(s1_config()));

        assert!(client.set_forced_variation("exp_1", "tester", Some("b")));
        assert_eq!(
            client.get_forced_variation("exp_1", "tester").as_deref(),
            Some("b")
        );
        assert_eq!(
            client
                .get_variation("exp_1", "tester", &HashMap::new())
                .unwrap()
                .as_deref(),
            Some("b")
        );

        assert!(!client.set_forced_variation("exp_1", "tester", Some("zzz")));
        assert!(client.set_forced_variation("exp_1", "tester", None));
        assert_eq!(client.get_forced_variation("exp_1", "tester"), None);
    }

    #[test]
    fn legacy_feature_accessors() {
        let (client, _rx) = make_client(Some(s1_config()));
        let decided = record_notifications(&client, NotificationType::Decision);
        let attributes = HashMap::new();

        assert!(client.is_feature_enabled("feature_2", "tester", &attributes));
        assert!(!client.is_feature_enabled("feature_3", "tester", &attributes));
        assert!(!client.is_feature_enabled("missing", "tester", &attributes));

        let enabled = client.get_enabled_features("tester", &attributes);
        assert!(enabled.contains(&"feature_2".to_string()));
        assert!(!enabled.contains(&"feature_3".to_string()));

        assert_eq!(
            client
                .get_feature_variable_string("feature_2", "label", "tester", &attributes)
                .unwrap(),
            "on-value"
        );
        assert!(matches!(
            client.get_feature_variable_integer("feature_2", "label", "tester", &attributes),
            Err(ClientError::VariableTypeMismatch { .. })
        ));
        assert!(matches!(
            client.get_feature_variable_string("feature_2", "missing", "tester", &attributes),
            Err(ClientError::VariableNotFound { .. })
        ));

        let types: Vec<String> = decided
            .lock()
            .iter()
            .filter_map(|n| match n {
                Notification::Decision(d) => Some(d.decision_type.clone()),
                _ => None,
            })
            .collect();
        assert!(types.contains(&"feature".to_string()));
        assert!(types.contains(&"feature-variable".to_string()));
    }

    #[test]
    fn typed_legacy_variables() {
        let (client, _rx) = make_client(Some(everything_config()));
        let attributes = HashMap::new();

        assert_eq!(
            client.get_feature_variable_integer("feature_1", "count", "tester", &attributes),
            Ok(1)
        );
        assert_eq!(
            client.get_feature_variable_double("feature_1", "ratio", "tester", &attributes),
            Ok(0.5)
        );
        assert_eq!(
            client.get_feature_variable_boolean("feature_1", "on", "tester", &attributes),
            Ok(true)
        );
        assert_eq!(
            client.get_feature_variable_json("feature_1", "config", "tester", &attributes),
            Ok(json!({"k": 1}))
        );

        let all = client
            .get_all_feature_variables("feature_1", "tester", &attributes)
            .unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all["title"], json!("hello"));
    }

    #[test]
    fn close_is_idempotent_and_stops_events() {
        let (client, batch_rx) = make_client(Some(s1_config()));
        client.close();
        client.close();

        client
            .create_user_context("tester", HashMap::new())
            .decide("feature_2", &[]);
        assert!(batch_rx.try_iter().next().is_none());
    }

    #[test]
    fn registry_center_is_released_on_close() {
        let manager = Arc::new(MockConfigManager::new(Some(s1_config())));
        let client = Client::build(
            ConfigBuilder::new("client-registry-key")
                .config_manager(MockConfigManagerBuilder::new().config_manager(manager))
                .event_processor(&crate::NullEventProcessorBuilder::new())
                .cmab_client(Arc::new(FakeCmabClient::returning("40001")))
                .segments_fetcher(Arc::new(FakeSegmentsFetcher::returning(&[])))
                .build(),
        )
        .expect("Should be built.");

        let shared = registry::get_notification_center("client-registry-key");
        assert!(Arc::ptr_eq(client.notification_center(), &shared));

        client.close();
        let fresh = registry::get_notification_center("client-registry-key");
        assert!(!Arc::ptr_eq(&shared, &fresh));
        registry::release_notification_center("client-registry-key");
    }

    #[test]
    fn error_boundary_passes_values_through() {
        assert_eq!(error_boundary("op", || 7, |_| 0), 7);
        assert_eq!(
            error_boundary("op", || -> i32 { panic!("bad") }, |m| m.len() as i32),
            3
        );
    }
}
