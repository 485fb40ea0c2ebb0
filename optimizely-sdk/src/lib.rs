//! optimizely-sdk is the main crate for the Optimizely feature flag and experimentation SDK.
//!
//! This package contains the SDK [Client], its overall configuration, and the [UserContext]
//! through which flags are decided and conversions are tracked.
//!
//! The client keeps the current datafile fresh in the background, buckets users into
//! experiments and rollouts, and sends impression and conversion events in batches.

#![deny(rustdoc::missing_crate_level_docs)]

#[macro_use]
extern crate log;

use lazy_static::lazy_static;

pub use client::Client;

// Re-export
pub use client::{BuildError, ClientError, StartError};
pub use config::{Config, ConfigBuilder};
pub use config_manager::manager::ProjectConfigManager;
pub use config_manager::manager_builders::{
    BuildError as ConfigManagerBuildError, PollingConfigManagerBuilder,
    ProjectConfigManagerFactory, StaticConfigManagerBuilder,
};
pub use config_manager::requester_builders::DatafileRequesterFactory;
pub use decision::cmab::{CmabClient, CmabConfig};
pub use decision::forced_decisions::{DecisionContext, ForcedDecision};
pub use decision::options::DecideOption;
pub use decision::user_profile::{UserProfile, UserProfileService};
pub use events::batch::EventBatch;
pub use events::dispatcher::{EventDispatcher, LogEvent};
pub use events::processor::EventProcessor;
pub use events::processor_builders::{
    BuildError as EventProcessorBuildError, EventProcessorBuilder, EventProcessorFactory,
    NullEventProcessorBuilder,
};
pub use notification::{Notification, NotificationCenter, NotificationType};
pub use odp::{OdpConfig, OdpError, OdpSegmentOption, SegmentsFetcher};
pub use project_config::{ConfigError, ProjectConfig, Region};
pub use service_endpoints::ServiceEndpointsBuilder;
pub use user_context::{OptimizelyDecision, UserContext};
pub use version::version_string;

mod client;
mod config;
mod config_manager;
mod decision;
mod events;
mod http;
#[cfg(feature = "rustls")]
mod https_connector;
mod notification;
mod odp;
mod project_config;
mod service_endpoints;
mod test_common;
mod user_context;
mod version;

/// Name reported as the client of every event batch.
pub(crate) const CLIENT_NAME: &str = "rust-sdk";

lazy_static! {
    pub(crate) static ref USER_AGENT: String = format!("{}/{}", CLIENT_NAME, version_string());
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    #[test_case("130.65331632653061", 130.65331632653061)]
    #[test_case("130.65331632653062", 130.65331632653061)]
    #[test_case("130.65331632653063", 130.65331632653064)]
    fn json_float_parsing_is_exact(float_as_string: &str, expected: f64) {
        let parsed: f64 = serde_json::from_str(float_as_string).unwrap();
        assert_eq!(expected, parsed);
    }

    #[test]
    fn user_agent_names_the_sdk() {
        assert!(super::USER_AGENT.starts_with("rust-sdk/"));
    }
}
