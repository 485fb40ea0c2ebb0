use super::client::BuildError;
use crate::project_config::Region;

const SDK_KEY_PLACEHOLDER: &str = "{sdk_key}";
const RULE_ID_PLACEHOLDER: &str = "{rule_id}";

const DEFAULT_DATAFILE_URL_TEMPLATE: &str = "https://cdn.optimizely.com/datafiles/{sdk_key}.json";
const DEFAULT_AUTHENTICATED_DATAFILE_URL_TEMPLATE: &str =
    "https://config.optimizely.com/datafiles/auth/{sdk_key}.json";
const DEFAULT_US_EVENTS_URL: &str = "https://logx.optimizely.com/v1/events";
const DEFAULT_EU_EVENTS_URL: &str = "https://eu.logx.optimizely.com/v1/events";
const DEFAULT_CMAB_PREDICTION_URL_TEMPLATE: &str =
    "https://prediction.cmab.optimizely.com/predict/{rule_id}";

/// Specifies the service URLs used by SDK components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoints {
    datafile_url_template: String,
    authenticated_datafile_url_template: String,
    us_events_url: String,
    eu_events_url: String,
    cmab_prediction_url_template: String,
}

impl ServiceEndpoints {
    /// The datafile URL for an SDK key. Authenticated datafiles live on a separate host.
    pub fn datafile_url(&self, sdk_key: &str, authenticated: bool) -> String {
        let template = if authenticated {
            &self.authenticated_datafile_url_template
        } else {
            &self.datafile_url_template
        };
        template.replace(SDK_KEY_PLACEHOLDER, sdk_key)
    }

    pub fn events_url(&self, region: Region) -> &str {
        match region {
            Region::US => &self.us_events_url,
            Region::EU => &self.eu_events_url,
        }
    }

    pub fn cmab_prediction_url_template(&self) -> &str {
        &self.cmab_prediction_url_template
    }
}

impl Default for ServiceEndpoints {
    fn default() -> Self {
        Self {
            datafile_url_template: DEFAULT_DATAFILE_URL_TEMPLATE.into(),
            authenticated_datafile_url_template: DEFAULT_AUTHENTICATED_DATAFILE_URL_TEMPLATE.into(),
            us_events_url: DEFAULT_US_EVENTS_URL.into(),
            eu_events_url: DEFAULT_EU_EVENTS_URL.into(),
            cmab_prediction_url_template: DEFAULT_CMAB_PREDICTION_URL_TEMPLATE.into(),
        }
    }
}

/// Used for configuring the SDK's service URLs.
///
/// The default behavior, if you do not change any of these properties, is that the SDK will
/// connect to the standard production endpoints. Custom URLs are useful when proxying traffic or
/// when connecting to a test fixture.
///
/// # Examples
///
/// Send all events to a local collector.
/// ```
/// # use optimizely_sdk::{ServiceEndpointsBuilder, ConfigBuilder};
/// # fn main() {
///     ConfigBuilder::new("sdk-key").service_endpoints(ServiceEndpointsBuilder::new()
///         .events_url("http://localhost:8080/v1/events"));
/// # }
/// ```
#[derive(Clone, Default)]
pub struct ServiceEndpointsBuilder {
    datafile_url_template: Option<String>,
    authenticated_datafile_url_template: Option<String>,
    us_events_url: Option<String>,
    eu_events_url: Option<String>,
    cmab_prediction_url_template: Option<String>,
}

impl ServiceEndpointsBuilder {
    /// Create a new instance of [ServiceEndpointsBuilder] with no URLs specified.
    pub fn new() -> ServiceEndpointsBuilder {
        ServiceEndpointsBuilder::default()
    }

    /// Sets the datafile URL template. The template must contain `{sdk_key}`.
    pub fn datafile_url_template(&mut self, template: &str) -> &mut Self {
        self.datafile_url_template = Some(template.to_string());
        self
    }

    /// Sets the datafile URL template used when an access token is configured.
    pub fn authenticated_datafile_url_template(&mut self, template: &str) -> &mut Self {
        self.authenticated_datafile_url_template = Some(template.to_string());
        self
    }

    /// Sends events for every region to a single URL.
    pub fn events_url(&mut self, url: &str) -> &mut Self {
        self.us_events_url = Some(url.to_string());
        self.eu_events_url = Some(url.to_string());
        self
    }

    pub fn us_events_url(&mut self, url: &str) -> &mut Self {
        self.us_events_url = Some(url.to_string());
        self
    }

    pub fn eu_events_url(&mut self, url: &str) -> &mut Self {
        self.eu_events_url = Some(url.to_string());
        self
    }

    /// Sets the CMAB prediction URL template. The template must contain `{rule_id}`.
    pub fn cmab_prediction_url_template(&mut self, template: &str) -> &mut Self {
        self.cmab_prediction_url_template = Some(template.to_string());
        self
    }

    /// Called internally by the SDK to create a configuration instance. Applications do not need
    /// to call this method.
    ///
    /// # Errors
    ///
    /// Returns an error when a template is missing its placeholder.
    pub fn build(&self) -> Result<ServiceEndpoints, BuildError> {
        let defaults = ServiceEndpoints::default();
        let endpoints = ServiceEndpoints {
            datafile_url_template: self
                .datafile_url_template
                .clone()
                .unwrap_or(defaults.datafile_url_template),
            authenticated_datafile_url_template: self
                .authenticated_datafile_url_template
                .clone()
                .unwrap_or(defaults.authenticated_datafile_url_template),
            us_events_url: trimmed(&self.us_events_url).unwrap_or(defaults.us_events_url),
            eu_events_url: trimmed(&self.eu_events_url).unwrap_or(defaults.eu_events_url),
            cmab_prediction_url_template: self
                .cmab_prediction_url_template
                .clone()
                .unwrap_or(defaults.cmab_prediction_url_template),
        };

        for (name, template, placeholder) in [
            (
                "datafile URL template",
                &endpoints.datafile_url_template,
                SDK_KEY_PLACEHOLDER,
            ),
            (
                "authenticated datafile URL template",
                &endpoints.authenticated_datafile_url_template,
                SDK_KEY_PLACEHOLDER,
            ),
            (
                "CMAB prediction URL template",
                &endpoints.cmab_prediction_url_template,
                RULE_ID_PLACEHOLDER,
            ),
        ] {
            if !template.contains(placeholder) {
                return Err(BuildError::InvalidConfig(format!(
                    "{} must contain {}",
                    name, placeholder
                )));
            }
        }

        Ok(endpoints)
    }
}

fn trimmed(url: &Option<String>) -> Option<String> {
    url.as_ref()
        .map(|url| url.trim_end_matches('/').to_string())
}
