use super::requester::{DatafileRequester, HyperDatafileRequester};
use std::str::FromStr;
use thiserror::Error;

/// Error type used to represent failures when building a [DatafileRequesterFactory] instance.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BuildError {
    /// Error used when a configuration setting is invalid.
    #[error("datafile requester factory failed to build: {0}")]
    InvalidConfig(String),
}

/// Trait which allows creation of datafile requesters.
///
/// Datafile requesters are used by the polling config manager (see
/// [crate::PollingConfigManagerBuilder]) to retrieve the datafile from the CDN or a proxy.
pub trait DatafileRequesterFactory: Send {
    /// Create an instance of DatafileRequester.
    fn build(
        &self,
        url: &str,
        access_token: Option<String>,
    ) -> Result<Box<dyn DatafileRequester>, BuildError>;
}

#[derive(Clone, Default)]
pub struct HyperDatafileRequesterBuilder {}

impl HyperDatafileRequesterBuilder {
    pub fn new() -> Self {
        Self {}
    }
}

impl DatafileRequesterFactory for HyperDatafileRequesterBuilder {
    fn build(
        &self,
        url: &str,
        access_token: Option<String>,
    ) -> Result<Box<dyn DatafileRequester>, BuildError> {
        let url = hyper::Uri::from_str(url)
            .map_err(|_| BuildError::InvalidConfig("Invalid datafile url provided".into()))?;

        build_requester(url, access_token)
    }
}

#[cfg(feature = "rustls")]
fn build_requester(
    url: hyper::Uri,
    access_token: Option<String>,
) -> Result<Box<dyn DatafileRequester>, BuildError> {
    let http = hyper::Client::builder().build(crate::https_connector::create_https_connector());
    Ok(Box::new(HyperDatafileRequester::new(
        http,
        url,
        access_token,
    )))
}

#[cfg(not(feature = "rustls"))]
fn build_requester(
    url: hyper::Uri,
    access_token: Option<String>,
) -> Result<Box<dyn DatafileRequester>, BuildError> {
    if url.scheme_str() == Some("https") {
        return Err(BuildError::InvalidConfig(
            "https datafile urls require the rustls feature".into(),
        ));
    }
    let http = hyper::Client::builder().build(hyper::client::HttpConnector::new());
    Ok(Box::new(HyperDatafileRequester::new(
        http,
        url,
        access_token,
    )))
}
