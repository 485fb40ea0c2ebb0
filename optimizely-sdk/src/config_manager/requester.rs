use crate::http::is_http_error_recoverable;
use futures::future::BoxFuture;
use hyper::Body;
use std::sync::Arc;

#[derive(Debug, PartialEq, Eq)]
pub enum DatafileRequesterError {
    Temporary,
    Permanent,
}

/// Fetches the raw datafile. `Ok(None)` means the datafile has not changed since the last
/// successful fetch.
pub trait DatafileRequester: Send {
    fn get_datafile(&mut self) -> BoxFuture<'_, Result<Option<Vec<u8>>, DatafileRequesterError>>;
}

pub struct HyperDatafileRequester<C> {
    http: Arc<hyper::Client<C>>,
    url: hyper::Uri,
    access_token: Option<String>,
    etag: Option<String>,
}

impl<C> HyperDatafileRequester<C> {
    pub fn new(http: hyper::Client<C>, url: hyper::Uri, access_token: Option<String>) -> Self {
        Self {
            http: Arc::new(http),
            url,
            access_token,
            etag: None,
        }
    }
}

impl<C> DatafileRequester for HyperDatafileRequester<C>
where
    C: hyper::client::connect::Connect + Clone + Send + Sync + 'static,
{
    fn get_datafile(&mut self) -> BoxFuture<'_, Result<Option<Vec<u8>>, DatafileRequesterError>> {
        Box::pin(async move {
            let http = self.http.clone();

            let mut request_builder = hyper::http::Request::builder()
                .uri(self.url.clone())
                .method("GET")
                .header("User-Agent", &*crate::USER_AGENT);

            if let Some(token) = &self.access_token {
                request_builder = request_builder.header("Authorization", format!("Bearer {}", token));
            }

            if let Some(etag) = &self.etag {
                request_builder = request_builder.header("If-None-Match", etag.as_str());
            }

            let request = match request_builder.body(Body::empty()) {
                Ok(request) => request,
                Err(e) => {
                    error!("Unable to build datafile request: {}", e);
                    return Err(DatafileRequesterError::Permanent);
                }
            };

            let response = match http.request(request).await {
                Ok(response) => response,
                Err(e) => {
                    // Not an HTTP error: closed connection, aborted write, timeout, etc.
                    error!("An error occurred while retrieving the datafile: {}", e);
                    return Err(DatafileRequesterError::Temporary);
                }
            };

            if response.status() == hyper::StatusCode::NOT_MODIFIED && self.etag.is_some() {
                debug!("Datafile has not been modified");
                return Ok(None);
            }

            if response.status().is_success() {
                let etag = response
                    .headers()
                    .get("etag")
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string);

                return match hyper::body::to_bytes(response.into_body()).await {
                    Ok(bytes) => {
                        if let Some(etag) = etag.filter(|etag| !etag.is_empty()) {
                            debug!("Caching etag for future requests: {}", etag);
                            self.etag = Some(etag);
                        }
                        Ok(Some(bytes.to_vec()))
                    }
                    Err(e) => {
                        error!("An error occurred while reading the datafile body: {}", e);
                        Err(DatafileRequesterError::Temporary)
                    }
                };
            }

            error!(
                "An error occurred while retrieving the datafile. (status: {})",
                response.status().as_str()
            );

            if !is_http_error_recoverable(response.status().as_u16()) {
                return Err(DatafileRequesterError::Permanent);
            }

            Err(DatafileRequesterError::Temporary)
        })
    }
}
