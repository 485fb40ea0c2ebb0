use std::collections::HashMap;
use std::time::Duration;

use futures::future::BoxFuture;
use hyper::{client::connect::Connection, service::Service, StatusCode, Uri};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use super::batch::EventBatch;

/// A fully addressed batch, ready to be sent to the event endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub endpoint_url: String,
    pub http_verb: String,
    pub headers: HashMap<String, String>,
    pub body: EventBatch,
}

impl LogEvent {
    pub fn new(endpoint_url: impl Into<String>, body: EventBatch) -> Self {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        Self {
            endpoint_url: endpoint_url.into(),
            http_verb: "POST".to_string(),
            headers,
            body,
        }
    }
}

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to serialize event batch: {0}")]
    Serialization(String),

    #[error("failed to send event batch: {0}")]
    Transport(String),

    #[error("event endpoint responded with status {0}")]
    UnexpectedStatus(u16),
}

/// Sends a [LogEvent] to its endpoint. Implementations must treat anything other than an explicit
/// acknowledgement from the endpoint as a failure so the batch stays queued.
pub trait EventDispatcher: Send + Sync {
    fn dispatch_event(&self, event: LogEvent) -> BoxFuture<'_, Result<(), DispatchError>>;
}

/// Upper bound on a single dispatch attempt, from connect through response headers.
pub(crate) const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct HyperEventDispatcher<C> {
    http: hyper::Client<C>,
    timeout: Duration,
}

impl<C> HyperEventDispatcher<C>
where
    C: Service<Uri> + Clone + Send + Sync + 'static,
    C::Response: Connection + AsyncRead + AsyncWrite + Send + Unpin,
    C::Future: Send + Unpin + 'static,
    C::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    pub fn new(connector: C) -> Self {
        Self::with_timeout(connector, DEFAULT_DISPATCH_TIMEOUT)
    }

    pub fn with_timeout(connector: C, timeout: Duration) -> Self {
        Self {
            http: hyper::Client::builder().build(connector),
            timeout,
        }
    }
}

impl<C> EventDispatcher for HyperEventDispatcher<C>
where
    C: Service<Uri> + Clone + Send + Sync + 'static,
    C::Response: Connection + AsyncRead + AsyncWrite + Send + Unpin,
    C::Future: Send + Unpin + 'static,
    C::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn dispatch_event(&self, event: LogEvent) -> BoxFuture<'_, Result<(), DispatchError>> {
        Box::pin(async move {
            let payload = serde_json::to_vec(&event.body)
                .map_err(|e| DispatchError::Serialization(e.to_string()))?;

            debug!(
                "Sending batch of {} visitors to {}",
                event.body.visitors.len(),
                event.endpoint_url
            );

            let mut request_builder = hyper::Request::builder()
                .uri(event.endpoint_url.as_str())
                .method(event.http_verb.as_str())
                .header("User-Agent", &*crate::USER_AGENT);
            for (name, value) in &event.headers {
                request_builder = request_builder.header(name.as_str(), value.as_str());
            }
            let request = request_builder
                .body(hyper::Body::from(payload))
                .map_err(|e| DispatchError::Transport(e.to_string()))?;

            let response = tokio::time::timeout(self.timeout, self.http.request(request))
                .await
                .map_err(|_| {
                    DispatchError::Transport(format!("no response within {:?}", self.timeout))
                })?
                .map_err(|e| DispatchError::Transport(e.to_string()))?;

            match response.status() {
                StatusCode::NO_CONTENT => Ok(()),
                status => {
                    if !crate::http::is_http_error_recoverable(status.as_u16()) {
                        warn!("Event endpoint rejected batch with status {}", status);
                    }
                    Err(DispatchError::UnexpectedStatus(status.as_u16()))
                }
            }
        })
    }
}
