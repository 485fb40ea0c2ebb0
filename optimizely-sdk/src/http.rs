use std::io;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use hyper::{client::connect::Connection, service::Service, StatusCode, Uri};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Allowance on top of the request timeout for handing the result back to the caller.
const REPLY_GRACE: Duration = Duration::from_millis(500);

/// Whether a failed request may succeed if retried later.
pub fn is_http_error_recoverable(status: u16) -> bool {
    if let Ok(status) = StatusCode::from_u16(status) {
        if !status.is_client_error() {
            return true;
        }

        return matches!(
            status,
            StatusCode::BAD_REQUEST | StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS
        );
    }

    warn!("Unable to determine if status code is recoverable");
    false
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub(crate) enum HttpError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("http worker is not running")]
    WorkerStopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

struct HttpCall {
    request: hyper::Request<hyper::Body>,
    timeout: Duration,
    reply: Sender<Result<HttpResponse, HttpError>>,
}

/// Blocking front of a hyper client, for calls made from synchronous decision paths.
///
/// Requests are served by a dedicated thread owning its own runtime, so callers may block on a
/// response from any context, including from inside another runtime's worker.
pub(crate) struct BlockingHttpClient {
    calls: Sender<HttpCall>,
}

impl BlockingHttpClient {
    pub fn new<C>(connector: C, name: &str) -> io::Result<Self>
    where
        C: Service<Uri> + Clone + Send + Sync + 'static,
        C::Response: Connection + AsyncRead + AsyncWrite + Send + Unpin,
        C::Future: Send + Unpin + 'static,
        C::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (calls, inbox) = crossbeam_channel::unbounded::<HttpCall>();
        let http = hyper::Client::builder().build::<_, hyper::Body>(connector);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(format!("{}-io", name))
            .enable_all()
            .build()?;

        thread::Builder::new().name(name.into()).spawn(move || {
            // Exits once every handle is dropped.
            while let Ok(call) = inbox.recv() {
                let http = http.clone();
                runtime.spawn(async move {
                    let result = tokio::time::timeout(call.timeout, async {
                        let response = http
                            .request(call.request)
                            .await
                            .map_err(|e| HttpError::Transport(e.to_string()))?;
                        let status = response.status().as_u16();
                        let body = hyper::body::to_bytes(response.into_body())
                            .await
                            .map_err(|e| HttpError::Transport(e.to_string()))?;
                        Ok::<_, HttpError>(HttpResponse {
                            status,
                            body: body.to_vec(),
                        })
                    })
                    .await
                    .unwrap_or(Err(HttpError::Timeout));
                    let _ = call.reply.send(result);
                });
            }
            runtime.shutdown_background();
        })?;

        Ok(Self { calls })
    }

    /// POSTs a JSON body and blocks until the response arrives or `timeout` passes.
    pub fn post_json(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<HttpResponse, HttpError> {
        let mut request_builder = hyper::Request::builder()
            .uri(url)
            .method("POST")
            .header("Content-Type", "application/json")
            .header("User-Agent", &*crate::USER_AGENT);
        for (name, value) in headers {
            request_builder = request_builder.header(*name, *value);
        }
        let request = request_builder
            .body(hyper::Body::from(body))
            .map_err(|e| HttpError::Transport(e.to_string()))?;

        let (reply, response) = bounded(1);
        self.calls
            .send(HttpCall {
                request,
                timeout,
                reply,
            })
            .map_err(|_| HttpError::WorkerStopped)?;

        response
            .recv_timeout(timeout + REPLY_GRACE)
            .map_err(|_| HttpError::Timeout)?
    }
}
