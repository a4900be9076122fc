// Networking engine: a request dispatcher with pluggable schemes, ordered
// URI fallback, filters, retries, and bandwidth observation.

mod data_uri;
mod http;
pub mod retry;

pub use data_uri::DataUriPlugin;
pub use http::HttpPlugin;
pub use retry::RetryParameters;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::error::{ErrorDetail, PlayerError};

/// What a request is for; observers and filters can discriminate on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Manifest,
    Segment,
    License,
    Timing,
}

#[derive(Debug, Clone)]
pub struct Request {
    /// Ordered fallback URIs; the next one is tried when an attempt fails.
    pub uris: Vec<String>,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Bytes>,
    pub retry: RetryParameters,
}

impl Request {
    pub fn get(uris: Vec<String>, retry: RetryParameters) -> Self {
        Self {
            uris,
            method: "GET".to_string(),
            headers: HashMap::new(),
            body: None,
            retry,
        }
    }

    pub fn post(uri: String, body: Bytes, retry: RetryParameters) -> Self {
        Self {
            uris: vec![uri],
            method: "POST".to_string(),
            headers: HashMap::new(),
            body: Some(body),
            retry,
        }
    }

    pub fn with_header(mut self, name: &str, value: String) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value);
        self
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    /// The URI that actually served the response.
    pub uri: String,
    pub data: Bytes,
    pub headers: HashMap<String, String>,
    /// Wall time the attempt took, for bandwidth estimation.
    pub elapsed: Duration,
}

/// One URI scheme handler (`http`, `https`, `data`, test schemes).
#[async_trait]
pub trait SchemePlugin: Send + Sync {
    async fn request(&self, uri: &Url, request: &Request) -> Result<Response, PlayerError>;
}

pub type RequestFilter =
    Arc<dyn Fn(RequestType, &mut Request) -> Result<(), PlayerError> + Send + Sync>;
pub type ResponseFilter =
    Arc<dyn Fn(RequestType, &mut Response) -> Result<(), PlayerError> + Send + Sync>;
/// Called with `(request type, elapsed ms, transferred bytes)` after each
/// successful response. ABR listens here.
pub type BandwidthObserver = Arc<dyn Fn(RequestType, u64, usize) + Send + Sync>;

/// The request dispatcher. Scheme plugins are registered up front and the
/// registry is effectively immutable during playback.
pub struct NetworkingEngine {
    schemes: RwLock<HashMap<String, Arc<dyn SchemePlugin>>>,
    request_filters: RwLock<Vec<RequestFilter>>,
    response_filters: RwLock<Vec<ResponseFilter>>,
    observers: RwLock<Vec<BandwidthObserver>>,
}

impl Default for NetworkingEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkingEngine {
    /// Creates an engine with the built-in `http`, `https`, and `data`
    /// plugins registered.
    pub fn new() -> Self {
        let engine = Self::empty();
        let http = Arc::new(HttpPlugin::new());
        engine.register_scheme("http", http.clone());
        engine.register_scheme("https", http);
        engine.register_scheme("data", Arc::new(DataUriPlugin));
        engine
    }

    /// Creates an engine with no plugins; tests register their own.
    pub fn empty() -> Self {
        Self {
            schemes: RwLock::new(HashMap::new()),
            request_filters: RwLock::new(Vec::new()),
            response_filters: RwLock::new(Vec::new()),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn register_scheme(&self, scheme: &str, plugin: Arc<dyn SchemePlugin>) {
        self.schemes
            .write()
            .insert(scheme.to_ascii_lowercase(), plugin);
    }

    pub fn add_request_filter(&self, filter: RequestFilter) {
        self.request_filters.write().push(filter);
    }

    pub fn add_response_filter(&self, filter: ResponseFilter) {
        self.response_filters.write().push(filter);
    }

    pub fn add_observer(&self, observer: BandwidthObserver) {
        self.observers.write().push(observer);
    }

    fn plugin_for(&self, uri: &Url) -> Result<Arc<dyn SchemePlugin>, PlayerError> {
        self.schemes
            .read()
            .get(uri.scheme())
            .cloned()
            .ok_or_else(|| {
                PlayerError::critical(ErrorDetail::UnsupportedScheme {
                    scheme: uri.scheme().to_string(),
                })
            })
    }

    /// Dispatches a request with retries.
    ///
    /// Within one attempt every fallback URI is tried in order; only after
    /// all of them fail does the attempt counter advance and the backoff
    /// delay apply. Cancellation is polled before every attempt and raced
    /// against in-flight I/O.
    pub async fn request(
        &self,
        request_type: RequestType,
        mut request: Request,
        token: &CancellationToken,
    ) -> Result<Response, PlayerError> {
        for filter in self.request_filters.read().clone() {
            filter(request_type, &mut request)?;
        }
        if request.uris.is_empty() {
            return Err(PlayerError::critical(ErrorDetail::HttpError {
                uri: String::new(),
                reason: "request has no URIs".to_string(),
            }));
        }

        let retry = request.retry.clone();
        let mut last_error: Option<PlayerError> = None;
        for attempt in 0..retry.max_attempts.max(1) {
            if attempt > 0 {
                let delay = retry.delay_for_retry(attempt - 1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying request");
                tokio::select! {
                    _ = token.cancelled() => return Err(PlayerError::aborted()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if token.is_cancelled() {
                return Err(PlayerError::aborted());
            }

            for uri_str in request.uris.clone() {
                let uri = match Url::parse(&uri_str) {
                    Ok(uri) => uri,
                    Err(e) => {
                        last_error = Some(PlayerError::critical(ErrorDetail::HttpError {
                            uri: uri_str.clone(),
                            reason: format!("invalid URI: {e}"),
                        }));
                        continue;
                    }
                };
                let plugin = match self.plugin_for(&uri) {
                    Ok(plugin) => plugin,
                    Err(e) => {
                        last_error = Some(e);
                        continue;
                    }
                };

                let started = Instant::now();
                let attempt_future = plugin.request(&uri, &request);
                let outcome = match retry.timeout {
                    Some(timeout) => {
                        tokio::select! {
                            _ = token.cancelled() => return Err(PlayerError::aborted()),
                            result = tokio::time::timeout(timeout, attempt_future) => match result {
                                Ok(result) => result,
                                Err(_) => Err(PlayerError::recoverable(ErrorDetail::Timeout {
                                    uri: uri_str.clone(),
                                })),
                            },
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = token.cancelled() => return Err(PlayerError::aborted()),
                            result = attempt_future => result,
                        }
                    }
                };

                match outcome {
                    Ok(mut response) => {
                        response.elapsed = started.elapsed();
                        for filter in self.response_filters.read().clone() {
                            filter(request_type, &mut response)?;
                        }
                        let elapsed_ms = response.elapsed.as_millis() as u64;
                        for observer in self.observers.read().clone() {
                            observer(request_type, elapsed_ms, response.data.len());
                        }
                        return Ok(response);
                    }
                    Err(error) => {
                        warn!(uri = %uri_str, error = %error, "Request attempt failed");
                        last_error = Some(error);
                    }
                }
            }

            // A pass where the final failure is non-retryable will not be
            // cured by another pass over the same URIs.
            if let Some(error) = &last_error {
                if !error.detail.is_retryable() {
                    break;
                }
            }
        }

        Err(last_error.unwrap_or_else(PlayerError::aborted))
    }
}
