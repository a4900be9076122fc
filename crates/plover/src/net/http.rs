// HTTP(S) scheme plugin over reqwest.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

use crate::error::{ErrorDetail, PlayerError};
use crate::net::{Request, Response, SchemePlugin};

pub struct HttpPlugin {
    client: reqwest::Client,
}

impl Default for HttpPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpPlugin {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SchemePlugin for HttpPlugin {
    async fn request(&self, uri: &Url, request: &Request) -> Result<Response, PlayerError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|_| {
            PlayerError::critical(ErrorDetail::HttpError {
                uri: uri.to_string(),
                reason: format!("invalid method {}", request.method),
            })
        })?;

        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            let Ok(value) = HeaderValue::from_str(value) else {
                continue;
            };
            headers.insert(name, value);
        }

        let mut builder = self.client.request(method, uri.clone()).headers(headers);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let http_error = |reason: String| {
            PlayerError::recoverable(ErrorDetail::HttpError {
                uri: uri.to_string(),
                reason,
            })
        };

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                PlayerError::recoverable(ErrorDetail::Timeout { uri: uri.to_string() })
            } else {
                http_error(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PlayerError::recoverable(ErrorDetail::BadHttpStatus {
                uri: uri.to_string(),
                status: status.as_u16(),
            }));
        }

        let mut response_headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                response_headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
            }
        }
        let final_uri = response.url().to_string();
        let data = response.bytes().await.map_err(|e| http_error(e.to_string()))?;

        Ok(Response {
            uri: final_uri,
            data,
            headers: response_headers,
            elapsed: Duration::ZERO,
        })
    }
}
