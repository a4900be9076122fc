// `data:` URI scheme plugin, used for inline manifests, clear keys, and
// test fixtures.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use data_url::DataUrl;
use url::Url;

use crate::error::{ErrorDetail, PlayerError};
use crate::net::{Request, Response, SchemePlugin};

pub struct DataUriPlugin;

#[async_trait]
impl SchemePlugin for DataUriPlugin {
    async fn request(&self, uri: &Url, _request: &Request) -> Result<Response, PlayerError> {
        let parsed = DataUrl::process(uri.as_str())
            .map_err(|_| PlayerError::critical(ErrorDetail::MalformedDataUri))?;
        let (body, _fragment) = parsed
            .decode_to_vec()
            .map_err(|_| PlayerError::critical(ErrorDetail::UnknownDataUriEncoding))?;

        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), parsed.mime_type().to_string());

        Ok(Response {
            uri: uri.to_string(),
            data: Bytes::from(body),
            headers,
            elapsed: Duration::ZERO,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::RetryParameters;

    fn request_for(uri: &str) -> (Url, Request) {
        (
            Url::parse(uri).unwrap(),
            Request::get(vec![uri.to_string()], RetryParameters::no_retries()),
        )
    }

    #[tokio::test]
    async fn decodes_base64_payload() {
        let (uri, request) = request_for("data:text/plain;base64,aGVsbG8=");
        let response = DataUriPlugin.request(&uri, &request).await.unwrap();
        assert_eq!(&response.data[..], b"hello");
        assert_eq!(response.headers["content-type"], "text/plain");
    }

    #[tokio::test]
    async fn decodes_percent_encoded_payload() {
        let (uri, request) = request_for("data:,hello%20world");
        let response = DataUriPlugin.request(&uri, &request).await.unwrap();
        assert_eq!(&response.data[..], b"hello world");
    }

    #[tokio::test]
    async fn malformed_uri_is_reported() {
        let (uri, request) = request_for("data:text/plain");
        let error = DataUriPlugin.request(&uri, &request).await.unwrap_err();
        assert_eq!(error.code(), 1004);
    }

    #[tokio::test]
    async fn bad_base64_is_an_encoding_error() {
        let (uri, request) = request_for("data:;base64,!!!not-base64!!!");
        let error = DataUriPlugin.request(&uri, &request).await.unwrap_err();
        assert_eq!(error.code(), 1005);
    }
}
