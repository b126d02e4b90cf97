//! `reqwest` implementation of [`Transport`].

use super::{HttpResponse, SCANNER_KEY_HEADER, Transport, TransportError, TransportFuture};
use std::time::Duration;

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Request(err.to_string())
        }
    }
}

/// HTTPS transport backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport whose requests give up after `timeout`.
    ///
    /// # Errors
    /// Returns a `reqwest::Error` if the TLS backend cannot be initialised.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn post_json<'a>(
        &'a self,
        url: &'a str,
        scanner_key: &'a str,
        body: &'a serde_json::Value,
    ) -> TransportFuture<'a> {
        Box::pin(async move {
            let response = self
                .client
                .post(url)
                .header(SCANNER_KEY_HEADER, scanner_key)
                .json(body)
                .send()
                .await?;

            let status = response.status().as_u16();
            // The status already arrived; an unreadable body does not make this a network failure.
            let body = match response.text().await {
                Ok(body) => body,
                Err(error) => {
                    tracing::debug!(%url, %error, "failed to read response body");
                    String::new()
                }
            };

            Ok::<_, TransportError>(HttpResponse { status, body })
        })
    }
}
