//! Remote verification of beacon sightings.
//!
//! [`VerificationClient`] posts frames to the verifier and classifies the
//! result. Only transport failures (timeouts, refused connections) are
//! retried, with exponential backoff between attempts; any HTTP response,
//! including an error status, is final.
//!
//! The HTTP call itself sits behind the [`Transport`] trait so the retry and
//! classification logic can be tested without a network.

pub mod http;

use crate::beacon::BeaconFrame;
use crate::diagnostics::Diagnostics;
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Header carrying the scanner's secret key.
pub const SCANNER_KEY_HEADER: &str = "x-scanner-key";

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(12);
pub const DEFAULT_HTTP_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(600);

/// A received HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Network-level failures. All of them are retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Request(String),
}

pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<HttpResponse, TransportError>> + Send + 'a>>;

/// HTTP boundary: POST a JSON body with the scanner key header.
pub trait Transport: Send + Sync {
    fn post_json<'a>(
        &'a self,
        url: &'a str,
        scanner_key: &'a str,
        body: &'a serde_json::Value,
    ) -> TransportFuture<'a>;
}

/// Timeout and retry settings for every remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    /// Limit for a single attempt
    pub timeout: Duration,
    /// Delay after the first failed attempt; doubles after each further failure
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_HTTP_RETRIES,
            timeout: DEFAULT_HTTP_TIMEOUT,
            base_delay: DEFAULT_RETRY_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Backoff after the failed attempt numbered `attempt` (zero based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(31)))
    }
}

/// Who this scanner is and where the verifier lives.
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    pub base_url: String,
    pub verify_path: String,
    pub validate_path: String,
    pub gym_id: u64,
    pub scanner_id: String,
    pub scanner_key: String,
    pub retry: RetryPolicy,
}

/// How a failed verification failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No response after every attempt
    NetworkFailure,
    /// The verifier answered with a non-2xx status
    RemoteRejection,
}

/// Result of verifying one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum VerificationOutcome {
    Ok {
        status_code: u16,
        body: String,
    },
    Err {
        status_code: Option<u16>,
        message: String,
        kind: FailureKind,
    },
}

impl VerificationOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, VerificationOutcome::Ok { .. })
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            VerificationOutcome::Ok { status_code, .. } => Some(*status_code),
            VerificationOutcome::Err { status_code, .. } => *status_code,
        }
    }
}

/// Successful credential preflight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialCheck {
    pub status_code: u16,
    /// Non-secret label of the active key, when the verifier sends one
    pub key_hint: Option<String>,
}

/// Failed credential preflight. Scanning must not start.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CredentialError {
    #[error("key validation network error: {cause} (timeout={timeout:?}, retries={attempts})")]
    Network {
        cause: TransportError,
        timeout: Duration,
        attempts: u32,
    },
    #[error("Invalid scanner key (401).")]
    Unauthorized,
    #[error("Validation endpoint not found (404). Deploy the scanner validation function.")]
    EndpointMissing,
    #[error("key validation failed: status={status} -> {body}")]
    Rejected { status: u16, body: String },
}

impl CredentialError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            CredentialError::Network { .. } => None,
            CredentialError::Unauthorized => Some(401),
            CredentialError::EndpointMissing => Some(404),
            CredentialError::Rejected { status, .. } => Some(*status),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    #[serde(default)]
    key_hint: Option<String>,
}

/// Client for the verify and validate endpoints.
pub struct VerificationClient {
    transport: Arc<dyn Transport>,
    config: VerifierConfig,
    diagnostics: Arc<Diagnostics>,
}

impl VerificationClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: VerifierConfig,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            transport,
            config,
            diagnostics,
        }
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// POST `body`, retrying transport failures per the retry policy.
    async fn post_with_retries(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<HttpResponse, TransportError> {
        let policy = self.config.retry;
        let attempts = policy.attempts.max(1);
        let mut attempt = 0;

        loop {
            let call = self
                .transport
                .post_json(url, &self.config.scanner_key, body);
            let result = match tokio::time::timeout(policy.timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            };

            match result {
                Ok(response) => return Ok(response),
                Err(error) if attempt + 1 < attempts => {
                    let delay = policy.delay_after(attempt);
                    tracing::debug!(
                        %url,
                        attempt = attempt + 1,
                        attempts,
                        ?delay,
                        %error,
                        "request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Ask the verifier to accept `frame`. Updates the verify counters.
    pub async fn verify(&self, frame: &BeaconFrame) -> VerificationOutcome {
        self.diagnostics.record_verify_sent();

        let url = self.endpoint(&self.config.verify_path);
        let body = json!({
            "user_id": frame.user_id(),
            "gym_id": self.config.gym_id,
            "token_u32": frame.token(),
            "scanner_id": self.config.scanner_id,
            "rssi": frame.rssi(),
        });

        let outcome = match self.post_with_retries(&url, &body).await {
            Err(error) => VerificationOutcome::Err {
                status_code: None,
                message: format!("network error: {error}"),
                kind: FailureKind::NetworkFailure,
            },
            Ok(response) if response.is_success() => VerificationOutcome::Ok {
                status_code: response.status,
                body: response.body,
            },
            Ok(response) if response.status == 401 => VerificationOutcome::Err {
                status_code: Some(401),
                message: format!(
                    "Unauthorized (401). Check the scanner key and that this scanner is registered as active for gym_id={} and scanner_id={}.",
                    self.config.gym_id, self.config.scanner_id
                ),
                kind: FailureKind::RemoteRejection,
            },
            Ok(response) => VerificationOutcome::Err {
                status_code: Some(response.status),
                message: format!("status={} -> {}", response.status, response.body),
                kind: FailureKind::RemoteRejection,
            },
        };

        match &outcome {
            VerificationOutcome::Ok { status_code, body } => {
                self.diagnostics.record_verify_ok(*status_code, body.clone());
            }
            VerificationOutcome::Err {
                status_code,
                message,
                ..
            } => {
                self.diagnostics.record_verify_err(*status_code, message.clone());
            }
        }

        outcome
    }

    /// Preflight check that `(gym_id, scanner_id, key)` is registered and active.
    ///
    /// # Errors
    /// Returns a [`CredentialError`] for any non-2xx answer or when the
    /// verifier cannot be reached.
    pub async fn validate_credentials(&self) -> Result<CredentialCheck, CredentialError> {
        let url = self.endpoint(&self.config.validate_path);
        let body = json!({
            "gym_id": self.config.gym_id,
            "scanner_id": self.config.scanner_id,
        });

        let result = match self.post_with_retries(&url, &body).await {
            Err(cause) => Err(CredentialError::Network {
                cause,
                timeout: self.config.retry.timeout,
                attempts: self.config.retry.attempts.max(1),
            }),
            Ok(response) if response.is_success() => {
                let key_hint = serde_json::from_str::<ValidateResponse>(&response.body)
                    .ok()
                    .and_then(|r| r.key_hint)
                    .map(|hint| hint.trim().to_string())
                    .filter(|hint| !hint.is_empty());
                Ok(CredentialCheck {
                    status_code: response.status,
                    key_hint,
                })
            }
            Ok(response) if response.status == 401 => Err(CredentialError::Unauthorized),
            Ok(response) if response.status == 404 => Err(CredentialError::EndpointMissing),
            Ok(response) => Err(CredentialError::Rejected {
                status: response.status,
                body: response.body,
            }),
        };

        match &result {
            Ok(check) => {
                self.diagnostics
                    .record_remote_ok(Some(check.status_code), "scanner key validated");
                self.diagnostics.record_key_hint(check.key_hint.clone());
            }
            Err(error) => {
                self.diagnostics
                    .record_remote_err(error.status_code(), error.to_string());
            }
        }

        result
    }
}
