//! HTTP client for webhook delivery with a hard per-attempt timeout.
//!
//! Sends the stored body verbatim with the signed headers and classifies the
//! result. Only a 2xx response counts as delivered; any other status, a
//! connection error or a timeout is a failed attempt.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::{
    error::{DeliveryError, ErrorCategory},
    signer::SignedHeaders,
};

/// Product user agent sent with every attempt.
pub const DEFAULT_USER_AGENT: &str = "Herald-Webhook/1.0";

/// Longest response body kept for `last_error`.
const MAX_ERROR_BODY_BYTES: usize = 1024;

/// Configuration for the webhook delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Hard limit for one attempt, connect through body read.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(30), user_agent: DEFAULT_USER_AGENT.to_string() }
    }
}

/// Classified result of one delivery attempt.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    /// Endpoint answered 2xx.
    Delivered {
        /// HTTP status code
        status_code: u16,
        /// Time from send to response
        duration: Duration,
    },
    /// Anything else.
    Failed {
        /// What went wrong
        error: DeliveryError,
        /// Time until the failure was observed
        duration: Duration,
    },
}

impl AttemptOutcome {
    /// Creates a failed outcome observed without a network round trip.
    pub fn failed(error: DeliveryError) -> Self {
        Self::Failed { error, duration: Duration::ZERO }
    }

    /// Returns true for a 2xx response.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    /// HTTP status code, if a response was received.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Delivered { status_code, .. } => Some(*status_code),
            Self::Failed { error, .. } => error.status_code(),
        }
    }

    /// Description stored as `last_error` for failed attempts.
    pub fn error_message(&self) -> Option<String> {
        match self {
            Self::Delivered { .. } => None,
            Self::Failed { error: DeliveryError::HttpStatus { status_code, body }, .. }
                if !body.is_empty() =>
            {
                Some(format!("endpoint responded with HTTP {status_code}: {body}"))
            },
            Self::Failed { error, .. } => Some(error.to_string()),
        }
    }

    /// Elapsed time of the attempt.
    pub fn duration(&self) -> Duration {
        match self {
            Self::Delivered { duration, .. } | Self::Failed { duration, .. } => *duration,
        }
    }

    /// Error category of a failed attempt.
    pub fn error_category(&self) -> Option<ErrorCategory> {
        match self {
            Self::Delivered { .. } => None,
            Self::Failed { error, .. } => Some(ErrorCategory::from(error)),
        }
    }
}

/// HTTP client shared by all delivery tasks.
///
/// Redirects are not followed: a 3xx is a non-2xx outcome.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be configured with the provided settings.
    pub fn new(config: ClientConfig) -> Result<Self, DeliveryError> {
        if config.timeout.is_zero() {
            return Err(DeliveryError::configuration("request timeout must be positive"));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a new delivery client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the TLS backend fails
    /// to initialize.
    pub fn with_defaults() -> Result<Self, DeliveryError> {
        Self::new(ClientConfig::default())
    }

    /// Configured per-attempt timeout.
    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// POSTs `body` to `url` with the signed headers.
    ///
    /// Never returns an error: every failure mode is folded into
    /// `AttemptOutcome::Failed`.
    pub async fn deliver(
        &self,
        url: &str,
        body: Vec<u8>,
        headers: &SignedHeaders,
    ) -> AttemptOutcome {
        let span = info_span!(
            "webhook_delivery",
            delivery_id = %headers.delivery_id,
            event_type = %headers.event_type,
            url = %url,
        );

        async move {
            let start = Instant::now();

            let mut request = self
                .client
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
            for (name, value) in headers.to_pairs() {
                request = request.header(name, value);
            }

            let exchange = async {
                let response = request.send().await?;
                let status = response.status();
                let body = if status.is_success() {
                    String::new()
                } else {
                    read_truncated(response).await
                };
                Ok::<_, reqwest::Error>((status, body))
            };

            let outcome = match tokio::time::timeout(self.config.timeout, exchange).await {
                Ok(Ok((status, _))) if status.is_success() => AttemptOutcome::Delivered {
                    status_code: status.as_u16(),
                    duration: start.elapsed(),
                },
                Ok(Ok((status, body))) => AttemptOutcome::Failed {
                    error: DeliveryError::http_status(status.as_u16(), body),
                    duration: start.elapsed(),
                },
                Ok(Err(e)) => AttemptOutcome::Failed {
                    error: self.classify(&e),
                    duration: start.elapsed(),
                },
                Err(_) => AttemptOutcome::Failed {
                    error: DeliveryError::timeout(self.config.timeout.as_secs()),
                    duration: start.elapsed(),
                },
            };

            match &outcome {
                AttemptOutcome::Delivered { status_code, duration } => {
                    tracing::debug!(
                        status = status_code,
                        duration_ms = duration.as_millis(),
                        "webhook delivered"
                    );
                },
                AttemptOutcome::Failed { error, duration } => {
                    tracing::debug!(
                        status = error.status_code(),
                        duration_ms = duration.as_millis(),
                        error = %error,
                        "webhook attempt failed"
                    );
                },
            }

            outcome
        }
        .instrument(span)
        .await
    }

    fn classify(&self, e: &reqwest::Error) -> DeliveryError {
        if e.is_timeout() {
            DeliveryError::timeout(self.config.timeout.as_secs())
        } else if e.is_connect() {
            DeliveryError::network(format!("connection failed: {e}"))
        } else {
            DeliveryError::network(e.to_string())
        }
    }
}

/// Reads at most `MAX_ERROR_BODY_BYTES` of a response body.
async fn read_truncated(response: reqwest::Response) -> String {
    match response.bytes().await {
        Ok(bytes) if bytes.len() > MAX_ERROR_BODY_BYTES => {
            let truncated = String::from_utf8_lossy(&bytes[..MAX_ERROR_BODY_BYTES]);
            format!("{truncated}... (truncated)")
        },
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => format!("[failed to read response body: {e}]"),
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn headers() -> SignedHeaders {
        SignedHeaders {
            signature: "abc123".into(),
            next_signature: None,
            timestamp: "2024-01-01T00:00:00Z".into(),
            delivery_id: "d-1".into(),
            event_type: "a.created".into(),
        }
    }

    #[tokio::test]
    async fn successful_delivery_sends_all_headers() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::path("/webhook"))
            .and(matchers::header("content-type", "application/json"))
            .and(matchers::header("user-agent", DEFAULT_USER_AGENT))
            .and(matchers::header("x-signature", "abc123"))
            .and(matchers::header("x-timestamp", "2024-01-01T00:00:00Z"))
            .and(matchers::header("x-delivery-id", "d-1"))
            .and(matchers::header("x-event-type", "a.created"))
            .and(matchers::body_string(r#"{"a":1}"#))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let outcome = client
            .deliver(&format!("{}/webhook", mock_server.uri()), br#"{"a":1}"#.to_vec(), &headers())
            .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.status_code(), Some(204));
        assert!(outcome.error_message().is_none());
    }

    #[tokio::test]
    async fn non_2xx_is_failure_with_body() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("Internal Server Error"))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let outcome = client.deliver(&mock_server.uri(), b"{}".to_vec(), &headers()).await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.status_code(), Some(500));
        assert_eq!(
            outcome.error_message().unwrap(),
            "endpoint responded with HTTP 500: Internal Server Error"
        );
    }

    #[tokio::test]
    async fn redirects_are_not_followed() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/elsewhere"))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let outcome = client.deliver(&mock_server.uri(), b"{}".to_vec(), &headers()).await;

        assert_eq!(outcome.status_code(), Some(302));
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn slow_endpoint_times_out() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::new(ClientConfig {
            timeout: Duration::from_millis(200),
            ..ClientConfig::default()
        })
        .unwrap();
        let outcome = client.deliver(&mock_server.uri(), b"{}".to_vec(), &headers()).await;

        match outcome {
            AttemptOutcome::Failed { error: DeliveryError::Timeout { .. }, .. } => {},
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connection_refused_is_network_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = DeliveryClient::with_defaults().unwrap();
        let outcome =
            client.deliver(&format!("http://{addr}/hook"), b"{}".to_vec(), &headers()).await;

        match outcome {
            AttemptOutcome::Failed { error: DeliveryError::NetworkError { .. }, .. } => {},
            other => panic!("expected network error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn long_error_bodies_are_truncated() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("x".repeat(10_000)))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let outcome = client.deliver(&mock_server.uri(), b"{}".to_vec(), &headers()).await;

        let message = outcome.error_message().unwrap();
        assert!(message.ends_with("... (truncated)"));
        assert!(message.len() < 1200);
    }

    #[test]
    fn zero_timeout_rejected() {
        let result =
            DeliveryClient::new(ClientConfig { timeout: Duration::ZERO, ..Default::default() });
        assert!(matches!(result, Err(DeliveryError::ConfigurationError { .. })));
    }
}
