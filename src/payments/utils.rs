use crate::payments::error::{PaymentError, PaymentResult};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::warn;

/// How an outbound request authenticates.
pub enum Auth<'a> {
    Bearer(&'a str),
    Basic { username: &'a str, password: &'a str },
}

/// JSON-over-HTTP client for gateway calls.
///
/// Single attempt per call with a hard timeout; retries come from the
/// reconciliation sweep, not from here.
#[derive(Clone)]
pub struct PaymentHttpClient {
    client: Client,
    timeout: Duration,
}

impl PaymentHttpClient {
    pub fn new(timeout: Duration) -> PaymentResult<Self> {
        let client =
            Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| PaymentError::NetworkError {
                    message: format!("failed to initialize HTTP client: {}", e),
                })?;

        Ok(Self { client, timeout })
    }

    pub async fn request_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        method: Method,
        url: &str,
        auth: Auth<'_>,
        body: Option<&JsonValue>,
    ) -> PaymentResult<T> {
        let mut request = self.client.request(method, url).timeout(self.timeout);

        request = match auth {
            Auth::Bearer(token) => request.bearer_auth(token),
            Auth::Basic { username, password } => request.basic_auth(username, Some(password)),
        };
        if let Some(payload) = body {
            request = request.json(payload);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                PaymentError::Timeout {
                    operation: operation.to_string(),
                    timeout_secs: self.timeout.as_secs(),
                }
            } else {
                PaymentError::NetworkError {
                    message: format!("{} request failed: {}", operation, e),
                }
            }
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| PaymentError::NetworkError {
            message: format!("{} response body unreadable: {}", operation, e),
        })?;

        if status.is_success() {
            return serde_json::from_str::<T>(&text)
                .map_err(|e| PaymentError::malformed(operation, e.to_string()));
        }

        match status {
            StatusCode::UNAUTHORIZED => Err(PaymentError::Unauthorized {
                message: format!("{} rejected with HTTP 401", operation),
            }),
            StatusCode::TOO_MANY_REQUESTS => Err(PaymentError::RateLimitError {
                message: format!("{} rate limited", operation),
                retry_after_seconds: None,
            }),
            _ => {
                if status.is_server_error() {
                    warn!(operation, status = status.as_u16(), "Gateway server error");
                }
                Err(PaymentError::ProviderError {
                    provider: "qr_gateway".to_string(),
                    message: format!("HTTP {}: {}", status, truncate(&text, 256)),
                    provider_code: Some(status.as_u16().to_string()),
                    retryable: status.is_server_error(),
                })
            }
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Constant-time byte comparison for secrets.
pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0_u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
