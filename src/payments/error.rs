use thiserror::Error;

pub type PaymentResult<T> = Result<T, PaymentError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PaymentError {
    #[error("Validation error: {message}")]
    ValidationError {
        message: String,
        field: Option<String>,
    },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("Gateway {operation} timed out after {timeout_secs}s")]
    Timeout { operation: String, timeout_secs: u64 },

    #[error("Rate limit exceeded: {message}")]
    RateLimitError {
        message: String,
        retry_after_seconds: Option<u64>,
    },

    #[error("Gateway rejected credentials: {message}")]
    Unauthorized { message: String },

    /// The gateway answered, but not with the shape we require.
    #[error("Malformed {operation} response: {message}")]
    MalformedResponse { operation: String, message: String },

    #[error("Provider error: provider={provider}, message={message}")]
    ProviderError {
        provider: String,
        message: String,
        provider_code: Option<String>,
        retryable: bool,
    },
}

impl PaymentError {
    pub fn malformed(operation: &str, message: impl Into<String>) -> Self {
        PaymentError::MalformedResponse {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::ValidationError { .. } => false,
            PaymentError::NetworkError { .. } => true,
            PaymentError::Timeout { .. } => true,
            PaymentError::RateLimitError { .. } => true,
            PaymentError::Unauthorized { .. } => true,
            PaymentError::MalformedResponse { .. } => false,
            PaymentError::ProviderError { retryable, .. } => *retryable,
        }
    }

    pub fn http_status_code(&self) -> u16 {
        match self {
            PaymentError::ValidationError { .. } => 400,
            PaymentError::NetworkError { .. } => 503,
            PaymentError::Timeout { .. } => 504,
            PaymentError::RateLimitError { .. } => 429,
            PaymentError::Unauthorized { .. } => 502,
            PaymentError::MalformedResponse { .. } => 502,
            PaymentError::ProviderError { .. } => 502,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            PaymentError::ValidationError { message, .. } => message.clone(),
            PaymentError::NetworkError { .. } | PaymentError::Timeout { .. } => {
                "Payment gateway is temporarily unavailable".to_string()
            }
            PaymentError::RateLimitError { .. } => {
                "Too many requests to payment gateway. Please retry shortly".to_string()
            }
            PaymentError::Unauthorized { .. }
            | PaymentError::MalformedResponse { .. }
            | PaymentError::ProviderError { .. } => {
                "Payment gateway returned an error".to_string()
            }
        }
    }
}

impl From<PaymentError> for crate::error::AppError {
    fn from(err: PaymentError) -> Self {
        use crate::error::{AppError, AppErrorKind, ExternalError, ValidationError};

        let kind = match &err {
            PaymentError::ValidationError { message, field } => {
                AppErrorKind::Validation(ValidationError::InvalidAmount {
                    amount: field.clone().unwrap_or_default(),
                    reason: message.clone(),
                })
            }
            PaymentError::Timeout {
                timeout_secs,
                ..
            } => AppErrorKind::External(ExternalError::Timeout {
                service: "Payment gateway".to_string(),
                timeout_secs: *timeout_secs,
            }),
            PaymentError::RateLimitError {
                retry_after_seconds,
                ..
            } => AppErrorKind::External(ExternalError::RateLimit {
                service: "payment gateway".to_string(),
                retry_after: *retry_after_seconds,
            }),
            _ => AppErrorKind::External(ExternalError::PaymentGateway {
                provider: "qr_gateway".to_string(),
                message: err.to_string(),
                is_retryable: err.is_retryable(),
            }),
        };

        AppError::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;

    #[test]
    fn error_http_status_mapping_is_correct() {
        assert_eq!(
            PaymentError::ValidationError {
                message: "bad".to_string(),
                field: None
            }
            .http_status_code(),
            400
        );
        assert_eq!(
            PaymentError::malformed("check_payment", "missing rows").http_status_code(),
            502
        );
    }

    #[test]
    fn retryable_flags_are_set() {
        assert!(PaymentError::NetworkError {
            message: "reset".to_string()
        }
        .is_retryable());
        assert!(!PaymentError::malformed("create_invoice", "no invoice_id").is_retryable());
    }

    #[test]
    fn timeouts_become_gateway_timeouts() {
        let app: AppError = PaymentError::Timeout {
            operation: "create_invoice".to_string(),
            timeout_secs: 15,
        }
        .into();
        assert_eq!(app.status_code(), 504);
        assert!(app.is_retryable());
    }

    #[test]
    fn provider_errors_become_bad_gateway() {
        let app: AppError = PaymentError::ProviderError {
            provider: "qr_gateway".to_string(),
            message: "HTTP 500".to_string(),
            provider_code: Some("500".to_string()),
            retryable: true,
        }
        .into();
        assert_eq!(app.status_code(), 502);
    }
}
