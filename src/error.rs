//! Unified error handling for the payment session backend
//!
//! This module provides a unified error system with proper HTTP status mapping,
//! user-friendly messages, and structured error codes for client handling.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Domain errors (4xx)
    #[serde(rename = "SESSION_NOT_FOUND")]
    SessionNotFound,
    #[serde(rename = "INVALID_STATE_TRANSITION")]
    InvalidStateTransition,
    #[serde(rename = "RECEIPT_NOT_AVAILABLE")]
    ReceiptNotAvailable,
    #[serde(rename = "UNAUTHENTICATED")]
    Unauthenticated,
    #[serde(rename = "INVALID_CART")]
    InvalidCart,
    #[serde(rename = "INVALID_AMOUNT")]
    InvalidAmount,

    // Infrastructure errors (5xx)
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,
    #[serde(rename = "CACHE_ERROR")]
    CacheError,
    #[serde(rename = "CONFIGURATION_ERROR")]
    ConfigurationError,

    // External errors (502, 503, 504)
    #[serde(rename = "PAYMENT_GATEWAY_ERROR")]
    PaymentGatewayError,
    #[serde(rename = "RATE_LIMIT_ERROR")]
    RateLimitError,
    #[serde(rename = "EXTERNAL_SERVICE_TIMEOUT")]
    ExternalServiceTimeout,

    // Generic
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
}

/// Domain-specific business logic errors
#[derive(Debug, Clone)]
pub enum DomainError {
    /// Session doesn't exist or belongs to another user
    SessionNotFound { session_id: String },
    /// Requested transition is not allowed from the current status
    InvalidTransition {
        session_id: String,
        from: String,
        to: String,
    },
    /// No receipt has been issued for the session yet
    ReceiptNotAvailable { session_id: String },
    /// Caller identity is missing
    Unauthenticated,
}

/// Infrastructure-level errors (database, cache, configuration)
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    /// Database connection or query failure
    Database { message: String, is_retryable: bool },
    /// Redis cache unavailable
    Cache { message: String },
    /// Missing or invalid configuration
    Configuration { message: String },
    /// Anything else that went wrong inside the service
    Internal { message: String },
}

/// External service errors (payment gateway)
#[derive(Debug, Clone)]
pub enum ExternalError {
    /// Payment gateway error
    PaymentGateway {
        provider: String,
        message: String,
        is_retryable: bool,
    },
    /// Rate limit exceeded
    RateLimit {
        service: String,
        retry_after: Option<u64>,
    },
    /// External service timeout
    Timeout { service: String, timeout_secs: u64 },
}

/// Input validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    /// Cart snapshot is unusable
    InvalidCart { reason: String },
    /// Invalid amount (format or value)
    InvalidAmount { amount: String, reason: String },
    /// Required field missing
    MissingField { field: String },
}

/// Unified application error type
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    External(ExternalError),
    Validation(ValidationError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            context: None,
        }
    }

    pub fn session_not_found(session_id: impl fmt::Display) -> Self {
        Self::new(AppErrorKind::Domain(DomainError::SessionNotFound {
            session_id: session_id.to_string(),
        }))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Infrastructure(InfrastructureError::Internal {
            message: message.into(),
        }))
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::SessionNotFound { .. } => 404,
                DomainError::InvalidTransition { .. } => 409, // Conflict
                DomainError::ReceiptNotAvailable { .. } => 404,
                DomainError::Unauthenticated => 401,
            },
            AppErrorKind::Infrastructure(_) => 500,
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentGateway { .. } => 502, // Bad Gateway
                ExternalError::RateLimit { .. } => 429,      // Too Many Requests
                ExternalError::Timeout { .. } => 504,        // Gateway Timeout
            },
            AppErrorKind::Validation(_) => 400,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::SessionNotFound { .. } => ErrorCode::SessionNotFound,
                DomainError::InvalidTransition { .. } => ErrorCode::InvalidStateTransition,
                DomainError::ReceiptNotAvailable { .. } => ErrorCode::ReceiptNotAvailable,
                DomainError::Unauthenticated => ErrorCode::Unauthenticated,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::Cache { .. } => ErrorCode::CacheError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
                InfrastructureError::Internal { .. } => ErrorCode::InternalError,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentGateway { .. } => ErrorCode::PaymentGatewayError,
                ExternalError::RateLimit { .. } => ErrorCode::RateLimitError,
                ExternalError::Timeout { .. } => ErrorCode::ExternalServiceTimeout,
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidCart { .. } => ErrorCode::InvalidCart,
                ValidationError::InvalidAmount { .. } => ErrorCode::InvalidAmount,
                ValidationError::MissingField { .. } => ErrorCode::ValidationError,
            },
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::SessionNotFound { session_id } => {
                    format!("Payment session '{}' not found", session_id)
                }
                DomainError::InvalidTransition { from, to, .. } => {
                    format!("Payment session cannot move from {} to {}", from, to)
                }
                DomainError::ReceiptNotAvailable { session_id } => {
                    format!("No receipt has been issued for session '{}'", session_id)
                }
                DomainError::Unauthenticated => "Authentication required".to_string(),
            },
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentGateway {
                    provider,
                    is_retryable,
                    ..
                } => {
                    if *is_retryable {
                        format!(
                            "Payment gateway ({}) is temporarily unavailable. Please try again",
                            provider
                        )
                    } else {
                        "Payment could not be started. Please contact support".to_string()
                    }
                }
                ExternalError::RateLimit {
                    service,
                    retry_after,
                } => {
                    if let Some(secs) = retry_after {
                        format!(
                            "Rate limit exceeded for {}. Please try again in {} seconds",
                            service, secs
                        )
                    } else {
                        format!("Rate limit exceeded for {}. Please try again later", service)
                    }
                }
                ExternalError::Timeout {
                    service,
                    timeout_secs,
                } => {
                    format!(
                        "{} request timed out after {} seconds. Please try again",
                        service, timeout_secs
                    )
                }
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidCart { reason } => format!("Invalid cart: {}", reason),
                ValidationError::InvalidAmount { amount, reason } => {
                    format!("Invalid amount '{}': {}", amount, reason)
                }
                ValidationError::MissingField { field } => {
                    format!("Required field '{}' is missing", field)
                }
            },
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Domain(_) => false,
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::Cache { .. } => true,
                InfrastructureError::Configuration { .. } => false,
                InfrastructureError::Internal { .. } => false,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentGateway { is_retryable, .. } => *is_retryable,
                ExternalError::RateLimit { .. } => true,
                ExternalError::Timeout { .. } => true,
            },
            AppErrorKind::Validation(_) => false,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for AppError {}

// Conversions from specific error types
// Note: From<DatabaseError> is implemented in database/error.rs and
// From<PaymentError> in payments/error.rs to avoid circular dependencies

impl From<crate::config::ConfigError> for AppError {
    fn from(err: crate::config::ConfigError) -> Self {
        AppError::new(AppErrorKind::Infrastructure(
            InfrastructureError::Configuration {
                message: err.to_string(),
            },
        ))
    }
}

/// Result type for operations that can fail with AppError
pub type AppResult<T> = Result<T, AppError>;
