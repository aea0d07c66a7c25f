//! Database error types

use crate::error::{AppError, AppErrorKind, DomainError, InfrastructureError};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseErrorKind {
    NotFound { entity: String, id: String },
    UniqueViolation { constraint: Option<String> },
    ConnectionError { message: String },
    QueryError { message: String },
    Unknown { message: String },
}

#[derive(Debug, Clone)]
pub struct DatabaseError {
    pub kind: DatabaseErrorKind,
}

impl DatabaseError {
    pub fn new(kind: DatabaseErrorKind) -> Self {
        Self { kind }
    }

    pub fn from_sqlx(err: sqlx::Error) -> Self {
        let kind = match &err {
            sqlx::Error::RowNotFound => DatabaseErrorKind::NotFound {
                entity: "row".to_string(),
                id: "unknown".to_string(),
            },
            sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
                DatabaseErrorKind::UniqueViolation {
                    constraint: db_err.constraint().map(|c| c.to_string()),
                }
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DatabaseErrorKind::ConnectionError {
                    message: err.to_string(),
                }
            }
            sqlx::Error::Database(_) | sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                DatabaseErrorKind::QueryError {
                    message: err.to_string(),
                }
            }
            _ => DatabaseErrorKind::Unknown {
                message: err.to_string(),
            },
        };
        Self { kind }
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::UniqueViolation { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::ConnectionError { .. })
    }
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DatabaseErrorKind::NotFound { entity, id } => write!(f, "{} '{}' not found", entity, id),
            DatabaseErrorKind::UniqueViolation { constraint } => write!(
                f,
                "unique constraint violated: {}",
                constraint.as_deref().unwrap_or("unknown")
            ),
            DatabaseErrorKind::ConnectionError { message } => {
                write!(f, "database connection error: {}", message)
            }
            DatabaseErrorKind::QueryError { message } => write!(f, "query error: {}", message),
            DatabaseErrorKind::Unknown { message } => write!(f, "database error: {}", message),
        }
    }
}

impl std::error::Error for DatabaseError {}

impl From<DatabaseError> for AppError {
    fn from(err: DatabaseError) -> Self {
        let kind = match &err.kind {
            DatabaseErrorKind::NotFound { entity, id } if entity == "payment_session" => {
                AppErrorKind::Domain(DomainError::SessionNotFound {
                    session_id: id.clone(),
                })
            }
            _ => AppErrorKind::Infrastructure(InfrastructureError::Database {
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

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err = DatabaseError::from_sqlx(sqlx::Error::RowNotFound);
        assert!(matches!(err.kind, DatabaseErrorKind::NotFound { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_pool_timeout_is_retryable() {
        let err = DatabaseError::from_sqlx(sqlx::Error::PoolTimedOut);
        assert!(err.is_retryable());

        let app: AppError = err.into();
        assert_eq!(app.status_code(), 500);
        assert!(app.is_retryable());
    }

    #[test]
    fn test_missing_session_maps_to_404() {
        let err = DatabaseError::new(DatabaseErrorKind::NotFound {
            entity: "payment_session".to_string(),
            id: "abc".to_string(),
        });
        let app: AppError = err.into();
        assert_eq!(app.status_code(), 404);
    }
}
