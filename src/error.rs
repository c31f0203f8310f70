use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use log::{debug, error};
use thiserror::Error;

use crate::api::ErrorResponse;

pub type Result<T, E = SibylError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum SibylError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    InvalidState(String),
    #[error("{field}: {message}")]
    Validation { field: String, message: String },
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Conflict(String),
    #[error("transient failure: {0:#}")]
    Transient(anyhow::Error),
    /// Broken invariants and other failures a retry can't fix.
    #[error("internal failure: {0:#}")]
    Internal(anyhow::Error),
}
impl SibylError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }
    pub fn missing(field: &str) -> Self {
        Self::validation(field, format!("{} is required", field))
    }
    /// Only storage failures may succeed when the same call is repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::InvalidState(_) => StatusCode::BAD_REQUEST,
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Transient(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
impl From<anyhow::Error> for SibylError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast_ref::<sqlx::Error>() {
            Some(sqlx::Error::Database(db_error)) if db_error.is_unique_violation() => {
                Self::Conflict(format!("{} is already taken", unique_field(db_error.message())))
            }
            Some(sqlx_error) if is_transient(sqlx_error) => Self::Transient(e),
            _ => Self::Internal(e),
        }
    }
}
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const SQLITE_IOERR: i32 = 10;

/// Lock contention, I/O and pool exhaustion. Extended SQLite codes keep the
/// primary code in their low byte.
fn is_transient(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_error) => db_error
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .map_or(false, |code| {
                matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED | SQLITE_IOERR)
            }),
        _ => false,
    }
}
impl From<sqlx::Error> for SibylError {
    fn from(e: sqlx::Error) -> Self {
        anyhow::Error::from(e).into()
    }
}
impl IntoResponse for SibylError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::Transient(e) => {
                error!("Request failed: {:#}", e);
                ErrorResponse {
                    error: "The request could not be completed, please retry".to_string(),
                    field: None,
                }
            }
            Self::Internal(e) => {
                error!("Internal error: {:#}", e);
                ErrorResponse {
                    error: "Internal server error".to_string(),
                    field: None,
                }
            }
            Self::Validation { field, message } => ErrorResponse {
                error: format!("{}: {}", field, message),
                field: Some(field.clone()),
            },
            e => {
                debug!("Error: {}", e);
                ErrorResponse {
                    error: e.to_string(),
                    field: None,
                }
            }
        };
        (status, Json(body)).into_response()
    }
}
// SQLite reports "UNIQUE constraint failed: accounts.email"
fn unique_field(message: &str) -> &str {
    message
        .rsplit('.')
        .next()
        .filter(|field| !field.contains(' '))
        .unwrap_or("value")
}
