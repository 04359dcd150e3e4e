use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use quotaward_db::DbError;
use serde::Serialize;
use thiserror::Error;

/// A cache reload could not fetch fresh data. The previous generation stays in place.
#[derive(Debug, Error)]
#[error("failed to refresh {cache}: {source}")]
pub struct RefreshError {
  pub cache: &'static str,
  #[source]
  pub source: DbError,
}

impl RefreshError {
  pub fn new(cache: &'static str, source: DbError) -> Self {
    Self { cache, source }
  }
}

/// Rejections raised on the playtime paths.
#[derive(Debug, Error)]
pub enum QuotaError {
  #[error("playtime used up")]
  QuotaExhausted,

  #[error("identity anomaly: {0}")]
  IdentityAnomaly(String),

  #[error("device has no player record")]
  UnknownDevice,

  #[error(transparent)]
  Store(#[from] DbError),
}

/// API error response structure
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
  pub error: String,
}

impl ErrorResponse {
  pub fn new(error: impl Into<String>) -> Self {
    Self {
      error: error.into(),
    }
  }
}

/// Application error type
#[derive(Debug)]
pub enum AppError {
  DatabaseError(DbError),
  ValidationError(String),
  QuotaError(QuotaError),
  Banned,
  Unauthorized,
}

const INTERNAL_ERROR: &str = "An internal error occurred. Please try again later.";

impl IntoResponse for AppError {
  fn into_response(self) -> Response {
    match self {
      AppError::DatabaseError(db_err) => {
        // Don't expose internal database errors
        tracing::error!(?db_err, "Database error occurred");
        let error_response = ErrorResponse::new(INTERNAL_ERROR);
        (StatusCode::INTERNAL_SERVER_ERROR, Json(error_response)).into_response()
      }
      AppError::ValidationError(msg) => {
        tracing::warn!(validation_error = %msg, "Validation failed");
        let error_response = ErrorResponse::new(msg);
        (StatusCode::BAD_REQUEST, Json(error_response)).into_response()
      }
      AppError::QuotaError(err) => {
        let (status, response) = match err {
          QuotaError::QuotaExhausted => (
            StatusCode::FORBIDDEN,
            ErrorResponse::new("playtime used up, come back tomorrow"),
          ),
          QuotaError::IdentityAnomaly(reason) => {
            // The reason can name another account's device id, keep it in the logs
            tracing::warn!(%reason, "Identity anomaly");
            (
              StatusCode::FORBIDDEN,
              ErrorResponse::new("account data anomaly, contact support"),
            )
          }
          QuotaError::UnknownDevice => (
            StatusCode::NOT_FOUND,
            ErrorResponse::new("No player exists for this device"),
          ),
          QuotaError::Store(db_err) => {
            tracing::error!(?db_err, "Database error occurred");
            (
              StatusCode::INTERNAL_SERVER_ERROR,
              ErrorResponse::new(INTERNAL_ERROR),
            )
          }
        };
        (status, Json(response)).into_response()
      }
      AppError::Banned => {
        // Deliberately vague so banned clients can't tell why they fail
        let error_response = ErrorResponse::new("Failed to fetch version info, please retry");
        (StatusCode::FORBIDDEN, Json(error_response)).into_response()
      }
      AppError::Unauthorized => {
        let error_response = ErrorResponse::new("Invalid or missing admin token");
        (StatusCode::UNAUTHORIZED, Json(error_response)).into_response()
      }
    }
  }
}

impl From<DbError> for AppError {
  fn from(err: DbError) -> Self {
    AppError::DatabaseError(err)
  }
}

impl From<QuotaError> for AppError {
  fn from(err: QuotaError) -> Self {
    AppError::QuotaError(err)
  }
}

impl From<crate::validation::ValidationError> for AppError {
  fn from(err: crate::validation::ValidationError) -> Self {
    AppError::ValidationError(err.to_string())
  }
}
