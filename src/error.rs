//! Crate-wide API error taxonomy, see spec §7.
//!
//! Generalizes the teacher's ad-hoc `internal_error`/`not_found_error`
//! helpers into one typed enum with a stable `{error, message, details?}`
//! JSON body, since this spec's error taxonomy is much richer than a plain
//! 404/500 split.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("a parlay needs at least two legs")]
    TooFewLegs,

    #[error("stake must be greater than zero")]
    InvalidStake,

    #[error("leg probability must be in (0, 1)")]
    InvalidProbability,

    #[error("legs span more than one environment")]
    EnvironmentMismatch,

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("wallet balance is insufficient")]
    InsufficientFunds,

    #[error("parlay has already been claimed")]
    AlreadyClaimed,

    #[error("a draft already exists for this user/environment")]
    DraftAlreadyExists,

    #[error("{0} not found")]
    NotFound(String),

    #[error("upstream call failed, try again")]
    TryAgain,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Ledger/quote/hedging functions return `anyhow::Result` so a
    /// retryable-transaction macro can freely propagate `?`; domain errors
    /// raised inside those functions travel as a boxed `ApiError` and are
    /// recovered here at the API boundary instead of collapsing to a plain
    /// 500. Anything that isn't one of ours really is internal.
    pub fn from_anyhow(err: anyhow::Error) -> ApiError {
        match err.downcast::<ApiError>() {
            Ok(api_error) => api_error,
            Err(err) => ApiError::Internal(err),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::TooFewLegs => "too_few_legs",
            ApiError::InvalidStake => "invalid_stake",
            ApiError::InvalidProbability => "invalid_probability",
            ApiError::EnvironmentMismatch => "environment_mismatch",
            ApiError::NotAuthenticated => "not_authenticated",
            ApiError::InsufficientFunds => "insufficient_funds",
            ApiError::AlreadyClaimed => "already_claimed",
            ApiError::DraftAlreadyExists => "draft_already_exists",
            ApiError::NotFound(_) => "not_found",
            ApiError::TryAgain => "try_again",
            ApiError::Internal(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::TooFewLegs | ApiError::InvalidStake | ApiError::InvalidProbability => {
                StatusCode::BAD_REQUEST
            }
            ApiError::NotAuthenticated => StatusCode::UNAUTHORIZED,
            ApiError::EnvironmentMismatch => StatusCode::CONFLICT,
            ApiError::InsufficientFunds => StatusCode::PAYMENT_REQUIRED,
            ApiError::AlreadyClaimed | ApiError::DraftAlreadyExists => StatusCode::CONFLICT,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::TryAgain => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if matches!(self, ApiError::Internal(_)) {
            tracing::error!(error = %self, "internal error serving request");
        }
        let body = json!({
            "error": self.code(),
            "message": self.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
