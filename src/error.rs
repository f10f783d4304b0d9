use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::ledger::models::OutcomeKind;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Payout error: {0}")]
    Payout(#[from] PayoutError),

    #[error("Rate error: {0}")]
    Rate(#[from] RateError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Invalid webhook: {0}")]
    InvalidWebhook(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Event Ledger errors. Integrity violations here indicate a money-safety
/// concern and are always surfaced, never silently dropped.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(Decimal),

    #[error("Transaction reference already attached to another event: {0}")]
    DuplicateReference(String),

    #[error("Event {event_id} is terminal ({current:?}), cannot apply {attempted:?}")]
    TerminalStateViolation {
        event_id: Uuid,
        current: OutcomeKind,
        attempted: OutcomeKind,
    },

    #[error("Settlement event not found: {0}")]
    EventNotFound(String),

    #[error("Event {event_id} exhausted its {attempts} transfer attempts")]
    MaxRetriesReached { event_id: Uuid, attempts: i32 },

    #[error("Cannot retry event {event_id}: outcome is {current:?}, not failed or reversed")]
    NotRetryable { event_id: Uuid, current: OutcomeKind },
}

/// Job Lock Manager errors. `AlreadyLocked` on a sweep is expected and
/// non-alarming; callers drive retries by policy.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Job '{job_name}' already locked by {locked_by} until {expires_at}")]
    AlreadyLocked {
        job_name: String,
        locked_by: String,
        expires_at: DateTime<Utc>,
    },

    #[error("Caller does not own lock for job '{job_name}'")]
    NotOwner { job_name: String },

    #[error("Lock not found: {0}")]
    NotFound(Uuid),
}

#[derive(Error, Debug)]
pub enum PayoutError {
    #[error("Payment not found: {0}")]
    PaymentNotFound(Uuid),

    #[error("Payment {payment_id} not eligible for payout: {reason}")]
    NotEligible { payment_id: Uuid, reason: String },

    #[error("Commission already paid out for payment {0}")]
    AlreadyPaidOut(Uuid),
}

#[derive(Error, Debug)]
pub enum RateError {
    #[error("Commission rate {0} outside [0, 0.5]")]
    InvalidRate(Decimal),

    #[error("Rate change reason must be at least {min} characters")]
    MissingReason { min: usize },
}

/// Payment provider errors. Timeout and Unavailable are ambiguous, not
/// negative: the event stays Pending and the reconciliation poll picks it up.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider call timed out")]
    Timeout,

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Transfer rejected by provider: {0}")]
    Rejected(String),

    #[error("Unparseable provider response: {0}")]
    Malformed(String),
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match &self {
            AppError::Ledger(LedgerError::InvalidAmount(amount)) => (
                StatusCode::BAD_REQUEST,
                "INVALID_AMOUNT",
                self.to_string(),
                Some(serde_json::json!({ "amount": amount.to_string() })),
            ),
            AppError::Ledger(LedgerError::DuplicateReference(reference)) => (
                StatusCode::CONFLICT,
                "DUPLICATE_REFERENCE",
                self.to_string(),
                Some(serde_json::json!({ "reference": reference })),
            ),
            AppError::Ledger(LedgerError::TerminalStateViolation { event_id, .. }) => (
                // Data-integrity bug, not a caller mistake: escalate loudly.
                StatusCode::CONFLICT,
                "TERMINAL_STATE_VIOLATION",
                self.to_string(),
                Some(serde_json::json!({ "event_id": event_id })),
            ),
            AppError::Ledger(LedgerError::MaxRetriesReached { event_id, .. }) => (
                StatusCode::CONFLICT,
                "MAX_RETRIES_REACHED",
                self.to_string(),
                Some(serde_json::json!({ "event_id": event_id })),
            ),
            AppError::Ledger(LedgerError::NotRetryable { .. }) => (
                StatusCode::CONFLICT,
                "NOT_RETRYABLE",
                self.to_string(),
                None,
            ),
            AppError::Ledger(LedgerError::EventNotFound(_)) => (
                StatusCode::NOT_FOUND,
                "EVENT_NOT_FOUND",
                self.to_string(),
                None,
            ),
            AppError::Lock(LockError::AlreadyLocked { job_name, expires_at, .. }) => (
                StatusCode::CONFLICT,
                "ALREADY_LOCKED",
                self.to_string(),
                Some(serde_json::json!({
                    "job_name": job_name,
                    "expires_at": expires_at,
                })),
            ),
            AppError::Lock(LockError::NotOwner { .. }) => (
                StatusCode::FORBIDDEN,
                "NOT_LOCK_OWNER",
                self.to_string(),
                None,
            ),
            AppError::Lock(LockError::NotFound(_)) => (
                StatusCode::NOT_FOUND,
                "LOCK_NOT_FOUND",
                self.to_string(),
                None,
            ),
            AppError::Payout(PayoutError::PaymentNotFound(_)) => (
                StatusCode::NOT_FOUND,
                "PAYMENT_NOT_FOUND",
                self.to_string(),
                None,
            ),
            AppError::Payout(PayoutError::NotEligible { payment_id, reason }) => (
                StatusCode::BAD_REQUEST,
                "PAYOUT_NOT_ELIGIBLE",
                self.to_string(),
                Some(serde_json::json!({
                    "payment_id": payment_id,
                    "reason": reason,
                })),
            ),
            AppError::Payout(PayoutError::AlreadyPaidOut(payment_id)) => (
                StatusCode::CONFLICT,
                "ALREADY_PAID_OUT",
                self.to_string(),
                Some(serde_json::json!({ "payment_id": payment_id })),
            ),
            AppError::Rate(RateError::InvalidRate(rate)) => (
                StatusCode::BAD_REQUEST,
                "INVALID_RATE",
                self.to_string(),
                Some(serde_json::json!({ "rate": rate.to_string() })),
            ),
            AppError::Rate(RateError::MissingReason { .. }) => (
                StatusCode::BAD_REQUEST,
                "MISSING_REASON",
                self.to_string(),
                None,
            ),
            AppError::Provider(ProviderError::Timeout) => (
                StatusCode::GATEWAY_TIMEOUT,
                "PROVIDER_TIMEOUT",
                self.to_string(),
                None,
            ),
            AppError::Provider(_) => (
                StatusCode::BAD_GATEWAY,
                "PROVIDER_ERROR",
                self.to_string(),
                None,
            ),
            AppError::InvalidWebhook(_) => (
                StatusCode::UNAUTHORIZED,
                "INVALID_WEBHOOK",
                self.to_string(),
                None,
            ),
            AppError::NotFound(_) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                self.to_string(),
                None,
            ),
            AppError::InvalidInput(_) => (
                StatusCode::BAD_REQUEST,
                "INVALID_INPUT",
                self.to_string(),
                None,
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            AppError::Config(_) | AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<rust_decimal::Error> for AppError {
    fn from(error: rust_decimal::Error) -> Self {
        AppError::InvalidInput(format!("Decimal conversion error: {:?}", error))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::Internal(format!("Serialization error: {:?}", error))
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
