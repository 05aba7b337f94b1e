//! Withdrawal Error Types
//!
//! Client-correctable errors carry enough detail for the caller to act on
//! (remaining capacity, available balance). Saga-step errors are persisted
//! onto the record and only surface through logs and notifications.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use super::adapters::AdapterError;
use super::guards::GuardError;
use super::queue::QueueError;
use super::repository::RepositoryError;
use super::state::WithdrawalStatus;
use super::types::WithdrawalId;
use crate::circuit_breaker::BreakerError;

#[derive(Error, Debug, Clone)]
pub enum WithdrawalError {
    // === Validation Errors ===
    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    #[error("Invalid source account: {0}")]
    InvalidSourceAccount(String),

    #[error("Withdrawal does not belong to this user")]
    Forbidden,

    // === Limit / Balance Errors ===
    #[error(
        "Withdrawal limit exceeded ({limit_type}): remaining capacity {remaining_capacity}, resets at {resets_at}"
    )]
    LimitExceeded {
        limit_type: String,
        remaining_capacity: Decimal,
        resets_at: DateTime<Utc>,
    },

    #[error("Spending declined by allocation mode: {0}")]
    SpendingDeclined(String),

    #[error(
        "Insufficient balance: requested {requested}, available {available} (pending withdrawals {pending})"
    )]
    InsufficientBalance {
        requested: Decimal,
        available: Decimal,
        pending: Decimal,
    },

    #[error("Ledger account is not active: {0}")]
    AccountNotActive(String),

    // === Lifecycle Errors ===
    #[error("Withdrawal not found: {0}")]
    NotFound(WithdrawalId),

    #[error("cannot cancel withdrawal in current status: {0}")]
    CannotCancel(WithdrawalStatus),

    // === Saga Errors ===
    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Transfer provider error: {0}")]
    Transfer(String),

    #[error("Transfer failed at provider: {0}")]
    TransferFailed(String),

    #[error("Transfer monitoring timed out after {attempts} polls")]
    MonitorTimeout { attempts: u32 },

    #[error("Compensation failed, funds held in system account: {0}")]
    CompensationFailed(String),

    // === System Errors ===
    #[error("Failed to enqueue saga step: {0}")]
    Enqueue(String),

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Repository error: {0}")]
    Repository(String),
}

impl WithdrawalError {
    /// Error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            WithdrawalError::InvalidAmount => "INVALID_AMOUNT",
            WithdrawalError::InvalidDestination(_) => "INVALID_DESTINATION",
            WithdrawalError::InvalidSourceAccount(_) => "INVALID_SOURCE_ACCOUNT",
            WithdrawalError::Forbidden => "FORBIDDEN",
            WithdrawalError::LimitExceeded { .. } => "LIMIT_EXCEEDED",
            WithdrawalError::SpendingDeclined(_) => "SPENDING_DECLINED",
            WithdrawalError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            WithdrawalError::AccountNotActive(_) => "ACCOUNT_NOT_ACTIVE",
            WithdrawalError::NotFound(_) => "WITHDRAWAL_NOT_FOUND",
            WithdrawalError::CannotCancel(_) => "CANNOT_CANCEL",
            WithdrawalError::Ledger(_) => "LEDGER_ERROR",
            WithdrawalError::Transfer(_) => "TRANSFER_ERROR",
            WithdrawalError::TransferFailed(_) => "TRANSFER_FAILED",
            WithdrawalError::MonitorTimeout { .. } => "MONITOR_TIMEOUT",
            WithdrawalError::CompensationFailed(_) => "COMPENSATION_FAILED",
            WithdrawalError::Enqueue(_) => "ENQUEUE_FAILED",
            WithdrawalError::Collaborator(_) => "COLLABORATOR_ERROR",
            WithdrawalError::Repository(_) => "REPOSITORY_ERROR",
        }
    }

    /// HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            WithdrawalError::InvalidAmount
            | WithdrawalError::InvalidDestination(_)
            | WithdrawalError::InvalidSourceAccount(_) => 400,
            WithdrawalError::Forbidden => 403,
            WithdrawalError::NotFound(_) => 404,
            WithdrawalError::CannotCancel(_) => 409,
            WithdrawalError::InsufficientBalance { .. }
            | WithdrawalError::AccountNotActive(_)
            | WithdrawalError::SpendingDeclined(_) => 422,
            WithdrawalError::LimitExceeded { .. } => 429,
            WithdrawalError::Ledger(_)
            | WithdrawalError::Transfer(_)
            | WithdrawalError::Collaborator(_) => 503,
            WithdrawalError::TransferFailed(_)
            | WithdrawalError::MonitorTimeout { .. }
            | WithdrawalError::CompensationFailed(_)
            | WithdrawalError::Enqueue(_)
            | WithdrawalError::Repository(_) => 500,
        }
    }

    /// Caller can fix the request and retry
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.http_status())
    }
}

impl From<RepositoryError> for WithdrawalError {
    fn from(e: RepositoryError) -> Self {
        WithdrawalError::Repository(e.to_string())
    }
}

impl From<QueueError> for WithdrawalError {
    fn from(e: QueueError) -> Self {
        WithdrawalError::Enqueue(e.to_string())
    }
}

impl From<GuardError> for WithdrawalError {
    fn from(e: GuardError) -> Self {
        WithdrawalError::Collaborator(e.to_string())
    }
}

/// Ledger calls made through the ledger breaker
pub(crate) fn ledger_error(e: BreakerError<AdapterError>) -> WithdrawalError {
    WithdrawalError::Ledger(e.to_string())
}

/// Off-ramp calls made through the transfer breaker
pub(crate) fn transfer_error(e: BreakerError<AdapterError>) -> WithdrawalError {
    WithdrawalError::Transfer(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(WithdrawalError::InvalidAmount.code(), "INVALID_AMOUNT");
        assert_eq!(
            WithdrawalError::SpendingDeclined("mode".into()).code(),
            "SPENDING_DECLINED"
        );
        assert_eq!(
            WithdrawalError::CannotCancel(WithdrawalStatus::Processing).code(),
            "CANNOT_CANCEL"
        );
    }

    #[test]
    fn test_http_status() {
        assert_eq!(WithdrawalError::InvalidAmount.http_status(), 400);
        assert_eq!(WithdrawalError::Forbidden.http_status(), 403);
        assert_eq!(
            WithdrawalError::InsufficientBalance {
                requested: Decimal::ONE,
                available: Decimal::ZERO,
                pending: Decimal::ZERO,
            }
            .http_status(),
            422
        );
        assert_eq!(WithdrawalError::Ledger("down".into()).http_status(), 503);
        assert!(!WithdrawalError::Repository("x".into()).is_client_error());
    }

    #[test]
    fn test_client_errors_are_distinct_kinds() {
        let declined = WithdrawalError::SpendingDeclined("conservative".into());
        let limit = WithdrawalError::LimitExceeded {
            limit_type: "DAILY_AMOUNT".into(),
            remaining_capacity: Decimal::new(100, 0),
            resets_at: Utc::now(),
        };
        assert!(declined.is_client_error());
        assert!(limit.is_client_error());
        assert_ne!(declined.code(), limit.code());
        assert_ne!(declined.code(), WithdrawalError::InvalidAmount.code());
    }

    #[test]
    fn test_display() {
        let err = WithdrawalError::CannotCancel(WithdrawalStatus::Processing);
        assert_eq!(
            err.to_string(),
            "cannot cancel withdrawal in current status: PROCESSING"
        );

        let err = WithdrawalError::InsufficientBalance {
            requested: Decimal::new(500, 0),
            available: Decimal::new(400, 0),
            pending: Decimal::new(600, 0),
        };
        assert_eq!(
            err.to_string(),
            "Insufficient balance: requested 500, available 400 (pending withdrawals 600)"
        );
    }
}
