//! Stable error kinds for the refund orchestrator
//!
//! Every error that crosses the API boundary carries one of these kinds as a
//! snake_case string in the `error` field of the response envelope. Kinds are
//! wire-stable: the admin UI and operator tooling match on them, so renaming
//! one is a breaking change.

use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse grouping used for logging and status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed operator input
    Validation,
    /// Missing or insufficient credentials
    Auth,
    /// Referenced entity does not exist
    NotFound,
    /// Request is valid but the entity state forbids it
    StateConflict,
    /// A concurrent writer or an upstream identity check lost the race
    IntegrityConflict,
    /// An external collaborator (provider, audit store) failed
    External,
    /// Some legs succeeded, some did not run
    Partial,
    /// Internal error; details never leave the process
    System,
}

/// Wire-stable error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "&'static str", try_from = "String")]
pub enum ErrorKind {
    // ==================== Validation ====================
    ValidationFailed,
    InvalidAmount,
    InvalidFeePercent,
    InvalidUserId,
    InvalidUserIds,
    TooManyUserIds,
    InvalidRefundAmountRange,

    // ==================== Auth ====================
    Unauthorized,
    NotAdmin,

    // ==================== Not found ====================
    UserNotFound,
    TopupNotFound,
    RefundNotFound,

    // ==================== State conflict ====================
    NothingToRefund,
    TopupNotRefundable,
    FeeTooHigh,
    RefundAmountOutOfRange,
    MultipleCurrencies,

    // ==================== Integrity conflict ====================
    InsufficientUserQuota,
    TopupAlreadyUpdated,
    CustomerMismatch,
    NotSucceeded,

    // ==================== External ====================
    ProviderError,
    SignatureError,
    RefundStoreError,

    // ==================== Partial success ====================
    RefundIncomplete,

    // ==================== System ====================
    InternalError,
}

impl ErrorKind {
    /// The stable string written to the `error` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationFailed => "validation_failed",
            Self::InvalidAmount => "invalid_amount",
            Self::InvalidFeePercent => "invalid_fee_percent",
            Self::InvalidUserId => "invalid_user_id",
            Self::InvalidUserIds => "invalid_user_ids",
            Self::TooManyUserIds => "too_many_user_ids",
            Self::InvalidRefundAmountRange => "invalid_refund_amount_range",
            Self::Unauthorized => "unauthorized",
            Self::NotAdmin => "not_admin",
            Self::UserNotFound => "user_not_found",
            Self::TopupNotFound => "topup_not_found",
            Self::RefundNotFound => "refund_not_found",
            Self::NothingToRefund => "nothing_to_refund",
            Self::TopupNotRefundable => "topup_not_refundable",
            Self::FeeTooHigh => "fee_too_high",
            Self::RefundAmountOutOfRange => "refund_amount_out_of_range",
            Self::MultipleCurrencies => "stripe_multiple_currencies",
            Self::InsufficientUserQuota => "insufficient_user_quota",
            Self::TopupAlreadyUpdated => "topup_already_updated",
            Self::CustomerMismatch => "customer_mismatch",
            Self::NotSucceeded => "not_succeeded",
            Self::ProviderError => "provider_error",
            Self::SignatureError => "signature_error",
            Self::RefundStoreError => "refund_store_error",
            Self::RefundIncomplete => "refund_incomplete",
            Self::InternalError => "internal_error",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ValidationFailed
            | Self::InvalidAmount
            | Self::InvalidFeePercent
            | Self::InvalidUserId
            | Self::InvalidUserIds
            | Self::TooManyUserIds
            | Self::InvalidRefundAmountRange => ErrorCategory::Validation,

            Self::Unauthorized | Self::NotAdmin => ErrorCategory::Auth,

            Self::UserNotFound | Self::TopupNotFound | Self::RefundNotFound => {
                ErrorCategory::NotFound
            }

            Self::NothingToRefund
            | Self::TopupNotRefundable
            | Self::FeeTooHigh
            | Self::RefundAmountOutOfRange
            | Self::MultipleCurrencies => ErrorCategory::StateConflict,

            Self::InsufficientUserQuota
            | Self::TopupAlreadyUpdated
            | Self::CustomerMismatch
            | Self::NotSucceeded => ErrorCategory::IntegrityConflict,

            Self::ProviderError | Self::SignatureError | Self::RefundStoreError => {
                ErrorCategory::External
            }

            Self::RefundIncomplete => ErrorCategory::Partial,

            Self::InternalError => ErrorCategory::System,
        }
    }

    /// HTTP status for this kind.
    pub fn http_status(&self) -> StatusCode {
        match self.category() {
            ErrorCategory::Validation => StatusCode::BAD_REQUEST,
            ErrorCategory::Auth => match self {
                Self::NotAdmin => StatusCode::FORBIDDEN,
                _ => StatusCode::UNAUTHORIZED,
            },
            ErrorCategory::NotFound => StatusCode::NOT_FOUND,
            ErrorCategory::StateConflict | ErrorCategory::IntegrityConflict => {
                StatusCode::CONFLICT
            }
            ErrorCategory::External | ErrorCategory::Partial | ErrorCategory::System => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<ErrorKind> for &'static str {
    fn from(kind: ErrorKind) -> Self {
        kind.as_str()
    }
}

impl TryFrom<String> for ErrorKind {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        ALL_KINDS
            .iter()
            .find(|k| k.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown error kind: {s}"))
    }
}

const ALL_KINDS: &[ErrorKind] = &[
    ErrorKind::ValidationFailed,
    ErrorKind::InvalidAmount,
    ErrorKind::InvalidFeePercent,
    ErrorKind::InvalidUserId,
    ErrorKind::InvalidUserIds,
    ErrorKind::TooManyUserIds,
    ErrorKind::InvalidRefundAmountRange,
    ErrorKind::Unauthorized,
    ErrorKind::NotAdmin,
    ErrorKind::UserNotFound,
    ErrorKind::TopupNotFound,
    ErrorKind::RefundNotFound,
    ErrorKind::NothingToRefund,
    ErrorKind::TopupNotRefundable,
    ErrorKind::FeeTooHigh,
    ErrorKind::RefundAmountOutOfRange,
    ErrorKind::MultipleCurrencies,
    ErrorKind::InsufficientUserQuota,
    ErrorKind::TopupAlreadyUpdated,
    ErrorKind::CustomerMismatch,
    ErrorKind::NotSucceeded,
    ErrorKind::ProviderError,
    ErrorKind::SignatureError,
    ErrorKind::RefundStoreError,
    ErrorKind::RefundIncomplete,
    ErrorKind::InternalError,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings_round_trip() {
        for kind in ALL_KINDS {
            let s = kind.as_str().to_string();
            let parsed = ErrorKind::try_from(s).unwrap();
            assert_eq!(parsed, *kind);
        }
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(
            ErrorKind::InvalidAmount.http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ErrorKind::Unauthorized.http_status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ErrorKind::NotAdmin.http_status(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorKind::UserNotFound.http_status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ErrorKind::NothingToRefund.http_status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ErrorKind::InsufficientUserQuota.http_status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ErrorKind::RefundIncomplete.http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(ErrorKind::try_from("no_such_kind".to_string()).is_err());
    }
}
