//! Application error type and the API error envelope

use super::codes::{ErrorCategory, ErrorKind};
use http::StatusCode;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Application error with a wire-stable kind and optional structured details.
///
/// Serialized over HTTP as `{"error": <kind>, "message": <string>, "details": <object>}`.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct AppError {
    /// The kind identifying the type of error
    pub kind: ErrorKind,
    /// Human-readable message. May include yuan values, never raw provider payloads.
    pub message: String,
    /// Optional additional details (per-leg results, offending fields, etc.)
    pub details: Option<BTreeMap<String, Value>>,
}

impl AppError {
    /// Create a new error with a default message derived from the kind.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            message: kind.as_str().replace('_', " "),
            kind,
            details: None,
        }
    }

    /// Create a new error with a custom message.
    pub fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    /// Add a detail entry to this error.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn http_status(&self) -> StatusCode {
        self.kind.http_status()
    }

    // ==================== Convenience constructors ====================

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::with_message(ErrorKind::ValidationFailed, msg)
    }

    pub fn invalid_amount(msg: impl Into<String>) -> Self {
        Self::with_message(ErrorKind::InvalidAmount, msg)
    }

    pub fn not_found(kind: ErrorKind, resource: impl Into<String>) -> Self {
        let r = resource.into();
        Self::with_message(kind, format!("{r} not found"))
    }

    pub fn unauthorized() -> Self {
        Self::with_message(ErrorKind::Unauthorized, "missing or invalid token")
    }

    pub fn not_admin() -> Self {
        Self::with_message(ErrorKind::NotAdmin, "administrator access required")
    }

    pub fn provider(msg: impl Into<String>) -> Self {
        Self::with_message(ErrorKind::ProviderError, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::with_message(ErrorKind::InternalError, msg)
    }
}

/// Error envelope as serialized to the wire.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<BTreeMap<String, Value>>,
}

impl From<&AppError> for ErrorEnvelope {
    fn from(err: &AppError) -> Self {
        Self {
            error: err.kind.as_str(),
            message: Some(err.message.clone()),
            details: err.details.clone(),
        }
    }
}

/// Type alias for Result with AppError.
pub type AppResult<T> = Result<T, AppError>;

// ===== Axum integration =====

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        use axum::Json;

        // System errors carry their real message only into the log.
        let sanitized = if self.kind.category() == ErrorCategory::System {
            tracing::error!(kind = %self.kind, message = %self.message, "system error");
            AppError::with_message(self.kind, "internal error")
        } else {
            self
        };

        let status = sanitized.http_status();
        let body = ErrorEnvelope::from(&sanitized);
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_derives_message_from_kind() {
        let err = AppError::new(ErrorKind::NothingToRefund);
        assert_eq!(err.kind, ErrorKind::NothingToRefund);
        assert_eq!(err.message, "nothing to refund");
        assert!(err.details.is_none());
    }

    #[test]
    fn test_with_message_and_detail() {
        let err = AppError::with_message(ErrorKind::RefundAmountOutOfRange, "net 0.50 below 1.00")
            .with_detail("net_yuan", "0.50")
            .with_detail("min_yuan", "1.00");
        assert_eq!(err.kind, ErrorKind::RefundAmountOutOfRange);
        let details = err.details.unwrap();
        assert_eq!(details.get("net_yuan").unwrap(), "0.50");
        assert_eq!(details.get("min_yuan").unwrap(), "1.00");
    }

    #[test]
    fn test_envelope_shape() {
        let err = AppError::with_message(ErrorKind::FeeTooHigh, "fee consumes entire refund")
            .with_detail("fee_bps", 10000);
        let envelope = ErrorEnvelope::from(&err);
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["error"], "fee_too_high");
        assert_eq!(json["message"], "fee consumes entire refund");
        assert_eq!(json["details"]["fee_bps"], 10000);
    }

    #[test]
    fn test_envelope_omits_empty_fields() {
        let envelope = ErrorEnvelope {
            error: "user_not_found",
            message: None,
            details: None,
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert_eq!(json, r#"{"error":"user_not_found"}"#);
    }

    #[test]
    fn test_http_status_passthrough() {
        assert_eq!(
            AppError::new(ErrorKind::UserNotFound).http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::unauthorized().http_status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(AppError::not_admin().http_status(), StatusCode::FORBIDDEN);
    }
}
