//! Refund provider adapters
//!
//! Two polymorphic refund sinks share one contract: issue a refund of N minor
//! units against a specific prior payment, idempotently. The idempotency key
//! is chosen by the caller and must be deterministic for
//! (batch_id, target_id, amount); repeating a call with the same key must not
//! double-refund.

pub mod aggregator;
pub mod card;

use serde_json::Value;

/// What a successful provider call hands back for the audit row.
#[derive(Debug, Clone)]
pub struct ProviderRefundOutcome {
    /// The provider's own refund identifier, when it echoes one
    pub provider_refund_no: Option<String>,
    /// The provider response verbatim, for raw_response
    pub raw_response: Value,
}
