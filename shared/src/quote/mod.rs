//! Refund quote domain types and algorithm
//!
//! The quote answers: how much money is this user entitled to reclaim right
//! now, and how does it split across payment channels. The computation is
//! pure: callers gather the normalized per-top-up rows (business DB, card
//! processor, refund ledger) and hand them in; nothing here suspends.

mod algorithm;

pub use algorithm::compute_quote;

use crate::money::format_cents_to_yuan;
use crate::util::i128_string;
use serde::{Deserialize, Serialize};

/// Which refund sink a top-up belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Aggregator,
    Card,
    /// Synthetic pool for grants that map to no payment. Never refundable.
    Gift,
}

/// One normalized refundable top-up, as seen right now.
///
/// `paid_cents` and `grant_quota` are already net of prior refunds and
/// clamped non-negative by the reader that produced the row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSource {
    pub id: String,
    pub channel: Channel,
    #[serde(with = "i128_string")]
    pub paid_cents: i128,
    #[serde(with = "i128_string")]
    pub grant_quota: i128,
    /// Unix seconds
    pub created_at: i64,
}

/// Gross/refunded/net paid aggregates for one channel, in cents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelTotals {
    #[serde(with = "i128_string")]
    pub gross_cents: i128,
    #[serde(with = "i128_string")]
    pub refunded_cents: i128,
    #[serde(with = "i128_string")]
    pub net_cents: i128,
}

/// User fields the quote needs and echoes back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSnapshot {
    pub id: i64,
    pub email: Option<String>,
    pub card_customer_id: Option<String>,
    #[serde(with = "i128_string")]
    pub quota: i128,
    #[serde(with = "i128_string")]
    pub used_quota: i128,
}

/// Everything the pure algorithm consumes.
#[derive(Debug, Clone)]
pub struct QuoteInput {
    pub user: UserSnapshot,
    pub orders: Vec<OrderSource>,
    pub aggregator: ChannelTotals,
    pub card: ChannelTotals,
}

/// Per-order computation trace row, in allocation order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderComputation {
    pub id: String,
    pub channel: Channel,
    #[serde(with = "i128_string")]
    pub paid_cents: i128,
    #[serde(with = "i128_string")]
    pub grant_quota: i128,
    pub created_at: i64,
    /// paid_cents expressed in quota units
    #[serde(with = "i128_string")]
    pub paid_quota: i128,
    /// Promotional ratio (g - p_quota)/g in permille, for display only
    pub promo_permille: i64,
    /// Consumption assigned to this order
    #[serde(with = "i128_string")]
    pub consumed_quota: i128,
    /// Refundable quota remaining on this order
    #[serde(with = "i128_string")]
    pub refundable_quota: i128,
}

/// The refund split across the two provider channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundPlan {
    #[serde(with = "i128_string")]
    pub card_cents: i128,
    #[serde(with = "i128_string")]
    pub aggregator_cents: i128,
}

impl RefundPlan {
    pub fn card_yuan(&self) -> String {
        format_cents_to_yuan(self.card_cents)
    }

    pub fn aggregator_yuan(&self) -> String {
        format_cents_to_yuan(self.aggregator_cents)
    }
}

/// The quote: everything the operator sees before committing a refund.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub user: UserSnapshot,
    pub aggregator: ChannelTotals,
    pub card: ChannelTotals,
    /// Σ paid_cents over real (non-gift) orders
    #[serde(with = "i128_string")]
    pub total_net_paid_cents: i128,
    /// Σ refundable quota over all orders
    #[serde(with = "i128_string")]
    pub refundable_quota_total: i128,
    #[serde(with = "i128_string")]
    pub due_cents: i128,
    pub plan: RefundPlan,
    /// Sorted per-order computation trace
    pub orders: Vec<OrderComputation>,
}

impl Quote {
    pub fn due_yuan(&self) -> String {
        format_cents_to_yuan(self.due_cents)
    }
}
