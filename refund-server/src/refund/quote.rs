//! Quote assembly: normalize history into the pure algorithm's inputs
//!
//! Gathers the user's top-ups, the refund ledger and (when a card customer is
//! attached) the processor's charge list, derives the currently-refundable
//! per-order tuples and hands them to [`shared::quote::compute_quote`]. The
//! normalization itself is pure and fully unit-tested; only the gathering
//! suspends.

use std::collections::HashMap;

use shared::error::{AppError, AppResult, ErrorKind};
use shared::money::{cents_to_quota, parse_yuan_to_cents};
use shared::quote::{
    compute_quote, Channel, ChannelTotals, OrderSource, Quote, QuoteInput, UserSnapshot,
};

use crate::audit::{self, RefundHistoryRow};
use crate::db::topups::TopupRow;
use crate::db::users::UserRow;
use crate::error::ServiceResult;
use crate::providers::card::CardCharge;
use crate::state::AppState;

/// Card charges were dropped from the quote because their single currency is
/// not CNY. The aggregator side still quotes normally.
pub const WARNING_NON_CNY: &str = "non_cny_card_charges_ignored";

/// Per-target sums of what the ledger already holds against a payment.
#[derive(Debug, Default, Clone, Copy)]
pub struct RefundedSoFar {
    pub minor: i128,
    pub quota: i128,
}

/// History rows folded into per-target lookup maps.
#[derive(Debug, Default)]
pub struct RefundedIndex {
    pub by_trade_no: HashMap<String, RefundedSoFar>,
    pub by_charge_id: HashMap<String, RefundedSoFar>,
    pub by_payment_intent: HashMap<String, RefundedSoFar>,
}

impl RefundedIndex {
    pub fn from_history(history: &[RefundHistoryRow]) -> Self {
        let mut index = Self::default();
        for row in history {
            if let Some(trade_no) = &row.topup_trade_no {
                let entry = index.by_trade_no.entry(trade_no.clone()).or_default();
                entry.minor += row.refund_money_minor as i128;
                entry.quota += row.quota_delta as i128;
            }
            if let Some(charge_id) = &row.card_charge_id {
                let entry = index.by_charge_id.entry(charge_id.clone()).or_default();
                entry.minor += row.refund_money_minor as i128;
                entry.quota += row.quota_delta as i128;
            }
            if let Some(pi) = &row.card_payment_intent_id {
                let entry = index.by_payment_intent.entry(pi.clone()).or_default();
                entry.minor += row.refund_money_minor as i128;
                entry.quota += row.quota_delta as i128;
            }
        }
        index
    }

    fn for_charge(&self, charge: &CardCharge) -> RefundedSoFar {
        // Ledger rows may reference the charge, its payment intent, or both;
        // take whichever carries the larger quota to avoid double counting.
        let by_charge = self.by_charge_id.get(&charge.id).copied().unwrap_or_default();
        let by_pi = charge
            .payment_intent
            .as_ref()
            .and_then(|pi| self.by_payment_intent.get(pi))
            .copied()
            .unwrap_or_default();
        if by_charge.quota >= by_pi.quota {
            by_charge
        } else {
            by_pi
        }
    }
}

/// Everything downstream consumers need: the quote itself plus the raw
/// material the execution engine builds its legs from.
pub struct QuoteContext {
    pub quote: Quote,
    pub warning: Option<&'static str>,
    /// Refundable card charges, newest first
    pub card_charges: Vec<CardCharge>,
    /// Aggregator top-ups, newest completion first
    pub aggregator_topups: Vec<TopupRow>,
    pub refunded: RefundedIndex,
}

/// Pure normalization product, shared by the per-user path and the fleet
/// estimate.
#[derive(Debug)]
pub struct AssembledOrders {
    pub orders: Vec<OrderSource>,
    pub aggregator: ChannelTotals,
    pub card: ChannelTotals,
    pub card_currency: Option<String>,
    pub warning: Option<&'static str>,
}

fn topup_created_at(topup: &TopupRow) -> i64 {
    topup.complete_time.unwrap_or(topup.create_time)
}

/// Grant of a top-up in quota units, before any refunds: `amount` when
/// present, else the paid amount itself.
fn topup_original_grant(topup: &TopupRow, money_cents: i128) -> AppResult<i128> {
    match topup.amount.as_deref() {
        Some(amount) if !amount.is_empty() => {
            Ok(cents_to_quota(parse_yuan_to_cents(amount)?.max(0)))
        }
        _ => Ok(cents_to_quota(money_cents)),
    }
}

/// Normalize one user's history into algorithm inputs.
///
/// Fails with `stripe_multiple_currencies` when the charge list mixes
/// currencies. A single non-CNY currency drops the card side with a warning
/// instead; those charges cannot be valued in CNY cents.
pub fn assemble_orders(
    topups: &[TopupRow],
    refunded: &RefundedIndex,
    charges: &[CardCharge],
) -> AppResult<AssembledOrders> {
    let mut orders = Vec::new();
    let mut aggregator = ChannelTotals::default();
    let mut card = ChannelTotals::default();
    let mut warning = None;

    // Aggregator top-ups. The `money` column is authoritative here.
    for topup in topups.iter().filter(|t| t.is_aggregator()) {
        let money_cents = parse_yuan_to_cents(&topup.money)?.max(0);
        let prior = refunded
            .by_trade_no
            .get(&topup.trade_no)
            .copied()
            .unwrap_or_default();

        let paid_cents = (money_cents - prior.minor).max(0);
        let original_grant = topup_original_grant(topup, money_cents)?;
        let grant_quota = (original_grant - prior.quota).max(0);

        aggregator.gross_cents += money_cents;
        aggregator.refunded_cents += prior.minor.min(money_cents);
        aggregator.net_cents += paid_cents;

        orders.push(OrderSource {
            id: topup.id.to_string(),
            channel: Channel::Aggregator,
            paid_cents,
            grant_quota,
            created_at: topup_created_at(topup),
        });
    }

    // Card charges. The processor is authoritative for paid amounts; the
    // matching top-up row (by charge id or payment-intent id) supplies the
    // promotional grant when it exists.
    let usable: Vec<&CardCharge> = charges
        .iter()
        .filter(|c| c.paid && c.status == "succeeded" && c.amount > 0)
        .collect();

    let mut currencies: Vec<String> = usable
        .iter()
        .map(|c| c.currency.to_ascii_lowercase())
        .collect();
    currencies.sort();
    currencies.dedup();

    if currencies.len() > 1 {
        return Err(AppError::with_message(
            ErrorKind::MultipleCurrencies,
            format!("card charges span multiple currencies: {}", currencies.join(", ")),
        ));
    }

    let card_currency = currencies.into_iter().next();
    let card_usable = match card_currency.as_deref() {
        Some("cny") | None => usable,
        Some(_) => {
            warning = Some(WARNING_NON_CNY);
            Vec::new()
        }
    };

    let mut topup_by_trade_no: HashMap<&str, &TopupRow> = HashMap::new();
    for topup in topups {
        topup_by_trade_no.insert(topup.trade_no.as_str(), topup);
    }

    for charge in &card_usable {
        let paid_cents = charge.remaining() as i128;
        let prior = refunded.for_charge(charge);

        let matched = topup_by_trade_no.get(charge.id.as_str()).or_else(|| {
            charge
                .payment_intent
                .as_deref()
                .and_then(|pi| topup_by_trade_no.get(pi))
        });

        // No matching top-up: assume a grant equal to the charge itself.
        // This ignores promotional grants and may misrank such orders.
        let original_grant = match matched {
            Some(topup) => topup_original_grant(topup, charge.amount as i128)?,
            None => cents_to_quota(charge.amount as i128),
        };
        let grant_quota = (original_grant - prior.quota).max(0);

        card.gross_cents += charge.amount as i128;
        card.refunded_cents += charge.amount_refunded as i128;
        card.net_cents += paid_cents;

        orders.push(OrderSource {
            id: charge.id.clone(),
            channel: Channel::Card,
            paid_cents,
            grant_quota,
            created_at: charge.created,
        });
    }

    Ok(AssembledOrders {
        orders,
        aggregator,
        card,
        card_currency,
        warning,
    })
}

pub fn user_snapshot(user: &UserRow) -> UserSnapshot {
    UserSnapshot {
        id: user.id,
        email: user.email.clone(),
        card_customer_id: user.card_customer_id.clone(),
        quota: user.quota as i128,
        used_quota: user.used_quota as i128,
    }
}

/// Quote from pre-fetched rows. Pure.
pub fn quote_from_parts(
    user: &UserRow,
    topups: &[TopupRow],
    refunded: &RefundedIndex,
    charges: &[CardCharge],
) -> AppResult<(Quote, AssembledOrders)> {
    let assembled = assemble_orders(topups, refunded, charges)?;
    let quote = compute_quote(QuoteInput {
        user: user_snapshot(user),
        orders: assembled.orders.clone(),
        aggregator: assembled.aggregator.clone(),
        card: assembled.card.clone(),
    });
    Ok((quote, assembled))
}

/// Gather a user's full refund context: business DB, refund ledger, card
/// processor. This is the only suspending step on the quote path.
pub async fn build_quote_context(state: &AppState, user: &UserRow) -> ServiceResult<QuoteContext> {
    let topups = crate::db::topups::list_for_user(&state.business, user.id).await?;
    let history = audit::history_for_user(&state.audit, user.id).await?;
    let refunded = RefundedIndex::from_history(&history);

    let charges = match (&state.card, &user.card_customer_id) {
        (Some(card), Some(customer_id)) => card.list_customer_charges(customer_id).await?,
        _ => Vec::new(),
    };

    let (quote, assembled) = quote_from_parts(user, &topups, &refunded, &charges)?;

    // Engine leg sources: refundable card charges newest first, aggregator
    // top-ups newest completion first.
    let mut card_charges: Vec<CardCharge> = charges
        .into_iter()
        .filter(|c| {
            c.paid
                && c.status == "succeeded"
                && c.remaining() > 0
                && assembled.card_currency.as_deref() == Some(c.currency.to_ascii_lowercase().as_str())
                && assembled.warning.is_none()
        })
        .collect();
    card_charges.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| b.id.cmp(&a.id)));

    let mut aggregator_topups: Vec<TopupRow> = topups
        .into_iter()
        .filter(|t| t.is_aggregator())
        .collect();
    aggregator_topups.sort_by(|a, b| {
        topup_created_at(b)
            .cmp(&topup_created_at(a))
            .then_with(|| b.id.cmp(&a.id))
    });

    Ok(QuoteContext {
        quote,
        warning: assembled.warning,
        card_charges,
        aggregator_topups,
        refunded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::money::QUOTA_PER_YUAN;

    fn topup(id: i64, method: &str, trade_no: &str, money: &str, amount: Option<&str>) -> TopupRow {
        TopupRow {
            id,
            user_id: 1,
            money: money.to_string(),
            amount: amount.map(String::from),
            trade_no: trade_no.to_string(),
            create_time: 1_700_000_000 + id,
            complete_time: Some(1_700_000_100 + id),
            payment_method: method.to_string(),
            status: "success".to_string(),
        }
    }

    fn charge(id: &str, amount: i64, refunded: i64, currency: &str) -> CardCharge {
        CardCharge {
            id: id.to_string(),
            created: 1_700_000_000,
            currency: currency.to_string(),
            amount,
            amount_refunded: refunded,
            payment_intent: Some(format!("pi_{id}")),
            paid: true,
            status: "succeeded".to_string(),
        }
    }

    fn history(
        trade_no: Option<&str>,
        charge_id: Option<&str>,
        pi: Option<&str>,
        minor: i64,
        quota: i64,
    ) -> RefundHistoryRow {
        RefundHistoryRow {
            mysql_user_id: 1,
            topup_trade_no: trade_no.map(String::from),
            card_charge_id: charge_id.map(String::from),
            card_payment_intent_id: pi.map(String::from),
            refund_money_minor: minor,
            quota_delta: quota,
        }
    }

    #[test]
    fn test_aggregator_tuple_nets_out_prior_refunds() {
        let topups = vec![topup(1, "alipay", "T1", "10.00", Some("10.00"))];
        let refunded = RefundedIndex::from_history(&[history(
            Some("T1"),
            None,
            None,
            400,
            (QUOTA_PER_YUAN * 4) as i64,
        )]);
        let assembled = assemble_orders(&topups, &refunded, &[]).unwrap();

        assert_eq!(assembled.orders.len(), 1);
        let order = &assembled.orders[0];
        assert_eq!(order.paid_cents, 600);
        assert_eq!(order.grant_quota, QUOTA_PER_YUAN * 6);
        assert_eq!(assembled.aggregator.gross_cents, 1000);
        assert_eq!(assembled.aggregator.refunded_cents, 400);
        assert_eq!(assembled.aggregator.net_cents, 600);
    }

    #[test]
    fn test_aggregator_grant_falls_back_to_money() {
        let topups = vec![topup(1, "wxpay", "T2", "8.00", None)];
        let assembled = assemble_orders(&topups, &RefundedIndex::default(), &[]).unwrap();
        assert_eq!(assembled.orders[0].grant_quota, QUOTA_PER_YUAN * 8);
    }

    #[test]
    fn test_card_tuple_uses_processor_remaining() {
        let charges = vec![charge("ch_1", 2000, 500, "cny")];
        let assembled = assemble_orders(&[], &RefundedIndex::default(), &charges).unwrap();
        let order = &assembled.orders[0];
        assert_eq!(order.channel, Channel::Card);
        assert_eq!(order.paid_cents, 1500);
        // No matching top-up: grant falls back to the charge amount.
        assert_eq!(order.grant_quota, QUOTA_PER_YUAN * 20);
        assert_eq!(assembled.card.net_cents, 1500);
    }

    #[test]
    fn test_card_grant_from_matching_topup_by_charge_id() {
        let topups = vec![topup(5, "stripe", "ch_1", "20.00", Some("40.00"))];
        let charges = vec![charge("ch_1", 2000, 0, "cny")];
        let assembled = assemble_orders(&topups, &RefundedIndex::default(), &charges).unwrap();
        // The aggregator loop skips stripe rows; only the charge row remains.
        assert_eq!(assembled.orders.len(), 1);
        assert_eq!(assembled.orders[0].grant_quota, QUOTA_PER_YUAN * 40);
    }

    #[test]
    fn test_card_grant_from_matching_topup_by_payment_intent() {
        let topups = vec![topup(5, "stripe", "pi_ch_1", "20.00", Some("30.00"))];
        let charges = vec![charge("ch_1", 2000, 0, "cny")];
        let assembled = assemble_orders(&topups, &RefundedIndex::default(), &charges).unwrap();
        assert_eq!(assembled.orders[0].grant_quota, QUOTA_PER_YUAN * 30);
    }

    #[test]
    fn test_card_prior_quota_matched_by_either_id() {
        let charges = vec![charge("ch_1", 2000, 0, "cny")];
        let refunded = RefundedIndex::from_history(&[history(
            None,
            None,
            Some("pi_ch_1"),
            0,
            (QUOTA_PER_YUAN * 5) as i64,
        )]);
        let assembled = assemble_orders(&[], &refunded, &charges).unwrap();
        assert_eq!(assembled.orders[0].grant_quota, QUOTA_PER_YUAN * 15);
    }

    #[test]
    fn test_unpaid_and_failed_charges_ignored() {
        let mut unpaid = charge("ch_1", 1000, 0, "cny");
        unpaid.paid = false;
        let mut failed = charge("ch_2", 1000, 0, "cny");
        failed.status = "failed".to_string();
        let assembled =
            assemble_orders(&[], &RefundedIndex::default(), &[unpaid, failed]).unwrap();
        assert!(assembled.orders.is_empty());
        assert_eq!(assembled.card.gross_cents, 0);
    }

    #[test]
    fn test_multiple_currencies_rejected() {
        let charges = vec![charge("ch_1", 1000, 0, "cny"), charge("ch_2", 1000, 0, "usd")];
        let err = assemble_orders(&[], &RefundedIndex::default(), &charges).unwrap_err();
        assert_eq!(err.kind, ErrorKind::MultipleCurrencies);
    }

    #[test]
    fn test_single_non_cny_currency_dropped_with_warning() {
        let charges = vec![charge("ch_1", 1000, 0, "usd")];
        let assembled = assemble_orders(&[], &RefundedIndex::default(), &charges).unwrap();
        assert!(assembled.orders.is_empty());
        assert_eq!(assembled.warning, Some(WARNING_NON_CNY));
        assert_eq!(assembled.card_currency.as_deref(), Some("usd"));
    }

    #[test]
    fn test_malformed_money_is_a_validation_error() {
        let topups = vec![topup(1, "alipay", "T1", "not-money", None)];
        let err = assemble_orders(&topups, &RefundedIndex::default(), &[]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidAmount);
    }

    #[test]
    fn test_full_quote_prefers_card_channel() {
        // 30.00 net paid by card over two charges, 10.00 by aggregator;
        // consumption leaves 25.00 due. The plan takes all of it from card.
        let user = UserRow {
            id: 1,
            email: None,
            card_customer_id: Some("cus_1".into()),
            quota: (QUOTA_PER_YUAN * 25) as i64,
            used_quota: (QUOTA_PER_YUAN * 15) as i64,
        };
        let topups = vec![topup(1, "alipay", "T1", "10.00", Some("10.00"))];
        let mut newest = charge("ch_new", 2000, 0, "cny");
        newest.created = 1_700_000_500;
        let mut older = charge("ch_old", 1000, 0, "cny");
        older.created = 1_700_000_100;

        let (quote, _) = quote_from_parts(
            &user,
            &topups,
            &RefundedIndex::default(),
            &[older, newest],
        )
        .unwrap();

        assert_eq!(quote.total_net_paid_cents, 4000);
        assert_eq!(quote.due_cents, 2500);
        assert_eq!(quote.plan.card_cents, 2500);
        assert_eq!(quote.plan.aggregator_cents, 0);
    }
}
