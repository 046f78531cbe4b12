//! Refund execution engine
//!
//! Turns a quote plus the operator's directive into a serialized sequence of
//! provider legs. Each leg follows reserve → log pending → provider call →
//! settle; a provider failure releases the reserve, marks the audit row
//! failed and aborts the batch. Legs already settled stay settled; partial
//! success is surfaced, never rolled back.

use serde_json::json;
use uuid::Uuid;

use shared::error::{AppError, AppResult, ErrorKind};
use shared::money::{cents_to_quota, format_cents_to_yuan, parse_fee_percent, parse_yuan_to_cents};
use shared::quote::Quote;

use crate::audit::{self, NewRefundLog, PROVIDER_AGGREGATOR, PROVIDER_CARD};
use crate::db::users;
use crate::error::{ServiceError, ServiceResult};
use crate::providers::aggregator::{AggregatorRefundRequest, OrderNoField};
use crate::providers::card::CardRefundTarget;
use crate::refund::quote::QuoteContext;
use crate::refund::trace::TraceBuilder;
use crate::state::AppState;

pub const DEFAULT_FEE_BPS: u32 = 500;

/// Operator inputs for one execution.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct RefundDirective {
    pub amount_yuan: Option<String>,
    pub fee_percent: Option<String>,
    pub min_refund_yuan: Option<String>,
    pub max_refund_yuan: Option<String>,
    #[serde(default)]
    pub clear_balance: bool,
    #[serde(default)]
    pub dry_run: bool,
}

/// Amounts derived from the quote and the directive before any side effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Derivation {
    pub gross_cents: i128,
    pub fee_bps: u32,
    pub fee_cents: i128,
    pub net_cents: i128,
    /// Total to subtract from user.quota across the whole batch
    pub target_quota_delta: i128,
}

/// Derive the batch amounts. Pure; no side effects.
pub fn derive(quote: &Quote, directive: &RefundDirective) -> AppResult<Derivation> {
    let fee_bps = parse_fee_percent(directive.fee_percent.as_deref(), DEFAULT_FEE_BPS)?;

    let gross_cents = match directive.amount_yuan.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(raw) => {
            let requested = parse_yuan_to_cents(raw)?;
            if requested <= 0 {
                return Err(AppError::invalid_amount(format!(
                    "refund amount must be positive, got {raw}"
                )));
            }
            requested.min(quote.due_cents)
        }
        None => quote.due_cents,
    };

    if gross_cents <= 0 {
        return Err(AppError::with_message(
            ErrorKind::NothingToRefund,
            "no refundable balance for this user",
        ));
    }

    let fee_cents = gross_cents * fee_bps as i128 / 10_000;
    let net_cents = gross_cents - fee_cents;
    if net_cents <= 0 {
        return Err(AppError::with_message(
            ErrorKind::FeeTooHigh,
            format!("fee of {fee_bps} bps consumes the entire refund"),
        ));
    }

    let min_cents = directive
        .min_refund_yuan
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(parse_yuan_to_cents)
        .transpose()?;
    let max_cents = directive
        .max_refund_yuan
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(parse_yuan_to_cents)
        .transpose()?;

    if let (Some(min), Some(max)) = (min_cents, max_cents) {
        if min > max {
            return Err(AppError::with_message(
                ErrorKind::InvalidRefundAmountRange,
                format!(
                    "min {} exceeds max {}",
                    format_cents_to_yuan(min),
                    format_cents_to_yuan(max)
                ),
            ));
        }
    }
    if min_cents.is_some_and(|min| net_cents < min) || max_cents.is_some_and(|max| net_cents > max)
    {
        return Err(AppError::with_message(
            ErrorKind::RefundAmountOutOfRange,
            format!(
                "net refund {} is outside the allowed range",
                format_cents_to_yuan(net_cents)
            ),
        )
        .with_detail("net_yuan", format_cents_to_yuan(net_cents)));
    }

    let target_quota_delta = if directive.clear_balance {
        quote.user.quota
    } else {
        cents_to_quota(gross_cents)
    };

    Ok(Derivation {
        gross_cents,
        fee_bps,
        fee_cents,
        net_cents,
        target_quota_delta,
    })
}

/// Quota to reserve for one leg: proportional to the leg's share of the
/// remaining cents, with the final exhausting leg absorbing the integer
/// rounding remainder.
pub fn leg_quota_delta(
    remaining_quota_delta: i128,
    remaining_cents: i128,
    amount_cents: i128,
) -> i128 {
    if amount_cents >= remaining_cents {
        remaining_quota_delta
    } else {
        remaining_quota_delta * amount_cents / remaining_cents
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Aggregator,
    Card,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aggregator => PROVIDER_AGGREGATOR,
            Self::Card => PROVIDER_CARD,
        }
    }
}

/// One planned provider call.
#[derive(Debug, Clone)]
pub struct LegSpec {
    pub provider: ProviderKind,
    /// Charge id for card legs, trade_no for aggregator legs
    pub target_id: String,
    pub amount_cents: i128,
    pub payment_method: String,
    pub currency: String,
    pub charge_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub trade_no: Option<String>,
}

/// Aggregator leg source: the refundable cap of one top-up.
#[derive(Debug, Clone)]
pub struct AggregatorLegSource {
    pub trade_no: String,
    pub payment_method: String,
    pub cap_cents: i128,
}

/// Card leg source: one charge with money left on it.
#[derive(Debug, Clone)]
pub struct CardLegSource {
    pub charge_id: String,
    pub payment_intent_id: Option<String>,
    pub cap_cents: i128,
    pub currency: String,
}

/// Plan the leg sequence: card charges first (already newest-first), then
/// aggregator top-ups (already newest-first), each capped by what is left on
/// the payment. Returns the legs and the cents no channel could place.
pub fn plan_legs(
    net_cents: i128,
    card_sources: &[CardLegSource],
    aggregator_sources: &[AggregatorLegSource],
) -> (Vec<LegSpec>, i128) {
    let mut legs = Vec::new();
    let mut remaining = net_cents;

    for source in card_sources {
        if remaining <= 0 {
            break;
        }
        let amount = source.cap_cents.min(remaining);
        if amount <= 0 {
            continue;
        }
        remaining -= amount;
        legs.push(LegSpec {
            provider: ProviderKind::Card,
            target_id: source.charge_id.clone(),
            amount_cents: amount,
            payment_method: crate::db::topups::METHOD_STRIPE.to_string(),
            currency: source.currency.clone(),
            charge_id: Some(source.charge_id.clone()),
            payment_intent_id: source.payment_intent_id.clone(),
            trade_no: None,
        });
    }

    for source in aggregator_sources {
        if remaining <= 0 {
            break;
        }
        let amount = source.cap_cents.min(remaining);
        if amount <= 0 {
            continue;
        }
        remaining -= amount;
        legs.push(LegSpec {
            provider: ProviderKind::Aggregator,
            target_id: source.trade_no.clone(),
            amount_cents: amount,
            payment_method: source.payment_method.clone(),
            currency: "cny".to_string(),
            charge_id: None,
            payment_intent_id: None,
            trade_no: Some(source.trade_no.clone()),
        });
    }

    (legs, remaining)
}

/// Deterministic idempotency key for one leg.
pub fn out_refund_no(provider: ProviderKind, batch_id: &str, target_id: &str, amount_cents: i128) -> String {
    format!("{}_{}_{}_{}", provider.as_str(), batch_id, target_id, amount_cents)
}

/// The shared trace prefix every leg's raw_request carries: inputs, the
/// quote, the derivation. Each leg appends its own operation step.
pub fn base_trace(
    quote: &Quote,
    directive: &RefundDirective,
    derivation: &Derivation,
) -> TraceBuilder {
    let mut trace = TraceBuilder::new();
    trace.push(
        "inputs",
        json!({
            "amount_yuan": directive.amount_yuan,
            "fee_percent": directive.fee_percent,
            "min_refund_yuan": directive.min_refund_yuan,
            "max_refund_yuan": directive.max_refund_yuan,
            "clear_balance": directive.clear_balance,
            "dry_run": directive.dry_run,
        }),
    );
    trace.push("quote.user", json!(quote.user));
    trace.push(
        "quote.quota",
        json!({
            "quota": quote.user.quota.to_string(),
            "used_quota": quote.user.used_quota.to_string(),
        }),
    );
    trace.push("quote.aggregator", json!(quote.aggregator));
    trace.push("quote.card", json!(quote.card));
    trace.push(
        "quote.due",
        json!({
            "formula": "due_cents = min(sum(max(0, paid_quota_i - consumed_i)) / 5000, total_net_paid_cents)",
            "due_cents": quote.due_cents.to_string(),
            "total_net_paid_cents": quote.total_net_paid_cents.to_string(),
            "refundable_quota_total": quote.refundable_quota_total.to_string(),
            "sorted_orders": quote.orders.iter().take(20).collect::<Vec<_>>(),
            "orders_total": quote.orders.len(),
        }),
    );
    trace.push(
        "amount",
        json!({
            "override_yuan": directive.amount_yuan,
            "gross_cents": derivation.gross_cents.to_string(),
        }),
    );
    trace.push(
        "fee",
        json!({
            "fee_bps": derivation.fee_bps,
            "fee_cents": derivation.fee_cents.to_string(),
            "net_cents": derivation.net_cents.to_string(),
        }),
    );
    trace.push(
        "quota_delta",
        json!({
            "clear_balance": directive.clear_balance,
            "target_quota_delta": derivation.target_quota_delta.to_string(),
        }),
    );
    trace.push(
        "execution.init",
        json!({
            "remaining_cents": derivation.net_cents.to_string(),
            "remaining_quota_delta": derivation.target_quota_delta.to_string(),
        }),
    );
    trace
}

/// Outcome of one settled (or attempted) leg.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LegResult {
    pub provider: &'static str,
    pub target_id: String,
    pub amount_yuan: String,
    #[serde(with = "shared::util::i128_string")]
    pub amount_cents: i128,
    #[serde(with = "shared::util::i128_string")]
    pub quota_delta: i128,
    pub status: &'static str,
    pub refund_log_id: Option<Uuid>,
    pub provider_refund_no: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// What one batch execution did.
#[derive(Debug)]
pub struct BatchOutcome {
    pub batch_id: String,
    pub legs: Vec<LegResult>,
    /// Cents that never reached any provider
    pub remaining_cents: i128,
    /// Quota still reserved when the batch could not place all cents
    pub residual_quota_delta: i128,
    /// The business failure that stopped the batch, when one did
    pub failure: Option<AppError>,
}

/// Build the leg sources from a gathered quote context.
pub fn leg_sources_from_context(ctx: &QuoteContext) -> (Vec<CardLegSource>, Vec<AggregatorLegSource>) {
    let card_sources = ctx
        .card_charges
        .iter()
        .map(|c| CardLegSource {
            charge_id: c.id.clone(),
            payment_intent_id: c.payment_intent.clone(),
            cap_cents: c.remaining() as i128,
            currency: c.currency.to_ascii_lowercase(),
        })
        .collect();

    let aggregator_sources = ctx
        .aggregator_topups
        .iter()
        .filter_map(|t| {
            let money_cents = parse_yuan_to_cents(&t.money).ok()?.max(0);
            let prior = ctx
                .refunded
                .by_trade_no
                .get(&t.trade_no)
                .copied()
                .unwrap_or_default();
            let cap = (money_cents - prior.minor).max(0);
            (cap > 0).then(|| AggregatorLegSource {
                trade_no: t.trade_no.clone(),
                payment_method: t.payment_method.clone(),
                cap_cents: cap,
            })
        })
        .collect();

    (card_sources, aggregator_sources)
}

/// Execute a batch. Legs run strictly serialized; the user's quota decrement
/// is the shared resource and concurrent legs would race on its predicate.
#[allow(clippy::too_many_arguments)]
pub async fn execute_batch(
    state: &AppState,
    ctx: &QuoteContext,
    derivation: &Derivation,
    legs: Vec<LegSpec>,
    base_trace: TraceBuilder,
    performed_by: &str,
) -> ServiceResult<BatchOutcome> {
    let user_id = ctx.quote.user.id;
    let batch_id = format!("userrefund_{}_{}", user_id, shared::util::now_millis());

    let mut remaining_cents = derivation.net_cents;
    let mut remaining_quota_delta = derivation.target_quota_delta;
    let mut results: Vec<LegResult> = Vec::new();

    for leg in legs {
        let delta_quota = leg_quota_delta(remaining_quota_delta, remaining_cents, leg.amount_cents);
        let key = out_refund_no(leg.provider, &batch_id, &leg.target_id, leg.amount_cents);
        let amount_yuan = format_cents_to_yuan(leg.amount_cents);

        // 1. Reserve: conditional decrement, affected-row count is the check.
        let delta_quota_i64 = i64::try_from(delta_quota).map_err(|_| {
            ServiceError::App(AppError::internal("quota delta exceeds storage range"))
        })?;
        let reserved = users::reserve_quota(&state.business, user_id, delta_quota_i64).await?;
        if !reserved {
            return Ok(BatchOutcome {
                batch_id,
                remaining_cents,
                residual_quota_delta: 0,
                legs: results,
                failure: Some(AppError::with_message(
                    ErrorKind::InsufficientUserQuota,
                    "user balance no longer covers the refund",
                )),
            });
        }

        // 2. Log pending before the provider sees the key.
        let mut leg_trace = base_trace.clone();
        leg_trace.push(
            "execution.leg",
            json!({
                "batch_id": batch_id,
                "provider": leg.provider.as_str(),
                "target_id": leg.target_id,
                "amount_cents": leg.amount_cents.to_string(),
                "delta_quota": delta_quota.to_string(),
                "remaining_cents_before": remaining_cents.to_string(),
                "remaining_quota_delta_before": remaining_quota_delta.to_string(),
                "out_refund_no": key,
            }),
        );
        let raw_request = leg_trace.to_value();

        let new_log = NewRefundLog {
            mysql_user_id: user_id,
            topup_trade_no: leg.trade_no.as_deref(),
            card_charge_id: leg.charge_id.as_deref(),
            card_payment_intent_id: leg.payment_intent_id.as_deref(),
            payment_method: &leg.payment_method,
            currency: &leg.currency,
            refund_money: &amount_yuan,
            refund_money_minor: leg.amount_cents as i64,
            quota_delta: delta_quota_i64,
            provider: leg.provider.as_str(),
            out_refund_no: &key,
            performed_by: Some(performed_by),
            raw_request: &raw_request,
        };
        let log_id = match audit::insert_pending(&state.audit, &new_log).await {
            Ok(id) => id,
            Err(e) => {
                // The provider never saw this key; release the reserve.
                tracing::error!(error = %e, user_id, "audit insert failed, releasing reserve");
                users::release_quota(&state.business, user_id, delta_quota_i64).await?;
                return Ok(BatchOutcome {
                    batch_id,
                    remaining_cents,
                    residual_quota_delta: 0,
                    legs: results,
                    failure: Some(AppError::with_message(
                        ErrorKind::RefundStoreError,
                        "could not record the refund attempt",
                    )),
                });
            }
        };

        // 3. Provider call, idempotent on the out_refund_no.
        let call_result = match &leg.provider {
            ProviderKind::Card => match &state.card {
                None => Err(AppError::provider("card processor not configured")),
                Some(card) => {
                    let target = CardRefundTarget::Charge(
                        leg.charge_id.clone().unwrap_or_else(|| leg.target_id.clone()),
                    );
                    card.refund(
                        &target,
                        Some(leg.amount_cents as i64),
                        &key,
                        ctx.quote.user.card_customer_id.as_deref(),
                    )
                    .await
                }
            },
            ProviderKind::Aggregator => match &state.aggregator {
                None => Err(AppError::provider("aggregator gateway not configured")),
                Some(aggregator) => {
                    let request = AggregatorRefundRequest {
                        order_no_field: OrderNoField::TradeNo,
                        order_no: leg.trade_no.clone().unwrap_or_else(|| leg.target_id.clone()),
                        money_yuan: amount_yuan.clone(),
                        out_refund_no: key.clone(),
                        timestamp: shared::util::now_millis() / 1000,
                    };
                    aggregator.refund(&request).await
                }
            },
        };

        // 4. Settle.
        match call_result {
            Ok(outcome) => {
                let mut warning = None;
                if let Err(e) = audit::mark_succeeded(
                    &state.audit,
                    log_id,
                    outcome.provider_refund_no.as_deref(),
                    &outcome.raw_response,
                )
                .await
                {
                    // The external side has refunded; the leg still counts.
                    tracing::warn!(error = %e, refund_log_id = %log_id, "audit settle write failed");
                    warning = Some("audit settle write failed; row left pending".to_string());
                }

                remaining_cents -= leg.amount_cents;
                remaining_quota_delta -= delta_quota;
                results.push(LegResult {
                    provider: leg.provider.as_str(),
                    target_id: leg.target_id,
                    amount_yuan,
                    amount_cents: leg.amount_cents,
                    quota_delta: delta_quota,
                    status: audit::STATUS_SUCCEEDED,
                    refund_log_id: Some(log_id),
                    provider_refund_no: outcome.provider_refund_no,
                    warning,
                });
            }
            Err(provider_error) => {
                // Compensating release, then record the failure.
                if let Err(e) =
                    users::release_quota(&state.business, user_id, delta_quota_i64).await
                {
                    tracing::error!(
                        error = %e,
                        user_id,
                        delta_quota = delta_quota_i64,
                        "compensating quota release failed; balance is short until repaired"
                    );
                }
                if let Err(e) =
                    audit::mark_failed(&state.audit, log_id, &provider_error.message, None).await
                {
                    tracing::error!(error = %e, refund_log_id = %log_id, "audit failure write failed");
                }

                results.push(LegResult {
                    provider: leg.provider.as_str(),
                    target_id: leg.target_id,
                    amount_yuan,
                    amount_cents: leg.amount_cents,
                    quota_delta: delta_quota,
                    status: audit::STATUS_FAILED,
                    refund_log_id: Some(log_id),
                    provider_refund_no: None,
                    warning: None,
                });

                return Ok(BatchOutcome {
                    batch_id,
                    remaining_cents,
                    residual_quota_delta: 0,
                    legs: results,
                    failure: Some(provider_error),
                });
            }
        }
    }

    // Proportional truncation can leave a few quota units reserved when the
    // batch ends short; they stay reserved and are reported, not released.
    let residual_quota_delta = if remaining_cents > 0 {
        remaining_quota_delta
    } else {
        0
    };

    Ok(BatchOutcome {
        batch_id,
        legs: results,
        remaining_cents,
        residual_quota_delta,
        failure: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::money::QUOTA_PER_YUAN;
    use shared::quote::{compute_quote, Channel, ChannelTotals, OrderSource, QuoteInput, UserSnapshot};

    fn quote_for(paid_yuan: i128, quota: i128, used_quota: i128) -> Quote {
        // One aggregator order paid `paid_yuan` with an exactly-paid grant.
        compute_quote(QuoteInput {
            user: UserSnapshot {
                id: 1,
                email: None,
                card_customer_id: None,
                quota,
                used_quota,
            },
            orders: vec![OrderSource {
                id: "1".into(),
                channel: Channel::Aggregator,
                paid_cents: paid_yuan * 100,
                grant_quota: paid_yuan * QUOTA_PER_YUAN,
                created_at: 1_700_000_000,
            }],
            aggregator: ChannelTotals::default(),
            card: ChannelTotals::default(),
        })
    }

    fn quote_with_due(due_yuan: i128, quota: i128) -> Quote {
        quote_for(due_yuan, quota, 0)
    }

    fn directive() -> RefundDirective {
        RefundDirective::default()
    }

    #[test]
    fn test_derive_defaults_to_due_with_five_percent_fee() {
        let quote = quote_with_due(10, QUOTA_PER_YUAN * 10);
        let d = derive(&quote, &directive()).unwrap();
        assert_eq!(d.gross_cents, 1000);
        assert_eq!(d.fee_bps, 500);
        assert_eq!(d.fee_cents, 50);
        assert_eq!(d.net_cents, 950);
        assert_eq!(d.target_quota_delta, QUOTA_PER_YUAN * 10);
    }

    #[test]
    fn test_derive_clear_balance_targets_whole_quota() {
        let quote = quote_with_due(10, QUOTA_PER_YUAN * 12);
        let d = derive(
            &quote,
            &RefundDirective {
                clear_balance: true,
                ..directive()
            },
        )
        .unwrap();
        assert_eq!(d.target_quota_delta, QUOTA_PER_YUAN * 12);
    }

    #[test]
    fn test_derive_override_capped_at_due() {
        let quote = quote_with_due(10, QUOTA_PER_YUAN * 10);
        let d = derive(
            &quote,
            &RefundDirective {
                amount_yuan: Some("50.00".into()),
                fee_percent: Some("0".into()),
                ..directive()
            },
        )
        .unwrap();
        assert_eq!(d.gross_cents, 1000);
        assert_eq!(d.net_cents, 1000);
    }

    #[test]
    fn test_derive_zero_due_is_nothing_to_refund() {
        // Balance fully consumed: the grant is gone, nothing left to reclaim.
        let quote = quote_for(10, 0, QUOTA_PER_YUAN * 10);
        assert_eq!(quote.due_cents, 0);
        let err = derive(&quote, &directive()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NothingToRefund);
    }

    #[test]
    fn test_derive_zero_override_is_invalid_amount() {
        let quote = quote_with_due(10, QUOTA_PER_YUAN * 10);
        let err = derive(
            &quote,
            &RefundDirective {
                amount_yuan: Some("0".into()),
                ..directive()
            },
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidAmount);
    }

    #[test]
    fn test_derive_full_fee_is_fee_too_high() {
        let quote = quote_with_due(10, QUOTA_PER_YUAN * 10);
        let err = derive(
            &quote,
            &RefundDirective {
                fee_percent: Some("100".into()),
                ..directive()
            },
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::FeeTooHigh);
    }

    #[test]
    fn test_derive_range_guards() {
        let quote = quote_with_due(10, QUOTA_PER_YUAN * 10);
        // net = 9.50 with the default fee
        let err = derive(
            &quote,
            &RefundDirective {
                min_refund_yuan: Some("10.00".into()),
                ..directive()
            },
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RefundAmountOutOfRange);

        let err = derive(
            &quote,
            &RefundDirective {
                max_refund_yuan: Some("5.00".into()),
                ..directive()
            },
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RefundAmountOutOfRange);

        let err = derive(
            &quote,
            &RefundDirective {
                min_refund_yuan: Some("8.00".into()),
                max_refund_yuan: Some("2.00".into()),
                ..directive()
            },
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRefundAmountRange);

        let ok = derive(
            &quote,
            &RefundDirective {
                min_refund_yuan: Some("9.00".into()),
                max_refund_yuan: Some("10.00".into()),
                ..directive()
            },
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn test_leg_quota_delta_proportional_and_exhausting() {
        // Exhausting leg takes the whole remainder.
        assert_eq!(leg_quota_delta(1_000_000, 1000, 1000), 1_000_000);
        assert_eq!(leg_quota_delta(1_000_000, 1000, 1500), 1_000_000);
        // Proportional share truncates.
        assert_eq!(leg_quota_delta(1_000_000, 1000, 300), 300_000);
        assert_eq!(leg_quota_delta(1_000_001, 1000, 333), 333_000);
    }

    #[test]
    fn test_leg_quota_delta_sums_to_target_when_batch_completes() {
        // Simulate the engine loop: three legs of 300+300+400 against 1000.
        let target = 5_000_001i128;
        let mut remaining_cents = 1000i128;
        let mut remaining_quota = target;
        let mut settled = 0i128;
        for amount in [300i128, 300, 400] {
            let delta = leg_quota_delta(remaining_quota, remaining_cents, amount);
            settled += delta;
            remaining_cents -= amount;
            remaining_quota -= delta;
        }
        assert_eq!(remaining_cents, 0);
        assert_eq!(settled, target);
        assert_eq!(remaining_quota, 0);
    }

    fn card_source(id: &str, cap: i128) -> CardLegSource {
        CardLegSource {
            charge_id: id.to_string(),
            payment_intent_id: Some(format!("pi_{id}")),
            cap_cents: cap,
            currency: "cny".to_string(),
        }
    }

    fn aggregator_source(trade_no: &str, cap: i128) -> AggregatorLegSource {
        AggregatorLegSource {
            trade_no: trade_no.to_string(),
            payment_method: "alipay".to_string(),
            cap_cents: cap,
        }
    }

    #[test]
    fn test_plan_legs_card_first_then_aggregator() {
        let (legs, leftover) = plan_legs(
            2500,
            &[card_source("ch_new", 2000), card_source("ch_old", 1000)],
            &[aggregator_source("T1", 1000)],
        );
        assert_eq!(leftover, 0);
        assert_eq!(legs.len(), 2);
        assert_eq!(legs[0].target_id, "ch_new");
        assert_eq!(legs[0].amount_cents, 2000);
        assert_eq!(legs[1].target_id, "ch_old");
        assert_eq!(legs[1].amount_cents, 500);
    }

    #[test]
    fn test_plan_legs_spills_to_aggregator() {
        let (legs, leftover) = plan_legs(
            3500,
            &[card_source("ch_1", 2000)],
            &[aggregator_source("T1", 1000), aggregator_source("T2", 800)],
        );
        assert_eq!(leftover, 0);
        assert_eq!(legs.len(), 3);
        assert_eq!(legs[1].provider.as_str(), "aggregator");
        assert_eq!(legs[1].amount_cents, 1000);
        assert_eq!(legs[2].amount_cents, 500);
    }

    #[test]
    fn test_plan_legs_reports_unplaceable_remainder() {
        let (legs, leftover) = plan_legs(5000, &[card_source("ch_1", 1000)], &[]);
        assert_eq!(legs.len(), 1);
        assert_eq!(leftover, 4000);
    }

    #[test]
    fn test_plan_legs_skips_exhausted_sources() {
        let (legs, leftover) = plan_legs(
            1000,
            &[card_source("ch_1", 0)],
            &[aggregator_source("T1", 1000)],
        );
        assert_eq!(legs.len(), 1);
        assert_eq!(legs[0].provider.as_str(), "aggregator");
        assert_eq!(leftover, 0);
    }

    #[test]
    fn test_out_refund_no_shape() {
        assert_eq!(
            out_refund_no(ProviderKind::Card, "userrefund_7_1700", "ch_1", 2000),
            "card_userrefund_7_1700_ch_1_2000"
        );
        assert_eq!(
            out_refund_no(ProviderKind::Aggregator, "b", "T9", 55),
            "aggregator_b_T9_55"
        );
    }
}
