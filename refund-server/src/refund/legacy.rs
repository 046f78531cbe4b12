//! Single-top-up full refund
//!
//! The narrow path: refund one specific top-up by trade_no, in full. Unlike
//! the batch engine this one uses a business-DB transaction with a row lock:
//! the top-up is SELECTed FOR UPDATE, the provider is called, the status
//! flips success → refund and the user's quota drops by the full grant, all
//! before commit. The audit row settles outside the transaction.

use serde_json::json;

use shared::error::{AppError, ErrorKind};
use shared::money::{cents_to_quota, format_cents_to_yuan, parse_yuan_to_cents};

use crate::audit::{self, NewRefundLog, PROVIDER_AGGREGATOR, PROVIDER_CARD};
use crate::db::topups::{self, STATUS_SUCCESS};
use crate::error::{ServiceError, ServiceResult};
use crate::providers::aggregator::{AggregatorRefundRequest, OrderNoField};
use crate::providers::card::CardRefundTarget;
use crate::refund::trace::TraceBuilder;
use crate::state::AppState;

#[derive(Debug, serde::Serialize)]
pub struct SingleRefundOutcome {
    pub trade_no: String,
    pub user_id: i64,
    pub refund_money: String,
    pub quota_delta: String,
    pub refund_log_id: uuid::Uuid,
    pub provider_refund_no: Option<String>,
}

pub async fn refund_single_topup(
    state: &AppState,
    trade_no: &str,
    performed_by: &str,
) -> ServiceResult<SingleRefundOutcome> {
    let mut tx = state.business.begin().await?;

    let topup = topups::find_by_trade_no_for_update(&mut tx, trade_no)
        .await?
        .ok_or_else(|| AppError::not_found(ErrorKind::TopupNotFound, "top-up"))?;

    if topup.status != STATUS_SUCCESS {
        return Err(ServiceError::App(AppError::with_message(
            ErrorKind::TopupNotRefundable,
            format!("top-up status is {}, not refundable", topup.status),
        )));
    }

    let money_cents = parse_yuan_to_cents(&topup.money)?.max(0);
    if money_cents <= 0 {
        return Err(ServiceError::App(AppError::with_message(
            ErrorKind::TopupNotRefundable,
            "top-up carries no refundable amount",
        )));
    }
    let grant_quota = match topup.amount.as_deref() {
        Some(amount) if !amount.is_empty() => cents_to_quota(parse_yuan_to_cents(amount)?.max(0)),
        _ => cents_to_quota(money_cents),
    };
    let grant_quota_i64 = i64::try_from(grant_quota)
        .map_err(|_| AppError::internal("grant exceeds storage range"))?;

    let is_aggregator = topup.is_aggregator();
    let (provider, payment_method) = if is_aggregator {
        (PROVIDER_AGGREGATOR, topup.payment_method.as_str())
    } else {
        (PROVIDER_CARD, topups::METHOD_STRIPE)
    };

    let refund_money = format_cents_to_yuan(money_cents);
    let batch_id = format!("topuprefund_{}_{}", topup.id, shared::util::now_millis());
    let out_refund_no = format!("{provider}_{batch_id}_{trade_no}_{money_cents}");

    let mut trace = TraceBuilder::new();
    trace.push(
        "single_topup.inputs",
        json!({
            "trade_no": trade_no,
            "user_id": topup.user_id,
            "money_cents": money_cents.to_string(),
            "grant_quota": grant_quota.to_string(),
            "provider": provider,
            "out_refund_no": out_refund_no,
        }),
    );
    let raw_request = trace.to_value();

    // Persist the idempotency key before the provider can see it.
    let log_id = audit::insert_pending(
        &state.audit,
        &NewRefundLog {
            mysql_user_id: topup.user_id,
            topup_trade_no: Some(trade_no),
            card_charge_id: (!is_aggregator).then_some(trade_no),
            card_payment_intent_id: None,
            payment_method,
            currency: "cny",
            refund_money: &refund_money,
            refund_money_minor: money_cents as i64,
            quota_delta: grant_quota_i64,
            provider,
            out_refund_no: &out_refund_no,
            performed_by: Some(performed_by),
            raw_request: &raw_request,
        },
    )
    .await
    .map_err(|e| {
        tracing::error!(error = %e, trade_no, "audit insert failed");
        AppError::with_message(ErrorKind::RefundStoreError, "could not record the refund attempt")
    })?;

    let call_result = if is_aggregator {
        match &state.aggregator {
            None => Err(AppError::provider("aggregator gateway not configured")),
            Some(aggregator) => {
                aggregator
                    .refund(&AggregatorRefundRequest {
                        order_no_field: OrderNoField::TradeNo,
                        order_no: trade_no.to_string(),
                        money_yuan: refund_money.clone(),
                        out_refund_no: out_refund_no.clone(),
                        timestamp: shared::util::now_millis() / 1000,
                    })
                    .await
            }
        }
    } else {
        match &state.card {
            None => Err(AppError::provider("card processor not configured")),
            Some(card) => {
                let target = if trade_no.starts_with("pi_") {
                    CardRefundTarget::PaymentIntent(trade_no.to_string())
                } else {
                    CardRefundTarget::Charge(trade_no.to_string())
                };
                // Full-remaining refund: no amount.
                card.refund(&target, None, &out_refund_no, None).await
            }
        }
    };

    let outcome = match call_result {
        Ok(outcome) => outcome,
        Err(provider_error) => {
            let _ = audit::mark_failed(&state.audit, log_id, &provider_error.message, None).await;
            return Err(ServiceError::App(provider_error));
        }
    };

    // Money has moved; commit the business-side bookkeeping.
    if !topups::mark_refunded(&mut tx, topup.id).await? {
        let _ = audit::mark_failed(
            &state.audit,
            log_id,
            "top-up was updated concurrently after the provider refunded",
            Some(&outcome.raw_response),
        )
        .await;
        return Err(ServiceError::App(AppError::with_message(
            ErrorKind::TopupAlreadyUpdated,
            "top-up was updated concurrently",
        )));
    }
    topups::decrement_quota_in_tx(&mut tx, topup.user_id, grant_quota_i64).await?;
    tx.commit().await?;

    if let Err(e) = audit::mark_succeeded(
        &state.audit,
        log_id,
        outcome.provider_refund_no.as_deref(),
        &outcome.raw_response,
    )
    .await
    {
        tracing::warn!(error = %e, refund_log_id = %log_id, "audit settle write failed");
    }

    tracing::info!(
        trade_no,
        user_id = topup.user_id,
        refund_money = %refund_money,
        "single top-up refunded"
    );

    Ok(SingleRefundOutcome {
        trade_no: trade_no.to_string(),
        user_id: topup.user_id,
        refund_money,
        quota_delta: grant_quota.to_string(),
        refund_log_id: log_id,
        provider_refund_no: outcome.provider_refund_no,
    })
}
