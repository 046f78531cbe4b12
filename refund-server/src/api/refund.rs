//! Refund endpoints: quote, batch execution, single-top-up refund

use axum::extract::{Path, State};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use shared::error::{AppError, ErrorKind};
use shared::money::{format_cents_to_yuan, quota_to_cents_floor};

use crate::auth::AdminIdentity;
use crate::db::users;
use crate::error::{ServiceError, ServiceResult};
use crate::refund::engine::{self, RefundDirective};
use crate::refund::legacy;
use crate::refund::quote::{build_quote_context, QuoteContext};
use crate::state::AppState;

fn quote_response(ctx: &QuoteContext) -> Value {
    let quote = &ctx.quote;
    let remaining_cents = quota_to_cents_floor(quote.user.quota);
    let used_cents = quota_to_cents_floor(quote.user.used_quota);

    let mut body = json!({
        "user": quote.user,
        "balance": {
            "remaining_yuan": format_cents_to_yuan(remaining_cents),
            "used_yuan": format_cents_to_yuan(used_cents),
            "total_yuan": format_cents_to_yuan(remaining_cents + used_cents),
        },
        "aggregator": channel_view(&quote.aggregator),
        "card": channel_view(&quote.card),
        "due_cents": quote.due_cents.to_string(),
        "due_yuan": quote.due_yuan(),
        "plan": {
            "card_cents": quote.plan.card_cents.to_string(),
            "card_yuan": quote.plan.card_yuan(),
            "aggregator_cents": quote.plan.aggregator_cents.to_string(),
            "aggregator_yuan": quote.plan.aggregator_yuan(),
        },
        "orders": quote.orders,
    });
    if let Some(warning) = ctx.warning {
        body["warning"] = json!(warning);
    }
    body
}

fn channel_view(totals: &shared::quote::ChannelTotals) -> Value {
    json!({
        "gross_yuan": format_cents_to_yuan(totals.gross_cents),
        "refunded_yuan": format_cents_to_yuan(totals.refunded_cents),
        "net_yuan": format_cents_to_yuan(totals.net_cents),
    })
}

async fn load_user(state: &AppState, uid: i64) -> ServiceResult<users::UserRow> {
    if uid <= 0 {
        return Err(AppError::with_message(ErrorKind::InvalidUserId, "user id must be positive").into());
    }
    users::find_by_id(&state.business, uid)
        .await?
        .ok_or_else(|| AppError::not_found(ErrorKind::UserNotFound, "user").into())
}

/// GET /api/users/{uid}/refund-quote
pub async fn get_refund_quote(
    State(state): State<AppState>,
    Path(uid): Path<i64>,
) -> ServiceResult<Json<Value>> {
    let user = load_user(&state, uid).await?;
    let ctx = build_quote_context(&state, &user).await?;
    Ok(Json(quote_response(&ctx)))
}

/// POST /api/users/{uid}/refund
pub async fn execute_refund(
    State(state): State<AppState>,
    Path(uid): Path<i64>,
    Extension(identity): Extension<AdminIdentity>,
    Json(directive): Json<RefundDirective>,
) -> ServiceResult<Json<Value>> {
    let user = load_user(&state, uid).await?;
    let ctx = build_quote_context(&state, &user).await?;

    let derivation = engine::derive(&ctx.quote, &directive)?;
    let (card_sources, aggregator_sources) = engine::leg_sources_from_context(&ctx);
    let (legs, planned_leftover) =
        engine::plan_legs(derivation.net_cents, &card_sources, &aggregator_sources);

    if directive.dry_run {
        let legs_preview: Vec<Value> = legs
            .iter()
            .map(|leg| {
                json!({
                    "provider": leg.provider.as_str(),
                    "target_id": leg.target_id,
                    "amount_yuan": format_cents_to_yuan(leg.amount_cents),
                })
            })
            .collect();
        return Ok(Json(json!({
            "dry_run": true,
            "user_id": uid,
            "gross_yuan": format_cents_to_yuan(derivation.gross_cents),
            "fee_yuan": format_cents_to_yuan(derivation.fee_cents),
            "net_yuan": format_cents_to_yuan(derivation.net_cents),
            "fee_bps": derivation.fee_bps,
            "target_quota_delta": derivation.target_quota_delta.to_string(),
            "unplaceable_yuan": format_cents_to_yuan(planned_leftover),
            "legs": legs_preview,
            "quote": quote_response(&ctx),
        })));
    }

    tracing::info!(
        user_id = uid,
        gross_cents = %derivation.gross_cents,
        net_cents = %derivation.net_cents,
        legs = legs.len(),
        performed_by = identity.performed_by(),
        "executing refund batch"
    );

    let trace = engine::base_trace(&ctx.quote, &directive, &derivation);

    // Run the batch in its own task: a client disconnect must not cancel a
    // leg between the provider call and its settle write.
    let batch_state = state.clone();
    let batch_derivation = derivation.clone();
    let performed_by = identity.performed_by().to_string();
    let outcome = tokio::spawn(async move {
        engine::execute_batch(
            &batch_state,
            &ctx,
            &batch_derivation,
            legs,
            trace,
            &performed_by,
        )
        .await
    })
    .await
    .map_err(|e| ServiceError::Db(Box::new(e)))??;

    let legs_json = json!(&outcome.legs);

    if let Some(failure) = outcome.failure {
        return Err(ServiceError::App(
            failure
                .with_detail("batch_id", outcome.batch_id)
                .with_detail("legs", legs_json)
                .with_detail(
                    "remaining_yuan",
                    format_cents_to_yuan(outcome.remaining_cents),
                ),
        ));
    }

    if outcome.remaining_cents > 0 {
        // Some cents had no channel left to land on. Everything settled so
        // far stays settled; the operator sees exactly what happened.
        return Err(ServiceError::App(
            AppError::with_message(
                ErrorKind::RefundIncomplete,
                format!(
                    "{} could not be placed on any channel",
                    format_cents_to_yuan(outcome.remaining_cents)
                ),
            )
            .with_detail("batch_id", outcome.batch_id)
            .with_detail("legs", legs_json)
            .with_detail(
                "remaining_yuan",
                format_cents_to_yuan(outcome.remaining_cents),
            )
            .with_detail(
                "residual_quota_delta",
                outcome.residual_quota_delta.to_string(),
            ),
        ));
    }

    Ok(Json(json!({
        "batch_id": outcome.batch_id,
        "dry_run": false,
        "user_id": uid,
        "gross_yuan": format_cents_to_yuan(derivation.gross_cents),
        "fee_yuan": format_cents_to_yuan(derivation.fee_cents),
        "net_yuan": format_cents_to_yuan(derivation.net_cents),
        "fee_bps": derivation.fee_bps,
        "quota_delta": derivation.target_quota_delta.to_string(),
        "legs": outcome.legs,
    })))
}

/// POST /api/refund (single-top-up full refund)
#[derive(Deserialize)]
pub struct SingleRefundRequest {
    pub trade_no: String,
}

pub async fn refund_single_topup(
    State(state): State<AppState>,
    Extension(identity): Extension<AdminIdentity>,
    Json(request): Json<SingleRefundRequest>,
) -> ServiceResult<Json<Value>> {
    let trade_no = request.trade_no.trim();
    if trade_no.is_empty() {
        return Err(AppError::validation("trade_no is required").into());
    }

    // Same cancellation shielding as the batch path.
    let task_state = state.clone();
    let trade_no = trade_no.to_string();
    let performed_by = identity.performed_by().to_string();
    let outcome = tokio::spawn(async move {
        legacy::refund_single_topup(&task_state, &trade_no, &performed_by).await
    })
    .await
    .map_err(|e| ServiceError::Db(Box::new(e)))??;
    Ok(Json(json!(outcome)))
}
