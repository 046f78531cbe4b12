//! Fleet-wide refund exposure estimate
//!
//! A single-flight background job runs the quote algorithm over every user,
//! fanning the card-processor charge listing out over a fixed worker pool.
//! The process-wide [`EstimateState`] record is the source of truth for both
//! readers and the worker; `last_result` survives recomputes and errors.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use shared::error::{AppError, ErrorKind};
use shared::money::format_cents_to_yuan;
use shared::util::{i128_string, now_millis};

use crate::audit;
use crate::db::{topups, users};
use crate::db::topups::TopupRow;
use crate::db::users::UserRow;
use crate::error::ServiceResult;
use crate::providers::card::CardCharge;
use crate::refund::quote::{quote_from_parts, RefundedIndex};
use crate::state::AppState;

/// Width of the card-listing worker pool.
const CARD_WORKERS: usize = 5;
/// Upper bound for the on-demand per-user variant.
const MAX_EXPLICIT_USER_IDS: usize = 1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateStatus {
    Idle,
    Running,
    Ready,
    Error,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EstimateProgress {
    pub phase: Option<&'static str>,
    pub users_total: u64,
    pub card_customers_total: u64,
    pub card_customers_done: u64,
    pub card_customers_failed: u64,
    pub card_customers_multi_currency: u64,
    pub card_customers_non_cny: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EstimateTotals {
    #[serde(with = "i128_string")]
    pub total_cents: i128,
    #[serde(with = "i128_string")]
    pub card_cents: i128,
    #[serde(with = "i128_string")]
    pub aggregator_cents: i128,
    pub total_yuan: String,
    pub card_yuan: String,
    pub aggregator_yuan: String,
}

impl EstimateTotals {
    fn new(total_cents: i128, card_cents: i128, aggregator_cents: i128) -> Self {
        Self {
            total_yuan: format_cents_to_yuan(total_cents),
            card_yuan: format_cents_to_yuan(card_cents),
            aggregator_yuan: format_cents_to_yuan(aggregator_cents),
            total_cents,
            card_cents,
            aggregator_cents,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EstimateCounts {
    pub users_total: u64,
    pub paying_users: u64,
    pub refundable_users: u64,
    pub users_with_card_customer: u64,
    pub card_customers_total: u64,
    pub card_customers_failed: u64,
    pub card_customers_multi_currency: u64,
    pub card_customers_non_cny: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EstimateResult {
    pub totals: EstimateTotals,
    pub counts: EstimateCounts,
    /// Unix milliseconds
    pub computed_at: i64,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EstimateState {
    pub status: EstimateStatus,
    pub started_at: Option<i64>,
    pub result: Option<EstimateResult>,
    pub last_result: Option<EstimateResult>,
    pub progress: EstimateProgress,
    pub error: Option<String>,
}

impl EstimateState {
    fn new() -> Self {
        Self {
            status: EstimateStatus::Idle,
            started_at: None,
            result: None,
            last_result: None,
            progress: EstimateProgress::default(),
            error: None,
        }
    }
}

pub type EstimateHandle = Arc<Mutex<EstimateState>>;

pub fn new_handle() -> EstimateHandle {
    Arc::new(Mutex::new(EstimateState::new()))
}

/// Start the fleet estimate unless one is already running. Returns whether a
/// new computation was started.
pub async fn try_start(state: AppState) -> bool {
    {
        let mut estimate = state.estimate.lock().await;
        if estimate.status == EstimateStatus::Running {
            return false;
        }
        estimate.status = EstimateStatus::Running;
        estimate.started_at = Some(now_millis());
        estimate.result = None;
        estimate.error = None;
        estimate.progress = EstimateProgress {
            phase: Some("loading"),
            ..EstimateProgress::default()
        };
    }

    tokio::spawn(async move {
        let started = now_millis();
        match run_fleet_estimate(&state).await {
            Ok((totals, counts)) => {
                let result = EstimateResult {
                    totals,
                    counts,
                    computed_at: now_millis(),
                    duration_ms: now_millis() - started,
                };
                let mut estimate = state.estimate.lock().await;
                estimate.status = EstimateStatus::Ready;
                estimate.result = Some(result.clone());
                estimate.last_result = Some(result);
                estimate.progress.phase = None;
            }
            Err(e) => {
                let app: AppError = e.into();
                tracing::error!(error = %app.message, "fleet estimate failed");
                let mut estimate = state.estimate.lock().await;
                estimate.status = EstimateStatus::Error;
                estimate.error = Some(app.message);
                estimate.progress.phase = None;
            }
        }
    });

    true
}

/// How one customer's charge listing ended up.
enum CardFetch {
    Charges(Vec<CardCharge>),
    Failed,
    MultiCurrency,
    NonCny,
}

async fn run_fleet_estimate(
    state: &AppState,
) -> ServiceResult<(EstimateTotals, EstimateCounts)> {
    // Phase 1: load the business and audit stores in bulk.
    let all_users = users::list_all(&state.business).await?;
    let all_topups = topups::list_all(&state.business).await?;
    let all_history = audit::history_all(&state.audit).await?;

    let mut topups_by_user: HashMap<i64, Vec<TopupRow>> = HashMap::new();
    for topup in all_topups {
        topups_by_user.entry(topup.user_id).or_default().push(topup);
    }
    let mut history_by_user: HashMap<i64, Vec<audit::RefundHistoryRow>> = HashMap::new();
    for row in all_history {
        history_by_user.entry(row.mysql_user_id).or_default().push(row);
    }

    let customers: Vec<(i64, String)> = all_users
        .iter()
        .filter_map(|u| u.card_customer_id.clone().map(|c| (u.id, c)))
        .collect();

    {
        let mut estimate = state.estimate.lock().await;
        estimate.progress.phase = Some("card");
        estimate.progress.users_total = all_users.len() as u64;
        estimate.progress.card_customers_total = customers.len() as u64;
    }

    // Phase 2: list card charges, CARD_WORKERS customers at a time by
    // striding. Per-customer failures never fail the job.
    let fetches: Arc<Mutex<HashMap<i64, CardFetch>>> = Arc::new(Mutex::new(HashMap::new()));
    if let Some(card) = &state.card {
        let customers = Arc::new(customers.clone());
        let mut workers = Vec::new();
        for worker in 0..CARD_WORKERS {
            let card = card.clone();
            let customers = customers.clone();
            let fetches = fetches.clone();
            let estimate = state.estimate.clone();
            workers.push(tokio::spawn(async move {
                let mut index = worker;
                while index < customers.len() {
                    let (user_id, customer_id) = &customers[index];
                    let fetch = match card.list_customer_charges(customer_id).await {
                        Ok(charges) => classify_charges(charges),
                        Err(e) => {
                            tracing::warn!(
                                customer_id = %customer_id,
                                error = %e.message,
                                "charge listing failed; customer skipped"
                            );
                            CardFetch::Failed
                        }
                    };
                    {
                        let mut progress = estimate.lock().await;
                        progress.progress.card_customers_done += 1;
                        match fetch {
                            CardFetch::Failed => progress.progress.card_customers_failed += 1,
                            CardFetch::MultiCurrency => {
                                progress.progress.card_customers_multi_currency += 1
                            }
                            CardFetch::NonCny => progress.progress.card_customers_non_cny += 1,
                            CardFetch::Charges(_) => {}
                        }
                    }
                    fetches.lock().await.insert(*user_id, fetch);
                    index += CARD_WORKERS;
                }
            }));
        }
        for worker in workers {
            let _ = worker.await;
        }
    } else if !customers.is_empty() {
        // No card client: every customer is a listing failure.
        let mut progress = state.estimate.lock().await;
        progress.progress.card_customers_done = customers.len() as u64;
        progress.progress.card_customers_failed = customers.len() as u64;
        let mut map = fetches.lock().await;
        for (user_id, _) in &customers {
            map.insert(*user_id, CardFetch::Failed);
        }
    }

    {
        let mut estimate = state.estimate.lock().await;
        estimate.progress.phase = Some("finalizing");
    }

    // Phase 3: run the quote over every user and aggregate.
    let fetches = Arc::try_unwrap(fetches)
        .map(|m| m.into_inner())
        .unwrap_or_default();

    let mut counts = EstimateCounts {
        users_total: all_users.len() as u64,
        users_with_card_customer: customers.len() as u64,
        card_customers_total: customers.len() as u64,
        ..EstimateCounts::default()
    };
    let empty_topups: Vec<TopupRow> = Vec::new();
    let mut total_cents = 0i128;
    let mut card_cents = 0i128;
    let mut aggregator_cents = 0i128;

    for user in &all_users {
        let charges: &[CardCharge] = match fetches.get(&user.id) {
            Some(CardFetch::Charges(charges)) => charges,
            // Unknown or unusable card exposure: excluding the user beats
            // understating. The worker already counted the reason.
            Some(CardFetch::Failed | CardFetch::MultiCurrency | CardFetch::NonCny) => continue,
            None => &[],
        };

        let user_topups = topups_by_user.get(&user.id).unwrap_or(&empty_topups);
        let refunded = RefundedIndex::from_history(
            history_by_user.get(&user.id).map(Vec::as_slice).unwrap_or(&[]),
        );

        let (quote, _) = match quote_from_parts(user, user_topups, &refunded, charges) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(user_id = user.id, error = %e.message, "user skipped in estimate");
                continue;
            }
        };

        if quote.total_net_paid_cents > 0 {
            counts.paying_users += 1;
        }
        if quote.due_cents > 0 {
            counts.refundable_users += 1;
        }
        total_cents += quote.due_cents;
        card_cents += quote.plan.card_cents;
        aggregator_cents += quote.plan.aggregator_cents;
    }

    // The worker counters are progress; fold the terminal ones into counts.
    {
        let estimate = state.estimate.lock().await;
        counts.card_customers_failed = estimate.progress.card_customers_failed;
        counts.card_customers_multi_currency = estimate.progress.card_customers_multi_currency;
        counts.card_customers_non_cny = estimate.progress.card_customers_non_cny;
    }

    Ok((
        EstimateTotals::new(total_cents, card_cents, aggregator_cents),
        counts,
    ))
}

/// Classify a customer's charge list by currency before it is stored.
fn classify_charges(charges: Vec<CardCharge>) -> CardFetch {
    let mut currencies: Vec<String> = charges
        .iter()
        .filter(|c| c.paid && c.status == "succeeded" && c.amount > 0)
        .map(|c| c.currency.to_ascii_lowercase())
        .collect();
    currencies.sort();
    currencies.dedup();
    match currencies.len() {
        0 => CardFetch::Charges(charges),
        1 if currencies[0] == "cny" => CardFetch::Charges(charges),
        1 => CardFetch::NonCny,
        _ => CardFetch::MultiCurrency,
    }
}

// ==================== On-demand per-user estimate ====================

#[derive(Debug, Serialize)]
pub struct UserEstimateItem {
    pub user_id: i64,
    pub due_yuan: String,
    pub plan: UserEstimatePlan,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UserEstimatePlan {
    pub card_yuan: String,
    pub aggregator_yuan: String,
}

#[derive(Debug, Serialize)]
pub struct UserEstimateResponse {
    pub items: Vec<UserEstimateItem>,
    pub totals: EstimateTotals,
    pub requested: usize,
    pub estimated: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub invalid_user_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub duplicate_user_ids: Vec<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub user_ids_not_found: Vec<i64>,
}

/// Parse the operator's id list: an explicit array plus a free-text blob
/// split on commas and whitespace. Order-preserving, duplicates reported.
pub fn parse_user_ids(
    ids: &[serde_json::Value],
    text: Option<&str>,
) -> (Vec<i64>, Vec<String>, Vec<i64>) {
    let mut seen = std::collections::HashSet::new();
    let mut parsed = Vec::new();
    let mut invalid = Vec::new();
    let mut duplicates = Vec::new();

    let mut push = |raw: &str| {
        let raw = raw.trim();
        if raw.is_empty() {
            return;
        }
        match raw.parse::<i64>() {
            Ok(id) if id > 0 => {
                if seen.insert(id) {
                    parsed.push(id);
                } else {
                    duplicates.push(id);
                }
            }
            _ => invalid.push(raw.to_string()),
        }
    };

    for value in ids {
        match value {
            serde_json::Value::Number(n) => push(&n.to_string()),
            serde_json::Value::String(s) => push(s),
            other => push(&other.to_string()),
        }
    }
    if let Some(text) = text {
        for token in text.split(|c: char| c == ',' || c.is_whitespace()) {
            push(token);
        }
    }

    (parsed, invalid, duplicates)
}

/// Estimate an explicit list of users (≤1500), one quote each.
pub async fn estimate_users(
    state: &AppState,
    ids: &[serde_json::Value],
    text: Option<&str>,
) -> ServiceResult<UserEstimateResponse> {
    let (parsed, invalid, duplicates) = parse_user_ids(ids, text);

    if parsed.is_empty() && invalid.is_empty() {
        return Err(AppError::with_message(
            ErrorKind::InvalidUserIds,
            "no user ids provided",
        )
        .into());
    }
    if parsed.len() > MAX_EXPLICIT_USER_IDS {
        return Err(AppError::with_message(
            ErrorKind::TooManyUserIds,
            format!("at most {MAX_EXPLICIT_USER_IDS} user ids per request"),
        )
        .into());
    }

    let found = users::find_by_ids(&state.business, &parsed).await?;
    let found_by_id: HashMap<i64, &UserRow> = found.iter().map(|u| (u.id, u)).collect();
    let not_found: Vec<i64> = parsed
        .iter()
        .copied()
        .filter(|id| !found_by_id.contains_key(id))
        .collect();

    let mut items = Vec::new();
    let mut total_cents = 0i128;
    let mut card_cents = 0i128;
    let mut aggregator_cents = 0i128;

    for id in &parsed {
        let Some(user) = found_by_id.get(id).copied() else {
            continue;
        };
        match crate::refund::quote::build_quote_context(state, user).await {
            Ok(ctx) => {
                total_cents += ctx.quote.due_cents;
                card_cents += ctx.quote.plan.card_cents;
                aggregator_cents += ctx.quote.plan.aggregator_cents;
                items.push(UserEstimateItem {
                    user_id: *id,
                    due_yuan: ctx.quote.due_yuan(),
                    plan: UserEstimatePlan {
                        card_yuan: ctx.quote.plan.card_yuan(),
                        aggregator_yuan: ctx.quote.plan.aggregator_yuan(),
                    },
                    warning: ctx.warning.map(String::from),
                });
            }
            Err(crate::error::ServiceError::App(e))
                if e.kind == ErrorKind::MultipleCurrencies =>
            {
                items.push(UserEstimateItem {
                    user_id: *id,
                    due_yuan: "0.00".to_string(),
                    plan: UserEstimatePlan {
                        card_yuan: "0.00".to_string(),
                        aggregator_yuan: "0.00".to_string(),
                    },
                    warning: Some(e.kind.as_str().to_string()),
                });
            }
            Err(e) => return Err(e),
        }
    }

    let estimated = items.len();
    Ok(UserEstimateResponse {
        items,
        totals: EstimateTotals::new(total_cents, card_cents, aggregator_cents),
        requested: parsed.len(),
        estimated,
        invalid_user_ids: invalid,
        duplicate_user_ids: duplicates,
        user_ids_not_found: not_found,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_user_ids_mixed_sources() {
        let ids = vec![json!(3), json!("7"), json!(" 11 ")];
        let (parsed, invalid, duplicates) = parse_user_ids(&ids, Some("15, 19\n23 7"));
        assert_eq!(parsed, vec![3, 7, 11, 15, 19, 23]);
        assert!(invalid.is_empty());
        assert_eq!(duplicates, vec![7]);
    }

    #[test]
    fn test_parse_user_ids_reports_invalid() {
        let ids = vec![json!("abc"), json!(-2), json!(0)];
        let (parsed, invalid, duplicates) = parse_user_ids(&ids, Some("x,8"));
        assert_eq!(parsed, vec![8]);
        assert_eq!(invalid, vec!["abc", "-2", "0", "x"]);
        assert!(duplicates.is_empty());
    }

    #[test]
    fn test_parse_user_ids_empty_text_tokens_ignored() {
        let (parsed, invalid, _) = parse_user_ids(&[], Some(" , ,, \n "));
        assert!(parsed.is_empty());
        assert!(invalid.is_empty());
    }

    #[test]
    fn test_classify_charges_by_currency() {
        fn charge(currency: &str) -> CardCharge {
            CardCharge {
                id: "ch_x".into(),
                created: 0,
                currency: currency.into(),
                amount: 100,
                amount_refunded: 0,
                payment_intent: None,
                paid: true,
                status: "succeeded".into(),
            }
        }
        assert!(matches!(classify_charges(vec![]), CardFetch::Charges(_)));
        assert!(matches!(
            classify_charges(vec![charge("cny"), charge("CNY")]),
            CardFetch::Charges(_)
        ));
        assert!(matches!(classify_charges(vec![charge("usd")]), CardFetch::NonCny));
        assert!(matches!(
            classify_charges(vec![charge("cny"), charge("usd")]),
            CardFetch::MultiCurrency
        ));
    }

    #[test]
    fn test_estimate_state_initial() {
        let state = EstimateState::new();
        assert_eq!(state.status, EstimateStatus::Idle);
        assert!(state.result.is_none());
        assert!(state.last_result.is_none());
        assert!(state.error.is_none());
    }
}
