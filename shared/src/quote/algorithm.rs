//! Consumption allocation and provider split
//!
//! The merchant spends the user's consumed quota against the most
//! promotional top-ups first (highest granted-to-paid ratio): those refund
//! the least cash per quota unit consumed. What survives allocation is
//! refundable, floor-converted to cents and clamped to the net cash the user
//! actually paid.

use super::{
    Channel, OrderComputation, OrderSource, Quote, QuoteInput, RefundPlan,
};
use crate::money::QUOTA_PER_CENT;
use std::cmp::Ordering;

/// Synthetic order id for the gift pool.
pub const GIFT_ORDER_ID: &str = "gift-pool";

/// Promotional ratio of an order as an exact fraction (numerator, positive
/// denominator). `r = (g - p_quota) / g` when `g > 0`, else `0/1`.
fn promo_ratio(grant_quota: i128, paid_quota: i128) -> (i128, i128) {
    if grant_quota > 0 {
        (grant_quota - paid_quota, grant_quota)
    } else {
        (0, 1)
    }
}

/// Total order over computation rows: ratio descending, grant descending,
/// created_at ascending, id ascending. Integer cross-multiplication only.
fn cmp_allocation_order(a: &OrderComputation, b: &OrderComputation) -> Ordering {
    let (na, da) = promo_ratio(a.grant_quota, a.paid_quota);
    let (nb, db) = promo_ratio(b.grant_quota, b.paid_quota);
    // a before b when r_a > r_b, i.e. na*db > nb*da (denominators positive)
    (nb * da)
        .cmp(&(na * db))
        .then_with(|| b.grant_quota.cmp(&a.grant_quota))
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

fn permille(num: i128, den: i128) -> i64 {
    if den > 0 {
        (num * 1000 / den) as i64
    } else {
        0
    }
}

/// Compute the refund quote for one user. Pure and non-suspending.
pub fn compute_quote(input: QuoteInput) -> Quote {
    let user = input.user;

    let mut rows: Vec<OrderComputation> = input
        .orders
        .iter()
        .map(|o| {
            let paid_quota = o.paid_cents * QUOTA_PER_CENT;
            let (num, den) = promo_ratio(o.grant_quota, paid_quota);
            OrderComputation {
                id: o.id.clone(),
                channel: o.channel,
                paid_cents: o.paid_cents,
                grant_quota: o.grant_quota,
                created_at: o.created_at,
                paid_quota,
                promo_permille: permille(num, den),
                consumed_quota: 0,
                refundable_quota: 0,
            }
        })
        .collect();

    // Grants that map to no surviving payment row: promotional credit,
    // manual adjustment. They absorb consumption but never refund.
    let total_grant: i128 = rows.iter().map(|r| r.grant_quota).sum();
    let balance_quota = user.quota + user.used_quota;
    if total_grant < balance_quota {
        let gift_quota = balance_quota - total_grant;
        rows.push(OrderComputation {
            id: GIFT_ORDER_ID.to_string(),
            channel: Channel::Gift,
            paid_cents: 0,
            grant_quota: gift_quota,
            created_at: 0,
            paid_quota: 0,
            promo_permille: 1000,
            consumed_quota: 0,
            refundable_quota: 0,
        });
    }

    rows.sort_by(cmp_allocation_order);

    // Walk the sorted rows assigning consumption greedily.
    let mut unallocated = user.used_quota;
    let mut refundable_total: i128 = 0;
    for row in &mut rows {
        let consumed = unallocated.clamp(0, row.grant_quota);
        unallocated -= consumed;
        row.consumed_quota = consumed;
        row.refundable_quota = (row.paid_quota - consumed).max(0);
        refundable_total += row.refundable_quota;
    }

    let total_net_paid_cents: i128 = rows
        .iter()
        .filter(|r| r.channel != Channel::Gift)
        .map(|r| r.paid_cents)
        .sum();
    let card_net_paid_cents: i128 = rows
        .iter()
        .filter(|r| r.channel == Channel::Card)
        .map(|r| r.paid_cents)
        .sum();

    let due_cents = (refundable_total / QUOTA_PER_CENT).min(total_net_paid_cents);

    // Card first: faster to reconcile, cheaper operationally.
    let card_cents = due_cents.min(card_net_paid_cents);
    let plan = RefundPlan {
        card_cents,
        aggregator_cents: due_cents - card_cents,
    };

    Quote {
        user,
        aggregator: input.aggregator,
        card: input.card,
        total_net_paid_cents,
        refundable_quota_total: refundable_total,
        due_cents,
        plan,
        orders: rows,
    }
}
