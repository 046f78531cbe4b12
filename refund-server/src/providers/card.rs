//! Card processor client (Stripe REST API, no SDK dependency)

use serde::Deserialize;
use serde_json::Value;

use shared::error::{AppError, AppResult, ErrorKind};

use super::ProviderRefundOutcome;

/// One charge as reported by the processor. Not persisted by us.
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct CardCharge {
    pub id: String,
    /// Unix seconds
    pub created: i64,
    pub currency: String,
    /// Minor units
    pub amount: i64,
    #[serde(default)]
    pub amount_refunded: i64,
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub paid: bool,
    #[serde(default)]
    pub status: String,
}

impl CardCharge {
    /// Minor units still refundable on this charge.
    pub fn remaining(&self) -> i64 {
        (self.amount - self.amount_refunded).max(0)
    }
}

/// Exactly one of these identifies the payment to refund against.
#[derive(Debug, Clone)]
pub enum CardRefundTarget {
    PaymentIntent(String),
    Charge(String),
}

impl CardRefundTarget {
    pub fn id(&self) -> &str {
        match self {
            Self::PaymentIntent(id) | Self::Charge(id) => id,
        }
    }
}

pub struct CardClient {
    http: reqwest::Client,
    secret_key: String,
    api_base: String,
}

impl CardClient {
    pub fn new(secret_key: &str, api_base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            secret_key: secret_key.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    /// Refund `amount_minor` (or the full remaining amount when `None`)
    /// against one payment. The Idempotency-Key header makes retries with the
    /// same key a no-op on the processor side.
    ///
    /// When `expected_customer` is given, the payment is first fetched and
    /// must belong to that customer and be in `succeeded` state.
    pub async fn refund(
        &self,
        target: &CardRefundTarget,
        amount_minor: Option<i64>,
        idempotency_key: &str,
        expected_customer: Option<&str>,
    ) -> AppResult<ProviderRefundOutcome> {
        if let Some(customer) = expected_customer {
            self.verify_ownership(target, customer).await?;
        }

        let mut form: Vec<(&str, String)> = Vec::new();
        match target {
            CardRefundTarget::PaymentIntent(id) => form.push(("payment_intent", id.clone())),
            CardRefundTarget::Charge(id) => form.push(("charge", id.clone())),
        }
        if let Some(amount) = amount_minor {
            form.push(("amount", amount.to_string()));
        }

        let json = self
            .post_form("/refunds", &form, Some(idempotency_key))
            .await?;

        let provider_refund_no = json.get("id").and_then(Value::as_str).map(String::from);

        Ok(ProviderRefundOutcome {
            provider_refund_no,
            raw_response: json,
        })
    }

    /// All charges for a customer, oldest page first, following the forward
    /// cursor until the processor reports no more. No filtering: paid,
    /// unpaid and failed charges all come back.
    pub async fn list_customer_charges(&self, customer_id: &str) -> AppResult<Vec<CardCharge>> {
        #[derive(Deserialize)]
        struct ChargePage {
            data: Vec<CardCharge>,
            #[serde(default)]
            has_more: bool,
        }

        let mut charges: Vec<CardCharge> = Vec::new();
        let mut starting_after: Option<String> = None;

        loop {
            let mut query: Vec<(&str, String)> = vec![
                ("customer", customer_id.to_string()),
                ("limit", "100".to_string()),
            ];
            if let Some(cursor) = &starting_after {
                query.push(("starting_after", cursor.clone()));
            }

            let json = self.get("/charges", &query).await?;
            let page: ChargePage = serde_json::from_value(json).map_err(|e| {
                AppError::provider(format!("card processor charge list malformed: {e}"))
            })?;

            let has_more = page.has_more;
            charges.extend(page.data);

            if !has_more {
                break;
            }
            starting_after = charges.last().map(|c| c.id.clone());
            if starting_after.is_none() {
                break;
            }
        }

        Ok(charges)
    }

    async fn verify_ownership(
        &self,
        target: &CardRefundTarget,
        expected_customer: &str,
    ) -> AppResult<()> {
        let path = match target {
            CardRefundTarget::PaymentIntent(id) => format!("/payment_intents/{id}"),
            CardRefundTarget::Charge(id) => format!("/charges/{id}"),
        };
        let json = self.get(&path, &[]).await?;

        let customer = json.get("customer").and_then(Value::as_str);
        if customer != Some(expected_customer) {
            return Err(AppError::with_message(
                ErrorKind::CustomerMismatch,
                format!("payment {} does not belong to the expected customer", target.id()),
            ));
        }

        let status = json.get("status").and_then(Value::as_str).unwrap_or("");
        if status != "succeeded" {
            return Err(AppError::with_message(
                ErrorKind::NotSucceeded,
                format!("not_succeeded:{status}"),
            ));
        }
        Ok(())
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> AppResult<Value> {
        let response = self
            .http
            .get(format!("{}{path}", self.api_base))
            .basic_auth(&self.secret_key, None::<&str>)
            .query(query)
            .send()
            .await
            .map_err(|e| AppError::provider(format!("card processor request failed: {e}")))?;
        Self::parse_response(response).await
    }

    async fn post_form(
        &self,
        path: &str,
        form: &[(&str, String)],
        idempotency_key: Option<&str>,
    ) -> AppResult<Value> {
        let mut request = self
            .http
            .post(format!("{}{path}", self.api_base))
            .basic_auth(&self.secret_key, None::<&str>)
            .form(form);
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| AppError::provider(format!("card processor request failed: {e}")))?;
        Self::parse_response(response).await
    }

    async fn parse_response(response: reqwest::Response) -> AppResult<Value> {
        let status = response.status();
        let json: Value = response.json().await.map_err(|e| {
            AppError::provider(format!(
                "card processor returned unreadable body (http {status}): {e}"
            ))
        })?;

        if let Some(error) = json.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("card processor rejected the request");
            return Err(AppError::provider(format!(
                "card processor error (http {status}): {message}"
            )));
        }
        if !status.is_success() {
            return Err(AppError::provider(format!(
                "card processor error (http {status})"
            )));
        }
        Ok(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charge_remaining() {
        let mut charge = CardCharge {
            id: "ch_1".into(),
            created: 1_700_000_000,
            currency: "cny".into(),
            amount: 2000,
            amount_refunded: 500,
            payment_intent: Some("pi_1".into()),
            paid: true,
            status: "succeeded".into(),
        };
        assert_eq!(charge.remaining(), 1500);

        charge.amount_refunded = 2000;
        assert_eq!(charge.remaining(), 0);

        // A processor-side over-refund never goes negative on our side.
        charge.amount_refunded = 2500;
        assert_eq!(charge.remaining(), 0);
    }

    #[test]
    fn test_charge_deserializes_with_missing_optionals() {
        let charge: CardCharge = serde_json::from_value(serde_json::json!({
            "id": "ch_2",
            "created": 1_700_000_000,
            "currency": "cny",
            "amount": 1000,
        }))
        .unwrap();
        assert_eq!(charge.amount_refunded, 0);
        assert!(charge.payment_intent.is_none());
        assert!(!charge.paid);
        assert_eq!(charge.remaining(), 1000);
    }

    #[test]
    fn test_refund_target_id() {
        assert_eq!(CardRefundTarget::Charge("ch_9".into()).id(), "ch_9");
        assert_eq!(
            CardRefundTarget::PaymentIntent("pi_9".into()).id(),
            "pi_9"
        );
    }
}
