//! Public-view redaction
//!
//! The public activity endpoints project the refund audit log through a
//! recursive JSON walker: a fixed sensitive-key blocklist, a regex pass over
//! every string, and a cap on array length. Anything that could identify a
//! payment, a customer or an idempotency key leaves as `[redacted]`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};

/// Values under these keys are replaced wholesale, at any nesting depth.
const SENSITIVE_KEYS: &[&str] = &[
    "trade_no",
    "out_trade_no",
    "topup_trade_no",
    "charge_id",
    "card_charge_id",
    "payment_intent",
    "payment_intent_id",
    "card_payment_intent_id",
    "customer",
    "customer_id",
    "card_customer_id",
    "provider_refund_no",
    "refund_no",
    "out_refund_no",
    "idempotency_key",
];

/// Processor-style identifiers embedded in free text.
static ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(ch|pi|cus)_[A-Za-z0-9]+").expect("static pattern"));

const REDACTED: &str = "[redacted]";
const MAX_ARRAY_LEN: usize = 50;

fn is_sensitive_key(key: &str) -> bool {
    SENSITIVE_KEYS.contains(&key)
}

fn scrub_string(s: &str) -> String {
    ID_PATTERN.replace_all(s, "${1}_[redacted]").into_owned()
}

/// Redact one JSON value recursively.
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(scrub_string(s)),
        Value::Array(items) => {
            if items.len() > MAX_ARRAY_LEN {
                json!({ "count": items.len(), "truncated": true })
            } else {
                Value::Array(items.iter().map(redact_value).collect())
            }
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, item) in map {
                if is_sensitive_key(key) && !item.is_null() {
                    out.insert(key.clone(), Value::String(REDACTED.to_string()));
                } else {
                    out.insert(key.clone(), redact_value(item));
                }
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitive_keys_replaced() {
        let input = json!({
            "trade_no": "T12345",
            "out_refund_no": "card_userrefund_1_170_ch_1_2000",
            "refund_money": "9.50",
            "status": "succeeded",
        });
        let out = redact_value(&input);
        assert_eq!(out["trade_no"], "[redacted]");
        assert_eq!(out["out_refund_no"], "[redacted]");
        assert_eq!(out["refund_money"], "9.50");
        assert_eq!(out["status"], "succeeded");
    }

    #[test]
    fn test_null_sensitive_values_stay_null() {
        let out = redact_value(&json!({ "trade_no": null }));
        assert!(out["trade_no"].is_null());
    }

    #[test]
    fn test_nested_objects_walked() {
        let input = json!({
            "raw_response": {
                "charge": { "customer": "cus_AbC123", "amount": 2000 },
            }
        });
        let out = redact_value(&input);
        assert_eq!(out["raw_response"]["charge"]["customer"], "[redacted]");
        assert_eq!(out["raw_response"]["charge"]["amount"], 2000);
    }

    #[test]
    fn test_string_scrub_inside_free_text() {
        let input = json!({
            "error_message": "refund of ch_1AbCdEf234 for cus_Zz9 failed; see pi_Q8r7"
        });
        let out = redact_value(&input);
        assert_eq!(
            out["error_message"],
            "refund of ch_[redacted] for cus_[redacted] failed; see pi_[redacted]"
        );
    }

    #[test]
    fn test_long_arrays_collapsed() {
        let items: Vec<Value> = (0..51).map(|i| json!(i)).collect();
        let out = redact_value(&json!({ "legs": items }));
        assert_eq!(out["legs"]["count"], 51);
        assert_eq!(out["legs"]["truncated"], true);

        let short: Vec<Value> = (0..50).map(|i| json!(i)).collect();
        let out = redact_value(&json!({ "legs": short }));
        assert_eq!(out["legs"].as_array().unwrap().len(), 50);
    }

    #[test]
    fn test_scalars_pass_through() {
        assert_eq!(redact_value(&json!(42)), json!(42));
        assert_eq!(redact_value(&json!(true)), json!(true));
        assert_eq!(redact_value(&json!(null)), json!(null));
    }
}
