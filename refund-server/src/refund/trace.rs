//! Versioned computation trace
//!
//! Every execution records a `calc_trace` inside each leg's raw_request; the
//! admin UI renders it as the "computation detail" forensic record. Schema
//! version 2 is the consumption-allocation algorithm; version 1 rows (the
//! earlier proportional formula) still exist in old audit data.

use serde_json::{json, Value};

pub const TRACE_SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, serde::Serialize)]
pub struct TraceStep {
    pub step_index: usize,
    pub name: String,
    pub detail: Value,
}

/// Accumulates named steps; cheap to clone so each leg can extend the shared
/// prefix with its own operation trace.
#[derive(Debug, Clone, Default)]
pub struct TraceBuilder {
    steps: Vec<TraceStep>,
}

impl TraceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: &str, detail: Value) {
        self.steps.push(TraceStep {
            step_index: self.steps.len(),
            name: name.to_string(),
            detail,
        });
    }

    /// Render as the raw_request payload.
    pub fn to_value(&self) -> Value {
        json!({
            "schema_version": TRACE_SCHEMA_VERSION,
            "calc_trace": self.steps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steps_are_indexed_in_order() {
        let mut trace = TraceBuilder::new();
        trace.push("inputs", json!({"user_id": 7}));
        trace.push("quote.due", json!({"due_cents": "1000"}));

        let value = trace.to_value();
        assert_eq!(value["schema_version"], 2);
        let steps = value["calc_trace"].as_array().unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0]["step_index"], 0);
        assert_eq!(steps[0]["name"], "inputs");
        assert_eq!(steps[1]["step_index"], 1);
        assert_eq!(steps[1]["name"], "quote.due");
    }

    #[test]
    fn test_clone_extends_independently() {
        let mut base = TraceBuilder::new();
        base.push("inputs", json!({}));

        let mut leg_a = base.clone();
        leg_a.push("op.leg", json!({"target": "ch_1"}));
        let mut leg_b = base.clone();
        leg_b.push("op.leg", json!({"target": "ch_2"}));

        assert_eq!(
            leg_a.to_value()["calc_trace"][1]["detail"]["target"],
            "ch_1"
        );
        assert_eq!(
            leg_b.to_value()["calc_trace"][1]["detail"]["target"],
            "ch_2"
        );
        assert_eq!(base.to_value()["calc_trace"].as_array().unwrap().len(), 1);
    }
}
