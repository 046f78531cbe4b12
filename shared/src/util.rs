//! Small shared utilities

/// Current UTC timestamp in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Serde adapter: `i128` as a decimal string.
///
/// Quota counters exceed 2^53, so JSON numbers are unsafe for consumers and
/// `serde_json` cannot represent the full `i128` range as a number anyway.
/// Every i128 amount crosses the wire as a string.
pub mod i128_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &i128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i128, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
