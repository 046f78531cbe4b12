//! Exact integer money arithmetic
//!
//! Three units: *yuan* (display string, two fractional digits), *cents*
//! (1/100 yuan, the provider wire unit) and *quota* (the internal credit
//! unit, 5000 per cent). All value-carrying computation is `i128`; floating
//! point never touches an amount.

use crate::error::{AppError, AppResult, ErrorKind};

/// 1 cent = 5000 quota, so 1 yuan = 500 000 quota.
pub const QUOTA_PER_CENT: i128 = 5000;
pub const CENTS_PER_YUAN: i128 = 100;
pub const QUOTA_PER_YUAN: i128 = QUOTA_PER_CENT * CENTS_PER_YUAN;

/// Parse a yuan string into cents.
///
/// Accepts an optional leading minus, a decimal integer part and 0–2
/// fractional digits; digits past the second are truncated. Empty or
/// otherwise malformed input fails with `invalid_amount`.
pub fn parse_yuan_to_cents(s: &str) -> AppResult<i128> {
    let s = s.trim();
    if s.is_empty() {
        return Err(AppError::invalid_amount("empty amount"));
    }

    let (negative, rest) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };

    let (int_part, frac_part) = match rest.split_once('.') {
        Some((i, f)) => (i, f),
        None => (rest, ""),
    };

    if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AppError::invalid_amount(format!("malformed amount: {s}")));
    }
    if !frac_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AppError::invalid_amount(format!("malformed amount: {s}")));
    }

    let int_value: i128 = int_part
        .parse()
        .map_err(|_| AppError::invalid_amount(format!("amount too large: {s}")))?;

    // Pad or truncate the fraction to exactly two digits.
    let frac_value: i128 = match frac_part.len() {
        0 => 0,
        1 => frac_part.parse::<i128>().unwrap() * 10,
        _ => frac_part[..2].parse::<i128>().unwrap(),
    };

    let cents = int_value * CENTS_PER_YUAN + frac_value;
    Ok(if negative { -cents } else { cents })
}

/// Format cents as a yuan string with exactly two fractional digits.
pub fn format_cents_to_yuan(cents: i128) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

/// Exact conversion: cents to quota.
pub fn cents_to_quota(cents: i128) -> i128 {
    cents * QUOTA_PER_CENT
}

/// Floor conversion: quota to cents. Callers pass non-negative quota.
pub fn quota_to_cents_floor(quota: i128) -> i128 {
    quota / QUOTA_PER_CENT
}

/// Parse a fee percentage (0–100, at most two decimals) into basis points.
///
/// `None` or an empty string yields `default_bps`.
pub fn parse_fee_percent(s: Option<&str>, default_bps: u32) -> AppResult<u32> {
    let s = match s {
        Some(s) if !s.trim().is_empty() => s.trim(),
        _ => return Ok(default_bps),
    };

    let invalid = || {
        AppError::with_message(
            ErrorKind::InvalidFeePercent,
            format!("fee percent must be 0-100 with at most 2 decimals: {s}"),
        )
    };

    let (int_part, frac_part) = match s.split_once('.') {
        Some((i, f)) => (i, f),
        None => (s, ""),
    };

    if int_part.is_empty()
        || !int_part.bytes().all(|b| b.is_ascii_digit())
        || frac_part.len() > 2
        || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(invalid());
    }

    let int_value: u32 = int_part.parse().map_err(|_| invalid())?;
    let frac_value: u32 = match frac_part.len() {
        0 => 0,
        1 => frac_part.parse::<u32>().unwrap() * 10,
        _ => frac_part.parse::<u32>().unwrap(),
    };

    let bps = int_value
        .checked_mul(100)
        .and_then(|v| v.checked_add(frac_value))
        .ok_or_else(invalid)?;
    if bps > 10_000 {
        return Err(invalid());
    }
    Ok(bps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_yuan() {
        assert_eq!(parse_yuan_to_cents("10").unwrap(), 1000);
        assert_eq!(parse_yuan_to_cents("0").unwrap(), 0);
        assert_eq!(parse_yuan_to_cents("12.34").unwrap(), 1234);
        assert_eq!(parse_yuan_to_cents("3.5").unwrap(), 350);
        assert_eq!(parse_yuan_to_cents("7.").unwrap(), 700);
    }

    #[test]
    fn test_parse_truncates_extra_digits() {
        assert_eq!(parse_yuan_to_cents("12.999").unwrap(), 1299);
        assert_eq!(parse_yuan_to_cents("0.009").unwrap(), 0);
    }

    #[test]
    fn test_parse_negative() {
        assert_eq!(parse_yuan_to_cents("-1.50").unwrap(), -150);
        assert_eq!(parse_yuan_to_cents("-0.999").unwrap(), -99);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", " ", "abc", "1,5", "--1", "1.2.3", ".5", "-", "1e3"] {
            let err = parse_yuan_to_cents(bad).unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidAmount, "input: {bad:?}");
        }
    }

    #[test]
    fn test_format_cents() {
        assert_eq!(format_cents_to_yuan(0), "0.00");
        assert_eq!(format_cents_to_yuan(1000), "10.00");
        assert_eq!(format_cents_to_yuan(1234), "12.34");
        assert_eq!(format_cents_to_yuan(5), "0.05");
        assert_eq!(format_cents_to_yuan(-150), "-1.50");
    }

    #[test]
    fn test_round_trip_canonicalizes() {
        for (input, canonical) in [
            ("10", "10.00"),
            ("10.5", "10.50"),
            ("10.50", "10.50"),
            ("-3.5", "-3.50"),
            ("0", "0.00"),
        ] {
            let cents = parse_yuan_to_cents(input).unwrap();
            assert_eq!(format_cents_to_yuan(cents), canonical);
        }
    }

    #[test]
    fn test_quota_conversions() {
        assert_eq!(cents_to_quota(1), 5000);
        assert_eq!(cents_to_quota(1000), 5_000_000);
        assert_eq!(quota_to_cents_floor(5000), 1);
        assert_eq!(quota_to_cents_floor(4999), 0);
        assert_eq!(quota_to_cents_floor(10_001), 2);
        // Inverse law on whole cents
        for c in [0i128, 1, 99, 12345] {
            assert_eq!(quota_to_cents_floor(cents_to_quota(c)), c);
        }
    }

    #[test]
    fn test_fee_percent_default() {
        assert_eq!(parse_fee_percent(None, 500).unwrap(), 500);
        assert_eq!(parse_fee_percent(Some(""), 500).unwrap(), 500);
        assert_eq!(parse_fee_percent(Some("  "), 500).unwrap(), 500);
    }

    #[test]
    fn test_fee_percent_parsing() {
        assert_eq!(parse_fee_percent(Some("5"), 500).unwrap(), 500);
        assert_eq!(parse_fee_percent(Some("0"), 500).unwrap(), 0);
        assert_eq!(parse_fee_percent(Some("0.25"), 500).unwrap(), 25);
        assert_eq!(parse_fee_percent(Some("12.5"), 500).unwrap(), 1250);
        assert_eq!(parse_fee_percent(Some("100"), 500).unwrap(), 10_000);
        assert_eq!(parse_fee_percent(Some("100.00"), 500).unwrap(), 10_000);
    }

    #[test]
    fn test_fee_percent_rejects_out_of_range() {
        for bad in ["100.01", "101", "-1", "5.125", "abc", "1.2.3", "."] {
            let err = parse_fee_percent(Some(bad), 500).unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidFeePercent, "input: {bad:?}");
        }
    }
}
