//! Money rounding and tolerant value coercion.
//!
//! The hosted datastore has no enforced column types: numeric columns
//! regularly come back as strings and boolean columns as `"1"`/`"true"`.
//! Every ingestion boundary goes through these helpers, which are total —
//! unparsable input degrades to zero/false, never an error.

use serde_json::Value;

/// Round to 2 decimal places. Non-finite input collapses to 0.
///
/// Applied at every point of accumulation, not only at display, so the
/// same figures are reproducible from the raw rows alone.
pub fn round2(x: f64) -> f64 {
    if !x.is_finite() {
        return 0.0;
    }
    (x * 100.0).round() / 100.0
}

/// Clamp to the non-negative range. Negative or non-finite input → 0.
pub fn clamp_non_negative(x: f64) -> f64 {
    if x.is_finite() && x > 0.0 {
        x
    } else {
        0.0
    }
}

/// Coerce a stored value to a number.
///
/// Accepts JSON numbers and numeric strings (trimmed). Everything else,
/// including null and unparsable strings, yields 0.
pub fn to_number(v: &Value) -> f64 {
    match v {
        Value::Number(n) => n.as_f64().filter(|x| x.is_finite()).unwrap_or(0.0),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|x| x.is_finite()).unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Coerce a stored value to a boolean.
///
/// True for boolean `true`, nonzero numbers, and the strings
/// `"true"`, `"1"`, `"yes"`, `"paid"` (case-insensitive, trimmed).
pub fn to_bool(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|x| x != 0.0).unwrap_or(false),
        Value::String(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes" | "paid"
        ),
        _ => false,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
