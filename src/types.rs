//! Data model for the lounge back-office engine.
//!
//! Rows come from the hosted datastore with no type guarantees, so every
//! struct also carries a tolerant `from_value` constructor built on the
//! coercion helpers in [`crate::money`]. Timestamps are stored as text:
//! RFC 3339 from the dashboard, `YYYY-MM-DD HH:MM:SS` from SQLite's
//! `datetime('now')`.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::discount::DiscountRule;
use crate::money::{to_bool, to_number};
use crate::value_str;

/// Parse a stored timestamp. Accepts RFC 3339 and the SQLite
/// `datetime('now')` format (interpreted as UTC).
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Canonical at-rest timestamp text: RFC 3339 UTC, whole seconds, `Z`
/// suffix. Both stores write this one form so equal instants compare
/// equal as text and lexicographic range scans stay chronological.
pub(crate) fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn value_timestamp(v: &Value, keys: &[&str]) -> Option<DateTime<Utc>> {
    value_str(v, keys).and_then(|s| parse_timestamp(&s))
}

/// First present key coerced through [`to_number`], so numeric strings
/// count too.
fn value_number(v: &Value, keys: &[&str]) -> f64 {
    for key in keys {
        if let Some(field) = v.get(*key) {
            if !field.is_null() {
                return to_number(field);
            }
        }
    }
    0.0
}

// ---------------------------------------------------------------------------
// LineItem
// ---------------------------------------------------------------------------

/// One purchased add-on unit-row, owned by the Line-Item Store.
///
/// The engine reads these, updates the payment fields, and deletes rows on
/// void/delete; it never creates them (that is the point-of-sale commit
/// flow's job).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub customer_name: String,
    pub seat: String,
    pub product_ref: String,
    pub quantity: i64,
    pub unit_price: f64,
    pub line_total: f64,
    /// Tender A: electronic wallet.
    pub ewallet: f64,
    /// Tender B: cash.
    pub cash: f64,
    pub paid: bool,
    pub paid_at: Option<DateTime<Utc>>,
}

impl LineItem {
    /// Build a line item from a loose datastore row.
    ///
    /// `id` and a parsable `timestamp` are required; every other field
    /// degrades to its zero value. Returns `None` only when the row is
    /// unusable (missing id or timestamp).
    pub fn from_value(v: &Value) -> Option<LineItem> {
        let id = value_str(v, &["id"])?;
        let timestamp = value_timestamp(v, &["timestamp", "created_at"])?;
        Some(LineItem {
            id,
            timestamp,
            customer_name: value_str(v, &["customer_name", "customerName"]).unwrap_or_default(),
            seat: value_str(v, &["seat", "seat_ref", "reference"]).unwrap_or_default(),
            product_ref: value_str(v, &["product_ref", "productRef"]).unwrap_or_default(),
            quantity: value_number(v, &["quantity", "qty"]).max(0.0) as i64,
            unit_price: to_number(v.get("unit_price").unwrap_or(&Value::Null)),
            line_total: to_number(v.get("line_total").unwrap_or(&Value::Null)),
            ewallet: to_number(v.get("ewallet").unwrap_or(&Value::Null)),
            cash: to_number(v.get("cash").unwrap_or(&Value::Null)),
            paid: to_bool(v.get("paid").unwrap_or(&Value::Null)),
            paid_at: value_timestamp(v, &["paid_at", "paidAt"]),
        })
    }
}

// ---------------------------------------------------------------------------
// PromoBooking
// ---------------------------------------------------------------------------

/// A promo booking: a pre-paid multi-visit reservation with an attached
/// order-level discount, a validity window, and an attempts budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromoBooking {
    pub id: String,
    pub customer_name: String,
    pub seat: String,
    #[serde(flatten)]
    pub discount: DiscountRule,
    pub valid_until: Option<DateTime<Utc>>,
    pub attempts_left: i64,
    /// 0 reads as "unlimited" by display convention.
    pub max_attempts: i64,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl PromoBooking {
    /// Build a promo booking from a loose datastore row.
    pub fn from_value(v: &Value) -> Option<PromoBooking> {
        let id = value_str(v, &["id"])?;
        let created_at = value_timestamp(v, &["created_at", "createdAt"])?;
        let kind = value_str(v, &["kind", "discount_kind"]).unwrap_or_default();
        let value = value_number(v, &["value", "discount_value"]);
        Some(PromoBooking {
            id,
            customer_name: value_str(v, &["customer_name", "customerName"]).unwrap_or_default(),
            seat: value_str(v, &["seat"]).unwrap_or_default(),
            discount: DiscountRule::from_stored(&kind, value),
            valid_until: value_timestamp(v, &["valid_until", "validUntil"]),
            attempts_left: value_number(v, &["attempts_left", "attemptsLeft"]) as i64,
            max_attempts: value_number(v, &["max_attempts", "maxAttempts"]) as i64,
            start_at: value_timestamp(v, &["start_at", "startAt"]),
            end_at: value_timestamp(v, &["end_at", "endAt"]),
            created_at,
        })
    }
}

// ---------------------------------------------------------------------------
// AttendanceLog
// ---------------------------------------------------------------------------

/// One check-in/check-out entry for a booking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceLog {
    pub id: String,
    pub booking_id: String,
    pub in_at: DateTime<Utc>,
    pub out_at: Option<DateTime<Utc>>,
    /// True when the checkout was forced by the session window closing
    /// rather than by the operator.
    pub auto_out: bool,
}

impl AttendanceLog {
    /// Build an attendance log entry from a loose datastore row.
    pub fn from_value(v: &Value) -> Option<AttendanceLog> {
        let id = value_str(v, &["id"])?;
        let in_at = value_timestamp(v, &["in_at", "inAt"])?;
        Some(AttendanceLog {
            id,
            booking_id: value_str(v, &["booking_id", "bookingId"]).unwrap_or_default(),
            in_at,
            out_at: value_timestamp(v, &["out_at", "outAt"]),
            auto_out: to_bool(v.get("auto_out").unwrap_or(&Value::Null)),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp("2026-08-27T10:15:00Z").is_some());
        assert!(parse_timestamp("2026-08-27T10:15:00+02:00").is_some());
        assert!(parse_timestamp("2026-08-27 10:15:00").is_some());
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("not a date").is_none());

        let rfc = parse_timestamp("2026-08-27T10:15:00Z").unwrap();
        let sqlite = parse_timestamp("2026-08-27 10:15:00").unwrap();
        assert_eq!(rfc, sqlite);
    }

    #[test]
    fn test_format_timestamp_canonical_form() {
        use chrono::TimeZone;
        let dt = Utc.timestamp_opt(1_760_000_000, 0).unwrap();
        let s = format_timestamp(dt);
        assert!(s.ends_with('Z'));
        assert!(!s.contains('+'));
        assert_eq!(parse_timestamp(&s), Some(dt));
    }

    #[test]
    fn test_line_item_from_value_typed_row() {
        let row = json!({
            "id": "li-1",
            "timestamp": "2026-08-27T10:00:00Z",
            "customer_name": "Ana Cruz",
            "seat": "A3",
            "product_ref": "espresso",
            "quantity": 2,
            "unit_price": 60.0,
            "line_total": 120.0,
            "ewallet": 120.0,
            "cash": 0.0,
            "paid": true,
            "paid_at": "2026-08-27T10:01:00Z",
        });
        let line = LineItem::from_value(&row).unwrap();
        assert_eq!(line.quantity, 2);
        assert_eq!(line.line_total, 120.0);
        assert!(line.paid);
        assert!(line.paid_at.is_some());
    }

    #[test]
    fn test_line_item_from_value_stringly_row() {
        // Numbers-as-strings and booleans-as-strings must still ingest.
        let row = json!({
            "id": "li-2",
            "timestamp": "2026-08-27 10:00:00",
            "customer_name": "Ben",
            "seat": "B1",
            "product_ref": "latte",
            "quantity": "3",
            "unit_price": "55",
            "line_total": "165.00",
            "ewallet": "100",
            "cash": "65",
            "paid": "1",
        });
        let line = LineItem::from_value(&row).unwrap();
        assert_eq!(line.quantity, 3);
        assert_eq!(line.unit_price, 55.0);
        assert_eq!(line.line_total, 165.0);
        assert_eq!(line.ewallet, 100.0);
        assert_eq!(line.cash, 65.0);
        assert!(line.paid);
        assert!(line.paid_at.is_none());
    }

    #[test]
    fn test_line_item_requires_id_and_timestamp() {
        assert!(LineItem::from_value(&json!({"timestamp": "2026-08-27T10:00:00Z"})).is_none());
        assert!(LineItem::from_value(&json!({"id": "li-3"})).is_none());
        assert!(LineItem::from_value(&json!({"id": "li-3", "timestamp": "junk"})).is_none());
    }

    #[test]
    fn test_line_item_garbage_fields_degrade() {
        let row = json!({
            "id": "li-4",
            "timestamp": "2026-08-27T10:00:00Z",
            "quantity": -2,
            "line_total": "n/a",
            "paid": "maybe",
        });
        let line = LineItem::from_value(&row).unwrap();
        assert_eq!(line.quantity, 0);
        assert_eq!(line.line_total, 0.0);
        assert!(!line.paid);
    }

    #[test]
    fn test_promo_booking_from_value() {
        let row = json!({
            "id": "bk-1",
            "customer_name": "Ana Cruz",
            "seat": "A3",
            "discount_kind": "percent",
            "discount_value": 15,
            "valid_until": "2026-09-30T00:00:00Z",
            "attempts_left": "4",
            "max_attempts": 10,
            "created_at": "2026-08-01T09:00:00Z",
        });
        let booking = PromoBooking::from_value(&row).unwrap();
        assert_eq!(booking.discount, DiscountRule::Percent(15.0));
        assert_eq!(booking.attempts_left, 4);
        assert_eq!(booking.max_attempts, 10);
        assert!(booking.valid_until.is_some());
    }

    #[test]
    fn test_attendance_log_from_value() {
        let open = AttendanceLog::from_value(&json!({
            "id": "al-1",
            "booking_id": "bk-1",
            "in_at": "2026-08-27T09:00:00Z",
        }))
        .unwrap();
        assert!(open.out_at.is_none());
        assert!(!open.auto_out);

        let closed = AttendanceLog::from_value(&json!({
            "id": "al-2",
            "booking_id": "bk-1",
            "in_at": "2026-08-27T09:00:00Z",
            "out_at": "2026-08-27T11:30:00Z",
            "auto_out": "1",
        }))
        .unwrap();
        assert!(closed.out_at.is_some());
        assert!(closed.auto_out);
    }
}
