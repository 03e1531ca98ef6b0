//! Order aggregation over the raw line-item stream.
//!
//! No server-side aggregation exists: orders are re-projected from the
//! day's rows on every fetch, never stored. A single left-to-right scan
//! over chronologically ascending lines groups a contiguous run of rows
//! that share an identity and fall inside a rolling time window — the
//! rows a single checkout event produced.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::money::round2;
use crate::types::LineItem;

/// Rolling window for one checkout event. A gap strictly greater than
/// this starts a new order; a gap of exactly the window does not.
pub const GROUP_WINDOW_SECS: i64 = 10;

/// Grouping identity: normalized name and seat/reference.
pub fn identity_key(name: &str, seat: &str) -> String {
    format!(
        "{}|{}",
        name.trim().to_lowercase(),
        seat.trim().to_lowercase()
    )
}

/// A derived order: a contiguous run of line items believed to belong to
/// one checkout event. Recomputed on every fetch, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Order {
    /// Identity plus first timestamp; stable across re-runs over the
    /// same rows.
    pub key: String,
    pub identity: String,
    pub started_at: DateTime<Utc>,
    pub items: Vec<LineItem>,
    /// round2-accumulated sum of line totals.
    pub grand_total: f64,
    pub ewallet: f64,
    pub cash: f64,
    /// OR-fold over the items.
    pub paid: bool,
    /// First non-null `paid_at` among the items.
    pub paid_at: Option<DateTime<Utc>>,
}

impl Order {
    fn open(identity: String, first: LineItem) -> Order {
        let mut order = Order {
            key: format!("{}@{}", identity, first.timestamp.to_rfc3339()),
            identity,
            started_at: first.timestamp,
            items: Vec::new(),
            grand_total: 0.0,
            ewallet: 0.0,
            cash: 0.0,
            paid: false,
            paid_at: None,
        };
        order.push(first);
        order
    }

    /// Append a line, rounding at the point of accumulation.
    fn push(&mut self, line: LineItem) {
        self.grand_total = round2(self.grand_total + line.line_total).max(0.0);
        self.ewallet = round2(self.ewallet + line.ewallet);
        self.cash = round2(self.cash + line.cash);
        self.paid = self.paid || line.paid;
        if self.paid_at.is_none() {
            self.paid_at = line.paid_at;
        }
        self.items.push(line);
    }

    /// Timestamp of the last line in the order.
    fn last_timestamp(&self) -> DateTime<Utc> {
        self.items
            .last()
            .map(|l| l.timestamp)
            .unwrap_or(self.started_at)
    }
}

/// Group one day's chronologically ascending lines into orders.
///
/// A new order opens when there is no current order, the identity
/// changes, or the gap to the previous line exceeds the window. The
/// result is sorted most-recent-first for display.
pub fn group_lines(lines: Vec<LineItem>) -> Vec<Order> {
    let mut orders: Vec<Order> = Vec::new();

    for line in lines {
        let identity = identity_key(&line.customer_name, &line.seat);
        let start_new = match orders.last() {
            None => true,
            Some(current) => {
                let gap = line
                    .timestamp
                    .signed_duration_since(current.last_timestamp());
                identity != current.identity || gap.abs() > Duration::seconds(GROUP_WINDOW_SECS)
            }
        };
        if start_new {
            orders.push(Order::open(identity, line));
        } else if let Some(current) = orders.last_mut() {
            current.push(line);
        }
    }

    orders.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    orders
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::settle_free;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + secs, 0).unwrap()
    }

    fn line(id: &str, name: &str, seat: &str, secs: i64, total: f64) -> LineItem {
        LineItem {
            id: id.to_string(),
            timestamp: at(secs),
            customer_name: name.to_string(),
            seat: seat.to_string(),
            product_ref: "espresso".to_string(),
            quantity: 1,
            unit_price: total,
            line_total: total,
            ewallet: 0.0,
            cash: 0.0,
            paid: false,
            paid_at: None,
        }
    }

    #[test]
    fn test_window_split() {
        // [0s, 5s, 9s, 21s] with a 10s window -> {0,5,9} and {21}
        let lines = vec![
            line("a", "Ana", "A1", 0, 100.0),
            line("b", "Ana", "A1", 5, 50.0),
            line("c", "Ana", "A1", 9, 25.0),
            line("d", "Ana", "A1", 21, 10.0),
        ];
        let orders = group_lines(lines);
        assert_eq!(orders.len(), 2);
        // most-recent-first
        assert_eq!(orders[0].items.len(), 1);
        assert_eq!(orders[0].items[0].id, "d");
        assert_eq!(orders[1].items.len(), 3);
        assert_eq!(orders[1].grand_total, 175.0);
    }

    #[test]
    fn test_gap_exactly_window_stays() {
        let lines = vec![
            line("a", "Ana", "A1", 0, 100.0),
            line("b", "Ana", "A1", 10, 50.0),
        ];
        let orders = group_lines(lines);
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].items.len(), 2);
    }

    #[test]
    fn test_gap_just_over_window_splits() {
        let lines = vec![
            line("a", "Ana", "A1", 0, 100.0),
            line("b", "Ana", "A1", 11, 50.0),
        ];
        let orders = group_lines(lines);
        assert_eq!(orders.len(), 2);
    }

    #[test]
    fn test_identity_change_splits() {
        let lines = vec![
            line("a", "Ana", "A1", 0, 100.0),
            line("b", "Ben", "A1", 2, 50.0),
            line("c", "Ben", "A2", 4, 25.0),
        ];
        let orders = group_lines(lines);
        assert_eq!(orders.len(), 3);
    }

    #[test]
    fn test_identity_normalization() {
        let lines = vec![
            line("a", "  Ana Cruz ", "a1", 0, 100.0),
            line("b", "ANA CRUZ", "A1", 3, 50.0),
        ];
        let orders = group_lines(lines);
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].identity, "ana cruz|a1");
    }

    #[test]
    fn test_empty_and_single() {
        assert!(group_lines(Vec::new()).is_empty());

        let orders = group_lines(vec![line("a", "Ana", "A1", 0, 100.0)]);
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].items.len(), 1);
        assert_eq!(orders[0].grand_total, 100.0);
    }

    #[test]
    fn test_window_is_rolling_not_anchored() {
        // Each consecutive gap is 8s (inside the window) even though the
        // run spans more than 10s overall.
        let lines = vec![
            line("a", "Ana", "A1", 0, 10.0),
            line("b", "Ana", "A1", 8, 10.0),
            line("c", "Ana", "A1", 16, 10.0),
        ];
        let orders = group_lines(lines);
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].items.len(), 3);
    }

    #[test]
    fn test_accumulation_rounds_each_step() {
        let mut a = line("a", "Ana", "A1", 0, 0.1);
        let mut b = line("b", "Ana", "A1", 1, 0.2);
        a.ewallet = 0.1;
        b.cash = 0.2;
        let orders = group_lines(vec![a, b]);
        assert_eq!(orders[0].grand_total, 0.3);
        assert_eq!(orders[0].ewallet, 0.1);
        assert_eq!(orders[0].cash, 0.2);
    }

    #[test]
    fn test_paid_fold_and_first_paid_at() {
        let mut a = line("a", "Ana", "A1", 0, 100.0);
        let mut b = line("b", "Ana", "A1", 2, 50.0);
        b.paid = true;
        b.paid_at = Some(at(30));
        a.paid = false;
        let orders = group_lines(vec![a, b]);
        assert!(orders[0].paid);
        assert_eq!(orders[0].paid_at, Some(at(30)));
    }

    #[test]
    fn test_round_trip_reproduces_payment_state() {
        // Serialize a day's orders, re-ingest the raw lines, regroup, and
        // the derived settlement figures must match bit-for-bit.
        let mut a = line("a", "Ana", "A1", 0, 120.0);
        a.ewallet = 100.0;
        a.cash = 20.0;
        a.paid = true;
        a.paid_at = Some(at(5));
        let b = line("b", "Ana", "A1", 4, 35.5);
        let c = line("c", "Ben", "B2", 40, 60.0);

        let orders = group_lines(vec![a, b, c]);
        let states: Vec<_> = orders
            .iter()
            .map(|o| settle_free(o.grand_total, o.ewallet, o.cash))
            .collect();

        let exported = serde_json::to_value(&orders).unwrap();
        let mut reimported: Vec<LineItem> = Vec::new();
        for order in exported.as_array().unwrap() {
            for item in order["items"].as_array().unwrap() {
                reimported.push(LineItem::from_value(item).unwrap());
            }
        }
        reimported.sort_by_key(|l| l.timestamp);

        let orders2 = group_lines(reimported);
        assert_eq!(orders2.len(), orders.len());
        let states2: Vec<_> = orders2
            .iter()
            .map(|o| settle_free(o.grand_total, o.ewallet, o.cash))
            .collect();
        assert_eq!(states, states2);
    }
}
