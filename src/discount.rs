//! Discount arithmetic for orders and promo bookings.
//!
//! Pure functions only: `(base cost, rule) -> (final due, discount amount)`.
//! Guarantees `due <= base_cost` and `discount >= 0` for every input.

use serde::{Deserialize, Serialize};

use crate::money::{clamp_non_negative, round2};

/// A discount rule attached at the booking/order level.
///
/// Stored as `{"kind": "percent", "value": 15}` in the datastore; unknown
/// kinds degrade to `None` on ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum DiscountRule {
    #[default]
    None,
    Percent(f64),
    Amount(f64),
}

impl DiscountRule {
    /// Build a rule from the datastore's loose representation.
    pub fn from_stored(kind: &str, value: f64) -> DiscountRule {
        match kind.trim().to_ascii_lowercase().as_str() {
            "percent" | "percentage" => DiscountRule::Percent(clamp_non_negative(value)),
            "amount" | "fixed" => DiscountRule::Amount(clamp_non_negative(value)),
            _ => DiscountRule::None,
        }
    }

    /// Column pair for persistence: `(kind, value)`.
    pub fn to_stored(&self) -> (&'static str, f64) {
        match self {
            DiscountRule::None => ("none", 0.0),
            DiscountRule::Percent(v) => ("percent", *v),
            DiscountRule::Amount(v) => ("amount", *v),
        }
    }
}

/// Result of applying a discount rule to a base cost.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DiscountOutcome {
    /// Amount owed after the discount, before any payment.
    pub due: f64,
    /// The discount actually granted.
    pub discount: f64,
}

/// Apply a discount rule to a base cost.
///
/// The base is clamped non-negative and rounded before any arithmetic;
/// percent values are clamped to [0, 100]; amount discounts never exceed
/// the base.
pub fn apply_discount(base_cost: f64, rule: &DiscountRule) -> DiscountOutcome {
    let base = round2(clamp_non_negative(base_cost));
    match rule {
        DiscountRule::None => DiscountOutcome {
            due: base,
            discount: 0.0,
        },
        DiscountRule::Percent(value) => {
            let pct = if value.is_finite() {
                value.clamp(0.0, 100.0)
            } else {
                0.0
            };
            let discount = round2(base * pct / 100.0);
            DiscountOutcome {
                due: round2((base - discount).max(0.0)),
                discount,
            }
        }
        DiscountRule::Amount(value) => {
            let discount = round2(clamp_non_negative(*value).min(base));
            DiscountOutcome {
                due: round2((base - discount).max(0.0)),
                discount,
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::round2;

    #[test]
    fn test_no_discount() {
        let out = apply_discount(120.456, &DiscountRule::None);
        assert_eq!(out.due, 120.46);
        assert_eq!(out.discount, 0.0);
    }

    #[test]
    fn test_percent_scenario() {
        // 1000 at 15% -> 150.00 off, 850.00 due
        let out = apply_discount(1000.0, &DiscountRule::Percent(15.0));
        assert_eq!(out.discount, 150.0);
        assert_eq!(out.due, 850.0);
    }

    #[test]
    fn test_percent_clamped_above_hundred() {
        let out = apply_discount(200.0, &DiscountRule::Percent(150.0));
        assert_eq!(out.discount, 200.0);
        assert_eq!(out.due, 0.0);
    }

    #[test]
    fn test_percent_negative_value_is_zero() {
        let out = apply_discount(200.0, &DiscountRule::Percent(-10.0));
        assert_eq!(out.discount, 0.0);
        assert_eq!(out.due, 200.0);
    }

    #[test]
    fn test_percent_complement_property() {
        // due + discount == round2(base) across a spread of bases and rates
        for base in [0.0, 0.01, 9.99, 123.45, 1000.0, 87654.32] {
            for pct in [0.0, 1.0, 12.5, 33.3, 50.0, 99.0, 100.0] {
                let out = apply_discount(base, &DiscountRule::Percent(pct));
                assert!(out.due >= 0.0);
                assert!(
                    (out.due + out.discount - round2(base)).abs() < 0.011,
                    "base={base} pct={pct} due={} discount={}",
                    out.due,
                    out.discount
                );
            }
        }
    }

    #[test]
    fn test_amount_capped_at_base() {
        let out = apply_discount(80.0, &DiscountRule::Amount(100.0));
        assert_eq!(out.discount, 80.0);
        assert_eq!(out.due, 0.0);
    }

    #[test]
    fn test_amount_exact_arithmetic() {
        let out = apply_discount(500.0, &DiscountRule::Amount(120.0));
        assert_eq!(out.discount, 120.0);
        assert_eq!(out.due, 380.0);
    }

    #[test]
    fn test_negative_base_clamped() {
        let out = apply_discount(-50.0, &DiscountRule::Percent(10.0));
        assert_eq!(out.due, 0.0);
        assert_eq!(out.discount, 0.0);
    }

    #[test]
    fn test_from_stored_kinds() {
        assert_eq!(
            DiscountRule::from_stored("percent", 15.0),
            DiscountRule::Percent(15.0)
        );
        assert_eq!(
            DiscountRule::from_stored(" AMOUNT ", 50.0),
            DiscountRule::Amount(50.0)
        );
        assert_eq!(DiscountRule::from_stored("none", 7.0), DiscountRule::None);
        assert_eq!(DiscountRule::from_stored("??", 7.0), DiscountRule::None);
        // negative stored values are clamped on ingestion
        assert_eq!(
            DiscountRule::from_stored("amount", -5.0),
            DiscountRule::Amount(0.0)
        );
    }

    #[test]
    fn test_serde_tagged_shape() {
        let rule = DiscountRule::Percent(15.0);
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "percent", "value": 15.0}));
        let back: DiscountRule = serde_json::from_value(json).unwrap();
        assert_eq!(back, rule);
    }
}
