//! Payment allocation and settlement.
//!
//! Two payment-entry policies coexist in the back-office and both are
//! supported as named modes:
//!
//! - **Capped**: one tender is entered, the other auto-fills the
//!   remainder, and the split can never exceed the amount due.
//! - **Free**: both tenders are entered independently and may jointly
//!   exceed the due amount, producing change.
//!
//! The derived paid flag is the same in both modes: an order with nothing
//! due is paid no matter what was entered.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::grouping::Order;
use crate::money::{clamp_non_negative, round2};
use crate::store::{LineItemStore, StoreError};

// ---------------------------------------------------------------------------
// Capped mode
// ---------------------------------------------------------------------------

/// A settled split across the two tenders.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TenderSplit {
    pub ewallet: f64,
    pub cash: f64,
}

/// Capped allocation with the e-wallet entered first.
///
/// The e-wallet amount is capped at `due`; cash auto-fills the remainder.
/// When `due <= 0` both tenders settle to 0; otherwise the split sums to
/// `due` exactly.
pub fn allocate_capped_ewallet(due: f64, desired_ewallet: f64) -> TenderSplit {
    let due = round2(clamp_non_negative(due));
    if due <= 0.0 {
        return TenderSplit {
            ewallet: 0.0,
            cash: 0.0,
        };
    }
    let ewallet = round2(clamp_non_negative(desired_ewallet).min(due));
    TenderSplit {
        ewallet,
        cash: round2((due - ewallet).max(0.0)),
    }
}

/// Capped allocation with cash entered first; the e-wallet auto-fills.
pub fn allocate_capped_cash(due: f64, desired_cash: f64) -> TenderSplit {
    let due = round2(clamp_non_negative(due));
    if due <= 0.0 {
        return TenderSplit {
            ewallet: 0.0,
            cash: 0.0,
        };
    }
    let cash = round2(clamp_non_negative(desired_cash).min(due));
    TenderSplit {
        ewallet: round2((due - cash).max(0.0)),
        cash,
    }
}

// ---------------------------------------------------------------------------
// Free mode
// ---------------------------------------------------------------------------

/// What is owed (or owed back) after the entered tenders are applied.
/// Exactly one of the two figures exists.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", content = "amount", rename_all = "lowercase")]
pub enum Balance {
    /// Tenders covered the due amount; this much goes back to the guest.
    Change(f64),
    /// Tenders fell short; this much is still owed.
    Remaining(f64),
}

/// Derived settlement figures for an order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PaymentState {
    pub due: f64,
    pub ewallet: f64,
    pub cash: f64,
    pub total_paid: f64,
    pub balance: Balance,
    pub paid: bool,
}

/// Free-mode settlement: tenders are taken as entered (clamped at 0, no
/// upper cap) and may jointly exceed `due`.
pub fn settle_free(due: f64, ewallet: f64, cash: f64) -> PaymentState {
    let due = round2(clamp_non_negative(due));
    let ewallet = round2(clamp_non_negative(ewallet));
    let cash = round2(clamp_non_negative(cash));
    let total_paid = round2(ewallet + cash);
    let balance = if total_paid >= due {
        Balance::Change(round2(total_paid - due))
    } else {
        Balance::Remaining(round2(due - total_paid))
    };
    PaymentState {
        due,
        ewallet,
        cash,
        total_paid,
        balance,
        paid: paid_derived(due, total_paid),
    }
}

/// Capped-mode settlement: allocate, then derive the figures. The split
/// always covers `due` exactly, so a positive due is always paid.
pub fn settle_capped_ewallet(due: f64, desired_ewallet: f64) -> PaymentState {
    let split = allocate_capped_ewallet(due, desired_ewallet);
    settle_free(due, split.ewallet, split.cash)
}

/// Derived paid flag, both modes: nothing due is always paid; otherwise
/// the tenders must cover the due amount.
pub fn paid_derived(due: f64, total_paid: f64) -> bool {
    due <= 0.0 || total_paid >= due
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Payment fields written back to a line-item row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentPatch {
    pub ewallet: f64,
    pub cash: f64,
    pub paid: bool,
    pub paid_at: Option<DateTime<Utc>>,
}

/// Build the patch for a payment save.
///
/// `paid_at` is stamped only on the transition into paid, kept while the
/// order stays paid, and cleared when it toggles back to unpaid.
pub fn payment_patch(
    prior_paid: bool,
    prior_paid_at: Option<DateTime<Utc>>,
    due: f64,
    ewallet: f64,
    cash: f64,
    now: DateTime<Utc>,
) -> PaymentPatch {
    let state = settle_free(due, ewallet, cash);
    let paid_at = if state.paid {
        if prior_paid {
            prior_paid_at.or(Some(now))
        } else {
            Some(now)
        }
    } else {
        None
    };
    PaymentPatch {
        ewallet: state.ewallet,
        cash: state.cash,
        paid: state.paid,
        paid_at,
    }
}

/// Persist an order-level payment through the Line-Item Store.
///
/// The full tender amounts land on the order's first (earliest) line and
/// the remaining lines get zero tenders with the same paid flag and
/// `paid_at`, so a later grouping pass reproduces the same sums, OR-fold,
/// and first-non-null `paid_at`.
///
/// The per-line writes are not transactional. On a mid-order failure the
/// error names the lines already written so the caller can re-fetch and
/// reconcile.
pub fn persist_order_payment<S: LineItemStore>(
    store: &S,
    order: &Order,
    ewallet: f64,
    cash: f64,
    due: f64,
    now: DateTime<Utc>,
) -> Result<PaymentState, StoreError> {
    let patch = payment_patch(order.paid, order.paid_at, due, ewallet, cash, now);
    let state = settle_free(due, patch.ewallet, patch.cash);

    let mut written: Vec<&str> = Vec::new();
    for (idx, line) in order.items.iter().enumerate() {
        let line_patch = if idx == 0 {
            patch.clone()
        } else {
            PaymentPatch {
                ewallet: 0.0,
                cash: 0.0,
                ..patch.clone()
            }
        };
        if let Err(e) = store.update_line_payment(&line.id, &line_patch) {
            return Err(StoreError::Write(format!(
                "payment save stopped at line {}; already written: [{}]: {e}",
                line.id,
                written.join(", ")
            )));
        }
        written.push(&line.id);
    }

    info!(
        order_key = %order.key,
        due = state.due,
        total_paid = state.total_paid,
        paid = state.paid,
        "order payment saved"
    );
    Ok(state)
}

// ===========================================================================
// Tests
// ===========================================================================
