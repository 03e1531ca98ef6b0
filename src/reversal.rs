//! Compensating reversal of line items, orders, and promo bookings.
//!
//! The underlying store offers no multi-row transactions, so every
//! operation here is an ordered step list executed one step at a time
//! with early exit on the first error. The step order is the only
//! correctness guarantee: the counter write always precedes the row
//! delete, and the archive insert always precedes the booking delete.
//! Nothing is retried and nothing already committed is rolled back.
//!
//! Known consistency gaps, accepted and surfaced rather than hidden:
//!
//! - A failure between the counter write and the row delete leaves the
//!   counter reversed with the row still present.
//! - The counter read-modify-write has a lost-update window when two
//!   operators act on the same product concurrently; a store with
//!   compare-and-swap semantics would close it.

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::grouping::Order;
use crate::store::{BookingStore, CounterStore, LineItemStore, StoreError};
use crate::types::LineItem;

/// A reversal operation failure.
#[derive(Debug, Error)]
pub enum ReversalError {
    /// Bad input, rejected before any collaborator call.
    #[error("validation: {0}")]
    Validation(String),

    /// A collaborator step failed; everything after it was skipped.
    #[error("{step}: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: StoreError,
    },

    /// An order void stopped partway: `succeeded` were reversed and
    /// deleted, `failed_id` and everything after it were left untouched.
    /// The caller should re-fetch and retry only the remainder.
    #[error("order void stopped at line {failed_id}: {source}")]
    Partial {
        succeeded: Vec<String>,
        failed_id: String,
        #[source]
        source: StoreError,
    },

    /// The booking was archived but the original could not be deleted.
    /// Retrying the cancel would insert a second archive copy, so this is
    /// reported instead of retried.
    #[error("booking {booking_id} archived but not deleted; a retry would duplicate the archive copy: {source}")]
    ArchiveOrphan {
        booking_id: String,
        #[source]
        source: StoreError,
    },
}

fn step(step: &'static str) -> impl FnOnce(StoreError) -> ReversalError {
    move |source| ReversalError::Step { step, source }
}

// ---------------------------------------------------------------------------
// Void (counter reversal + delete)
// ---------------------------------------------------------------------------

/// Void one line: reverse the product counter, then delete the row.
///
/// Steps: read counter → compute `max(0, current − qty)` → write counter
/// → delete line. Returns the counter value after the reversal.
pub fn void_line<S>(store: &S, line: &LineItem) -> Result<i64, ReversalError>
where
    S: LineItemStore + CounterStore,
{
    let current = store
        .read_counter(&line.product_ref)
        .map_err(step("counter read"))?;
    let next = (current - line.quantity).max(0);
    store
        .write_counter(&line.product_ref, next)
        .map_err(step("counter write"))?;
    store.delete_line(&line.id).map_err(|e| {
        // The counter is already reversed at this point; the row stays
        // until the operator retries the delete.
        warn!(line_id = %line.id, product_ref = %line.product_ref, "line delete failed after counter reversal");
        ReversalError::Step {
            step: "line delete",
            source: e,
        }
    })?;

    info!(
        line_id = %line.id,
        product_ref = %line.product_ref,
        qty = line.quantity,
        counter = next,
        "line voided"
    );
    Ok(next)
}

/// Void every line of an order, stopping at the first failure.
///
/// Already-processed lines stay reversed and deleted; the error carries
/// the succeeded subset so the caller can re-fetch and retry the rest.
pub fn void_order<S>(store: &S, order: &Order) -> Result<Vec<String>, ReversalError>
where
    S: LineItemStore + CounterStore,
{
    let mut succeeded = Vec::new();
    for line in &order.items {
        match void_line(store, line) {
            Ok(_) => succeeded.push(line.id.clone()),
            Err(ReversalError::Step { source, .. }) => {
                return Err(ReversalError::Partial {
                    succeeded,
                    failed_id: line.id.clone(),
                    source,
                });
            }
            Err(other) => return Err(other),
        }
    }
    info!(order_key = %order.key, lines = succeeded.len(), "order voided");
    Ok(succeeded)
}

// ---------------------------------------------------------------------------
// Delete (no counter adjustment)
// ---------------------------------------------------------------------------

/// Delete one line without touching any counter.
pub fn delete_line<S: LineItemStore>(store: &S, id: &str) -> Result<(), ReversalError> {
    store.delete_line(id).map_err(step("line delete"))?;
    info!(line_id = %id, "line deleted");
    Ok(())
}

/// Delete every line of an order without touching counters.
pub fn delete_order<S: LineItemStore>(store: &S, order: &Order) -> Result<(), ReversalError> {
    let ids: Vec<String> = order.items.iter().map(|l| l.id.clone()).collect();
    store.delete_lines(&ids).map_err(step("order delete"))?;
    info!(order_key = %order.key, lines = ids.len(), "order deleted");
    Ok(())
}

/// Half-open UTC bounds for an inclusive day span:
/// `[first_day 00:00, day_after_last 00:00)`.
///
/// This is the single place the range-boundary policy lives; the store's
/// `delete_by_range` is always called with a half-open interval.
pub fn day_bounds(
    first_day: NaiveDate,
    last_day: NaiveDate,
) -> Result<(DateTime<Utc>, DateTime<Utc>), ReversalError> {
    if last_day < first_day {
        return Err(ReversalError::Validation(format!(
            "range end {last_day} precedes start {first_day}"
        )));
    }
    let start = first_day.and_hms_opt(0, 0, 0).expect("midnight").and_utc();
    let end = last_day
        .succ_opt()
        .ok_or_else(|| ReversalError::Validation("range end out of calendar range".into()))?
        .and_hms_opt(0, 0, 0)
        .expect("midnight")
        .and_utc();
    Ok((start, end))
}

/// Delete every line whose timestamp falls on a day in the inclusive
/// span. Returns the number of rows removed.
pub fn delete_day_range<S: LineItemStore>(
    store: &S,
    first_day: NaiveDate,
    last_day: NaiveDate,
) -> Result<u64, ReversalError> {
    let (start, end) = day_bounds(first_day, last_day)?;
    let removed = store
        .delete_by_range(start, end)
        .map_err(step("range delete"))?;
    info!(%first_day, %last_day, removed, "date range deleted");
    Ok(removed)
}

// ---------------------------------------------------------------------------
// Cancel (archive-before-delete)
// ---------------------------------------------------------------------------

/// Cancel a promo booking: archive a full copy with the operator's
/// reason, then delete the original. The reason is required; the archive
/// insert must succeed before anything is deleted.
pub fn cancel_booking<S: BookingStore>(
    store: &S,
    booking_id: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<(), ReversalError> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(ReversalError::Validation(
            "cancellation reason is required".into(),
        ));
    }

    let booking = store.read_booking(booking_id).map_err(step("booking read"))?;
    store
        .archive_booking(&booking, reason, now)
        .map_err(step("archive insert"))?;
    store.delete_booking(booking_id).map_err(|e| {
        warn!(booking_id = %booking_id, "booking delete failed after archive insert");
        ReversalError::ArchiveOrphan {
            booking_id: booking_id.to_string(),
            source: e,
        }
    })?;

    info!(booking_id = %booking_id, reason = %reason, "booking cancelled");
    Ok(())
}

// ---------------------------------------------------------------------------
// Restock edit
// ---------------------------------------------------------------------------

/// Set a line's quantity to an exact value, adjusting the product counter
/// by the difference. Rejects non-positive quantities before any
/// collaborator call. Returns the counter value after the adjustment.
pub fn restock_line<S>(store: &S, line: &LineItem, new_qty: i64) -> Result<i64, ReversalError>
where
    S: LineItemStore + CounterStore,
{
    if new_qty <= 0 {
        return Err(ReversalError::Validation(format!(
            "quantity must be positive, got {new_qty}"
        )));
    }
    let delta = new_qty - line.quantity;
    let current = store
        .read_counter(&line.product_ref)
        .map_err(step("counter read"))?;
    let next = (current + delta).max(0);
    store
        .write_counter(&line.product_ref, next)
        .map_err(step("counter write"))?;
    store
        .update_line_quantity(&line.id, new_qty)
        .map_err(step("line update"))?;

    info!(
        line_id = %line.id,
        product_ref = %line.product_ref,
        old_qty = line.quantity,
        new_qty,
        counter = next,
        "line restocked"
    );
    Ok(next)
}

// ===========================================================================
// Tests
// ===========================================================================
