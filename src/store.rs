//! Collaborator boundary: the external stores the engine talks to.
//!
//! The engine owns neither the line-item rows nor the per-product
//! counters; it only reads and writes them through these traits. Two
//! implementations exist: the local SQLite mirror ([`crate::db`]) and the
//! hosted datastore's REST interface ([`crate::api`]).

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::settlement::PaymentPatch;
use crate::types::{AttendanceLog, LineItem, PromoBooking};

/// A collaborator failure. The message carries the collaborator's own
/// error text verbatim; the caller aborts the remaining steps of the
/// current operation and never retries automatically.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store read failed: {0}")]
    Read(String),
    #[error("store write failed: {0}")]
    Write(String),
}

/// Optional narrowing filters for a line fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineFilter {
    pub product_ref: Option<String>,
    pub paid: Option<bool>,
}

/// The Line-Item Store: owns the purchase-line rows.
pub trait LineItemStore {
    /// Fetch lines with `start <= timestamp < end`, chronologically
    /// ascending.
    fn fetch_lines(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &LineFilter,
    ) -> Result<Vec<LineItem>, StoreError>;

    /// Write the payment fields of one row.
    fn update_line_payment(&self, id: &str, patch: &PaymentPatch) -> Result<(), StoreError>;

    /// Write the quantity of one row (restock edits).
    fn update_line_quantity(&self, id: &str, quantity: i64) -> Result<(), StoreError>;

    fn delete_line(&self, id: &str) -> Result<(), StoreError>;

    fn delete_lines(&self, ids: &[String]) -> Result<(), StoreError>;

    /// Delete every row with `start <= timestamp < end`; returns the
    /// number of rows removed.
    fn delete_by_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// The Counter Store: cumulative units-sold per product. The engine only
/// adjusts counters by signed deltas and clamps the result at 0.
pub trait CounterStore {
    /// Current counter value; an unknown product reads as 0.
    fn read_counter(&self, product_ref: &str) -> Result<i64, StoreError>;

    fn write_counter(&self, product_ref: &str, value: i64) -> Result<(), StoreError>;
}

/// The promo-booking records and their attendance logs.
pub trait BookingStore {
    fn read_booking(&self, id: &str) -> Result<PromoBooking, StoreError>;

    /// Insert an archive copy of a booking with the operator's reason.
    fn archive_booking(
        &self,
        booking: &PromoBooking,
        reason: &str,
        cancelled_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn delete_booking(&self, id: &str) -> Result<(), StoreError>;

    /// Attendance log entries for a booking, most recent first.
    fn fetch_logs(&self, booking_id: &str) -> Result<Vec<AttendanceLog>, StoreError>;
}
