//! Attendance and promo-booking status derivation.
//!
//! Everything here is a pure derivation over stored rows plus a wall
//! clock reading; the receipt and table renderers call these on every
//! fetch and on the live 10-second tick. Nothing is persisted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::types::AttendanceLog;

// ---------------------------------------------------------------------------
// Attendance status
// ---------------------------------------------------------------------------

/// Two-state attendance: a log with no checkout is IN, otherwise OUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AttendanceStatus {
    In,
    Out,
}

pub fn log_status(log: &AttendanceLog) -> AttendanceStatus {
    if log.out_at.is_some() {
        AttendanceStatus::Out
    } else {
        AttendanceStatus::In
    }
}

/// Status of the most recent log entry. `logs` is ordered most-recent
/// first, as the stores return it; empty input means the booking has
/// never checked in.
pub fn last_status(logs: &[AttendanceLog]) -> Option<AttendanceStatus> {
    logs.first().map(log_status)
}

// ---------------------------------------------------------------------------
// Promo state
// ---------------------------------------------------------------------------

/// A booking with no validity end never expires.
pub fn is_expired(valid_until: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    matches!(valid_until, Some(end) if now > end)
}

/// Attempts badge text. `max_attempts == 0` reads as unlimited — a
/// display convention only, the stored numbers are untouched.
pub fn attempts_display(attempts_left: i64, max_attempts: i64) -> String {
    if max_attempts == 0 {
        format!("{attempts_left} / ∞")
    } else {
        format!("{attempts_left} / {max_attempts}")
    }
}

/// Where a booking's session window sits relative to now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BookingPhase {
    Upcoming,
    Ongoing,
    Finished,
}

/// Derive the session phase. A missing start counts as already started;
/// a missing end keeps the session ongoing.
pub fn booking_phase(
    start_at: Option<DateTime<Utc>>,
    end_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> BookingPhase {
    if let Some(start) = start_at {
        if now < start {
            return BookingPhase::Upcoming;
        }
    }
    if let Some(end) = end_at {
        if now > end {
            return BookingPhase::Finished;
        }
    }
    BookingPhase::Ongoing
}

// ---------------------------------------------------------------------------
// Live refresh tick
// ---------------------------------------------------------------------------

/// Interval for the live status re-evaluation tick.
pub const LIVE_TICK: Duration = Duration::from_secs(10);

static TICKER_RUNNING: AtomicBool = AtomicBool::new(false);

/// Start the cooperative live-refresh task.
///
/// Re-invokes `refresh` on a fixed interval so the caller can re-read the
/// wall clock and recompute the derived statuses. Read-side polling only;
/// no writes happen on the tick. Returns `false` when a ticker is already
/// running.
pub fn start_live_refresh<F>(interval: Duration, refresh: F) -> bool
where
    F: Fn() + Send + 'static,
{
    if TICKER_RUNNING.swap(true, Ordering::SeqCst) {
        return false;
    }

    tokio::spawn(async move {
        info!(interval_ms = interval.as_millis() as u64, "live refresh started");
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first interval tick fires immediately
        tick.tick().await;
        while TICKER_RUNNING.load(Ordering::SeqCst) {
            tick.tick().await;
            if !TICKER_RUNNING.load(Ordering::SeqCst) {
                break;
            }
            refresh();
        }
        info!("live refresh stopped");
    });

    true
}

/// Stop the live-refresh task. The loop exits on its next tick.
pub fn stop_live_refresh() {
    TICKER_RUNNING.store(false, Ordering::SeqCst);
}

// ===========================================================================
// Tests
// ===========================================================================
