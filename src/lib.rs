//! Order aggregation and settlement engine for the lounge back-office.
//!
//! The point-of-sale flow writes one row per purchased add-on unit to the
//! hosted datastore; this crate re-projects those rows into orders,
//! settles payments across the two tenders, and runs the compensating
//! reversal steps (voids, deletes, booking cancellations) against the
//! external stores. It carries no state of its own beyond the optional
//! local SQLite mirror.

use std::path::Path;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod attendance;
pub mod db;
pub mod discount;
pub mod grouping;
pub mod money;
pub mod reversal;
pub mod settlement;
pub mod storage;
pub mod store;
pub mod types;

pub use discount::{apply_discount, DiscountOutcome, DiscountRule};
pub use grouping::{group_lines, Order};
pub use reversal::ReversalError;
pub use settlement::{settle_capped_ewallet, settle_free, Balance, PaymentState};
pub use store::{BookingStore, CounterStore, LineFilter, LineItemStore, StoreError};
pub use types::{AttendanceLog, LineItem, PromoBooking};

/// First present key whose value is a non-empty string, trimmed.
pub(crate) fn value_str(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Initialize structured logging (console + daily rolling file).
///
/// Returns the appender guard; dropping it flushes buffered log lines, so
/// the caller holds it for the process lifetime.
pub fn init_logging(log_dir: &Path) -> WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,lounge_admin=debug"));

    std::fs::create_dir_all(log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(log_dir, "lounge-admin");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Starting lounge-admin v{}", env!("CARGO_PKG_VERSION"));
    guard
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_str_fallback_keys() {
        let v = json!({"customer_name": "  Ana  ", "seat": ""});
        assert_eq!(
            value_str(&v, &["customerName", "customer_name"]),
            Some("Ana".to_string())
        );
        assert_eq!(value_str(&v, &["seat"]), None);
        assert_eq!(value_str(&v, &["missing"]), None);
    }
}
