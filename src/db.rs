//! Local SQLite mirror of the hosted datastore.
//!
//! Uses rusqlite with WAL mode. The mirror carries the same three table
//! families the hosted side owns (line items, product counters, promo
//! bookings with their attendance logs) plus the cancellation archive,
//! and implements the store traits so the engine runs unchanged against
//! either backend.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::discount::DiscountRule;
use crate::settlement::PaymentPatch;
use crate::store::{BookingStore, CounterStore, LineFilter, LineItemStore, StoreError};
use crate::types::{parse_timestamp, AttendanceLog, LineItem, PromoBooking};

/// Shared state holding the mirror connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Initialize the mirror at `{data_dir}/lounge.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState, StoreError> {
    fs::create_dir_all(data_dir)
        .map_err(|e| StoreError::Write(format!("create data dir: {e}")))?;

    let db_path = data_dir.join("lounge.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                // Also remove WAL/SHM files if present
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            open_and_configure(&db_path)
                .map_err(|e| StoreError::Write(format!("database open after retry: {e}")))?
        }
    };

    run_migrations(&conn).map_err(StoreError::Write)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), String> {
    // Ensure schema_version table exists first
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: line items and product counters.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- line_items (one row per purchased add-on unit)
        CREATE TABLE IF NOT EXISTS line_items (
            id TEXT PRIMARY KEY,
            timestamp TEXT NOT NULL,
            customer_name TEXT NOT NULL DEFAULT '',
            seat TEXT NOT NULL DEFAULT '',
            product_ref TEXT NOT NULL DEFAULT '',
            quantity INTEGER NOT NULL DEFAULT 1,
            unit_price REAL NOT NULL DEFAULT 0,
            line_total REAL NOT NULL DEFAULT 0,
            ewallet REAL NOT NULL DEFAULT 0,
            cash REAL NOT NULL DEFAULT 0,
            paid INTEGER NOT NULL DEFAULT 0,
            paid_at TEXT
        );

        -- product_counters (cumulative units-sold per product)
        CREATE TABLE IF NOT EXISTS product_counters (
            product_ref TEXT PRIMARY KEY,
            units_sold INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- Indexes
        CREATE INDEX IF NOT EXISTS idx_line_items_timestamp ON line_items(timestamp);
        CREATE INDEX IF NOT EXISTS idx_line_items_product_ref ON line_items(product_ref);
        CREATE INDEX IF NOT EXISTS idx_line_items_paid ON line_items(paid);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        format!("migration v1: {e}")
    })?;

    info!("Applied migration v1 (line_items, product_counters)");
    Ok(())
}

/// Migration v2: promo bookings and the cancellation archive.
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- promo_bookings (pre-paid multi-visit reservations)
        CREATE TABLE IF NOT EXISTS promo_bookings (
            id TEXT PRIMARY KEY,
            customer_name TEXT NOT NULL DEFAULT '',
            seat TEXT NOT NULL DEFAULT '',
            discount_kind TEXT NOT NULL DEFAULT 'none',
            discount_value REAL NOT NULL DEFAULT 0,
            valid_until TEXT,
            attempts_left INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 0,
            start_at TEXT,
            end_at TEXT,
            created_at TEXT NOT NULL
        );

        -- cancelled_bookings (archive copies, kept forever)
        CREATE TABLE IF NOT EXISTS cancelled_bookings (
            id TEXT PRIMARY KEY,
            booking_id TEXT NOT NULL,
            reason TEXT NOT NULL,
            payload TEXT NOT NULL,
            cancelled_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_cancelled_bookings_booking_id
            ON cancelled_bookings(booking_id);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        format!("migration v2: {e}")
    })?;

    info!("Applied migration v2 (promo_bookings, cancelled_bookings)");
    Ok(())
}

/// Migration v3: attendance logs.
fn migrate_v3(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- attendance_logs (check-in/check-out entries per booking)
        CREATE TABLE IF NOT EXISTS attendance_logs (
            id TEXT PRIMARY KEY,
            booking_id TEXT NOT NULL,
            in_at TEXT NOT NULL,
            out_at TEXT,
            auto_out INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_attendance_logs_booking
            ON attendance_logs(booking_id, in_at);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        format!("migration v3: {e}")
    })?;

    info!("Applied migration v3 (attendance_logs)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Store trait implementations
// ---------------------------------------------------------------------------

// Timestamps are stored as RFC 3339 UTC text, so lexicographic SQL
// comparisons are chronological. One formatter serves both stores.
use crate::types::format_timestamp as ts;

impl DbState {
    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Read("database lock poisoned".to_string()))
    }
}

impl LineItemStore for DbState {
    fn fetch_lines(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &LineFilter,
    ) -> Result<Vec<LineItem>, StoreError> {
        let conn = self.lock()?;

        let mut sql = String::from(
            "SELECT id, timestamp, customer_name, seat, product_ref, quantity,
                    unit_price, line_total, ewallet, cash, paid, paid_at
             FROM line_items
             WHERE timestamp >= ?1 AND timestamp < ?2",
        );
        let mut bind: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(ts(start)), Box::new(ts(end))];
        if let Some(product_ref) = &filter.product_ref {
            sql.push_str(&format!(" AND product_ref = ?{}", bind.len() + 1));
            bind.push(Box::new(product_ref.clone()));
        }
        if let Some(paid) = filter.paid {
            sql.push_str(&format!(" AND paid = ?{}", bind.len() + 1));
            bind.push(Box::new(paid as i64));
        }
        sql.push_str(" ORDER BY timestamp ASC");

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| StoreError::Read(format!("prepare fetch_lines: {e}")))?;
        let rows = stmt
            .query_map(params_from_iter(bind.iter().map(|p| p.as_ref())), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, f64>(6)?,
                    row.get::<_, f64>(7)?,
                    row.get::<_, f64>(8)?,
                    row.get::<_, f64>(9)?,
                    row.get::<_, i64>(10)?,
                    row.get::<_, Option<String>>(11)?,
                ))
            })
            .map_err(|e| StoreError::Read(format!("query line_items: {e}")))?;

        let mut lines = Vec::new();
        for row in rows {
            let (
                id,
                raw_ts,
                customer_name,
                seat,
                product_ref,
                quantity,
                unit_price,
                line_total,
                ewallet,
                cash,
                paid,
                paid_at,
            ) = row.map_err(|e| StoreError::Read(format!("read line_items row: {e}")))?;
            match parse_timestamp(&raw_ts) {
                Some(timestamp) => lines.push(LineItem {
                    id,
                    timestamp,
                    customer_name,
                    seat,
                    product_ref,
                    quantity,
                    unit_price,
                    line_total,
                    ewallet,
                    cash,
                    paid: paid != 0,
                    paid_at: paid_at.as_deref().and_then(parse_timestamp),
                }),
                None => {
                    warn!(id = %id, raw = %raw_ts, "skipping line with unparsable timestamp");
                }
            }
        }
        Ok(lines)
    }

    fn update_line_payment(&self, id: &str, patch: &PaymentPatch) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let affected = conn
            .execute(
                "UPDATE line_items SET ewallet = ?1, cash = ?2, paid = ?3, paid_at = ?4
                 WHERE id = ?5",
                params![
                    patch.ewallet,
                    patch.cash,
                    patch.paid as i64,
                    patch.paid_at.map(ts),
                    id
                ],
            )
            .map_err(|e| StoreError::Write(format!("update line payment: {e}")))?;
        if affected == 0 {
            return Err(StoreError::Write(format!("line {id} not found")));
        }
        Ok(())
    }

    fn update_line_quantity(&self, id: &str, quantity: i64) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let affected = conn
            .execute(
                "UPDATE line_items SET quantity = ?1 WHERE id = ?2",
                params![quantity, id],
            )
            .map_err(|e| StoreError::Write(format!("update line quantity: {e}")))?;
        if affected == 0 {
            return Err(StoreError::Write(format!("line {id} not found")));
        }
        Ok(())
    }

    fn delete_line(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let affected = conn
            .execute("DELETE FROM line_items WHERE id = ?1", params![id])
            .map_err(|e| StoreError::Write(format!("delete line: {e}")))?;
        if affected == 0 {
            return Err(StoreError::Write(format!("line {id} not found")));
        }
        Ok(())
    }

    fn delete_lines(&self, ids: &[String]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.lock()?;
        let placeholders = (1..=ids.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        conn.execute(
            &format!("DELETE FROM line_items WHERE id IN ({placeholders})"),
            params_from_iter(ids.iter()),
        )
        .map_err(|e| StoreError::Write(format!("delete lines: {e}")))?;
        Ok(())
    }

    fn delete_by_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let affected = conn
            .execute(
                "DELETE FROM line_items WHERE timestamp >= ?1 AND timestamp < ?2",
                params![ts(start), ts(end)],
            )
            .map_err(|e| StoreError::Write(format!("delete lines by range: {e}")))?;
        Ok(affected as u64)
    }
}

impl CounterStore for DbState {
    fn read_counter(&self, product_ref: &str) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        let value: Option<i64> = conn
            .query_row(
                "SELECT units_sold FROM product_counters WHERE product_ref = ?1",
                params![product_ref],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::Read(format!("read counter: {e}")))?;
        Ok(value.unwrap_or(0))
    }

    fn write_counter(&self, product_ref: &str, value: i64) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO product_counters (product_ref, units_sold, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(product_ref) DO UPDATE SET
                units_sold = excluded.units_sold,
                updated_at = excluded.updated_at",
            params![product_ref, value],
        )
        .map_err(|e| StoreError::Write(format!("write counter: {e}")))?;
        Ok(())
    }
}

impl BookingStore for DbState {
    fn read_booking(&self, id: &str) -> Result<PromoBooking, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, customer_name, seat, discount_kind, discount_value,
                        valid_until, attempts_left, max_attempts, start_at, end_at, created_at
                 FROM promo_bookings WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, Option<String>>(8)?,
                        row.get::<_, Option<String>>(9)?,
                        row.get::<_, String>(10)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| StoreError::Read(format!("read booking: {e}")))?
            .ok_or_else(|| StoreError::Read(format!("booking {id} not found")))?;

        let created_at = parse_timestamp(&row.10)
            .ok_or_else(|| StoreError::Read(format!("booking {id}: bad created_at")))?;
        Ok(PromoBooking {
            id: row.0,
            customer_name: row.1,
            seat: row.2,
            discount: DiscountRule::from_stored(&row.3, row.4),
            valid_until: row.5.as_deref().and_then(parse_timestamp),
            attempts_left: row.6,
            max_attempts: row.7,
            start_at: row.8.as_deref().and_then(parse_timestamp),
            end_at: row.9.as_deref().and_then(parse_timestamp),
            created_at,
        })
    }

    fn archive_booking(
        &self,
        booking: &PromoBooking,
        reason: &str,
        cancelled_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string(booking)
            .map_err(|e| StoreError::Write(format!("serialize booking archive: {e}")))?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO cancelled_bookings (id, booking_id, reason, payload, cancelled_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Uuid::new_v4().to_string(),
                booking.id,
                reason,
                payload,
                ts(cancelled_at)
            ],
        )
        .map_err(|e| StoreError::Write(format!("archive booking: {e}")))?;
        Ok(())
    }

    fn delete_booking(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let affected = conn
            .execute("DELETE FROM promo_bookings WHERE id = ?1", params![id])
            .map_err(|e| StoreError::Write(format!("delete booking: {e}")))?;
        if affected == 0 {
            return Err(StoreError::Write(format!("booking {id} not found")));
        }
        Ok(())
    }

    fn fetch_logs(&self, booking_id: &str) -> Result<Vec<AttendanceLog>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, booking_id, in_at, out_at, auto_out
                 FROM attendance_logs WHERE booking_id = ?1
                 ORDER BY in_at DESC",
            )
            .map_err(|e| StoreError::Read(format!("prepare fetch_logs: {e}")))?;
        let rows = stmt
            .query_map(params![booking_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .map_err(|e| StoreError::Read(format!("query attendance_logs: {e}")))?;

        let mut logs = Vec::new();
        for row in rows {
            let (id, booking_id, in_at, out_at, auto_out) =
                row.map_err(|e| StoreError::Read(format!("read attendance_logs row: {e}")))?;
            match parse_timestamp(&in_at) {
                Some(in_at) => logs.push(AttendanceLog {
                    id,
                    booking_id,
                    in_at,
                    out_at: out_at.as_deref().and_then(parse_timestamp),
                    auto_out: auto_out != 0,
                }),
                None => {
                    warn!(id = %id, raw = %in_at, "skipping attendance log with unparsable in_at");
                }
            }
        }
        Ok(logs)
    }
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

// ===========================================================================
// Tests
// ===========================================================================
