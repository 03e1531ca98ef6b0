//! Hosted datastore REST client.
//!
//! Implements the store traits against the hosted datastore's PostgREST
//! interface, so the engine can run directly against the remote tables
//! when no local mirror is in play. Rows come back as loose JSON and go
//! through the tolerant `from_value` constructors.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::settlement::PaymentPatch;
use crate::storage;
use crate::store::{BookingStore, CounterStore, LineFilter, LineItemStore, StoreError};
use crate::types::{AttendanceLog, LineItem, PromoBooking};

/// Default timeout for datastore requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// URL normalisation and connection strings
// ---------------------------------------------------------------------------

/// Normalise the datastore URL:
/// - strip trailing slashes
/// - strip a trailing `/rest/v1` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    // Ensure scheme
    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    // Strip trailing slashes
    while url.ends_with('/') {
        url.pop();
    }

    // Strip trailing /rest/v1
    if url.ends_with("/rest/v1") {
        url.truncate(url.len() - 8);
    }

    // Strip trailing slashes again (in case "/rest/v1/" was present)
    while url.ends_with('/') {
        url.pop();
    }

    url
}

fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

pub fn extract_api_key_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw)
        .and_then(|v| {
            v.get("key")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
}

pub fn extract_base_url_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw)
        .and_then(|v| {
            v.get("url")
                .and_then(Value::as_str)
                .map(normalize_base_url)
        })
        .filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach datastore at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid datastore URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Operator not authorized".to_string(),
        404 => "Datastore endpoint not found".to_string(),
        s if s >= 500 => format!("Datastore server error (HTTP {s})"),
        s => format!("Unexpected response from datastore (HTTP {s})"),
    }
}

// Query-string timestamps use the shared Z-suffixed form, so no `+`
// ends up in the URL.
use crate::types::format_timestamp as ts;

/// Percent-encode a filter value. Operator-entered refs and ids can carry
/// `&` or `#`, which would otherwise split the query or start a fragment.
fn enc(s: &str) -> String {
    s.replace('%', "%25")
        .replace('&', "%26")
        .replace('=', "%3D")
        .replace(' ', "%20")
        .replace('+', "%2B")
        .replace('?', "%3F")
        .replace('#', "%23")
}

// ---------------------------------------------------------------------------
// Remote store
// ---------------------------------------------------------------------------

/// Store-trait implementation backed by the hosted datastore's REST
/// interface.
pub struct RemoteStore {
    base_url: String,
    api_key: String,
    client: Client,
}

impl RemoteStore {
    pub fn new(base_url: &str, api_key: &str) -> Result<RemoteStore, StoreError> {
        let base_url = normalize_base_url(base_url);
        let api_key = extract_api_key_from_connection_string(api_key)
            .unwrap_or_else(|| api_key.trim().to_string());
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Read(format!("create HTTP client: {e}")))?;
        Ok(RemoteStore {
            base_url,
            api_key,
            client,
        })
    }

    /// Build a client from the credentials in the platform keystore.
    pub fn from_credentials() -> Result<RemoteStore, StoreError> {
        let url = storage::get_credential(storage::KEY_DATASTORE_URL)
            .ok_or_else(|| StoreError::Read("datastore URL not configured".to_string()))?;
        let key = storage::get_credential(storage::KEY_DATASTORE_API_KEY)
            .ok_or_else(|| StoreError::Read("datastore API key not configured".to_string()))?;
        RemoteStore::new(&url, &key)
    }

    fn request(
        &self,
        method: reqwest::Method,
        path_and_query: &str,
        body: Option<&Value>,
        prefer: Option<&str>,
    ) -> Result<Value, String> {
        let url = format!("{}/rest/v1/{}", self.base_url, path_and_query);

        let mut req = self
            .client
            .request(method, &url)
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json");
        if let Some(p) = prefer {
            req = req.header("Prefer", p);
        }
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req
            .send()
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp.text().unwrap_or_default();

        if !status.is_success() {
            let detail = if let Ok(json) = serde_json::from_str::<Value>(&body_text) {
                json.get("message")
                    .or_else(|| json.get("error"))
                    .and_then(Value::as_str)
                    .map(|m| format!("{m} (HTTP {})", status.as_u16()))
                    .unwrap_or_else(|| format!("{} (HTTP {})", status_error(status), status.as_u16()))
            } else {
                format!("{} (HTTP {})", status_error(status), status.as_u16())
            };
            return Err(detail);
        }

        if body_text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text).map_err(|e| format!("Invalid JSON from datastore: {e}"))
    }

    fn get(&self, path_and_query: &str) -> Result<Value, StoreError> {
        self.request(reqwest::Method::GET, path_and_query, None, None)
            .map_err(StoreError::Read)
    }

    /// PATCH with `Prefer: return=representation`; errors when no row
    /// matched.
    fn patch_one(&self, path_and_query: &str, body: &Value) -> Result<(), StoreError> {
        let rows = self
            .request(
                reqwest::Method::PATCH,
                path_and_query,
                Some(body),
                Some("return=representation"),
            )
            .map_err(StoreError::Write)?;
        match rows.as_array() {
            Some(a) if !a.is_empty() => Ok(()),
            _ => Err(StoreError::Write(format!("no row matched {path_and_query}"))),
        }
    }

    fn delete(&self, path_and_query: &str) -> Result<Value, StoreError> {
        self.request(
            reqwest::Method::DELETE,
            path_and_query,
            None,
            Some("return=representation"),
        )
        .map_err(StoreError::Write)
    }
}

impl LineItemStore for RemoteStore {
    fn fetch_lines(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &LineFilter,
    ) -> Result<Vec<LineItem>, StoreError> {
        let mut query = format!(
            "line_items?timestamp=gte.{}&timestamp=lt.{}&order=timestamp.asc",
            ts(start),
            ts(end)
        );
        if let Some(product_ref) = &filter.product_ref {
            query.push_str(&format!("&product_ref=eq.{}", enc(product_ref)));
        }
        if let Some(paid) = filter.paid {
            query.push_str(&format!("&paid=eq.{paid}"));
        }

        let rows = self.get(&query)?;
        let rows = rows
            .as_array()
            .ok_or_else(|| StoreError::Read("expected array of line items".to_string()))?;

        let mut lines = Vec::new();
        for row in rows {
            match LineItem::from_value(row) {
                Some(line) => lines.push(line),
                None => warn!(row = %row, "skipping unusable line item row"),
            }
        }
        info!(count = lines.len(), "fetched line items");
        Ok(lines)
    }

    fn update_line_payment(&self, id: &str, patch: &PaymentPatch) -> Result<(), StoreError> {
        self.patch_one(
            &format!("line_items?id=eq.{}", enc(id)),
            &json!({
                "ewallet": patch.ewallet,
                "cash": patch.cash,
                "paid": patch.paid,
                "paid_at": patch.paid_at.map(ts),
            }),
        )
    }

    fn update_line_quantity(&self, id: &str, quantity: i64) -> Result<(), StoreError> {
        self.patch_one(
            &format!("line_items?id=eq.{}", enc(id)),
            &json!({ "quantity": quantity }),
        )
    }

    fn delete_line(&self, id: &str) -> Result<(), StoreError> {
        let rows = self.delete(&format!("line_items?id=eq.{}", enc(id)))?;
        match rows.as_array() {
            Some(a) if !a.is_empty() => Ok(()),
            _ => Err(StoreError::Write(format!("line {id} not found"))),
        }
    }

    fn delete_lines(&self, ids: &[String]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let list = ids.iter().map(|id| enc(id)).collect::<Vec<_>>().join(",");
        self.delete(&format!("line_items?id=in.({list})"))?;
        Ok(())
    }

    fn delete_by_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let rows = self.delete(&format!(
            "line_items?timestamp=gte.{}&timestamp=lt.{}",
            ts(start),
            ts(end)
        ))?;
        Ok(rows.as_array().map(|a| a.len() as u64).unwrap_or(0))
    }
}

impl CounterStore for RemoteStore {
    fn read_counter(&self, product_ref: &str) -> Result<i64, StoreError> {
        let rows = self.get(&format!(
            "product_counters?product_ref=eq.{}&select=units_sold",
            enc(product_ref)
        ))?;
        // absent product reads as zero
        Ok(rows
            .as_array()
            .and_then(|a| a.first())
            .and_then(|row| row.get("units_sold"))
            .map(crate::money::to_number)
            .unwrap_or(0.0) as i64)
    }

    fn write_counter(&self, product_ref: &str, value: i64) -> Result<(), StoreError> {
        // upsert: the counter row may not exist yet, and `on_conflict`
        // only merges when the Prefer header asks for it
        self.request(
            reqwest::Method::POST,
            "product_counters?on_conflict=product_ref",
            Some(&json!({ "product_ref": product_ref, "units_sold": value })),
            Some("resolution=merge-duplicates"),
        )
        .map_err(StoreError::Write)?;
        Ok(())
    }
}

impl BookingStore for RemoteStore {
    fn read_booking(&self, id: &str) -> Result<PromoBooking, StoreError> {
        let rows = self.get(&format!("promo_bookings?id=eq.{}", enc(id)))?;
        rows.as_array()
            .and_then(|a| a.first())
            .and_then(PromoBooking::from_value)
            .ok_or_else(|| StoreError::Read(format!("booking {id} not found")))
    }

    fn archive_booking(
        &self,
        booking: &PromoBooking,
        reason: &str,
        cancelled_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_value(booking)
            .map_err(|e| StoreError::Write(format!("serialize booking archive: {e}")))?;
        self.request(
            reqwest::Method::POST,
            "cancelled_bookings",
            Some(&json!({
                "booking_id": booking.id,
                "reason": reason,
                "payload": payload,
                "cancelled_at": ts(cancelled_at),
            })),
            None,
        )
        .map_err(StoreError::Write)?;
        Ok(())
    }

    fn delete_booking(&self, id: &str) -> Result<(), StoreError> {
        let rows = self.delete(&format!("promo_bookings?id=eq.{}", enc(id)))?;
        match rows.as_array() {
            Some(a) if !a.is_empty() => Ok(()),
            _ => Err(StoreError::Write(format!("booking {id} not found"))),
        }
    }

    fn fetch_logs(&self, booking_id: &str) -> Result<Vec<AttendanceLog>, StoreError> {
        let rows = self.get(&format!(
            "attendance_logs?booking_id=eq.{}&order=in_at.desc",
            enc(booking_id)
        ))?;
        let rows = rows
            .as_array()
            .ok_or_else(|| StoreError::Read("expected array of attendance logs".to_string()))?;

        let mut logs = Vec::new();
        for row in rows {
            match AttendanceLog::from_value(row) {
                Some(log) => logs.push(log),
                None => warn!(row = %row, "skipping unusable attendance log row"),
            }
        }
        Ok(logs)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(
            normalize_base_url("https://ds.example.com"),
            "https://ds.example.com"
        );
        assert_eq!(
            normalize_base_url("ds.example.com/"),
            "https://ds.example.com"
        );
        assert_eq!(
            normalize_base_url("https://ds.example.com/rest/v1/"),
            "https://ds.example.com"
        );
        assert_eq!(
            normalize_base_url("localhost:54321"),
            "http://localhost:54321"
        );
        assert_eq!(
            normalize_base_url("  https://ds.example.com//  "),
            "https://ds.example.com"
        );
    }

    #[test]
    fn test_connection_string_json() {
        let raw = r#"{"url": "ds.example.com", "key": "secret-key"}"#;
        assert_eq!(
            extract_base_url_from_connection_string(raw),
            Some("https://ds.example.com".to_string())
        );
        assert_eq!(
            extract_api_key_from_connection_string(raw),
            Some("secret-key".to_string())
        );
    }

    #[test]
    fn test_connection_string_base64() {
        let payload = r#"{"url":"https://ds.example.com","key":"secret-key"}"#;
        let encoded = BASE64_STANDARD.encode(payload);
        assert_eq!(
            extract_base_url_from_connection_string(&encoded),
            Some("https://ds.example.com".to_string())
        );
        assert_eq!(
            extract_api_key_from_connection_string(&encoded),
            Some("secret-key".to_string())
        );
    }

    #[test]
    fn test_connection_string_url_safe_base64() {
        let payload = r#"{"url":"https://ds.example.com","key":"secret+key/x"}"#;
        let encoded = BASE64_STANDARD
            .encode(payload)
            .replace('+', "-")
            .replace('/', "_")
            .trim_end_matches('=')
            .to_string();
        assert_eq!(
            extract_api_key_from_connection_string(&encoded),
            Some("secret+key/x".to_string())
        );
    }

    #[test]
    fn test_connection_string_garbage() {
        assert_eq!(extract_api_key_from_connection_string(""), None);
        assert_eq!(extract_api_key_from_connection_string("short"), None);
        assert_eq!(extract_api_key_from_connection_string("{not json"), None);
    }

    #[test]
    fn test_status_error_messages() {
        assert!(status_error(StatusCode::UNAUTHORIZED).contains("API key"));
        assert!(status_error(StatusCode::FORBIDDEN).contains("not authorized"));
        assert!(status_error(StatusCode::NOT_FOUND).contains("not found"));
        assert!(status_error(StatusCode::INTERNAL_SERVER_ERROR).contains("HTTP 500"));
        assert!(status_error(StatusCode::IM_A_TEAPOT).contains("HTTP 418"));
    }

    #[test]
    fn test_query_timestamp_has_no_plus() {
        use chrono::TimeZone;
        let dt = Utc.timestamp_opt(1_760_000_000, 0).unwrap();
        let s = ts(dt);
        assert!(s.ends_with('Z'));
        assert!(!s.contains('+'));
    }

    #[test]
    fn test_enc_reserved_characters() {
        assert_eq!(enc("combo a&b #2"), "combo%20a%26b%20%232");
        assert_eq!(enc("50%+vat=x?"), "50%25%2Bvat%3Dx%3F");
        assert_eq!(enc("plain-ref_1"), "plain-ref_1");
    }

    /// Accept one HTTP request on a local port, answer it with `body`,
    /// and hand the raw request text back through the join handle.
    fn serve_once(body: &'static str) -> (String, std::thread::JoinHandle<String>) {
        use std::io::{Read, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = stream.read(&mut chunk).unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    let headers = String::from_utf8_lossy(&buf[..end]).to_string();
                    let content_length = headers
                        .lines()
                        .filter_map(|l| l.split_once(':'))
                        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + content_length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\n\
                 content-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).unwrap();
            String::from_utf8_lossy(&buf).to_string()
        });
        (base, handle)
    }

    #[test]
    fn test_counter_upsert_sends_merge_preference() {
        let (base, server) = serve_once("[]");
        let store = RemoteStore::new(&base, "test-key").unwrap();
        store.write_counter("espresso", 7).unwrap();

        let request = server.join().unwrap();
        assert!(
            request.starts_with("POST /rest/v1/product_counters?on_conflict=product_ref "),
            "unexpected request line: {request}"
        );
        let prefer = request
            .lines()
            .find(|l| l.to_ascii_lowercase().starts_with("prefer:"))
            .and_then(|l| l.split_once(':'))
            .map(|(_, v)| v.trim().to_string());
        assert_eq!(prefer.as_deref(), Some("resolution=merge-duplicates"));
    }

    #[test]
    fn test_read_counter_encodes_product_ref() {
        let (base, server) = serve_once("[]");
        let store = RemoteStore::new(&base, "test-key").unwrap();
        assert_eq!(store.read_counter("combo a&b #2").unwrap(), 0);

        let request = server.join().unwrap();
        assert!(
            request.contains("product_counters?product_ref=eq.combo%20a%26b%20%232&select=units_sold"),
            "unexpected request line: {request}"
        );
    }
}
