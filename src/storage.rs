//! Secure datastore credential storage using the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the Secret Service API. Credentials never touch the
//! database file or the log stream.

use keyring::Entry;
use serde_json::Value;
use tracing::{info, warn};

const SERVICE_NAME: &str = "lounge-admin";

// Credential keys
pub const KEY_DATASTORE_URL: &str = "datastore_url";
pub const KEY_DATASTORE_API_KEY: &str = "datastore_api_key";
pub const KEY_OPERATOR_ID: &str = "operator_id";

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[KEY_DATASTORE_URL, KEY_DATASTORE_API_KEY, KEY_OPERATOR_ID];

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

/// Store a credential in the OS keyring.
pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())?;
    Ok(())
}

/// Delete a credential from the OS keyring. Silently succeeds if the entry
/// does not exist.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

pub fn has_credential(key: &str) -> bool {
    get_credential(key).is_some()
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// The back-office is considered configured when the datastore URL and API
/// key are both present in the credential store.
pub fn is_configured() -> bool {
    has_credential(KEY_DATASTORE_URL) && has_credential(KEY_DATASTORE_API_KEY)
}

/// Store datastore credentials received during setup.
///
/// Expected JSON shape:
/// ```json
/// {
///   "apiKey": "...",       // raw key or base64 connection string
///   "datastoreUrl": "...", // optional when the connection string carries it
///   "operatorId": "..."    // optional
/// }
/// ```
pub fn update_credentials(payload: &Value) -> Result<Value, String> {
    let raw_api_key = payload
        .get("apiKey")
        .or_else(|| payload.get("api_key"))
        .and_then(Value::as_str)
        .ok_or("Missing required field: apiKey")?;
    let mut datastore_url = payload
        .get("datastoreUrl")
        .or_else(|| payload.get("datastore_url"))
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let mut api_key = raw_api_key.trim().to_string();
    if let Some(decoded_key) = crate::api::extract_api_key_from_connection_string(raw_api_key) {
        api_key = decoded_key;
        if let Some(decoded_url) = crate::api::extract_base_url_from_connection_string(raw_api_key)
        {
            datastore_url = Some(decoded_url);
        }
    }

    if api_key.trim().is_empty() {
        return Err("Missing required field: apiKey".to_string());
    }
    let datastore_url = datastore_url.ok_or("Missing required field: datastoreUrl")?;

    let normalized = crate::api::normalize_base_url(&datastore_url);
    set_credential(KEY_DATASTORE_URL, &normalized)?;
    set_credential(KEY_DATASTORE_API_KEY, api_key.trim())?;

    if let Some(operator) = payload
        .get("operatorId")
        .or_else(|| payload.get("operator_id"))
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
    {
        set_credential(KEY_OPERATOR_ID, operator.trim())?;
    }

    info!(datastore_url = %normalized, "datastore credentials updated");
    Ok(serde_json::json!({ "success": true }))
}

/// Delete every stored credential (factory reset).
pub fn factory_reset() -> Result<Value, String> {
    info!("performing factory reset - deleting all credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(serde_json::json!({ "success": true }))
}
