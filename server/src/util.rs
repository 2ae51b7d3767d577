//! Small shared helpers.

use chrono::Utc;

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// All protocol timestamps, LWW comparisons and awareness TTLs use this
/// resolution.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Mint a new unique message id (ULID, lexicographically sortable).
pub fn new_message_id() -> String {
    ulid::Ulid::new().to_string()
}

/// Mint a new connection id.
pub fn new_connection_id() -> String {
    format!("conn-{}", uuid::Uuid::new_v4())
}
