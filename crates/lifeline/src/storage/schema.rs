//! `SQLite` schema definitions for lifeline.
//!
//! This module contains the SQL statements for creating and managing
//! the local state database.

/// SQL statement to create the key/value state table.
///
/// Values are JSON documents; see [`super::keys`] for the known keys.
pub const CREATE_KV_STATE_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS kv_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
";

/// SQL statement to create the per-recipient delivery log.
pub const CREATE_DELIVERY_LOG_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS delivery_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    alert_id TEXT NOT NULL,
    contact_id TEXT NOT NULL,
    sms_ok INTEGER NOT NULL,
    email_ok INTEGER NOT NULL,
    error TEXT,
    recorded_at TEXT NOT NULL
)
";

/// SQL statement to index the delivery log by alert.
pub const CREATE_DELIVERY_ALERT_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_delivery_log_alert ON delivery_log(alert_id)
";

/// SQL statement to create the metadata table for storing key-value pairs.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// Statements for each schema version, applied in order.
///
/// Version `n` is `VERSION_STEPS[n - 1]`. Append new versions; never edit
/// an existing step.
pub const VERSION_STEPS: &[&[&str]] = &[
    // v1: local key/value state
    &[CREATE_KV_STATE_TABLE],
    // v2: per-recipient delivery log
    &[CREATE_DELIVERY_LOG_TABLE, CREATE_DELIVERY_ALERT_INDEX],
];
