//! Timestamp and identifier helpers.
//!
//! Every persisted timestamp in the system is ISO-8601 UTC with microsecond
//! precision and a literal `Z` suffix; identifiers are RFC-4122 v4.

use chrono::{SecondsFormat, Utc};
use uuid::Uuid;

/// Current UTC time as `YYYY-MM-DDTHH:MM:SS.ffffffZ`.
pub fn utc_now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Fresh v4 identifier, lowercase hyphenated.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
