// Wall-clock timestamps are only informational: block identity covers the
// timestamp field, but no validation rule depends on it.

use std::time::{SystemTime, UNIX_EPOCH};

// Millis timestamps used to determine it using its type
pub type TimestampMillis = u64;

// Return timestamp in milliseconds
pub fn get_current_time_in_millis() -> TimestampMillis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Incorrect time returned from SystemTime")
        .as_millis() as TimestampMillis
}
