use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch; the wall clock every loop and the
/// scheduler share.
pub fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
