use std::time::{Duration, SystemTime, UNIX_EPOCH};
use chrono::{DateTime, Utc};

pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

pub fn format_time_ms(ts: u64) -> String {
    let d = UNIX_EPOCH + Duration::from_millis(ts);
    let datetime = DateTime::<Utc>::from(d);
    datetime.to_rfc3339()
}
