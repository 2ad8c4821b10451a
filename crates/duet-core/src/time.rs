/// Current wall-clock time in epoch milliseconds.
///
/// Message timestamps, presence `last_seen` and read watermarks all use this unit.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
