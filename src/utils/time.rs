use chrono::Utc;

/// Current wall-clock time as unix seconds.
///
/// The store boundary and the schedule-node contract both speak unix
/// seconds; this is the single place the engine reads the clock.
#[must_use]
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}
