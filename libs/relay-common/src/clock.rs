//! Wall-clock helpers shared by the relay services.

use chrono::Utc;

/// Current time as whole seconds since the Unix epoch (UTC).
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}
