//! Wall-clock and uptime helpers

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Unix timestamp in milliseconds, used to stamp re-emitted events.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}

static PROCESS_START: OnceLock<Instant> = OnceLock::new();

/// Record the process start instant. Call once at startup, before the
/// health endpoint can be hit.
pub fn init_server_time() {
    PROCESS_START.get_or_init(Instant::now);
}

/// Seconds since [`init_server_time`], or 0 if it never ran.
pub fn uptime_secs() -> u64 {
    PROCESS_START
        .get()
        .map_or(0, |start| start.elapsed().as_secs())
}
