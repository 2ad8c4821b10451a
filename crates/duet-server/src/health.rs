//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"` while running, `"draining"` once shutdown has begun.
    pub status: &'static str,
    pub uptime_secs: u64,
    /// Registered live sessions.
    pub live_sessions: usize,
    /// Rooms with a fresh cache entry.
    pub cached_rooms: usize,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    shutting_down: bool,
    live_sessions: usize,
    cached_rooms: usize,
) -> HealthResponse {
    HealthResponse {
        status: if shutting_down { "draining" } else { "ok" },
        uptime_secs: start_time.elapsed().as_secs(),
        live_sessions,
        cached_rooms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_ok() {
        let resp = health_check(Instant::now(), false, 0, 0);
        assert_eq!(resp.status, "ok");
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn draining_while_shutting_down() {
        assert_eq!(health_check(Instant::now(), true, 0, 0).status, "draining");
    }

    #[test]
    fn uptime_increases() {
        let start = Instant::now()
            .checked_sub(std::time::Duration::from_secs(60))
            .unwrap();
        assert!(health_check(start, false, 0, 0).uptime_secs >= 59);
    }

    #[test]
    fn serialization() {
        let resp = health_check(Instant::now(), false, 2, 1);
        let parsed = serde_json::to_value(&resp).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["live_sessions"], 2);
        assert_eq!(parsed["cached_rooms"], 1);
        assert!(parsed["uptime_secs"].is_number());
    }
}
