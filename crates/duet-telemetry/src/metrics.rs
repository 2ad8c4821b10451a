//! Prometheus recorder and metric-name constants.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus recorder as the global `metrics` recorder.
///
/// Returns the handle used to render `/metrics`. Call once at startup.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from an installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Messages stored (counter, labels: room).
pub const MESSAGES_APPENDED_TOTAL: &str = "messages_appended_total";
/// Appends answered with a duplicate signal (counter).
pub const MESSAGES_DUPLICATE_TOTAL: &str = "messages_duplicate_total";
/// Appends rejected by validation (counter, labels: kind).
pub const MESSAGES_REJECTED_TOTAL: &str = "messages_rejected_total";
/// Persisted values reset after failing shape validation (counter, labels: key_kind).
pub const STORE_CORRUPTION_RESETS_TOTAL: &str = "store_corruption_resets_total";
/// Cache hits (counter).
pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
/// Cache misses (counter).
pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
/// Cache rooms evicted by the sweeper (counter).
pub const CACHE_EVICTIONS_TOTAL: &str = "cache_evictions_total";
/// Broadcast subscribers removed after failing (counter).
pub const BROADCAST_SUBSCRIBER_FAILURES_TOTAL: &str = "broadcast_subscriber_failures_total";
/// Live sessions opened (counter).
pub const LIVE_SESSIONS_OPENED_TOTAL: &str = "live_sessions_opened_total";
/// Live sessions currently active (gauge).
pub const LIVE_SESSIONS_ACTIVE: &str = "live_sessions_active";
/// Session requests denied by admission control (counter, labels: reason).
pub const ADMISSION_REJECTIONS_TOTAL: &str = "admission_rejections_total";
/// Messages delivered to sessions (counter, labels: path = push|poll).
pub const MESSAGES_DELIVERED_TOTAL: &str = "messages_delivered_total";
/// Stream events dropped because a session's channel was full (counter).
pub const STREAM_DROPS_TOTAL: &str = "stream_drops_total";
/// Time spent in one session cycle (histogram, seconds).
pub const SESSION_CYCLE_DURATION_SECONDS: &str = "session_cycle_duration_seconds";
/// HTTP requests handled (counter, labels: route, status).
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";

/// Register descriptions for every metric name with the global recorder.
pub fn describe_metrics() {
    describe_counter!(MESSAGES_APPENDED_TOTAL, "Messages stored");
    describe_counter!(MESSAGES_DUPLICATE_TOTAL, "Appends answered as duplicates");
    describe_counter!(MESSAGES_REJECTED_TOTAL, "Appends rejected by validation");
    describe_counter!(
        STORE_CORRUPTION_RESETS_TOTAL,
        "Persisted values reset after failing shape validation"
    );
    describe_counter!(CACHE_HITS_TOTAL, "Message cache hits");
    describe_counter!(CACHE_MISSES_TOTAL, "Message cache misses");
    describe_counter!(CACHE_EVICTIONS_TOTAL, "Expired cache rooms evicted");
    describe_counter!(
        BROADCAST_SUBSCRIBER_FAILURES_TOTAL,
        "Broadcast subscribers removed after failing"
    );
    describe_counter!(LIVE_SESSIONS_OPENED_TOTAL, "Live sessions opened");
    describe_gauge!(LIVE_SESSIONS_ACTIVE, "Live sessions currently active");
    describe_counter!(ADMISSION_REJECTIONS_TOTAL, "Session requests denied");
    describe_counter!(MESSAGES_DELIVERED_TOTAL, "Messages delivered to sessions");
    describe_counter!(STREAM_DROPS_TOTAL, "Stream events dropped on full channels");
    describe_histogram!(SESSION_CYCLE_DURATION_SECONDS, "Session cycle duration");
    describe_counter!(HTTP_REQUESTS_TOTAL, "HTTP requests handled");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_recorder_renders() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!(MESSAGES_APPENDED_TOTAL, "room" => "private").increment(2);
        });
        let output = render(&handle);
        assert!(output.contains("messages_appended_total"));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            MESSAGES_APPENDED_TOTAL,
            MESSAGES_DUPLICATE_TOTAL,
            MESSAGES_REJECTED_TOTAL,
            STORE_CORRUPTION_RESETS_TOTAL,
            CACHE_HITS_TOTAL,
            CACHE_MISSES_TOTAL,
            CACHE_EVICTIONS_TOTAL,
            BROADCAST_SUBSCRIBER_FAILURES_TOTAL,
            LIVE_SESSIONS_OPENED_TOTAL,
            LIVE_SESSIONS_ACTIVE,
            ADMISSION_REJECTIONS_TOTAL,
            MESSAGES_DELIVERED_TOTAL,
            STREAM_DROPS_TOTAL,
            SESSION_CYCLE_DURATION_SECONDS,
            HTTP_REQUESTS_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
