//! Application-wide constants.
//!
//! Centralizes timeouts, intervals, and protocol limits. Constants are
//! grouped by domain.

use std::time::Duration;

// ============================================================================
// Identity
// ============================================================================

/// Crate version, reported by `GET /version` and `kr version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// User-Agent header sent with queue relay and push wake requests.
pub fn user_agent() -> String {
    format!("krd/{}", VERSION)
}

// ============================================================================
// Request timeouts
// ============================================================================

/// How long a signature request waits for the phone.
///
/// Signing requires the user to approve on the phone, so this is generous.
pub const SIGN_TIMEOUT: Duration = Duration::from_secs(20);

/// How long me/list/hosts/noop requests wait for the phone.
pub const SHORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay before the single internal retry of a force-refreshed me request.
pub const ME_RETRY_DELAY: Duration = Duration::from_millis(500);

// ============================================================================
// Transport
// ============================================================================

/// Server-side long-poll wait requested from the queue relay.
pub const QUEUE_POLL_WAIT: Duration = Duration::from_secs(20);

/// Outer HTTP timeout for queue operations; must exceed the long-poll wait.
pub const QUEUE_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Initial listener backoff after a transport receive error.
pub const LISTEN_BACKOFF_MIN: Duration = Duration::from_millis(250);

/// Listener backoff ceiling.
pub const LISTEN_BACKOFF_MAX: Duration = Duration::from_secs(10);

/// HTTP timeout for the content-less push wake.
pub const PUSH_WAKE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Engine
// ============================================================================

/// Capacity of the seen-request-id LRU used for at-least-once dedup.
pub const SEEN_LRU_CAPACITY: usize = 1024;

// ============================================================================
// Control plane
// ============================================================================

/// CLI-side connect/read timeout for daemon control requests.
pub const CONTROL_CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause after a supervisor restart before the CLI reconnects.
pub const RESTART_SETTLE: Duration = Duration::from_secs(1);

// ============================================================================
// Notification bus
// ============================================================================

/// Notify files idle longer than this are garbage-collected.
pub const NOTIFY_MAX_IDLE: Duration = Duration::from_secs(3600);

/// How often the daemon runs the notify-file reaper.
pub const NOTIFY_REAP_INTERVAL: Duration = Duration::from_secs(600);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_are_consistent() {
        // The outer HTTP timeout must cover the requested long-poll wait.
        assert!(QUEUE_HTTP_TIMEOUT > QUEUE_POLL_WAIT);
        // Sign waits longer than the short request class.
        assert!(SIGN_TIMEOUT > SHORT_TIMEOUT);
        assert!(LISTEN_BACKOFF_MIN < LISTEN_BACKOFF_MAX);
    }
}
