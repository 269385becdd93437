//! Runtime environment toggles.
//!
//! Single source of truth for the `KR_*` environment variables recognized by
//! the daemon and the CLI:
//!
//! - `KR_HOME` - override the per-user state directory (default `~/.kr`)
//! - `KR_QUEUE_URL` - override the cloud queue relay base URL
//! - `KR_SKIP_SSH_CONFIG` - suppress the SSH-config edit during pairing
//! - `KR_SILENCE_WARNINGS` - suppress non-fatal CLI warnings
//! - `KR_NO_STDERR` - route logs to a file instead of stderr
//! - `KR_LOG_LEVEL` - log filter (error/warn/info/debug/trace)
//! - `KR_LOG_SYSLOG` - log to syslog instead of stderr

/// Default relay base URL for the cloud queue service.
pub const DEFAULT_QUEUE_URL: &str = "https://queue.krypt.co";

fn flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => !v.is_empty() && v != "0" && v.to_ascii_lowercase() != "false",
        Err(_) => false,
    }
}

/// Override for the per-user state directory (`~/.kr`).
pub fn home_override() -> Option<String> {
    std::env::var("KR_HOME").ok().filter(|v| !v.is_empty())
}

/// Base URL of the queue relay.
pub fn queue_url() -> String {
    std::env::var("KR_QUEUE_URL")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_QUEUE_URL.to_string())
}

/// `true` when the CLI must not touch `~/.ssh/config`.
pub fn skip_ssh_config() -> bool {
    flag("KR_SKIP_SSH_CONFIG")
}

/// `true` when non-fatal CLI warnings should be suppressed.
pub fn silence_warnings() -> bool {
    flag("KR_SILENCE_WARNINGS")
}

/// `true` when logs must not be written to stderr.
pub fn no_stderr() -> bool {
    flag("KR_NO_STDERR")
}

/// Log filter string, default `info`.
pub fn log_level() -> String {
    std::env::var("KR_LOG_LEVEL")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "info".to_string())
}

/// `true` when logs should go to syslog.
pub fn log_syslog() -> bool {
    flag("KR_LOG_SYSLOG")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_parsing() {
        std::env::remove_var("KR_TEST_FLAG_X");
        assert!(!flag("KR_TEST_FLAG_X"));

        std::env::set_var("KR_TEST_FLAG_X", "1");
        assert!(flag("KR_TEST_FLAG_X"));

        std::env::set_var("KR_TEST_FLAG_X", "0");
        assert!(!flag("KR_TEST_FLAG_X"));

        std::env::set_var("KR_TEST_FLAG_X", "false");
        assert!(!flag("KR_TEST_FLAG_X"));

        std::env::set_var("KR_TEST_FLAG_X", "true");
        assert!(flag("KR_TEST_FLAG_X"));

        std::env::remove_var("KR_TEST_FLAG_X");
    }

    #[test]
    fn test_queue_url_default() {
        std::env::remove_var("KR_QUEUE_URL");
        assert_eq!(queue_url(), DEFAULT_QUEUE_URL);
    }
}
