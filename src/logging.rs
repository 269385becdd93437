//! Logger initialization.
//!
//! Backend selection:
//! - `KR_LOG_SYSLOG` set: syslog (facility USER, process name `krd`/`kr`).
//! - `KR_NO_STDERR` set: file target `{kr_dir}/krd.log`.
//! - otherwise: stderr via env_logger.
//!
//! The filter comes from `KR_LOG_LEVEL` (default `info`). Initialization is
//! idempotent; a second call is a no-op.

use std::path::Path;
use std::str::FromStr;
use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize logging for a binary. `process` is the syslog tag.
///
/// `log_dir` is used only when `KR_NO_STDERR` routes logs to a file; passing
/// `None` falls back to stderr even then.
pub fn init(process: &str, log_dir: Option<&Path>) {
    INIT.call_once(|| {
        let level = log::LevelFilter::from_str(&crate::env::log_level())
            .unwrap_or(log::LevelFilter::Info);

        if crate::env::log_syslog() {
            if syslog::init(syslog::Facility::LOG_USER, level, Some(process)).is_ok() {
                return;
            }
            // Fall through to stderr if the syslog socket is unavailable.
        }

        let mut builder = env_logger::Builder::new();
        builder.filter_level(level);
        builder.format_timestamp_secs();

        if crate::env::no_stderr() {
            if let Some(dir) = log_dir {
                if let Ok(file) = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join(format!("{process}.log")))
                {
                    builder.target(env_logger::Target::Pipe(Box::new(file)));
                }
            }
        }

        let _ = builder.try_init();
    });
}
