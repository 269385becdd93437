//! Notification bus.
//!
//! An append-only, per-prefix file stream in the user's state directory.
//! Writers (the engine and the agent frontend) append newline-terminated
//! messages; readers (the CLI, the ssh wrapper) tail their file. Two line
//! forms exist:
//!
//! - literal text — general informational status (global `krd.notify`)
//! - `[<prefix>] <payload>` — addressed to the consumer that registered
//!   `<prefix>` (its file is `<prefix>.notify`)
//!
//! Well-known addressed payloads: `STOP`, `HOST_KEY_MISMATCH`, `REJECTED`.
//!
//! Delivery is best-effort. A write failure never blocks or errors the
//! producer; stale files are garbage-collected after a bounded idle
//! interval by [`NotificationBus::reap`].

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::Duration;

/// Addressed payload: consumer should stop waiting.
pub const PAYLOAD_STOP: &str = "STOP";

/// Addressed payload: pinned host key did not match.
pub const PAYLOAD_HOST_KEY_MISMATCH: &str = "HOST_KEY_MISMATCH";

/// Addressed payload: phone denied the request.
pub const PAYLOAD_REJECTED: &str = "REJECTED";

/// File name of the unaddressed stream.
const GLOBAL_FILE: &str = "krd.notify";

/// Writer handle over the notification directory.
#[derive(Debug, Clone)]
pub struct NotificationBus {
    dir: PathBuf,
}

impl NotificationBus {
    /// Bus rooted at the given state directory.
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Append an informational line to the global stream.
    pub fn info(&self, message: &str) {
        self.append(&self.dir.join(GLOBAL_FILE), message);
    }

    /// Append an addressed payload to the prefix's stream.
    pub fn addressed(&self, prefix: &str, payload: &str) {
        let Some(file) = prefix_file(prefix) else {
            log::debug!("[notify] dropping line for unusable prefix {prefix:?}");
            return;
        };
        self.append(&self.dir.join(file), &format!("[{prefix}] {payload}"));
    }

    /// Route a payload: addressed when a prefix is known, global otherwise.
    pub fn notify(&self, prefix: Option<&str>, payload: &str) {
        match prefix {
            Some(p) => self.addressed(p, payload),
            None => self.info(payload),
        }
    }

    fn append(&self, path: &PathBuf, line: &str) {
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            // Best-effort by contract: never propagate to the producer.
            log::debug!("[notify] dropped line for {}: {e}", path.display());
        }
    }

    /// Remove `.notify` files idle longer than `max_idle`.
    ///
    /// Returns the number of files removed. Active consumers keep their
    /// file fresh by reading (and the writers by appending), so only
    /// abandoned streams age out.
    pub fn reap(&self, max_idle: Duration) -> usize {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e != "notify").unwrap_or(true) {
                continue;
            }
            let idle = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.elapsed().ok());
            if idle.map(|d| d > max_idle).unwrap_or(false) && std::fs::remove_file(&path).is_ok() {
                removed += 1;
                log::debug!("[notify] reaped stale {}", path.display());
            }
        }
        removed
    }
}

/// Sanitized file name for a prefix, or `None` when the prefix is unusable.
fn prefix_file(prefix: &str) -> Option<String> {
    if prefix.is_empty()
        || prefix.len() > 64
        || !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return None;
    }
    Some(format!("{prefix}.notify"))
}

/// Tail reader over one notification stream.
#[derive(Debug)]
pub struct NotificationReader {
    path: PathBuf,
    offset: u64,
}

impl NotificationReader {
    /// Reader for an addressed stream (or the global one with `None`).
    pub fn new(bus: &NotificationBus, prefix: Option<&str>) -> Self {
        let file = prefix
            .and_then(prefix_file)
            .unwrap_or_else(|| GLOBAL_FILE.to_string());
        Self {
            path: bus.dir.join(file),
            offset: 0,
        }
    }

    /// Complete lines appended since the previous call.
    pub fn read_new(&mut self) -> Vec<String> {
        let mut file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };
        if file.seek(SeekFrom::Start(self.offset)).is_err() {
            return Vec::new();
        }
        let mut buf = String::new();
        if file.read_to_string(&mut buf).is_err() {
            return Vec::new();
        }

        // Only consume whole lines; a torn write stays buffered on disk.
        let complete_len = buf.rfind('\n').map(|i| i + 1).unwrap_or(0);
        self.offset += complete_len as u64;
        buf[..complete_len]
            .lines()
            .map(|l| l.to_string())
            .collect()
    }
}
