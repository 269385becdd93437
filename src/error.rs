//! Crate-wide error kinds.
//!
//! The request/response engine surfaces only these kinds to callers; all
//! lower-level failures (socket errors, HTTP errors, codec mishaps) are
//! folded into `Transport` or `BadMessage` before they cross a component
//! boundary. The control server and the CLI map kinds to HTTP status codes
//! and process exit codes respectively.

use thiserror::Error;

/// Convenience alias used throughout the daemon internals.
pub type Result<T> = std::result::Result<T, Error>;

/// Semantic error kinds surfaced by the daemon.
#[derive(Debug, Error)]
pub enum Error {
    /// No active pairing; recoverable by `PUT /pair`.
    #[error("not paired")]
    NotPaired,

    /// A request slot expired before the phone answered.
    #[error("request timed out")]
    Timeout,

    /// The phone explicitly denied the request.
    #[error("request rejected by phone: {0}")]
    Rejected(String),

    /// Queue or BLE publish/receive failed; retriable.
    #[error("transport error: {0}")]
    Transport(String),

    /// Inbound message failed decrypt or decode; dropped, never fatal.
    #[error("bad message: {0}")]
    BadMessage(String),

    /// The first-bound phone static key changed. Fatal to the session.
    #[error("paired phone public key changed")]
    PhoneChanged,

    /// The phone reported a pinned-host mismatch during host auth.
    #[error("host key mismatch")]
    HostKeyMismatch,

    /// Malformed key material.
    #[error("bad key: {0}")]
    BadKey(String),

    /// AEAD open or signature check failed.
    #[error("authentication failed")]
    BadAuth,

    /// Unreachable / code bug.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status used by the control server for this kind.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::NotPaired => 404,
            Error::Timeout => 408,
            Error::Transport(_) => 502,
            _ => 500,
        }
    }

    /// CLI process exit code for this kind.
    ///
    /// `0` success, `1` generic failure, `2` not-paired, `3` rejected,
    /// `4` timeout.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::NotPaired => 2,
            Error::Rejected(_) => 3,
            Error::Timeout => 4,
            _ => 1,
        }
    }

    /// Fold a lower-level failure into the retriable transport kind.
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Error::Transport(err.to_string())
    }

    /// Fold a codec-level failure into the droppable message kind.
    pub fn bad_message(err: impl std::fmt::Display) -> Self {
        Error::BadMessage(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::BadMessage(err.to_string())
    }
}
