//! Krypton workstation daemon and CLI.
//!
//! A split SSH agent: the workstation holds no private keys and forwards
//! signing requests over an authenticated, end-to-end encrypted link to a
//! paired phone that owns the key inside its secure enclave.

// Library modules
pub mod agent;
pub mod commands;
pub mod constants;
pub mod control;
pub mod crypto;
pub mod daemon;
pub mod enclave;
pub mod env;
pub mod error;
pub mod hostauth;
pub mod identity;
pub mod logging;
pub mod notify;
pub mod pairing;
pub mod persistence;
pub mod protocol;
pub mod ssh_config;
pub mod sshwire;
pub mod transport;

// Re-export commonly used types
pub use control::DaemonClient;
pub use enclave::{EnclaveClient, TransportFactory};
pub use error::{Error, Result};
pub use notify::NotificationBus;
pub use pairing::PairingSecret;
pub use persistence::KrDir;
pub use protocol::{Profile, Request, Response};
