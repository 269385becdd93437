//! Control plane: HTTP/1.1 over the daemon's Unix socket.
//!
//! The server side (C9-style endpoints) is consumed exclusively by the CLI
//! through the typed client in [`client`].

pub mod client;
pub mod server;

pub use client::DaemonClient;
