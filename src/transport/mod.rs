//! Transports carrying opaque ciphertext frames to and from the phone.
//!
//! Two production transports share one contract: the cloud queue
//! ([`queue::QueueTransport`]) and Bluetooth LE ([`ble::BleTransport`]).
//! The engine sends via the preferred available transport and listens on
//! every active one; payloads are base64 strings produced by the codec, so
//! delivery is at-least-once and the engine deduplicates by request id.
//!
//! ```text
//! EnclaveClient
//!     │ publish (preferred first)          listen loop per transport
//!     ▼                                        ▲
//! TransportSet ──► QueueTransport ── cloud ────┤
//!              └─► BleTransport ──── radio ────┘
//! ```

pub mod ble;
pub mod memory;
pub mod push;
pub mod queue;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{Error, Result};

/// A bidirectional pipe for opaque base64 ciphertext frames.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short transport name for logs.
    fn name(&self) -> &'static str;

    /// Whether this transport can currently carry a publish.
    fn available(&self) -> bool {
        true
    }

    /// Publish one payload toward the phone.
    ///
    /// # Errors
    ///
    /// [`Error::Transport`] when the publish could not be handed to the
    /// underlying medium. Publishing is not acknowledged end-to-end;
    /// delivery confirmation is the response itself.
    async fn publish(&self, payload: String) -> Result<()>;

    /// Receive pending payloads from the phone.
    ///
    /// May block up to the transport's long-poll bound and may legitimately
    /// return zero messages; callers re-poll. Receipt is destructive.
    async fn receive(&self) -> Result<Vec<String>>;
}

/// The set of transports active for one pairing.
///
/// Publish goes to the first available transport in priority order (BLE
/// before queue when both are up); the engine spawns a listener per member.
#[derive(Clone)]
pub struct TransportSet {
    transports: Vec<Arc<dyn Transport>>,
}

impl std::fmt::Debug for TransportSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.transports.iter().map(|t| t.name()).collect();
        f.debug_struct("TransportSet").field("members", &names).finish()
    }
}

impl TransportSet {
    /// Build a set from transports in descending priority order.
    pub fn new(transports: Vec<Arc<dyn Transport>>) -> Self {
        Self { transports }
    }

    /// All members, for per-transport listeners.
    pub fn members(&self) -> &[Arc<dyn Transport>] {
        &self.transports
    }

    /// True when the set has no members.
    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }

    /// Publish via the preferred available transport, falling back down the
    /// priority order when a publish fails.
    pub async fn publish(&self, payload: String) -> Result<()> {
        let mut last_err = Error::Transport("no transport available".into());
        for transport in &self.transports {
            if !transport.available() {
                continue;
            }
            match transport.publish(payload.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::warn!("[transport] publish via {} failed: {e}", transport.name());
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}
