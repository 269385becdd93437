//! Host-auth sidecar.
//!
//! The SSH KEX interposer connects to a dedicated local stream socket and
//! delivers exactly one JSON-encoded [`HostAuth`] record per connection
//! (framed by connection close). The sidecar validates that the host key
//! and signature parse as SSH wire structures and that at least one host
//! name is present, then forwards the record to the enclave client. Every
//! failure is logged and dropped; nothing here is fatal to the daemon.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;

use crate::enclave::EnclaveClient;
use crate::error::{Error, Result};
use crate::protocol::HostAuth;
use crate::sshwire;

/// Largest accepted host-auth record.
const MAX_RECORD: u64 = 256 * 1024;

/// Host-auth socket server.
#[derive(Debug)]
pub struct HostAuthServer {
    accept_handle: JoinHandle<()>,
}

impl HostAuthServer {
    /// Spawn the accept loop on a pre-opened listener.
    pub fn start(listener: UnixListener, enclave: Arc<EnclaveClient>) -> Self {
        let accept_handle = tokio::spawn(Self::accept_loop(listener, enclave));
        Self { accept_handle }
    }

    async fn accept_loop(listener: UnixListener, enclave: Arc<EnclaveClient>) {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let enclave = Arc::clone(&enclave);
                    tokio::spawn(async move {
                        match read_record(stream).await {
                            Ok(host_auth) => {
                                if let Err(e) = enclave.submit_host_auth(host_auth).await {
                                    log::warn!("[host-auth] submit failed: {e}");
                                }
                            }
                            Err(e) => log::warn!("[host-auth] dropping record: {e}"),
                        }
                    });
                }
                Err(e) => {
                    log::error!("[host-auth] accept error: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Stop accepting connections.
    pub fn shutdown(self) {
        self.accept_handle.abort();
    }
}

/// Read one connection to EOF and validate the record it carries.
async fn read_record(mut stream: UnixStream) -> Result<HostAuth> {
    let mut raw = Vec::new();
    (&mut stream)
        .take(MAX_RECORD)
        .read_to_end(&mut raw)
        .await
        .map_err(|e| Error::bad_message(format!("read: {e}")))?;

    let host_auth: HostAuth = serde_json::from_slice(&raw)
        .map_err(|e| Error::bad_message(format!("host auth JSON: {e}")))?;
    validate(&host_auth)?;
    Ok(host_auth)
}

/// Structural validation before the record goes anywhere.
fn validate(host_auth: &HostAuth) -> Result<()> {
    sshwire::parse_public_key(&host_auth.host_key)
        .map_err(|e| Error::bad_message(format!("host key: {e}")))?;
    sshwire::parse_signature(&host_auth.signature)
        .map_err(|e| Error::bad_message(format!("kex signature: {e}")))?;
    if host_auth.host_names.iter().all(|h| h.trim().is_empty()) {
        return Err(Error::bad_message("host auth carries no host names"));
    }
    Ok(())
}
