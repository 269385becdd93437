//! `krd` - the Krypton workstation daemon.
//!
//! Serves the SSH-agent socket, the host-auth sidecar, and the control
//! plane; owns the enclave client. Kept alive by the service supervisor,
//! which may pass pre-opened listeners (`LISTEN_FDS`).

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let dir = kr::KrDir::open()?;
    kr::logging::init("krd", Some(dir.root()));
    log::info!("krd {} starting", kr::constants::VERSION);
    kr::daemon::run(dir).await
}
