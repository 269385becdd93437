//! CLI subcommand implementations.
//!
//! Commands talk to the daemon through the typed control client and print
//! for humans; exit-code mapping happens in `main`. Organized by domain:
//!
//! - [`pair`] - pairing lifecycle (pair, unpair)
//! - [`me`] - cached identity display and refresh
//! - [`hosts`] - pinned-host records
//! - [`sign`] - ad-hoc signatures over the control plane

pub mod hosts;
pub mod me;
pub mod pair;
pub mod sign;

use crate::control::DaemonClient;
use crate::error::Result;
use crate::persistence::KrDir;

/// Shared command context.
pub fn client() -> Result<(KrDir, DaemonClient)> {
    let dir = KrDir::open().map_err(|e| crate::error::Error::Internal(e.to_string()))?;
    let client = DaemonClient::new(&dir);
    Ok((dir, client))
}

/// `kr noop`: poke the phone without side effects.
pub async fn noop() -> Result<()> {
    let (_dir, client) = client()?;
    client.request_noop().await?;
    println!("phone acknowledged");
    Ok(())
}

/// `kr version`: CLI and daemon versions.
pub async fn version() -> Result<()> {
    println!("kr {}", crate::constants::VERSION);
    let (_dir, client) = client()?;
    match client.request_krd_version().await {
        Ok(v) => println!("krd {v}"),
        Err(e) => {
            if !crate::env::silence_warnings() {
                eprintln!("krd unreachable: {e}");
            }
        }
    }
    Ok(())
}

/// `kr restart`: bounce the daemon through the supervisor.
pub fn restart() -> Result<()> {
    let dir = KrDir::open().map_err(|e| crate::error::Error::Internal(e.to_string()))?;
    if !crate::daemon::is_daemon_running(&dir) {
        log::info!("no live daemon recorded in the PID file; asking the supervisor anyway");
    }
    crate::daemon::restart_daemon();
    Ok(())
}
