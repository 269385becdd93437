//! `kr pair` and `kr unpair`.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::ssh_config::SshConfig;

/// How long `kr pair` waits for the phone to scan and answer.
const PAIR_WAIT: Duration = Duration::from_secs(120);

/// Generate a fresh pairing, print the QR payload, wire up SSH config, and
/// wait for the phone to answer.
pub async fn pair(force: bool, name: Option<String>) -> Result<()> {
    let (dir, client) = super::client()?;

    let qr = client.pair(name).await?;
    println!("{}", serde_json::to_string(&qr)?);
    println!();
    println!("Scan the payload above with the Krypton phone app.");

    if crate::env::skip_ssh_config() {
        log::info!("KR_SKIP_SSH_CONFIG set; leaving ~/.ssh/config alone");
    } else {
        let config = SshConfig::for_user(&dir).map_err(|e| Error::Internal(e.to_string()))?;
        match config.edit(force) {
            Ok(outcome) => log::info!("ssh config: {outcome:?}"),
            Err(e) => {
                if !crate::env::silence_warnings() {
                    eprintln!("warning: could not update SSH config: {e}");
                }
            }
        }
    }

    // The daemon's bootstrap identity request completes when the phone
    // scans; poll the cache until it lands.
    let deadline = Instant::now() + PAIR_WAIT;
    while Instant::now() < deadline {
        match client.request_me().await {
            Ok(profile) => {
                let who = profile
                    .email
                    .unwrap_or_else(|| crate::crypto::hex(&crate::crypto::sha256(&profile.ssh_wire_public_key)));
                println!("Paired with {who}.");
                return Ok(());
            }
            Err(Error::NotPaired) | Err(Error::Timeout) => {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::Timeout)
}

/// Clear the pairing on the daemon and remove our SSH config block.
pub async fn unpair() -> Result<()> {
    let (dir, client) = super::client()?;
    client.unpair().await?;

    if !crate::env::skip_ssh_config() {
        if let Ok(config) = SshConfig::for_user(&dir) {
            match config.remove() {
                Ok(true) => log::info!("removed Krypton block from SSH config"),
                Ok(false) => {}
                Err(e) => {
                    if !crate::env::silence_warnings() {
                        eprintln!("warning: could not clean SSH config: {e}");
                    }
                }
            }
        }
    }

    println!("Unpaired.");
    Ok(())
}
