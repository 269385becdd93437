//! `kr hosts`: pinned-host records from the phone.

use crate::error::{Error, Result};

/// Fetch and print the phone's pinned-host records.
pub async fn hosts() -> Result<()> {
    let (_dir, client) = super::client()?;
    let response = client.request_hosts().await?;

    if let Some(error) = response.error {
        if error.to_ascii_lowercase().contains("mismatch") {
            return Err(Error::HostKeyMismatch);
        }
        return Err(Error::Rejected(error));
    }
    let Some(info) = response.host_info else {
        println!("no host records yet");
        return Ok(());
    };

    if let Some(user_ids) = info.pgp_user_ids.filter(|ids| !ids.is_empty()) {
        println!("PGP user ids:");
        for id in user_ids {
            println!("  {id}");
        }
    }
    match info.hosts {
        Some(hosts) if !hosts.is_empty() => {
            println!("known hosts:");
            for record in hosts {
                println!("  {}@{}", record.user, record.host);
            }
        }
        _ => println!("no SSH host records yet"),
    }
    Ok(())
}
