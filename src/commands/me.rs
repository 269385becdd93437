//! `kr me`: display the paired phone's identity.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::Result;
use crate::protocol::Profile;
use crate::sshwire;

/// Print the cached identity, optionally forcing a phone refresh.
pub async fn me(refresh: bool, user_id: Option<String>) -> Result<()> {
    let (_dir, client) = super::client()?;
    let profile = if refresh {
        client.request_me_force_refresh(user_id).await?
    } else {
        client.request_me().await?
    };
    print_profile(&profile);
    Ok(())
}

fn print_profile(profile: &Profile) {
    if let Some(email) = &profile.email {
        println!("{email}");
    }
    println!(
        "fingerprint: {}",
        crate::crypto::hex(&profile.fingerprint())
    );
    println!("{}", authorized_key_line(profile));
    if profile.pgp_public_key.is_some() {
        println!("(PGP public key available; use `kr me --refresh` to update)");
    }
}

/// `authorized_keys`-format line for the profile's SSH key.
fn authorized_key_line(profile: &Profile) -> String {
    let algo = sshwire::parse_public_key(&profile.ssh_wire_public_key)
        .map(|pk| pk.algo)
        .unwrap_or_else(|_| "ssh-key".to_string());
    format!(
        "{algo} {} kr",
        BASE64.encode(&profile.ssh_wire_public_key)
    )
}
