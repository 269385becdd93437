//! `kr sign`: ad-hoc signature through the daemon.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::{Error, Result};

/// Request a signature over base64 `data` with the key named by the base64
/// SHA-256 `fingerprint`; prints the base64 signature.
pub async fn sign(fingerprint: &str, data: &str) -> Result<()> {
    let fingerprint = BASE64
        .decode(fingerprint)
        .map_err(|_| Error::BadKey("fingerprint is not base64".into()))?;
    let data = BASE64
        .decode(data)
        .map_err(|_| Error::bad_message("data is not base64"))?;

    let (_dir, client) = super::client()?;
    let signature = client.sign(fingerprint, data).await?;
    println!("{}", BASE64.encode(signature));
    Ok(())
}
