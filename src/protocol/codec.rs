//! Envelope sealing and opening.
//!
//! Outbound: JSON → AEAD under the session key → base64 for the transport.
//! Inbound: base64 → AEAD open (trying each candidate key in order) → JSON.
//!
//! Any failure at any step is folded into [`Error::BadMessage`]; the
//! listener drops such frames without tearing the session down.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::crypto;
use crate::error::{Error, Result};

/// Seal a JSON-serializable value for the transport.
pub fn seal<T: Serialize>(value: &T, key: &[u8; crypto::KEY_LEN]) -> Result<String> {
    let plaintext = serde_json::to_vec(value)?;
    let sealed = crypto::seal(key, &plaintext)?;
    Ok(BASE64.encode(sealed))
}

/// Open a transport payload, trying each candidate key in order.
pub fn open<T: DeserializeOwned>(payload: &str, keys: &[[u8; crypto::KEY_LEN]]) -> Result<T> {
    let sealed = BASE64
        .decode(payload.trim())
        .map_err(|e| Error::bad_message(format!("payload is not base64: {e}")))?;

    for key in keys {
        match crypto::open(key, &sealed) {
            Ok(plaintext) => {
                return serde_json::from_slice(&plaintext)
                    .map_err(|e| Error::bad_message(format!("envelope JSON: {e}")));
            }
            Err(Error::BadAuth) => continue,
            Err(e) => return Err(Error::bad_message(e)),
        }
    }
    Err(Error::bad_message("no candidate key opened the frame"))
}
