//! Pairing identity and session-key schedule.
//!
//! A [`PairingSecret`] is the whole identity of one workstation↔phone
//! pairing: the fresh symmetric seed shown to the phone inside the QR code,
//! the workstation's long-lived static P-256 keypair, and (once the phone
//! has answered for the first time) the phone's static public key.
//!
//! The workstation private key never leaves this struct. The queue both
//! sides rendezvous on is named by the hex SHA-256 of the workstation's
//! uncompressed static public key.
//!
//! # Key schedule
//!
//! Until the phone's static key is known, frames are sealed under a
//! bootstrap key derived from the seed alone. After first contact both
//! sides switch to the ECDH-mixed session key. Inbound decrypt tries the
//! session key first and falls back to the bootstrap key to cover frames
//! already in flight around the switch.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use p256::elliptic_curve::rand_core::OsRng;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::EncodePublicKey;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::crypto;
use crate::error::{Error, Result};

/// Current pairing format version, embedded in the QR payload and the
/// persisted file.
pub const PAIRING_VERSION: u32 = 2;

/// The identity of one workstation↔phone pairing.
#[derive(Clone)]
pub struct PairingSecret {
    seed: [u8; 32],
    secret_key: p256::SecretKey,
    /// Human-readable workstation name shown on the phone.
    pub workstation_name: String,
    phone_public_key: Option<p256::PublicKey>,
    /// Opaque push endpoint registered by the phone, if any.
    pub push_endpoint: Option<String>,
    /// Creation time, unix seconds.
    pub created: i64,
    /// Format version tag.
    pub version: u32,
}

impl std::fmt::Debug for PairingSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingSecret")
            .field("workstation_name", &self.workstation_name)
            .field("queue_name", &self.queue_name())
            .field("bound", &self.phone_public_key.is_some())
            .field("push_endpoint", &self.push_endpoint)
            .field("created", &self.created)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl Drop for PairingSecret {
    fn drop(&mut self) {
        self.seed.zeroize();
        // p256::SecretKey zeroizes itself on drop.
    }
}

/// On-disk form of a pairing (`~/.kr/pairing.json`). Binary fields are
/// base64.
#[derive(Debug, Serialize, Deserialize)]
pub struct StoredPairing {
    /// Base64 32-byte session seed.
    pub seed: String,
    /// Base64 32-byte P-256 private scalar.
    pub workstation_secret_key: String,
    /// Workstation name.
    pub workstation_name: String,
    /// Base64 65-byte uncompressed phone static public key, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_public_key: Option<String>,
    /// Opaque push endpoint registered by the phone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_endpoint: Option<String>,
    /// Creation time, unix seconds.
    pub created: i64,
    /// Format version tag.
    pub version: u32,
}

impl PairingSecret {
    /// Generate a fresh pairing: new seed, new static keypair.
    pub fn generate(workstation_name: Option<String>) -> Self {
        let name = workstation_name.unwrap_or_else(default_workstation_name);
        Self {
            seed: crypto::random_seed(),
            secret_key: p256::SecretKey::random(&mut OsRng),
            workstation_name: name,
            phone_public_key: None,
            push_endpoint: None,
            created: chrono::Utc::now().timestamp(),
            version: PAIRING_VERSION,
        }
    }

    /// The workstation static public key as a 65-byte uncompressed point.
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.secret_key
            .public_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }

    /// The workstation static public key as SPKI DER (for the QR payload).
    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        Ok(self
            .secret_key
            .public_key()
            .to_public_key_der()
            .map_err(|e| Error::BadKey(e.to_string()))?
            .as_bytes()
            .to_vec())
    }

    /// Queue both sides rendezvous on: hex SHA-256 of the uncompressed
    /// static public key. Deterministic across restarts.
    pub fn queue_name(&self) -> String {
        crypto::hex(&crypto::sha256(&self.public_key_bytes()))
    }

    /// The phone's static public key, once bound.
    pub fn phone_public_key_bytes(&self) -> Option<Vec<u8>> {
        self.phone_public_key
            .as_ref()
            .map(|pk| pk.to_encoded_point(false).as_bytes().to_vec())
    }

    /// Whether the phone's static key is bound yet.
    pub fn is_bound(&self) -> bool {
        self.phone_public_key.is_some()
    }

    /// Install the phone's static public key on first contact.
    ///
    /// Returns `true` when the key was newly installed, `false` when the
    /// same key was already bound. A different key fails with
    /// [`Error::PhoneChanged`]; the session must be torn down.
    pub fn on_first_contact(&mut self, phone_public: &[u8]) -> Result<bool> {
        let incoming = p256::PublicKey::from_sec1_bytes(phone_public)
            .map_err(|_| Error::BadKey("phone static key is not a P-256 point".into()))?;
        match &self.phone_public_key {
            None => {
                self.phone_public_key = Some(incoming);
                Ok(true)
            }
            Some(existing) if *existing == incoming => Ok(false),
            Some(_) => Err(Error::PhoneChanged),
        }
    }

    /// Pre-contact key, derived from the seed alone.
    pub fn bootstrap_key(&self) -> [u8; 32] {
        crypto::derive_bootstrap_key(&self.seed)
    }

    /// Post-contact session key. `None` until the phone is bound.
    pub fn session_key(&self) -> Option<[u8; 32]> {
        let phone = self.phone_public_key.as_ref()?;
        let shared = crypto::ecdh(&self.secret_key, phone);
        Some(crypto::derive_session_key(&self.seed, &shared))
    }

    /// Key used to seal outbound frames right now.
    pub fn send_key(&self) -> [u8; 32] {
        self.session_key().unwrap_or_else(|| self.bootstrap_key())
    }

    /// Keys tried, in order, when opening inbound frames.
    pub fn receive_keys(&self) -> Vec<[u8; 32]> {
        let mut keys = Vec::with_capacity(2);
        if let Some(k) = self.session_key() {
            keys.push(k);
        }
        keys.push(self.bootstrap_key());
        keys
    }

    /// The public half of the pairing, rendered as the QR payload JSON.
    pub fn qr_payload(&self) -> Result<serde_json::Value> {
        Ok(serde_json::json!({
            "pk": BASE64.encode(self.public_key_der()?),
            "seed": BASE64.encode(self.seed),
            "name": self.workstation_name,
            "version": self.version,
        }))
    }

    /// Convert to the on-disk form.
    pub fn to_stored(&self) -> StoredPairing {
        StoredPairing {
            seed: BASE64.encode(self.seed),
            workstation_secret_key: BASE64.encode(self.secret_key.to_bytes()),
            workstation_name: self.workstation_name.clone(),
            phone_public_key: self
                .phone_public_key_bytes()
                .map(|b| BASE64.encode(b)),
            push_endpoint: self.push_endpoint.clone(),
            created: self.created,
            version: self.version,
        }
    }

    /// Rebuild from the on-disk form.
    pub fn from_stored(stored: &StoredPairing) -> Result<Self> {
        let seed_bytes = BASE64
            .decode(&stored.seed)
            .map_err(|_| Error::BadKey("pairing seed is not base64".into()))?;
        let seed: [u8; 32] = seed_bytes
            .try_into()
            .map_err(|_| Error::BadKey("pairing seed must be 32 bytes".into()))?;

        let scalar = BASE64
            .decode(&stored.workstation_secret_key)
            .map_err(|_| Error::BadKey("workstation key is not base64".into()))?;
        let secret_key = p256::SecretKey::from_slice(&scalar)
            .map_err(|_| Error::BadKey("workstation key is not a P-256 scalar".into()))?;

        let phone_public_key = match &stored.phone_public_key {
            Some(b64) => {
                let bytes = BASE64
                    .decode(b64)
                    .map_err(|_| Error::BadKey("phone key is not base64".into()))?;
                Some(
                    p256::PublicKey::from_sec1_bytes(&bytes)
                        .map_err(|_| Error::BadKey("phone key is not a P-256 point".into()))?,
                )
            }
            None => None,
        };

        Ok(Self {
            seed,
            secret_key,
            workstation_name: stored.workstation_name.clone(),
            phone_public_key,
            push_endpoint: stored.push_endpoint.clone(),
            created: stored.created,
            version: stored.version,
        })
    }
}

/// Default workstation name based on hostname.
fn default_workstation_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "workstation".to_string())
}
