//! Cached phone identity and the proxied signer.
//!
//! The workstation never holds key material. The signer handed to the
//! agent frontend carries only the cached public key and delegates every
//! signing operation to the enclave client, which forwards it to the
//! phone.

use async_trait::async_trait;
use std::sync::Arc;

use crate::enclave::EnclaveClient;
use crate::error::{Error, Result};
use crate::protocol::{Profile, SignRequest};
use crate::sshwire::{self, SshSignature};

/// Context attached to a signature request for display on the phone and
/// notification addressing.
#[derive(Debug, Clone, Default)]
pub struct SignContext {
    /// Invoking command line, if known.
    pub command: Option<String>,
    /// Remote host, if known.
    pub hostname: Option<String>,
    /// Remote user, if known.
    pub user: Option<String>,
    /// Notification bus prefix of the invoking wrapper, if known.
    pub notify_prefix: Option<String>,
}

/// Something that can produce SSH signatures for one public key.
#[async_trait]
pub trait Signer: Send + Sync {
    /// SSH-wire-format public key blob.
    fn public_key_blob(&self) -> &[u8];

    /// Sign `data`, honoring the agent sign flags for algorithm selection.
    async fn sign(&self, data: &[u8], flags: u32, ctx: SignContext) -> Result<SshSignature>;
}

/// Signer backed by the phone via the enclave client.
#[derive(Debug, Clone)]
pub struct ProxiedSigner {
    profile: Profile,
    key_algo: String,
    enclave: Arc<EnclaveClient>,
}

impl ProxiedSigner {
    /// Signer for the currently cached profile, if any.
    pub async fn from_cache(enclave: &Arc<EnclaveClient>) -> Option<Self> {
        let profile = enclave.cached_profile().await?;
        let key_algo = sshwire::parse_public_key(&profile.ssh_wire_public_key)
            .ok()?
            .algo;
        Some(Self {
            profile,
            key_algo,
            enclave: Arc::clone(enclave),
        })
    }

    /// The cached profile this signer fronts.
    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Key format name (`ssh-ed25519`, `ssh-rsa`, …).
    pub fn key_algo(&self) -> &str {
        &self.key_algo
    }
}

#[async_trait]
impl Signer for ProxiedSigner {
    fn public_key_blob(&self) -> &[u8] {
        &self.profile.ssh_wire_public_key
    }

    async fn sign(&self, data: &[u8], flags: u32, ctx: SignContext) -> Result<SshSignature> {
        let request = SignRequest {
            public_key_fingerprint: self.profile.fingerprint().to_vec(),
            data: data.to_vec(),
            command: ctx.command,
            hostname: ctx.hostname,
            user: ctx.user,
        };

        let response = self
            .enclave
            .request_signature(request, ctx.notify_prefix)
            .await?;

        if response.is_rejected() {
            return Err(Error::Rejected("phone denied the request".into()));
        }
        if let Some(error) = response.error {
            return Err(Error::Rejected(error));
        }
        let raw = response
            .signature
            .ok_or_else(|| Error::bad_message("sign response carries no signature"))?;

        Ok(SshSignature {
            algo: sshwire::signature_algo(&self.key_algo, flags),
            raw,
        })
    }
}
