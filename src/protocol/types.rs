//! Typed request/response envelopes exchanged with the phone.
//!
//! The wire shape is JSON with base64 binary fields; exactly one sub-request
//! (resp. sub-response) is set per envelope. Fields that only steer local
//! bookkeeping (`notify_prefix`) never serialize.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{SHORT_TIMEOUT, SIGN_TIMEOUT};
use crate::error::{Error, Result};

/// Serde adapter: `Vec<u8>` as standard base64.
pub mod b64 {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        BASE64.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter: `Option<Vec<u8>>` as standard base64.
pub mod b64_opt {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_some(&BASE64.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let s: Option<String> = Option::deserialize(d)?;
        match s {
            Some(s) => BASE64
                .decode(s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Cached phone identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// SSH-wire-format public key bytes.
    #[serde(with = "b64")]
    pub ssh_wire_public_key: Vec<u8>,
    /// Email attached on the phone, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// PGP public key bundle, if the phone derived one.
    #[serde(default, with = "b64_opt", skip_serializing_if = "Option::is_none")]
    pub pgp_public_key: Option<Vec<u8>>,
}

impl Profile {
    /// SHA-256 fingerprint of the SSH-wire public key.
    pub fn fingerprint(&self) -> [u8; 32] {
        crate::crypto::sha256(&self.ssh_wire_public_key)
    }

    /// A profile without a public key is useless and treated as absent.
    pub fn has_public_key(&self) -> bool {
        !self.ssh_wire_public_key.is_empty()
    }
}

/// Captured KEX material from the interposer, forwarded for pinning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAuth {
    /// Remote host public key, SSH wire format.
    #[serde(with = "b64")]
    pub host_key: Vec<u8>,
    /// KEX reply signature, SSH wire format.
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
    /// `host` or `host:port` names this key was observed for.
    pub host_names: Vec<String>,
}

/// Request the phone's identity profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeRequest {
    /// Git user id to attach to PGP derivation, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Ask the phone to sign `data` with the key named by fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignRequest {
    /// SHA-256 of the SSH-wire public key to sign with.
    #[serde(with = "b64")]
    pub public_key_fingerprint: Vec<u8>,
    /// Bytes to sign (the SSH session digest).
    #[serde(with = "b64")]
    pub data: Vec<u8>,
    /// Invoking command, for display on the phone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Remote host name, for display on the phone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Remote user name, for display on the phone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// Enumerate phone-held keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRequest {}

/// Ask the phone for its pinned-host records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostsRequest {}

/// Liveness poke; no user interaction on the phone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoOpRequest {}

/// Pass-through git signing request (commit or tag payload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSignRequest {
    /// SHA-256 of the SSH-wire public key to sign with.
    #[serde(with = "b64")]
    pub public_key_fingerprint: Vec<u8>,
    /// Raw commit or tag bytes to sign.
    #[serde(with = "b64")]
    pub data: Vec<u8>,
    /// Git user id for PGP attribution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// A typed envelope addressed to the phone.
///
/// At most one sub-request is set; `request_id` is unique within a session
/// window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Base62 of 16 random bytes.
    pub request_id: String,
    /// Send time, unix seconds.
    pub unix_seconds: i64,
    /// Whether the phone should answer with an `AckResponse` on receipt.
    pub send_ack: bool,
    /// Local addressing tag for the notification bus; never on the wire.
    #[serde(skip)]
    pub notify_prefix: Option<String>,
    /// Identity request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub me_request: Option<MeRequest>,
    /// Signature request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign_request: Option<SignRequest>,
    /// Key-list request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_request: Option<ListRequest>,
    /// Pinned-hosts request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosts_request: Option<HostsRequest>,
    /// Liveness poke.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noop_request: Option<NoOpRequest>,
    /// Pass-through git signing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_sign_request: Option<GitSignRequest>,
    /// Host-key observation for phone-side pinning; single-shot, no reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_auth_request: Option<HostAuth>,
}

impl Request {
    fn empty() -> Self {
        Self {
            request_id: crate::crypto::random_request_id(),
            unix_seconds: chrono::Utc::now().timestamp(),
            send_ack: false,
            notify_prefix: None,
            me_request: None,
            sign_request: None,
            list_request: None,
            hosts_request: None,
            noop_request: None,
            git_sign_request: None,
            host_auth_request: None,
        }
    }

    /// Fresh identity request.
    pub fn me(req: MeRequest) -> Self {
        Self {
            me_request: Some(req),
            ..Self::empty()
        }
    }

    /// Fresh signature request.
    pub fn sign(req: SignRequest) -> Self {
        Self {
            sign_request: Some(req),
            ..Self::empty()
        }
    }

    /// Fresh key-list request.
    pub fn list() -> Self {
        Self {
            list_request: Some(ListRequest {}),
            ..Self::empty()
        }
    }

    /// Fresh pinned-hosts request.
    pub fn hosts() -> Self {
        Self {
            hosts_request: Some(HostsRequest {}),
            ..Self::empty()
        }
    }

    /// Fresh liveness poke.
    pub fn noop() -> Self {
        Self {
            noop_request: Some(NoOpRequest {}),
            send_ack: true,
            ..Self::empty()
        }
    }

    /// Fresh pass-through git signing request.
    pub fn git_sign(req: GitSignRequest) -> Self {
        Self {
            git_sign_request: Some(req),
            ..Self::empty()
        }
    }

    /// Fresh host-auth observation.
    pub fn host_auth(host_auth: HostAuth) -> Self {
        Self {
            host_auth_request: Some(host_auth),
            ..Self::empty()
        }
    }

    /// Number of sub-requests set.
    fn body_count(&self) -> usize {
        [
            self.me_request.is_some(),
            self.sign_request.is_some(),
            self.list_request.is_some(),
            self.hosts_request.is_some(),
            self.noop_request.is_some(),
            self.git_sign_request.is_some(),
            self.host_auth_request.is_some(),
        ]
        .iter()
        .filter(|b| **b)
        .count()
    }

    /// Enforce the at-most-one-sub-request invariant.
    pub fn validate(&self) -> Result<()> {
        match self.body_count() {
            0 => Err(Error::bad_message("request has no body")),
            1 => Ok(()),
            n => Err(Error::bad_message(format!(
                "request has {n} bodies, expected exactly one"
            ))),
        }
    }

    /// Wait budget for this request class.
    pub fn timeout(&self) -> Duration {
        if self.sign_request.is_some() || self.git_sign_request.is_some() {
            SIGN_TIMEOUT
        } else {
            SHORT_TIMEOUT
        }
    }

    /// Short body tag for logs.
    pub fn kind(&self) -> &'static str {
        if self.me_request.is_some() {
            "me"
        } else if self.sign_request.is_some() {
            "sign"
        } else if self.list_request.is_some() {
            "list"
        } else if self.hosts_request.is_some() {
            "hosts"
        } else if self.noop_request.is_some() {
            "noop"
        } else if self.git_sign_request.is_some() {
            "git-sign"
        } else if self.host_auth_request.is_some() {
            "host-auth"
        } else {
            "empty"
        }
    }
}

/// Identity answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeResponse {
    /// The phone's profile.
    pub me: Profile,
}

/// Signature answer. `error == "rejected"` means the user denied the
/// request on the phone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignResponse {
    /// Raw signature bytes on success.
    #[serde(default, with = "b64_opt", skip_serializing_if = "Option::is_none")]
    pub signature: Option<Vec<u8>>,
    /// Error string on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SignResponse {
    /// Whether the phone explicitly denied the request.
    pub fn is_rejected(&self) -> bool {
        self.error.as_deref() == Some("rejected")
    }
}

/// Key-list answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListResponse {
    /// Profiles held by the phone.
    #[serde(default)]
    pub profiles: Vec<Profile>,
}

/// One `user@host` record pinned on the phone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAndHost {
    /// Remote user.
    pub user: String,
    /// Remote host.
    pub host: String,
}

/// Pinned-host records reported by the phone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    /// PGP user ids the phone signs as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgp_user_ids: Option<Vec<String>>,
    /// Known `user@host` records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosts: Option<Vec<UserAndHost>>,
}

/// Pinned-hosts answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostsResponse {
    /// Host records on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_info: Option<HostInfo>,
    /// Error string on failure (`host key mismatch` included).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Receipt acknowledgment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {}

/// Pass-through git signing answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSignResponse {
    /// Raw signature bytes on success.
    #[serde(default, with = "b64_opt", skip_serializing_if = "Option::is_none")]
    pub signature: Option<Vec<u8>>,
    /// Error string on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A typed envelope from the phone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    /// Echoed from the request.
    pub request_id: String,
    /// Phone static public key (base64 65-byte uncompressed point).
    /// Present at least on the first response after pairing.
    #[serde(default, with = "b64_opt", skip_serializing_if = "Option::is_none")]
    pub device_public_key: Option<Vec<u8>>,
    /// Opaque push endpoint to register for wake notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_push_endpoint: Option<String>,
    /// Identity answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub me_response: Option<MeResponse>,
    /// Signature answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign_response: Option<SignResponse>,
    /// Key-list answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_response: Option<ListResponse>,
    /// Pinned-hosts answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosts_response: Option<HostsResponse>,
    /// Receipt acknowledgment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_response: Option<AckResponse>,
    /// Pass-through git signing answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_sign_response: Option<GitSignResponse>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_base62() {
        let req = Request::list();
        assert!(!req.request_id.is_empty());
        assert!(req.request_id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_request_validate_exactly_one_body() {
        assert!(Request::noop().validate().is_ok());

        let mut both = Request::list();
        both.me_request = Some(MeRequest::default());
        assert!(both.validate().is_err());

        let mut none = Request::list();
        none.list_request = None;
        assert!(none.validate().is_err());
    }

    #[test]
    fn test_request_timeout_classes() {
        let sign = Request::sign(SignRequest {
            public_key_fingerprint: vec![0; 32],
            data: vec![1, 2, 3],
            command: None,
            hostname: None,
            user: None,
        });
        assert_eq!(sign.timeout(), SIGN_TIMEOUT);
        assert_eq!(Request::me(MeRequest::default()).timeout(), SHORT_TIMEOUT);
        assert_eq!(Request::hosts().timeout(), SHORT_TIMEOUT);
    }

    #[test]
    fn test_notify_prefix_never_serializes() {
        let mut req = Request::noop();
        req.notify_prefix = Some("4242".into());
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("notify_prefix"));
        assert!(!json.contains("4242"));
    }

    #[test]
    fn test_envelope_json_roundtrip() {
        let req = Request::sign(SignRequest {
            public_key_fingerprint: vec![9; 32],
            data: (0u8..32).collect(),
            command: Some("ssh prod-1".into()),
            hostname: Some("prod-1".into()),
            user: Some("ops".into()),
        });
        let json = serde_json::to_string(&req).unwrap();
        let parsed: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.request_id, req.request_id);
        assert_eq!(parsed.sign_request, req.sign_request);
        assert!(parsed.me_request.is_none());
    }

    #[test]
    fn test_sign_request_binary_fields_are_base64() {
        let req = Request::sign(SignRequest {
            public_key_fingerprint: vec![0xff; 4],
            data: vec![0xfe; 4],
            command: None,
            hostname: None,
            user: None,
        });
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["sign_request"]["public_key_fingerprint"], "/////w==");
        assert_eq!(json["sign_request"]["data"], "/v7+/g==");
    }

    #[test]
    fn test_sign_response_rejection() {
        let rejected = SignResponse {
            signature: None,
            error: Some("rejected".into()),
        };
        assert!(rejected.is_rejected());
        let failed = SignResponse {
            signature: None,
            error: Some("no such key".into()),
        };
        assert!(!failed.is_rejected());
    }

    #[test]
    fn test_profile_fingerprint_matches_sha256() {
        let profile = Profile {
            ssh_wire_public_key: b"key bytes".to_vec(),
            email: None,
            pgp_public_key: None,
        };
        assert_eq!(profile.fingerprint(), crate::crypto::sha256(b"key bytes"));
    }

    #[test]
    fn test_response_minimal_json() {
        // A bare ack deserializes from just a request_id and ack body.
        let json = r#"{"request_id":"abc","ack_response":{}}"#;
        let resp: Response = serde_json::from_str(json).unwrap();
        assert_eq!(resp.request_id, "abc");
        assert!(resp.ack_response.is_some());
        assert!(resp.device_public_key.is_none());
    }
}
