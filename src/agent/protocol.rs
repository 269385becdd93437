//! SSH-agent wire protocol codec.
//!
//! Frames are `[u32 BE length][u8 type][payload]`. Only the operations the
//! daemon serves are modeled; everything else decodes to `Unknown` and is
//! answered with a failure.
//!
//! Message types (draft-miller-ssh-agent):
//! - `11` REQUEST_IDENTITIES → `12` IDENTITIES_ANSWER
//! - `13` SIGN_REQUEST → `14` SIGN_RESPONSE
//! - `17`/`25` ADD_IDENTITY, `18` REMOVE_IDENTITY, `19` REMOVE_ALL,
//!   `22` LOCK, `23` UNLOCK → `6` SUCCESS
//! - anything else → `5` FAILURE

use crate::error::{Error, Result};
use crate::sshwire::{WireReader, WireWriter};

/// Maximum accepted agent frame (matches OpenSSH's generous bound).
pub const MAX_AGENT_FRAME: u32 = 1024 * 1024;

const SSH_AGENT_FAILURE: u8 = 5;
const SSH_AGENT_SUCCESS: u8 = 6;
const SSH_AGENTC_REQUEST_IDENTITIES: u8 = 11;
const SSH_AGENT_IDENTITIES_ANSWER: u8 = 12;
const SSH_AGENTC_SIGN_REQUEST: u8 = 13;
const SSH_AGENT_SIGN_RESPONSE: u8 = 14;
const SSH_AGENTC_ADD_IDENTITY: u8 = 17;
const SSH_AGENTC_REMOVE_IDENTITY: u8 = 18;
const SSH_AGENTC_REMOVE_ALL_IDENTITIES: u8 = 19;
const SSH_AGENTC_ADD_ID_CONSTRAINED: u8 = 25;
const SSH_AGENTC_LOCK: u8 = 22;
const SSH_AGENTC_UNLOCK: u8 = 23;

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentRequest {
    /// List identities.
    RequestIdentities,
    /// Sign `data` with the key identified by `key_blob`.
    Sign {
        /// SSH-wire public key blob selecting the key.
        key_blob: Vec<u8>,
        /// Data to sign.
        data: Vec<u8>,
        /// Sign flags (RSA hash-family selection).
        flags: u32,
    },
    /// Key/state mutation we accept and ignore (add/remove/lock/unlock).
    NoOpMutation(u8),
    /// Anything we do not serve.
    Unknown(u8),
}

/// A response frame to send back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentResponse {
    /// One identity per entry: `(key_blob, comment)`.
    Identities(Vec<(Vec<u8>, String)>),
    /// A completed signature (SSH signature blob).
    Signature(Vec<u8>),
    /// Generic success.
    Success,
    /// Generic failure.
    Failure,
}

/// Decode one agent frame payload (`type || body`).
pub fn decode_request(frame: &[u8]) -> Result<AgentRequest> {
    let mut r = WireReader::new(frame);
    let msg_type = r.read_u8()?;
    match msg_type {
        SSH_AGENTC_REQUEST_IDENTITIES => Ok(AgentRequest::RequestIdentities),
        SSH_AGENTC_SIGN_REQUEST => {
            let key_blob = r.read_string()?.to_vec();
            let data = r.read_string()?.to_vec();
            let flags = r.read_u32()?;
            Ok(AgentRequest::Sign {
                key_blob,
                data,
                flags,
            })
        }
        SSH_AGENTC_ADD_IDENTITY
        | SSH_AGENTC_ADD_ID_CONSTRAINED
        | SSH_AGENTC_REMOVE_IDENTITY
        | SSH_AGENTC_REMOVE_ALL_IDENTITIES
        | SSH_AGENTC_LOCK
        | SSH_AGENTC_UNLOCK => Ok(AgentRequest::NoOpMutation(msg_type)),
        other => Ok(AgentRequest::Unknown(other)),
    }
}

/// Encode a response as a full frame (length prefix included).
pub fn encode_response(response: &AgentResponse) -> Vec<u8> {
    let mut body = WireWriter::new();
    match response {
        AgentResponse::Identities(keys) => {
            body.write_u8(SSH_AGENT_IDENTITIES_ANSWER);
            body.write_u32(keys.len() as u32);
            for (blob, comment) in keys {
                body.write_string(blob).write_string(comment.as_bytes());
            }
        }
        AgentResponse::Signature(sig_blob) => {
            body.write_u8(SSH_AGENT_SIGN_RESPONSE);
            body.write_string(sig_blob);
        }
        AgentResponse::Success => {
            body.write_u8(SSH_AGENT_SUCCESS);
        }
        AgentResponse::Failure => {
            body.write_u8(SSH_AGENT_FAILURE);
        }
    }
    let body = body.into_inner();

    let mut frame = WireWriter::new();
    frame.write_u32(body.len() as u32).write_raw(&body);
    frame.into_inner()
}

/// Decode a full response frame (tests and the mock client use this).
pub fn decode_response(frame: &[u8]) -> Result<AgentResponse> {
    let mut r = WireReader::new(frame);
    let msg_type = r.read_u8()?;
    match msg_type {
        SSH_AGENT_IDENTITIES_ANSWER => {
            let count = r.read_u32()?;
            let mut keys = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let blob = r.read_string()?.to_vec();
                let comment = String::from_utf8_lossy(r.read_string()?).into_owned();
                keys.push((blob, comment));
            }
            Ok(AgentResponse::Identities(keys))
        }
        SSH_AGENT_SIGN_RESPONSE => Ok(AgentResponse::Signature(r.read_string()?.to_vec())),
        SSH_AGENT_SUCCESS => Ok(AgentResponse::Success),
        SSH_AGENT_FAILURE => Ok(AgentResponse::Failure),
        other => Err(Error::bad_message(format!(
            "unknown agent response type {other}"
        ))),
    }
}

/// Encode a client request as a full frame (tests and the mock client).
pub fn encode_request(request: &AgentRequest) -> Vec<u8> {
    let mut body = WireWriter::new();
    match request {
        AgentRequest::RequestIdentities => {
            body.write_u8(SSH_AGENTC_REQUEST_IDENTITIES);
        }
        AgentRequest::Sign {
            key_blob,
            data,
            flags,
        } => {
            body.write_u8(SSH_AGENTC_SIGN_REQUEST);
            body.write_string(key_blob).write_string(data);
            body.write_u32(*flags);
        }
        AgentRequest::NoOpMutation(t) | AgentRequest::Unknown(t) => {
            body.write_u8(*t);
        }
    }
    let body = body.into_inner();

    let mut frame = WireWriter::new();
    frame.write_u32(body.len() as u32).write_raw(&body);
    frame.into_inner()
}
