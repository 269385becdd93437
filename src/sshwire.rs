//! SSH wire-format encoding helpers.
//!
//! The daemon never verifies signatures (the phone does), but it parses and
//! re-frames SSH structures in three places: cached phone public keys,
//! host-auth observations from the KEX interposer, and the signature blobs
//! returned to SSH-agent clients.
//!
//! Wire conventions (RFC 4251): `string` is a u32 big-endian length followed
//! by that many bytes; `mpint` is a `string` holding a big-endian two's
//! complement integer.

use crate::error::{Error, Result};

/// Agent sign flag: client accepts `rsa-sha2-256`.
pub const SSH_AGENT_RSA_SHA2_256: u32 = 0x02;

/// Agent sign flag: client accepts `rsa-sha2-512`.
pub const SSH_AGENT_RSA_SHA2_512: u32 = 0x04;

/// Incremental reader over an SSH wire buffer.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    /// Wrap a buffer.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Read a big-endian u32.
    pub fn read_u32(&mut self) -> Result<u32> {
        if self.buf.len() < 4 {
            return Err(Error::BadKey("truncated u32".into()));
        }
        let (head, rest) = self.buf.split_at(4);
        self.buf = rest;
        Ok(u32::from_be_bytes([head[0], head[1], head[2], head[3]]))
    }

    /// Read one byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        if self.buf.is_empty() {
            return Err(Error::BadKey("truncated byte".into()));
        }
        let b = self.buf[0];
        self.buf = &self.buf[1..];
        Ok(b)
    }

    /// Read a length-prefixed string.
    pub fn read_string(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        if self.buf.len() < len {
            return Err(Error::BadKey(format!(
                "truncated string: want {len}, have {}",
                self.buf.len()
            )));
        }
        let (s, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(s)
    }

    /// Read `n` raw bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(Error::BadKey("truncated bytes".into()));
        }
        let (s, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(s)
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> &'a [u8] {
        self.buf
    }

    /// True when the buffer is fully consumed.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Builder for SSH wire buffers.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    /// Empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a big-endian u32.
    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Append one byte.
    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    /// Append a length-prefixed string.
    pub fn write_string(&mut self, s: &[u8]) -> &mut Self {
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s);
        self
    }

    /// Append raw bytes without a length prefix.
    pub fn write_raw(&mut self, s: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(s);
        self
    }

    /// Finish and take the buffer.
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// A structurally validated SSH public key blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    /// Key format name (`ssh-ed25519`, `ssh-rsa`, `ecdsa-sha2-nistp256`, …).
    pub algo: String,
    /// The full wire blob, exactly as received.
    pub blob: Vec<u8>,
}

impl PublicKey {
    /// SHA-256 fingerprint of the wire blob.
    pub fn fingerprint(&self) -> [u8; 32] {
        crate::crypto::sha256(&self.blob)
    }
}

/// Parse and structurally validate an SSH public-key blob.
///
/// Validation is per format:
/// - `ssh-ed25519`: exactly one 32-byte point that parses as a curve point.
/// - `ssh-rsa`: two nonempty mpints (e, n).
/// - `ecdsa-sha2-*`: curve name plus an uncompressed point.
/// - anything else: the format string must be present and nonempty.
pub fn parse_public_key(blob: &[u8]) -> Result<PublicKey> {
    let mut r = WireReader::new(blob);
    let algo_bytes = r.read_string()?;
    let algo = std::str::from_utf8(algo_bytes)
        .map_err(|_| Error::BadKey("key format is not UTF-8".into()))?
        .to_string();
    if algo.is_empty() {
        return Err(Error::BadKey("empty key format".into()));
    }

    match algo.as_str() {
        "ssh-ed25519" => {
            let point = r.read_string()?;
            let point: [u8; 32] = point
                .try_into()
                .map_err(|_| Error::BadKey("ed25519 point must be 32 bytes".into()))?;
            ed25519_dalek::VerifyingKey::from_bytes(&point)
                .map_err(|_| Error::BadKey("invalid ed25519 point".into()))?;
        }
        "ssh-rsa" => {
            let e = r.read_string()?;
            let n = r.read_string()?;
            if e.is_empty() || n.is_empty() {
                return Err(Error::BadKey("rsa e/n must be nonempty".into()));
            }
        }
        other if other.starts_with("ecdsa-sha2-") => {
            let curve = r.read_string()?;
            let point = r.read_string()?;
            if curve.is_empty() || point.first() != Some(&0x04) {
                return Err(Error::BadKey("ecdsa point must be uncompressed".into()));
            }
        }
        _ => {}
    }

    Ok(PublicKey {
        algo,
        blob: blob.to_vec(),
    })
}

/// A parsed SSH signature blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshSignature {
    /// Signature algorithm name.
    pub algo: String,
    /// Raw signature bytes (the inner string).
    pub raw: Vec<u8>,
}

/// Parse an SSH signature blob (`string algo || string raw`).
///
/// Structural validation only: Ed25519 signatures must be 64 bytes; RSA
/// family signatures must be nonempty. Verification happens on the phone.
pub fn parse_signature(wire: &[u8]) -> Result<SshSignature> {
    let mut r = WireReader::new(wire);
    let algo = std::str::from_utf8(r.read_string()?)
        .map_err(|_| Error::BadKey("signature algo is not UTF-8".into()))?
        .to_string();
    let raw = r.read_string()?.to_vec();

    match algo.as_str() {
        "ssh-ed25519" => {
            if raw.len() != 64 {
                return Err(Error::BadKey(format!(
                    "ed25519 signature must be 64 bytes, got {}",
                    raw.len()
                )));
            }
        }
        "ssh-rsa" | "rsa-sha2-256" | "rsa-sha2-512" => {
            if raw.is_empty() {
                return Err(Error::BadKey("empty rsa signature".into()));
            }
        }
        "" => return Err(Error::BadKey("empty signature algo".into())),
        _ => {}
    }

    Ok(SshSignature { algo, raw })
}

/// Frame a raw signature as an SSH signature blob.
pub fn encode_signature(algo: &str, raw: &[u8]) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.write_string(algo.as_bytes()).write_string(raw);
    w.into_inner()
}

/// Select the signature algorithm for a key format under agent sign flags.
///
/// RSA keys upgrade to `rsa-sha2-512` when the client advertises it, then
/// `rsa-sha2-256`, else legacy `ssh-rsa`. Every other format signs as
/// itself.
pub fn signature_algo(key_algo: &str, flags: u32) -> String {
    if key_algo == "ssh-rsa" {
        if flags & SSH_AGENT_RSA_SHA2_512 != 0 {
            return "rsa-sha2-512".to_string();
        }
        if flags & SSH_AGENT_RSA_SHA2_256 != 0 {
            return "rsa-sha2-256".to_string();
        }
    }
    key_algo.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ed25519_blob() -> Vec<u8> {
        // Deterministic valid key: derive from a fixed signing key.
        let sk = ed25519_dalek::SigningKey::from_bytes(&[11u8; 32]);
        let mut w = WireWriter::new();
        w.write_string(b"ssh-ed25519")
            .write_string(sk.verifying_key().as_bytes());
        w.into_inner()
    }

    #[test]
    fn test_reader_writer_roundtrip() {
        let mut w = WireWriter::new();
        w.write_u32(42).write_string(b"hello").write_u8(7);
        let buf = w.into_inner();

        let mut r = WireReader::new(&buf);
        assert_eq!(r.read_u32().unwrap(), 42);
        assert_eq!(r.read_string().unwrap(), b"hello");
        assert_eq!(r.read_u8().unwrap(), 7);
        assert!(r.is_empty());
    }

    #[test]
    fn test_reader_rejects_truncated_string() {
        let mut w = WireWriter::new();
        w.write_u32(100); // claims 100 bytes, provides none
        let buf = w.into_inner();
        let mut r = WireReader::new(&buf);
        assert!(r.read_string().is_err());
    }

    #[test]
    fn test_parse_ed25519_public_key() {
        let blob = ed25519_blob();
        let pk = parse_public_key(&blob).unwrap();
        assert_eq!(pk.algo, "ssh-ed25519");
        assert_eq!(pk.blob, blob);
    }

    #[test]
    fn test_parse_public_key_rejects_bad_point_length() {
        let mut w = WireWriter::new();
        w.write_string(b"ssh-ed25519").write_string(&[1u8; 31]);
        assert!(parse_public_key(&w.into_inner()).is_err());
    }

    #[test]
    fn test_parse_rsa_public_key() {
        let mut w = WireWriter::new();
        w.write_string(b"ssh-rsa")
            .write_string(&[0x01, 0x00, 0x01])
            .write_string(&[0xde; 256]);
        assert_eq!(parse_public_key(&w.into_inner()).unwrap().algo, "ssh-rsa");
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let pk = parse_public_key(&ed25519_blob()).unwrap();
        assert_eq!(pk.fingerprint(), pk.fingerprint());
        assert_eq!(pk.fingerprint(), crate::crypto::sha256(&pk.blob));
    }

    #[test]
    fn test_signature_roundtrip() {
        let wire = encode_signature("ssh-ed25519", &[5u8; 64]);
        let sig = parse_signature(&wire).unwrap();
        assert_eq!(sig.algo, "ssh-ed25519");
        assert_eq!(sig.raw, vec![5u8; 64]);
    }

    #[test]
    fn test_signature_rejects_short_ed25519() {
        let wire = encode_signature("ssh-ed25519", &[5u8; 63]);
        assert!(parse_signature(&wire).is_err());
    }

    #[test]
    fn test_signature_algo_rsa_upgrade() {
        assert_eq!(
            signature_algo("ssh-rsa", SSH_AGENT_RSA_SHA2_512),
            "rsa-sha2-512"
        );
        assert_eq!(
            signature_algo("ssh-rsa", SSH_AGENT_RSA_SHA2_256),
            "rsa-sha2-256"
        );
        assert_eq!(
            signature_algo("ssh-rsa", SSH_AGENT_RSA_SHA2_256 | SSH_AGENT_RSA_SHA2_512),
            "rsa-sha2-512"
        );
        assert_eq!(signature_algo("ssh-rsa", 0), "ssh-rsa");
        assert_eq!(signature_algo("ssh-ed25519", 0xff), "ssh-ed25519");
    }
}
