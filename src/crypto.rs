//! Symmetric and key-agreement primitives.
//!
//! Everything the pairing and codec layers need: P-256 ECDH between the
//! workstation and phone static keys, ChaCha20-Poly1305 AEAD under the
//! session key, SHA-256 fingerprints, HKDF session-key derivation, and the
//! base62 request-id alphabet.
//!
//! # Sealed frame format
//!
//! ```text
//! [12-byte nonce][ciphertext || 16-byte Poly1305 tag]
//! ```
//!
//! The nonce is random per message; uniqueness within the AEAD bound is all
//! the discipline the session requires.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Session key length (ChaCha20-Poly1305).
pub const KEY_LEN: usize = 32;

/// AEAD nonce length (96 bits).
pub const NONCE_LEN: usize = 12;

/// Poly1305 tag length.
pub const TAG_LEN: usize = 16;

/// Encrypt `plaintext` under `key` with a random nonce.
///
/// Returns `nonce || ciphertext || tag`.
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| Error::BadKey("invalid AEAD key length".into()))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| Error::Internal("AEAD encrypt failed".into()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a sealed frame under `key`.
///
/// Fails with [`Error::BadAuth`] if the tag does not verify and
/// [`Error::BadMessage`] if the frame is too short to contain a nonce and
/// tag.
pub fn open(key: &[u8; KEY_LEN], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(Error::bad_message("sealed frame too short"));
    }
    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| Error::BadKey("invalid AEAD key length".into()))?;

    let nonce = Nonce::from_slice(&sealed[..NONCE_LEN]);
    cipher
        .decrypt(nonce, &sealed[NONCE_LEN..])
        .map_err(|_| Error::BadAuth)
}

/// SHA-256 digest.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

/// Lowercase hex of arbitrary bytes.
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// ECDH between our static private key and the peer's static public key.
///
/// Returns the 32-byte raw shared secret (input keying material only; never
/// used directly as a cipher key).
pub fn ecdh(private: &p256::SecretKey, public: &p256::PublicKey) -> [u8; 32] {
    let shared = p256::ecdh::diffie_hellman(private.to_nonzero_scalar(), public.as_affine());
    let mut out = [0u8; 32];
    out.copy_from_slice(shared.raw_secret_bytes());
    out
}

/// Derive the post-contact session key: HKDF-SHA256 over the ECDH shared
/// secret, salted with the pairing seed.
pub fn derive_session_key(seed: &[u8; 32], shared: &[u8; 32]) -> [u8; KEY_LEN] {
    hkdf_expand(Some(seed), shared, b"kr session v2")
}

/// Derive the pre-contact bootstrap key from the pairing seed alone.
pub fn derive_bootstrap_key(seed: &[u8; 32]) -> [u8; KEY_LEN] {
    hkdf_expand(None, seed, b"kr bootstrap v2")
}

fn hkdf_expand(salt: Option<&[u8; 32]>, ikm: &[u8], info: &[u8]) -> [u8; KEY_LEN] {
    let hk = Hkdf::<Sha256>::new(salt.map(|s| s.as_slice()), ikm);
    let mut okm = [0u8; KEY_LEN];
    hk.expand(info, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

// ============================================================================
// Request identifiers
// ============================================================================

const BASE62_ALPHABET: &[u8; 62] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Base62-encode 16 bytes (big-endian integer interpretation).
pub fn base62_encode(bytes: [u8; 16]) -> String {
    let mut n = u128::from_be_bytes(bytes);
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::with_capacity(22);
    while n > 0 {
        out.push(BASE62_ALPHABET[(n % 62) as usize]);
        n /= 62;
    }
    out.reverse();
    String::from_utf8(out).expect("alphabet is ASCII")
}

/// Fresh request id: 16 random bytes, base62.
pub fn random_request_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    base62_encode(bytes)
}

/// Fresh 32-byte secret (pairing seed).
pub fn random_seed() -> [u8; 32] {
    let mut seed = [0u8; 32];
    rand::rng().fill_bytes(&mut seed);
    seed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = [7u8; KEY_LEN];
        let sealed = seal(&key, b"to the phone").unwrap();
        assert_eq!(open(&key, &sealed).unwrap(), b"to the phone");
    }

    #[test]
    fn test_open_wrong_key_fails() {
        let sealed = seal(&[1u8; KEY_LEN], b"secret").unwrap();
        assert!(matches!(open(&[2u8; KEY_LEN], &sealed), Err(Error::BadAuth)));
    }

    #[test]
    fn test_open_truncated_frame_fails() {
        let err = open(&[0u8; KEY_LEN], &[0u8; NONCE_LEN]).unwrap_err();
        assert!(matches!(err, Error::BadMessage(_)));
    }

    #[test]
    fn test_nonce_is_unique_per_seal() {
        let key = [3u8; KEY_LEN];
        let a = seal(&key, b"x").unwrap();
        let b = seal(&key, b"x").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }

    #[test]
    fn test_sha256_is_stable() {
        assert_eq!(sha256(b"abc"), sha256(b"abc"));
        assert_ne!(sha256(b"abc"), sha256(b"abd"));
    }

    #[test]
    fn test_hex_format() {
        assert_eq!(hex(&[0x00, 0xff, 0x0a]), "00ff0a");
    }

    #[test]
    fn test_ecdh_agrees_both_directions() {
        use p256::elliptic_curve::rand_core::OsRng;
        let a = p256::SecretKey::random(&mut OsRng);
        let b = p256::SecretKey::random(&mut OsRng);
        assert_eq!(
            ecdh(&a, &b.public_key()),
            ecdh(&b, &a.public_key())
        );
    }

    #[test]
    fn test_session_key_depends_on_both_inputs() {
        let seed_a = [1u8; 32];
        let seed_b = [2u8; 32];
        let shared = [9u8; 32];
        assert_ne!(
            derive_session_key(&seed_a, &shared),
            derive_session_key(&seed_b, &shared)
        );
        assert_ne!(
            derive_session_key(&seed_a, &shared),
            derive_bootstrap_key(&seed_a)
        );
    }

    #[test]
    fn test_base62_zero() {
        assert_eq!(base62_encode([0u8; 16]), "0");
    }

    #[test]
    fn test_base62_max_fits_22_chars() {
        let encoded = base62_encode([0xff; 16]);
        assert!(encoded.len() <= 22);
        assert!(encoded.bytes().all(|b| BASE62_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_request_ids_are_distinct() {
        let a = random_request_id();
        let b = random_request_id();
        assert_ne!(a, b);
    }
}
