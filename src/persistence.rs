//! Per-user state directory.
//!
//! # File layout
//!
//! ```text
//! ~/.kr/                      (override with KR_HOME)
//!   pairing.json              serialized PairingSecret, 0600
//!   me.json                   serialized Profile, 0600
//!   krd.sock                  control socket (HTTP/1.1)
//!   krd-agent.sock            SSH-agent socket
//!   krd-hostauth.sock         host-auth sidecar socket
//!   krd.pid                   daemon PID file
//!   <prefix>.notify           notification bus streams
//! ```
//!
//! Writes are atomic: serialize to a temp file in the same directory, set
//! 0600, rename over the target.

use anyhow::{Context, Result};
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::pairing::{PairingSecret, StoredPairing};
use crate::protocol::Profile;

/// Handle to the `~/.kr` state directory.
#[derive(Debug, Clone)]
pub struct KrDir {
    root: PathBuf,
}

impl KrDir {
    /// Open (creating if needed) the default state directory.
    ///
    /// `KR_HOME` overrides the location; otherwise `~/.kr`.
    pub fn open() -> Result<Self> {
        let root = match crate::env::home_override() {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .context("could not determine home directory")?
                .join(".kr"),
        };
        Self::open_at(root)
    }

    /// Open (creating if needed) a specific directory. Used by tests.
    pub fn open_at(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create state dir {}", root.display()))?;
        #[cfg(unix)]
        fs::set_permissions(&root, fs::Permissions::from_mode(0o700))
            .context("failed to restrict state dir permissions")?;
        Ok(Self { root })
    }

    /// The directory itself (notification bus root).
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `pairing.json` path.
    pub fn pairing_path(&self) -> PathBuf {
        self.root.join("pairing.json")
    }

    /// `me.json` path.
    pub fn me_path(&self) -> PathBuf {
        self.root.join("me.json")
    }

    /// Control socket path (HTTP/1.1 for the CLI).
    pub fn control_socket_path(&self) -> PathBuf {
        self.root.join("krd.sock")
    }

    /// SSH-agent socket path.
    pub fn agent_socket_path(&self) -> PathBuf {
        self.root.join("krd-agent.sock")
    }

    /// Host-auth sidecar socket path.
    pub fn hostauth_socket_path(&self) -> PathBuf {
        self.root.join("krd-hostauth.sock")
    }

    /// Daemon PID file path.
    pub fn pid_path(&self) -> PathBuf {
        self.root.join("krd.pid")
    }

    // ========================================================================
    // Pairing
    // ========================================================================

    /// Persist the pairing atomically with 0600 permissions.
    pub fn save_pairing(&self, pairing: &PairingSecret) -> Result<()> {
        let json = serde_json::to_vec_pretty(&pairing.to_stored())
            .context("failed to serialize pairing")?;
        self.atomic_write(&self.pairing_path(), &json)
    }

    /// Load the persisted pairing, if any.
    pub fn load_pairing(&self) -> Result<Option<PairingSecret>> {
        let path = self.pairing_path();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).context("failed to read pairing.json")?;
        let stored: StoredPairing =
            serde_json::from_str(&content).context("failed to parse pairing.json")?;
        let pairing = PairingSecret::from_stored(&stored)
            .map_err(|e| anyhow::anyhow!("invalid stored pairing: {e}"))?;
        Ok(Some(pairing))
    }

    /// Remove the persisted pairing.
    pub fn delete_pairing(&self) -> Result<()> {
        remove_if_exists(&self.pairing_path())
    }

    // ========================================================================
    // Cached identity
    // ========================================================================

    /// Persist the cached phone profile atomically with 0600 permissions.
    pub fn save_me(&self, profile: &Profile) -> Result<()> {
        let json = serde_json::to_vec_pretty(profile).context("failed to serialize profile")?;
        self.atomic_write(&self.me_path(), &json)
    }

    /// Load the cached profile.
    ///
    /// Absent when the file is missing, unparsable, or the stored profile
    /// lacks a public key.
    pub fn load_me(&self) -> Option<Profile> {
        let content = fs::read_to_string(self.me_path()).ok()?;
        let profile: Profile = serde_json::from_str(&content).ok()?;
        profile.has_public_key().then_some(profile)
    }

    /// Remove the cached profile.
    pub fn delete_me(&self) -> Result<()> {
        remove_if_exists(&self.me_path())
    }

    fn atomic_write(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        use std::io::Write;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)
            .context("failed to create temp file for atomic write")?;
        tmp.write_all(bytes).context("failed to write temp file")?;
        #[cfg(unix)]
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))
            .context("failed to set 0600 on temp file")?;
        tmp.persist(path)
            .with_context(|| format!("failed to rename into {}", path.display()))?;
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_dir() -> (TempDir, KrDir) {
        let tmp = TempDir::new().unwrap();
        let dir = KrDir::open_at(tmp.path().join("kr")).unwrap();
        (tmp, dir)
    }

    #[test]
    fn test_pairing_save_load_roundtrip() {
        let (_tmp, dir) = test_dir();
        let pairing = PairingSecret::generate(Some("test-ws".into()));
        dir.save_pairing(&pairing).unwrap();

        let loaded = dir.load_pairing().unwrap().expect("pairing present");
        assert_eq!(loaded.queue_name(), pairing.queue_name());
        assert_eq!(loaded.workstation_name, "test-ws");
    }

    #[test]
    fn test_pairing_file_has_0600() {
        let (_tmp, dir) = test_dir();
        dir.save_pairing(&PairingSecret::generate(None)).unwrap();

        #[cfg(unix)]
        {
            let mode = fs::metadata(dir.pairing_path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_load_pairing_absent() {
        let (_tmp, dir) = test_dir();
        assert!(dir.load_pairing().unwrap().is_none());
    }

    #[test]
    fn test_delete_pairing_is_idempotent() {
        let (_tmp, dir) = test_dir();
        dir.save_pairing(&PairingSecret::generate(None)).unwrap();
        dir.delete_pairing().unwrap();
        dir.delete_pairing().unwrap();
        assert!(!dir.pairing_path().exists());
    }

    #[test]
    fn test_me_roundtrip_and_keyless_profile_is_absent() {
        let (_tmp, dir) = test_dir();
        assert!(dir.load_me().is_none());

        let profile = Profile {
            ssh_wire_public_key: b"wire key".to_vec(),
            email: Some("alice@example.com".into()),
            pgp_public_key: None,
        };
        dir.save_me(&profile).unwrap();
        assert_eq!(dir.load_me().unwrap(), profile);

        // A stored profile without a public key reads back as absent.
        let empty = Profile {
            ssh_wire_public_key: Vec::new(),
            email: None,
            pgp_public_key: None,
        };
        dir.save_me(&empty).unwrap();
        assert!(dir.load_me().is_none());
    }

    #[test]
    fn test_socket_paths_live_under_root() {
        let (_tmp, dir) = test_dir();
        for path in [
            dir.control_socket_path(),
            dir.agent_socket_path(),
            dir.hostauth_socket_path(),
        ] {
            assert!(path.starts_with(dir.root()));
            assert!(path.extension().is_some_and(|e| e == "sock"));
        }
    }
}
