//! Idempotent `~/.ssh/config` management.
//!
//! Routes SSH authentication through the daemon by injecting one canonical
//! block. OpenSSH ≥ 7.3 understands `IdentityAgent`; older installations
//! fall back to a PKCS#11 provider directive.
//!
//! Rules:
//! - never double-append: if the canonical block is present the file is
//!   untouched (running the edit twice yields the same bytes as once);
//! - refuse to edit when foreign Krypton-related lines are present, unless
//!   forced;
//! - back up the original file on first edit;
//! - only CLI foreground commands call this; the daemon never does.

use anyhow::{Context, Result};
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

const BLOCK_BEGIN: &str = "# Added by Krypton";
const BLOCK_END: &str = "# End Krypton block";

/// OpenSSH version that introduced `IdentityAgent`.
const IDENTITY_AGENT_MIN: semver::Version = semver::Version::new(7, 3, 0);

/// What an edit did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    /// The canonical block was appended.
    Added,
    /// The canonical block was already present; file untouched.
    AlreadyPresent,
}

/// Manager for one SSH config file.
#[derive(Debug, Clone)]
pub struct SshConfig {
    config_path: PathBuf,
    agent_socket: PathBuf,
    kr_dir: PathBuf,
}

impl SshConfig {
    /// Manager over an explicit config path (tests).
    pub fn new(config_path: PathBuf, agent_socket: PathBuf, kr_dir: PathBuf) -> Self {
        Self {
            config_path,
            agent_socket,
            kr_dir,
        }
    }

    /// Manager over the user's `~/.ssh/config`.
    pub fn for_user(dir: &crate::persistence::KrDir) -> Result<Self> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        Ok(Self::new(
            home.join(".ssh").join("config"),
            dir.agent_socket_path(),
            dir.root().to_path_buf(),
        ))
    }

    /// The canonical block for the given SSH capability.
    fn block(&self, identity_agent: bool) -> String {
        if identity_agent {
            format!(
                "{BLOCK_BEGIN}\n\
                 Host *\n\
                 \tIdentityAgent {}\n\
                 \tProxyCommand krssh %h %p\n\
                 \tIdentityFile ~/.ssh/id_krypton\n\
                 \tIdentityFile ~/.ssh/id_ed25519\n\
                 \tIdentityFile ~/.ssh/id_rsa\n\
                 {BLOCK_END}\n",
                self.agent_socket.display()
            )
        } else {
            format!(
                "{BLOCK_BEGIN}\n\
                 PKCS11Provider {}\n\
                 {BLOCK_END}\n",
                self.kr_dir.join("kr-pkcs11.so").display()
            )
        }
    }

    /// Apply the edit, probing the installed SSH version.
    pub fn edit(&self, force: bool) -> Result<EditOutcome> {
        let identity_agent = installed_ssh_version()
            .map(|v| supports_identity_agent(&v))
            .unwrap_or(true);
        self.edit_with(identity_agent, force)
    }

    /// Apply the edit with an explicit capability decision.
    pub fn edit_with(&self, identity_agent: bool, force: bool) -> Result<EditOutcome> {
        let existing = match fs::read_to_string(&self.config_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e).context("failed to read SSH config"),
        };

        let block = self.block(identity_agent);
        if existing.contains(&block) {
            return Ok(EditOutcome::AlreadyPresent);
        }

        if !force && has_foreign_krypton_lines(&existing) {
            anyhow::bail!(
                "{} already contains Krypton-related lines from another install; \
                 re-run with --force to edit anyway",
                self.config_path.display()
            );
        }

        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.backup_once(&existing)?;

        let mut updated = existing;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        if !updated.is_empty() {
            updated.push('\n');
        }
        updated.push_str(&block);

        fs::write(&self.config_path, &updated).context("failed to write SSH config")?;
        #[cfg(unix)]
        fs::set_permissions(&self.config_path, fs::Permissions::from_mode(0o600))?;
        Ok(EditOutcome::Added)
    }

    /// Remove the canonical block, if present. Returns whether anything
    /// changed.
    pub fn remove(&self) -> Result<bool> {
        let existing = match fs::read_to_string(&self.config_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e).context("failed to read SSH config"),
        };

        let Some(stripped) = strip_block(&existing) else {
            return Ok(false);
        };
        fs::write(&self.config_path, stripped).context("failed to write SSH config")?;
        Ok(true)
    }

    /// Copy the pristine file aside before the first edit.
    fn backup_once(&self, existing: &str) -> Result<()> {
        if existing.is_empty() {
            return Ok(());
        }
        let backup = self.config_path.with_extension("kr.bak");
        if backup.exists() {
            return Ok(());
        }
        fs::write(&backup, existing).context("failed to back up SSH config")?;
        Ok(())
    }

    /// Path of the managed file.
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

/// Krypton-ish lines outside our own canonical block.
fn has_foreign_krypton_lines(content: &str) -> bool {
    let without_ours = strip_block(content).unwrap_or_else(|| content.to_string());
    without_ours.lines().any(|line| {
        let lower = line.to_ascii_lowercase();
        lower.contains("krypton") || lower.contains("krssh") || lower.contains("kr-pkcs11")
    })
}

/// Remove the marker-delimited block. `None` when no block is present.
fn strip_block(content: &str) -> Option<String> {
    let begin = content.find(BLOCK_BEGIN)?;
    let end_marker = content[begin..].find(BLOCK_END)? + begin;
    let end = content[end_marker..]
        .find('\n')
        .map(|i| end_marker + i + 1)
        .unwrap_or(content.len());

    let mut stripped = String::with_capacity(content.len());
    stripped.push_str(&content[..begin]);
    stripped.push_str(&content[end..]);
    // Drop the separating blank line the edit added.
    if stripped.ends_with("\n\n") {
        stripped.pop();
    }
    Some(stripped)
}

/// Version of the installed `ssh` binary, from `ssh -V`.
///
/// OpenSSH prints `OpenSSH_9.6p1 …` on stderr; the patch component is
/// normalized to zero.
pub fn installed_ssh_version() -> Option<semver::Version> {
    let output = std::process::Command::new("ssh").arg("-V").output().ok()?;
    let banner = String::from_utf8_lossy(if output.stderr.is_empty() {
        &output.stdout
    } else {
        &output.stderr
    })
    .into_owned();
    parse_ssh_banner(&banner)
}

fn parse_ssh_banner(banner: &str) -> Option<semver::Version> {
    let rest = banner.split("OpenSSH_").nth(1)?;
    let numeric: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let mut parts = numeric.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    Some(semver::Version::new(major, minor, patch))
}

/// Whether this OpenSSH understands `IdentityAgent`.
pub fn supports_identity_agent(version: &semver::Version) -> bool {
    *version >= IDENTITY_AGENT_MIN
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(tmp: &TempDir) -> SshConfig {
        SshConfig::new(
            tmp.path().join("config"),
            PathBuf::from("/home/u/.kr/krd-agent.sock"),
            PathBuf::from("/home/u/.kr"),
        )
    }

    #[test]
    fn test_edit_is_idempotent_byte_for_byte() {
        let tmp = TempDir::new().unwrap();
        let config = manager(&tmp);

        assert_eq!(config.edit_with(true, false).unwrap(), EditOutcome::Added);
        let once = fs::read(config.path()).unwrap();

        assert_eq!(
            config.edit_with(true, false).unwrap(),
            EditOutcome::AlreadyPresent
        );
        let twice = fs::read(config.path()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_edit_preserves_existing_content() {
        let tmp = TempDir::new().unwrap();
        let config = manager(&tmp);
        fs::write(config.path(), "Host work\n\tPort 2222\n").unwrap();

        config.edit_with(true, false).unwrap();
        let content = fs::read_to_string(config.path()).unwrap();
        assert!(content.starts_with("Host work\n\tPort 2222\n"));
        assert!(content.contains("IdentityAgent /home/u/.kr/krd-agent.sock"));
        assert!(content.contains("ProxyCommand krssh %h %p"));
    }

    #[test]
    fn test_edit_backs_up_original_once() {
        let tmp = TempDir::new().unwrap();
        let config = manager(&tmp);
        fs::write(config.path(), "Host a\n").unwrap();

        config.edit_with(true, false).unwrap();
        let backup = config.path().with_extension("kr.bak");
        assert_eq!(fs::read_to_string(&backup).unwrap(), "Host a\n");

        // A later edit (after removal) must not clobber the backup.
        config.remove().unwrap();
        fs::write(config.path(), "Host b\n").unwrap();
        config.edit_with(true, false).unwrap();
        assert_eq!(fs::read_to_string(&backup).unwrap(), "Host a\n");
    }

    #[test]
    fn test_edit_refuses_foreign_krypton_lines() {
        let tmp = TempDir::new().unwrap();
        let config = manager(&tmp);
        fs::write(
            config.path(),
            "Host *\n\tProxyCommand /opt/old/krssh %h %p\n",
        )
        .unwrap();

        assert!(config.edit_with(true, false).is_err());
        // Forced edit proceeds.
        assert_eq!(config.edit_with(true, true).unwrap(), EditOutcome::Added);
    }

    #[test]
    fn test_fallback_block_uses_pkcs11() {
        let tmp = TempDir::new().unwrap();
        let config = manager(&tmp);
        config.edit_with(false, false).unwrap();

        let content = fs::read_to_string(config.path()).unwrap();
        assert!(content.contains("PKCS11Provider /home/u/.kr/kr-pkcs11.so"));
        assert!(!content.contains("IdentityAgent"));
    }

    #[test]
    fn test_remove_restores_original_bytes() {
        let tmp = TempDir::new().unwrap();
        let config = manager(&tmp);
        let original = "Host work\n\tPort 2222\n";
        fs::write(config.path(), original).unwrap();

        config.edit_with(true, false).unwrap();
        assert!(config.remove().unwrap());
        assert_eq!(fs::read_to_string(config.path()).unwrap(), original);
        // Nothing left to remove.
        assert!(!config.remove().unwrap());
    }

    #[test]
    fn test_parse_ssh_banner_variants() {
        assert_eq!(
            parse_ssh_banner("OpenSSH_9.6p1 Ubuntu-3ubuntu13, OpenSSL 3.0.13"),
            Some(semver::Version::new(9, 6, 0))
        );
        assert_eq!(
            parse_ssh_banner("OpenSSH_7.2p2"),
            Some(semver::Version::new(7, 2, 0))
        );
        assert_eq!(parse_ssh_banner("Dropbear v2022.83"), None);
    }

    #[test]
    fn test_identity_agent_threshold() {
        assert!(supports_identity_agent(&semver::Version::new(7, 3, 0)));
        assert!(supports_identity_agent(&semver::Version::new(9, 0, 0)));
        assert!(!supports_identity_agent(&semver::Version::new(7, 2, 0)));
    }
}
