//! Daemon lifecycle: pre-opened listeners, PID file, supervisor glue.
//!
//! The service supervisor (systemd unit, launchd plist) keeps `krd` alive
//! and may pass pre-opened listening sockets using the `LISTEN_FDS`
//! convention, one per named role (`control`, `agent`, `host-auth`). When
//! no socket was passed for a role the daemon binds the corresponding path
//! under `~/.kr` itself (stale-socket removal, 0600, path-length check).

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::os::fd::RawFd;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::FromRawFd;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::UnixListener;

use crate::enclave::{EnclaveClient, TransportFactory};
use crate::notify::NotificationBus;
use crate::persistence::KrDir;
use crate::transport::queue::QueueTransport;
use crate::transport::{Transport, TransportSet};

/// First file descriptor passed by a `LISTEN_FDS` supervisor.
const SD_LISTEN_FDS_START: RawFd = 3;

/// sun_path is 104 bytes on macOS, 108 on Linux; use the conservative bound.
const MAX_SOCKET_PATH: usize = 104;

/// The three sockets the daemon serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketRole {
    /// HTTP/1.1 control plane for the CLI.
    Control,
    /// SSH-agent protocol.
    Agent,
    /// Host-auth sidecar.
    HostAuth,
}

impl SocketRole {
    /// Role name used in `LISTEN_FDNAMES`.
    pub fn name(self) -> &'static str {
        match self {
            SocketRole::Control => "control",
            SocketRole::Agent => "agent",
            SocketRole::HostAuth => "host-auth",
        }
    }

    /// Position when the supervisor passes unnamed fds.
    fn index(self) -> usize {
        match self {
            SocketRole::Control => 0,
            SocketRole::Agent => 1,
            SocketRole::HostAuth => 2,
        }
    }

    /// Fallback bind path under the state directory.
    pub fn path(self, dir: &KrDir) -> PathBuf {
        match self {
            SocketRole::Control => dir.control_socket_path(),
            SocketRole::Agent => dir.agent_socket_path(),
            SocketRole::HostAuth => dir.hostauth_socket_path(),
        }
    }
}

/// Acquire the listener for a role: adopt the supervisor's fd when one was
/// passed, otherwise bind the role's path.
pub fn acquire_listener(role: SocketRole, dir: &KrDir) -> Result<UnixListener> {
    if let Some(fd) = passed_fds().get(role.name()).copied() {
        log::info!("[daemon] adopting supervisor fd {fd} for {} socket", role.name());
        return adopt_fd(fd);
    }
    bind_socket(role.path(dir))
}

/// Map of role name → fd for sockets passed by the supervisor.
///
/// Honors `LISTEN_PID` (must match us), `LISTEN_FDS`, and `LISTEN_FDNAMES`
/// (colon-separated; positional role order when absent).
fn passed_fds() -> HashMap<String, RawFd> {
    let mut fds = HashMap::new();

    let Ok(pid) = std::env::var("LISTEN_PID") else {
        return fds;
    };
    if pid.parse::<u32>().ok() != Some(std::process::id()) {
        return fds;
    }
    let count: usize = std::env::var("LISTEN_FDS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let names: Vec<String> = std::env::var("LISTEN_FDNAMES")
        .map(|v| v.split(':').map(|s| s.to_string()).collect())
        .unwrap_or_default();

    for i in 0..count {
        let fd = SD_LISTEN_FDS_START + i as RawFd;
        let name = names.get(i).cloned().unwrap_or_else(|| {
            [SocketRole::Control, SocketRole::Agent, SocketRole::HostAuth]
                .iter()
                .find(|r| r.index() == i)
                .map(|r| r.name().to_string())
                .unwrap_or_else(|| format!("fd{i}"))
        });
        fds.insert(name, fd);
    }
    fds
}

fn adopt_fd(fd: RawFd) -> Result<UnixListener> {
    // The supervisor opened this fd for us and nothing else owns it.
    let std_listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(fd) };
    std_listener
        .set_nonblocking(true)
        .context("failed to set passed fd nonblocking")?;
    UnixListener::from_std(std_listener).context("failed to adopt passed fd")
}

/// Bind a fresh Unix listener at `path` with owner-only permissions.
pub fn bind_socket(path: PathBuf) -> Result<UnixListener> {
    let path_len = path.as_os_str().len();
    if path_len >= MAX_SOCKET_PATH {
        anyhow::bail!(
            "socket path too long ({path_len} bytes, max {}): {}",
            MAX_SOCKET_PATH - 1,
            path.display()
        );
    }

    if path.exists() {
        fs::remove_file(&path)
            .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let listener = std::os::unix::net::UnixListener::bind(&path)
        .with_context(|| format!("failed to bind {}", path.display()))?;

    #[cfg(unix)]
    fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

    listener.set_nonblocking(true)?;
    let listener = UnixListener::from_std(listener)?;
    log::info!("[daemon] listening on {}", path.display());
    Ok(listener)
}

// ============================================================================
// PID file
// ============================================================================

/// Record our PID for liveness checks and restart tooling.
pub fn write_pid_file(dir: &KrDir) -> Result<()> {
    let path = dir.pid_path();
    fs::write(&path, std::process::id().to_string())
        .with_context(|| format!("failed to write PID file {}", path.display()))?;
    Ok(())
}

/// PID from the daemon's PID file, if present and parseable.
pub fn read_pid_file(dir: &KrDir) -> Option<u32> {
    fs::read_to_string(dir.pid_path())
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Whether a daemon process recorded in the PID file is alive.
pub fn is_daemon_running(dir: &KrDir) -> bool {
    match read_pid_file(dir) {
        // kill(pid, 0) sends nothing but reports existence.
        Some(pid) => unsafe { libc::kill(pid as libc::pid_t, 0) == 0 },
        None => false,
    }
}

/// Remove the PID file and self-bound sockets on shutdown.
pub fn cleanup_on_shutdown(dir: &KrDir) {
    let _ = fs::remove_file(dir.pid_path());
    for role in [SocketRole::Control, SocketRole::Agent, SocketRole::HostAuth] {
        let _ = fs::remove_file(role.path(dir));
    }
    log::info!("[daemon] cleaned up PID file and sockets");
}

/// Ask the service supervisor to restart the daemon. Best-effort; the
/// caller retries its connection either way.
pub fn restart_daemon() {
    #[cfg(target_os = "macos")]
    let result = std::process::Command::new("launchctl")
        .args([
            "kickstart",
            "-k",
            &format!("gui/{}/co.krypt.krd", unsafe { libc::getuid() }),
        ])
        .status();

    #[cfg(not(target_os = "macos"))]
    let result = std::process::Command::new("systemctl")
        .args(["--user", "restart", "krd.service"])
        .status();

    match result {
        Ok(status) if status.success() => log::info!("[daemon] supervisor restart issued"),
        Ok(status) => log::warn!("[daemon] supervisor restart exited with {status}"),
        Err(e) => log::warn!("[daemon] supervisor restart unavailable: {e}"),
    }
}

// ============================================================================
// Daemon wiring
// ============================================================================

/// Production transport factory: the cloud queue for the pairing's derived
/// queue name. A BLE member joins the set when a platform radio backend
/// registers a link.
pub fn default_transport_factory() -> TransportFactory {
    Arc::new(|pairing| {
        let mut members: Vec<Arc<dyn Transport>> = Vec::new();
        match QueueTransport::new(crate::env::queue_url(), pairing.queue_name()) {
            Ok(queue) => members.push(Arc::new(queue)),
            Err(e) => log::error!("[daemon] queue transport unavailable: {e}"),
        }
        TransportSet::new(members)
    })
}

/// Run the daemon until a termination signal.
pub async fn run(dir: KrDir) -> Result<()> {
    write_pid_file(&dir)?;
    let bus = NotificationBus::new(dir.root().to_path_buf());
    let enclave = EnclaveClient::new(dir.clone(), bus.clone(), default_transport_factory());
    if let Err(e) = enclave.restore().await {
        log::warn!("[daemon] could not restore persisted pairing: {e}");
    }

    let control_listener = acquire_listener(SocketRole::Control, &dir)?;
    let agent_listener = acquire_listener(SocketRole::Agent, &dir)?;
    let hostauth_listener = acquire_listener(SocketRole::HostAuth, &dir)?;

    let agent_server =
        crate::agent::AgentServer::start(agent_listener, Arc::clone(&enclave), bus.clone());
    let hostauth_server =
        crate::hostauth::HostAuthServer::start(hostauth_listener, Arc::clone(&enclave));

    let control_enclave = Arc::clone(&enclave);
    let control_handle = tokio::spawn(async move {
        if let Err(e) = crate::control::server::serve(control_listener, control_enclave).await {
            log::error!("[daemon] control server exited: {e}");
        }
    });

    let reaper_bus = bus.clone();
    let reaper_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(crate::constants::NOTIFY_REAP_INTERVAL);
        loop {
            ticker.tick().await;
            let reaped = reaper_bus.reap(crate::constants::NOTIFY_MAX_IDLE);
            if reaped > 0 {
                log::debug!("[daemon] reaped {reaped} stale notify file(s)");
            }
        }
    });

    log::info!("krd {} ready", crate::constants::VERSION);
    wait_for_shutdown().await;
    log::info!("[daemon] shutting down");

    reaper_handle.abort();
    control_handle.abort();
    agent_server.shutdown();
    hostauth_server.shutdown();
    cleanup_on_shutdown(&dir);
    Ok(())
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            log::error!("[daemon] cannot install SIGTERM handler: {e}");
            futures_util::future::pending::<()>().await;
            return;
        }
    };
    let mut hup = signal(SignalKind::hangup()).ok();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
        _ = async {
            match hup.as_mut() {
                Some(h) => { h.recv().await; }
                None => futures_util::future::pending::<()>().await,
            }
        } => {}
    }
}
