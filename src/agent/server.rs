//! Agent socket server: accept loop and per-connection workers.
//!
//! Each accepted connection gets its own tokio task; workers share nothing
//! but the enclave client handle. A worker that outlives its client tears
//! down on the next read error.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;

use crate::agent::protocol::{
    decode_request, encode_response, AgentRequest, AgentResponse, MAX_AGENT_FRAME,
};
use crate::enclave::EnclaveClient;
use crate::error::Error;
use crate::identity::{ProxiedSigner, SignContext, Signer};
use crate::notify::NotificationBus;
use crate::sshwire;

/// SSH-agent protocol server over a pre-opened Unix listener.
#[derive(Debug)]
pub struct AgentServer {
    accept_handle: JoinHandle<()>,
}

impl AgentServer {
    /// Spawn the accept loop.
    pub fn start(
        listener: UnixListener,
        enclave: Arc<EnclaveClient>,
        bus: NotificationBus,
    ) -> Self {
        let accept_handle = tokio::spawn(Self::accept_loop(listener, enclave, bus));
        Self { accept_handle }
    }

    async fn accept_loop(
        listener: UnixListener,
        enclave: Arc<EnclaveClient>,
        bus: NotificationBus,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let enclave = Arc::clone(&enclave);
                    let bus = bus.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, enclave, bus).await {
                            log::debug!("[agent] connection ended: {e}");
                        }
                    });
                }
                Err(e) => {
                    log::error!("[agent] accept error: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Stop accepting connections.
    pub fn shutdown(self) {
        self.accept_handle.abort();
    }
}

/// Serve one agent client until it hangs up.
async fn serve_connection(
    mut stream: UnixStream,
    enclave: Arc<EnclaveClient>,
    bus: NotificationBus,
) -> std::io::Result<()> {
    let context = peer_context(&stream);

    loop {
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }
        let length = u32::from_be_bytes(len_buf);
        if length == 0 || length > MAX_AGENT_FRAME {
            log::warn!("[agent] dropping client with bad frame length {length}");
            return Ok(());
        }

        let mut frame = vec![0u8; length as usize];
        stream.read_exact(&mut frame).await?;

        let response = match decode_request(&frame) {
            Ok(request) => handle_request(request, &enclave, &bus, &context).await,
            Err(e) => {
                log::debug!("[agent] malformed request: {e}");
                AgentResponse::Failure
            }
        };
        stream.write_all(&encode_response(&response)).await?;
    }
}

/// Map one agent operation onto the enclave client.
async fn handle_request(
    request: AgentRequest,
    enclave: &Arc<EnclaveClient>,
    bus: &NotificationBus,
    context: &SignContext,
) -> AgentResponse {
    match request {
        AgentRequest::RequestIdentities => match ProxiedSigner::from_cache(enclave).await {
            Some(signer) => {
                let comment = signer
                    .profile()
                    .email
                    .clone()
                    .unwrap_or_else(|| "krypton".to_string());
                AgentResponse::Identities(vec![(signer.public_key_blob().to_vec(), comment)])
            }
            None => {
                bus.info("not paired with a phone; run `kr pair`");
                AgentResponse::Identities(Vec::new())
            }
        },

        AgentRequest::Sign {
            key_blob,
            data,
            flags,
        } => {
            let Some(signer) = ProxiedSigner::from_cache(enclave).await else {
                bus.info("sign requested while not paired; run `kr pair`");
                return AgentResponse::Failure;
            };
            if signer.public_key_blob() != key_blob.as_slice() {
                log::warn!("[agent] sign request for a key we do not hold");
                return AgentResponse::Failure;
            }

            match signer.sign(&data, flags, context.clone()).await {
                Ok(signature) => AgentResponse::Signature(sshwire::encode_signature(
                    &signature.algo,
                    &signature.raw,
                )),
                Err(e) => {
                    log::warn!("[agent] sign failed: {e}");
                    match e {
                        // Rejection and timeout notifications are emitted by
                        // the engine with the request's own prefix.
                        Error::Rejected(_) | Error::Timeout => {}
                        other => bus.notify(
                            context.notify_prefix.as_deref(),
                            &format!("sign failed: {other}"),
                        ),
                    }
                    AgentResponse::Failure
                }
            }
        }

        AgentRequest::NoOpMutation(t) => {
            log::debug!("[agent] accepting and ignoring mutation 0x{t:02x}");
            AgentResponse::Success
        }

        AgentRequest::Unknown(t) => {
            log::debug!("[agent] unknown request type 0x{t:02x}");
            AgentResponse::Failure
        }
    }
}

/// Harvest display context from the connecting process, best-effort.
///
/// On Linux the peer PID comes from `SO_PEERCRED`; the ssh command line and
/// the wrapper's `KR_NOTIFY_PREFIX` come from `/proc`. Anywhere this fails
/// the sign request simply carries less context.
fn peer_context(stream: &UnixStream) -> SignContext {
    #[cfg(target_os = "linux")]
    {
        if let Ok(cred) = stream.peer_cred() {
            if let Some(pid) = cred.pid() {
                return context_from_pid(pid);
            }
        }
    }
    let _ = stream;
    SignContext::default()
}

#[cfg(target_os = "linux")]
fn context_from_pid(pid: i32) -> SignContext {
    let mut context = SignContext::default();

    if let Ok(raw) = std::fs::read(format!("/proc/{pid}/cmdline")) {
        let args: Vec<String> = raw
            .split(|b| *b == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect();
        if !args.is_empty() {
            context.command = Some(args.join(" "));
            if let Some((user, host)) = parse_ssh_destination(&args) {
                context.user = user;
                context.hostname = Some(host);
            }
        }
    }

    if let Ok(raw) = std::fs::read(format!("/proc/{pid}/environ")) {
        for entry in raw.split(|b| *b == 0) {
            if let Some(value) = entry.strip_prefix(b"KR_NOTIFY_PREFIX=") {
                let value = String::from_utf8_lossy(value).into_owned();
                if !value.is_empty() {
                    context.notify_prefix = Some(value);
                }
                break;
            }
        }
    }

    context
}

/// Extract `[user@]host` from an ssh-like argument vector.
///
/// Skips option flags and their obvious arguments; the first remaining
/// operand is the destination.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_ssh_destination(args: &[String]) -> Option<(Option<String>, String)> {
    if !args
        .first()
        .map(|a| a.rsplit('/').next().unwrap_or(a) == "ssh")
        .unwrap_or(false)
    {
        return None;
    }

    // Flags that consume a following argument (OpenSSH option set).
    const TAKES_ARG: &[&str] = &[
        "-b", "-c", "-D", "-E", "-e", "-F", "-I", "-i", "-J", "-L", "-l", "-m", "-O", "-o", "-p",
        "-Q", "-R", "-S", "-W", "-w",
    ];

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        if TAKES_ARG.contains(&arg.as_str()) {
            let _ = iter.next();
            continue;
        }
        if arg.starts_with('-') {
            continue;
        }
        return match arg.split_once('@') {
            Some((user, host)) => Some((Some(user.to_string()), host.to_string())),
            None => Some((None, arg.clone())),
        };
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_plain_destination() {
        assert_eq!(
            parse_ssh_destination(&args(&["ssh", "example.com"])),
            Some((None, "example.com".to_string()))
        );
    }

    #[test]
    fn test_parse_user_at_host() {
        assert_eq!(
            parse_ssh_destination(&args(&["/usr/bin/ssh", "ops@prod-1"])),
            Some((Some("ops".to_string()), "prod-1".to_string()))
        );
    }

    #[test]
    fn test_parse_skips_flag_arguments() {
        assert_eq!(
            parse_ssh_destination(&args(&["ssh", "-p", "2222", "-v", "ops@prod-1", "uptime"])),
            Some((Some("ops".to_string()), "prod-1".to_string()))
        );
    }

    #[test]
    fn test_parse_non_ssh_command() {
        assert_eq!(parse_ssh_destination(&args(&["scp", "f", "h:"])), None);
        assert_eq!(parse_ssh_destination(&[]), None);
    }
}
