//! Typed CLI→daemon client.
//!
//! Thin HTTP/1.1 wrappers over the daemon's control socket. Every request
//! runs under a bounded timeout; when the first connect fails the client
//! drives one supervisor restart cycle before giving up.

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::Method;
use hyper_util::rt::TokioIo;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UnixStream;

use crate::constants::{CONTROL_CLIENT_TIMEOUT, RESTART_SETTLE};
use crate::error::{Error, Result};
use crate::persistence::KrDir;
use crate::protocol::{HostsResponse, Profile, Request, Response, SignRequest};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client over the daemon control socket.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket_path: PathBuf,
    try_restart: bool,
}

impl DaemonClient {
    /// Client for the daemon owning the given state directory.
    pub fn new(dir: &KrDir) -> Self {
        Self {
            socket_path: dir.control_socket_path(),
            try_restart: true,
        }
    }

    /// Client that never attempts a supervisor restart (tests).
    pub fn without_restart(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            try_restart: false,
        }
    }

    // ========================================================================
    // Typed wrappers
    // ========================================================================

    /// `PUT /pair`: generate a fresh pairing, returns the QR payload.
    pub async fn pair(&self, workstation_name: Option<String>) -> Result<serde_json::Value> {
        let body = serde_json::to_vec(&serde_json::json!({
            "workstation_name": workstation_name,
        }))?;
        let bytes = self.request(Method::PUT, "/pair", Some(body)).await?;
        serde_json::from_slice(&bytes).map_err(Error::from)
    }

    /// `DELETE /pair`.
    pub async fn unpair(&self) -> Result<()> {
        self.request(Method::DELETE, "/pair", None).await?;
        Ok(())
    }

    /// `GET /pair` without a body: cached identity (fetches when cold).
    pub async fn request_me(&self) -> Result<Profile> {
        let bytes = self.request(Method::GET, "/pair", None).await?;
        serde_json::from_slice(&bytes).map_err(Error::from)
    }

    /// `GET /pair` with a `MeRequest` body: force a phone refresh.
    pub async fn request_me_force_refresh(&self, user_id: Option<String>) -> Result<Profile> {
        let body = serde_json::to_vec(&serde_json::json!({ "user_id": user_id }))?;
        let bytes = self.request(Method::GET, "/pair", Some(body)).await?;
        serde_json::from_slice(&bytes).map_err(Error::from)
    }

    /// `GET /hosts`.
    pub async fn request_hosts(&self) -> Result<HostsResponse> {
        let bytes = self.request(Method::GET, "/hosts", None).await?;
        serde_json::from_slice(&bytes).map_err(Error::from)
    }

    /// Ad-hoc signature over the control plane.
    pub async fn sign(&self, fingerprint: Vec<u8>, data: Vec<u8>) -> Result<Vec<u8>> {
        let request = Request::sign(SignRequest {
            public_key_fingerprint: fingerprint,
            data,
            command: None,
            hostname: None,
            user: None,
        });
        let response = self.post_enclave(&request).await?;
        let sign = response
            .sign_response
            .ok_or_else(|| Error::bad_message("response missing sign body"))?;
        if sign.is_rejected() {
            return Err(Error::Rejected("phone denied the request".into()));
        }
        if let Some(error) = sign.error {
            return Err(Error::Rejected(error));
        }
        sign.signature
            .ok_or_else(|| Error::bad_message("sign response carries no signature"))
    }

    /// Liveness poke through the daemon and out to the phone.
    pub async fn request_noop(&self) -> Result<()> {
        self.post_enclave(&Request::noop()).await?;
        Ok(())
    }

    /// `GET /version`.
    pub async fn request_krd_version(&self) -> Result<String> {
        let bytes = self.request(Method::GET, "/version", None).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// `POST /enclave` with a pre-built envelope.
    pub async fn post_enclave(&self, request: &Request) -> Result<Response> {
        let body = serde_json::to_vec(request)?;
        let bytes = self.request(Method::POST, "/enclave", Some(body)).await?;
        serde_json::from_slice(&bytes).map_err(Error::from)
    }

    // ========================================================================
    // HTTP plumbing
    // ========================================================================

    async fn connect(&self) -> Result<UnixStream> {
        let attempt = tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(&self.socket_path))
            .await
            .map_err(|_| Error::Transport("daemon connect timed out".into()))?;
        match attempt {
            Ok(stream) => Ok(stream),
            Err(first_err) if self.try_restart => {
                log::warn!("[client] daemon unreachable ({first_err}); attempting restart");
                crate::daemon::restart_daemon();
                tokio::time::sleep(RESTART_SETTLE).await;
                tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(&self.socket_path))
                    .await
                    .map_err(|_| Error::Transport("daemon connect timed out".into()))?
                    .map_err(|e| {
                        Error::Transport(format!("daemon unreachable after restart: {e}"))
                    })
            }
            Err(e) => Err(Error::Transport(format!("daemon unreachable: {e}"))),
        }
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        let stream = self.connect().await?;
        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(Error::transport)?;
        tokio::spawn(async move {
            let _ = connection.await;
        });

        let mut builder = hyper::Request::builder()
            .method(method)
            .uri(path)
            .header(hyper::header::HOST, "krd");
        if body.is_some() {
            builder = builder.header(hyper::header::CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| Error::Internal(e.to_string()))?;

        let response = tokio::time::timeout(CONTROL_CLIENT_TIMEOUT, sender.send_request(request))
            .await
            .map_err(|_| Error::Transport("daemon request timed out".into()))?
            .map_err(Error::transport)?;

        let status = response.status().as_u16();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(Error::transport)?
            .to_bytes()
            .to_vec();

        match status {
            200..=299 => Ok(bytes),
            404 => Err(Error::NotPaired),
            408 => Err(Error::Timeout),
            502 => Err(Error::Transport(String::from_utf8_lossy(&bytes).into_owned())),
            other => Err(Error::Internal(format!(
                "daemon returned HTTP {other}: {}",
                String::from_utf8_lossy(&bytes)
            ))),
        }
    }
}
