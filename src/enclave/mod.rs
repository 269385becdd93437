//! The enclave client: the request/response correlation engine.
//!
//! From the workstation's view the phone is an opaque signing oracle behind
//! an unreliable, at-least-once transport. This module owns everything
//! stateful about talking to it:
//!
//! - the installed [`PairingSecret`] and the cached phone [`Profile`],
//!   guarded by one mutex (all mutation goes through methods here);
//! - a completion-slot map correlating responses to waiting callers;
//! - a bounded seen-LRU deduplicating redelivered responses;
//! - one background listener task per active transport.
//!
//! # Request lifecycle
//!
//! 1. reserve a slot keyed by a fresh request id
//! 2. seal and publish via the preferred transport, wake the phone if a
//!    push endpoint is registered
//! 3. race the slot against the request-class timeout
//! 4. the listener decrypts inbound frames, drops duplicates and unknown
//!    ids, caches newly advertised push endpoints, and fills the slot
//! 5. on timeout the slot is removed; late arrivals are dropped silently
//!
//! Each request sees exactly one of: a response with a matching id, a
//! `Timeout`, or a `Transport` error. Nothing is ordered across distinct
//! in-flight requests.

pub mod slots;

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::constants::{
    LISTEN_BACKOFF_MAX, LISTEN_BACKOFF_MIN, ME_RETRY_DELAY, SEEN_LRU_CAPACITY,
};
use crate::error::{Error, Result};
use crate::notify::{NotificationBus, PAYLOAD_HOST_KEY_MISMATCH, PAYLOAD_REJECTED, PAYLOAD_STOP};
use crate::pairing::PairingSecret;
use crate::persistence::KrDir;
use crate::protocol::{
    codec, GitSignRequest, GitSignResponse, HostAuth, HostsResponse, ListResponse, MeRequest,
    Profile, Request, Response, SignRequest, SignResponse,
};
use crate::transport::{push, Transport, TransportSet};

use slots::{SeenLru, Slots};

/// Builds the transport set for a pairing. Injected so tests can wire the
/// in-memory transport and the daemon wires queue (+ BLE when a radio
/// backend is present).
pub type TransportFactory = Arc<dyn Fn(&PairingSecret) -> TransportSet + Send + Sync>;

struct EnclaveState {
    pairing: Option<PairingSecret>,
    profile: Option<Profile>,
    transports: Option<TransportSet>,
    listeners: Vec<JoinHandle<()>>,
    /// Latched when the bound phone key changed; cleared only by `pair`.
    phone_changed: bool,
}

/// The request/response engine. One per daemon, shared by handle.
pub struct EnclaveClient {
    state: Mutex<EnclaveState>,
    slots: Slots,
    seen: std::sync::Mutex<SeenLru>,
    bus: NotificationBus,
    dir: KrDir,
    factory: TransportFactory,
    push_client: reqwest::Client,
}

impl std::fmt::Debug for EnclaveClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnclaveClient")
            .field("outstanding_slots", &self.slots.len())
            .finish_non_exhaustive()
    }
}

impl EnclaveClient {
    /// Fresh engine with no pairing installed.
    pub fn new(dir: KrDir, bus: NotificationBus, factory: TransportFactory) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(EnclaveState {
                pairing: None,
                profile: None,
                transports: None,
                listeners: Vec::new(),
                phone_changed: false,
            }),
            slots: Slots::new(),
            seen: std::sync::Mutex::new(SeenLru::new(SEEN_LRU_CAPACITY)),
            bus,
            dir,
            factory,
            push_client: push::client(),
        })
    }

    /// Restore persisted pairing and identity cache on daemon start.
    pub async fn restore(self: &Arc<Self>) -> Result<()> {
        let pairing = self
            .dir
            .load_pairing()
            .map_err(|e| Error::Internal(e.to_string()))?;
        let Some(pairing) = pairing else {
            log::info!("[enclave] no persisted pairing");
            return Ok(());
        };

        let profile = self.dir.load_me();
        let transports = (self.factory)(&pairing);
        let mut state = self.state.lock().await;
        state.listeners = self.spawn_listeners(&transports);
        state.transports = Some(transports);
        log::info!(
            "[enclave] restored pairing for queue {} (identity cached: {})",
            &pairing.queue_name()[..8],
            profile.is_some()
        );
        state.pairing = Some(pairing);
        state.profile = profile;
        Ok(())
    }

    // ========================================================================
    // Pairing lifecycle
    // ========================================================================

    /// Install a fresh pairing and begin listening.
    ///
    /// Returns the QR payload (the pairing's public half). The bootstrap
    /// `request_me` is issued immediately; its response binds the phone's
    /// static key and populates the identity cache.
    pub async fn pair(self: &Arc<Self>, pairing: PairingSecret) -> Result<serde_json::Value> {
        let qr = pairing.qr_payload()?;
        self.dir
            .save_pairing(&pairing)
            .map_err(|e| Error::Internal(e.to_string()))?;
        let _ = self.dir.delete_me();

        let transports = (self.factory)(&pairing);
        {
            let mut state = self.state.lock().await;
            for handle in state.listeners.drain(..) {
                handle.abort();
            }
            self.slots.clear();
            state.listeners = self.spawn_listeners(&transports);
            state.transports = Some(transports);
            state.pairing = Some(pairing);
            state.profile = None;
            state.phone_changed = false;
        }
        log::info!("[enclave] pairing installed, awaiting first contact");

        // Bootstrap identity fetch; the result lands in the cache.
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.request_me(true, None).await {
                log::warn!("[enclave] bootstrap identity request: {e}");
            }
        });

        Ok(qr)
    }

    /// Clear the pairing, the identity cache, and the push endpoint; stop
    /// listening.
    pub async fn unpair(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        for handle in state.listeners.drain(..) {
            handle.abort();
        }
        state.pairing = None;
        state.profile = None;
        state.transports = None;
        state.phone_changed = false;
        drop(state);

        self.slots.clear();
        self.dir
            .delete_pairing()
            .and_then(|_| self.dir.delete_me())
            .map_err(|e| Error::Internal(e.to_string()))?;
        log::info!("[enclave] unpaired");
        Ok(())
    }

    /// Whether a pairing is installed.
    pub async fn is_paired(&self) -> bool {
        self.state.lock().await.pairing.is_some()
    }

    /// Non-blocking read of the cached phone profile.
    pub async fn cached_profile(&self) -> Option<Profile> {
        self.state.lock().await.profile.clone()
    }

    /// Non-blocking read of the cached push endpoint.
    pub async fn cached_push_endpoint(&self) -> Option<String> {
        self.state
            .lock()
            .await
            .pairing
            .as_ref()
            .and_then(|p| p.push_endpoint.clone())
    }

    // ========================================================================
    // Typed requests
    // ========================================================================

    /// The phone's identity. Cache read unless `force_refresh`.
    ///
    /// A force-refresh retries internally once after a short delay if the
    /// first attempt times out.
    pub async fn request_me(&self, force_refresh: bool, user_id: Option<String>) -> Result<Profile> {
        if !force_refresh {
            if let Some(profile) = self.cached_profile().await {
                return Ok(profile);
            }
        }

        let result = self
            .transact(Request::me(MeRequest {
                user_id: user_id.clone(),
            }))
            .await;
        let response = match result {
            Err(Error::Timeout) if force_refresh => {
                tokio::time::sleep(ME_RETRY_DELAY).await;
                self.transact(Request::me(MeRequest { user_id })).await?
            }
            other => other?,
        };

        let profile = response
            .me_response
            .ok_or_else(|| Error::bad_message("me response missing body"))?
            .me;
        if !profile.has_public_key() {
            return Err(Error::bad_message("me response carries no public key"));
        }

        {
            let mut state = self.state.lock().await;
            state.profile = Some(profile.clone());
        }
        if let Err(e) = self.dir.save_me(&profile) {
            log::warn!("[enclave] failed to persist identity cache: {e}");
        }
        Ok(profile)
    }

    /// Ask the phone for a signature. Blocking with the sign timeout.
    ///
    /// A rejection comes back as a normal `SignResponse` with its error
    /// field set; the addressed `REJECTED` notification is emitted here so
    /// wrappers learn about it immediately.
    pub async fn request_signature(
        &self,
        sign: SignRequest,
        notify_prefix: Option<String>,
    ) -> Result<SignResponse> {
        let mut request = Request::sign(sign);
        request.notify_prefix = notify_prefix;
        let prefix = request.notify_prefix.clone();

        let result = self.transact(request).await;
        let response = match result {
            Ok(response) => response,
            Err(Error::Timeout) => {
                match prefix.as_deref() {
                    Some(p) => self.bus.addressed(p, PAYLOAD_STOP),
                    None => self.bus.info("sign request timed out waiting for phone"),
                }
                return Err(Error::Timeout);
            }
            Err(e) => return Err(e),
        };

        let sign_response = response
            .sign_response
            .ok_or_else(|| Error::bad_message("sign response missing body"))?;
        if sign_response.is_rejected() {
            self.bus.notify(prefix.as_deref(), PAYLOAD_REJECTED);
        }
        Ok(sign_response)
    }

    /// Enumerate phone-held keys.
    pub async fn request_list(&self) -> Result<ListResponse> {
        let response = self.transact(Request::list()).await?;
        response
            .list_response
            .ok_or_else(|| Error::bad_message("list response missing body"))
    }

    /// Fetch pinned-host records.
    pub async fn request_hosts(&self) -> Result<HostsResponse> {
        let response = self.transact(Request::hosts()).await?;
        response
            .hosts_response
            .ok_or_else(|| Error::bad_message("hosts response missing body"))
    }

    /// Fire-and-forget liveness poke; no response awaited.
    pub async fn request_noop(&self) -> Result<()> {
        self.send(&Request::noop()).await
    }

    /// Pass-through git signing request.
    pub async fn request_git_sign(&self, git_sign: GitSignRequest) -> Result<GitSignResponse> {
        let response = self.transact(Request::git_sign(git_sign)).await?;
        response
            .git_sign_response
            .ok_or_else(|| Error::bad_message("git sign response missing body"))
    }

    /// Forward a host-key observation to the phone. Same envelope and
    /// transport as everything else, but no slot and no response.
    pub async fn submit_host_auth(&self, host_auth: HostAuth) -> Result<()> {
        self.send(&Request::host_auth(host_auth)).await
    }

    /// Submit an arbitrary pre-built envelope (control-plane pass-through).
    ///
    /// Single-shot bodies (host-auth) publish without waiting; everything
    /// else waits for the matching response under the class timeout.
    pub async fn transact_raw(&self, request: Request) -> Result<Response> {
        request.validate()?;
        if request.host_auth_request.is_some() {
            let request_id = request.request_id.clone();
            self.send(&request).await?;
            return Ok(Response {
                request_id,
                ..Default::default()
            });
        }
        self.transact(request).await
    }

    // ========================================================================
    // Engine internals
    // ========================================================================

    /// Snapshot what sending needs, under the state lock.
    async fn sending_context(&self) -> Result<([u8; 32], TransportSet, Option<String>)> {
        let state = self.state.lock().await;
        if state.phone_changed {
            return Err(Error::PhoneChanged);
        }
        let pairing = state.pairing.as_ref().ok_or(Error::NotPaired)?;
        let transports = state
            .transports
            .clone()
            .ok_or_else(|| Error::Transport("no transport installed".into()))?;
        Ok((
            pairing.send_key(),
            transports,
            pairing.push_endpoint.clone(),
        ))
    }

    /// Seal and publish one envelope; wake the phone when possible.
    async fn send(&self, request: &Request) -> Result<()> {
        let (key, transports, endpoint) = self.sending_context().await?;
        let payload = codec::seal(request, &key)?;
        transports.publish(payload).await?;
        log::debug!(
            "[enclave] published {} request {}",
            request.kind(),
            request.request_id
        );

        if let Some(endpoint) = endpoint {
            let client = self.push_client.clone();
            tokio::spawn(async move {
                push::wake(&client, &endpoint).await;
            });
        }
        Ok(())
    }

    /// Publish-then-wait with the request-class timeout.
    async fn transact(&self, request: Request) -> Result<Response> {
        let timeout = request.timeout();
        let request_id = request.request_id.clone();
        let receiver = self.slots.reserve(&request_id);

        if let Err(e) = self.send(&request).await {
            self.slots.cancel(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(response)) => Ok(response),
            // Slot dropped underneath us: the pairing went away mid-flight.
            Ok(Err(_)) => Err(Error::NotPaired),
            Err(_) => {
                self.slots.cancel(&request_id);
                log::debug!("[enclave] request {request_id} timed out after {timeout:?}");
                Err(Error::Timeout)
            }
        }
    }

    fn spawn_listeners(self: &Arc<Self>, transports: &TransportSet) -> Vec<JoinHandle<()>> {
        if transports.is_empty() {
            log::warn!("[enclave] no transport available; requests will fail until one is");
        }
        transports
            .members()
            .iter()
            .map(|transport| {
                let this = Arc::clone(self);
                let transport = Arc::clone(transport);
                tokio::spawn(async move {
                    this.listen_loop(transport).await;
                })
            })
            .collect()
    }

    /// Poll one transport forever, with bounded backoff on errors.
    async fn listen_loop(self: Arc<Self>, transport: Arc<dyn Transport>) {
        let mut backoff = LISTEN_BACKOFF_MIN;
        log::info!("[enclave] listening on {}", transport.name());
        loop {
            match transport.receive().await {
                Ok(messages) => {
                    backoff = LISTEN_BACKOFF_MIN;
                    // One message at a time preserves per-message atomicity;
                    // deliveries happen in arrival order.
                    for message in messages {
                        self.handle_payload(&message).await;
                    }
                }
                Err(e) => {
                    log::debug!(
                        "[enclave] {} receive failed, backing off {backoff:?}: {e}",
                        transport.name()
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(LISTEN_BACKOFF_MAX);
                }
            }
        }
    }

    /// Process one inbound ciphertext frame.
    async fn handle_payload(&self, payload: &str) {
        let keys = match self.state.lock().await.pairing.as_ref() {
            Some(pairing) => pairing.receive_keys(),
            None => return,
        };

        let response: Response = match codec::open(payload, &keys) {
            Ok(response) => response,
            Err(e) => {
                log::debug!("[enclave] dropping undecodable frame: {e}");
                return;
            }
        };

        if let Some(phone_key) = &response.device_public_key {
            if !self.bind_phone_key(phone_key).await {
                return;
            }
        }

        // At-least-once dedup: a response id already delivered is dropped
        // before any side effect.
        if self
            .seen
            .lock()
            .expect("seen lru lock")
            .contains(&response.request_id)
        {
            log::debug!("[enclave] dropping duplicate response {}", response.request_id);
            return;
        }

        if let Some(endpoint) = &response.device_push_endpoint {
            self.cache_push_endpoint(endpoint).await;
        }

        let request_id = response.request_id.clone();
        if !self.slots.complete(&request_id, response) {
            // Expired or never ours; at-most-once to callers means we stay
            // silent here.
            log::debug!("[enclave] dropping response for unknown request {request_id}");
        }
        self.seen.lock().expect("seen lru lock").observe(&request_id);
    }

    /// Install or verify the phone's static key. Returns `false` when the
    /// frame must not be processed further (phone changed).
    async fn bind_phone_key(&self, phone_key: &[u8]) -> bool {
        let mut state = self.state.lock().await;
        let Some(pairing) = state.pairing.as_mut() else {
            return false;
        };
        match pairing.on_first_contact(phone_key) {
            Ok(true) => {
                log::info!("[enclave] phone static key bound");
                if let Err(e) = self.dir.save_pairing(pairing) {
                    log::warn!("[enclave] failed to persist bound pairing: {e}");
                }
                true
            }
            Ok(false) => true,
            Err(Error::PhoneChanged) => {
                log::error!("[enclave] phone static key changed; unpairing");
                state.pairing = None;
                state.profile = None;
                state.transports = None;
                state.phone_changed = true;
                let listeners = std::mem::take(&mut state.listeners);
                drop(state);

                let _ = self.dir.delete_pairing();
                let _ = self.dir.delete_me();
                self.slots.clear();
                self.bus.info(PAYLOAD_HOST_KEY_MISMATCH);

                // Our own listener task is in this list; the abort lands at
                // its next suspension point, after this frame is dropped.
                for handle in listeners {
                    handle.abort();
                }
                false
            }
            Err(e) => {
                log::debug!("[enclave] dropping frame with malformed phone key: {e}");
                false
            }
        }
    }

    /// Cache a newly advertised push endpoint (first writer wins).
    async fn cache_push_endpoint(&self, endpoint: &str) {
        let mut state = self.state.lock().await;
        let Some(pairing) = state.pairing.as_mut() else {
            return;
        };
        if pairing.push_endpoint.is_some() {
            return;
        }
        pairing.push_endpoint = Some(endpoint.to_string());
        log::info!("[enclave] phone registered push endpoint");
        if let Err(e) = self.dir.save_pairing(pairing) {
            log::warn!("[enclave] failed to persist push endpoint: {e}");
        }
    }
}
