//! Shared test harness: an enclave client wired to an in-memory transport
//! and a scriptable mock phone on the other end.

#![allow(dead_code)]

use std::sync::{Arc, Mutex as StdMutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::Signer as _;
use p256::elliptic_curve::rand_core::OsRng;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::DecodePublicKey;
use tempfile::TempDir;
use tokio::task::JoinHandle;

use kr::enclave::EnclaveClient;
use kr::notify::NotificationBus;
use kr::pairing::PairingSecret;
use kr::persistence::KrDir;
use kr::protocol::{
    codec, AckResponse, HostAuth, HostInfo, HostsResponse, ListResponse, MeResponse, Profile,
    Request, Response, SignResponse, UserAndHost,
};
use kr::transport::memory::{self, MemoryTransport};
use kr::transport::TransportSet;

/// How the mock phone answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Answer everything.
    Normal,
    /// Never answer.
    Silent,
    /// Answer signs with `error: "rejected"`.
    RejectSign,
    /// Publish every response twice (at-least-once delivery).
    EchoTwice,
}

/// Enclave client + state dir wired to a per-pairing memory transport.
pub struct TestEnv {
    pub tmp: TempDir,
    pub dir: KrDir,
    pub bus: NotificationBus,
    pub enclave: Arc<EnclaveClient>,
    phone_end: Arc<StdMutex<Option<MemoryTransport>>>,
}

impl TestEnv {
    pub fn new() -> Self {
        let tmp = TempDir::new().expect("tempdir");
        let dir = KrDir::open_at(tmp.path().join("kr")).expect("state dir");
        let bus = NotificationBus::new(dir.root().to_path_buf());

        let phone_end: Arc<StdMutex<Option<MemoryTransport>>> = Arc::new(StdMutex::new(None));
        let slot = Arc::clone(&phone_end);
        let factory: kr::TransportFactory = Arc::new(move |_pairing| {
            let (ws, phone) = memory::pair();
            *slot.lock().expect("phone slot") = Some(phone);
            TransportSet::new(vec![Arc::new(ws)])
        });

        let enclave = EnclaveClient::new(dir.clone(), bus.clone(), factory);
        Self {
            tmp,
            dir,
            bus,
            enclave,
            phone_end,
        }
    }

    /// Install a fresh pairing and hand the phone end to a mock phone.
    pub async fn pair(&self, behavior: Behavior) -> MockPhone {
        let pairing = PairingSecret::generate(Some("test-ws".into()));
        let qr = self.enclave.pair(pairing).await.expect("pair");
        let phone_end = self
            .phone_end
            .lock()
            .expect("phone slot")
            .take()
            .expect("factory ran");
        MockPhone::start(&qr, phone_end, behavior)
    }

    /// Take the phone transport end of the most recent pairing.
    pub fn take_phone_end(&self) -> MemoryTransport {
        self.phone_end
            .lock()
            .expect("phone slot")
            .take()
            .expect("factory ran")
    }
}

/// Scriptable phone simulator honoring the message schema.
pub struct MockPhone {
    behavior: Arc<StdMutex<Behavior>>,
    device_key: Arc<StdMutex<Vec<u8>>>,
    ssh_key: ed25519_dalek::SigningKey,
    profile: Profile,
    pub received_host_auths: Arc<StdMutex<Vec<HostAuth>>>,
    handle: JoinHandle<()>,
}

impl MockPhone {
    /// Start the phone loop from a scanned QR payload.
    pub fn start(qr: &serde_json::Value, transport: MemoryTransport, behavior: Behavior) -> Self {
        let seed: [u8; 32] = BASE64
            .decode(qr["seed"].as_str().expect("qr seed"))
            .expect("seed b64")
            .try_into()
            .expect("32-byte seed");
        let ws_der = BASE64
            .decode(qr["pk"].as_str().expect("qr pk"))
            .expect("pk b64");
        let ws_public = p256::PublicKey::from_public_key_der(&ws_der).expect("ws SPKI");

        let phone_secret = p256::SecretKey::random(&mut OsRng);
        let device_key = Arc::new(StdMutex::new(
            phone_secret
                .public_key()
                .to_encoded_point(false)
                .as_bytes()
                .to_vec(),
        ));

        let ssh_key = ed25519_dalek::SigningKey::from_bytes(&rand_seed());
        let profile = profile_for(&ssh_key);

        let bootstrap = kr::crypto::derive_bootstrap_key(&seed);
        let session =
            kr::crypto::derive_session_key(&seed, &kr::crypto::ecdh(&phone_secret, &ws_public));

        let behavior = Arc::new(StdMutex::new(behavior));
        let received_host_auths = Arc::new(StdMutex::new(Vec::new()));

        let handle = tokio::spawn(phone_loop(
            transport,
            [session, bootstrap],
            bootstrap,
            Arc::clone(&behavior),
            Arc::clone(&device_key),
            ssh_key.clone(),
            profile.clone(),
            Arc::clone(&received_host_auths),
        ));

        Self {
            behavior,
            device_key,
            ssh_key,
            profile,
            received_host_auths,
            handle,
        }
    }

    /// The profile this phone reports.
    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// The phone's SSH verifying key (for signature checks).
    pub fn verifying_key(&self) -> ed25519_dalek::VerifyingKey {
        self.ssh_key.verifying_key()
    }

    /// Change how the phone answers.
    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().expect("behavior") = behavior;
    }

    /// Start advertising a different static key (phone-change scenario).
    pub fn swap_device_key(&self) {
        let fresh = p256::SecretKey::random(&mut OsRng);
        *self.device_key.lock().expect("device key") = fresh
            .public_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();
    }

    pub fn shutdown(self) {
        self.handle.abort();
    }
}

#[allow(clippy::too_many_arguments)]
async fn phone_loop(
    transport: MemoryTransport,
    open_keys: [[u8; 32]; 2],
    seal_key: [u8; 32],
    behavior: Arc<StdMutex<Behavior>>,
    device_key: Arc<StdMutex<Vec<u8>>>,
    ssh_key: ed25519_dalek::SigningKey,
    profile: Profile,
    received_host_auths: Arc<StdMutex<Vec<HostAuth>>>,
) {
    use kr::transport::Transport;

    loop {
        let messages = match transport.receive().await {
            Ok(messages) => messages,
            Err(_) => return,
        };
        for payload in messages {
            let Ok(request) = codec::open::<Request>(&payload, &open_keys) else {
                continue;
            };
            if *behavior.lock().expect("behavior") == Behavior::Silent {
                continue;
            }

            if let Some(host_auth) = request.host_auth_request {
                received_host_auths
                    .lock()
                    .expect("host auths")
                    .push(host_auth);
                continue;
            }

            let mut response = Response {
                request_id: request.request_id.clone(),
                device_public_key: Some(device_key.lock().expect("device key").clone()),
                ..Default::default()
            };

            if request.me_request.is_some() {
                response.me_response = Some(MeResponse {
                    me: profile.clone(),
                });
            } else if let Some(sign) = request.sign_request {
                response.sign_response =
                    Some(if *behavior.lock().expect("behavior") == Behavior::RejectSign {
                        SignResponse {
                            signature: None,
                            error: Some("rejected".into()),
                        }
                    } else {
                        SignResponse {
                            signature: Some(ssh_key.sign(&sign.data).to_bytes().to_vec()),
                            error: None,
                        }
                    });
            } else if request.list_request.is_some() {
                response.list_response = Some(ListResponse {
                    profiles: vec![profile.clone()],
                });
            } else if request.hosts_request.is_some() {
                response.hosts_response = Some(HostsResponse {
                    host_info: Some(HostInfo {
                        pgp_user_ids: None,
                        hosts: Some(vec![UserAndHost {
                            user: "ops".into(),
                            host: "prod-1".into(),
                        }]),
                    }),
                    error: None,
                });
            } else if let Some(git_sign) = request.git_sign_request {
                response.git_sign_response = Some(kr::protocol::GitSignResponse {
                    signature: Some(ssh_key.sign(&git_sign.data).to_bytes().to_vec()),
                    error: None,
                });
            } else if request.noop_request.is_some() {
                response.ack_response = Some(AckResponse {});
            } else {
                continue;
            }

            let Ok(sealed) = codec::seal(&response, &seal_key) else {
                continue;
            };
            let echo = *behavior.lock().expect("behavior") == Behavior::EchoTwice;
            if transport.publish(sealed.clone()).await.is_err() {
                return;
            }
            if echo && transport.publish(sealed).await.is_err() {
                return;
            }
        }
    }
}

/// SSH-wire ed25519 profile for a signing key.
pub fn profile_for(ssh_key: &ed25519_dalek::SigningKey) -> Profile {
    let mut w = kr::sshwire::WireWriter::new();
    w.write_string(b"ssh-ed25519")
        .write_string(ssh_key.verifying_key().as_bytes());
    Profile {
        ssh_wire_public_key: w.into_inner(),
        email: Some("phone@example.com".into()),
        pgp_public_key: None,
    }
}

fn rand_seed() -> [u8; 32] {
    use rand::RngCore;
    let mut seed = [0u8; 32];
    rand::rng().fill_bytes(&mut seed);
    seed
}

/// Await a condition with a bounded number of polls.
pub async fn eventually<F, Fut>(mut check: F, what: &str)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    panic!("condition never held: {what}");
}
