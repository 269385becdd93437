//! End-to-end engine scenarios against the mock phone.

mod common;

use common::{Behavior, TestEnv};
use ed25519_dalek::Verifier;

use kr::error::Error;
use kr::protocol::{HostAuth, SignRequest};
use kr::sshwire;

fn sign_request(env_profile_fingerprint: [u8; 32], data: Vec<u8>) -> SignRequest {
    SignRequest {
        public_key_fingerprint: env_profile_fingerprint.to_vec(),
        data,
        command: Some("ssh prod-1".into()),
        hostname: Some("prod-1".into()),
        user: Some("ops".into()),
    }
}

#[tokio::test]
async fn test_pair_then_identity() {
    let env = TestEnv::new();
    let phone = env.pair(Behavior::Normal).await;

    // The bootstrap request_me lands in the cache without further calls.
    common::eventually(
        || async { env.enclave.cached_profile().await.is_some() },
        "identity cache populated after pairing",
    )
    .await;

    let cached = env.enclave.cached_profile().await.unwrap();
    assert_eq!(
        cached.ssh_wire_public_key,
        phone.profile().ssh_wire_public_key
    );

    // The cache also persisted for the next daemon start.
    assert_eq!(env.dir.load_me().unwrap(), cached);
    assert!(env.enclave.is_paired().await);
    phone.shutdown();
}

#[tokio::test]
async fn test_sign_roundtrip_verifies() {
    let env = TestEnv::new();
    let phone = env.pair(Behavior::Normal).await;

    let data: Vec<u8> = (0u8..32).collect();
    let fingerprint = kr::crypto::sha256(&phone.profile().ssh_wire_public_key);
    let response = env
        .enclave
        .request_signature(sign_request(fingerprint, data.clone()), None)
        .await
        .unwrap();

    let raw = response.signature.expect("signature present");
    let signature = ed25519_dalek::Signature::from_slice(&raw).unwrap();
    phone
        .verifying_key()
        .verify(&data, &signature)
        .expect("phone-produced signature verifies");
    phone.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_silent_phone_times_out_and_notifies() {
    let env = TestEnv::new();
    let phone = env.pair(Behavior::Silent).await;

    let fingerprint = kr::crypto::sha256(&phone.profile().ssh_wire_public_key);
    let result = env
        .enclave
        .request_signature(sign_request(fingerprint, vec![1, 2, 3]), Some("4242".into()))
        .await;
    assert!(matches!(result, Err(Error::Timeout)));

    // The wrapper addressed by the prefix got a non-empty line.
    let content =
        std::fs::read_to_string(env.dir.root().join("4242.notify")).expect("notify file exists");
    let line = content.lines().next().expect("one line");
    assert!(line.starts_with("[4242] "));
    assert!(line.len() > "[4242] ".len());
    phone.shutdown();
}

#[tokio::test]
async fn test_rejection_notifies_within_bus() {
    let env = TestEnv::new();
    let phone = env.pair(Behavior::RejectSign).await;

    common::eventually(
        || async { env.enclave.cached_profile().await.is_some() },
        "bootstrap identity",
    )
    .await;

    let fingerprint = kr::crypto::sha256(&phone.profile().ssh_wire_public_key);
    let response = env
        .enclave
        .request_signature(sign_request(fingerprint, vec![7; 16]), Some("777".into()))
        .await
        .unwrap();
    assert!(response.is_rejected());

    // The REJECTED line is written before request_signature returns, so it
    // is already on disk here.
    let content =
        std::fs::read_to_string(env.dir.root().join("777.notify")).expect("notify file exists");
    assert!(content.contains("[777] REJECTED"));
    phone.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_phone_change_poisons_session_and_clears_pairing() {
    let env = TestEnv::new();
    let phone = env.pair(Behavior::Normal).await;

    common::eventually(
        || async { env.enclave.cached_profile().await.is_some() },
        "first contact bound",
    )
    .await;
    assert!(env.dir.load_pairing().unwrap().is_some());

    // The phone starts advertising a different static key.
    phone.swap_device_key();
    let result = env.enclave.request_me(true, None).await;
    assert!(result.is_err(), "mismatched key must never produce a profile");

    // Engine latched PhoneChanged: requests fail, pairing is gone on disk.
    common::eventually(
        || async { !env.enclave.is_paired().await },
        "auto-unpair after phone change",
    )
    .await;
    assert!(matches!(
        env.enclave.request_list().await,
        Err(Error::PhoneChanged)
    ));
    assert!(env.dir.load_pairing().unwrap().is_none());
    assert!(env.dir.load_me().is_none());

    // The notification bus carried the mismatch class marker.
    let content =
        std::fs::read_to_string(env.dir.root().join("krd.notify")).expect("global notify");
    assert!(content.contains("HOST_KEY_MISMATCH"));

    // A fresh pairing clears the latch.
    let phone2 = env.pair(Behavior::Normal).await;
    common::eventually(
        || async { env.enclave.cached_profile().await.is_some() },
        "re-pair works after phone change",
    )
    .await;
    phone.shutdown();
    phone2.shutdown();
}

#[tokio::test]
async fn test_host_auth_forwarded_verbatim() {
    let env = TestEnv::new();
    let phone = env.pair(Behavior::Normal).await;

    let ssh_key = ed25519_dalek::SigningKey::from_bytes(&[9u8; 32]);
    let mut w = kr::sshwire::WireWriter::new();
    w.write_string(b"ssh-ed25519")
        .write_string(ssh_key.verifying_key().as_bytes());
    let record = HostAuth {
        host_key: w.into_inner(),
        signature: sshwire::encode_signature("ssh-ed25519", &[3u8; 64]),
        host_names: vec!["example.com:2222".into()],
    };

    env.enclave.submit_host_auth(record.clone()).await.unwrap();

    let received = phone.received_host_auths.clone();
    common::eventually(
        || {
            let received = received.clone();
            async move { !received.lock().unwrap().is_empty() }
        },
        "host auth observed by phone within bound",
    )
    .await;
    assert_eq!(phone.received_host_auths.lock().unwrap()[0], record);
    phone.shutdown();
}

#[tokio::test]
async fn test_git_sign_passthrough() {
    let env = TestEnv::new();
    let phone = env.pair(Behavior::Normal).await;
    common::eventually(
        || async { env.enclave.cached_profile().await.is_some() },
        "paired",
    )
    .await;

    let data = b"tree 4b825dc\nauthor Alice <a@example.com>\n\ncommit".to_vec();
    let response = env
        .enclave
        .request_git_sign(kr::protocol::GitSignRequest {
            public_key_fingerprint: kr::crypto::sha256(&phone.profile().ssh_wire_public_key)
                .to_vec(),
            data: data.clone(),
            user_id: Some("Alice <a@example.com>".into()),
        })
        .await
        .unwrap();

    let raw = response.signature.expect("signature present");
    let signature = ed25519_dalek::Signature::from_slice(&raw).unwrap();
    phone.verifying_key().verify(&data, &signature).unwrap();
    phone.shutdown();
}

#[tokio::test]
async fn test_unpair_clears_everything() {
    let env = TestEnv::new();
    let phone = env.pair(Behavior::Normal).await;
    common::eventually(
        || async { env.enclave.cached_profile().await.is_some() },
        "paired",
    )
    .await;

    env.enclave.unpair().await.unwrap();

    assert!(!env.enclave.is_paired().await);
    assert!(env.enclave.cached_profile().await.is_none());
    assert!(env.dir.load_pairing().unwrap().is_none());
    assert!(env.dir.load_me().is_none());
    assert!(matches!(
        env.enclave.request_me(false, None).await,
        Err(Error::NotPaired)
    ));
    assert!(matches!(
        env.enclave.request_hosts().await,
        Err(Error::NotPaired)
    ));
    assert!(matches!(
        env.enclave.request_noop().await,
        Err(Error::NotPaired)
    ));
    phone.shutdown();
}

#[tokio::test]
async fn test_duplicate_responses_reach_caller_once() {
    let env = TestEnv::new();
    let phone = env.pair(Behavior::EchoTwice).await;
    common::eventually(
        || async { env.enclave.cached_profile().await.is_some() },
        "paired",
    )
    .await;

    // Every response arrives twice; the caller still sees exactly one
    // outcome and later requests are unaffected by the duplicates.
    let list = env.enclave.request_list().await.unwrap();
    assert_eq!(list.profiles.len(), 1);
    let hosts = env.enclave.request_hosts().await.unwrap();
    assert!(hosts.host_info.is_some());
    phone.shutdown();
}

#[tokio::test]
async fn test_restore_recovers_persisted_state() {
    let env = TestEnv::new();
    let phone = env.pair(Behavior::Normal).await;
    common::eventually(
        || async { env.enclave.cached_profile().await.is_some() },
        "paired and cached",
    )
    .await;
    let cached = env.enclave.cached_profile().await.unwrap();
    phone.shutdown();

    // A second engine over the same state dir behaves like a daemon
    // restart: pairing and identity cache come back from disk.
    let bus = kr::NotificationBus::new(env.dir.root().to_path_buf());
    let factory: kr::TransportFactory = std::sync::Arc::new(|_pairing| {
        kr::transport::TransportSet::new(Vec::new())
    });
    let revived = kr::EnclaveClient::new(env.dir.clone(), bus, factory);
    revived.restore().await.unwrap();

    assert!(revived.is_paired().await);
    assert_eq!(revived.cached_profile().await.unwrap(), cached);
}

#[tokio::test]
async fn test_not_paired_before_any_pairing() {
    let env = TestEnv::new();
    assert!(!env.enclave.is_paired().await);
    assert!(matches!(
        env.enclave.request_me(false, None).await,
        Err(Error::NotPaired)
    ));
}

#[tokio::test]
async fn test_push_endpoint_cached_from_response() {
    let env = TestEnv::new();
    let phone = env.pair(Behavior::Normal).await;

    // Mock phone does not register an endpoint by default.
    common::eventually(
        || async { env.enclave.cached_profile().await.is_some() },
        "paired",
    )
    .await;
    assert!(env.enclave.cached_push_endpoint().await.is_none());
    phone.shutdown();
}
