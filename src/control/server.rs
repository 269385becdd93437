//! Control server endpoints.
//!
//! | Method+Path      | Effect                                             |
//! |------------------|----------------------------------------------------|
//! | `GET /version`   | `200` text `major.minor.patch`                     |
//! | `PUT /pair`      | fresh pairing installed; `200` QR payload JSON     |
//! | `GET /pair`      | identity; body `MeRequest` forces a phone refresh  |
//! | `DELETE /pair`   | unpair                                             |
//! | `POST /enclave`  | arbitrary typed request, matching response         |
//! | `GET /hosts`     | pinned-host records from the phone                 |
//!
//! Error kinds map to statuses per the engine contract: `NotPaired → 404`,
//! `Timeout → 408`, `Transport → 502`, anything else `500`. Handlers run
//! concurrently; pairing mutations serialize on the enclave mutex.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;

use crate::enclave::EnclaveClient;
use crate::error::Error;
use crate::pairing::PairingSecret;
use crate::protocol::{MeRequest, Request};

/// Shared handler state.
#[derive(Clone)]
pub struct ControlState {
    enclave: Arc<EnclaveClient>,
}

/// `PUT /pair` body.
#[derive(Debug, Default, Deserialize)]
pub struct PairingOptions {
    /// Workstation name shown on the phone; hostname when omitted.
    #[serde(default)]
    pub workstation_name: Option<String>,
}

/// Build the control router.
pub fn router(enclave: Arc<EnclaveClient>) -> Router {
    Router::new()
        .route("/version", get(version))
        .route("/pair", put(pair).get(get_pair).delete(delete_pair))
        .route("/enclave", post(post_enclave))
        .route("/hosts", get(get_hosts))
        .with_state(ControlState { enclave })
}

/// Serve the control plane on a pre-opened Unix listener.
pub async fn serve(
    listener: tokio::net::UnixListener,
    enclave: Arc<EnclaveClient>,
) -> std::io::Result<()> {
    axum::serve(listener, router(enclave)).await
}

fn error_response(error: &Error) -> HttpResponse {
    let status =
        StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, error.to_string()).into_response()
}

async fn version() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain")],
        crate::constants::VERSION,
    )
}

async fn pair(State(state): State<ControlState>, body: Bytes) -> HttpResponse {
    let options: PairingOptions = if body.is_empty() {
        PairingOptions::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(options) => options,
            Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        }
    };

    let pairing = PairingSecret::generate(options.workstation_name);
    match state.enclave.pair(pairing).await {
        Ok(qr) => Json(qr).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn get_pair(State(state): State<ControlState>, body: Bytes) -> HttpResponse {
    // A MeRequest body forces a phone refresh; an empty body reads the
    // cache (fetching only when the cache is cold).
    let (force, user_id) = if body.is_empty() {
        (false, None)
    } else {
        match serde_json::from_slice::<MeRequest>(&body) {
            Ok(me) => (true, me.user_id),
            Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        }
    };

    match state.enclave.request_me(force, user_id).await {
        Ok(profile) => Json(profile).into_response(),
        Err(Error::Timeout) => {
            // The phone is slow but the cache may still serve.
            match state.enclave.cached_profile().await {
                Some(profile) => Json(profile).into_response(),
                None => (StatusCode::NOT_FOUND, "identity not yet returned").into_response(),
            }
        }
        Err(e) => error_response(&e),
    }
}

async fn delete_pair(State(state): State<ControlState>) -> HttpResponse {
    match state.enclave.unpair().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(&e),
    }
}

async fn post_enclave(State(state): State<ControlState>, body: Bytes) -> HttpResponse {
    let request: Request = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    match state.enclave.transact_raw(request).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn get_hosts(State(state): State<ControlState>) -> HttpResponse {
    match state.enclave.request_hosts().await {
        Ok(hosts) => Json(hosts).into_response(),
        Err(e) => error_response(&e),
    }
}
