//! Push wake for the phone.
//!
//! When the phone has registered a push endpoint, every queue publish is
//! accompanied by a content-less POST to that endpoint so the phone app
//! wakes and drains its queue. Wake delivery is best-effort: failures are
//! logged and swallowed, never surfaced to the caller.

use crate::constants::PUSH_WAKE_TIMEOUT;

/// Build the shared wake client.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(PUSH_WAKE_TIMEOUT)
        .user_agent(crate::constants::user_agent())
        .build()
        .unwrap_or_default()
}

/// Fire one content-less wake at the registered endpoint.
pub async fn wake(client: &reqwest::Client, endpoint: &str) {
    match client.post(endpoint).body(Vec::new()).send().await {
        Ok(response) if response.status().is_success() => {
            log::debug!("[push] woke phone via {endpoint}");
        }
        Ok(response) => {
            log::warn!(
                "[push] wake returned HTTP {}, continuing without it",
                response.status().as_u16()
            );
        }
        Err(e) => {
            log::warn!("[push] wake failed, continuing without it: {e}");
        }
    }
}
