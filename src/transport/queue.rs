//! Cloud queue transport.
//!
//! The relay exposes two directions per pairing, named by the queue name
//! derived from the workstation static key:
//!
//! - `POST {base}/{queue}/ws-to-phone` with `{"message": "<base64>"}`
//! - `GET  {base}/{queue}/phone-to-ws?wait=20` returning
//!   `{"messages": ["<base64>", …]}` (204 or an empty list when nothing is
//!   pending)
//!
//! Receipt is destructive per client identity; redelivery only happens when
//! the phone explicitly resends, so the engine's request-id dedup covers the
//! at-least-once window.

use async_trait::async_trait;
use serde::Deserialize;

use crate::constants::{QUEUE_HTTP_TIMEOUT, QUEUE_POLL_WAIT};
use crate::error::{Error, Result};
use crate::transport::Transport;

/// HTTP client over the cloud queue relay.
#[derive(Debug)]
pub struct QueueTransport {
    client: reqwest::Client,
    base_url: String,
    queue_name: String,
}

#[derive(Debug, Deserialize)]
struct ReceiveBody {
    #[serde(default)]
    messages: Vec<String>,
}

impl QueueTransport {
    /// Build a transport for one pairing's queue.
    pub fn new(base_url: String, queue_name: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(QUEUE_HTTP_TIMEOUT)
            .user_agent(crate::constants::user_agent())
            .build()
            .map_err(Error::transport)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            queue_name,
        })
    }

    fn url(&self, direction: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.queue_name, direction)
    }
}

#[async_trait]
impl Transport for QueueTransport {
    fn name(&self) -> &'static str {
        "queue"
    }

    async fn publish(&self, payload: String) -> Result<()> {
        let response = self
            .client
            .post(self.url("ws-to-phone"))
            .json(&serde_json::json!({ "message": payload }))
            .send()
            .await
            .map_err(Error::transport)?;

        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "queue publish failed: HTTP {}",
                response.status().as_u16()
            )));
        }
        Ok(())
    }

    async fn receive(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .get(self.url("phone-to-ws"))
            .query(&[("wait", QUEUE_POLL_WAIT.as_secs().to_string())])
            .send()
            .await
            .map_err(Error::transport)?;

        let status = response.status();
        if status.as_u16() == 204 {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(Error::Transport(format!(
                "queue receive failed: HTTP {}",
                status.as_u16()
            )));
        }

        let body: ReceiveBody = response.json().await.map_err(Error::transport)?;
        Ok(body.messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const QUEUE: &str = "0f0f0f0f";

    #[tokio::test]
    async fn test_publish_posts_message_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/{QUEUE}/ws-to-phone")))
            .and(body_json(serde_json::json!({ "message": "ZnJhbWU=" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let transport = QueueTransport::new(server.uri(), QUEUE.into()).unwrap();
        transport.publish("ZnJhbWU=".into()).await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_http_error_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/{QUEUE}/ws-to-phone")))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let transport = QueueTransport::new(server.uri(), QUEUE.into()).unwrap();
        assert!(matches!(
            transport.publish("x".into()).await,
            Err(Error::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_receive_returns_pending_messages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/{QUEUE}/phone-to-ws")))
            .and(query_param("wait", "20"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messages": ["YQ==", "Yg=="]
            })))
            .mount(&server)
            .await;

        let transport = QueueTransport::new(server.uri(), QUEUE.into()).unwrap();
        assert_eq!(
            transport.receive().await.unwrap(),
            vec!["YQ==".to_string(), "Yg==".to_string()]
        );
    }

    #[tokio::test]
    async fn test_receive_empty_queue_is_normal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/{QUEUE}/phone-to-ws")))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let transport = QueueTransport::new(server.uri(), QUEUE.into()).unwrap();
        assert!(transport.receive().await.unwrap().is_empty());
    }
}
