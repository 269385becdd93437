//! In-process transport pair.
//!
//! [`pair`] returns two linked [`MemoryTransport`]s: what one side
//! publishes, the other receives. Used by the integration tests and the
//! mock phone; the contract (long-poll with possible empty returns,
//! destructive receipt) matches the queue transport.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, Result};
use crate::transport::Transport;

/// How long `receive` waits for a first message before returning empty.
const POLL_WAIT: Duration = Duration::from_millis(100);

/// One end of an in-process transport pair.
#[derive(Debug)]
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<mpsc::UnboundedReceiver<String>>,
}

/// Build two linked ends.
pub fn pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        MemoryTransport {
            tx: a_tx,
            rx: Mutex::new(b_rx),
        },
        MemoryTransport {
            tx: b_tx,
            rx: Mutex::new(a_rx),
        },
    )
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, payload: String) -> Result<()> {
        self.tx
            .send(payload)
            .map_err(|_| Error::Transport("peer end dropped".into()))
    }

    async fn receive(&self) -> Result<Vec<String>> {
        let mut rx = self.rx.lock().await;
        let first = match tokio::time::timeout(POLL_WAIT, rx.recv()).await {
            Ok(Some(msg)) => msg,
            Ok(None) => return Err(Error::Transport("peer end dropped".into())),
            Err(_) => return Ok(Vec::new()),
        };
        let mut messages = vec![first];
        while let Ok(msg) = rx.try_recv() {
            messages.push(msg);
        }
        Ok(messages)
    }
}
