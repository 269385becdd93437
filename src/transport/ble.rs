//! Bluetooth LE transport.
//!
//! The workstation advertises [`SERVICE_UUID`] with a single characteristic
//! used for write-with-response (phone→ws) and indicate/notify (ws→phone).
//! The radio itself is platform-specific and lives behind [`BleLink`]; this
//! module owns the framing and the [`Transport`] contract.
//!
//! # Block framing
//!
//! Messages larger than `MTU − 1` are split into blocks:
//!
//! ```text
//! [u8 counter][payload: up to MTU−1 bytes]
//! ```
//!
//! The counter decreases monotonically and the final block carries 0; the
//! receiver reassembles when it sees the 0-marker and resets its buffer.
//! Two 1-byte control frames are reserved: `0x00` (peripheral going off)
//! and `0x01` (ping/pong). Data frames always carry at least one payload
//! byte, so control frames are unambiguous. Mid-message connection loss
//! discards the partial buffer.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::transport::Transport;

/// Service UUID advertised by the workstation.
pub const SERVICE_UUID: &str = "20f53e48-c08d-423a-b2c2-1c797889af24";

/// Control frame: peripheral going off.
pub const CTRL_OFF: u8 = 0x00;

/// Control frame: ping/pong.
pub const CTRL_PING: u8 = 0x01;

/// Largest message representable with a 1-byte decreasing counter.
pub const MAX_BLOCKS: usize = 256;

/// Split a message into BLE block frames for the given MTU.
///
/// # Errors
///
/// Fails for empty messages (a bare counter frame would collide with the
/// control bytes), an MTU that cannot carry any payload, or a message that
/// needs more than [`MAX_BLOCKS`] blocks.
pub fn split(message: &[u8], mtu: usize) -> Result<Vec<Vec<u8>>> {
    if message.is_empty() {
        return Err(Error::bad_message("cannot frame an empty message"));
    }
    if mtu < 2 {
        return Err(Error::Transport(format!("MTU {mtu} cannot carry payload")));
    }
    let chunk = mtu - 1;
    let blocks = message.len().div_ceil(chunk);
    if blocks > MAX_BLOCKS {
        return Err(Error::bad_message(format!(
            "message needs {blocks} blocks, max {MAX_BLOCKS}"
        )));
    }

    let mut frames = Vec::with_capacity(blocks);
    for (i, piece) in message.chunks(chunk).enumerate() {
        let counter = (blocks - 1 - i) as u8;
        let mut frame = Vec::with_capacity(1 + piece.len());
        frame.push(counter);
        frame.extend_from_slice(piece);
        frames.push(frame);
    }
    Ok(frames)
}

/// What one inbound frame amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// A complete reassembled message.
    Message(Vec<u8>),
    /// More blocks pending.
    Partial,
    /// A reserved 1-byte control frame.
    Control(u8),
}

/// Incremental reassembler for inbound block frames.
#[derive(Debug, Default)]
pub struct Reassembler {
    buf: Vec<u8>,
    expected: Option<u8>,
}

impl Reassembler {
    /// Fresh reassembler with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame.
    ///
    /// A counter that breaks the decreasing chain discards the partial
    /// buffer and starts a new message from the offending frame.
    pub fn feed(&mut self, frame: &[u8]) -> Result<FrameEvent> {
        if frame.is_empty() {
            return Err(Error::bad_message("empty BLE frame"));
        }
        if frame.len() == 1 {
            return match frame[0] {
                CTRL_OFF | CTRL_PING => Ok(FrameEvent::Control(frame[0])),
                other => Err(Error::bad_message(format!(
                    "reserved frame byte 0x{other:02x}"
                ))),
            };
        }

        let counter = frame[0];
        match self.expected {
            Some(expected) if counter != expected => {
                log::debug!(
                    "[ble] block counter {counter} broke chain (expected {expected}), resetting"
                );
                self.buf.clear();
            }
            _ => {}
        }

        self.buf.extend_from_slice(&frame[1..]);
        if counter == 0 {
            self.expected = None;
            return Ok(FrameEvent::Message(std::mem::take(&mut self.buf)));
        }
        self.expected = Some(counter - 1);
        Ok(FrameEvent::Partial)
    }

    /// Discard any partial message (connection loss).
    pub fn reset(&mut self) {
        self.buf.clear();
        self.expected = None;
    }

    /// Whether a partial message is buffered.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

/// Platform radio backing one BLE connection.
///
/// A backend advertises [`SERVICE_UUID`], negotiates the MTU, and moves raw
/// characteristic frames. Everything protocol-shaped stays here.
#[async_trait]
pub trait BleLink: Send + Sync {
    /// Negotiated MTU for the active connection.
    fn mtu(&self) -> usize;

    /// Whether a central is currently connected.
    fn connected(&self) -> bool;

    /// Write one frame to the characteristic (indicate/notify).
    async fn write(&self, frame: &[u8]) -> Result<()>;

    /// Next inbound frame (write-with-response from the central).
    ///
    /// Errors signal connection loss; the caller discards partial state.
    async fn read(&self) -> Result<Vec<u8>>;
}

/// [`Transport`] over any [`BleLink`].
pub struct BleTransport<L: BleLink> {
    link: L,
    reassembler: Mutex<Reassembler>,
}

impl<L: BleLink> BleTransport<L> {
    /// Wrap a link.
    pub fn new(link: L) -> Self {
        Self {
            link,
            reassembler: Mutex::new(Reassembler::new()),
        }
    }
}

impl<L: BleLink> std::fmt::Debug for BleTransport<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleTransport")
            .field("mtu", &self.link.mtu())
            .field("connected", &self.link.connected())
            .finish()
    }
}

#[async_trait]
impl<L: BleLink> Transport for BleTransport<L> {
    fn name(&self) -> &'static str {
        "ble"
    }

    fn available(&self) -> bool {
        self.link.connected()
    }

    async fn publish(&self, payload: String) -> Result<()> {
        if !self.link.connected() {
            return Err(Error::Transport("BLE not connected".into()));
        }
        for frame in split(payload.as_bytes(), self.link.mtu())? {
            self.link.write(&frame).await?;
        }
        Ok(())
    }

    async fn receive(&self) -> Result<Vec<String>> {
        let mut reassembler = self.reassembler.lock().await;
        loop {
            let frame = match self.link.read().await {
                Ok(frame) => frame,
                Err(e) => {
                    // Connection loss aborts the partial message.
                    reassembler.reset();
                    return Err(e);
                }
            };
            match reassembler.feed(&frame) {
                Ok(FrameEvent::Message(message)) => {
                    let payload = String::from_utf8(message)
                        .map_err(|_| Error::bad_message("BLE payload is not UTF-8 base64"))?;
                    return Ok(vec![payload]);
                }
                Ok(FrameEvent::Partial) => continue,
                Ok(FrameEvent::Control(CTRL_PING)) => {
                    // Pong; failures here are connection-level and will
                    // surface on the next read.
                    let _ = self.link.write(&[CTRL_PING]).await;
                }
                Ok(FrameEvent::Control(_)) => {
                    // Peripheral going off; nothing pending.
                    reassembler.reset();
                    return Ok(Vec::new());
                }
                Err(e) => {
                    log::debug!("[ble] dropping malformed frame: {e}");
                }
            }
        }
    }
}
