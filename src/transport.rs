//! Framed message transport underneath the mux socket.
//!
//! The mux protocol needs a reliable, ordered, message-oriented byte
//! carrier. This module fronts any such carrier with a pair of channels:
//! outbound frames go through a [`TransportSender`], inbound traffic
//! arrives as [`TransportEvent`]s. The production carrier is a WebSocket
//! ([`Transport::connect`]); tests and embedded setups use the in-memory
//! [`Transport::pair`].
//!
//! The WebSocket bridge spawns a writer task draining the outbound channel
//! into binary messages and a reader task forwarding binary/text messages,
//! close frames, and errors into the event channel. Once either task
//! observes the carrier going away, the event channel ends.

use crate::error::{MirrorError, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace};

/// Close code used when no specific code applies.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code for protocol errors (paired with a goaway frame).
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// Inbound traffic from the carrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One complete message (one mux frame, or one JSON envelope on the
    /// legacy path).
    Message(Vec<u8>),
    /// The peer closed the carrier.
    Closed { code: u16, reason: String },
    /// The carrier failed.
    Error(String),
}

/// Outbound instruction to the carrier bridge.
#[derive(Debug)]
enum TransportCommand {
    Send(Vec<u8>),
    Close(u16),
}

/// Cheap-to-clone handle for writing to the carrier.
#[derive(Debug, Clone)]
pub struct TransportSender {
    tx: mpsc::UnboundedSender<TransportCommand>,
}

impl TransportSender {
    /// Enqueue one message. Fails if the carrier is gone.
    pub fn send(&self, bytes: Vec<u8>) -> Result<()> {
        self.tx
            .send(TransportCommand::Send(bytes))
            .map_err(|_| MirrorError::transport("send", "carrier closed"))
    }

    /// Close the carrier with the given close code.
    ///
    /// Idempotent: closing an already-closed carrier is a no-op.
    pub fn close(&self, code: u16) {
        let _ = self.tx.send(TransportCommand::Close(code));
    }

    /// Whether the carrier bridge has terminated.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// An open message transport: a sender half and an event stream.
pub struct Transport {
    sender: TransportSender,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Transport {
    /// Open a WebSocket carrier.
    ///
    /// Resolves once the handshake completes; any close, error, or refusal
    /// before that rejects the connect.
    pub async fn connect(uri: &str) -> Result<Transport> {
        let (ws, _response) = tokio_tungstenite::connect_async(uri)
            .await
            .map_err(|e| MirrorError::transport("connect", e))?;
        debug!(uri = %uri, "WebSocket carrier open");

        let (mut sink, mut stream) = ws.split();
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let (evt_tx, evt_rx) = mpsc::unbounded_channel();

        // Writer: drain the outbound channel into binary messages.
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    TransportCommand::Send(bytes) => {
                        if sink.send(Message::Binary(bytes.into())).await.is_err() {
                            break;
                        }
                    }
                    TransportCommand::Close(code) => {
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::from(code),
                                reason: "".into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
        });

        // Reader: forward carrier traffic into the event channel.
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        if evt_tx.send(TransportEvent::Message(bytes)).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Text(text)) => {
                        if evt_tx
                            .send(TransportEvent::Message(text.into_bytes()))
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = match frame {
                            Some(f) => (u16::from(f.code), f.reason.to_string()),
                            None => (CLOSE_NORMAL, String::new()),
                        };
                        let _ = evt_tx.send(TransportEvent::Closed { code, reason });
                        break;
                    }
                    Ok(_) => {} // ping/pong handled by the protocol layer
                    Err(e) => {
                        let _ = evt_tx.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
        });

        Ok(Transport {
            sender: TransportSender { tx: cmd_tx },
            events: evt_rx,
        })
    }

    /// Cross-wired in-memory pair: everything sent on one side arrives as
    /// an event on the other. Used by tests and the integration harness.
    pub fn pair() -> (Transport, Transport) {
        let (a_cmd_tx, a_cmd_rx) = mpsc::unbounded_channel();
        let (a_evt_tx, a_evt_rx) = mpsc::unbounded_channel();
        let (b_cmd_tx, b_cmd_rx) = mpsc::unbounded_channel();
        let (b_evt_tx, b_evt_rx) = mpsc::unbounded_channel();

        tokio::spawn(pump(a_cmd_rx, b_evt_tx));
        tokio::spawn(pump(b_cmd_rx, a_evt_tx));

        (
            Transport {
                sender: TransportSender { tx: a_cmd_tx },
                events: a_evt_rx,
            },
            Transport {
                sender: TransportSender { tx: b_cmd_tx },
                events: b_evt_rx,
            },
        )
    }

    /// Clone the sender half.
    pub fn sender(&self) -> TransportSender {
        self.sender.clone()
    }

    /// Split into the sender half and the raw event receiver.
    pub fn split(self) -> (TransportSender, mpsc::UnboundedReceiver<TransportEvent>) {
        (self.sender, self.events)
    }

    /// Enqueue one message.
    pub fn send(&self, bytes: Vec<u8>) -> Result<()> {
        self.sender.send(bytes)
    }

    /// Close the carrier.
    pub fn close(&self, code: u16) {
        self.sender.close(code)
    }

    /// Receive the next event. `None` once the carrier is fully torn down.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }
}

/// Forward one side's commands to the other side's events.
async fn pump(
    mut cmd_rx: mpsc::UnboundedReceiver<TransportCommand>,
    evt_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            TransportCommand::Send(bytes) => {
                trace!(len = bytes.len(), "in-memory transport message");
                if evt_tx.send(TransportEvent::Message(bytes)).is_err() {
                    return;
                }
            }
            TransportCommand::Close(code) => {
                let _ = evt_tx.send(TransportEvent::Closed {
                    code,
                    reason: String::new(),
                });
                return;
            }
        }
    }
    // Sender dropped without an explicit close.
    let _ = evt_tx.send(TransportEvent::Closed {
        code: CLOSE_NORMAL,
        reason: String::new(),
    });
}
