// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-stream state machine and the user-facing stream handle.
//!
//! Each logical stream moves through four states with half-close
//! semantics:
//!
//! ```text
//!              peer close                    our close
//!   Open ──────────────────► CloseWait ─────────────────► Closed
//!    │                                                       ▲
//!    │ our close                             peer close      │
//!    └──────────────────────► Closing ───────────────────────┘
//! ```
//!
//! `CloseWait` means the peer closed its send side but we may still send;
//! our own send-side close completes the shutdown. A reset from either
//! side jumps straight to `Closed`.
//!
//! Events reach the user through a per-stream channel rather than
//! callbacks: delivery is serial, re-entrancy is impossible, and the
//! receiver composes with `select!` loops.

use crate::envelope::Request;
use crate::error::Result;
use crate::socket::SocketShared;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Stream lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Both sides open.
    Open,
    /// We closed our send side; awaiting the peer's close.
    Closing,
    /// The peer closed its send side; we may still send.
    CloseWait,
    /// Fully closed; the socket no longer tracks the stream.
    Closed,
}

/// Event delivered to the stream's owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Payload from the peer.
    Data(Vec<u8>),
    /// The peer closed its send side (or the socket shut down gracefully).
    Closed,
    /// The stream was reset or the socket failed.
    Error { code: u32, msg: String },
}

/// Whether the socket should drop the table entry after an ingress close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseOutcome {
    Retain,
    Remove,
}

/// Decision for a local (egress) close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseAction {
    /// Emit a close frame, keep the table entry (awaiting peer close).
    EmitRetain,
    /// Emit a close frame, drop the table entry.
    EmitRemove,
    /// Idempotent no-op.
    Ignore,
}

/// Decision for a local (egress) error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorAction {
    /// Emit a reset frame, drop the table entry.
    EmitRemove,
    /// Drop the table entry without a frame (our close frame is already
    /// in flight).
    SilentRemove,
    /// No-op: already closed.
    Ignore,
}

/// Socket-side record of one active stream.
pub(crate) struct StreamEntry {
    state: StreamState,
    events: mpsc::UnboundedSender<StreamEvent>,
}

impl StreamEntry {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                state: StreamState::Open,
                events: tx,
            },
            rx,
        )
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> StreamState {
        self.state
    }

    /// Sends are valid while our send side is open.
    pub(crate) fn can_send(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::CloseWait)
    }

    /// Local close.
    pub(crate) fn egress_close(&mut self) -> CloseAction {
        match self.state {
            StreamState::Open => {
                self.state = StreamState::Closing;
                CloseAction::EmitRetain
            }
            StreamState::CloseWait => {
                self.state = StreamState::Closed;
                CloseAction::EmitRemove
            }
            StreamState::Closing | StreamState::Closed => CloseAction::Ignore,
        }
    }

    /// Local error.
    pub(crate) fn egress_error(&mut self) -> ErrorAction {
        match self.state {
            StreamState::Open | StreamState::CloseWait => {
                self.state = StreamState::Closed;
                ErrorAction::EmitRemove
            }
            StreamState::Closing => {
                self.state = StreamState::Closed;
                ErrorAction::SilentRemove
            }
            StreamState::Closed => ErrorAction::Ignore,
        }
    }

    /// Ingress payload. Delivered while the peer's send side is open;
    /// ignored once the peer has closed (late frames after our reset).
    pub(crate) fn on_data(&self, payload: Vec<u8>) {
        if matches!(self.state, StreamState::Open | StreamState::Closing) {
            let _ = self.events.send(StreamEvent::Data(payload));
        }
    }

    /// Ingress close. Returns whether the socket may drop the entry.
    pub(crate) fn on_close(&mut self) -> CloseOutcome {
        match self.state {
            StreamState::Open => {
                self.state = StreamState::CloseWait;
                let _ = self.events.send(StreamEvent::Closed);
                CloseOutcome::Retain
            }
            StreamState::Closing => {
                self.state = StreamState::Closed;
                let _ = self.events.send(StreamEvent::Closed);
                CloseOutcome::Remove
            }
            // Duplicate close from the peer.
            StreamState::CloseWait => CloseOutcome::Retain,
            // Idempotent cleanup.
            StreamState::Closed => CloseOutcome::Remove,
        }
    }

    /// Ingress reset or socket-level failure.
    pub(crate) fn on_error(&mut self, code: u32, msg: &str) {
        if self.state != StreamState::Closed {
            self.state = StreamState::Closed;
            let _ = self.events.send(StreamEvent::Error {
                code,
                msg: msg.to_string(),
            });
        }
    }
}

/// User-facing handle for one logical stream.
///
/// Obtained from [`MuxedSocket::open_stream`](crate::socket::MuxedSocket::open_stream)
/// (client-initiated) or [`MuxedSocket::accept`](crate::socket::MuxedSocket::accept)
/// (server-initiated).
pub struct Stream {
    id: u32,
    shared: Arc<SocketShared>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
}

impl Stream {
    pub(crate) fn new(
        id: u32,
        shared: Arc<SocketShared>,
        events: mpsc::UnboundedReceiver<StreamEvent>,
    ) -> Self {
        Self { id, shared, events }
    }

    /// The 24-bit stream id. Client streams are odd, server streams even.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Send payload bytes.
    ///
    /// Valid while our send side is open (`Open` or `CloseWait`). Returns
    /// [`StreamClosed`](crate::MirrorError::StreamClosed) afterwards; the
    /// socket is never poisoned.
    pub async fn send(&self, payload: Vec<u8>) -> Result<()> {
        self.shared.stream_send(self.id, payload).await
    }

    /// Send a JSON request envelope.
    pub async fn send_request(&self, request: &Request) -> Result<()> {
        self.send(request.to_bytes()?).await
    }

    /// Close our send side. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.shared.stream_close(self.id).await
    }

    /// Reset the stream with an error. Idempotent once closed.
    pub async fn error(&self, code: u32, msg: &str) -> Result<()> {
        self.shared.stream_error(self.id, code, msg).await
    }

    /// Receive the next event. `None` after `Closed`/`Error` has been
    /// consumed and the socket dropped its side of the channel.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Non-blocking receive, for callers polling between other work.
    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.events.try_recv().ok()
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_starts_open() {
        let (entry, _rx) = StreamEntry::new();
        assert_eq!(entry.state(), StreamState::Open);
        assert!(entry.can_send());
    }

    #[test]
    fn test_egress_close_from_open_retains() {
        let (mut entry, _rx) = StreamEntry::new();
        assert_eq!(entry.egress_close(), CloseAction::EmitRetain);
        assert_eq!(entry.state(), StreamState::Closing);
        assert!(!entry.can_send());
        // Second close is idempotent.
        assert_eq!(entry.egress_close(), CloseAction::Ignore);
    }

    #[test]
    fn test_egress_close_from_close_wait_removes() {
        let (mut entry, _rx) = StreamEntry::new();
        assert_eq!(entry.on_close(), CloseOutcome::Retain);
        assert_eq!(entry.state(), StreamState::CloseWait);
        assert!(entry.can_send()); // half-close: we may still send
        assert_eq!(entry.egress_close(), CloseAction::EmitRemove);
        assert_eq!(entry.state(), StreamState::Closed);
    }

    #[test]
    fn test_egress_error_actions() {
        let (mut entry, _rx) = StreamEntry::new();
        assert_eq!(entry.egress_error(), ErrorAction::EmitRemove);
        assert_eq!(entry.state(), StreamState::Closed);
        assert_eq!(entry.egress_error(), ErrorAction::Ignore);

        // From Closing the reset is silent: our close frame already went out.
        let (mut entry, _rx) = StreamEntry::new();
        entry.egress_close();
        assert_eq!(entry.egress_error(), ErrorAction::SilentRemove);
    }

    #[test]
    fn test_ingress_close_transitions() {
        // Open → CloseWait, not removable.
        let (mut entry, mut rx) = StreamEntry::new();
        assert_eq!(entry.on_close(), CloseOutcome::Retain);
        assert_eq!(rx.try_recv().unwrap(), StreamEvent::Closed);

        // Duplicate close ignored, no second event.
        assert_eq!(entry.on_close(), CloseOutcome::Retain);
        assert!(rx.try_recv().is_err());

        // Closing → Closed, removable.
        let (mut entry, mut rx) = StreamEntry::new();
        entry.egress_close();
        assert_eq!(entry.on_close(), CloseOutcome::Remove);
        assert_eq!(rx.try_recv().unwrap(), StreamEvent::Closed);

        // Closed → removable, idempotent cleanup without an event.
        assert_eq!(entry.on_close(), CloseOutcome::Remove);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_ingress_data_delivery() {
        let (entry, mut rx) = StreamEntry::new();
        entry.on_data(vec![1, 2]);
        assert_eq!(rx.try_recv().unwrap(), StreamEvent::Data(vec![1, 2]));

        // Still delivered while Closing (we closed, peer has not).
        let (mut entry, mut rx) = StreamEntry::new();
        entry.egress_close();
        entry.on_data(vec![3]);
        assert_eq!(rx.try_recv().unwrap(), StreamEvent::Data(vec![3]));

        // Ignored in CloseWait: the peer already closed its send side.
        let (mut entry, mut rx) = StreamEntry::new();
        entry.on_close();
        let _ = rx.try_recv();
        entry.on_data(vec![4]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_ingress_error_fires_once() {
        let (mut entry, mut rx) = StreamEntry::new();
        entry.on_error(7, "boom");
        assert_eq!(
            rx.try_recv().unwrap(),
            StreamEvent::Error {
                code: 7,
                msg: "boom".to_string()
            }
        );
        entry.on_error(8, "again");
        assert!(rx.try_recv().is_err());
        assert_eq!(entry.state(), StreamState::Closed);
    }

    #[test]
    fn test_ingress_error_from_any_live_state() {
        for setup in 0..3 {
            let (mut entry, mut rx) = StreamEntry::new();
            match setup {
                1 => {
                    entry.egress_close();
                }
                2 => {
                    entry.on_close();
                    let _ = rx.try_recv();
                }
                _ => {}
            }
            entry.on_error(0, "socket failed");
            assert_eq!(entry.state(), StreamState::Closed);
            assert!(matches!(
                rx.try_recv().unwrap(),
                StreamEvent::Error { code: 0, .. }
            ));
        }
    }
}
