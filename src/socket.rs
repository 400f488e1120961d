// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Multiplexed socket: many logical streams over one framed carrier.
//!
//! A `MuxedSocket` owns one [`Transport`], authenticates the session with
//! a signed auth frame, and multiplexes independent bidirectional byte
//! streams over it. Client-initiated streams carry odd ids allocated from
//! 1 upward; server-initiated streams carry even ids accepted strictly
//! above a monotone watermark.
//!
//! # Connection Lifecycle
//!
//! ```text
//!  Idle ──auth frame──► AuthSent ──close_socket──► Closing ──peer close──► Closed
//!                          │                                                 ▲
//!                          │ peer close                  close_socket /      │
//!                          └────────────► CloseWait ──────error──────────────┘
//! ```
//!
//! `error_socket` jumps to `Closed` from any state, emitting a goaway
//! frame with the largest stream id this side considers valid before
//! closing the carrier with code 1002.
//!
//! # Dispatch
//!
//! A single dispatch task drains the carrier's event stream; every state
//! transition runs inside one short critical section, so per-object event
//! order matches arrival order and no callback re-entrancy is possible.
//! Unrecognized frame types are dropped silently; malformed frames with a
//! known type are protocol violations and fatal.

use crate::auth::{build_auth_frame, Credentials};
use crate::config::SocketConfig;
use crate::error::{MirrorError, Result};
use crate::frame::{Frame, FrameError, MAX_STREAM_ID};
use crate::metrics;
use crate::stream::{CloseAction, CloseOutcome, ErrorAction, Stream, StreamEntry};
use crate::transport::{Transport, TransportEvent, TransportSender, CLOSE_NORMAL, CLOSE_PROTOCOL_ERROR};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, trace, warn};

/// Socket connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Transport open, auth frame not yet sent.
    Idle,
    /// Auth frame sent; streams may be opened and accepted.
    AuthSent,
    /// Local graceful shutdown in progress, awaiting the peer's close.
    Closing,
    /// The peer closed the carrier; local shutdown still outstanding.
    CloseWait,
    /// Fully shut down.
    Closed,
}

impl SocketState {
    /// Label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketState::Idle => "idle",
            SocketState::AuthSent => "auth_sent",
            SocketState::Closing => "closing",
            SocketState::CloseWait => "close_wait",
            SocketState::Closed => "closed",
        }
    }
}

/// Mutable socket state, guarded by one mutex.
struct MuxInner {
    state: SocketState,
    /// Next client-assigned stream id. Odd, starts at 1, advances by 2.
    next_stream: u32,
    /// Highest even id ever accepted from the server.
    server_stream_watermark: u32,
    /// Exactly the streams in Open, Closing, or CloseWait.
    active: HashMap<u32, StreamEntry>,
    transport: TransportSender,
}

/// Shared core of a mux socket, referenced by every [`Stream`] handle.
pub struct SocketShared {
    inner: Mutex<MuxInner>,
    state_tx: watch::Sender<SocketState>,
    config: SocketConfig,
}

/// A multiplexed client socket over one framed carrier.
pub struct MuxedSocket {
    shared: Arc<SocketShared>,
    accept_rx: Mutex<mpsc::UnboundedReceiver<Stream>>,
    state_rx: watch::Receiver<SocketState>,
}

impl MuxedSocket {
    /// Open a WebSocket carrier, authenticate, and start dispatch.
    ///
    /// Any transport close or error before the carrier is open rejects
    /// the connect.
    pub async fn connect(
        uri: &str,
        creds: &Credentials,
        config: SocketConfig,
    ) -> Result<MuxedSocket> {
        let transport = Transport::connect(uri).await?;
        Self::with_transport(transport, creds, config)
    }

    /// Wrap an already-open carrier: emit the auth frame and start dispatch.
    pub fn with_transport(
        transport: Transport,
        creds: &Credentials,
        config: SocketConfig,
    ) -> Result<MuxedSocket> {
        let auth = build_auth_frame(creds)?;
        let (sender, events) = transport.split();
        let (state_tx, state_rx) = watch::channel(SocketState::Idle);

        // Idle → AuthSent happens on the auth frame leaving this side.
        let auth_bytes = Frame::Auth(auth).encode().map_err(MirrorError::Frame)?;
        sender.send(auth_bytes)?;
        metrics::record_frame_sent("auth");
        let _ = state_tx.send(SocketState::AuthSent);
        metrics::set_socket_state("auth_sent");
        debug!("auth frame sent, session established");

        let shared = Arc::new(SocketShared {
            inner: Mutex::new(MuxInner {
                state: SocketState::AuthSent,
                next_stream: 1,
                server_stream_watermark: 0,
                active: HashMap::new(),
                transport: sender,
            }),
            state_tx,
            config,
        });

        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_dispatch(Arc::clone(&shared), events, accept_tx));

        Ok(MuxedSocket {
            shared,
            accept_rx: Mutex::new(accept_rx),
            state_rx,
        })
    }

    /// Open a new client-initiated stream.
    ///
    /// Valid only while the session is established (`AuthSent`).
    pub async fn open_stream(&self) -> Result<Stream> {
        SocketShared::open_stream(&self.shared).await
    }

    /// Receive the next server-initiated stream.
    ///
    /// Its first event is the data payload that announced it. Returns
    /// `None` once the socket is closed.
    pub async fn accept(&self) -> Option<Stream> {
        self.accept_rx.lock().await.recv().await
    }

    /// Graceful local shutdown: close every active stream, then the carrier.
    pub async fn close_socket(&self) {
        self.shared.close_socket().await
    }

    /// Abrupt shutdown: error every active stream, emit a goaway frame,
    /// close the carrier with code 1002.
    pub async fn error_socket(&self, code: u32, msg: &str) {
        self.shared.error_socket(code, msg).await
    }

    /// Current connection state.
    pub fn state(&self) -> SocketState {
        *self.state_rx.borrow()
    }

    /// Watch connection state changes.
    pub fn state_receiver(&self) -> watch::Receiver<SocketState> {
        self.state_rx.clone()
    }
}

impl SocketShared {
    fn set_state(&self, inner: &mut MuxInner, state: SocketState) {
        inner.state = state;
        let _ = self.state_tx.send(state);
        metrics::set_socket_state(state.as_str());
    }

    fn send_frame(&self, inner: &MuxInner, frame: Frame) -> Result<()> {
        let bytes = frame.encode().map_err(MirrorError::Frame)?;
        metrics::record_frame_sent(frame.kind());
        inner.transport.send(bytes)
    }

    async fn open_stream(shared: &Arc<SocketShared>) -> Result<Stream> {
        let mut inner = shared.inner.lock().await;
        match inner.state {
            SocketState::AuthSent => {
                let id = inner.next_stream;
                if id > MAX_STREAM_ID {
                    return Err(MirrorError::Frame(FrameError::StreamIdOverflow(id)));
                }
                inner.next_stream += 2;
                let (entry, events) = StreamEntry::new();
                inner.active.insert(id, entry);
                metrics::record_stream_opened("client");
                trace!(stream = id, "opened client stream");
                Ok(Stream::new(id, Arc::clone(shared), events))
            }
            SocketState::Closing | SocketState::CloseWait => Err(MirrorError::ConnectionClosing),
            SocketState::Idle | SocketState::Closed => Err(MirrorError::NotConnected),
        }
    }

    pub(crate) async fn stream_send(&self, id: u32, payload: Vec<u8>) -> Result<()> {
        let inner = self.inner.lock().await;
        match inner.active.get(&id) {
            Some(entry) if entry.can_send() => {
                self.send_frame(&inner, Frame::Data { stream: id, payload })
            }
            _ => Err(MirrorError::StreamClosed),
        }
    }

    pub(crate) async fn stream_close(&self, id: u32) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let action = match inner.active.get_mut(&id) {
            Some(entry) => entry.egress_close(),
            None => return Ok(()),
        };
        match action {
            CloseAction::EmitRetain => self.send_frame(&inner, Frame::Close { stream: id }),
            CloseAction::EmitRemove => {
                let result = self.send_frame(&inner, Frame::Close { stream: id });
                inner.active.remove(&id);
                result
            }
            CloseAction::Ignore => Ok(()),
        }
    }

    pub(crate) async fn stream_error(&self, id: u32, code: u32, msg: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let action = match inner.active.get_mut(&id) {
            Some(entry) => entry.egress_error(),
            None => return Ok(()),
        };
        match action {
            ErrorAction::EmitRemove => {
                let result = self.send_frame(
                    &inner,
                    Frame::Reset {
                        stream: id,
                        error_code: code,
                        msg: msg.to_string(),
                    },
                );
                inner.active.remove(&id);
                result
            }
            ErrorAction::SilentRemove => {
                inner.active.remove(&id);
                Ok(())
            }
            ErrorAction::Ignore => Ok(()),
        }
    }

    async fn close_socket(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            SocketState::Idle => {
                inner.active.clear();
                self.set_state(&mut inner, SocketState::Closed);
                inner.transport.close(CLOSE_NORMAL);
            }
            SocketState::AuthSent => {
                self.close_all_streams(&mut inner);
                self.set_state(&mut inner, SocketState::Closing);
                inner.transport.close(CLOSE_NORMAL);
            }
            SocketState::CloseWait => {
                self.close_all_streams(&mut inner);
                inner.active.clear();
                self.set_state(&mut inner, SocketState::Closed);
                inner.transport.close(CLOSE_NORMAL);
            }
            SocketState::Closing | SocketState::Closed => {}
        }
    }

    /// Send-side close for every active stream.
    fn close_all_streams(&self, inner: &mut MuxInner) {
        let ids: Vec<u32> = inner.active.keys().copied().collect();
        for id in ids {
            let action = match inner.active.get_mut(&id) {
                Some(entry) => entry.egress_close(),
                None => continue,
            };
            match action {
                CloseAction::EmitRetain => {
                    let _ = self.send_frame(inner, Frame::Close { stream: id });
                }
                CloseAction::EmitRemove => {
                    let _ = self.send_frame(inner, Frame::Close { stream: id });
                    inner.active.remove(&id);
                }
                CloseAction::Ignore => {}
            }
        }
    }

    async fn error_socket(&self, code: u32, msg: &str) {
        let mut inner = self.inner.lock().await;
        self.error_socket_locked(&mut inner, code, msg);
    }

    fn error_socket_locked(&self, inner: &mut MuxInner, code: u32, msg: &str) {
        match inner.state {
            SocketState::Idle | SocketState::Closing | SocketState::Closed => {
                inner.active.clear();
                self.set_state(inner, SocketState::Closed);
            }
            SocketState::AuthSent | SocketState::CloseWait => {
                for entry in inner.active.values_mut() {
                    entry.on_error(code, msg);
                }
                inner.active.clear();
                self.set_state(inner, SocketState::Closed);

                // Tell the peer which of its streams may have been lost.
                let last_stream = inner
                    .next_stream
                    .saturating_sub(2)
                    .max(inner.server_stream_watermark);
                let _ = self.send_frame(
                    inner,
                    Frame::Goaway {
                        last_stream,
                        error_code: code,
                        msg: msg.to_string(),
                    },
                );
                inner.transport.close(CLOSE_PROTOCOL_ERROR);
                warn!(code, msg, last_stream, "socket errored, goaway sent");
            }
        }
    }

    /// Socket-level failure from the peer (goaway) or the carrier.
    fn on_socket_error_locked(&self, inner: &mut MuxInner, code: u32, msg: &str) {
        if inner.state == SocketState::Closed {
            return;
        }
        for entry in inner.active.values_mut() {
            entry.on_error(code, msg);
        }
        inner.active.clear();
        self.set_state(inner, SocketState::Closed);
        inner.transport.close(CLOSE_NORMAL);
    }

    async fn on_frame(
        shared: &Arc<SocketShared>,
        bytes: &[u8],
        accept_tx: &mpsc::UnboundedSender<Stream>,
    ) {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(FrameError::UnrecognizedType(tag)) => {
                trace!(tag, "dropping unrecognized frame type");
                metrics::record_frame_dropped("unrecognized_type");
                return;
            }
            Err(e) => {
                // Malformed frame with a known tag: fatal protocol violation.
                let mut inner = shared.inner.lock().await;
                warn!(error = %e, "malformed frame, closing socket");
                shared.error_socket_locked(&mut inner, CLOSE_PROTOCOL_ERROR as u32, &e.to_string());
                return;
            }
        };

        let mut inner = shared.inner.lock().await;
        if !matches!(inner.state, SocketState::AuthSent | SocketState::Closing) {
            trace!(state = inner.state.as_str(), "dropping frame outside session");
            metrics::record_frame_dropped("socket_state");
            return;
        }
        metrics::record_frame_received(frame.kind());

        match frame {
            Frame::Auth(_) => {
                // The server never sends auth.
                warn!("auth frame from server");
                shared.error_socket_locked(
                    &mut inner,
                    CLOSE_PROTOCOL_ERROR as u32,
                    "unexpected auth frame from server",
                );
            }
            Frame::Goaway {
                last_stream,
                error_code,
                msg,
            } => {
                debug!(last_stream, error_code, msg = %msg, "goaway from server");
                shared.on_socket_error_locked(&mut inner, error_code, &msg);
            }
            Frame::Data { stream, payload } => {
                Self::on_data_locked(shared, &mut inner, stream, payload, accept_tx);
            }
            Frame::Close { stream } => {
                let outcome = match inner.active.get_mut(&stream) {
                    Some(entry) => entry.on_close(),
                    None => {
                        trace!(stream, "close for unknown stream");
                        return;
                    }
                };
                if outcome == CloseOutcome::Remove {
                    inner.active.remove(&stream);
                    metrics::record_stream_closed();
                }
            }
            Frame::Reset {
                stream,
                error_code,
                msg,
            } => {
                if let Some(entry) = inner.active.get_mut(&stream) {
                    entry.on_error(error_code, &msg);
                    metrics::record_stream_closed();
                }
                inner.active.remove(&stream);
            }
        }
    }

    fn on_data_locked(
        shared: &Arc<SocketShared>,
        inner: &mut MuxInner,
        stream: u32,
        payload: Vec<u8>,
        accept_tx: &mpsc::UnboundedSender<Stream>,
    ) {
        if let Some(entry) = inner.active.get(&stream) {
            entry.on_data(payload);
            return;
        }

        // New server-initiated stream: even id strictly above the watermark,
        // session fully established.
        if stream % 2 == 0
            && stream > inner.server_stream_watermark
            && inner.state == SocketState::AuthSent
        {
            inner.server_stream_watermark = stream;
            let (entry, events) = StreamEntry::new();
            entry.on_data(payload);
            inner.active.insert(stream, entry);
            metrics::record_stream_opened("server");
            trace!(stream, "accepted server stream");
            let _ = accept_tx.send(Stream::new(stream, Arc::clone(shared), events));
            return;
        }

        // Odd unknown ids, reused ids, and anything arriving while Closing.
        if inner.state == SocketState::AuthSent && shared.config.reset_unknown_streams {
            let _ = shared.send_frame(
                inner,
                Frame::Reset {
                    stream,
                    error_code: 0,
                    msg: "unknown stream".to_string(),
                },
            );
        }
        trace!(stream, "dropping data for unknown stream");
        metrics::record_frame_dropped("unknown_stream");
    }

    async fn on_transport_close(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            SocketState::Idle | SocketState::AuthSent => {
                self.propagate_close(&mut inner);
                self.set_state(&mut inner, SocketState::CloseWait);
                debug!("carrier closed by peer, socket in close-wait");
            }
            SocketState::Closing => {
                self.propagate_close(&mut inner);
                inner.active.clear();
                self.set_state(&mut inner, SocketState::Closed);
                debug!("carrier closed, shutdown complete");
            }
            SocketState::CloseWait | SocketState::Closed => {}
        }
    }

    fn propagate_close(&self, inner: &mut MuxInner) {
        let ids: Vec<u32> = inner.active.keys().copied().collect();
        for id in ids {
            let outcome = match inner.active.get_mut(&id) {
                Some(entry) => entry.on_close(),
                None => continue,
            };
            if outcome == CloseOutcome::Remove {
                inner.active.remove(&id);
            }
        }
    }

    async fn on_transport_error(&self, msg: &str) {
        let mut inner = self.inner.lock().await;
        if inner.state == SocketState::Closed {
            return;
        }
        warn!(error = %msg, "carrier failed");
        self.on_socket_error_locked(&mut inner, 0, msg);
    }

    #[cfg(test)]
    async fn snapshot(&self) -> (SocketState, u32, u32, Vec<u32>) {
        let inner = self.inner.lock().await;
        let mut ids: Vec<u32> = inner.active.keys().copied().collect();
        ids.sort_unstable();
        (
            inner.state,
            inner.next_stream,
            inner.server_stream_watermark,
            ids,
        )
    }
}

/// Drain the carrier's events into the socket state machine.
async fn run_dispatch(
    shared: Arc<SocketShared>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    accept_tx: mpsc::UnboundedSender<Stream>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message(bytes) => {
                SocketShared::on_frame(&shared, &bytes, &accept_tx).await
            }
            TransportEvent::Closed { code, reason } => {
                trace!(code, reason = %reason, "carrier close event");
                shared.on_transport_close().await;
            }
            TransportEvent::Error(msg) => shared.on_transport_error(&msg).await,
        }
    }
    // Carrier event stream ended without an explicit close.
    shared.on_transport_close().await;
}
