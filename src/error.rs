// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the mirror engine.
//!
//! This module defines the error types used throughout the mirror engine.
//! Errors are categorized by their source (transport, protocol, engine, etc.)
//! and include context to help with debugging.
//!
//! # Error Categories
//!
//! | Error Type | Fatal | Description |
//! |------------|-------|-------------|
//! | `Transport` | No | Carrier closed, send failed, connect refused |
//! | `Protocol` | Yes | Peer violated the mux protocol (auth from server, malformed frame) |
//! | `Frame` | Yes | Frame codec failure on a recognized frame type |
//! | `Auth` | Yes | Auth frame construction failed (key length, date shape) |
//! | `NotConnected` | No | Operation before the session was established |
//! | `ConnectionClosing` | No | Operation while the socket is shutting down |
//! | `StreamClosed` | No | Send on a stream past its send-side close |
//! | `Engine` | No | Local SQL engine command failed |
//! | `Envelope` | No | JSON envelope encode/decode failure |
//! | `InvalidState` | Yes | State machine violation (caller bug) |
//! | `Shutdown` | No | Coordinator is shutting down |
//! | `Internal` | Yes | Unexpected internal error |
//!
//! # Propagation Policy
//!
//! Errors on a single stream never tear down the mux socket; errors on the
//! mux socket fan out to every stream. Fatal errors (see
//! [`MirrorError::is_fatal()`]) cause the socket to emit a goaway frame and
//! close the carrier with code 1002.

use crate::frame::FrameError;
use thiserror::Error;

/// Result type alias for mirror engine operations.
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Errors that can occur in the mux transport and replication coordinator.
///
/// Each variant includes context about where the error occurred.
/// Use [`is_fatal()`](Self::is_fatal) to check whether the error poisons
/// the whole connection.
#[derive(Error, Debug)]
pub enum MirrorError {
    /// Carrier-level failure (connect refused, send on closed carrier).
    ///
    /// Before auth is sent this rejects the connect; afterwards it
    /// propagates as stream errors and closes the socket.
    #[error("Transport error ({operation}): {message}")]
    Transport { operation: String, message: String },

    /// The peer violated the mux protocol.
    ///
    /// Covers an auth frame arriving from the server and malformed frames
    /// with a recognized type tag. Fatal: goaway is emitted and the carrier
    /// closed with code 1002.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Frame codec failure.
    ///
    /// Unrecognized type tags never surface here (the dispatcher discards
    /// them); this is reserved for malformed frames and id overflow.
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Auth frame construction failed.
    ///
    /// The access key must encode to exactly 20 UTF-8 bytes and the
    /// ISO-8601 date must be 24 or 27 characters. Fatal at the auth step;
    /// the connect fails.
    #[error("Auth error: {0}")]
    Auth(String),

    /// Operation attempted before the session was established.
    #[error("connection not established")]
    NotConnected,

    /// Operation attempted while the socket is shutting down.
    #[error("connection closing")]
    ConnectionClosing,

    /// Send on a stream whose send side is already closed.
    ///
    /// Never poisons the socket.
    #[error("stream closed")]
    StreamClosed,

    /// Local SQL engine command failed.
    ///
    /// The coordinator logs and continues where possible; the stream that
    /// produced the input is not torn down.
    #[error("Engine error: {0}")]
    Engine(String),

    /// JSON envelope encode/decode failure.
    #[error("Envelope error: {0}")]
    Envelope(#[from] serde_json::Error),

    /// State machine violation.
    ///
    /// Occurs when an operation is attempted in the wrong state
    /// (e.g., re-subscribing a table that was never mirrored).
    /// Indicates a bug in the caller.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MirrorError {
    /// Create a transport error with operation context.
    pub fn transport(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Check if this error poisons the whole connection.
    ///
    /// Fatal errors cause a goaway frame and carrier close with code 1002.
    /// Non-fatal errors are surfaced to the caller (or a single stream)
    /// and leave the socket usable.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Protocol(_) => true,
            Self::Frame(e) => !matches!(e, FrameError::UnrecognizedType(_)),
            Self::Auth(_) => true,
            Self::InvalidState { .. } => true,
            Self::Internal(_) => true,
            Self::Transport { .. } => false,
            Self::NotConnected => false,
            Self::ConnectionClosing => false,
            Self::StreamClosed => false,
            Self::Engine(_) => false,
            Self::Envelope(_) => false,
            Self::Shutdown => false,
        }
    }
}
