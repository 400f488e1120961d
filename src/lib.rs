//! # Mirror Engine
//!
//! Client-side stream-multiplexing transport and replication coordinator
//! for synchronizing tables of an embedded SQL engine with a remote server
//! over a single full-duplex message connection.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                           mirror-engine                              │
//! │                                                                      │
//! │  ┌──────────────────┐   ┌────────────────┐   ┌────────────────────┐  │
//! │  │ MirrorCoordinator│──►│  MuxedSocket   │──►│ Transport          │  │
//! │  │ (per-table tails)│   │ (frame mux +   │   │ (WebSocket or      │  │
//! │  │                  │   │  state machine)│   │  in-memory pair)   │  │
//! │  └──────────────────┘   └────────────────┘   └────────────────────┘  │
//! │         │                                                            │
//! │         ▼                                                            │
//! │  ┌──────────────────┐            ┌───────────────────────────────┐   │
//! │  │ WatermarkStore   │            │ ResilientConnection           │   │
//! │  │ (engine metadata)│            │ (stall detect + backoff,      │   │
//! │  └──────────────────┘            │  legacy JSON envelope path)   │   │
//! │                                  └───────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two Replication Paths
//!
//! 1. **Mux path**: one [`MuxedSocket`] multiplexes a server-tail and a
//!    local-tail stream per mirrored table; the coordinator's
//!    [`resubscribe`](coordinator::MirrorCoordinator::resubscribe) hook
//!    re-establishes them after a reconnect.
//! 2. **Legacy path**: a [`ResilientConnection`] carries single JSON
//!    envelopes with built-in stall detection and debounced reconnects.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mirror_engine::{Credentials, MirrorConfig, MirrorCoordinator, MuxedSocket, NoOpEngine};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> mirror_engine::Result<()> {
//!     let creds = Credentials::new(
//!         "ABCDEFGHIJKLMNOPQRST",
//!         b"private-key".to_vec(),
//!         Credentials::generate_device_uuid(),
//!     );
//!     let config = MirrorConfig::default();
//!
//!     let socket = Arc::new(
//!         MuxedSocket::connect("wss://example.org/db", &creds, config.socket.clone()).await?,
//!     );
//!     let engine = Arc::new(NoOpEngine);
//!     let coordinator =
//!         MirrorCoordinator::new(socket, engine, &creds, config.coordinator.clone()).await?;
//!
//!     coordinator.mirror_table("todos").await?;
//!     // Tables now stay in sync until shutdown.
//!     coordinator.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod metrics;
pub mod resilience;
pub mod socket;
pub mod stream;
pub mod transport;
pub mod watermark;

// Re-exports for convenience
pub use auth::Credentials;
pub use config::{CoordinatorConfig, MirrorConfig, ResilienceConfig, SocketConfig};
pub use coordinator::MirrorCoordinator;
pub use engine::{NoOpEngine, SqlEngine};
pub use envelope::{QueryFormat, Request, Response};
pub use error::{MirrorError, Result};
pub use frame::{Frame, FrameError, MAX_STREAM_ID};
pub use resilience::{ResilientConnection, ResilientEvent};
pub use socket::{MuxedSocket, SocketState};
pub use stream::{Stream, StreamEvent, StreamState};
pub use transport::{Transport, TransportEvent};
pub use watermark::WatermarkStore;
