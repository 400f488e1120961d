// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication coordinator.
//!
//! The main orchestrator that ties together:
//! - The mux socket via [`crate::socket::MuxedSocket`]
//! - The local SQL engine via [`crate::engine::SqlEngine`]
//! - Watermark persistence via [`crate::watermark::WatermarkStore`]
//!
//! # Architecture
//!
//! For each mirrored table the coordinator runs two long-lived tails:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      MirrorCoordinator                          │
//! │                                                                 │
//! │  server-tail stream ──► JSON pipe ──► write-csv --source <uid>  │
//! │  (tail since wm)                      (local engine)            │
//! │                                                                 │
//! │  change file ◄── subscribe --ignore-source <uid>                │
//! │       │                                                         │
//! │       └──► pipe requests ──► local-tail stream ──► server       │
//! │                 acks ◄───────────────┘                          │
//! │                  │                                              │
//! │                  └──► skdb__<table>_sync_metadata (watermark)   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The replication uid threads through both directions so the engine
//! never echoes replicated rows back out through the change file.
//!
//! Delivery is at-least-once: after a reconnect the tails resume from the
//! persisted watermark and the local side replays `diff --since` output,
//! so some rows repeat; primary keys and last-writer-wins make the
//! repetition harmless.

mod local_tail;
mod server_tail;

use crate::config::CoordinatorConfig;
use crate::auth::Credentials;
use crate::engine::{argv, SqlEngine};
use crate::envelope::{Request, Response};
use crate::error::{MirrorError, Result};
use crate::metrics;
use crate::socket::MuxedSocket;
use crate::stream::StreamEvent;
use crate::watermark::WatermarkStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Handles for one mirrored table.
struct MirroredTable {
    /// Engine subscription session, used for `diff --since` replay.
    session: String,
    /// Server-tail and local-tail tasks.
    tasks: Vec<JoinHandle<()>>,
}

/// Coordinates bidirectional table replication over a mux socket.
pub struct MirrorCoordinator<E: SqlEngine> {
    socket: RwLock<Arc<MuxedSocket>>,
    engine: Arc<E>,
    watermarks: Arc<WatermarkStore<E>>,
    config: CoordinatorConfig,
    /// Identifies this client's writes for origin filtering.
    replication_uid: String,
    /// Suffix of change file names (`<table>_<access_key>`).
    access_key: String,
    mirrored: Mutex<HashMap<String, MirroredTable>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<E: SqlEngine> MirrorCoordinator<E> {
    /// Create a coordinator over an established socket.
    ///
    /// Fetches the replication uid from the local engine.
    pub async fn new(
        socket: Arc<MuxedSocket>,
        engine: Arc<E>,
        creds: &Credentials,
        config: CoordinatorConfig,
    ) -> Result<Self> {
        let replication_uid = engine
            .run_local(argv(&["uid"]), String::new())
            .await
            .map_err(|e| MirrorError::Engine(e.to_string()))?
            .trim()
            .to_string();
        if replication_uid.is_empty() {
            return Err(MirrorError::Engine("engine returned empty uid".to_string()));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            socket: RwLock::new(socket),
            watermarks: Arc::new(WatermarkStore::new(Arc::clone(&engine))),
            engine,
            config,
            replication_uid,
            access_key: creds.access_key.clone(),
            mirrored: Mutex::new(HashMap::new()),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// This client's replication uid.
    pub fn replication_uid(&self) -> &str {
        &self.replication_uid
    }

    /// Names of currently mirrored tables.
    pub async fn mirrored_tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.mirrored.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// The watermark store (for observation).
    pub fn watermarks(&self) -> &Arc<WatermarkStore<E>> {
        &self.watermarks
    }

    /// Start mirroring a table.
    ///
    /// Bootstraps the local schema if needed, then establishes the
    /// server-tail and local-tail. No-op if the table is already mirrored.
    pub async fn mirror_table(&self, table: &str) -> Result<()> {
        let mut mirrored = self.mirrored.lock().await;
        if mirrored.contains_key(table) {
            debug!(table, "table already mirrored");
            return Ok(());
        }

        self.ensure_schema(table).await?;
        self.watermarks.ensure_table(table).await?;

        let entry = self.attach_table(table, None).await?;
        mirrored.insert(table.to_string(), entry);
        metrics::record_table_mirrored(table);
        info!(table, "table mirrored");
        Ok(())
    }

    /// Re-establish every tail on a fresh socket after a reconnect.
    ///
    /// Re-issues the `tail`/`write` subscriptions at the persisted
    /// watermark and replays local `diff --since` output, yielding
    /// at-least-once delivery across the gap.
    pub async fn resubscribe(&self, socket: Arc<MuxedSocket>) -> Result<()> {
        *self.socket.write().await = socket;

        let mut mirrored = self.mirrored.lock().await;
        for (table, entry) in mirrored.iter_mut() {
            for task in &entry.tasks {
                task.abort();
            }
            let session = entry.session.clone();
            *entry = self.attach_table(table, Some(&session)).await?;
            info!(table, "tails re-established");
        }
        Ok(())
    }

    /// Establish the server-tail and local-tail for one table.
    ///
    /// `resume` carries the existing engine session on the reconnect path;
    /// `None` creates a fresh subscription.
    async fn attach_table(&self, table: &str, resume: Option<&str>) -> Result<MirroredTable> {
        let since = self.watermarks.get(table).await?;
        let socket = Arc::clone(&*self.socket.read().await);

        // Server tail: server → local changes since the watermark.
        let server_stream = socket.open_stream().await?;
        server_stream
            .send_request(&Request::Tail {
                table: table.to_string(),
                since,
            })
            .await?;
        let server_task = tokio::spawn(server_tail::run(
            server_stream,
            Arc::clone(&self.engine),
            table.to_string(),
            self.replication_uid.clone(),
            self.shutdown_rx.clone(),
        ));

        // Local tail: local → server changes, acks back into the watermark.
        let local_stream = socket.open_stream().await?;
        local_stream
            .send_request(&Request::Write {
                table: table.to_string(),
            })
            .await?;

        let change_file = format!("{}_{}", table, self.access_key);
        let session = match resume {
            Some(session) => {
                // Replay anything the server may have missed while we
                // were gone.
                let diff = self
                    .engine
                    .run_local(
                        argv(&[
                            "diff",
                            "--format=csv",
                            "--since",
                            &since.to_string(),
                            session,
                        ]),
                        String::new(),
                    )
                    .await
                    .map_err(|e| MirrorError::Engine(e.to_string()))?;
                if !diff.trim().is_empty() {
                    debug!(table, bytes = diff.len(), "replaying diff since watermark");
                    local_stream.send_request(&Request::Pipe { data: diff }).await?;
                }
                session.to_string()
            }
            None => {
                let out = self
                    .engine
                    .run_local(
                        argv(&[
                            "subscribe",
                            table,
                            "--connect",
                            "--format=csv",
                            "--updates",
                            &change_file,
                            "--ignore-source",
                            &self.replication_uid,
                        ]),
                        String::new(),
                    )
                    .await
                    .map_err(|e| MirrorError::Engine(e.to_string()))?;
                let session = out.trim().to_string();
                if session.is_empty() {
                    return Err(MirrorError::Engine(format!(
                        "engine returned empty session for {}",
                        table
                    )));
                }
                session
            }
        };

        let changes = self
            .engine
            .watch_file(change_file)
            .await
            .map_err(|e| MirrorError::Engine(e.to_string()))?;
        let local_task = tokio::spawn(local_tail::run(
            local_stream,
            Arc::clone(&self.watermarks),
            table.to_string(),
            changes,
            self.shutdown_rx.clone(),
        ));

        Ok(MirroredTable {
            session,
            tasks: vec![server_task, local_task],
        })
    }

    /// Fetch and execute the table's DDL if the local engine lacks it.
    async fn ensure_schema(&self, table: &str) -> Result<()> {
        let existing = self
            .engine
            .run_local(argv(&["dump-table", table]), String::new())
            .await
            .unwrap_or_default();
        if !existing.trim().is_empty() {
            return Ok(());
        }

        debug!(table, "fetching schema from server");
        let socket = Arc::clone(&*self.socket.read().await);
        let mut stream = socket.open_stream().await?;
        stream
            .send_request(&Request::Schema {
                table: Some(table.to_string()),
                view: None,
                suffix: None,
            })
            .await?;
        // One-shot request: close our send side, read until the peer closes.
        stream.close().await?;

        let mut ddl = String::new();
        while let Some(event) = stream.recv().await {
            match event {
                StreamEvent::Data(payload) => match Response::from_bytes(&payload) {
                    Ok(Response::Pipe { data }) => ddl.push_str(&data),
                    Ok(Response::Error { msg }) => {
                        return Err(MirrorError::Internal(format!(
                            "schema fetch for {} failed: {}",
                            table, msg
                        )))
                    }
                    Ok(_) => {}
                    // Servers may answer schema requests with raw DDL text.
                    Err(_) => ddl.push_str(&String::from_utf8_lossy(&payload)),
                },
                StreamEvent::Closed => break,
                StreamEvent::Error { code, msg } => {
                    return Err(MirrorError::Internal(format!(
                        "schema stream reset ({}): {}",
                        code, msg
                    )))
                }
            }
        }

        if ddl.trim().is_empty() {
            return Err(MirrorError::Internal(format!(
                "server returned no schema for {}",
                table
            )));
        }

        self.engine
            .run_local(Vec::new(), ddl)
            .await
            .map_err(|e| MirrorError::Engine(e.to_string()))?;
        info!(table, "schema bootstrapped from server");
        Ok(())
    }

    /// Shutdown: signal every tail task and wait for them to drain.
    pub async fn shutdown(&self) {
        info!("shutting down coordinator");
        let _ = self.shutdown_tx.send(true);

        let mut mirrored = self.mirrored.lock().await;
        for (table, entry) in mirrored.drain() {
            for handle in entry.tasks {
                match tokio::time::timeout(self.config.drain_timeout(), handle).await {
                    Ok(Ok(())) => debug!(table = %table, "tail task drained"),
                    Ok(Err(e)) if e.is_cancelled() => {}
                    Ok(Err(e)) => warn!(table = %table, error = %e, "tail task panicked"),
                    Err(_) => warn!(table = %table, "tail task timed out during shutdown"),
                }
            }
        }
        info!("coordinator stopped");
    }
}
