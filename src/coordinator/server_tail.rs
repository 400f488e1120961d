// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Server-tail task: server → local change ingestion.
//!
//! Drains one long-lived mux stream carrying `pipe` envelopes of CSV
//! fragments and feeds them into the local engine with
//! `write-csv <table> --source <uid>`. The `--source` argument marks the
//! rows as replicated so the engine does not re-emit them into the local
//! change file.
//!
//! Malformed payloads are logged and skipped; the tail only ends when the
//! stream closes, errors, or shutdown is signalled.

use crate::engine::{argv, SqlEngine};
use crate::envelope::Response;
use crate::metrics;
use crate::stream::{Stream, StreamEvent};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

pub(crate) async fn run<E: SqlEngine>(
    mut stream: Stream,
    engine: Arc<E>,
    table: String,
    uid: String,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(table = %table, stream = stream.id(), "server tail running");
    loop {
        tokio::select! {
            event = stream.recv() => match event {
                Some(StreamEvent::Data(payload)) => {
                    apply_fragment(&engine, &table, &uid, &payload).await;
                }
                Some(StreamEvent::Closed) => {
                    debug!(table = %table, "server tail closed by peer");
                    break;
                }
                Some(StreamEvent::Error { code, msg }) => {
                    warn!(table = %table, code, msg = %msg, "server tail errored");
                    break;
                }
                None => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!(table = %table, "server tail stopping");
                    break;
                }
            }
        }
    }
}

/// Decode one tail payload and ingest its CSV rows.
async fn apply_fragment<E: SqlEngine>(engine: &Arc<E>, table: &str, uid: &str, payload: &[u8]) {
    let response = match Response::from_bytes(payload) {
        Ok(response) => response,
        Err(e) => {
            warn!(table, error = %e, "undecodable tail payload, skipping");
            return;
        }
    };

    match response {
        Response::Pipe { data } => {
            if data.is_empty() {
                return;
            }
            let rows = data.lines().count();
            let mut csv = data;
            if !csv.ends_with('\n') {
                csv.push('\n');
            }
            match engine
                .run_local(argv(&["write-csv", table, "--source", uid]), csv)
                .await
            {
                Ok(_) => {
                    trace!(table, rows, "applied tail fragment");
                    metrics::record_rows_applied(table, rows);
                }
                Err(e) => {
                    warn!(table, error = %e, "failed to apply tail fragment");
                }
            }
        }
        Response::Error { msg } => {
            warn!(table, msg = %msg, "server reported tail error");
        }
        other => {
            trace!(table, response = ?other, "ignoring non-pipe tail response");
        }
    }
}
