// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local-tail task: local → server change forwarding.
//!
//! Watches the engine's change file for a table and forwards each
//! non-empty change text to the server as a `pipe` request on a
//! long-lived mux stream. Replies on the same stream are server
//! checkpoint acks, recorded into the watermark store in arrival order
//! so that resubscription resumes without duplication or gap.

use crate::engine::SqlEngine;
use crate::envelope::Request;
use crate::metrics;
use crate::stream::{Stream, StreamEvent};
use crate::watermark::WatermarkStore;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

pub(crate) async fn run<E: SqlEngine>(
    mut stream: Stream,
    watermarks: Arc<WatermarkStore<E>>,
    table: String,
    mut changes: mpsc::UnboundedReceiver<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(table = %table, stream = stream.id(), "local tail running");
    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Some(text) => {
                    forward_change(&stream, &table, text).await;
                }
                None => {
                    debug!(table = %table, "change watch ended");
                    break;
                }
            },
            event = stream.recv() => match event {
                Some(StreamEvent::Data(payload)) => {
                    record_ack(&watermarks, &table, &payload).await;
                }
                Some(StreamEvent::Closed) => {
                    debug!(table = %table, "local tail closed by peer");
                    break;
                }
                Some(StreamEvent::Error { code, msg }) => {
                    warn!(table = %table, code, msg = %msg, "local tail errored");
                    break;
                }
                None => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!(table = %table, "local tail stopping");
                    break;
                }
            }
        }
    }
}

/// Forward one buffered change text as a pipe request.
async fn forward_change(stream: &Stream, table: &str, text: String) {
    if text.trim().is_empty() {
        return;
    }
    let bytes = text.len();
    match stream.send_request(&Request::Pipe { data: text }).await {
        Ok(()) => {
            trace!(table, bytes, "forwarded change fragment");
            metrics::record_change_forwarded(table, bytes);
        }
        Err(e) => {
            // The resubscribe path replays the diff, so a lost fragment
            // is recovered after reconnect.
            warn!(table, error = %e, "failed to forward change fragment");
        }
    }
}

/// Record one checkpoint ack from the server.
async fn record_ack<E: SqlEngine>(watermarks: &Arc<WatermarkStore<E>>, table: &str, payload: &[u8]) {
    let ack = match std::str::from_utf8(payload) {
        Ok(ack) => ack,
        Err(e) => {
            warn!(table, error = %e, "non-UTF-8 checkpoint ack, skipping");
            return;
        }
    };
    if let Err(e) = watermarks.record_checkpoint(table, ack).await {
        warn!(table, error = %e, "failed to persist checkpoint ack");
    }
}
