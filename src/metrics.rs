//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Frame traffic per type
//! - Stream lifecycle
//! - Socket state
//! - Stalls and reconnects
//! - Replication progress per table
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `mirror_` and follow Prometheus
//! conventions: counters end in `_total`, gauges represent current state.

use metrics::{counter, gauge};

/// Record a frame written to the carrier.
pub fn record_frame_sent(kind: &'static str) {
    counter!("mirror_frames_sent_total", "kind" => kind).increment(1);
}

/// Record a frame received and dispatched.
pub fn record_frame_received(kind: &'static str) {
    counter!("mirror_frames_received_total", "kind" => kind).increment(1);
}

/// Record a frame dropped by the dispatcher.
pub fn record_frame_dropped(reason: &'static str) {
    counter!("mirror_frames_dropped_total", "reason" => reason).increment(1);
}

/// Record the socket state as a labelled gauge.
pub fn set_socket_state(state: &'static str) {
    gauge!("mirror_socket_state", "state" => state).set(1.0);
}

/// Record a stream opening, by initiator ("client" or "server").
pub fn record_stream_opened(initiator: &'static str) {
    counter!("mirror_streams_opened_total", "initiator" => initiator).increment(1);
}

/// Record a stream leaving the active table.
pub fn record_stream_closed() {
    counter!("mirror_streams_closed_total").increment(1);
}

/// Record a stall (expected data never arrived).
pub fn record_stall() {
    counter!("mirror_stalls_total").increment(1);
}

/// Record a reconnect being scheduled.
pub fn record_reconnect(reason: &str) {
    counter!("mirror_reconnects_total", "reason" => reason.to_string()).increment(1);
}

/// Record CSV rows applied to the local engine from a server tail.
pub fn record_rows_applied(table: &str, count: usize) {
    counter!("mirror_rows_applied_total", "table" => table.to_string()).increment(count as u64);
}

/// Record a change fragment forwarded to the server on a local tail.
pub fn record_change_forwarded(table: &str, bytes: usize) {
    counter!("mirror_changes_forwarded_total", "table" => table.to_string()).increment(1);
    counter!("mirror_change_bytes_forwarded_total", "table" => table.to_string())
        .increment(bytes as u64);
}

/// Record a server checkpoint ack applied to the watermark store.
pub fn record_checkpoint(table: &str) {
    counter!("mirror_checkpoints_total", "table" => table.to_string()).increment(1);
}

/// Record a table entering the mirrored set.
pub fn record_table_mirrored(table: &str) {
    counter!("mirror_tables_mirrored_total", "table" => table.to_string()).increment(1);
}
