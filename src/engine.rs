// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local SQL engine integration trait.
//!
//! Defines the interface the replication coordinator needs from the
//! embedded SQL engine. The engine is an external collaborator consumed
//! through an argv-style command interface; this trait decouples the
//! coordinator from its internals and allows testing with mocks.
//!
//! # Command Forms
//!
//! | argv | stdin | returns |
//! |------|-------|---------|
//! | *(empty)* | SQL text | query/DDL output |
//! | `uid` | | replication uid |
//! | `watermark <table>` | | decimal watermark |
//! | `write-csv <table> --source <uid>` | CSV rows | |
//! | `subscribe <view> --connect --format=csv --updates <file> --ignore-source <uid>` | | session token |
//! | `diff --format=csv --since <wm> <session>` | | CSV since watermark |
//! | `dump-table <name>`, `dump-tables` | | DDL dump |
//!
//! The `--source` / `--ignore-source` arguments carry the replication uid
//! so the engine never echoes our own replicated writes back out through
//! the local change file.
//!
//! # Example
//!
//! ```rust,no_run
//! use mirror_engine::engine::{BoxFuture, SqlEngine};
//! use tokio::sync::mpsc;
//!
//! struct MyEngine { /* ... */ }
//!
//! impl SqlEngine for MyEngine {
//!     fn run_local(&self, _argv: Vec<String>, _stdin: String) -> BoxFuture<'_, String> {
//!         Box::pin(async move { Ok(String::new()) })
//!     }
//!
//!     fn watch_file(
//!         &self,
//!         _file: String,
//!     ) -> BoxFuture<'_, mpsc::UnboundedReceiver<String>> {
//!         let (_tx, rx) = mpsc::unbounded_channel();
//!         Box::pin(async move { Ok(rx) })
//!     }
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = EngineResult<T>> + Send + 'a>>;

/// Simplified error for engine operations.
#[derive(Debug, Clone)]
pub struct EngineError(pub String);

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for EngineError {}

/// Trait defining what the coordinator needs from the local SQL engine.
///
/// The engine's command interface is a single-threaded serializer: each
/// `run_local` invocation completes before the next begins. Implementations
/// must uphold that ordering for calls issued from one task.
pub trait SqlEngine: Send + Sync + 'static {
    /// Run one engine command.
    ///
    /// An empty `argv` executes `stdin` as SQL (used for fetched-schema DDL
    /// and metadata writes); otherwise `argv` selects one of the command
    /// forms in the module docs.
    fn run_local(&self, argv: Vec<String>, stdin: String) -> BoxFuture<'_, String>;

    /// Watch a local change file.
    ///
    /// Each received string is the full buffered change text accumulated
    /// since the engine's last flush of that file. The receiver ends when
    /// the engine drops the watchpoint.
    fn watch_file(&self, file: String) -> BoxFuture<'_, mpsc::UnboundedReceiver<String>>;
}

/// Convenience constructor for argv vectors.
pub fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// A no-op implementation for testing/standalone mode.
///
/// Logs commands and returns benign defaults without storing anything.
#[derive(Clone)]
pub struct NoOpEngine;

impl SqlEngine for NoOpEngine {
    fn run_local(&self, argv: Vec<String>, stdin: String) -> BoxFuture<'_, String> {
        Box::pin(async move {
            tracing::debug!(
                argv = ?argv,
                stdin_len = stdin.len(),
                "NoOp: would run engine command"
            );
            let out = match argv.first().map(String::as_str) {
                Some("uid") => "noop-uid",
                Some("watermark") => "0",
                Some("subscribe") => "noop-session",
                _ => "",
            };
            Ok(out.to_string())
        })
    }

    fn watch_file(&self, file: String) -> BoxFuture<'_, mpsc::UnboundedReceiver<String>> {
        Box::pin(async move {
            tracing::debug!(file = %file, "NoOp: would watch change file");
            // Sender dropped immediately; the watch yields nothing.
            let (_tx, rx) = mpsc::unbounded_channel();
            Ok(rx)
        })
    }
}
