// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-table watermark persistence.
//!
//! The watermark is the monotonically increasing checkpoint the server has
//! acknowledged for a table. It lives in an engine-side metadata table
//! `skdb__<table>_sync_metadata(key PRIMARY KEY, value)` so that it shares
//! the engine's durability: a crash between applying rows and recording
//! the ack re-reads some rows on restart, which is safe (at-least-once,
//! deduplicated by primary keys and last-writer-wins).
//!
//! # Write Order
//!
//! Checkpoint acks are written in arrival order under a single key, last
//! value wins. Server-assigned checkpoints are monotone, so the stored
//! value only moves forward; preserving arrival order is what keeps that
//! property.
//!
//! # Read Path
//!
//! `get()` asks the engine (`watermark <table>`), which derives the value
//! from the metadata table. An in-memory cache tracks the latest ack for
//! cheap observation; the engine remains the source of truth on
//! resubscribe.

use crate::engine::{argv, SqlEngine};
use crate::error::{MirrorError, Result};
use crate::metrics;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Name of the sync metadata table for a mirrored table.
pub fn metadata_table(table: &str) -> String {
    format!("skdb__{}_sync_metadata", table)
}

/// Watermark store backed by the engine's metadata tables.
pub struct WatermarkStore<E> {
    engine: Arc<E>,
    /// Latest acked checkpoint per table, for cheap reads.
    cache: RwLock<HashMap<String, u64>>,
}

impl<E: SqlEngine> WatermarkStore<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self {
            engine,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Create the metadata table if it does not exist.
    pub async fn ensure_table(&self, table: &str) -> Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (key TEXT PRIMARY KEY, value TEXT);",
            metadata_table(table)
        );
        self.engine
            .run_local(Vec::new(), ddl)
            .await
            .map_err(|e| MirrorError::Engine(e.to_string()))?;
        Ok(())
    }

    /// Read the persisted watermark for a table.
    ///
    /// Returns 0 for a table that has never synced.
    pub async fn get(&self, table: &str) -> Result<u64> {
        let out = self
            .engine
            .run_local(argv(&["watermark", table]), String::new())
            .await
            .map_err(|e| MirrorError::Engine(e.to_string()))?;
        let trimmed = out.trim();
        if trimmed.is_empty() {
            return Ok(0);
        }
        let watermark = trimmed.parse::<u64>().map_err(|_| {
            MirrorError::Engine(format!("non-numeric watermark for {}: {:?}", table, trimmed))
        })?;

        self.cache
            .write()
            .await
            .insert(table.to_string(), watermark);
        Ok(watermark)
    }

    /// Record a server checkpoint ack.
    ///
    /// The raw ack text is persisted in arrival order (last value wins).
    /// Numeric acks also move the in-memory cache forward; non-numeric
    /// acks are persisted but leave the cache alone.
    pub async fn record_checkpoint(&self, table: &str, ack: &str) -> Result<()> {
        let trimmed = ack.trim();
        if trimmed.is_empty() {
            return Ok(());
        }

        let sql = format!(
            "INSERT OR REPLACE INTO {} (key, value) VALUES ('checkpoint', '{}');",
            metadata_table(table),
            trimmed.replace('\'', "''")
        );
        self.engine
            .run_local(Vec::new(), sql)
            .await
            .map_err(|e| MirrorError::Engine(e.to_string()))?;

        match trimmed.parse::<u64>() {
            Ok(checkpoint) => {
                self.cache.write().await.insert(table.to_string(), checkpoint);
                metrics::record_checkpoint(table);
                debug!(table, checkpoint, "recorded checkpoint ack");
            }
            Err(_) => {
                warn!(table, ack = trimmed, "non-numeric checkpoint ack persisted");
            }
        }
        Ok(())
    }

    /// Latest checkpoint seen this session, if any.
    pub async fn cached(&self, table: &str) -> Option<u64> {
        self.cache.read().await.get(table).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{BoxFuture, EngineError};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Engine stub recording SQL and serving canned watermark reads.
    struct StubEngine {
        watermark: String,
        sql: Mutex<Vec<String>>,
    }

    impl StubEngine {
        fn new(watermark: &str) -> Self {
            Self {
                watermark: watermark.to_string(),
                sql: Mutex::new(Vec::new()),
            }
        }
    }

    impl SqlEngine for StubEngine {
        fn run_local(&self, argv: Vec<String>, stdin: String) -> BoxFuture<'_, String> {
            let out = match argv.first().map(String::as_str) {
                Some("watermark") => self.watermark.clone(),
                None => {
                    self.sql.lock().unwrap().push(stdin);
                    String::new()
                }
                _ => String::new(),
            };
            Box::pin(async move { Ok(out) })
        }

        fn watch_file(&self, _file: String) -> BoxFuture<'_, mpsc::UnboundedReceiver<String>> {
            Box::pin(async move {
                Err(EngineError("no watch in stub".to_string()))
            })
        }
    }

    #[test]
    fn test_metadata_table_name() {
        assert_eq!(metadata_table("todos"), "skdb__todos_sync_metadata");
    }

    #[tokio::test]
    async fn test_ensure_table_issues_ddl() {
        let engine = Arc::new(StubEngine::new("0"));
        let store = WatermarkStore::new(Arc::clone(&engine));
        store.ensure_table("todos").await.unwrap();

        let sql = engine.sql.lock().unwrap();
        assert_eq!(sql.len(), 1);
        assert!(sql[0].contains("CREATE TABLE IF NOT EXISTS skdb__todos_sync_metadata"));
        assert!(sql[0].contains("key TEXT PRIMARY KEY"));
    }

    #[tokio::test]
    async fn test_get_parses_watermark() {
        let store = WatermarkStore::new(Arc::new(StubEngine::new(" 42\n")));
        assert_eq!(store.get("todos").await.unwrap(), 42);
        assert_eq!(store.cached("todos").await, Some(42));
    }

    #[tokio::test]
    async fn test_get_empty_is_zero() {
        let store = WatermarkStore::new(Arc::new(StubEngine::new("")));
        assert_eq!(store.get("todos").await.unwrap(), 0);
        // No numeric value was ever observed.
        assert_eq!(store.cached("todos").await, None);
    }

    #[tokio::test]
    async fn test_get_rejects_garbage() {
        let store = WatermarkStore::new(Arc::new(StubEngine::new("not-a-number")));
        assert!(matches!(
            store.get("todos").await,
            Err(MirrorError::Engine(_))
        ));
    }

    #[tokio::test]
    async fn test_record_checkpoint_persists_and_caches() {
        let engine = Arc::new(StubEngine::new("0"));
        let store = WatermarkStore::new(Arc::clone(&engine));

        store.record_checkpoint("todos", "17\n").await.unwrap();
        assert_eq!(store.cached("todos").await, Some(17));

        let sql = engine.sql.lock().unwrap();
        assert_eq!(sql.len(), 1);
        assert!(sql[0].contains("INSERT OR REPLACE INTO skdb__todos_sync_metadata"));
        assert!(sql[0].contains("'checkpoint', '17'"));
    }

    #[tokio::test]
    async fn test_record_checkpoint_last_value_wins() {
        let engine = Arc::new(StubEngine::new("0"));
        let store = WatermarkStore::new(Arc::clone(&engine));

        store.record_checkpoint("todos", "17").await.unwrap();
        store.record_checkpoint("todos", "18").await.unwrap();
        assert_eq!(store.cached("todos").await, Some(18));
        assert_eq!(engine.sql.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_record_checkpoint_empty_ack_noop() {
        let engine = Arc::new(StubEngine::new("0"));
        let store = WatermarkStore::new(Arc::clone(&engine));
        store.record_checkpoint("todos", "  \n").await.unwrap();
        assert!(engine.sql.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_checkpoint_non_numeric_persisted_not_cached() {
        let engine = Arc::new(StubEngine::new("0"));
        let store = WatermarkStore::new(Arc::clone(&engine));
        store.record_checkpoint("todos", "abc").await.unwrap();
        assert_eq!(store.cached("todos").await, None);
        assert_eq!(engine.sql.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_record_checkpoint_escapes_quotes() {
        let engine = Arc::new(StubEngine::new("0"));
        let store = WatermarkStore::new(Arc::clone(&engine));
        store.record_checkpoint("todos", "o'clock").await.unwrap();
        let sql = engine.sql.lock().unwrap();
        assert!(sql[0].contains("'o''clock'"));
    }
}
