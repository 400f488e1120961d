//! Mock SqlEngine for testing.
//!
//! Records all run_local() calls for assertions and serves configurable
//! responses keyed by the leading argv element (the empty key covers raw
//! SQL invocations). Change-file watches are backed by channels the test
//! drives directly.

use mirror_engine::engine::{BoxFuture, SqlEngine};
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use tokio::sync::{mpsc, RwLock};

/// A recorded run_local() call.
#[derive(Debug, Clone)]
pub struct RunLocalCall {
    pub argv: Vec<String>,
    pub stdin: String,
}

impl RunLocalCall {
    /// The leading argv element, or "" for raw SQL.
    pub fn command(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }
}

/// Mock implementation of SqlEngine that records all calls.
///
/// # Example
/// ```rust,ignore
/// let engine = MockEngine::new();
/// engine.set_response("watermark", "42").await;
///
/// // Use in tests...
///
/// let writes = engine.calls_for("write-csv").await;
/// assert_eq!(writes.len(), 1);
/// ```
pub struct MockEngine {
    /// Recorded run_local() calls, in order.
    calls: RwLock<Vec<RunLocalCall>>,
    /// Responses keyed by leading argv element ("" for raw SQL).
    responses: RwLock<HashMap<String, String>>,
    /// Change-file watchers by file name.
    watchers: StdMutex<HashMap<String, mpsc::UnboundedSender<String>>>,
}

impl MockEngine {
    /// Create a mock with sensible defaults for coordinator flows.
    pub fn new() -> Self {
        let mut responses = HashMap::new();
        responses.insert("uid".to_string(), "uid-1".to_string());
        responses.insert("watermark".to_string(), "0".to_string());
        responses.insert("subscribe".to_string(), "sess-1".to_string());
        Self {
            calls: RwLock::new(Vec::new()),
            responses: RwLock::new(responses),
            watchers: StdMutex::new(HashMap::new()),
        }
    }

    /// Configure the response for a command (argv[0], or "" for raw SQL).
    pub async fn set_response(&self, command: &str, output: &str) {
        self.responses
            .write()
            .await
            .insert(command.to_string(), output.to_string());
    }

    /// All recorded calls, in order.
    #[allow(dead_code)] // For detailed ordering assertions
    pub async fn calls(&self) -> Vec<RunLocalCall> {
        self.calls.read().await.clone()
    }

    /// Recorded calls for one command.
    pub async fn calls_for(&self, command: &str) -> Vec<RunLocalCall> {
        self.calls
            .read()
            .await
            .iter()
            .filter(|c| c.command() == command)
            .cloned()
            .collect()
    }

    /// Recorded raw-SQL invocations (empty argv).
    pub async fn sql_calls(&self) -> Vec<String> {
        self.calls
            .read()
            .await
            .iter()
            .filter(|c| c.argv.is_empty())
            .map(|c| c.stdin.clone())
            .collect()
    }

    /// Push buffered change text into an active change-file watch.
    ///
    /// Panics if nothing watches the file yet.
    pub fn push_change(&self, file: &str, text: &str) {
        let watchers = self.watchers.lock().unwrap();
        let tx = watchers
            .get(file)
            .unwrap_or_else(|| panic!("no watcher for change file {:?}", file));
        tx.send(text.to_string()).expect("watcher receiver dropped");
    }

    /// Whether a change-file watch is active.
    pub fn is_watching(&self, file: &str) -> bool {
        self.watchers.lock().unwrap().contains_key(file)
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SqlEngine for MockEngine {
    fn run_local(&self, argv: Vec<String>, stdin: String) -> BoxFuture<'_, String> {
        Box::pin(async move {
            let command = argv.first().cloned().unwrap_or_default();
            self.calls.write().await.push(RunLocalCall { argv, stdin });
            let out = self
                .responses
                .read()
                .await
                .get(&command)
                .cloned()
                .unwrap_or_default();
            Ok(out)
        })
    }

    fn watch_file(&self, file: String) -> BoxFuture<'_, mpsc::UnboundedReceiver<String>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            self.watchers.lock().unwrap().insert(file, tx);
            Ok(rx)
        })
    }
}
