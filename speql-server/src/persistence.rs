//! Persisted state (§6, NEW): append-only per-run log files, and the
//! embedding-based similarity store named as an out-of-scope collaborator.
//!
//! `PersistenceSink` abstracts "append this stream's event somewhere" so
//! tests can swap in a no-op and production can append newline-delimited
//! JSON under `config.log_dir`, one file per stream, matching the seven
//! streams `spec.md` §6 names (`input`, `record`, `preview`, `inference`,
//! `mem_mgmt`, `error`, `schema`).

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

/// One of the seven named log streams `spec.md` §6 enumerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Input,
    Record,
    Preview,
    Inference,
    MemMgmt,
    Error,
    Schema,
}

impl Stream {
    fn file_name(self) -> &'static str {
        match self {
            Stream::Input => "input.txt",
            Stream::Record => "record.txt",
            Stream::Preview => "preview.txt",
            Stream::Inference => "inference.txt",
            Stream::MemMgmt => "mem_mgmt.txt",
            Stream::Error => "error.txt",
            Stream::Schema => "schema.txt",
        }
    }
}

/// Appends one JSON-serialized record, newline-delimited, to a stream.
/// Callers build the value with `serde_json::json!`/`serde_json::to_value`
/// rather than this trait taking a generic `Serialize`, so it stays
/// object-safe and usable behind `Arc<dyn PersistenceSink>`.
pub trait PersistenceSink: Send + Sync {
    fn append(&self, stream: Stream, event: serde_json::Value);
}

/// File-appending default: one file per stream under `log_dir`, opened
/// lazily and kept open for the life of the process.
pub struct FilePersistenceSink {
    log_dir: PathBuf,
    handles: Mutex<HashMap<&'static str, std::fs::File>>,
}

impl FilePersistenceSink {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn write_line(&self, stream: Stream, line: &str) -> std::io::Result<()> {
        let mut handles = self.handles.lock().unwrap();
        let name = stream.file_name();
        if !handles.contains_key(name) {
            std::fs::create_dir_all(&self.log_dir)?;
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.log_dir.join(name))?;
            handles.insert(name, file);
        }
        let file = handles.get_mut(name).unwrap();
        writeln!(file, "{line}")
    }
}

impl PersistenceSink for FilePersistenceSink {
    fn append(&self, stream: Stream, event: serde_json::Value) {
        if let Err(e) = self.write_line(stream, &event.to_string()) {
            tracing::warn!(?stream, error = %e, "failed to append persistence event");
        }
    }
}

/// Discards every event. Used by tests and by deployments that don't want
/// the per-run log directory.
#[derive(Default)]
pub struct NullPersistenceSink;

impl PersistenceSink for NullPersistenceSink {
    fn append(&self, _stream: Stream, _event: serde_json::Value) {}
}

/// The embedding-based similarity store (§1, out-of-scope collaborator):
/// historical SQL retrieval for few-shot prompting. Gated by
/// `config.enable.vector_db`; `speql-server` never ships a real
/// implementation, matching the spec's explicit scoping of the vector store
/// out as an external collaborator with a named interface.
#[async_trait::async_trait]
pub trait SimilarityStore: Send + Sync {
    async fn top_k(&self, query: &str, k: usize) -> Vec<String>;
    async fn record(&self, sql: &str);
}

/// No-op store used whenever `enable.vector_db` is false (the default).
#[derive(Default)]
pub struct NullSimilarityStore;

#[async_trait::async_trait]
impl SimilarityStore for NullSimilarityStore {
    async fn top_k(&self, _query: &str, _k: usize) -> Vec<String> {
        Vec::new()
    }
    async fn record(&self, _sql: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_sink_does_not_panic() {
        let sink = NullPersistenceSink;
        sink.append(Stream::Input, json!({"session_key": "s1", "content": "SELECT 1"}));
    }

    #[test]
    fn file_sink_appends_newline_delimited_json() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FilePersistenceSink::new(dir.path());
        sink.append(Stream::Input, json!({"session_key": "s1", "content": "SELECT 1"}));
        sink.append(Stream::Input, json!({"session_key": "s2", "content": "SELECT 2"}));
        let text = std::fs::read_to_string(dir.path().join("input.txt")).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("\"s1\""));
    }

    #[tokio::test]
    async fn null_similarity_store_returns_nothing() {
        let store = NullSimilarityStore;
        assert!(store.top_k("select 1", 5).await.is_empty());
        store.record("select 1").await;
    }
}
