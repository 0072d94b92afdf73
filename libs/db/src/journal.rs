//! The event journal contract: thin, store-agnostic append/load/snapshot over
//! opaque JSON event payloads.
//!
//! The journal does not know about any particular aggregate or event enum —
//! it stores a `stream_id`, a monotonic `version`, a string `event_type` tag,
//! and a JSON `data` blob per event, plus JSON snapshots. Callers (the engine
//! crate's flow transaction) serialize their own event types to and from
//! `serde_json::Value` at the boundary. This mirrors the teacher's
//! `PgEventStore`, generalized so the store has no compile-time dependency on
//! the workflow event vocabulary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by a `Journal` implementation.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("concurrency conflict on stream {stream_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        stream_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for JournalError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// An event not yet persisted: a type tag plus its JSON-encoded payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_type: String,
    pub data: serde_json::Value,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }
}

/// A persisted event, as loaded back from the journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub stream_id: String,
    pub stream_type: String,
    pub version: u64,
    pub event_type: String,
    pub data: serde_json::Value,
    pub metadata: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

/// A persisted snapshot of an aggregate's rebuilt state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub stream_id: String,
    pub version: u64,
    pub state: serde_json::Value,
    pub taken_at: DateTime<Utc>,
}

/// Store-agnostic event journal: append, load, snapshot, enumerate streams.
///
/// Per-key serialization of commands (the "Exec" half of the journal
/// contract) is the engine crate's responsibility (`glyph_workflow_engine`'s
/// flow transaction holds an aggregate-scoped lock around a load+append
/// pair) — this trait only guarantees that a concurrent append with a stale
/// `expected_version` is rejected.
#[async_trait]
pub trait Journal: Send + Sync {
    /// Append events to a stream, enforcing optimistic concurrency when
    /// `expected_version` is `Some`. Returns the new stream version.
    async fn append(
        &self,
        stream_id: &str,
        stream_type: &str,
        expected_version: Option<u64>,
        events: Vec<NewEvent>,
        metadata: serde_json::Value,
    ) -> Result<u64, JournalError>;

    /// Load events strictly after `from_version`, in version order.
    async fn load_events(
        &self,
        stream_id: &str,
        from_version: u64,
    ) -> Result<Vec<StoredEvent>, JournalError>;

    /// Latest snapshot for a stream, if any.
    async fn get_latest_snapshot(&self, stream_id: &str) -> Result<Option<Snapshot>, JournalError>;

    /// Persist a snapshot for a stream.
    async fn save_snapshot(&self, snapshot: &Snapshot, stream_type: &str) -> Result<(), JournalError>;

    /// Current version of a stream (0 if it has never been written to).
    async fn get_stream_version(&self, stream_id: &str) -> Result<u64, JournalError>;

    /// Stream ids of a given type whose id starts with `prefix` (or all, if
    /// `prefix` is `None`). Backs `ListAggregates(pattern)`.
    async fn list_streams(
        &self,
        stream_type: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<String>, JournalError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_event_carries_its_type_tag() {
        let e = NewEvent::new("flow_started", serde_json::json!({"id": "wf-1"}));
        assert_eq!(e.event_type, "flow_started");
    }
}
