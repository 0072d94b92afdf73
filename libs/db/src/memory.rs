//! In-process reference `Journal` implementation, backed by a mutex-guarded
//! map. Suitable for tests and the demonstration CLI; not durable.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::journal::{Journal, JournalError, NewEvent, Snapshot, StoredEvent};

#[derive(Default)]
struct Stream {
    stream_type: String,
    events: Vec<StoredEvent>,
    snapshot: Option<Snapshot>,
}

/// An in-memory `Journal`. Cheap to clone (shares state via `Arc`).
#[derive(Clone, Default)]
pub struct InMemoryJournal {
    streams: Arc<RwLock<HashMap<String, Stream>>>,
}

impl InMemoryJournal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Journal for InMemoryJournal {
    async fn append(
        &self,
        stream_id: &str,
        stream_type: &str,
        expected_version: Option<u64>,
        events: Vec<NewEvent>,
        metadata: serde_json::Value,
    ) -> Result<u64, JournalError> {
        let mut streams = self.streams.write().await;
        let stream = streams.entry(stream_id.to_string()).or_default();
        if stream.stream_type.is_empty() {
            stream.stream_type = stream_type.to_string();
        }

        let current_version = stream.events.len() as u64;
        if let Some(expected) = expected_version {
            if current_version != expected {
                return Err(JournalError::ConcurrencyConflict {
                    stream_id: stream_id.to_string(),
                    expected,
                    actual: current_version,
                });
            }
        }

        if events.is_empty() {
            return Ok(current_version);
        }

        let mut version = current_version;
        for event in events {
            version += 1;
            stream.events.push(StoredEvent {
                event_id: Uuid::new_v4(),
                stream_id: stream_id.to_string(),
                stream_type: stream_type.to_string(),
                version,
                event_type: event.event_type,
                data: event.data,
                metadata: metadata.clone(),
                occurred_at: Utc::now(),
            });
        }
        Ok(version)
    }

    async fn load_events(
        &self,
        stream_id: &str,
        from_version: u64,
    ) -> Result<Vec<StoredEvent>, JournalError> {
        let streams = self.streams.read().await;
        Ok(streams
            .get(stream_id)
            .map(|s| {
                s.events
                    .iter()
                    .filter(|e| e.version > from_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_latest_snapshot(&self, stream_id: &str) -> Result<Option<Snapshot>, JournalError> {
        let streams = self.streams.read().await;
        Ok(streams.get(stream_id).and_then(|s| s.snapshot.clone()))
    }

    async fn save_snapshot(&self, snapshot: &Snapshot, stream_type: &str) -> Result<(), JournalError> {
        let mut streams = self.streams.write().await;
        let stream = streams.entry(snapshot.stream_id.clone()).or_default();
        if stream.stream_type.is_empty() {
            stream.stream_type = stream_type.to_string();
        }
        stream.snapshot = Some(snapshot.clone());
        Ok(())
    }

    async fn get_stream_version(&self, stream_id: &str) -> Result<u64, JournalError> {
        let streams = self.streams.read().await;
        Ok(streams.get(stream_id).map_or(0, |s| s.events.len() as u64))
    }

    async fn list_streams(
        &self,
        stream_type: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<String>, JournalError> {
        let streams = self.streams.read().await;
        Ok(streams
            .iter()
            .filter(|(id, s)| {
                s.stream_type == stream_type
                    && match prefix {
                        Some(p) => id.starts_with(p),
                        None => true,
                    }
            })
            .map(|(id, _)| id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_enforces_expected_version() {
        let journal = InMemoryJournal::new();
        journal
            .append(
                "flow:wf-1",
                "flow",
                Some(0),
                vec![NewEvent::new("flow_started", serde_json::json!({}))],
                serde_json::json!({}),
            )
            .await
            .unwrap();

        let err = journal
            .append(
                "flow:wf-1",
                "flow",
                Some(0),
                vec![NewEvent::new("flow_started", serde_json::json!({}))],
                serde_json::json!({}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, JournalError::ConcurrencyConflict { .. }));
    }

    #[tokio::test]
    async fn load_events_respects_from_version() {
        let journal = InMemoryJournal::new();
        journal
            .append(
                "flow:wf-1",
                "flow",
                Some(0),
                vec![
                    NewEvent::new("a", serde_json::json!(1)),
                    NewEvent::new("b", serde_json::json!(2)),
                ],
                serde_json::json!({}),
            )
            .await
            .unwrap();

        let events = journal.load_events("flow:wf-1", 1).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "b");
    }

    #[tokio::test]
    async fn list_streams_filters_by_prefix() {
        let journal = InMemoryJournal::new();
        for id in ["flow:a", "flow:ab", "flow:b"] {
            journal
                .append(id, "flow", Some(0), vec![NewEvent::new("x", serde_json::json!(1))], serde_json::json!({}))
                .await
                .unwrap();
        }
        let mut found = journal.list_streams("flow", Some("flow:a")).await.unwrap();
        found.sort();
        assert_eq!(found, vec!["flow:a".to_string(), "flow:ab".to_string()]);
    }
}
