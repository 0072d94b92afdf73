//! PostgreSQL-backed `Journal`, grounded on the teacher's `PgEventStore`:
//! same table shape and version-cache strategy, generalized to store an
//! opaque JSON event payload rather than a fixed workflow event enum.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::journal::{Journal, JournalError, NewEvent, Snapshot, StoredEvent};

/// PostgreSQL-backed event journal.
pub struct PgJournal {
    pool: PgPool,
    version_cache: Arc<RwLock<HashMap<String, u64>>>,
}

impl PgJournal {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            version_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn get_or_fetch_version(&self, stream_id: &str) -> Result<u64, JournalError> {
        {
            let cache = self.version_cache.read().await;
            if let Some(&version) = cache.get(stream_id) {
                return Ok(version);
            }
        }

        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT COALESCE(MAX(version), 0) FROM engine_events WHERE stream_id = $1",
        )
        .bind(stream_id)
        .fetch_optional(&self.pool)
        .await?;

        let version = row.map_or(0, |(v,)| v as u64);

        let mut cache = self.version_cache.write().await;
        cache.insert(stream_id.to_string(), version);
        Ok(version)
    }
}

#[async_trait]
impl Journal for PgJournal {
    async fn append(
        &self,
        stream_id: &str,
        stream_type: &str,
        expected_version: Option<u64>,
        events: Vec<NewEvent>,
        metadata: serde_json::Value,
    ) -> Result<u64, JournalError> {
        if events.is_empty() {
            return self.get_or_fetch_version(stream_id).await;
        }

        let current_version = self.get_or_fetch_version(stream_id).await?;
        if let Some(expected) = expected_version {
            if current_version != expected {
                return Err(JournalError::ConcurrencyConflict {
                    stream_id: stream_id.to_string(),
                    expected,
                    actual: current_version,
                });
            }
        }

        let mut tx = self.pool.begin().await?;
        let mut version = current_version;

        for event in &events {
            version += 1;
            sqlx::query(
                r#"
                INSERT INTO engine_events
                    (event_id, stream_id, stream_type, version, event_type, event_data, metadata, occurred_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(stream_id)
            .bind(stream_type)
            .bind(version as i64)
            .bind(&event.event_type)
            .bind(&event.data)
            .bind(&metadata)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        let mut cache = self.version_cache.write().await;
        cache.insert(stream_id.to_string(), version);
        Ok(version)
    }

    async fn load_events(
        &self,
        stream_id: &str,
        from_version: u64,
    ) -> Result<Vec<StoredEvent>, JournalError> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT event_id, stream_id, stream_type, version, event_type, event_data, metadata, occurred_at
            FROM engine_events
            WHERE stream_id = $1 AND version > $2
            ORDER BY version ASC
            "#,
        )
        .bind(stream_id)
        .bind(from_version as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_latest_snapshot(&self, stream_id: &str) -> Result<Option<Snapshot>, JournalError> {
        let row: Option<SnapshotRow> = sqlx::query_as(
            r#"
            SELECT stream_id, version, state, created_at
            FROM engine_snapshots
            WHERE stream_id = $1
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(stream_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Snapshot {
            stream_id: r.stream_id,
            version: r.version as u64,
            state: r.state,
            taken_at: r.created_at,
        }))
    }

    async fn save_snapshot(&self, snapshot: &Snapshot, stream_type: &str) -> Result<(), JournalError> {
        sqlx::query(
            r#"
            INSERT INTO engine_snapshots (stream_id, stream_type, version, state, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (stream_id, version) DO UPDATE SET state = EXCLUDED.state
            "#,
        )
        .bind(&snapshot.stream_id)
        .bind(stream_type)
        .bind(snapshot.version as i64)
        .bind(&snapshot.state)
        .bind(snapshot.taken_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_stream_version(&self, stream_id: &str) -> Result<u64, JournalError> {
        self.get_or_fetch_version(stream_id).await
    }

    async fn list_streams(
        &self,
        stream_type: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<String>, JournalError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT stream_id FROM engine_events
            WHERE stream_type = $1 AND ($2::text IS NULL OR stream_id LIKE $2 || '%')
            "#,
        )
        .bind(stream_type)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    event_id: Uuid,
    stream_id: String,
    stream_type: String,
    version: i64,
    event_type: String,
    event_data: serde_json::Value,
    metadata: serde_json::Value,
    occurred_at: DateTime<Utc>,
}

impl From<EventRow> for StoredEvent {
    fn from(row: EventRow) -> Self {
        Self {
            event_id: row.event_id,
            stream_id: row.stream_id,
            stream_type: row.stream_type,
            version: row.version as u64,
            event_type: row.event_type,
            data: row.event_data,
            metadata: row.metadata,
            occurred_at: row.occurred_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SnapshotRow {
    stream_id: String,
    version: i64,
    state: serde_json::Value,
    created_at: DateTime<Utc>,
}

/// Wraps a `Journal` so a snapshot is taken automatically once every
/// `interval` versions, using a caller-supplied state provider.
pub struct AutoSnapshotJournal<J: Journal> {
    inner: J,
    interval: u64,
    state_provider: Arc<dyn Fn(&str) -> Option<serde_json::Value> + Send + Sync>,
}

impl<J: Journal> AutoSnapshotJournal<J> {
    pub fn new(
        inner: J,
        interval: u64,
        state_provider: Arc<dyn Fn(&str) -> Option<serde_json::Value> + Send + Sync>,
    ) -> Self {
        Self {
            inner,
            interval,
            state_provider,
        }
    }

    fn should_snapshot(&self, version: u64) -> bool {
        version > 0 && version % self.interval == 0
    }
}

#[async_trait]
impl<J: Journal> Journal for AutoSnapshotJournal<J> {
    async fn append(
        &self,
        stream_id: &str,
        stream_type: &str,
        expected_version: Option<u64>,
        events: Vec<NewEvent>,
        metadata: serde_json::Value,
    ) -> Result<u64, JournalError> {
        let new_version = self
            .inner
            .append(stream_id, stream_type, expected_version, events, metadata)
            .await?;

        if self.should_snapshot(new_version) {
            if let Some(state) = (self.state_provider)(stream_id) {
                let snapshot = Snapshot {
                    stream_id: stream_id.to_string(),
                    version: new_version,
                    state,
                    taken_at: Utc::now(),
                };
                let _ = self.inner.save_snapshot(&snapshot, stream_type).await;
            }
        }

        Ok(new_version)
    }

    async fn load_events(
        &self,
        stream_id: &str,
        from_version: u64,
    ) -> Result<Vec<StoredEvent>, JournalError> {
        self.inner.load_events(stream_id, from_version).await
    }

    async fn get_latest_snapshot(&self, stream_id: &str) -> Result<Option<Snapshot>, JournalError> {
        self.inner.get_latest_snapshot(stream_id).await
    }

    async fn save_snapshot(&self, snapshot: &Snapshot, stream_type: &str) -> Result<(), JournalError> {
        self.inner.save_snapshot(snapshot, stream_type).await
    }

    async fn get_stream_version(&self, stream_id: &str) -> Result<u64, JournalError> {
        self.inner.get_stream_version(stream_id).await
    }

    async fn list_streams(
        &self,
        stream_type: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<String>, JournalError> {
        self.inner.list_streams(stream_type, prefix).await
    }
}
