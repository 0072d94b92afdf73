//! Step catalog: the partition-scope aggregate holding registered step
//! definitions and their health, replayed from `PartitionEvent`s through
//! `glyph_db::Journal` the same way `FlowState` replays `FlowEvent`s.
//!
//! Grounded on the teacher's `config::step_library`, which keeps an
//! in-memory step registry; here it becomes an event-sourced aggregate so
//! `RegisterStep`/`UnregisterStep`/`UpdateStep` survive a restart via the
//! journal rather than living only in memory.

use std::collections::HashMap;
use std::sync::RwLock;

use glyph_db::{Journal, JournalError, NewEvent};
use glyph_domain::ids::StepId;
use glyph_domain::step::Step;
use thiserror::Error;

use crate::events::PartitionEvent;

/// The well-known partition-scope stream key (§6.4).
pub const PARTITION_STREAM_ID: &str = "partition";
const PARTITION_STREAM_TYPE: &str = "partition";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("step not found: {0}")]
    StepNotFound(String),

    #[error("step already exists: {0}")]
    StepExists(String),

    #[error(transparent)]
    Journal(#[from] JournalError),
}

/// In-memory projection of the partition aggregate, kept current by
/// replaying `PartitionEvent`s as they're appended.
#[derive(Default)]
struct Projection {
    steps: HashMap<StepId, Step>,
    healthy: HashMap<StepId, (bool, Option<String>)>,
}

impl Projection {
    fn apply(&mut self, event: &PartitionEvent) {
        match event {
            PartitionEvent::StepRegistered { step } | PartitionEvent::StepUpdated { step } => {
                self.steps.insert(step.id.clone(), step.clone());
            }
            PartitionEvent::StepUnregistered { step_id } => {
                self.steps.remove(step_id);
                self.healthy.remove(step_id);
            }
            PartitionEvent::StepHealthUpdated { step_id, healthy, error } => {
                self.healthy.insert(step_id.clone(), (*healthy, error.clone()));
            }
        }
    }
}

/// The step catalog: `RegisterStep`/`UnregisterStep`/`UpdateStep`/`ListSteps`
/// (§6.1) plus `UpdateStepHealth`, backed by a `Journal`.
pub struct StepCatalog<J: Journal> {
    journal: J,
    projection: RwLock<Projection>,
}

impl<J: Journal> StepCatalog<J> {
    /// Build a catalog and replay the partition stream to warm the
    /// in-memory projection.
    pub async fn load(journal: J) -> Result<Self, CatalogError> {
        let events = journal.load_events(PARTITION_STREAM_ID, 0).await?;
        let mut projection = Projection::default();
        for stored in &events {
            let event: PartitionEvent = serde_json::from_value(stored.data.clone())?;
            projection.apply(&event);
        }
        Ok(Self {
            journal,
            projection: RwLock::new(projection),
        })
    }

    async fn append(&self, event: PartitionEvent) -> Result<(), CatalogError> {
        let version = self.journal.get_stream_version(PARTITION_STREAM_ID).await?;
        let new_event = NewEvent::new(event.event_type(), serde_json::to_value(&event)?);
        self.journal
            .append(
                PARTITION_STREAM_ID,
                PARTITION_STREAM_TYPE,
                Some(version),
                vec![new_event],
                serde_json::Value::Null,
            )
            .await?;
        self.projection.write().expect("catalog projection lock poisoned").apply(&event);
        Ok(())
    }

    pub async fn register_step(&self, step: Step) -> Result<(), CatalogError> {
        if self.projection.read().expect("catalog projection lock poisoned").steps.contains_key(&step.id) {
            return Err(CatalogError::StepExists(step.id.to_string()));
        }
        self.append(PartitionEvent::StepRegistered { step }).await
    }

    pub async fn unregister_step(&self, step_id: &StepId) -> Result<(), CatalogError> {
        if !self.projection.read().expect("catalog projection lock poisoned").steps.contains_key(step_id) {
            return Err(CatalogError::StepNotFound(step_id.to_string()));
        }
        self.append(PartitionEvent::StepUnregistered { step_id: step_id.clone() }).await
    }

    pub async fn update_step(&self, step: Step) -> Result<(), CatalogError> {
        if !self.projection.read().expect("catalog projection lock poisoned").steps.contains_key(&step.id) {
            return Err(CatalogError::StepNotFound(step.id.to_string()));
        }
        self.append(PartitionEvent::StepUpdated { step }).await
    }

    /// Idempotent health update: no-op when the reported state matches the
    /// last known one.
    pub async fn update_step_health(&self, step_id: &StepId, healthy: bool, error: Option<String>) -> Result<(), CatalogError> {
        let unchanged = self
            .projection
            .read()
            .expect("catalog projection lock poisoned")
            .healthy
            .get(step_id)
            .is_some_and(|(h, e)| *h == healthy && *e == error);
        if unchanged {
            return Ok(());
        }
        self.append(PartitionEvent::StepHealthUpdated {
            step_id: step_id.clone(),
            healthy,
            error,
        })
        .await
    }

    #[must_use]
    pub fn list_steps(&self) -> Vec<Step> {
        self.projection
            .read()
            .expect("catalog projection lock poisoned")
            .steps
            .values()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn get_step(&self, step_id: &StepId) -> Option<Step> {
        self.projection.read().expect("catalog projection lock poisoned").steps.get(step_id).cloned()
    }

    #[must_use]
    pub fn as_catalog_map(&self) -> HashMap<StepId, Step> {
        self.projection.read().expect("catalog projection lock poisoned").steps.clone()
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(err: serde_json::Error) -> Self {
        CatalogError::Journal(JournalError::Serialization(err))
    }
}
