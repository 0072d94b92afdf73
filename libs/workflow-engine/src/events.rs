//! Wire-level event vocabulary (§6.3): flow-aggregate events applied by
//! `FlowState::apply`, and partition-aggregate events applied by the step
//! catalog. Persisted through `glyph_db::Journal` as opaque JSON; the
//! `event_type` tag mirrors the internal serde tag so a store row is
//! self-describing without deserializing the payload.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use glyph_domain::ids::{AttrName, StepId, Token};
use glyph_domain::step::Step;

/// An event raised against a flow aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum FlowEvent {
    FlowStarted {
        plan: crate::plan::ExecutionPlan,
        init: HashMap<AttrName, serde_json::Value>,
        metadata: HashMap<String, String>,
        labels: HashMap<String, String>,
        created_at: DateTime<Utc>,
    },
    FlowActivated,
    FlowCompleted {
        completed_at: DateTime<Utc>,
    },
    FlowFailed {
        error: String,
        completed_at: DateTime<Utc>,
    },
    FlowDeactivated,
    FlowArchived,
    FlowDigestUpdated,
    StepStarted {
        step_id: StepId,
        inputs: HashMap<AttrName, serde_json::Value>,
        work_items: Vec<(Token, HashMap<AttrName, serde_json::Value>)>,
        started_at: DateTime<Utc>,
    },
    StepCompleted {
        step_id: StepId,
        outputs: HashMap<AttrName, serde_json::Value>,
    },
    StepFailed {
        step_id: StepId,
        error: String,
    },
    StepSkipped {
        step_id: StepId,
        reason: String,
    },
    AttributeSet {
        name: AttrName,
        value: serde_json::Value,
        step_id: StepId,
        set_at: DateTime<Utc>,
    },
    WorkStarted {
        step_id: StepId,
        token: Token,
    },
    WorkSucceeded {
        step_id: StepId,
        token: Token,
        outputs: HashMap<AttrName, serde_json::Value>,
    },
    WorkFailed {
        step_id: StepId,
        token: Token,
        error: String,
    },
    WorkNotCompleted {
        step_id: StepId,
        token: Token,
        error: String,
        retry_token: Option<Token>,
    },
    RetryScheduled {
        step_id: StepId,
        token: Token,
        next_retry_at: DateTime<Utc>,
    },
    TimeoutScheduled {
        step_id: StepId,
        attr_name: AttrName,
        at: DateTime<Utc>,
    },
    TimeoutCanceled {
        step_id: StepId,
        attr_name: AttrName,
    },
    TimeoutFired {
        step_id: StepId,
        attr_name: AttrName,
    },
}

impl FlowEvent {
    /// The string tag used as the journal's `event_type` column, matching
    /// the internal serde tag.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::FlowStarted { .. } => "flow_started",
            Self::FlowActivated => "flow_activated",
            Self::FlowCompleted { .. } => "flow_completed",
            Self::FlowFailed { .. } => "flow_failed",
            Self::FlowDeactivated => "flow_deactivated",
            Self::FlowArchived => "flow_archived",
            Self::FlowDigestUpdated => "flow_digest_updated",
            Self::StepStarted { .. } => "step_started",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::StepSkipped { .. } => "step_skipped",
            Self::AttributeSet { .. } => "attribute_set",
            Self::WorkStarted { .. } => "work_started",
            Self::WorkSucceeded { .. } => "work_succeeded",
            Self::WorkFailed { .. } => "work_failed",
            Self::WorkNotCompleted { .. } => "work_not_completed",
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::TimeoutScheduled { .. } => "timeout_scheduled",
            Self::TimeoutCanceled { .. } => "timeout_canceled",
            Self::TimeoutFired { .. } => "timeout_fired",
        }
    }
}

/// An event raised against the partition-scope aggregate (the step
/// catalog and step health).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum PartitionEvent {
    StepRegistered { step: Step },
    StepUnregistered { step_id: StepId },
    StepUpdated { step: Step },
    StepHealthUpdated { step_id: StepId, healthy: bool, error: Option<String> },
}

impl PartitionEvent {
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StepRegistered { .. } => "step_registered",
            Self::StepUnregistered { .. } => "step_unregistered",
            Self::StepUpdated { .. } => "step_updated",
            Self::StepHealthUpdated { .. } => "step_health_updated",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_event_roundtrips_through_json() {
        let event = FlowEvent::StepSkipped {
            step_id: StepId::new("b").unwrap(),
            reason: "outputs not needed".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event_type"], "step_skipped");
        let back: FlowEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back.event_type(), "step_skipped");
    }
}
