//! Status and configuration enums shared across the engine.
//!
//! These back the three state machines (flow/step/work) and the catalog's
//! step/attribute shape. Kept flat and data-free; richer per-instance data
//! (timestamps, errors, retry counts) lives on the aggregate structs in
//! `glyph_workflow_engine::state`, not on these variants.

use serde::{Deserialize, Serialize};

// =============================================================================
// Aggregate status enums
// =============================================================================

/// Status of a flow aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Active,
    Completed,
    Failed,
}

impl FlowStatus {
    #[must_use]
    pub fn can_transition_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Active, Self::Completed) | (Self::Active, Self::Failed)
        )
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Status of a single step execution within a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    #[must_use]
    pub fn can_transition_to(self, target: Self) -> bool {
        use StepStatus::{Active, Completed, Failed, Pending, Skipped};
        matches!(
            (self, target),
            (Pending, Active)
                | (Pending, Skipped)
                | (Pending, Failed)
                | (Active, Completed)
                | (Active, Failed)
        )
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Status of a single work item (one parallel invocation of a step).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    Active,
    Succeeded,
    Failed,
    NotCompleted,
}

impl WorkStatus {
    #[must_use]
    pub fn can_transition_to(self, target: Self) -> bool {
        use WorkStatus::{Active, Failed, NotCompleted, Pending, Succeeded};
        matches!(
            (self, target),
            (Pending, Active)
                | (Active, Succeeded)
                | (Active, Failed)
                | (Active, NotCompleted)
                | (NotCompleted, Active)
                | (NotCompleted, Succeeded)
                | (NotCompleted, Failed)
        )
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

// =============================================================================
// Catalog enums
// =============================================================================

/// Role an attribute plays on a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrRole {
    Required,
    Optional,
    Output,
}

/// The kind of work a step performs, dispatched on by the work dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Sync,
    Async,
    Script,
    Flow,
}

/// Backoff curve used when computing a work item's next retry time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffType {
    Fixed,
    Linear,
    Exponential,
}
