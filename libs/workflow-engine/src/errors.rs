//! Per-component error enums and the facade-level `EngineError` that wraps
//! them, in the teacher's `OrchestrationError` style: one `thiserror` enum
//! per concern, `#[from]`-composed at the top.

use thiserror::Error;

use crate::dispatch::DispatchError;
use crate::mapping::MappingError;
use crate::plan::PlanError;
use crate::state::StateError;

/// Errors raised while building or mutating flow state inside a flow
/// transaction.
#[derive(Debug, Error)]
pub enum FlowTxError {
    #[error("flow not found: {0}")]
    FlowNotFound(String),

    #[error("flow already exists: {0}")]
    FlowExists(String),

    #[error("step not found: {0}")]
    StepNotFound(String),

    #[error("step already exists: {0}")]
    StepExists(String),

    #[error("step {step} is not part of this flow's plan")]
    StepNotInPlan { step: String },

    #[error("step {step} is already pending")]
    StepAlreadyPending { step: String },

    #[error("work item not found: {0}")]
    WorkItemNotFound(String),

    #[error("invalid flow query cursor")]
    InvalidFlowCursor,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("missing dependency: {0}")]
    MissingDependency(String),

    #[error("flow recovery required: {0}")]
    RecoverFlows(String),

    #[error("flow output missing: {0}")]
    FlowOutputMissing(String),

    #[error("partial parent metadata on flow {flow}: child flow relationships require parent_flow_id, parent_step_id and parent_work_item_token together")]
    PartialParentMetadata { flow: String },

    #[error("step {step} produced more than the maximum of {max} work items")]
    TooManyWorkItems { step: String, max: usize },

    #[error("unsupported step type: {0}")]
    UnsupportedStepType(String),

    /// Soft sentinel reported by a worker; eligible for retry, never a hard
    /// failure by itself.
    #[error("work not completed: {0}")]
    WorkNotCompleted(String),

    #[error("handler panicked: {0}")]
    HandlerPanicked(String),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Journal(#[from] glyph_db::JournalError),

    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Facade-level error returned by `Engine` methods.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    FlowTx(#[from] FlowTxError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Journal(#[from] glyph_db::JournalError),

    #[error("invalid configuration: {0}")]
    Config(String),
}
