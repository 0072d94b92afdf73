//! The per-flow aggregate: `FlowState`, its nested `StepExec`/`WorkItem`
//! records, and the pure appliers that replay raised events onto it.

mod flow_state;

pub use flow_state::{AttrValue, FlowState, StepExec, WorkItem};

use thiserror::Error;

/// Raised when an event implies a transition the relevant state machine
/// (flow/step/work) does not permit.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("invalid {aggregate} transition: {from} -> {to}")]
    InvalidTransition {
        aggregate: &'static str,
        from: String,
        to: String,
    },
}
