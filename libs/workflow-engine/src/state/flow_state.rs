//! `FlowState` and its nested records, plus the pure appliers that replay
//! `FlowEvent`s onto them. Grounded on the teacher's
//! `state::workflow_state::WorkflowStateManager` (load from snapshot, apply
//! events, expose current/terminal queries) and `state::step_state::StepState`
//! (the `can_transition_to` match-on-tuple guard), generalized from a single
//! linear `current_step_id` cursor to the DAG-shaped `Executions` map this
//! engine's steps require.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use glyph_domain::enums::{FlowStatus, StepStatus, WorkStatus};
use glyph_domain::ids::{AttrName, StepId, Token};

use crate::events::FlowEvent;
use crate::plan::ExecutionPlan;
use crate::state::StateError;

/// A single attribute slot: written at most once per flow, first writer wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttrValue {
    pub value: serde_json::Value,
    pub step: Option<StepId>,
    pub set_at: DateTime<Utc>,
}

/// One parallel invocation attempt of a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub status: WorkStatus,
    pub inputs: HashMap<AttrName, serde_json::Value>,
    pub outputs: HashMap<AttrName, serde_json::Value>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    fn new(inputs: HashMap<AttrName, serde_json::Value>) -> Self {
        Self {
            status: WorkStatus::Pending,
            inputs,
            outputs: HashMap::new(),
            error: None,
            retry_count: 0,
            next_retry_at: None,
        }
    }

    fn transition(&mut self, to: WorkStatus) -> Result<(), StateError> {
        if !self.status.can_transition_to(to) {
            return Err(StateError::InvalidTransition {
                aggregate: "work",
                from: format!("{:?}", self.status),
                to: format!("{to:?}"),
            });
        }
        self.status = to;
        Ok(())
    }
}

/// One step's execution record within a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExec {
    pub status: StepStatus,
    pub inputs: HashMap<AttrName, serde_json::Value>,
    pub outputs: HashMap<AttrName, serde_json::Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub work_items: HashMap<Token, WorkItem>,
}

impl StepExec {
    fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            error: None,
            started_at: None,
            work_items: HashMap::new(),
        }
    }

    fn transition(&mut self, to: StepStatus) -> Result<(), StateError> {
        if !self.status.can_transition_to(to) {
            return Err(StateError::InvalidTransition {
                aggregate: "step",
                from: format!("{:?}", self.status),
                to: format!("{to:?}"),
            });
        }
        self.status = to;
        Ok(())
    }

    /// True once every work item has reached a terminal `WorkStatus`.
    #[must_use]
    pub fn all_work_terminal(&self) -> bool {
        self.work_items.values().all(|w| w.status.is_terminal())
    }
}

/// The per-flow aggregate. Created on `FlowStarted`; mutated only by
/// `apply`, itself only ever called with events raised inside a committed
/// flow transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowState {
    pub id: String,
    pub status: FlowStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub plan: ExecutionPlan,
    pub metadata: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub attributes: HashMap<AttrName, AttrValue>,
    pub executions: HashMap<StepId, StepExec>,
    /// Event-stream version this state reflects; used as `expected_version`
    /// on the next append.
    pub version: u64,
}

impl FlowState {
    /// Apply one event, advancing `version`. Pure: no I/O, no side effects.
    pub fn apply(&mut self, flow_id: &str, event: &FlowEvent) -> Result<(), StateError> {
        match event {
            FlowEvent::FlowStarted { plan, init, metadata, labels, created_at } => {
                self.id = flow_id.to_string();
                self.status = FlowStatus::Active;
                self.created_at = *created_at;
                self.plan = plan.clone();
                self.metadata = metadata.clone();
                self.labels = labels.clone();
                for step_id in plan.steps.keys() {
                    self.executions.insert(step_id.clone(), StepExec::pending());
                }
                for (name, value) in init {
                    self.attributes.entry(name.clone()).or_insert(AttrValue {
                        value: value.clone(),
                        step: None,
                        set_at: *created_at,
                    });
                }
            }
            FlowEvent::FlowActivated | FlowEvent::FlowArchived | FlowEvent::FlowDigestUpdated => {}
            FlowEvent::FlowCompleted { completed_at } => {
                self.transition_flow(FlowStatus::Completed)?;
                self.completed_at = Some(*completed_at);
            }
            FlowEvent::FlowFailed { error, completed_at } => {
                self.transition_flow(FlowStatus::Failed)?;
                self.completed_at = Some(*completed_at);
                self.error = Some(error.clone());
            }
            FlowEvent::FlowDeactivated => {}
            FlowEvent::StepStarted { step_id, inputs, work_items, started_at } => {
                let exec = self.step_mut(step_id)?;
                exec.transition(StepStatus::Active)?;
                exec.inputs = inputs.clone();
                exec.started_at = Some(*started_at);
                for (token, item_inputs) in work_items {
                    exec.work_items.insert(*token, WorkItem::new(item_inputs.clone()));
                }
            }
            FlowEvent::StepCompleted { step_id, outputs } => {
                let exec = self.step_mut(step_id)?;
                exec.transition(StepStatus::Completed)?;
                exec.outputs = outputs.clone();
            }
            FlowEvent::StepFailed { step_id, error } => {
                let exec = self.step_mut(step_id)?;
                exec.transition(StepStatus::Failed)?;
                exec.error = Some(error.clone());
            }
            FlowEvent::StepSkipped { step_id, reason } => {
                let exec = self.step_mut(step_id)?;
                exec.transition(StepStatus::Skipped)?;
                exec.error = Some(reason.clone());
            }
            FlowEvent::AttributeSet { name, value, step_id, set_at } => {
                self.attributes.entry(name.clone()).or_insert_with(|| AttrValue {
                    value: value.clone(),
                    step: Some(step_id.clone()),
                    set_at: *set_at,
                });
            }
            FlowEvent::WorkStarted { step_id, token } => {
                let work = self.work_mut(step_id, token)?;
                work.transition(WorkStatus::Active)?;
            }
            FlowEvent::WorkSucceeded { step_id, token, outputs } => {
                let work = self.work_mut(step_id, token)?;
                work.transition(WorkStatus::Succeeded)?;
                work.outputs = outputs.clone();
            }
            FlowEvent::WorkFailed { step_id, token, error } => {
                let work = self.work_mut(step_id, token)?;
                work.transition(WorkStatus::Failed)?;
                work.error = Some(error.clone());
            }
            FlowEvent::WorkNotCompleted { step_id, token, error, retry_token } => {
                let inputs = {
                    let work = self.work_mut(step_id, token)?;
                    work.transition(WorkStatus::NotCompleted)?;
                    work.error = Some(error.clone());
                    work.inputs.clone()
                };
                if let Some(retry) = retry_token {
                    let exec = self.step_mut(step_id)?;
                    let mut item = WorkItem::new(inputs);
                    item.retry_count = exec
                        .work_items
                        .get(token)
                        .map_or(0, |w| w.retry_count + 1);
                    exec.work_items.insert(*retry, item);
                }
            }
            FlowEvent::RetryScheduled { step_id, token, next_retry_at } => {
                let work = self.work_mut(step_id, token)?;
                work.next_retry_at = Some(*next_retry_at);
            }
            FlowEvent::TimeoutScheduled { .. }
            | FlowEvent::TimeoutCanceled { .. }
            | FlowEvent::TimeoutFired { .. } => {}
        }
        self.version += 1;
        Ok(())
    }

    fn transition_flow(&mut self, to: FlowStatus) -> Result<(), StateError> {
        if !self.status.can_transition_to(to) {
            return Err(StateError::InvalidTransition {
                aggregate: "flow",
                from: format!("{:?}", self.status),
                to: format!("{to:?}"),
            });
        }
        self.status = to;
        Ok(())
    }

    fn step_mut(&mut self, step_id: &StepId) -> Result<&mut StepExec, StateError> {
        self.executions.get_mut(step_id).ok_or_else(|| StateError::InvalidTransition {
            aggregate: "step",
            from: "missing".into(),
            to: step_id.to_string(),
        })
    }

    fn work_mut(&mut self, step_id: &StepId, token: &Token) -> Result<&mut WorkItem, StateError> {
        self.step_mut(step_id)?
            .work_items
            .get_mut(token)
            .ok_or_else(|| StateError::InvalidTransition {
                aggregate: "work",
                from: "missing".into(),
                to: token.to_string(),
            })
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    #[must_use]
    pub fn all_steps_terminal(&self) -> bool {
        self.executions.values().all(|e| e.status.is_terminal())
    }

    #[must_use]
    pub fn all_work_terminal(&self) -> bool {
        self.executions.values().all(StepExec::all_work_terminal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn empty_plan(goal: &str) -> ExecutionPlan {
        ExecutionPlan {
            goals: vec![StepId::new(goal).unwrap()],
            steps: HashMap::new(),
            attributes: BTreeMap::new(),
            required: Vec::new(),
        }
    }

    fn started(id: &str) -> FlowState {
        let mut state = FlowState {
            id: String::new(),
            status: FlowStatus::Active,
            created_at: Utc::now(),
            completed_at: None,
            error: None,
            plan: empty_plan(id),
            metadata: HashMap::new(),
            labels: HashMap::new(),
            attributes: HashMap::new(),
            executions: HashMap::new(),
            version: 0,
        };
        state.status = FlowStatus::Active;
        state.id = id.to_string();
        state
    }

    #[test]
    fn flow_cannot_complete_twice() {
        let mut state = started("wf-1");
        state
            .apply("wf-1", &FlowEvent::FlowCompleted { completed_at: Utc::now() })
            .unwrap();
        let err = state
            .apply("wf-1", &FlowEvent::FlowCompleted { completed_at: Utc::now() })
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { aggregate: "flow", .. }));
    }

    #[test]
    fn step_started_then_completed_tracks_outputs() {
        let mut state = started("wf-1");
        state.executions.insert(StepId::new("s").unwrap(), StepExec::pending());
        state
            .apply(
                "wf-1",
                &FlowEvent::StepStarted {
                    step_id: StepId::new("s").unwrap(),
                    inputs: HashMap::new(),
                    work_items: vec![],
                    started_at: Utc::now(),
                },
            )
            .unwrap();
        let mut outputs = HashMap::new();
        outputs.insert(AttrName::new("result").unwrap(), serde_json::json!("ok"));
        state
            .apply(
                "wf-1",
                &FlowEvent::StepCompleted { step_id: StepId::new("s").unwrap(), outputs: outputs.clone() },
            )
            .unwrap();
        let exec = &state.executions[&StepId::new("s").unwrap()];
        assert_eq!(exec.status, StepStatus::Completed);
        assert_eq!(exec.outputs, outputs);
    }

    #[test]
    fn work_not_completed_with_retry_token_inserts_new_pending_item() {
        let mut state = started("wf-1");
        let step_id = StepId::new("s").unwrap();
        state.executions.insert(step_id.clone(), StepExec::pending());
        let token = Token::new();
        state
            .apply(
                "wf-1",
                &FlowEvent::StepStarted {
                    step_id: step_id.clone(),
                    inputs: HashMap::new(),
                    work_items: vec![(token, HashMap::new())],
                    started_at: Utc::now(),
                },
            )
            .unwrap();
        state.apply("wf-1", &FlowEvent::WorkStarted { step_id: step_id.clone(), token }).unwrap();

        let retry_token = Token::new();
        state
            .apply(
                "wf-1",
                &FlowEvent::WorkNotCompleted {
                    step_id: step_id.clone(),
                    token,
                    error: "timed out".into(),
                    retry_token: Some(retry_token),
                },
            )
            .unwrap();

        let exec = &state.executions[&step_id];
        assert_eq!(exec.work_items[&token].status, WorkStatus::NotCompleted);
        assert_eq!(exec.work_items[&retry_token].status, WorkStatus::Pending);
        assert_eq!(exec.work_items[&retry_token].retry_count, 1);
    }

    #[test]
    fn attribute_is_written_once() {
        let mut state = started("wf-1");
        let name = AttrName::new("x").unwrap();
        let step_id = StepId::new("s").unwrap();
        state
            .apply(
                "wf-1",
                &FlowEvent::AttributeSet { name: name.clone(), value: serde_json::json!(1), step_id: step_id.clone(), set_at: Utc::now() },
            )
            .unwrap();
        state
            .apply(
                "wf-1",
                &FlowEvent::AttributeSet { name: name.clone(), value: serde_json::json!(2), step_id, set_at: Utc::now() },
            )
            .unwrap();
        assert_eq!(state.attributes[&name].value, serde_json::json!(1));
    }
}
