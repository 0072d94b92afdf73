//! The flow transaction (§4.6): the heart of the engine. Every mutation to
//! a flow goes through `FlowTx::exec_flow`, which loads the aggregate,
//! lets a command raise events against live state, commits them with
//! optimistic concurrency, and returns a list of post-commit effects for
//! the caller to carry out — dispatching work, (re)scheduling timers,
//! starting child flows. Raising an event never has a side effect by
//! itself; only a committed effect does. `FlowTx` itself never dispatches
//! or schedules anything; that belongs to `engine::Engine`, which is the
//! only piece with the catalog, dispatcher and `WorkSink` all in scope.
//!
//! Grounded on the teacher's `engine::WorkflowEngine::execute_transition`,
//! which loads a `WorkflowState`, validates one transition, and appends one
//! event under a per-workflow lock; generalized here to a multi-event
//! command closure and a richer effect list, using `dashmap::DashMap` for
//! the per-flow lock table the way the teacher's in-memory store map is
//! sharded for concurrent access.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;

use glyph_db::{Journal, NewEvent};
use glyph_domain::enums::{AttrRole, StepStatus};
use glyph_domain::ids::{AttrName, StepId, Token};
use glyph_domain::step::Step;

use crate::dispatch::DispatchItem;
use crate::errors::FlowTxError;
use crate::events::FlowEvent;
use crate::memo::MemoCache;
use crate::retry::{calculate_next_retry_ms, should_retry};
use crate::state::{FlowState, StepExec};
use crate::workitems::expand_work_items;

const STREAM_TYPE: &str = "flow";

fn stream_id(flow_id: &str) -> String {
    format!("flow:{flow_id}")
}

/// Scheduler path for a step's optional-input timeout, shared with
/// `engine::Engine` so it can schedule and cancel against the same key
/// `FlowTx` computes for `Effect::ScheduleTimeout`/`CancelTimeout`.
#[must_use]
pub fn timeout_path(flow_id: &str, step_id: &StepId, attr: &AttrName) -> Vec<String> {
    vec!["timeout".to_string(), flow_id.to_string(), step_id.to_string(), attr.to_string()]
}

/// Scheduler path for a work item's retry task.
#[must_use]
pub fn retry_path(flow_id: &str, step_id: &StepId, token: Token) -> Vec<String> {
    vec!["retry".to_string(), flow_id.to_string(), step_id.to_string(), token.to_string()]
}

/// Scheduler path prefix covering every timeout task belonging to one flow.
#[must_use]
pub fn timeout_prefix(flow_id: &str) -> Vec<String> {
    vec!["timeout".to_string(), flow_id.to_string()]
}

/// Scheduler path prefix covering every retry task belonging to one flow.
#[must_use]
pub fn retry_prefix(flow_id: &str) -> Vec<String> {
    vec!["retry".to_string(), flow_id.to_string()]
}

/// A committed side effect, carried out strictly after the raising
/// transaction's events are durably appended. `engine::Engine` is the
/// effect interpreter: it owns the `Dispatcher`, `Scheduler`, `MemoCache`
/// and the catalog needed to act on each variant.
pub enum Effect {
    Dispatch { step_id: StepId, items: Vec<DispatchItem> },
    ScheduleTimeout { step_id: StepId, attr: AttrName, at: DateTime<Utc> },
    CancelTimeout { step_id: StepId, attr: AttrName },
    ScheduleRetry { step_id: StepId, token: Token, at: DateTime<Utc> },
    CancelRetry { step_id: StepId, token: Token },
    MemoPut { step: Step, inputs: HashMap<AttrName, serde_json::Value>, outputs: HashMap<AttrName, serde_json::Value> },
    CancelFlowTasks,
    StartChildFlow { step_id: StepId, token: Token, inputs: HashMap<AttrName, serde_json::Value> },
}

/// A running command's workspace: live state plus the events it raises.
/// `raise` both applies the event to `state` and records it for the
/// commit, mirroring the teacher's aggregator pattern.
pub struct Tx<'a> {
    pub state: &'a mut FlowState,
    pub raised: Vec<FlowEvent>,
}

impl<'a> Tx<'a> {
    fn raise(&mut self, flow_id: &str, event: FlowEvent) -> Result<(), FlowTxError> {
        self.state.apply(flow_id, &event)?;
        self.raised.push(event);
        Ok(())
    }
}

/// The flow transaction runner: owns the per-flow lock table and the
/// journal, and replays/commits one flow aggregate at a time under that
/// lock. Stateless otherwise — dispatch, scheduling and memoization are
/// the caller's concern.
pub struct FlowTx<J: Journal + Clone> {
    journal: J,
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl<J: Journal + Clone> FlowTx<J> {
    #[must_use]
    pub fn new(journal: J) -> Self {
        Self { journal, locks: DashMap::new() }
    }

    fn lock_for(&self, flow_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks.entry(flow_id.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Load the current `FlowState` without mutation.
    pub async fn get_flow_state(&self, flow_id: &str) -> Result<FlowState, FlowTxError> {
        self.replay(flow_id).await?.ok_or_else(|| FlowTxError::FlowNotFound(flow_id.to_string()))
    }

    async fn replay(&self, flow_id: &str) -> Result<Option<FlowState>, FlowTxError> {
        let sid = stream_id(flow_id);
        let snapshot = self.journal.get_latest_snapshot(&sid).await?;
        let (state, from_version) = match snapshot {
            Some(s) => (Some(serde_json::from_value::<FlowState>(s.state)?), s.version),
            None => (None, 0),
        };
        let events = self.journal.load_events(&sid, from_version).await?;
        if state.is_none() && events.is_empty() {
            return Ok(None);
        }
        let mut state = state.unwrap_or_else(blank_state);
        for stored in &events {
            let event: FlowEvent = serde_json::from_value(stored.data.clone())?;
            state.apply(flow_id, &event)?;
        }
        Ok(Some(state))
    }

    /// `execFlow(flowKey, cmd)`: the transactional wrapper every mutating
    /// operation runs through. Locks the flow, replays it, lets `cmd` raise
    /// events against live state, and commits them with optimistic
    /// concurrency keyed on the version read at the start of this call.
    async fn exec_flow<F>(&self, flow_id: &str, cmd: F) -> Result<(FlowState, Vec<Effect>), FlowTxError>
    where
        F: FnOnce(&mut Tx) -> Result<Vec<Effect>, FlowTxError>,
    {
        let lock = self.lock_for(flow_id);
        let _guard = lock.lock().await;

        let mut state = self.replay(flow_id).await?.unwrap_or_else(blank_state);
        let expected_version = state.version;

        let mut tx = Tx { state: &mut state, raised: Vec::new() };
        let effects = cmd(&mut tx)?;
        let raised = tx.raised;

        if raised.is_empty() {
            return Ok((state, effects));
        }

        let new_events: Result<Vec<NewEvent>, serde_json::Error> = raised
            .iter()
            .map(|e| Ok(NewEvent::new(e.event_type(), serde_json::to_value(e)?)))
            .collect();
        let new_events = new_events?;

        self.journal
            .append(&stream_id(flow_id), STREAM_TYPE, Some(expected_version), new_events, serde_json::Value::Null)
            .await?;

        Ok((state, effects))
    }

    // ---- StartFlow (§4.6) ----------------------------------------------

    pub async fn start_flow(
        &self,
        flow_id: &str,
        plan: crate::plan::ExecutionPlan,
        init: HashMap<AttrName, serde_json::Value>,
        metadata: HashMap<String, String>,
        labels: HashMap<String, String>,
        catalog: &HashMap<StepId, Step>,
        predicate_failures: &HashSet<StepId>,
        memo: &MemoCache,
        now: DateTime<Utc>,
    ) -> Result<Vec<Effect>, FlowTxError> {
        if self.replay(flow_id).await?.is_some() {
            return Err(FlowTxError::FlowExists(flow_id.to_string()));
        }

        plan.validate_inputs(&init).map_err(|missing| {
            FlowTxError::InvalidConfig(format!(
                "missing required inputs: {}",
                missing.iter().map(AttrName::as_str).collect::<Vec<_>>().join(", ")
            ))
        })?;

        let (_, effects) = self
            .exec_flow(flow_id, move |tx| {
                tx.raise(
                    flow_id,
                    FlowEvent::FlowStarted {
                        plan: plan.clone(),
                        init: init.clone(),
                        metadata: metadata.clone(),
                        labels: labels.clone(),
                        created_at: now,
                    },
                )?;

                let mut effects = Vec::new();
                if tx.state.is_terminal() {
                    return Ok(effects);
                }

                let initial: Vec<StepId> = find_initial_steps(tx.state);
                for step_id in initial {
                    prepare_step(tx, &step_id, catalog, predicate_failures, memo, now, &mut effects)?;
                }
                schedule_initial_timeouts(tx.state, now, &mut effects);

                // A memoized initial step can settle entirely within the loop
                // above; re-run the same cascade `follow_up` runs after a work
                // completion so a flow that resolves purely from cache hits
                // still reaches its ready downstream steps and its terminal state.
                skip_pending_unused(tx, flow_id)?;
                check_unreachable(tx, flow_id)?;
                start_ready_pending_steps(tx, catalog, predicate_failures, memo, now, &mut effects)?;
                check_terminal(tx, flow_id, now, &mut effects)?;
                Ok(effects)
            })
            .await?;

        Ok(effects)
    }

    // ---- CompleteWork / FailWork / NotCompleteWork (§4.6) --------------

    pub async fn complete_work(
        &self,
        flow_id: &str,
        step_id: &StepId,
        token: Token,
        outputs: HashMap<AttrName, serde_json::Value>,
        catalog: &HashMap<StepId, Step>,
        predicate_failures: &HashSet<StepId>,
        memo: &MemoCache,
        now: DateTime<Utc>,
    ) -> Result<Vec<Effect>, FlowTxError> {
        let step_id_owned = step_id.clone();
        let (state, mut effects) = self
            .exec_flow(flow_id, move |tx| {
                tx.raise(flow_id, FlowEvent::WorkSucceeded { step_id: step_id_owned.clone(), token, outputs })?;
                let mut effects = vec![Effect::CancelRetry { step_id: step_id_owned.clone(), token }];
                effects.extend(follow_up(tx, &step_id_owned, catalog, predicate_failures, memo, now, flow_id)?);
                Ok(effects)
            })
            .await?;

        if let Some(step) = catalog.get(step_id) {
            if step.memoizable {
                if let Some(item) = state.executions.get(step_id).and_then(|exec| exec.work_items.get(&token)) {
                    effects.push(Effect::MemoPut { step: step.clone(), inputs: item.inputs.clone(), outputs: item.outputs.clone() });
                }
            }
        }

        Ok(effects)
    }

    pub async fn fail_work(
        &self,
        flow_id: &str,
        step_id: &StepId,
        token: Token,
        message: String,
        catalog: &HashMap<StepId, Step>,
        predicate_failures: &HashSet<StepId>,
        memo: &MemoCache,
        now: DateTime<Utc>,
    ) -> Result<Vec<Effect>, FlowTxError> {
        let step_id_owned = step_id.clone();
        let (_, effects) = self
            .exec_flow(flow_id, move |tx| {
                tx.raise(flow_id, FlowEvent::WorkFailed { step_id: step_id_owned.clone(), token, error: message.clone() })?;
                let mut effects = vec![Effect::CancelRetry { step_id: step_id_owned.clone(), token }];
                effects.extend(follow_up(tx, &step_id_owned, catalog, predicate_failures, memo, now, flow_id)?);
                Ok(effects)
            })
            .await?;
        Ok(effects)
    }

    pub async fn not_complete_work(
        &self,
        flow_id: &str,
        step_id: &StepId,
        token: Token,
        message: String,
        catalog: &HashMap<StepId, Step>,
        predicate_failures: &HashSet<StepId>,
        memo: &MemoCache,
        now: DateTime<Utc>,
    ) -> Result<Vec<Effect>, FlowTxError> {
        let step_id_owned = step_id.clone();
        let step = catalog.get(step_id).ok_or_else(|| FlowTxError::StepNotFound(step_id.to_string()))?.clone();

        let (_, effects) = self
            .exec_flow(flow_id, move |tx| {
                let exec = tx
                    .state
                    .executions
                    .get(&step_id_owned)
                    .ok_or_else(|| FlowTxError::StepNotInPlan { step: step_id_owned.to_string() })?;
                let retry_count = exec.work_items.get(&token).map_or(0, |w| w.retry_count);

                let eligible = step.work_config.is_some_and(|cfg| should_retry(&cfg, retry_count)) && !step.memoizable;
                let retry_token = if eligible { Some(Token::new()) } else { None };

                tx.raise(
                    flow_id,
                    FlowEvent::WorkNotCompleted { step_id: step_id_owned.clone(), token, error: message.clone(), retry_token },
                )?;

                let mut effects = Vec::new();
                if let (Some(retry_token), Some(cfg)) = (retry_token, step.work_config) {
                    let delay_ms = calculate_next_retry_ms(&cfg, retry_count);
                    let at = now + chrono::Duration::milliseconds(delay_ms as i64);
                    tx.raise(
                        flow_id,
                        FlowEvent::RetryScheduled { step_id: step_id_owned.clone(), token: retry_token, next_retry_at: at },
                    )?;
                    effects.push(Effect::ScheduleRetry { step_id: step_id_owned.clone(), token: retry_token, at });
                } else {
                    // `NotCompleted` is never terminal on its own (§9); once no
                    // retry is scheduled, settle the attempt as a failure so the
                    // step can aggregate and the flow can move on.
                    tx.raise(flow_id, FlowEvent::WorkFailed { step_id: step_id_owned.clone(), token, error: message.clone() })?;
                    effects.extend(follow_up(tx, &step_id_owned, catalog, predicate_failures, memo, now, flow_id)?);
                }
                Ok(effects)
            })
            .await?;

        Ok(effects)
    }

    /// Re-activate a `NotCompleted` work item when its retry task fires, and
    /// return the items ready to redispatch.
    pub async fn activate_retry(
        &self,
        flow_id: &str,
        step_id: &StepId,
        token: Token,
    ) -> Result<Option<HashMap<AttrName, serde_json::Value>>, FlowTxError> {
        let step_id_owned = step_id.clone();
        let (state, _) = self
            .exec_flow(flow_id, move |tx| {
                tx.raise(flow_id, FlowEvent::WorkStarted { step_id: step_id_owned.clone(), token })?;
                Ok(Vec::new())
            })
            .await?;

        Ok(state.executions.get(step_id).and_then(|exec| exec.work_items.get(&token)).map(|item| item.inputs.clone()))
    }

    /// A scheduled optional-input timeout has fired: record it and
    /// re-evaluate readiness, since `canStartStepAt` now treats the
    /// outstanding optional input as no longer blocking.
    pub async fn fire_timeout(
        &self,
        flow_id: &str,
        step_id: &StepId,
        attr: &AttrName,
        catalog: &HashMap<StepId, Step>,
        predicate_failures: &HashSet<StepId>,
        memo: &MemoCache,
        now: DateTime<Utc>,
    ) -> Result<Vec<Effect>, FlowTxError> {
        let step_id_owned = step_id.clone();
        let attr_owned = attr.clone();
        let (_, effects) = self
            .exec_flow(flow_id, move |tx| {
                tx.raise(flow_id, FlowEvent::TimeoutFired { step_id: step_id_owned.clone(), attr_name: attr_owned })?;
                let mut effects = Vec::new();
                start_ready_pending_steps(tx, catalog, predicate_failures, memo, now, &mut effects)?;
                check_terminal(tx, flow_id, now, &mut effects)?;
                Ok(effects)
            })
            .await?;
        Ok(effects)
    }
}

fn blank_state() -> FlowState {
    FlowState {
        id: String::new(),
        status: glyph_domain::enums::FlowStatus::Active,
        created_at: Utc::now(),
        completed_at: None,
        error: None,
        plan: crate::plan::ExecutionPlan {
            goals: Vec::new(),
            steps: HashMap::new(),
            attributes: std::collections::BTreeMap::new(),
            required: Vec::new(),
        },
        metadata: HashMap::new(),
        labels: HashMap::new(),
        attributes: HashMap::new(),
        executions: HashMap::new(),
        version: 0,
    }
}

/// Steps with no unresolved required inputs at `FlowStarted` time.
fn find_initial_steps(state: &FlowState) -> Vec<StepId> {
    state
        .plan
        .steps
        .values()
        .filter(|step| step.required_inputs().all(|attr| state.attributes.contains_key(attr)))
        .map(|step| step.id.clone())
        .collect()
}

/// `prepareStep` (§4.6, internal): called for a `Pending` step once its
/// inputs are ready. A step whose predicate evaluated false (per
/// `predicate_failures`, resolved by the engine before entering this
/// transaction, since evaluating a predicate is a collaborator call and
/// this transaction is pure) is settled `Skipped` instead, its mock/real
/// body never invoked. Otherwise fans the step's inputs out into work
/// items and raises `StepStarted` + one `WorkStarted` per item in the same
/// transaction, so the work items never sit observable in `Pending`
/// outside a commit.
///
/// `MemoCache` is pure in-memory lookup, not a collaborator call, so unlike
/// predicate evaluation it's consulted right here: a memoizable step's work
/// item with a cache hit raises `WorkStarted` then `WorkSucceeded` with the
/// cached outputs in this same transaction and is left out of the dispatch
/// batch entirely (§4.3) — the real step body, whatever it is, is never
/// invoked for that item. A step whose items are all cache hits is settled
/// the moment this function raises its events, the same way it would be
/// once its real dispatched work later completes.
fn prepare_step(
    tx: &mut Tx,
    step_id: &StepId,
    catalog: &HashMap<StepId, Step>,
    predicate_failures: &HashSet<StepId>,
    memo: &MemoCache,
    now: DateTime<Utc>,
    effects: &mut Vec<Effect>,
) -> Result<(), FlowTxError> {
    let exec = tx.state.executions.get(step_id).ok_or_else(|| FlowTxError::StepNotInPlan { step: step_id.to_string() })?;
    if exec.status != StepStatus::Pending {
        return Err(FlowTxError::StepAlreadyPending { step: step_id.to_string() });
    }

    if predicate_failures.contains(step_id) {
        let flow_id = tx.state.id.clone();
        tx.raise(&flow_id, FlowEvent::StepSkipped { step_id: step_id.clone(), reason: "predicate returned false".to_string() })?;
        return Ok(());
    }

    let step = catalog.get(step_id).ok_or_else(|| FlowTxError::StepNotFound(step_id.to_string()))?.clone();

    let mut inputs = HashMap::new();
    for (attr, spec) in &step.attributes {
        if spec.role == AttrRole::Output {
            continue;
        }
        if let Some(value) = tx.state.attributes.get(attr) {
            inputs.insert(attr.clone(), value.value.clone());
        } else if let Some(default) = &spec.default {
            inputs.insert(attr.clone(), default.clone());
        }
    }

    let work_inputs = expand_work_items(&step, step_id.as_str(), &inputs)?;
    let mut work_items = Vec::with_capacity(work_inputs.len());
    for item_inputs in work_inputs {
        work_items.push((Token::new(), item_inputs));
    }

    let flow_id = tx.state.id.clone();
    tx.raise(
        &flow_id,
        FlowEvent::StepStarted { step_id: step_id.clone(), inputs, work_items: work_items.clone(), started_at: now },
    )?;

    let mut dispatch_items = Vec::with_capacity(work_items.len());
    for (token, item_inputs) in work_items {
        tx.raise(&flow_id, FlowEvent::WorkStarted { step_id: step_id.clone(), token })?;

        let cached = if step.memoizable { memo.get(&step, &item_inputs) } else { None };
        if let Some(outputs) = cached {
            tx.raise(&flow_id, FlowEvent::WorkSucceeded { step_id: step_id.clone(), token, outputs })?;
        } else {
            dispatch_items.push(DispatchItem { token, inputs: item_inputs });
        }
    }

    if !dispatch_items.is_empty() {
        effects.push(Effect::Dispatch { step_id: step_id.clone(), items: dispatch_items });
    }

    settle_step_if_terminal(tx, step_id, &flow_id, now, effects)?;
    Ok(())
}

/// `areOutputsNeeded`.
fn are_outputs_needed(state: &FlowState, step_id: &StepId) -> bool {
    if state.plan.goals.contains(step_id) {
        return true;
    }
    let Some(step) = state.plan.steps.get(step_id) else { return false };
    step.outputs().any(|attr| {
        !state.attributes.contains_key(attr)
            && state.plan.attributes.get(attr).is_some_and(|edges| {
                edges.consumers.iter().any(|c| state.executions.get(c).map(|e| e.status) == Some(StepStatus::Pending))
            })
    })
}

/// `skipPendingUnused`: mark any pending step whose outputs are no longer
/// needed as `Skipped`.
fn skip_pending_unused(tx: &mut Tx, flow_id: &str) -> Result<(), FlowTxError> {
    let candidates: Vec<StepId> = tx
        .state
        .executions
        .iter()
        .filter(|(id, exec)| exec.status == StepStatus::Pending && !are_outputs_needed(tx.state, id))
        .map(|(id, _)| id.clone())
        .collect();
    for step_id in candidates {
        tx.raise(flow_id, FlowEvent::StepSkipped { step_id, reason: "outputs not needed".to_string() })?;
    }
    Ok(())
}

/// `checkUnreachable`: fail a pending step whose required input has no
/// living provider path left.
fn check_unreachable(tx: &mut Tx, flow_id: &str) -> Result<(), FlowTxError> {
    let candidates: Vec<StepId> = tx
        .state
        .executions
        .iter()
        .filter(|(id, exec)| exec.status == StepStatus::Pending && has_unreachable_input(tx.state, id))
        .map(|(id, _)| id.clone())
        .collect();
    for step_id in candidates {
        tx.raise(flow_id, FlowEvent::StepFailed { step_id, error: "required input no longer available".to_string() })?;
    }
    Ok(())
}

fn has_unreachable_input(state: &FlowState, step_id: &StepId) -> bool {
    let Some(step) = state.plan.steps.get(step_id) else { return false };
    step.required_inputs().any(|attr| {
        if state.attributes.contains_key(attr) {
            return false;
        }
        let providers = state.plan.attributes.get(attr).map(|e| e.providers.as_slice()).unwrap_or(&[]);
        if providers.is_empty() {
            return false; // caught by plan.required at StartFlow time, not here.
        }
        providers
            .iter()
            .all(|p| state.executions.get(p).map(|e| e.status.is_terminal() && e.status != StepStatus::Completed).unwrap_or(true))
    })
}

/// `startReadyPendingSteps`.
fn start_ready_pending_steps(
    tx: &mut Tx,
    catalog: &HashMap<StepId, Step>,
    predicate_failures: &HashSet<StepId>,
    memo: &MemoCache,
    now: DateTime<Utc>,
    effects: &mut Vec<Effect>,
) -> Result<(), FlowTxError> {
    loop {
        let ready: Vec<StepId> = tx
            .state
            .executions
            .iter()
            .filter(|(id, exec)| exec.status == StepStatus::Pending)
            .filter(|(id, _)| can_start_step_at(tx.state, id, now).0)
            .map(|(id, _)| id.clone())
            .collect();
        if ready.is_empty() {
            break;
        }
        for step_id in ready {
            prepare_step(tx, &step_id, catalog, predicate_failures, memo, now, effects)?;
        }
    }
    Ok(())
}

/// `canStartStepAt`: `(ready, next_relevant_instant)`. A step is ready once
/// every required input is present and either no optional input is still
/// outstanding or every outstanding one has passed its timeout deadline.
fn can_start_step_at(state: &FlowState, step_id: &StepId, now: DateTime<Utc>) -> (bool, Option<DateTime<Utc>>) {
    let Some(step) = state.plan.steps.get(step_id) else { return (false, None) };
    if state.executions.get(step_id).map(|e| e.status) != Some(StepStatus::Pending) {
        return (false, None);
    }
    if !are_outputs_needed(state, step_id) {
        return (false, None);
    }
    for attr in step.required_inputs() {
        if !state.attributes.contains_key(attr) {
            return (false, None);
        }
    }

    let anchor = step.required_inputs().filter_map(|attr| state.attributes.get(attr).map(|v| v.set_at)).max().unwrap_or(state.created_at);

    let mut next_relevant: Option<DateTime<Utc>> = None;
    for (attr, spec) in &step.attributes {
        if spec.role != AttrRole::Optional || state.attributes.contains_key(attr) {
            continue;
        }
        let has_provider = state.plan.attributes.get(attr).is_some_and(|e| !e.providers.is_empty());
        if !has_provider {
            continue;
        }
        let timeout_ms = spec.timeout_ms.unwrap_or(0);
        if timeout_ms == 0 {
            continue;
        }
        let deadline = anchor + chrono::Duration::milliseconds(timeout_ms as i64);
        if now < deadline {
            next_relevant = Some(next_relevant.map_or(deadline, |d| d.min(deadline)));
        }
    }

    (next_relevant.is_none(), next_relevant)
}

fn schedule_initial_timeouts(state: &FlowState, now: DateTime<Utc>, effects: &mut Vec<Effect>) {
    for step in state.plan.steps.values() {
        schedule_step_timeouts(state, step, now, effects);
    }
}

fn schedule_step_timeouts(state: &FlowState, step: &Step, now: DateTime<Utc>, effects: &mut Vec<Effect>) {
    let anchor = step.required_inputs().filter_map(|attr| state.attributes.get(attr).map(|v| v.set_at)).max().unwrap_or(state.created_at);
    for (attr, spec) in &step.attributes {
        if spec.role != AttrRole::Optional || state.attributes.contains_key(attr) {
            continue;
        }
        if let Some(timeout_ms) = spec.timeout_ms.filter(|t| *t > 0) {
            let at = anchor + chrono::Duration::milliseconds(timeout_ms as i64);
            if at >= now {
                effects.push(Effect::ScheduleTimeout { step_id: step.id.clone(), attr: attr.clone(), at });
            }
        }
    }
}

/// `checkTerminal`: raise `FlowCompleted`/`FlowFailed` once every goal has
/// settled, and on termination cancel tasks and mark for deactivation.
fn check_terminal(tx: &mut Tx, flow_id: &str, now: DateTime<Utc>, effects: &mut Vec<Effect>) -> Result<(), FlowTxError> {
    if tx.state.is_terminal() {
        return Ok(());
    }
    let goal_statuses: Vec<StepStatus> =
        tx.state.plan.goals.iter().map(|g| tx.state.executions.get(g).map(|e| e.status).unwrap_or(StepStatus::Pending)).collect();

    if goal_statuses.iter().any(|s| !s.is_terminal()) {
        return Ok(());
    }

    let failed_goal = tx.state.plan.goals.iter().find(|g| tx.state.executions.get(*g).map(|e| e.status) == Some(StepStatus::Failed));

    if let Some(goal) = failed_goal {
        let reason = tx
            .state
            .executions
            .get(goal)
            .and_then(|e| e.error.clone())
            .map(|msg| format!("step {goal} failed: {msg}"))
            .unwrap_or_else(|| format!("step {goal} failed"));
        tx.raise(flow_id, FlowEvent::FlowFailed { error: reason, completed_at: now })?;
    } else if goal_statuses.iter().all(|s| matches!(s, StepStatus::Completed | StepStatus::Skipped)) {
        tx.raise(flow_id, FlowEvent::FlowCompleted { completed_at: now })?;
    } else {
        tx.raise(flow_id, FlowEvent::FlowFailed { error: "goal unreachable: failed steps".to_string(), completed_at: now })?;
    }

    effects.push(Effect::CancelFlowTasks);
    tx.raise(flow_id, FlowEvent::FlowDigestUpdated)?;
    if tx.state.all_work_terminal() {
        tx.raise(flow_id, FlowEvent::FlowDeactivated)?;
    }
    Ok(())
}

/// Shared follow-up after `WorkSucceeded`/`WorkFailed`/`WorkNotCompleted`
/// (the non-retry path): settle the step, re-evaluate unused/unreachable
/// pending steps, start what's ready, then check for flow termination.
fn follow_up(
    tx: &mut Tx,
    step_id: &StepId,
    catalog: &HashMap<StepId, Step>,
    predicate_failures: &HashSet<StepId>,
    memo: &MemoCache,
    now: DateTime<Utc>,
    flow_id: &str,
) -> Result<Vec<Effect>, FlowTxError> {
    let mut effects = Vec::new();
    settle_step_if_terminal(tx, step_id, flow_id, now, &mut effects)?;
    skip_pending_unused(tx, flow_id)?;
    check_unreachable(tx, flow_id)?;
    start_ready_pending_steps(tx, catalog, predicate_failures, memo, now, &mut effects)?;
    check_terminal(tx, flow_id, now, &mut effects)?;
    Ok(effects)
}

/// Aggregate work outputs into step outputs/attributes once every work
/// item for `step_id` is terminal. Every newly set attribute cancels any
/// outstanding timeout waiting on it as an optional input.
fn settle_step_if_terminal(tx: &mut Tx, step_id: &StepId, flow_id: &str, now: DateTime<Utc>, effects: &mut Vec<Effect>) -> Result<(), FlowTxError> {
    let Some(exec) = tx.state.executions.get(step_id) else { return Ok(()) };
    if exec.status != StepStatus::Active || !exec.all_work_terminal() {
        return Ok(());
    }

    let any_succeeded = exec.work_items.values().any(|w| w.status == glyph_domain::enums::WorkStatus::Succeeded);
    let any_failed = exec.work_items.values().any(|w| w.status == glyph_domain::enums::WorkStatus::Failed);

    if any_failed && !any_succeeded {
        let message = exec.work_items.values().find_map(|w| w.error.clone()).unwrap_or_else(|| "work not completed".to_string());
        tx.raise(flow_id, FlowEvent::StepFailed { step_id: step_id.clone(), error: message })?;
        return Ok(());
    }

    let outputs = aggregate_outputs(exec);
    tx.raise(flow_id, FlowEvent::StepCompleted { step_id: step_id.clone(), outputs: outputs.clone() })?;

    let unset: Vec<AttrName> = outputs.keys().filter(|a| !tx.state.attributes.contains_key(a)).cloned().collect();
    for attr in unset {
        if let Some(value) = outputs.get(&attr) {
            tx.raise(flow_id, FlowEvent::AttributeSet { name: attr.clone(), value: value.clone(), step_id: step_id.clone(), set_at: now })?;
            for consumer in tx.state.plan.steps.values().filter(|s| s.attributes.get(&attr).is_some_and(|spec| spec.role == AttrRole::Optional)) {
                effects.push(Effect::CancelTimeout { step_id: consumer.id.clone(), attr: attr.clone() });
            }
        }
    }
    Ok(())
}

/// Per-output-attribute aggregation (§4.6 step 1): a single scalar work
/// item's outputs pass through; multiple (`ForEach`) work items are
/// grouped into a list of `{ForEach inputs..., output}` maps per output
/// attribute.
fn aggregate_outputs(exec: &StepExec) -> HashMap<AttrName, serde_json::Value> {
    let succeeded: Vec<_> = exec.work_items.values().filter(|w| w.status == glyph_domain::enums::WorkStatus::Succeeded).collect();

    if succeeded.len() == 1 {
        return succeeded[0].outputs.clone();
    }

    let mut by_attr: HashMap<AttrName, Vec<serde_json::Value>> = HashMap::new();
    for item in &succeeded {
        for (attr, value) in &item.outputs {
            let mut entry = serde_json::Map::new();
            for (in_attr, in_value) in &item.inputs {
                entry.insert(in_attr.as_str().to_string(), in_value.clone());
            }
            entry.insert(attr.as_str().to_string(), value.clone());
            by_attr.entry(attr.clone()).or_default().push(serde_json::Value::Object(entry));
        }
    }
    by_attr.into_iter().map(|(attr, list)| (attr, serde_json::Value::Array(list))).collect()
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;
    use crate::plan::build_plan;
    use glyph_db::InMemoryJournal;
    use glyph_domain::enums::StepType;
    use glyph_domain::step::AttrSpec;

    fn test_memo() -> MemoCache {
        MemoCache::new(NonZeroUsize::new(16).unwrap())
    }

    fn step(id: &str, inputs: &[(&str, bool)], outputs: &[&str]) -> Step {
        let mut attributes = HashMap::new();
        for (name, required) in inputs {
            attributes.insert(
                AttrName::new(*name).unwrap(),
                AttrSpec {
                    role: if *required { AttrRole::Required } else { AttrRole::Optional },
                    attr_type: "string".into(),
                    default: None,
                    timeout_ms: None,
                    for_each: false,
                    mapping: None,
                },
            );
        }
        for name in outputs {
            attributes.insert(
                AttrName::new(*name).unwrap(),
                AttrSpec { role: AttrRole::Output, attr_type: "string".into(), default: None, timeout_ms: None, for_each: false, mapping: None },
            );
        }
        Step {
            id: StepId::new(id).unwrap(),
            name: id.into(),
            version: 1,
            step_type: StepType::Sync,
            attributes,
            script: None,
            predicate: None,
            http: None,
            work_config: None,
            flow: None,
            memoizable: false,
        }
    }

    #[tokio::test]
    async fn start_flow_activates_initial_steps() {
        let producer = step("producer", &[], &["value"]);
        let catalog: HashMap<StepId, Step> = [(producer.id.clone(), producer.clone())].into_iter().collect();
        let plan = build_plan(&catalog, &[StepId::new("producer").unwrap()], &HashMap::new()).unwrap();

        let flow_tx = FlowTx::new(InMemoryJournal::new());
        let memo = test_memo();
        flow_tx
            .start_flow("wf-1", plan, HashMap::new(), HashMap::new(), HashMap::new(), &catalog, &HashSet::new(), &memo, Utc::now())
            .await
            .unwrap();

        let state = flow_tx.get_flow_state("wf-1").await.unwrap();
        assert_eq!(state.executions[&StepId::new("producer").unwrap()].status, StepStatus::Active);
    }

    #[tokio::test]
    async fn starting_twice_is_rejected() {
        let producer = step("producer", &[], &["value"]);
        let catalog: HashMap<StepId, Step> = [(producer.id.clone(), producer.clone())].into_iter().collect();
        let plan = build_plan(&catalog, &[StepId::new("producer").unwrap()], &HashMap::new()).unwrap();

        let flow_tx = FlowTx::new(InMemoryJournal::new());
        let memo = test_memo();
        let now = Utc::now();
        flow_tx
            .start_flow("wf-1", plan.clone(), HashMap::new(), HashMap::new(), HashMap::new(), &catalog, &HashSet::new(), &memo, now)
            .await
            .unwrap();
        let err = flow_tx
            .start_flow("wf-1", plan, HashMap::new(), HashMap::new(), HashMap::new(), &catalog, &HashSet::new(), &memo, now)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowTxError::FlowExists(_)));
    }

    #[tokio::test]
    async fn completing_work_settles_step_and_flow() {
        let producer = step("producer", &[], &["value"]);
        let catalog: HashMap<StepId, Step> = [(producer.id.clone(), producer.clone())].into_iter().collect();
        let plan = build_plan(&catalog, &[StepId::new("producer").unwrap()], &HashMap::new()).unwrap();

        let flow_tx = FlowTx::new(InMemoryJournal::new());
        let memo = test_memo();
        let now = Utc::now();
        flow_tx
            .start_flow("wf-1", plan, HashMap::new(), HashMap::new(), HashMap::new(), &catalog, &HashSet::new(), &memo, now)
            .await
            .unwrap();

        let step_id = StepId::new("producer").unwrap();
        let state = flow_tx.get_flow_state("wf-1").await.unwrap();
        let token = *state.executions[&step_id].work_items.keys().next().unwrap();

        let mut outputs = HashMap::new();
        outputs.insert(AttrName::new("value").unwrap(), serde_json::json!("abc"));
        flow_tx.complete_work("wf-1", &step_id, token, outputs, &catalog, &HashSet::new(), &memo, now).await.unwrap();

        let state = flow_tx.get_flow_state("wf-1").await.unwrap();
        assert_eq!(state.executions[&step_id].status, StepStatus::Completed);
        assert_eq!(state.status, glyph_domain::enums::FlowStatus::Completed);
        assert_eq!(state.attributes[&AttrName::new("value").unwrap()].value, serde_json::json!("abc"));
    }

    #[tokio::test]
    async fn not_complete_without_retry_settles_step_as_failed() {
        let producer = step("producer", &[], &["value"]);
        let catalog: HashMap<StepId, Step> = [(producer.id.clone(), producer.clone())].into_iter().collect();
        let plan = build_plan(&catalog, &[StepId::new("producer").unwrap()], &HashMap::new()).unwrap();

        let flow_tx = FlowTx::new(InMemoryJournal::new());
        let memo = test_memo();
        let now = Utc::now();
        flow_tx
            .start_flow("wf-1", plan, HashMap::new(), HashMap::new(), HashMap::new(), &catalog, &HashSet::new(), &memo, now)
            .await
            .unwrap();

        let step_id = StepId::new("producer").unwrap();
        let state = flow_tx.get_flow_state("wf-1").await.unwrap();
        let token = *state.executions[&step_id].work_items.keys().next().unwrap();

        flow_tx.not_complete_work("wf-1", &step_id, token, "timed out".into(), &catalog, &HashSet::new(), &memo, now).await.unwrap();

        let state = flow_tx.get_flow_state("wf-1").await.unwrap();
        assert_eq!(state.executions[&step_id].status, StepStatus::Failed);
        assert_eq!(state.status, glyph_domain::enums::FlowStatus::Failed);
    }

    #[tokio::test]
    async fn memoized_step_settles_from_cache_without_dispatch() {
        let mut producer = step("producer", &[], &["value"]);
        producer.memoizable = true;
        let catalog: HashMap<StepId, Step> = [(producer.id.clone(), producer.clone())].into_iter().collect();
        let plan = build_plan(&catalog, &[StepId::new("producer").unwrap()], &HashMap::new()).unwrap();
        let step_id = StepId::new("producer").unwrap();

        let memo = test_memo();
        let mut cached = HashMap::new();
        cached.insert(AttrName::new("value").unwrap(), serde_json::json!("cached"));
        memo.put(&producer, &HashMap::new(), cached);

        let flow_tx = FlowTx::new(InMemoryJournal::new());
        let now = Utc::now();
        let effects = flow_tx
            .start_flow("wf-1", plan, HashMap::new(), HashMap::new(), HashMap::new(), &catalog, &HashSet::new(), &memo, now)
            .await
            .unwrap();

        assert!(!effects.iter().any(|e| matches!(e, Effect::Dispatch { .. })), "a cache hit must never dispatch");

        let state = flow_tx.get_flow_state("wf-1").await.unwrap();
        assert_eq!(state.executions[&step_id].status, StepStatus::Completed);
        assert_eq!(state.status, glyph_domain::enums::FlowStatus::Completed);
        assert_eq!(state.attributes[&AttrName::new("value").unwrap()].value, serde_json::json!("cached"));
    }
}
