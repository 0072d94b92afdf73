//! `Engine`: the facade tying the flow transaction, the step catalog, the
//! dispatcher and the scheduler together. Every public operation in §6.1
//! is a method here.
//!
//! Grounded on the teacher's `engine::WorkflowOrchestrator`, the facade that
//! owned a config store, an event store, a handler registry and a goal
//! tracker and wired parse → state → transition → executor together;
//! generalized here so the orchestrator also owns the retry/timeout
//! scheduler and the memoization cache. Completion callbacks re-enter the
//! flow transaction through a per-flow `FlowScopedSink`, not the engine
//! itself, since one `Engine` spans every flow at once.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use glyph_db::Journal;
use glyph_domain::enums::{AttrRole, FlowStatus};
use glyph_domain::ids::{AttrName, StepId, Token};
use glyph_domain::step::{AttrSpec, Step};

use crate::catalog::{CatalogError, StepCatalog};
use crate::collaborators::{Clock, ScriptEnv, StepClient};
use crate::config::EngineConfig;
use crate::dispatch::{DispatchItem, Dispatcher, WorkSink};
use crate::errors::EngineError;
use crate::flow_tx::{retry_path, retry_prefix, timeout_path, timeout_prefix, Effect, FlowTx};
use crate::mapping::{input_facing_name, map_input, map_outputs};
use crate::memo::MemoCache;
use crate::plan::{build_plan, ExecutionPlan};
use crate::scheduler::Scheduler;
use crate::state::FlowState;

/// The orchestrator. Always held behind `Arc`: scheduled timers and
/// dispatched work items capture a clone of it to re-enter on completion.
pub struct Engine<J: Journal + Clone> {
    flow_tx: FlowTx<J>,
    catalog: Arc<StepCatalog<J>>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Scheduler,
    memo: MemoCache,
    clock: Arc<dyn Clock>,
    script_env: Arc<dyn ScriptEnv>,
}

impl<J: Journal + Clone + 'static> Engine<J> {
    /// Build an engine against `journal`, replaying the partition stream to
    /// warm the catalog.
    pub async fn new(
        journal: J,
        config: &EngineConfig,
        step_client: Arc<dyn StepClient>,
        script_env: Arc<dyn ScriptEnv>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, EngineError> {
        let catalog = Arc::new(StepCatalog::load(journal.clone()).await.map_err(catalog_to_engine_error)?);
        let dispatcher = Arc::new(Dispatcher::new(step_client, script_env.clone(), config.webhook_base_url.clone()));
        let memo_capacity = NonZeroUsize::new(config.memo_cache_capacity.max(1)).expect("max(1) is never zero");

        Ok(Arc::new(Self {
            flow_tx: FlowTx::new(journal),
            catalog,
            dispatcher,
            scheduler: Scheduler::new(),
            memo: MemoCache::new(memo_capacity),
            clock,
            script_env,
        }))
    }

    /// Start the background scheduler loop. Idempotent.
    pub fn start(&self) {
        self.scheduler.start();
    }

    /// Stop the scheduler without running remaining tasks.
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    // ---- Catalog (§6.1) --------------------------------------------------

    pub async fn register_step(&self, step: Step) -> Result<(), EngineError> {
        self.catalog.register_step(step).await.map_err(catalog_to_engine_error)
    }

    pub async fn unregister_step(&self, step_id: &StepId) -> Result<(), EngineError> {
        self.catalog.unregister_step(step_id).await.map_err(catalog_to_engine_error)
    }

    pub async fn update_step(&self, step: Step) -> Result<(), EngineError> {
        self.catalog.update_step(step).await.map_err(catalog_to_engine_error)
    }

    pub async fn update_step_health(&self, step_id: &StepId, healthy: bool, error: Option<String>) -> Result<(), EngineError> {
        self.catalog.update_step_health(step_id, healthy, error).await.map_err(catalog_to_engine_error)
    }

    #[must_use]
    pub fn list_steps(&self) -> Vec<Step> {
        self.catalog.list_steps()
    }

    #[must_use]
    pub fn get_step(&self, step_id: &StepId) -> Option<Step> {
        self.catalog.get_step(step_id)
    }

    // ---- Flow lifecycle (§6.1) -------------------------------------------

    pub async fn start_flow(
        self: &Arc<Self>,
        flow_id: &str,
        goals: &[StepId],
        init: HashMap<AttrName, serde_json::Value>,
        metadata: HashMap<String, String>,
        labels: HashMap<String, String>,
    ) -> Result<(), EngineError> {
        let catalog = self.catalog.as_catalog_map();
        let plan = build_plan(&catalog, goals, &init)?;
        let predicate_failures = self.predicate_failures(&plan, &catalog, &init).await;
        let now = self.clock.now();
        let effects = self.flow_tx.start_flow(flow_id, plan, init, metadata, labels, &catalog, &predicate_failures, &self.memo, now).await?;
        self.run_effects(flow_id, effects, &catalog).await;
        Ok(())
    }

    pub async fn get_flow_state(&self, flow_id: &str) -> Result<FlowState, EngineError> {
        Ok(self.flow_tx.get_flow_state(flow_id).await?)
    }

    pub async fn get_attribute(&self, flow_id: &str, attr: &AttrName) -> Result<Option<serde_json::Value>, EngineError> {
        let state = self.get_flow_state(flow_id).await?;
        Ok(state.attributes.get(attr).map(|v| v.value.clone()))
    }

    /// Evaluate every catalog step's predicate against `attributes`, for
    /// steps whose required inputs are already resolved. A compile or
    /// evaluation error is treated the same as a false predicate: the step
    /// is skipped rather than left to retry a broken predicate forever.
    async fn predicate_failures(
        &self,
        plan: &ExecutionPlan,
        catalog: &HashMap<StepId, Step>,
        attributes: &HashMap<AttrName, serde_json::Value>,
    ) -> HashSet<StepId> {
        let mut failures = HashSet::new();
        for step_id in plan.steps.keys() {
            let Some(step) = catalog.get(step_id) else { continue };
            let Some(spec) = &step.predicate else { continue };
            if !step.required_inputs().all(|attr| attributes.contains_key(attr)) {
                continue;
            }
            let inputs: HashMap<AttrName, serde_json::Value> = step
                .attributes
                .iter()
                .filter(|(_, s)| s.role != AttrRole::Output)
                .filter_map(|(attr, s)| attributes.get(attr).cloned().or_else(|| s.default.clone()).map(|v| (attr.clone(), v)))
                .collect();

            let verdict = async {
                let compiled = self.script_env.compile(step, spec).await?;
                self.script_env.evaluate_predicate(compiled.as_ref(), step, &inputs).await
            }
            .await;

            match verdict {
                Ok(true) => {}
                Ok(false) => {
                    failures.insert(step_id.clone());
                }
                Err(err) => {
                    warn!(step = step_id.as_str(), error = %err, "predicate evaluation failed, skipping step");
                    failures.insert(step_id.clone());
                }
            }
        }
        failures
    }

    async fn predicate_failures_for_flow(&self, flow_id: &str, catalog: &HashMap<StepId, Step>) -> Result<HashSet<StepId>, EngineError> {
        let state = self.get_flow_state(flow_id).await?;
        let attributes: HashMap<AttrName, serde_json::Value> = state.attributes.iter().map(|(k, v)| (k.clone(), v.value.clone())).collect();
        Ok(self.predicate_failures(&state.plan, catalog, &attributes).await)
    }

    /// Re-dispatch a work item whose retry task just fired.
    async fn on_retry(self: Arc<Self>, flow_id: String, step_id: StepId, token: Token) {
        let catalog = self.catalog.as_catalog_map();
        match self.flow_tx.activate_retry(&flow_id, &step_id, token).await {
            Ok(Some(inputs)) => {
                if let Some(step) = catalog.get(&step_id) {
                    let item = DispatchItem { token, inputs };
                    let sink = self.sink_for(flow_id.clone());
                    self.dispatcher.dispatch(flow_id, Arc::new(step.clone()), vec![item], sink);
                }
            }
            Ok(None) => {
                warn!(flow = flow_id, step = step_id.as_str(), "retry fired for a work item that no longer exists");
            }
            Err(err) => {
                warn!(flow = flow_id, step = step_id.as_str(), error = %err, "failed to activate retry");
            }
        }
    }

    /// A scheduled optional-input timeout has fired.
    async fn on_timeout(self: Arc<Self>, flow_id: String, step_id: StepId, attr: AttrName) {
        let catalog = self.catalog.as_catalog_map();
        let predicate_failures = match self.predicate_failures_for_flow(&flow_id, &catalog).await {
            Ok(f) => f,
            Err(err) => {
                warn!(flow = flow_id, error = %err, "failed to resolve predicate state for fired timeout");
                return;
            }
        };
        let now = self.clock.now();
        match self.flow_tx.fire_timeout(&flow_id, &step_id, &attr, &catalog, &predicate_failures, &self.memo, now).await {
            Ok(effects) => self.run_effects(&flow_id, effects, &catalog).await,
            Err(err) => warn!(flow = flow_id, step = step_id.as_str(), error = %err, "failed to apply fired timeout"),
        }
    }

    /// Carry out every post-commit effect returned by a `FlowTx` call.
    async fn run_effects(self: &Arc<Self>, flow_id: &str, effects: Vec<Effect>, catalog: &HashMap<StepId, Step>) {
        for effect in effects {
            match effect {
                Effect::Dispatch { step_id, items } => {
                    let Some(step) = catalog.get(&step_id) else {
                        warn!(flow = flow_id, step = step_id.as_str(), "dispatch requested for unknown step");
                        continue;
                    };
                    let sink = self.sink_for(flow_id.to_string());
                    self.dispatcher.dispatch(flow_id.to_string(), Arc::new(step.clone()), items, sink);
                }
                Effect::ScheduleTimeout { step_id, attr, at } => {
                    let engine = self.clone();
                    let flow_id_owned = flow_id.to_string();
                    let path = timeout_path(flow_id, &step_id, &attr);
                    self.scheduler.schedule(path, at, move || engine.on_timeout(flow_id_owned, step_id, attr));
                }
                Effect::CancelTimeout { step_id, attr } => {
                    self.scheduler.cancel(&timeout_path(flow_id, &step_id, &attr));
                }
                Effect::ScheduleRetry { step_id, token, at } => {
                    let engine = self.clone();
                    let flow_id_owned = flow_id.to_string();
                    let path = retry_path(flow_id, &step_id, token);
                    self.scheduler.schedule(path, at, move || engine.on_retry(flow_id_owned, step_id, token));
                }
                Effect::CancelRetry { step_id, token } => {
                    self.scheduler.cancel(&retry_path(flow_id, &step_id, token));
                }
                Effect::MemoPut { step, inputs, outputs } => {
                    self.memo.put(&step, &inputs, outputs);
                }
                Effect::CancelFlowTasks => {
                    self.scheduler.cancel_prefix(&timeout_prefix(flow_id));
                    self.scheduler.cancel_prefix(&retry_prefix(flow_id));
                }
                Effect::StartChildFlow { step_id, token, inputs } => {
                    self.spawn_child_flow(flow_id, &step_id, token, inputs, catalog).await;
                }
            }
        }
    }

    /// Start a Flow-type step's sub-flow, mapping the parent step's resolved
    /// inputs onto the child's catalog attribute names per §4.8, then spawns
    /// a watcher that maps the child's terminal outputs back onto the
    /// parent's work item once it settles.
    async fn spawn_child_flow(
        self: &Arc<Self>,
        parent_flow_id: &str,
        step_id: &StepId,
        token: Token,
        inputs: HashMap<AttrName, serde_json::Value>,
        catalog: &HashMap<StepId, Step>,
    ) {
        let Some(step) = catalog.get(step_id) else { return };
        let Some(flow_spec) = &step.flow else {
            warn!(step = step_id.as_str(), "Flow-type step has no sub-flow spec");
            return;
        };
        let child_flow_id = format!("{parent_flow_id}/{step_id}/{token}");
        let mut metadata = HashMap::new();
        metadata.insert("parent_flow_id".to_string(), parent_flow_id.to_string());
        metadata.insert("parent_step_id".to_string(), step_id.to_string());
        metadata.insert("parent_work_item_token".to_string(), token.to_string());

        let mut child_init = HashMap::new();
        for (attr, value) in inputs {
            let Some(spec) = step.attributes.get(&attr) else { continue };
            match map_input(self.script_env.as_ref(), &attr, spec, &value).await {
                Ok(facing_value) => {
                    if let Ok(facing_attr) = AttrName::new(input_facing_name(&attr, spec).to_string()) {
                        child_init.insert(facing_attr, facing_value);
                    }
                }
                Err(err) => {
                    warn!(step = step_id.as_str(), attr = attr.as_str(), error = %err, "sub-flow input mapping failed");
                    self.sink_for(parent_flow_id.to_string()).fail_work(step_id, token, err.to_string()).await;
                    return;
                }
            }
        }

        if let Err(err) = self.start_flow(&child_flow_id, &flow_spec.goals, child_init, metadata, HashMap::new()).await {
            warn!(flow = child_flow_id, error = %err, "failed to start child flow");
            self.sink_for(parent_flow_id.to_string()).fail_work(step_id, token, err.to_string()).await;
            return;
        }

        let engine = self.clone();
        let parent_flow_id = parent_flow_id.to_string();
        let step_id = step_id.clone();
        let step = step.clone();
        tokio::spawn(async move {
            engine.await_child_flow(parent_flow_id, step_id, token, child_flow_id, step).await;
        });
    }

    /// Poll a sub-flow until it settles, then complete or fail the parent
    /// step's work item accordingly. There is no push notification for flow
    /// completion, so this polls at a short fixed interval — acceptable for
    /// a sub-flow's lifetime, which is itself bounded by its own steps'
    /// timeouts and retries.
    async fn await_child_flow(
        self: Arc<Self>,
        parent_flow_id: String,
        step_id: StepId,
        token: Token,
        child_flow_id: String,
        step: Step,
    ) {
        loop {
            match self.get_flow_state(&child_flow_id).await {
                Ok(state) if state.status.is_terminal() => {
                    let sink = self.sink_for(parent_flow_id.clone());
                    if state.status == FlowStatus::Completed {
                        let raw = serde_json::Value::Object(
                            state.attributes.iter().map(|(k, v)| (k.as_str().to_string(), v.value.clone())).collect(),
                        );
                        let outputs_spec: HashMap<AttrName, AttrSpec> =
                            step.attributes.iter().filter(|(_, s)| s.role == AttrRole::Output).map(|(k, s)| (k.clone(), s.clone())).collect();
                        let outputs = map_outputs(self.script_env.as_ref(), &outputs_spec, &raw).await;
                        sink.complete_work(&step_id, token, outputs).await;
                    } else {
                        sink.fail_work(&step_id, token, format!("sub-flow {child_flow_id} did not complete")).await;
                    }
                    return;
                }
                Ok(_) => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
                Err(err) => {
                    warn!(flow = child_flow_id, error = %err, "failed to poll sub-flow state");
                    return;
                }
            }
        }
    }

    /// Bind a `WorkSink` to one flow, for use by an out-of-scope webhook
    /// endpoint completing an `Async` step's work out-of-band.
    #[must_use]
    pub fn sink_for(self: &Arc<Self>, flow_id: impl Into<String>) -> Arc<dyn WorkSink> {
        Arc::new(FlowScopedSink { engine: self.clone(), flow_id: flow_id.into() })
    }
}

fn catalog_to_engine_error(err: CatalogError) -> EngineError {
    match err {
        CatalogError::Journal(j) => EngineError::Journal(j),
        other => EngineError::Config(other.to_string()),
    }
}

/// Per-flow `WorkSink`: every dispatch call is scoped to one flow, so this
/// is built fresh at each dispatch site rather than held long-term.
struct FlowScopedSink<J: Journal + Clone> {
    engine: Arc<Engine<J>>,
    flow_id: String,
}

#[async_trait]
impl<J: Journal + Clone + 'static> WorkSink for FlowScopedSink<J> {
    async fn complete_work(&self, step_id: &StepId, token: Token, outputs: HashMap<AttrName, serde_json::Value>) {
        let catalog = self.engine.catalog.as_catalog_map();
        let Ok(predicate_failures) = self.engine.predicate_failures_for_flow(&self.flow_id, &catalog).await else {
            warn!(flow = self.flow_id, step = step_id.as_str(), "failed to resolve predicate state for completed work");
            return;
        };
        let now = self.engine.clock.now();
        match self.engine.flow_tx.complete_work(&self.flow_id, step_id, token, outputs, &catalog, &predicate_failures, &self.engine.memo, now).await {
            Ok(effects) => self.engine.run_effects(&self.flow_id, effects, &catalog).await,
            Err(err) => warn!(flow = self.flow_id, step = step_id.as_str(), error = %err, "complete_work failed"),
        }
    }

    async fn fail_work(&self, step_id: &StepId, token: Token, message: String) {
        let catalog = self.engine.catalog.as_catalog_map();
        let Ok(predicate_failures) = self.engine.predicate_failures_for_flow(&self.flow_id, &catalog).await else {
            warn!(flow = self.flow_id, step = step_id.as_str(), "failed to resolve predicate state for failed work");
            return;
        };
        let now = self.engine.clock.now();
        match self.engine.flow_tx.fail_work(&self.flow_id, step_id, token, message, &catalog, &predicate_failures, &self.engine.memo, now).await {
            Ok(effects) => self.engine.run_effects(&self.flow_id, effects, &catalog).await,
            Err(err) => warn!(flow = self.flow_id, step = step_id.as_str(), error = %err, "fail_work failed"),
        }
    }

    async fn not_complete_work(&self, step_id: &StepId, token: Token, message: String) {
        let catalog = self.engine.catalog.as_catalog_map();
        let Ok(predicate_failures) = self.engine.predicate_failures_for_flow(&self.flow_id, &catalog).await else {
            warn!(flow = self.flow_id, step = step_id.as_str(), "failed to resolve predicate state for not-completed work");
            return;
        };
        let now = self.engine.clock.now();
        match self.engine.flow_tx.not_complete_work(&self.flow_id, step_id, token, message, &catalog, &predicate_failures, &self.engine.memo, now).await {
            Ok(effects) => self.engine.run_effects(&self.flow_id, effects, &catalog).await,
            Err(err) => warn!(flow = self.flow_id, step = step_id.as_str(), error = %err, "not_complete_work failed"),
        }
    }

    async fn start_child_flow(&self, step_id: &StepId, token: Token, inputs: HashMap<AttrName, serde_json::Value>) {
        let catalog = self.engine.catalog.as_catalog_map();
        self.engine.spawn_child_flow(&self.flow_id, step_id, token, inputs, &catalog).await;
    }
}
