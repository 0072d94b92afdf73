//! Dispatcher (§4.11): launches one task per newly-started work item,
//! bounded by the step's `WorkConfig.Parallelism`, and translates between
//! the core and the script/HTTP collaborators.
//!
//! Only ever invoked from flow-transaction post-commit hooks (§4.6), never
//! from inside a transaction itself. Grounded on the teacher's
//! `executor::handlers` dispatch-by-kind match plus its per-handler
//! `tokio::spawn`, generalized from the old `StepKind` vocabulary to
//! `{Sync, Async, Script, Flow}` and gated by a `tokio::sync::Semaphore`
//! per step the way `executor::auto_process` gates auto-processing
//! concurrency.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, warn};

use glyph_domain::enums::StepType;
use glyph_domain::ids::{AttrName, StepId, Token};
use glyph_domain::step::Step;

use crate::collaborators::{webhook_url, InvokeMetadata, ScriptEnv, StepClient, StepClientError};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("step {0} has no script body")]
    MissingScript(String),

    #[error("step {0} is of unsupported type: {1:?}")]
    UnsupportedStepType(String, StepType),
}

/// The flow-transaction surface the dispatcher re-enters through once a
/// work item settles. Implemented by the engine facade.
#[async_trait]
pub trait WorkSink: Send + Sync {
    async fn complete_work(&self, step_id: &StepId, token: Token, outputs: HashMap<AttrName, serde_json::Value>);
    async fn fail_work(&self, step_id: &StepId, token: Token, message: String);
    async fn not_complete_work(&self, step_id: &StepId, token: Token, message: String);
    async fn start_child_flow(&self, step_id: &StepId, token: Token, inputs: HashMap<AttrName, serde_json::Value>);
}

/// A newly-started work item, ready to hand to the dispatcher.
pub struct DispatchItem {
    pub token: Token,
    pub inputs: HashMap<AttrName, serde_json::Value>,
}

/// Launches and rate-limits per-step work-item tasks.
pub struct Dispatcher {
    step_client: Arc<dyn StepClient>,
    script_env: Arc<dyn ScriptEnv>,
    webhook_base: String,
    semaphores: DashMap<StepId, Arc<Semaphore>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(step_client: Arc<dyn StepClient>, script_env: Arc<dyn ScriptEnv>, webhook_base: String) -> Self {
        Self {
            step_client,
            script_env,
            webhook_base,
            semaphores: DashMap::new(),
        }
    }

    fn semaphore_for(&self, step_id: &StepId, parallelism: usize) -> Arc<Semaphore> {
        self.semaphores
            .entry(step_id.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(parallelism)))
            .clone()
    }

    /// Dispatch every `items` entry for `step` under `flow_id`. Spawns one
    /// task per item; tasks acquire a permit from the step's semaphore
    /// before invoking the collaborator, releasing it on completion.
    pub fn dispatch(
        &self,
        flow_id: String,
        step: Arc<Step>,
        items: Vec<DispatchItem>,
        sink: Arc<dyn WorkSink>,
    ) {
        let parallelism = step.work_config.map(|c| c.effective_parallelism()).unwrap_or(1);
        let semaphore = self.semaphore_for(&step.id, parallelism);

        for item in items {
            let semaphore = semaphore.clone();
            let step = step.clone();
            let sink = sink.clone();
            let flow_id = flow_id.clone();
            let step_client = self.step_client.clone();
            let script_env = self.script_env.clone();
            let webhook_base = self.webhook_base.clone();

            tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                run_one(flow_id, step, item, sink, step_client, script_env, webhook_base).await;
            });
        }
    }
}

async fn run_one(
    flow_id: String,
    step: Arc<Step>,
    item: DispatchItem,
    sink: Arc<dyn WorkSink>,
    step_client: Arc<dyn StepClient>,
    script_env: Arc<dyn ScriptEnv>,
    webhook_base: String,
) {
    let token = item.token;
    match step.step_type {
        StepType::Script => {
            let Some(spec) = &step.script else {
                error!(step = step.id.as_str(), "script step has no script body");
                sink.fail_work(&step.id, token, "step has no script body".into()).await;
                return;
            };
            let compiled = match script_env.compile(&step, spec).await {
                Ok(c) => c,
                Err(err) => {
                    sink.fail_work(&step.id, token, err.to_string()).await;
                    return;
                }
            };
            match script_env.execute_script(compiled.as_ref(), &step, &item.inputs).await {
                Ok(outputs) => sink.complete_work(&step.id, token, outputs).await,
                Err(err) => sink.fail_work(&step.id, token, err.to_string()).await,
            }
        }
        StepType::Sync => {
            let metadata = InvokeMetadata {
                flow_id,
                step_id: step.id.to_string(),
                receipt_token: token.to_string(),
                webhook_url: None,
            };
            match step_client.invoke(&step, &item.inputs, &metadata).await {
                Ok(outputs) => sink.complete_work(&step.id, token, outputs).await,
                Err(StepClientError::WorkNotCompleted(msg)) => sink.not_complete_work(&step.id, token, msg).await,
                Err(StepClientError::Failed(msg)) => sink.fail_work(&step.id, token, msg).await,
            }
        }
        StepType::Async => {
            let flow_id_owned = glyph_domain::ids::FlowId::new(flow_id.clone()).ok();
            let url = flow_id_owned.map(|fid| webhook_url(&webhook_base, &fid, &step.id, &token));
            let metadata = InvokeMetadata {
                flow_id,
                step_id: step.id.to_string(),
                receipt_token: token.to_string(),
                webhook_url: url,
            };
            // Completion arrives later, out-of-band, via the webhook endpoint
            // calling CompleteWork/FailWork/NotCompleteWork directly.
            if let Err(err) = step_client.invoke(&step, &item.inputs, &metadata).await {
                warn!(step = step.id.as_str(), error = %err, "async step invocation failed to enqueue");
                sink.fail_work(&step.id, token, err.to_string()).await;
            }
        }
        StepType::Flow => {
            sink.start_child_flow(&step.id, token, item.inputs).await;
        }
    }
}
