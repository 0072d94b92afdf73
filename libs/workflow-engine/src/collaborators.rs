//! Collaborator contracts (§6.2): the external systems the core only knows
//! by their trait boundary — a step client, a script environment, and a
//! clock. Concrete HTTP/script/store implementations are out of scope
//! (§1); this module carries the traits plus in-memory reference/mock
//! implementations used by the crate's own tests and by `apps/cli`'s demo
//! mode.
//!
//! Grounded on the teacher's `executor::traits` module, which defines the
//! `StepHandler`/`ConditionEvaluator` boundary the old executor dispatched
//! through with `#[async_trait]`; the same shape carries over here with the
//! new step-type vocabulary.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use glyph_domain::ids::{AttrName, FlowId, StepId, Token};
use glyph_domain::step::{ScriptSpec, Step};

/// A soft failure a worker may report in place of `WorkSucceeded`/`WorkFailed`
/// — the dispatcher translates it into `NotCompleteWork`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StepClientError {
    #[error("work not completed: {0}")]
    WorkNotCompleted(String),

    #[error("step invocation failed: {0}")]
    Failed(String),
}

/// Metadata carried on every `Invoke` call.
#[derive(Debug, Clone, Default)]
pub struct InvokeMetadata {
    pub flow_id: String,
    pub step_id: String,
    pub receipt_token: String,
    pub webhook_url: Option<String>,
}

/// `Sync`/`Async` step execution: the out-of-scope HTTP step client (§6.2).
#[async_trait]
pub trait StepClient: Send + Sync {
    async fn invoke(
        &self,
        step: &Step,
        inputs: &HashMap<AttrName, serde_json::Value>,
        metadata: &InvokeMetadata,
    ) -> Result<HashMap<AttrName, serde_json::Value>, StepClientError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("script compile failed: {0}")]
    CompileFailed(String),

    #[error("script execution failed: {0}")]
    ExecutionFailed(String),
}

/// A compiled script handle. Opaque to the core; the concrete interpreter
/// (Lisp-like / Lua / JSONPath-style, per §1) owns what's behind it.
pub trait Compiled: Send + Sync {}

/// `Script`-type step bodies, predicates, and attribute mapping scripts
/// (§4.8, §4.11): the out-of-scope script interpreter boundary.
#[async_trait]
pub trait ScriptEnv: Send + Sync {
    async fn compile(&self, step: &Step, spec: &ScriptSpec) -> Result<Box<dyn Compiled>, ScriptError>;

    async fn execute_script(
        &self,
        compiled: &dyn Compiled,
        step: &Step,
        inputs: &HashMap<AttrName, serde_json::Value>,
    ) -> Result<HashMap<AttrName, serde_json::Value>, ScriptError>;

    async fn evaluate_predicate(
        &self,
        compiled: &dyn Compiled,
        step: &Step,
        inputs: &HashMap<AttrName, serde_json::Value>,
    ) -> Result<bool, ScriptError>;

    /// Extract value(s) from `document` via a mapping script (§4.8). Yields
    /// zero, one, or many matches.
    async fn evaluate_mapping(
        &self,
        spec: &ScriptSpec,
        document: &serde_json::Value,
    ) -> Result<Vec<serde_json::Value>, ScriptError>;

    async fn validate(&self, step: &Step, source: &str) -> Result<(), ScriptError>;
}

/// A deterministic clock boundary so tests can control `now`.
pub trait Clock: Send + Sync {
    fn now(&self) -> chrono::DateTime<chrono::Utc>;
}

/// The real-time clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now()
    }
}

/// An in-memory `StepClient` driven entirely by pre-registered fixtures;
/// used by this crate's own scenario tests in place of the out-of-scope
/// HTTP client.
#[derive(Default)]
pub struct MockStepClient {
    responses: Mutex<HashMap<(String, String), Result<HashMap<AttrName, serde_json::Value>, StepClientError>>>,
}

impl MockStepClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stub_success(&self, step_id: &str, token: &str, outputs: HashMap<AttrName, serde_json::Value>) {
        self.responses
            .lock()
            .expect("mock step client lock poisoned")
            .insert((step_id.to_string(), token.to_string()), Ok(outputs));
    }

    pub fn stub_failure(&self, step_id: &str, token: &str, err: StepClientError) {
        self.responses
            .lock()
            .expect("mock step client lock poisoned")
            .insert((step_id.to_string(), token.to_string()), Err(err));
    }
}

#[async_trait]
impl StepClient for MockStepClient {
    async fn invoke(
        &self,
        _step: &Step,
        _inputs: &HashMap<AttrName, serde_json::Value>,
        metadata: &InvokeMetadata,
    ) -> Result<HashMap<AttrName, serde_json::Value>, StepClientError> {
        let key = (metadata.step_id.clone(), metadata.receipt_token.clone());
        self.responses
            .lock()
            .expect("mock step client lock poisoned")
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Err(StepClientError::Failed(format!("no stub for {key:?}"))))
    }
}

/// Builds the webhook URL attached to `Async`-type invocation metadata
/// (§4.11).
#[must_use]
pub fn webhook_url(base: &str, flow_id: &FlowId, step_id: &StepId, token: &Token) -> String {
    format!("{base}/webhook/{flow_id}/{step_id}/{token}")
}
