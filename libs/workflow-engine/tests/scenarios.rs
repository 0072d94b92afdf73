//! End-to-end engine scenarios: each test drives a full `Engine` against an
//! in-memory journal and a pair of fixture collaborators, covering the
//! lifecycle paths that matter most — linear completion, an unused branch
//! skipped at runtime, a predicate that keeps a worker from ever running,
//! retry exhaustion, `ForEach` fan-out/aggregation, and a sub-flow's
//! attribute mapping round trip.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use glyph_db::InMemoryJournal;
use glyph_domain::enums::{AttrRole, FlowStatus, StepStatus, StepType};
use glyph_domain::ids::{AttrName, StepId};
use glyph_domain::step::{AttrSpec, FlowSpec, Mapping, ScriptSpec, Step};
use glyph_workflow_engine::{
    Clock, Compiled, Engine, EngineConfig, FlowState, InvokeMetadata, ScriptEnv, ScriptError, StepClient, StepClientError, SystemClock,
};

type ScriptFn =
    Box<dyn Fn(&HashMap<AttrName, serde_json::Value>) -> Result<HashMap<AttrName, serde_json::Value>, ScriptError> + Send + Sync>;

struct FixtureCompiled;
impl Compiled for FixtureCompiled {}

/// Script/predicate collaborator keyed by step id — every scenario below
/// only needs a canned response per step, never the script source itself.
#[derive(Default)]
struct FixtureScriptEnv {
    scripts: Mutex<HashMap<String, ScriptFn>>,
    predicates: Mutex<HashMap<String, bool>>,
    invocations: Mutex<Vec<String>>,
}

impl FixtureScriptEnv {
    fn new() -> Self {
        Self::default()
    }

    fn stub(
        &self,
        step_id: &str,
        f: impl Fn(&HashMap<AttrName, serde_json::Value>) -> Result<HashMap<AttrName, serde_json::Value>, ScriptError> + Send + Sync + 'static,
    ) {
        self.scripts.lock().unwrap().insert(step_id.to_string(), Box::new(f));
    }

    fn stub_predicate(&self, step_id: &str, value: bool) {
        self.predicates.lock().unwrap().insert(step_id.to_string(), value);
    }

    fn invocations(&self) -> Vec<String> {
        self.invocations.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScriptEnv for FixtureScriptEnv {
    async fn compile(&self, _step: &Step, _spec: &ScriptSpec) -> Result<Box<dyn Compiled>, ScriptError> {
        Ok(Box::new(FixtureCompiled))
    }

    async fn execute_script(
        &self,
        _compiled: &dyn Compiled,
        step: &Step,
        inputs: &HashMap<AttrName, serde_json::Value>,
    ) -> Result<HashMap<AttrName, serde_json::Value>, ScriptError> {
        self.invocations.lock().unwrap().push(step.id.to_string());
        match self.scripts.lock().unwrap().get(step.id.as_str()) {
            Some(f) => f(inputs),
            None => Ok(HashMap::new()),
        }
    }

    async fn evaluate_predicate(
        &self,
        _compiled: &dyn Compiled,
        step: &Step,
        _inputs: &HashMap<AttrName, serde_json::Value>,
    ) -> Result<bool, ScriptError> {
        Ok(*self.predicates.lock().unwrap().get(step.id.as_str()).unwrap_or(&true))
    }

    async fn evaluate_mapping(&self, _spec: &ScriptSpec, _document: &serde_json::Value) -> Result<Vec<serde_json::Value>, ScriptError> {
        Ok(Vec::new())
    }

    async fn validate(&self, _step: &Step, _source: &str) -> Result<(), ScriptError> {
        Ok(())
    }
}

/// `StepClient` collaborator for `Sync`-type steps, keyed by step id only —
/// `MockStepClient`'s token-keyed stubs can't be pre-registered since a work
/// item's token is minted by the engine at dispatch time.
#[derive(Default)]
struct FixtureStepClient {
    responses: Mutex<HashMap<String, Result<HashMap<AttrName, serde_json::Value>, StepClientError>>>,
}

impl FixtureStepClient {
    fn new() -> Self {
        Self::default()
    }

    fn stub(&self, step_id: &str, result: Result<HashMap<AttrName, serde_json::Value>, StepClientError>) {
        self.responses.lock().unwrap().insert(step_id.to_string(), result);
    }
}

#[async_trait]
impl StepClient for FixtureStepClient {
    async fn invoke(
        &self,
        step: &Step,
        _inputs: &HashMap<AttrName, serde_json::Value>,
        _metadata: &InvokeMetadata,
    ) -> Result<HashMap<AttrName, serde_json::Value>, StepClientError> {
        self.responses
            .lock()
            .unwrap()
            .get(step.id.as_str())
            .cloned()
            .unwrap_or_else(|| Err(StepClientError::Failed(format!("no stub for {}", step.id))))
    }
}

fn attr(name: &str) -> AttrName {
    AttrName::new(name).unwrap()
}

fn sid(id: &str) -> StepId {
    StepId::new(id).unwrap()
}

fn attr_spec(role: AttrRole) -> AttrSpec {
    AttrSpec { role, attr_type: "string".into(), default: None, timeout_ms: None, for_each: false, mapping: None }
}

fn blank_script() -> ScriptSpec {
    ScriptSpec { language: "fixture".into(), source: String::new() }
}

async fn build_engine() -> (Arc<Engine<InMemoryJournal>>, Arc<FixtureStepClient>, Arc<FixtureScriptEnv>) {
    let step_client = Arc::new(FixtureStepClient::new());
    let script_env = Arc::new(FixtureScriptEnv::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let engine = Engine::new(InMemoryJournal::new(), &EngineConfig::default(), step_client.clone(), script_env.clone(), clock)
        .await
        .expect("engine construction against a fresh in-memory journal cannot fail");
    engine.start();
    (engine, step_client, script_env)
}

async fn wait_until_terminal(engine: &Arc<Engine<InMemoryJournal>>, flow_id: &str) -> FlowState {
    for _ in 0..200 {
        let state = engine.get_flow_state(flow_id).await.expect("flow exists");
        if state.status.is_terminal() {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("flow {flow_id} did not reach a terminal state in time");
}

#[tokio::test]
async fn linear_flow_completes_through_producer_and_consumer() {
    let (engine, _step_client, script_env) = build_engine().await;

    script_env.stub("producer", |_| Ok(HashMap::from([(attr("value"), serde_json::json!("abc"))])));
    script_env.stub("consumer", |_| Ok(HashMap::from([(attr("result"), serde_json::json!("ok"))])));

    let producer = Step {
        id: sid("producer"),
        name: "producer".into(),
        version: 1,
        step_type: StepType::Script,
        attributes: HashMap::from([(attr("value"), attr_spec(AttrRole::Output))]),
        script: Some(blank_script()),
        predicate: None,
        http: None,
        work_config: None,
        flow: None,
        memoizable: false,
    };
    let consumer = Step {
        id: sid("consumer"),
        name: "consumer".into(),
        version: 1,
        step_type: StepType::Script,
        attributes: HashMap::from([
            (attr("value"), attr_spec(AttrRole::Required)),
            (attr("result"), attr_spec(AttrRole::Output)),
        ]),
        script: Some(blank_script()),
        predicate: None,
        http: None,
        work_config: None,
        flow: None,
        memoizable: false,
    };

    engine.register_step(producer).await.unwrap();
    engine.register_step(consumer).await.unwrap();

    engine.start_flow("linear", &[sid("consumer")], HashMap::new(), HashMap::new(), HashMap::new()).await.unwrap();

    let state = wait_until_terminal(&engine, "linear").await;
    assert_eq!(state.status, FlowStatus::Completed);
    assert_eq!(state.attributes[&attr("result")].value, serde_json::json!("ok"));
    assert_eq!(state.executions[&sid("producer")].status, StepStatus::Completed);
    assert_eq!(state.executions[&sid("consumer")].status, StepStatus::Completed);

    engine.stop();
}

#[tokio::test]
async fn memoizable_step_is_not_redispatched_on_a_cache_hit() {
    let (engine, _step_client, script_env) = build_engine().await;
    script_env.stub("producer", |_| Ok(HashMap::from([(attr("value"), serde_json::json!("abc"))])));

    let producer = Step {
        id: sid("producer"),
        name: "producer".into(),
        version: 1,
        step_type: StepType::Script,
        attributes: HashMap::from([(attr("value"), attr_spec(AttrRole::Output))]),
        script: Some(blank_script()),
        predicate: None,
        http: None,
        work_config: None,
        flow: None,
        memoizable: true,
    };
    engine.register_step(producer).await.unwrap();

    engine.start_flow("memo-first", &[sid("producer")], HashMap::new(), HashMap::new(), HashMap::new()).await.unwrap();
    let first = wait_until_terminal(&engine, "memo-first").await;
    assert_eq!(first.status, FlowStatus::Completed);
    assert_eq!(script_env.invocations().iter().filter(|s| s.as_str() == "producer").count(), 1);

    engine.start_flow("memo-second", &[sid("producer")], HashMap::new(), HashMap::new(), HashMap::new()).await.unwrap();
    let second = wait_until_terminal(&engine, "memo-second").await;
    assert_eq!(second.status, FlowStatus::Completed);
    assert_eq!(second.attributes[&attr("value")].value, serde_json::json!("abc"));
    assert_eq!(second.executions[&sid("producer")].status, StepStatus::Completed);

    // The second flow's identical step definition + inputs must be served
    // from the memo cache — no second collaborator call.
    assert_eq!(script_env.invocations().iter().filter(|s| s.as_str() == "producer").count(), 1);

    engine.stop();
}

#[tokio::test]
async fn unused_branch_is_skipped_once_a_competing_provider_wins() {
    let (engine, _step_client, script_env) = build_engine().await;

    script_env.stub("provider_a", |_| Ok(HashMap::from([(attr("opt"), serde_json::json!("from-a"))])));
    script_env.stub("consumer", |_| Ok(HashMap::from([(attr("result"), serde_json::json!("done"))])));

    let provider_a = Step {
        id: sid("provider_a"),
        name: "provider_a".into(),
        version: 1,
        step_type: StepType::Script,
        attributes: HashMap::from([(attr("opt"), attr_spec(AttrRole::Output))]),
        script: Some(blank_script()),
        predicate: None,
        http: None,
        work_config: None,
        flow: None,
        memoizable: false,
    };
    // provider_b also produces `opt`, but needs a `seed` nobody supplies —
    // a redundant branch that must never block the flow from starting.
    let provider_b = Step {
        id: sid("provider_b"),
        name: "provider_b".into(),
        version: 1,
        step_type: StepType::Script,
        attributes: HashMap::from([
            (attr("seed"), attr_spec(AttrRole::Required)),
            (attr("opt"), attr_spec(AttrRole::Output)),
        ]),
        script: Some(blank_script()),
        predicate: None,
        http: None,
        work_config: None,
        flow: None,
        memoizable: false,
    };
    let consumer = Step {
        id: sid("consumer"),
        name: "consumer".into(),
        version: 1,
        step_type: StepType::Script,
        attributes: HashMap::from([
            (attr("opt"), attr_spec(AttrRole::Optional)),
            (attr("result"), attr_spec(AttrRole::Output)),
        ]),
        script: Some(blank_script()),
        predicate: None,
        http: None,
        work_config: None,
        flow: None,
        memoizable: false,
    };

    engine.register_step(provider_a).await.unwrap();
    engine.register_step(provider_b).await.unwrap();
    engine.register_step(consumer).await.unwrap();

    engine.start_flow("unused-branch", &[sid("consumer")], HashMap::new(), HashMap::new(), HashMap::new()).await.unwrap();

    let state = wait_until_terminal(&engine, "unused-branch").await;
    assert_eq!(state.status, FlowStatus::Completed);
    assert_eq!(state.executions[&sid("provider_a")].status, StepStatus::Completed);
    assert_eq!(state.executions[&sid("provider_b")].status, StepStatus::Skipped);
    assert_eq!(state.executions[&sid("provider_b")].error.as_deref(), Some("outputs not needed"));
    assert!(!script_env.invocations().contains(&"provider_b".to_string()));

    engine.stop();
}

#[tokio::test]
async fn false_predicate_skips_the_step_without_invoking_its_worker() {
    let (engine, _step_client, script_env) = build_engine().await;
    script_env.stub_predicate("gate", false);

    let gate = Step {
        id: sid("gate"),
        name: "gate".into(),
        version: 1,
        step_type: StepType::Script,
        attributes: HashMap::from([(attr("result"), attr_spec(AttrRole::Output))]),
        script: Some(blank_script()),
        predicate: Some(blank_script()),
        http: None,
        work_config: None,
        flow: None,
        memoizable: false,
    };

    engine.register_step(gate).await.unwrap();
    engine.start_flow("predicate-false", &[sid("gate")], HashMap::new(), HashMap::new(), HashMap::new()).await.unwrap();

    let state = wait_until_terminal(&engine, "predicate-false").await;
    assert_eq!(state.status, FlowStatus::Completed);
    assert_eq!(state.executions[&sid("gate")].status, StepStatus::Skipped);
    assert_eq!(state.executions[&sid("gate")].error.as_deref(), Some("predicate returned false"));
    assert!(!script_env.invocations().contains(&"gate".to_string()));

    engine.stop();
}

#[tokio::test]
async fn retry_exhaustion_fails_the_flow() {
    let (engine, step_client, _script_env) = build_engine().await;
    step_client.stub("flaky", Err(StepClientError::WorkNotCompleted("work not completed".to_string())));

    let flaky = Step {
        id: sid("flaky"),
        name: "flaky".into(),
        version: 1,
        step_type: StepType::Sync,
        attributes: HashMap::from([(attr("result"), attr_spec(AttrRole::Output))]),
        script: None,
        predicate: None,
        http: None,
        work_config: Some(glyph_domain::step::WorkConfig {
            max_retries: 0,
            backoff_ms: 0,
            max_backoff_ms: 0,
            backoff_type: glyph_domain::enums::BackoffType::Fixed,
            parallelism: 1,
        }),
        flow: None,
        memoizable: false,
    };

    engine.register_step(flaky).await.unwrap();
    engine.start_flow("retry-exhaustion", &[sid("flaky")], HashMap::new(), HashMap::new(), HashMap::new()).await.unwrap();

    let state = wait_until_terminal(&engine, "retry-exhaustion").await;
    assert_eq!(state.status, FlowStatus::Failed);
    assert_eq!(state.executions[&sid("flaky")].status, StepStatus::Failed);
    assert!(state.error.as_deref().unwrap_or_default().contains("work not completed"));

    engine.stop();
}

#[tokio::test]
async fn for_each_fans_out_and_aggregates_results() {
    let (engine, _step_client, script_env) = build_engine().await;
    script_env.stub("fanout", |_| Ok(HashMap::from([(attr("result"), serde_json::json!("ok"))])));

    let fanout = Step {
        id: sid("fanout"),
        name: "fanout".into(),
        version: 1,
        step_type: StepType::Script,
        attributes: HashMap::from([
            (attr("item"), AttrSpec { for_each: true, ..attr_spec(AttrRole::Required) }),
            (attr("result"), attr_spec(AttrRole::Output)),
        ]),
        script: Some(blank_script()),
        predicate: None,
        http: None,
        work_config: None,
        flow: None,
        memoizable: false,
    };

    engine.register_step(fanout).await.unwrap();
    let init = HashMap::from([(attr("item"), serde_json::json!(["a", "b"]))]);
    engine.start_flow("for-each", &[sid("fanout")], init, HashMap::new(), HashMap::new()).await.unwrap();

    let state = wait_until_terminal(&engine, "for-each").await;
    assert_eq!(state.status, FlowStatus::Completed);

    let result = state.attributes[&attr("result")].value.as_array().expect("result aggregates into a list").clone();
    assert_eq!(result.len(), 2);
    let items: Vec<String> = result.iter().map(|entry| entry["item"].as_str().unwrap().to_string()).collect();
    assert!(items.contains(&"a".to_string()));
    assert!(items.contains(&"b".to_string()));
    assert!(result.iter().all(|entry| entry["result"] == serde_json::json!("ok")));

    engine.stop();
}

#[tokio::test]
async fn sub_flow_maps_inputs_and_outputs_across_the_boundary() {
    let (engine, _step_client, script_env) = build_engine().await;
    script_env.stub("child", |inputs| {
        let value = inputs.get(&attr("child_in")).cloned().unwrap_or(serde_json::Value::Null);
        Ok(HashMap::from([(attr("child_out"), value)]))
    });

    let parent = Step {
        id: sid("parent"),
        name: "parent".into(),
        version: 1,
        step_type: StepType::Flow,
        attributes: HashMap::from([
            (
                attr("input"),
                AttrSpec { mapping: Some(Mapping { name: "child_in".to_string(), script: None }), ..attr_spec(AttrRole::Required) },
            ),
            (
                attr("output"),
                AttrSpec { mapping: Some(Mapping { name: "child_out".to_string(), script: None }), ..attr_spec(AttrRole::Output) },
            ),
        ]),
        script: None,
        predicate: None,
        http: None,
        work_config: None,
        flow: Some(FlowSpec { goals: vec![sid("child")] }),
        memoizable: false,
    };
    let child = Step {
        id: sid("child"),
        name: "child".into(),
        version: 1,
        step_type: StepType::Script,
        attributes: HashMap::from([
            (attr("child_in"), attr_spec(AttrRole::Required)),
            (attr("child_out"), attr_spec(AttrRole::Output)),
        ]),
        script: Some(blank_script()),
        predicate: None,
        http: None,
        work_config: None,
        flow: None,
        memoizable: false,
    };

    engine.register_step(parent).await.unwrap();
    engine.register_step(child).await.unwrap();

    let init = HashMap::from([(attr("input"), serde_json::json!(7))]);
    engine.start_flow("sub-flow", &[sid("parent")], init, HashMap::new(), HashMap::new()).await.unwrap();

    let state = wait_until_terminal(&engine, "sub-flow").await;
    assert_eq!(state.status, FlowStatus::Completed);
    assert_eq!(state.attributes[&attr("output")].value, serde_json::json!(7));
    assert_eq!(state.executions[&sid("parent")].status, StepStatus::Completed);

    engine.stop();
}
