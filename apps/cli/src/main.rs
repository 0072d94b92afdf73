//! Glyph CLI
//!
//! Administrative command-line tool for the workflow engine: load a step
//! catalog, start a flow, inspect its state, and manually settle work
//! items. Wires `glyph_common::init_tracing`, an in-memory journal, and a
//! mock step client/script env together — useful for exercising the
//! engine by hand, not part of its tested surface.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};

use glyph_db::InMemoryJournal;
use glyph_domain::ids::{AttrName, StepId};
use glyph_domain::step::{ScriptSpec, Step};
use glyph_workflow_engine::collaborators::{Clock, Compiled, MockStepClient, ScriptEnv, ScriptError, SystemClock};
use glyph_workflow_engine::config::EngineConfig;
use glyph_workflow_engine::Engine;

#[derive(Parser)]
#[command(name = "glyph")]
#[command(about = "Glyph workflow engine administration CLI")]
struct Cli {
    /// Step catalog (YAML) to register before running the command.
    #[arg(long, global = true)]
    catalog: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Step catalog commands
    Catalog {
        #[command(subcommand)]
        action: CatalogCommands,
    },
    /// Flow lifecycle commands
    Flow {
        #[command(subcommand)]
        action: FlowCommands,
    },
    /// Work item settlement commands
    Work {
        #[command(subcommand)]
        action: WorkCommands,
    },
}

#[derive(Subcommand)]
enum CatalogCommands {
    /// Register every step defined in a YAML file
    Load { file: String },
}

#[derive(Subcommand)]
enum FlowCommands {
    /// Start a flow toward one or more goal steps
    Start {
        flow_id: String,
        #[arg(long = "goal", required = true)]
        goals: Vec<String>,
        #[arg(long = "init", value_parser = parse_key_val)]
        init: Vec<(String, String)>,
    },
    /// Print a flow's current state
    Show { flow_id: String },
}

#[derive(Subcommand)]
enum WorkCommands {
    /// Settle a work item with outputs
    Complete {
        flow_id: String,
        step_id: String,
        token: String,
        #[arg(long = "output", value_parser = parse_key_val)]
        outputs: Vec<(String, String)>,
    },
    /// Settle a work item as hard-failed
    Fail { flow_id: String, step_id: String, token: String, message: String },
    /// Settle a work item as not completed, eligible for retry
    NotComplete { flow_id: String, step_id: String, token: String, message: String },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())).ok_or_else(|| format!("expected key=value, got `{s}`"))
}

fn parse_attr_value(raw: String) -> serde_json::Value {
    serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw))
}

/// Demo script environment: scripts and predicates are out of this crate's
/// scope, so this passes inputs straight through as outputs.
struct DemoScriptEnv;
struct DemoCompiled;
impl Compiled for DemoCompiled {}

#[async_trait]
impl ScriptEnv for DemoScriptEnv {
    async fn compile(&self, _step: &Step, _spec: &ScriptSpec) -> Result<Box<dyn Compiled>, ScriptError> {
        Ok(Box::new(DemoCompiled))
    }

    async fn execute_script(
        &self,
        _compiled: &dyn Compiled,
        _step: &Step,
        inputs: &HashMap<AttrName, serde_json::Value>,
    ) -> Result<HashMap<AttrName, serde_json::Value>, ScriptError> {
        Ok(inputs.clone())
    }

    async fn evaluate_predicate(
        &self,
        _compiled: &dyn Compiled,
        _step: &Step,
        _inputs: &HashMap<AttrName, serde_json::Value>,
    ) -> Result<bool, ScriptError> {
        Ok(true)
    }

    async fn evaluate_mapping(&self, _spec: &ScriptSpec, _document: &serde_json::Value) -> Result<Vec<serde_json::Value>, ScriptError> {
        Ok(Vec::new())
    }

    async fn validate(&self, _step: &Step, _source: &str) -> Result<(), ScriptError> {
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    glyph_common::init_tracing();
    let cli = Cli::parse();

    let config = EngineConfig::default();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let engine = Engine::new(InMemoryJournal::new(), &config, Arc::new(MockStepClient::new()), Arc::new(DemoScriptEnv), clock)
        .await
        .expect("engine construction against a fresh in-memory journal cannot fail");
    engine.start();

    if let Some(path) = &cli.catalog {
        if let Err(err) = load_catalog(&engine, path).await {
            eprintln!("{err}");
            std::process::exit(1);
        }
    }

    match cli.command {
        Commands::Catalog { action: CatalogCommands::Load { file } } => match load_catalog(&engine, &file).await {
            Ok(steps) => {
                for step in steps {
                    println!("registered {}", step.id);
                }
            }
            Err(err) => {
                eprintln!("{err}");
                std::process::exit(1);
            }
        },
        Commands::Flow { action: FlowCommands::Start { flow_id, goals, init } } => {
            let goals: Vec<StepId> = goals.into_iter().map(|g| StepId::new(g).expect("valid step id")).collect();
            let init: HashMap<AttrName, serde_json::Value> =
                init.into_iter().map(|(k, v)| (AttrName::new(k).expect("valid attribute name"), parse_attr_value(v))).collect();

            if let Err(err) = engine.start_flow(&flow_id, &goals, init, HashMap::new(), HashMap::new()).await {
                eprintln!("failed to start flow: {err}");
                std::process::exit(1);
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            print_flow_state(&engine, &flow_id).await;
        }
        Commands::Flow { action: FlowCommands::Show { flow_id } } => {
            print_flow_state(&engine, &flow_id).await;
        }
        Commands::Work { action } => {
            let (flow_id, step_id, token) = match &action {
                WorkCommands::Complete { flow_id, step_id, token, .. }
                | WorkCommands::Fail { flow_id, step_id, token, .. }
                | WorkCommands::NotComplete { flow_id, step_id, token, .. } => (flow_id.clone(), step_id.clone(), token.clone()),
            };
            let step_id = StepId::new(step_id).expect("valid step id");
            let token = token.parse().expect("valid token");
            let sink = engine.sink_for(flow_id.clone());

            match action {
                WorkCommands::Complete { outputs, .. } => {
                    let outputs: HashMap<AttrName, serde_json::Value> =
                        outputs.into_iter().map(|(k, v)| (AttrName::new(k).expect("valid attribute name"), parse_attr_value(v))).collect();
                    sink.complete_work(&step_id, token, outputs).await;
                }
                WorkCommands::Fail { message, .. } => sink.fail_work(&step_id, token, message).await,
                WorkCommands::NotComplete { message, .. } => sink.not_complete_work(&step_id, token, message).await,
            }
            print_flow_state(&engine, &flow_id).await;
        }
    }

    engine.stop();
}

async fn load_catalog(engine: &Arc<Engine<InMemoryJournal>>, path: &str) -> Result<Vec<Step>, String> {
    let contents = std::fs::read_to_string(path).map_err(|e| format!("reading {path}: {e}"))?;
    let steps: Vec<Step> = serde_yml::from_str(&contents).map_err(|e| format!("parsing {path}: {e}"))?;
    for step in &steps {
        engine.register_step(step.clone()).await.map_err(|e| e.to_string())?;
    }
    Ok(steps)
}

async fn print_flow_state(engine: &Arc<Engine<InMemoryJournal>>, flow_id: &str) {
    match engine.get_flow_state(flow_id).await {
        Ok(state) => println!("{}", serde_json::to_string_pretty(&state).expect("flow state always serializes")),
        Err(err) => eprintln!("{err}"),
    }
}
