//! Goal-directed plan builder (§4.2): resolves a goal set against a step
//! catalog into the subgraph of steps a flow actually needs, plus the
//! attribute provider/consumer graph used by readiness evaluation.
//!
//! Grounded on the teacher's `parser::validator::validate_reachability`,
//! which walks a `petgraph::graph::DiGraph` with `petgraph::visit::Dfs` to
//! find unreachable nodes; here the traversal runs in reverse, from goals
//! back through providers, and a `HashSet` visited set keeps it cycle-safe
//! without needing `petgraph`'s cycle detector (the catalog is treated as a
//! DAG by construction — the plan builder's job is reachability, not cycle
//! rejection). "Did you mean" suggestions on `StepNotFound` use
//! `strsim::levenshtein`, exactly as the teacher's validator does for
//! mistyped transition targets.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use glyph_domain::ids::{AttrName, StepId};
use glyph_domain::step::Step;

/// Errors raised while building a plan.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("no goals specified")]
    NoGoals,

    #[error("step not found: {step_id}{}", suggestion.as_ref().map(|s| format!(" (did you mean '{s}'?)")).unwrap_or_default())]
    StepNotFound {
        step_id: String,
        suggestion: Option<String>,
    },
}

/// Providers and consumers of one attribute, restricted to steps included in
/// the plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttrEdges {
    pub providers: Vec<StepId>,
    pub consumers: Vec<StepId>,
}

/// The resolved subgraph a flow needs to reach its goals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub goals: Vec<StepId>,
    pub steps: HashMap<StepId, Step>,
    pub attributes: BTreeMap<AttrName, AttrEdges>,
    pub required: Vec<AttrName>,
}

impl ExecutionPlan {
    /// §4.6 `StartFlow` step 2: every `required` entry must be present in
    /// `init`.
    pub fn validate_inputs(
        &self,
        init: &HashMap<AttrName, serde_json::Value>,
    ) -> Result<(), Vec<AttrName>> {
        let missing: Vec<AttrName> = self
            .required
            .iter()
            .filter(|name| !init.contains_key(*name))
            .cloned()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(missing)
        }
    }
}

fn find_similar_step<'a>(catalog: &'a HashMap<StepId, Step>, target: &str) -> Option<&'a str> {
    catalog
        .keys()
        .map(StepId::as_str)
        .map(|name| (name, strsim::levenshtein(name, target)))
        .filter(|(_, dist)| *dist <= 3)
        .min_by_key(|(_, dist)| *dist)
        .map(|(name, _)| name)
}

fn step_not_found(catalog: &HashMap<StepId, Step>, step_id: &str) -> PlanError {
    PlanError::StepNotFound {
        step_id: step_id.to_string(),
        suggestion: find_similar_step(catalog, step_id).map(str::to_string),
    }
}

/// Build an `ExecutionPlan` for `goals` against `catalog`, seeding already
/// satisfied attributes from `init`.
pub fn build_plan(
    catalog: &HashMap<StepId, Step>,
    goals: &[StepId],
    init: &HashMap<AttrName, serde_json::Value>,
) -> Result<ExecutionPlan, PlanError> {
    if goals.is_empty() {
        return Err(PlanError::NoGoals);
    }

    let mut included: HashMap<StepId, Step> = HashMap::new();
    let mut visited: HashSet<StepId> = HashSet::new();
    let mut required: Vec<AttrName> = Vec::new();

    for goal in goals {
        resolve_step(catalog, goal, init, &mut included, &mut visited, &mut required)?;
    }

    let mut attributes: BTreeMap<AttrName, AttrEdges> = BTreeMap::new();
    for (step_id, step) in &included {
        for output in step.outputs() {
            attributes.entry(output.clone()).or_default().providers.push(step_id.clone());
        }
        for input in step.inputs() {
            if included.values().any(|s| s.outputs().any(|o| o == input)) {
                attributes.entry(input.clone()).or_default().consumers.push(step_id.clone());
            }
        }
    }

    Ok(ExecutionPlan {
        goals: goals.to_vec(),
        steps: included,
        attributes,
        required,
    })
}

/// Recursively resolve `step_id` and its unmet inputs into `included`,
/// accumulating caller-supplied `required` attributes along the way.
fn resolve_step(
    catalog: &HashMap<StepId, Step>,
    step_id: &StepId,
    init: &HashMap<AttrName, serde_json::Value>,
    included: &mut HashMap<StepId, Step>,
    visited: &mut HashSet<StepId>,
    required: &mut Vec<AttrName>,
) -> Result<(), PlanError> {
    if visited.contains(step_id) {
        return Ok(());
    }
    visited.insert(step_id.clone());

    let step = catalog
        .get(step_id)
        .ok_or_else(|| step_not_found(catalog, step_id.as_str()))?
        .clone();

    // A step whose outputs are already all satisfied by the initial state
    // contributes nothing new and is excluded.
    let all_outputs_satisfied = step.outputs().next().is_some()
        && step.outputs().all(|o| init.contains_key(o));
    if all_outputs_satisfied {
        return Ok(());
    }

    for attr in step.inputs() {
        if init.contains_key(attr) {
            continue;
        }
        let providers: Vec<StepId> = catalog
            .iter()
            .filter(|(_, s)| s.outputs().any(|o| o == attr))
            .map(|(id, _)| id.clone())
            .collect();

        if providers.is_empty() {
            let is_required = step
                .attributes
                .get(attr)
                .map(|spec| spec.role == glyph_domain::enums::AttrRole::Required)
                .unwrap_or(false);
            if is_required && !required.contains(attr) {
                required.push(attr.clone());
            }
            continue;
        }

        // A redundant provider — one of several candidates for the same
        // attribute — still gets pulled into the plan so it can run and be
        // skipped as unused at runtime if another candidate wins, but its
        // own unreachable required inputs don't force a flow-level required
        // input: the flow doesn't need this branch to succeed.
        let exclusive = providers.len() == 1;
        for provider in providers {
            if exclusive {
                resolve_step(catalog, &provider, init, included, visited, required)?;
            } else {
                let mut discarded = Vec::new();
                resolve_step(catalog, &provider, init, included, visited, &mut discarded)?;
            }
        }
    }

    included.insert(step_id.clone(), step);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use glyph_domain::enums::{AttrRole, StepType};
    use glyph_domain::step::AttrSpec;

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
                AttrSpec {
                    role: AttrRole::Output,
                    attr_type: "string".into(),
                    default: None,
                    timeout_ms: None,
                    for_each: false,
                    mapping: None,
                },
            );
        }
        Step {
            id: StepId::new(id).unwrap(),
            name: id.to_string(),
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

    fn catalog_of(steps: Vec<Step>) -> HashMap<StepId, Step> {
        steps.into_iter().map(|s| (s.id.clone(), s)).collect()
    }

    #[test]
    fn empty_goals_is_rejected() {
        let catalog = HashMap::new();
        let err = build_plan(&catalog, &[], &HashMap::new()).unwrap_err();
        assert_eq!(err, PlanError::NoGoals);
    }

    #[test]
    fn missing_step_reports_suggestion() {
        let catalog = catalog_of(vec![step("consumer", &[("value", true)], &["result"])]);
        let err = build_plan(&catalog, &[StepId::new("consumr").unwrap()], &HashMap::new())
            .unwrap_err();
        match err {
            PlanError::StepNotFound { suggestion, .. } => {
                assert_eq!(suggestion.as_deref(), Some("consumer"));
            }
            _ => panic!("expected StepNotFound"),
        }
    }

    #[test]
    fn linear_plan_resolves_producer_and_tracks_no_required_inputs() {
        let producer = step("producer", &[], &["value"]);
        let consumer = step("consumer", &[("value", true)], &["result"]);
        let catalog = catalog_of(vec![producer, consumer]);

        let plan = build_plan(&catalog, &[StepId::new("consumer").unwrap()], &HashMap::new()).unwrap();
        assert!(plan.steps.contains_key(&StepId::new("producer").unwrap()));
        assert!(plan.steps.contains_key(&StepId::new("consumer").unwrap()));
        assert!(plan.required.is_empty());

        let value_edges = plan.attributes.get(&AttrName::new("value").unwrap()).unwrap();
        assert_eq!(value_edges.providers, vec![StepId::new("producer").unwrap()]);
        assert_eq!(value_edges.consumers, vec![StepId::new("consumer").unwrap()]);
    }

    #[test]
    fn required_input_with_no_provider_is_recorded() {
        let consumer = step("consumer", &[("seed", true)], &["result"]);
        let catalog = catalog_of(vec![consumer]);

        let plan = build_plan(&catalog, &[StepId::new("consumer").unwrap()], &HashMap::new()).unwrap();
        assert_eq!(plan.required, vec![AttrName::new("seed").unwrap()]);
    }

    #[test]
    fn satisfied_in_init_excludes_producer() {
        let producer = step("producer", &[], &["value"]);
        let consumer = step("consumer", &[("value", true)], &["result"]);
        let catalog = catalog_of(vec![producer, consumer]);

        let mut init = HashMap::new();
        init.insert(AttrName::new("value").unwrap(), serde_json::json!("preset"));

        let plan = build_plan(&catalog, &[StepId::new("consumer").unwrap()], &init).unwrap();
        assert!(!plan.steps.contains_key(&StepId::new("producer").unwrap()));
        assert!(plan.steps.contains_key(&StepId::new("consumer").unwrap()));
    }
}
