//! Catalog types: the `Step` entity and its nested specs.
//!
//! A `Step` is a template registered with the engine's catalog (see
//! `glyph_workflow_engine::engine::StepCatalog`); `glyph_workflow_engine::plan`
//! resolves a goal set into the subset of catalog steps a flow needs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::enums::{AttrRole, BackoffType, StepType};
use crate::ids::{AttrName, StepId};

/// A catalog entity: the reusable definition of one kind of step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub name: String,
    pub version: u32,
    pub step_type: StepType,
    pub attributes: HashMap<AttrName, AttrSpec>,
    #[serde(default)]
    pub script: Option<ScriptSpec>,
    #[serde(default)]
    pub predicate: Option<ScriptSpec>,
    #[serde(default)]
    pub http: Option<HttpSpec>,
    #[serde(default)]
    pub work_config: Option<WorkConfig>,
    #[serde(default)]
    pub flow: Option<FlowSpec>,
    #[serde(default)]
    pub memoizable: bool,
}

impl Step {
    /// Attributes this step may produce.
    pub fn outputs(&self) -> impl Iterator<Item = &AttrName> {
        self.attributes
            .iter()
            .filter(|(_, spec)| spec.role == AttrRole::Output)
            .map(|(name, _)| name)
    }

    /// Attributes this step consumes (required or optional).
    pub fn inputs(&self) -> impl Iterator<Item = &AttrName> {
        self.attributes
            .iter()
            .filter(|(_, spec)| spec.role != AttrRole::Output)
            .map(|(name, _)| name)
    }

    /// Required inputs only.
    pub fn required_inputs(&self) -> impl Iterator<Item = &AttrName> {
        self.attributes
            .iter()
            .filter(|(_, spec)| spec.role == AttrRole::Required)
            .map(|(name, _)| name)
    }
}

/// Per-attribute declaration on a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttrSpec {
    pub role: AttrRole,
    #[serde(rename = "type")]
    pub attr_type: String,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    /// Milliseconds an optional input may remain unset before the step is
    /// considered ready anyway. `0` means "never blocks".
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// If true, an array-shaped runtime value fans this input out across a
    /// Cartesian product of work items.
    #[serde(default)]
    pub for_each: bool,
    #[serde(default)]
    pub mapping: Option<Mapping>,
}

/// A script body, predicate body, or similar language+source pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptSpec {
    pub language: String,
    pub source: String,
}

/// Configuration for invoking a step over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSpec {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Work-item concurrency and retry policy for a step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorkConfig {
    #[serde(default)]
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_type: BackoffType,
    #[serde(default = "default_parallelism")]
    pub parallelism: i32,
}

const fn default_parallelism() -> i32 {
    1
}

impl WorkConfig {
    /// Parallelism clamped per §5: non-positive values mean 1.
    #[must_use]
    pub fn effective_parallelism(&self) -> usize {
        if self.parallelism <= 0 {
            1
        } else {
            self.parallelism as usize
        }
    }
}

/// Sub-flow specification for a step of type `Flow`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSpec {
    pub goals: Vec<StepId>,
}

/// Maps a catalog attribute name to a step-facing name and/or an extraction
/// script run over the raw input or output document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mapping {
    pub name: String,
    #[serde(default)]
    pub script: Option<ScriptSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_step() -> Step {
        let mut attributes = HashMap::new();
        attributes.insert(
            AttrName::new("value").unwrap(),
            AttrSpec {
                role: AttrRole::Required,
                attr_type: "string".into(),
                default: None,
                timeout_ms: None,
                for_each: false,
                mapping: None,
            },
        );
        attributes.insert(
            AttrName::new("result").unwrap(),
            AttrSpec {
                role: AttrRole::Output,
                attr_type: "string".into(),
                default: None,
                timeout_ms: None,
                for_each: false,
                mapping: None,
            },
        );
        Step {
            id: StepId::new("consumer").unwrap(),
            name: "Consumer".into(),
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

    #[test]
    fn splits_inputs_and_outputs() {
        let step = sample_step();
        let outputs: Vec<_> = step.outputs().map(AttrName::as_str).collect();
        let inputs: Vec<_> = step.inputs().map(AttrName::as_str).collect();
        assert_eq!(outputs, vec!["result"]);
        assert_eq!(inputs, vec!["value"]);
    }

    #[test]
    fn non_positive_parallelism_clamps_to_one() {
        let cfg = WorkConfig {
            max_retries: 3,
            backoff_ms: 100,
            max_backoff_ms: 1000,
            backoff_type: BackoffType::Fixed,
            parallelism: 0,
        };
        assert_eq!(cfg.effective_parallelism(), 1);

        let cfg = WorkConfig {
            parallelism: -5,
            ..cfg
        };
        assert_eq!(cfg.effective_parallelism(), 1);
    }
}
