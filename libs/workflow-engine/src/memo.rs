//! Step memoization (§4.3): a bounded LRU keyed by
//! `hash(stepDefinition) + ":" + hash(inputs)`.
//!
//! The teacher has no bounded cache of its own; `lru::LruCache` is pulled in
//! fresh for this, the same way it pulls in `petgraph`/`strsim` fresh for the
//! validator.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use serde::Serialize;

use glyph_domain::ids::AttrName;
use glyph_domain::step::Step;

/// `hash(stepDefinition)`: omits `name`/display-only fields, includes
/// everything that affects behavior.
fn hash_step_definition(step: &Step) -> u64 {
    #[derive(Serialize)]
    struct Fingerprint<'a> {
        step_type: &'a glyph_domain::enums::StepType,
        version: u32,
        attributes: std::collections::BTreeMap<&'a str, &'a glyph_domain::step::AttrSpec>,
        script: &'a Option<glyph_domain::step::ScriptSpec>,
        predicate: &'a Option<glyph_domain::step::ScriptSpec>,
        http: &'a Option<glyph_domain::step::HttpSpec>,
        work_config: &'a Option<glyph_domain::step::WorkConfig>,
        flow: &'a Option<glyph_domain::step::FlowSpec>,
    }

    let attributes = step
        .attributes
        .iter()
        .map(|(name, spec)| (name.as_str(), spec))
        .collect();

    let fingerprint = Fingerprint {
        step_type: &step.step_type,
        version: step.version,
        attributes,
        script: &step.script,
        predicate: &step.predicate,
        http: &step.http,
        work_config: &step.work_config,
        flow: &step.flow,
    };

    hash_value(&serde_json::to_value(&fingerprint).expect("fingerprint always serializes"))
}

/// `hash(inputs)`: order-independent over keys.
fn hash_inputs(inputs: &HashMap<AttrName, serde_json::Value>) -> u64 {
    let ordered: std::collections::BTreeMap<&str, &serde_json::Value> =
        inputs.iter().map(|(k, v)| (k.as_str(), v)).collect();
    hash_value(&serde_json::to_value(&ordered).expect("inputs always serialize"))
}

fn hash_value(value: &serde_json::Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.to_string().hash(&mut hasher);
    hasher.finish()
}

/// Cache key: `hash(stepDefinition) + ":" + hash(inputs)`.
#[must_use]
pub fn memo_key(step: &Step, inputs: &HashMap<AttrName, serde_json::Value>) -> String {
    format!("{}:{}", hash_step_definition(step), hash_inputs(inputs))
}

type Outputs = HashMap<AttrName, serde_json::Value>;

/// Bounded LRU of step outputs keyed by `memo_key`.
pub struct MemoCache {
    inner: Mutex<LruCache<String, Outputs>>,
}

impl MemoCache {
    #[must_use]
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// `Get(step, inputs) -> outputs|miss`.
    #[must_use]
    pub fn get(&self, step: &Step, inputs: &HashMap<AttrName, serde_json::Value>) -> Option<Outputs> {
        let key = memo_key(step, inputs);
        self.inner.lock().expect("memo cache lock poisoned").get(&key).cloned()
    }

    /// `Put(step, inputs, outputs)`.
    pub fn put(&self, step: &Step, inputs: &HashMap<AttrName, serde_json::Value>, outputs: Outputs) {
        let key = memo_key(step, inputs);
        self.inner.lock().expect("memo cache lock poisoned").put(key, outputs);
    }
}
