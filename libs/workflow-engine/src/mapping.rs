//! Attribute mapping (§4.8): translates between a step's catalog-facing
//! attribute names and its script/HTTP-facing input and output names.
//!
//! Grounded on the teacher's `transition::conditions` module, which
//! evaluates small expressions against flow state through a pluggable
//! evaluator; here the evaluator is the `ScriptEnv` collaborator and the
//! expressions are mapping scripts over a single JSON document.

use std::collections::HashMap;

use thiserror::Error;
use tracing::warn;

use glyph_domain::ids::AttrName;
use glyph_domain::step::AttrSpec;

use crate::collaborators::ScriptEnv;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("mapping for '{attr}' matched zero values")]
    NoMatch { attr: String },
}

/// Resolve one step-facing input value for `attr` out of the raw flow
/// attribute map (§4.8, input direction).
///
/// Resolution order: if `spec.mapping.script` is set, compile+run it
/// against `raw_value` and take the single result (or the list, if many);
/// a zero-match result fails the input. If the script fails to compile or
/// run, fall back to the raw value and log. With no script, the step-facing
/// name is `spec.mapping.name` if set, otherwise `attr` itself — the raw
/// value passes through unchanged either way.
pub async fn map_input(
    script_env: &dyn ScriptEnv,
    attr: &AttrName,
    spec: &AttrSpec,
    raw_value: &serde_json::Value,
) -> Result<serde_json::Value, MappingError> {
    let Some(mapping) = &spec.mapping else {
        return Ok(raw_value.clone());
    };
    let Some(script) = &mapping.script else {
        return Ok(raw_value.clone());
    };

    match script_env.evaluate_mapping(script, raw_value).await {
        Ok(matches) if matches.is_empty() => Err(MappingError::NoMatch {
            attr: attr.as_str().to_string(),
        }),
        Ok(mut matches) if matches.len() == 1 => Ok(matches.remove(0)),
        Ok(matches) => Ok(serde_json::Value::Array(matches)),
        Err(err) => {
            warn!(attr = attr.as_str(), error = %err, "mapping script failed to compile or run, using raw value");
            Ok(raw_value.clone())
        }
    }
}

/// The step-facing name a catalog attribute is addressed by inside a
/// script/HTTP invocation.
#[must_use]
pub fn input_facing_name<'a>(attr: &'a AttrName, spec: &'a AttrSpec) -> &'a str {
    spec.mapping
        .as_ref()
        .map(|m| m.name.as_str())
        .unwrap_or_else(|| attr.as_str())
}

/// Remap a step's raw output document back onto catalog attribute names
/// (§4.8, output direction). For each declared output attribute: run its
/// `mapping.script` against the full document if set; otherwise read
/// `mapping.name` from the document; otherwise read the attribute's own
/// name. Missing values are simply absent from the result (the caller
/// decides whether that's an error).
pub async fn map_outputs(
    script_env: &dyn ScriptEnv,
    outputs: &HashMap<AttrName, AttrSpec>,
    raw: &serde_json::Value,
) -> HashMap<AttrName, serde_json::Value> {
    let mut mapped = HashMap::new();

    for (attr, spec) in outputs {
        let value = if let Some(script) = spec.mapping.as_ref().and_then(|m| m.script.as_ref()) {
            match script_env.evaluate_mapping(script, raw).await {
                Ok(mut matches) if matches.len() == 1 => Some(matches.remove(0)),
                Ok(matches) if !matches.is_empty() => Some(serde_json::Value::Array(matches)),
                Ok(_) => None,
                Err(err) => {
                    warn!(attr = attr.as_str(), error = %err, "output mapping script failed, falling back to name lookup");
                    let name = input_facing_name(attr, spec);
                    raw.get(name).cloned()
                }
            }
        } else {
            let name = input_facing_name(attr, spec);
            raw.get(name).cloned()
        };

        if let Some(value) = value {
            mapped.insert(attr.clone(), value);
        }
    }

    mapped
}
