//! Work-item generation (§4.7): expands a step's resolved inputs into the
//! Cartesian product of its `ForEach` inputs crossed with its scalar inputs.
//!
//! Grounded on the teacher's `executor::conditional` branch-enumeration
//! style (itself a small Cartesian expansion over condition branches);
//! generalized here to N-ary array inputs.

use std::collections::HashMap;

use glyph_domain::ids::AttrName;
use glyph_domain::step::Step;

use crate::errors::FlowTxError;

/// Hard cap on work items a single `prepareStep` may produce.
pub const MAX_WORK_ITEMS_PER_STEP: usize = 10_000;

/// Expand `inputs` into one input map per work item.
///
/// An input declared `ForEach=true` whose runtime value is a JSON array
/// fans out across that array; anything else (including a `ForEach` input
/// whose value is not array-shaped) is treated as a single scalar input
/// shared by every generated item.
pub fn expand_work_items(
    step: &Step,
    step_id: &str,
    inputs: &HashMap<AttrName, serde_json::Value>,
) -> Result<Vec<HashMap<AttrName, serde_json::Value>>, FlowTxError> {
    let mut scalars: HashMap<AttrName, serde_json::Value> = HashMap::new();
    let mut arrays: Vec<(AttrName, Vec<serde_json::Value>)> = Vec::new();

    for (name, value) in inputs {
        let is_for_each = step
            .attributes
            .get(name)
            .map(|spec| spec.for_each)
            .unwrap_or(false);

        match (is_for_each, value.as_array()) {
            (true, Some(items)) => arrays.push((name.clone(), items.clone())),
            _ => {
                scalars.insert(name.clone(), value.clone());
            }
        }
    }

    if arrays.is_empty() {
        return Ok(vec![scalars]);
    }

    let total: usize = arrays.iter().try_fold(1usize, |acc, (_, items)| {
        acc.checked_mul(items.len())
    }).unwrap_or(usize::MAX);

    if total > MAX_WORK_ITEMS_PER_STEP {
        return Err(FlowTxError::TooManyWorkItems {
            step: step_id.to_string(),
            max: MAX_WORK_ITEMS_PER_STEP,
        });
    }

    let mut combos: Vec<HashMap<AttrName, serde_json::Value>> = vec![scalars];
    for (name, items) in arrays {
        let mut next = Vec::with_capacity(combos.len() * items.len());
        for combo in &combos {
            for item in &items {
                let mut extended = combo.clone();
                extended.insert(name.clone(), item.clone());
                next.push(extended);
            }
        }
        combos = next;
    }

    Ok(combos)
}
