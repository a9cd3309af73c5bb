//! Combination generation.
//!
//! Expands resolved parameter bindings into the concrete parameter sets a
//! step is invoked with. Without loop bindings there is exactly one
//! combination; with loop bindings the Cartesian product of every binding's
//! values is taken, first parameter outermost.

use ingestflow_types::schema::Record;
use serde_json::Value;

use super::resolver::ResolvedParam;

/// Result of expanding a step's bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct CombinationSet {
    pub combinations: Vec<Record>,
    /// Bindings that resolved to no value, rendered as `name (kind, source: ...)`.
    pub empty_bindings: Vec<String>,
    /// Whether any binding was a loop binding.
    pub looped: bool,
}

impl CombinationSet {
    /// A loop expansion that produced nothing because a binding was empty.
    pub fn is_unsatisfiable(&self) -> bool {
        self.combinations.is_empty() && !self.empty_bindings.is_empty()
    }
}

/// Reduce a value to a primitive scalar. Arrays and objects become their
/// JSON text.
pub fn sanitize_value(value: Value) -> Value {
    match value {
        Value::Array(_) | Value::Object(_) => Value::String(value.to_string()),
        scalar => scalar,
    }
}

/// Expand resolved bindings into concrete parameter combinations.
pub fn generate_combinations(params: &[ResolvedParam]) -> CombinationSet {
    let looped = params.iter().any(|p| p.binding.is_loop());
    let empty_bindings: Vec<String> = params
        .iter()
        .filter(|p| p.binding.is_empty())
        .map(ToString::to_string)
        .collect();

    if !looped {
        let combination: Record = params
            .iter()
            .filter_map(|p| {
                p.binding
                    .values()
                    .into_iter()
                    .next()
                    .map(|v| (p.name.clone(), sanitize_value(v)))
            })
            .collect();
        return CombinationSet {
            combinations: vec![combination],
            empty_bindings,
            looped,
        };
    }

    if !empty_bindings.is_empty() {
        tracing::warn!(
            empty = %empty_bindings.join(", "),
            "parameters have no values, no combinations generated"
        );
        return CombinationSet {
            combinations: Vec::new(),
            empty_bindings,
            looped,
        };
    }

    let mut combinations: Vec<Record> = vec![Record::new()];
    for param in params {
        let values = param.binding.values();
        let mut next = Vec::with_capacity(combinations.len() * values.len());
        for partial in &combinations {
            for value in &values {
                let mut extended = partial.clone();
                extended.insert(param.name.clone(), sanitize_value(value.clone()));
                next.push(extended);
            }
        }
        combinations = next;
    }

    CombinationSet {
        combinations,
        empty_bindings,
        looped,
    }
}
