//! Run-scoped result cache.
//!
//! Holds the records each executed step produced, plus `step.field`
//! shortcuts to the first record's values. Created empty when a run starts
//! and dropped when it ends; never shared between runs.

use std::collections::HashMap;

use ingestflow_types::schema::Record;
use serde_json::{Map, Value, json};

/// Step results visible to later steps of the same run.
#[derive(Debug, Clone, Default)]
pub struct ResultCache {
    steps: HashMap<String, Vec<Record>>,
    shortcuts: HashMap<String, Value>,
    /// Publication order, for stable diagnostics.
    order: Vec<String>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `records` under `step`, replacing any earlier entry, and refresh
    /// the `step.field` shortcuts from the first record.
    pub fn publish(&mut self, step: &str, records: Vec<Record>) {
        let prefix = format!("{step}.");
        self.shortcuts.retain(|key, _| !key.starts_with(&prefix));
        if let Some(first) = records.first() {
            for (field, value) in first {
                self.shortcuts.insert(format!("{step}.{field}"), value.clone());
            }
        }
        if !self.steps.contains_key(step) {
            self.order.push(step.to_string());
        }
        self.steps.insert(step.to_string(), records);
    }

    /// Merge the batches of every loop combination into one entry, dropping
    /// rows identical to an earlier one. Returns the number of rows kept.
    pub fn publish_merged(&mut self, step: &str, batches: Vec<Vec<Record>>) -> usize {
        let mut merged: Vec<Record> = Vec::new();
        for record in batches.into_iter().flatten() {
            if !merged.contains(&record) {
                merged.push(record);
            }
        }
        let kept = merged.len();
        self.publish(step, merged);
        kept
    }

    pub fn records(&self, step: &str) -> Option<&[Record]> {
        self.steps.get(step).map(Vec::as_slice)
    }

    pub fn shortcut(&self, key: &str) -> Option<&Value> {
        self.shortcuts.get(key)
    }

    /// Names of the steps with a cached result, in publication order.
    pub fn step_names(&self) -> &[String] {
        &self.order
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Resolve a reference without a field part.
    ///
    /// A shortcut scalar yields one value (an array yields its elements). A
    /// step name yields its records; when every record has exactly one
    /// field, that field's values are returned instead of whole records.
    pub fn lookup_bare(&self, name: &str) -> Option<Vec<Value>> {
        if let Some(value) = self.shortcuts.get(name) {
            return Some(match value {
                Value::Array(items) => items.clone(),
                other => vec![other.clone()],
            });
        }
        let records = self.steps.get(name)?;
        let single_column = !records.is_empty() && records.iter().all(|r| r.len() == 1);
        Some(
            records
                .iter()
                .map(|r| match r.values().next() {
                    Some(value) if single_column => value.clone(),
                    _ => Value::Object(r.clone()),
                })
                .collect(),
        )
    }

    /// Look up a condition field: a `step.field` shortcut, or a step's
    /// records as an array.
    pub fn lookup_value(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.shortcuts.get(key) {
            return Some(value.clone());
        }
        self.steps
            .get(key)
            .map(|records| Value::Array(records.iter().cloned().map(Value::Object).collect()))
    }

    /// Build the JSON object condition expressions evaluate against.
    ///
    /// Shape:
    /// ```json
    /// { "steps": { "<step>": { "rows": [...], "count": N, "first": {...} } } }
    /// ```
    pub fn to_expression_context(&self) -> Value {
        let mut steps = Map::new();
        for (name, records) in &self.steps {
            steps.insert(
                name.clone(),
                json!({
                    "rows": records,
                    "count": records.len() as f64,
                    "first": records.first().cloned().map(Value::Object).unwrap_or(Value::Null),
                }),
            );
        }
        json!({ "steps": steps })
    }
}
