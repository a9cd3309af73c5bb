//! Step condition evaluation.
//!
//! A step's `condition_expr` takes one of two forms:
//!
//! - a JSON object `{"field": ..., "value": ..., "operator": "eq"|"ne"}`,
//!   compared against a ResultCache entry (`step.field` shortcut or a step's
//!   records); a field that is not cached leaves the step enabled;
//! - any other string, evaluated as a JEXL expression over
//!   `{ steps: { <name>: { rows, count, first } }, params: {...} }`.
//!
//! Payloads are always passed as context objects, never interpolated into
//! expression strings.

use serde::Deserialize;
use serde_json::{Value, json};

use super::cache::ResultCache;

#[derive(Debug, thiserror::Error)]
pub enum ConditionError {
    #[error("condition evaluation failed: {0}")]
    EvalFailed(String),

    #[error("condition did not evaluate to a boolean: got {result}")]
    NotBoolean { result: Value },

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

/// Comparison used by the structured condition form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum CompareOp {
    #[default]
    Eq,
    Ne,
}

#[derive(Debug, Deserialize)]
struct FieldCondition {
    field: String,
    value: Value,
    #[serde(default)]
    operator: Option<CompareOp>,
}

/// JEXL evaluator for step conditions with a few string and length transforms.
pub struct ConditionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("contains", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let search = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.contains(search)))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.len(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Decide whether a step (or one loop combination) should execute.
    ///
    /// `params` is the combination being considered, exposed as `params` to
    /// JEXL expressions.
    pub fn should_execute(
        &self,
        condition: &str,
        cache: &ResultCache,
        params: &Value,
    ) -> Result<bool, ConditionError> {
        let trimmed = condition.trim();
        if trimmed.is_empty() {
            return Ok(true);
        }

        if trimmed.starts_with('{') {
            let parsed: FieldCondition = serde_json::from_str(trimmed)
                .map_err(|e| ConditionError::EvalFailed(format!("malformed field condition: {e}")))?;
            return Ok(Self::check_field(&parsed, cache));
        }

        let mut context = cache.to_expression_context();
        if let Some(obj) = context.as_object_mut() {
            obj.insert("params".to_string(), params.clone());
        }
        self.evaluate_bool(trimmed, &context)
    }

    fn check_field(condition: &FieldCondition, cache: &ResultCache) -> bool {
        let Some(actual) = cache.lookup_value(&condition.field) else {
            return true;
        };
        match condition.operator {
            Some(CompareOp::Eq) => actual == condition.value,
            Some(CompareOp::Ne) => actual != condition.value,
            None => true,
        }
    }

    /// Evaluate a JEXL expression and coerce the result to a boolean.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ConditionError> {
        if !context.is_object() {
            return Err(ConditionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        let result = self
            .evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ConditionError::EvalFailed(e.to_string()))?;

        Self::value_to_bool(&result)
    }

    /// Truthiness of an expression result. Arrays and objects are rejected
    /// so that a mistyped expression fails open instead of silently passing.
    fn value_to_bool(value: &Value) -> Result<bool, ConditionError> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::Null => Ok(false),
            Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0) != 0.0),
            Value::String(s) => Ok(!s.is_empty()),
            Value::Array(_) | Value::Object(_) => Err(ConditionError::NotBoolean {
                result: value.clone(),
            }),
        }
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}
