//! Parameter template resolution.
//!
//! Step parameters are declared as literals, `${step.field}` references, or
//! structured `{type: fixed|variable|loop}` objects. Resolution happens in two
//! phases:
//!
//! 1. [`classify_params`] turns declarations into [`ParamSource`]s, evaluating
//!    relative-date literals (`today`, `today+N`, `today-N`) on the way.
//! 2. [`resolve_bindings`] looks every reference up in the run's
//!    [`ResultCache`] and produces concrete [`Binding`]s.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{Duration, NaiveDate};
use ingestflow_types::workflow::{ParamSpec, StructuredParam};
use serde_json::Value;

use super::cache::ResultCache;

/// Placeholder that stands for the most recently executed step.
pub const PREVIOUS_STEP_PLACEHOLDER: &str = "previous_step";

// ---------------------------------------------------------------------------
// Relative dates
// ---------------------------------------------------------------------------

/// Evaluate a relative-date expression against `base`.
///
/// Accepts `today`, `today+N` and `today-N` (case-insensitive, surrounding
/// whitespace ignored) and returns the date as `YYYYMMDD`. Anything else
/// returns `None`.
pub fn evaluate_date_expression(expr: &str, base: NaiveDate) -> Option<String> {
    let lowered = expr.trim().to_ascii_lowercase();
    let rest = lowered.strip_prefix("today")?;

    let offset_days: i64 = if rest.is_empty() {
        0
    } else {
        let (sign, digits) = rest.split_at(1);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let n: i64 = digits.parse().ok()?;
        match sign {
            "+" => n,
            "-" => -n,
            _ => return None,
        }
    };

    let target = base.checked_add_signed(Duration::try_days(offset_days)?)?;
    Some(target.format("%Y%m%d").to_string())
}

/// Replace a string value that is a date expression with its evaluated form.
fn evaluate_if_date(value: Value, base: NaiveDate) -> Value {
    match &value {
        Value::String(s) => match evaluate_date_expression(s, base) {
            Some(date) => Value::String(date),
            None => value,
        },
        _ => value,
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Where a parameter's value comes from, before the cache is consulted.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamSource {
    /// Constant value, date expressions already evaluated.
    Fixed(Value),
    /// `step.field` of the first cached record (or a bare cache name).
    Variable(String),
    /// Every distinct `step.field` value across cached records.
    Loop(String),
}

impl ParamSource {
    pub fn kind(&self) -> &'static str {
        match self {
            ParamSource::Fixed(_) => "fixed",
            ParamSource::Variable(_) => "variable",
            ParamSource::Loop(_) => "loop",
        }
    }

    /// Human-readable origin, used in warnings and loop summaries.
    pub fn describe(&self) -> String {
        match self {
            ParamSource::Fixed(v) => v.to_string(),
            ParamSource::Variable(s) | ParamSource::Loop(s) => s.clone(),
        }
    }
}

/// Strip `${...}` from a reference string, if present.
fn reference_body(s: &str) -> Option<&str> {
    s.strip_prefix("${").and_then(|rest| rest.strip_suffix('}'))
}

/// Sources written as `${x}` inside structured declarations are accepted too.
fn normalize_source(s: &str) -> String {
    reference_body(s).unwrap_or(s).trim().to_string()
}

/// Classify every declared parameter of a step.
///
/// A bare `${ref}` string becomes a `Loop` under loop mode and a `Variable`
/// otherwise; a structured `loop` declaration outside loop mode binds as a
/// `Variable` too, so a non-loop step always executes once. Fixed values
/// that are date expressions are evaluated against `today`.
pub fn classify_params(
    step_params: &BTreeMap<String, ParamSpec>,
    loop_mode: bool,
    today: NaiveDate,
) -> BTreeMap<String, ParamSource> {
    step_params
        .iter()
        .map(|(name, spec)| {
            let source = match spec {
                ParamSpec::Structured(StructuredParam::Fixed { value }) => {
                    ParamSource::Fixed(evaluate_if_date(value.clone(), today))
                }
                ParamSpec::Structured(StructuredParam::Variable { source }) => {
                    ParamSource::Variable(normalize_source(source))
                }
                ParamSpec::Structured(StructuredParam::Loop { source }) if loop_mode => {
                    ParamSource::Loop(normalize_source(source))
                }
                ParamSpec::Structured(StructuredParam::Loop { source }) => {
                    ParamSource::Variable(normalize_source(source))
                }
                ParamSpec::Literal(Value::String(s)) => match reference_body(s) {
                    Some(body) if loop_mode => ParamSource::Loop(body.trim().to_string()),
                    Some(body) => ParamSource::Variable(body.trim().to_string()),
                    None => ParamSource::Fixed(evaluate_if_date(Value::String(s.clone()), today)),
                },
                ParamSpec::Literal(other) => ParamSource::Fixed(other.clone()),
            };
            (name.clone(), source)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Binding
// ---------------------------------------------------------------------------

/// A parameter's resolved value set.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    Fixed(Value),
    /// `None` when the referenced value could not be found.
    Variable(Option<Value>),
    /// Distinct values in first-occurrence order. May be empty.
    Loop(Vec<Value>),
}

impl Binding {
    /// The values this binding contributes to the combination product.
    pub fn values(&self) -> Vec<Value> {
        match self {
            Binding::Fixed(v) => vec![v.clone()],
            Binding::Variable(Some(v)) => vec![v.clone()],
            Binding::Variable(None) => Vec::new(),
            Binding::Loop(values) => values.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Binding::Fixed(_) => false,
            Binding::Variable(v) => v.is_none(),
            Binding::Loop(values) => values.is_empty(),
        }
    }

    pub fn is_loop(&self) -> bool {
        matches!(self, Binding::Loop(_))
    }
}

/// One parameter after resolution against the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedParam {
    pub name: String,
    /// Source after `previous_step` substitution.
    pub source: ParamSource,
    pub binding: Binding,
}

impl fmt::Display for ResolvedParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, source: {})",
            self.name,
            self.source.kind(),
            self.source.describe()
        )
    }
}

/// Substitute the `previous_step` placeholder with the actual step name.
fn substitute_previous_step(source: &str, previous_step: Option<&str>) -> String {
    let Some(previous) = previous_step else {
        return source.to_string();
    };
    if source == PREVIOUS_STEP_PLACEHOLDER {
        return previous.to_string();
    }
    match source.strip_prefix("previous_step.") {
        Some(field) => format!("{previous}.{field}"),
        None => source.to_string(),
    }
}

/// Resolve classified parameters against the result cache.
///
/// Output order follows parameter name order, which is also the nesting
/// order of the combination product (first parameter outermost).
pub fn resolve_bindings(
    sources: &BTreeMap<String, ParamSource>,
    cache: &ResultCache,
    previous_step: Option<&str>,
    today: NaiveDate,
) -> Vec<ResolvedParam> {
    sources
        .iter()
        .map(|(name, source)| {
            let (source, binding) = match source {
                ParamSource::Fixed(value) => (
                    source.clone(),
                    Binding::Fixed(evaluate_if_date(value.clone(), today)),
                ),
                ParamSource::Variable(raw) => {
                    let reference = substitute_previous_step(raw, previous_step);
                    let value = resolve_variable(name, &reference, cache)
                        .map(|v| evaluate_if_date(v, today));
                    (ParamSource::Variable(reference), Binding::Variable(value))
                }
                ParamSource::Loop(raw) => {
                    let reference = substitute_previous_step(raw, previous_step);
                    let values = resolve_loop(name, &reference, cache, today);
                    tracing::debug!(param = %name, source = %reference, values = values.len(), "resolved loop parameter");
                    (ParamSource::Loop(reference), Binding::Loop(values))
                }
            };
            ResolvedParam {
                name: name.clone(),
                source,
                binding,
            }
        })
        .collect()
}

/// Look up a `Variable` reference: the `step.field` shortcut first, then the
/// first cached record of `step`.
fn resolve_variable(param: &str, reference: &str, cache: &ResultCache) -> Option<Value> {
    match reference.split_once('.') {
        Some((step, field)) => {
            if let Some(value) = cache.shortcut(reference).filter(|v| !v.is_null()) {
                return Some(value.clone());
            }
            let Some(records) = cache.records(step) else {
                tracing::warn!(
                    param = %param,
                    source = %reference,
                    available = ?cache.step_names(),
                    "variable parameter references a step with no cached result"
                );
                return None;
            };
            let Some(first) = records.first() else {
                tracing::warn!(param = %param, source = %reference, "variable parameter references an empty result");
                return None;
            };
            match first.get(field).filter(|v| !v.is_null()) {
                Some(value) => Some(value.clone()),
                None => {
                    tracing::warn!(
                        param = %param,
                        source = %reference,
                        available = ?first.keys().collect::<Vec<_>>(),
                        "first record has no such field"
                    );
                    None
                }
            }
        }
        None => {
            let value = cache.lookup_bare(reference).and_then(|values| values.into_iter().next());
            if value.is_none() {
                tracing::warn!(
                    param = %param,
                    source = %reference,
                    available = ?cache.step_names(),
                    "variable parameter references an unknown cache entry"
                );
            }
            value
        }
    }
}

/// Collect the distinct values of a `Loop` reference in first-occurrence order.
fn resolve_loop(param: &str, reference: &str, cache: &ResultCache, today: NaiveDate) -> Vec<Value> {
    let mut values: Vec<Value> = Vec::new();
    let mut push_distinct = |value: Value| {
        let value = evaluate_if_date(value, today);
        if !values.contains(&value) {
            values.push(value);
        }
    };

    match reference.split_once('.') {
        Some((step, field)) => {
            let Some(records) = cache.records(step) else {
                tracing::warn!(
                    param = %param,
                    source = %reference,
                    available = ?cache.step_names(),
                    "loop parameter references a step with no cached result"
                );
                return Vec::new();
            };
            if records.is_empty() {
                tracing::warn!(param = %param, source = %reference, "loop parameter references an empty result");
                return Vec::new();
            }
            let mut found = 0usize;
            for record in records {
                if let Some(value) = record.get(field) {
                    push_distinct(value.clone());
                    found += 1;
                }
            }
            if found == 0 {
                tracing::warn!(
                    param = %param,
                    source = %reference,
                    records = records.len(),
                    available = ?records[0].keys().collect::<Vec<_>>(),
                    "no cached record carries the loop field"
                );
            }
        }
        None => match cache.lookup_bare(reference) {
            Some(found) => found.into_iter().for_each(push_distinct),
            None => {
                tracing::warn!(
                    param = %param,
                    source = %reference,
                    available = ?cache.step_names(),
                    "loop parameter references an unknown cache entry"
                );
            }
        },
    }

    values
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ingestflow_types::schema::Record;
    use serde_json::json;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(value: Value) -> Record {
        value.as_object().unwrap().clone()
    }

    fn params(value: Value) -> BTreeMap<String, ParamSpec> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn today_minus_one_crosses_leap_day() {
        assert_eq!(
            evaluate_date_expression("today-1", date(2024, 3, 2)),
            Some("20240301".to_string())
        );
        assert_eq!(
            evaluate_date_expression("today-2", date(2024, 3, 2)),
            Some("20240229".to_string())
        );
    }

    #[test]
    fn date_expression_is_case_and_space_insensitive() {
        let base = date(2024, 12, 31);
        assert_eq!(evaluate_date_expression("  TODAY ", base), Some("20241231".to_string()));
        assert_eq!(evaluate_date_expression("Today+1", base), Some("20250101".to_string()));
        assert_eq!(evaluate_date_expression("today+30", base), Some("20250130".to_string()));
    }

    #[test]
    fn non_date_strings_are_left_alone() {
        let base = date(2024, 1, 1);
        for expr in ["yesterday", "today+", "today*2", "today-1d", "20240101", "todays"] {
            assert_eq!(evaluate_date_expression(expr, base), None, "{expr}");
        }
    }

    #[test]
    fn classify_literal_forms() {
        let today = date(2024, 3, 2);
        let declared = params(json!({
            "a": "${stocks.ts_code}",
            "b": "today-1",
            "c": 5,
            "d": {"type": "fixed", "value": "TODAY"},
            "e": {"type": "variable", "source": "cal.date"},
            "f": {"type": "loop", "source": "${stocks.ts_code}"},
        }));

        let sources = classify_params(&declared, false, today);
        assert_eq!(sources["a"], ParamSource::Variable("stocks.ts_code".to_string()));
        assert_eq!(sources["b"], ParamSource::Fixed(json!("20240301")));
        assert_eq!(sources["c"], ParamSource::Fixed(json!(5)));
        assert_eq!(sources["d"], ParamSource::Fixed(json!("20240302")));
        assert_eq!(sources["e"], ParamSource::Variable("cal.date".to_string()));
        assert_eq!(sources["f"], ParamSource::Variable("stocks.ts_code".to_string()));

        let sources = classify_params(&declared, true, today);
        assert_eq!(sources["a"], ParamSource::Loop("stocks.ts_code".to_string()));
        assert_eq!(sources["f"], ParamSource::Loop("stocks.ts_code".to_string()));
    }

    #[test]
    fn loop_values_are_distinct_in_first_occurrence_order() {
        let mut cache = ResultCache::new();
        cache.publish(
            "prior",
            vec![
                record(json!({"symbol": "A"})),
                record(json!({"symbol": "B"})),
                record(json!({"symbol": "A"})),
            ],
        );
        let sources = BTreeMap::from([("symbol".to_string(), ParamSource::Loop("prior.symbol".to_string()))]);
        let resolved = resolve_bindings(&sources, &cache, None, date(2024, 1, 1));
        assert_eq!(resolved[0].binding, Binding::Loop(vec![json!("A"), json!("B")]));
    }

    #[test]
    fn loop_values_evaluate_date_expressions() {
        let mut cache = ResultCache::new();
        cache.publish(
            "dates",
            vec![record(json!({"d": "today"})), record(json!({"d": "today-1"})), record(json!({"d": "20240101"}))],
        );
        let sources = BTreeMap::from([("d".to_string(), ParamSource::Loop("dates.d".to_string()))]);
        let resolved = resolve_bindings(&sources, &cache, None, date(2024, 3, 2));
        assert_eq!(
            resolved[0].binding,
            Binding::Loop(vec![json!("20240302"), json!("20240301"), json!("20240101")])
        );
    }

    #[test]
    fn missing_step_or_field_gives_empty_binding() {
        let mut cache = ResultCache::new();
        cache.publish("stocks", vec![record(json!({"ts_code": "000001.SZ"}))]);
        let sources = BTreeMap::from([
            ("a".to_string(), ParamSource::Loop("nowhere.ts_code".to_string())),
            ("b".to_string(), ParamSource::Loop("stocks.missing".to_string())),
            ("c".to_string(), ParamSource::Variable("stocks.missing".to_string())),
            ("d".to_string(), ParamSource::Variable("nowhere".to_string())),
        ]);
        let resolved = resolve_bindings(&sources, &cache, None, date(2024, 1, 1));
        assert!(resolved.iter().all(|p| p.binding.is_empty()));
    }

    #[test]
    fn variable_reads_first_record() {
        let mut cache = ResultCache::new();
        cache.publish(
            "cal",
            vec![record(json!({"date": "20240105"})), record(json!({"date": "20240104"}))],
        );
        let sources = BTreeMap::from([("d".to_string(), ParamSource::Variable("cal.date".to_string()))]);
        let resolved = resolve_bindings(&sources, &cache, None, date(2024, 1, 1));
        assert_eq!(resolved[0].binding, Binding::Variable(Some(json!("20240105"))));
    }

    #[test]
    fn previous_step_placeholder_is_substituted() {
        let mut cache = ResultCache::new();
        cache.publish("stocks", vec![record(json!({"ts_code": "X"}))]);
        let sources = BTreeMap::from([
            ("a".to_string(), ParamSource::Loop("previous_step.ts_code".to_string())),
            ("b".to_string(), ParamSource::Variable("previous_step.ts_code".to_string())),
        ]);
        let resolved = resolve_bindings(&sources, &cache, Some("stocks"), date(2024, 1, 1));
        assert_eq!(resolved[0].source, ParamSource::Loop("stocks.ts_code".to_string()));
        assert_eq!(resolved[0].binding, Binding::Loop(vec![json!("X")]));
        assert_eq!(resolved[1].binding, Binding::Variable(Some(json!("X"))));
    }

    #[test]
    fn bare_loop_reference_unwraps_single_column_results() {
        let mut cache = ResultCache::new();
        cache.publish("codes", vec![record(json!({"c": 1})), record(json!({"c": 2})), record(json!({"c": 1}))]);
        let sources = BTreeMap::from([("c".to_string(), ParamSource::Loop("codes".to_string()))]);
        let resolved = resolve_bindings(&sources, &cache, None, date(2024, 1, 1));
        assert_eq!(resolved[0].binding, Binding::Loop(vec![json!(1), json!(2)]));
    }

    #[test]
    fn resolved_param_display_names_kind_and_source() {
        let param = ResolvedParam {
            name: "ts_code".to_string(),
            source: ParamSource::Loop("stocks.ts_code".to_string()),
            binding: Binding::Loop(vec![]),
        };
        assert_eq!(param.to_string(), "ts_code (loop, source: stocks.ts_code)");
    }
}
