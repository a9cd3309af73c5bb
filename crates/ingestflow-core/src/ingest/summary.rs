//! Loop summary audit payload.
//!
//! After a loop step finishes, one summary entry is logged with a JSON
//! payload describing every combination's outcome. Only the first few
//! combinations are detailed; the payload is cut to a maximum length.

use std::collections::BTreeMap;

use ingestflow_types::schema::Record;
use serde::Serialize;

use super::resolver::{Binding, ResolvedParam};
use super::tracker::truncate_chars;

/// Outcome of one loop combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComboStatus {
    Success,
    /// Executed successfully but the client returned nothing.
    Empty,
    Failed,
    /// Condition evaluated to false.
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComboDetail {
    pub combo_index: usize,
    pub params: Record,
    pub status: ComboStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopParamSummary {
    pub source: String,
    pub value_count: usize,
}

/// Accumulates combination outcomes for one loop step.
#[derive(Debug, Clone, Serialize)]
pub struct LoopSummary {
    #[serde(rename = "type")]
    kind: &'static str,
    pub total_combinations: usize,
    pub success_count: usize,
    pub fail_count: usize,
    pub skip_count: usize,
    pub total_records: i64,
    pub loop_params: BTreeMap<String, LoopParamSummary>,
    pub execution_details: Vec<ComboDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip)]
    detail_limit: usize,
}

impl LoopSummary {
    pub fn new(total_combinations: usize, params: &[ResolvedParam], detail_limit: usize) -> Self {
        let loop_params = params
            .iter()
            .filter_map(|p| match &p.binding {
                Binding::Loop(values) => Some((
                    p.name.clone(),
                    LoopParamSummary {
                        source: p.source.describe(),
                        value_count: values.len(),
                    },
                )),
                _ => None,
            })
            .collect();
        Self {
            kind: "loop_summary",
            total_combinations,
            success_count: 0,
            fail_count: 0,
            skip_count: 0,
            total_records: 0,
            loop_params,
            execution_details: Vec::new(),
            warning: None,
            detail_limit,
        }
    }

    /// Count a combination outcome; the detail is kept only while under
    /// the detail limit.
    pub fn record(&mut self, detail: ComboDetail) {
        match detail.status {
            ComboStatus::Success | ComboStatus::Empty => self.success_count += 1,
            ComboStatus::Failed => self.fail_count += 1,
            ComboStatus::Skipped => self.skip_count += 1,
        }
        self.total_records += detail.record_count.unwrap_or(0);
        if self.execution_details.len() < self.detail_limit {
            self.execution_details.push(detail);
        }
    }

    pub fn has_failures(&self) -> bool {
        self.fail_count > 0
    }

    /// Serialize, adding a warning when no combination produced data.
    pub fn to_json(&mut self, max_len: usize) -> String {
        if self.total_records == 0 {
            self.warning = Some("no combination returned data".to_string());
        }
        let json = serde_json::to_string(self).unwrap_or_default();
        truncate_chars(&json, max_len, "... (truncated)")
    }
}
