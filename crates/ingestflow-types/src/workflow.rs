//! Workflow configuration types for ingestflow.
//!
//! A workflow is an ordered list of steps. Each task step is bound to one
//! external API (`ApiConfig`) and declares how its request parameters are
//! resolved, where its results are written, and with which merge semantics.
//! These types are read-only to the engine; they are produced by whatever
//! manages configuration (YAML files in the CLI).

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::Record;

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// Whether a workflow or step participates in execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Enabled,
    Disabled,
}

/// A configured pipeline: a named, ordered list of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub status: WorkflowStatus,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowConfig {
    pub fn is_enabled(&self) -> bool {
        self.status == WorkflowStatus::Enabled
    }

    /// Steps in execution order: by `step_order`, ties broken by `id`.
    pub fn ordered_steps(&self) -> Vec<&WorkflowStep> {
        let mut steps: Vec<&WorkflowStep> = self.steps.iter().collect();
        steps.sort_by_key(|s| (s.step_order, s.id));
        steps
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// Node kind of a step. `Start` and `End` are markers and never execute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Start,
    #[default]
    Task,
    End,
}

impl NodeType {
    pub fn is_noop(self) -> bool {
        matches!(self, NodeType::Start | NodeType::End)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeType::Start => write!(f, "start"),
            NodeType::Task => write!(f, "task"),
            NodeType::End => write!(f, "end"),
        }
    }
}

/// Write semantics applied when persisting a result batch.
///
/// Persisted as the string codes `"0"`..`"3"`; the lowercase names are
/// accepted on input as well.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteMode {
    #[default]
    #[serde(rename = "0", alias = "insert")]
    Insert,
    #[serde(rename = "1", alias = "insert_ignore")]
    InsertIgnore,
    #[serde(rename = "2", alias = "upsert")]
    Upsert,
    #[serde(rename = "3", alias = "delete_insert")]
    DeleteInsert,
}

impl WriteMode {
    pub fn code(self) -> &'static str {
        match self {
            WriteMode::Insert => "0",
            WriteMode::InsertIgnore => "1",
            WriteMode::Upsert => "2",
            WriteMode::DeleteInsert => "3",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "0" => Some(WriteMode::Insert),
            "1" => Some(WriteMode::InsertIgnore),
            "2" => Some(WriteMode::Upsert),
            "3" => Some(WriteMode::DeleteInsert),
            _ => None,
        }
    }

    /// Modes that rely on the database's conflict detection over a key set.
    pub fn requires_unique_key(self) -> bool {
        !matches!(self, WriteMode::Insert)
    }
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteMode::Insert => write!(f, "insert"),
            WriteMode::InsertIgnore => write!(f, "insert_ignore"),
            WriteMode::Upsert => write!(f, "upsert"),
            WriteMode::DeleteInsert => write!(f, "delete_insert"),
        }
    }
}

/// Declared value of one step parameter.
///
/// Either a structured `{type: fixed|variable|loop, ...}` object, or any
/// other JSON value. Strings of the form `${step.field}` are references;
/// everything else is a literal. Objects with an unrecognised `type` fall
/// through to `Literal`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamSpec {
    Structured(StructuredParam),
    Literal(Value),
}

/// Explicitly typed parameter declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StructuredParam {
    Fixed {
        #[serde(default)]
        value: Value,
    },
    Variable {
        #[serde(default, alias = "value")]
        source: String,
    },
    Loop {
        #[serde(default, alias = "value")]
        source: String,
    },
}

/// One configured unit of work in a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub workflow_id: i64,
    pub step_name: String,
    #[serde(default)]
    pub step_order: i32,
    #[serde(default)]
    pub node_type: NodeType,
    /// ApiConfig this step calls. Absent for start/end nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_api_id: Option<i64>,
    #[serde(default)]
    pub step_params: BTreeMap<String, ParamSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_table_name: Option<String>,
    /// Falls back to the ApiConfig default, then `Insert`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_mode: Option<WriteMode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unique_key_fields: Vec<String>,
    #[serde(default)]
    pub loop_mode: bool,
    #[serde(default)]
    pub status: WorkflowStatus,
}

impl WorkflowStep {
    pub fn is_enabled(&self) -> bool {
        self.status == WorkflowStatus::Enabled
    }
}

// ---------------------------------------------------------------------------
// API configuration
// ---------------------------------------------------------------------------

/// Description of one external API endpoint the client can invoke.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub id: i64,
    pub api_name: String,
    pub api_code: String,
    /// Base request parameters; step combinations and task params override them.
    #[serde(default)]
    pub request_param_template: Record,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub primary_key_fields: Vec<String>,
    /// Result field allow-list. Empty keeps every returned field.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_write_mode: Option<WriteMode>,
    #[serde(default)]
    pub status: WorkflowStatus,
}

impl ApiConfig {
    pub fn is_enabled(&self) -> bool {
        self.status == WorkflowStatus::Enabled
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// File format for exported batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveFormat {
    #[default]
    Csv,
    Json,
}

impl SaveFormat {
    pub fn extension(self) -> &'static str {
        match self {
            SaveFormat::Csv => "csv",
            SaveFormat::Json => "json",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_lowercase().as_str() {
            "csv" => Some(SaveFormat::Csv),
            "json" => Some(SaveFormat::Json),
            _ => None,
        }
    }
}

impl fmt::Display for SaveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

fn default_save_to_db() -> bool {
    true
}

/// Where a task's downloaded batches end up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    /// Merge batches into the target tables.
    #[serde(default = "default_save_to_db")]
    pub save_to_db: bool,
    /// Directory each batch is also exported to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_path: Option<PathBuf>,
    #[serde(default)]
    pub save_format: SaveFormat,
}

impl Default for TaskOutput {
    fn default() -> Self {
        Self {
            save_to_db: default_save_to_db(),
            save_path: None,
            save_format: SaveFormat::default(),
        }
    }
}

/// The scheduled task a run executes on behalf of.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestTask {
    pub task_id: i64,
    pub task_name: String,
    pub workflow_id: i64,
    /// Download this single ApiConfig instead of running the workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_id: Option<i64>,
    /// Table used when a step has no override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_table_name: Option<String>,
    /// Parameters that override every step's resolved parameters.
    #[serde(default)]
    pub task_params: Record,
    /// `YYYYMMDD` stamp written into the `download_date` bookkeeping column.
    pub download_date: String,
    #[serde(default)]
    pub output: TaskOutput,
}

// ---------------------------------------------------------------------------
// Definition file
// ---------------------------------------------------------------------------

/// On-disk workflow document: the workflow, its steps, and the APIs they call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub api_configs: Vec<ApiConfig>,
}

impl WorkflowDefinition {
    pub fn api_config(&self, id: i64) -> Option<&ApiConfig> {
        self.api_configs.iter().find(|c| c.id == id)
    }

    /// A one-step workflow that downloads `api` with its template parameters.
    pub fn single_api(api: &ApiConfig, workflow_id: i64) -> Self {
        let step = WorkflowStep {
            id: 1,
            workflow_id,
            step_name: api.api_code.clone(),
            step_order: 1,
            node_type: NodeType::Task,
            source_api_id: Some(api.id),
            step_params: BTreeMap::new(),
            condition_expr: None,
            target_table_name: None,
            write_mode: None,
            unique_key_fields: Vec::new(),
            loop_mode: false,
            status: WorkflowStatus::Enabled,
        };
        Self {
            workflow: WorkflowConfig {
                id: workflow_id,
                name: format!("api:{}", api.api_code),
                description: None,
                status: WorkflowStatus::Enabled,
                steps: vec![step],
            },
            api_configs: vec![api.clone()],
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
