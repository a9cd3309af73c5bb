//! Workflow definition parsing and validation.
//!
//! A definition file is YAML holding the workflow, its steps and the api
//! configurations they call (see [`WorkflowDefinition`]).

use std::collections::HashSet;
use std::path::Path;

use ingestflow_types::workflow::WorkflowDefinition;
use thiserror::Error;

use super::schema::validate_table_name;

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_definition_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Load and validate a definition file.
pub fn load_definition_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_definition_yaml(&content)
}

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Workflow name is non-empty
/// - Step names are non-empty and unique
/// - ApiConfig ids are unique and api codes non-empty
/// - Every enabled task step references an existing ApiConfig
/// - Table name overrides are valid identifiers
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    let wf = &def.workflow;
    if wf.name.trim().is_empty() {
        return Err(DefinitionError::Validation(
            "workflow name must not be empty".to_string(),
        ));
    }

    let mut api_ids = HashSet::new();
    for api in &def.api_configs {
        if !api_ids.insert(api.id) {
            return Err(DefinitionError::Validation(format!(
                "duplicate api config id: {}",
                api.id
            )));
        }
        if api.api_code.trim().is_empty() {
            return Err(DefinitionError::Validation(format!(
                "api config {} has an empty api_code",
                api.id
            )));
        }
    }

    let mut names = HashSet::new();
    for step in &wf.steps {
        if step.step_name.trim().is_empty() {
            return Err(DefinitionError::Validation(
                "step name must not be empty".to_string(),
            ));
        }
        if !names.insert(step.step_name.as_str()) {
            return Err(DefinitionError::Validation(format!(
                "duplicate step name: '{}'",
                step.step_name
            )));
        }

        if let Some(table) = &step.target_table_name {
            validate_table_name(table).map_err(|_| {
                DefinitionError::Validation(format!(
                    "step '{}' has an invalid target table name '{table}'",
                    step.step_name
                ))
            })?;
        }

        if step.node_type.is_noop() || !step.is_enabled() {
            continue;
        }
        match step.source_api_id {
            None => {
                return Err(DefinitionError::Validation(format!(
                    "task step '{}' has no source_api_id",
                    step.step_name
                )));
            }
            Some(id) if !api_ids.contains(&id) => {
                return Err(DefinitionError::Validation(format!(
                    "step '{}' references unknown api config {id}",
                    step.step_name
                )));
            }
            Some(_) => {}
        }
    }

    Ok(())
}
