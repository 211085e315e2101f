//! Step metadata: labels, documentation and column descriptions
//!
//! Metadata is only consumed for labels and for validating a configured step
//! list before anything is calculated.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::domain::StepConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescription {
    pub name: String,
    pub description: String,
    /// Display format, e.g. `0.00000`
    pub format: Option<String>,
}

impl ColumnDescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepMetadata {
    pub name: String,
    pub documentation_path: Option<String>,
    pub parameter_view: Option<String>,
    pub graphic_view: Option<String>,
    pub inputs: Vec<ColumnDescription>,
    pub outputs: Vec<ColumnDescription>,
}

/// Resolves a step's identifying name to its metadata
pub trait StepMetadataResolver: Send + Sync {
    fn resolve(&self, step_name: &str) -> Option<StepMetadata>;
}

/// Display order of result columns, persisted with a cache row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnOrdering(pub Vec<String>);

/// Result column → display format, persisted with a cache row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatLookup(pub BTreeMap<String, String>);

/// Configuration problems of a step list, empty when it can run
pub fn validate_steps(steps: &[StepConfig], resolver: &dyn StepMetadataResolver) -> Vec<String> {
    let mut problems = Vec::new();
    let mut writers: HashMap<&str, &str> = HashMap::new();

    for (position, step) in steps.iter().enumerate() {
        if step.name.trim().is_empty() {
            problems.push(format!("Step {} has no name", position + 1));
            continue;
        }

        match resolver.resolve(&step.name) {
            None => problems.push(format!(
                "Step '{}' is not a known calculation step",
                step.name
            )),
            Some(metadata) => {
                for input in step.inputs.keys() {
                    if !metadata.inputs.iter().any(|d| &d.name == input) {
                        problems.push(format!("Step '{}' has no input '{}'", step.name, input));
                    }
                }
                for output in step.outputs.keys() {
                    if !metadata.outputs.iter().any(|d| &d.name == output) {
                        problems.push(format!("Step '{}' has no output '{}'", step.name, output));
                    }
                }
            }
        }

        for column in step.outputs.values() {
            if let Some(previous) = writers.insert(column.as_str(), step.name.as_str()) {
                problems.push(format!(
                    "Column '{}' is written by both '{}' and '{}'",
                    column, previous, step.name
                ));
            }
        }
    }

    problems
}

/// Result-column order and formats of a step list
///
/// Columns follow step order and, within a step, the order its metadata
/// declares the outputs in. Bound outputs the metadata does not describe
/// come last for that step, unformatted.
pub fn column_layout(
    steps: &[StepConfig],
    resolver: &dyn StepMetadataResolver,
) -> (ColumnOrdering, FormatLookup) {
    let mut ordering = Vec::new();
    let mut formats = BTreeMap::new();

    for step in steps {
        let metadata = resolver.resolve(&step.name).unwrap_or_default();
        let mut bound: Vec<(&String, &String)> = step.outputs.iter().collect();

        for description in &metadata.outputs {
            if let Some(position) = bound.iter().position(|(output, _)| **output == description.name) {
                let (_, column) = bound.remove(position);
                if !ordering.contains(column) {
                    ordering.push(column.clone());
                }
                if let Some(format) = &description.format {
                    formats.insert(column.clone(), format.clone());
                }
            }
        }
        for (_, column) in bound {
            if !ordering.contains(column) {
                ordering.push(column.clone());
            }
        }
    }

    (ColumnOrdering(ordering), FormatLookup(formats))
}
