//! Contracts of the external calculation step pipeline
//!
//! The pipeline runs an ordered list of configured steps over a region of a
//! scratch pad. It reports whether it finished, the errors it met and, per
//! step, a dependency manager describing which inputs fed the result.

pub mod metadata;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::domain::columns;
use crate::domain::{
    CorrInterval, ReplicateAnalysis, ReplicateRecord, SampleAnalysis, ScanRecord, StepConfig,
};
use crate::error::Result;
use crate::pad::{Pad, ScratchPad, Status, Value};

pub use metadata::{
    column_layout, validate_steps, ColumnDescription, ColumnOrdering, FormatLookup, StepMetadata,
    StepMetadataResolver,
};

/// Which pipeline runs and over which part of the scratch pad
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineScope {
    /// Every replicate child of a correction-interval scratch pad
    CorrectionInterval,
    /// The grafted replicate child of a correction-interval scratch pad
    Replicate,
    /// The sample child of a sample scratch pad
    Sample,
}

/// A failure reported by a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub step_name: Option<String>,
    pub message: String,
}

impl StepError {
    pub fn new(step_name: Option<String>, message: impl Into<String>) -> Self {
        Self {
            step_name,
            message: message.into(),
        }
    }
}

/// Renders the internal state of one step input as key → string pairs
pub trait DependencyPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn render(&self) -> Vec<(String, String)>;
}

/// Plugin over a fixed list of pairs
#[derive(Debug, Clone, Default)]
pub struct StaticDependencies {
    pub name: String,
    pub entries: Vec<(String, String)>,
}

impl DependencyPlugin for StaticDependencies {
    fn name(&self) -> &str {
        &self.name
    }

    fn render(&self) -> Vec<(String, String)> {
        self.entries.clone()
    }
}

/// Audit record of the upstream values feeding one step
#[derive(Default)]
pub struct DependencyManager {
    pub step_name: String,
    pub plugins: Vec<Box<dyn DependencyPlugin>>,
}

impl DependencyManager {
    pub fn new(step_name: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            plugins: Vec::new(),
        }
    }

    pub fn with_plugin(mut self, plugin: impl DependencyPlugin + 'static) -> Self {
        self.plugins.push(Box::new(plugin));
        self
    }

    /// Rendered pairs of every plugin; later plugins win on equal keys
    pub fn entries(&self) -> BTreeMap<String, String> {
        self.plugins
            .iter()
            .flat_map(|plugin| plugin.render())
            .collect()
    }
}

impl std::fmt::Debug for DependencyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyManager")
            .field("step_name", &self.step_name)
            .field(
                "plugins",
                &self.plugins.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Step name → key → rendered value, persisted with a cache row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependencies(pub BTreeMap<String, BTreeMap<String, String>>);

impl Dependencies {
    pub fn from_managers(managers: &[DependencyManager]) -> Self {
        let mut dependencies = Self::default();
        dependencies.merge_managers(managers);
        dependencies
    }

    /// Fold the managers in; entries of the same step are combined
    pub fn merge_managers(&mut self, managers: &[DependencyManager]) {
        for manager in managers {
            let entries = manager.entries();
            if entries.is_empty() {
                continue;
            }
            self.0
                .entry(manager.step_name.clone())
                .or_default()
                .extend(entries);
        }
    }

    /// Fold another map in; its entries win on equal keys
    pub fn merge(&mut self, other: &Dependencies) {
        for (step, entries) in &other.0 {
            self.0
                .entry(step.clone())
                .or_default()
                .extend(entries.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, step: &str, key: &str) -> Option<&str> {
        self.0.get(step)?.get(key).map(String::as_str)
    }
}

/// What the pipeline reports back
#[derive(Debug, Default)]
pub struct PipelineOutcome {
    pub finished: bool,
    pub errors: Vec<StepError>,
    pub dependency_managers: Vec<DependencyManager>,
}

impl PipelineOutcome {
    pub fn finished() -> Self {
        Self {
            finished: true,
            ..Self::default()
        }
    }

    pub fn failed(error: StepError) -> Self {
        Self {
            finished: false,
            errors: vec![error],
            dependency_managers: Vec::new(),
        }
    }
}

/// Source rows backing the pads of one in-flight computation
///
/// Steps look up the record behind a pad here instead of through node state.
#[derive(Debug, Clone, Default)]
pub struct CalculationContext {
    pub corr_interval: Option<CorrInterval>,
    pub replicate_analysis: Option<ReplicateAnalysis>,
    pub sample_analysis: Option<SampleAnalysis>,
    pub replicates: HashMap<i64, ReplicateRecord>,
    pub scans: HashMap<i64, ScanRecord>,
}

impl CalculationContext {
    pub fn replicate_for(&self, pad: &Pad) -> Option<&ReplicateRecord> {
        let id = pad.get_value(columns::REPLICATE_ID).and_then(Value::as_i64)?;
        self.replicates.get(&id)
    }

    pub fn scan_for(&self, pad: &Pad) -> Option<&ScanRecord> {
        let id = pad.get_value(columns::SCAN_ID).and_then(Value::as_i64)?;
        self.scans.get(&id)
    }
}

/// One pipeline invocation
pub struct PipelineRequest<'a> {
    pub scope: PipelineScope,
    pub steps: &'a [StepConfig],
    pub scratch_pad: &'a mut ScratchPad,
    pub context: &'a CalculationContext,
}

/// Ordered step pipeline, executed synchronously on the caller's thread
pub trait StepPipeline: Send + Sync {
    fn execute(&self, request: PipelineRequest<'_>) -> PipelineOutcome;
}

/// Calculation error a step attached to `pad`, if any
pub fn node_error(pad: &Pad) -> Option<StepError> {
    let message = pad
        .get_value(columns::CALCULATION_ERROR)
        .and_then(Value::as_str)?;
    let step_name = pad
        .get_value(columns::ERROR_STEP)
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(StepError::new(step_name, message))
}

/// Attach a calculation error to `pad` and mark it ERROR
pub fn flag_error(pad: &mut Pad, step_name: Option<&str>, message: &str) -> Result<()> {
    pad.set_value(columns::CALCULATION_ERROR, message)?;
    if let Some(step_name) = step_name {
        pad.set_value(columns::ERROR_STEP, step_name)?;
    }
    if !pad.has_value(columns::STATUS) {
        pad.set_value(columns::STATUS, Status::Error)?;
    }
    Ok(())
}
