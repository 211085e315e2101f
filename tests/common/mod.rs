//! Shared fixtures for the cache integration tests
//!
//! In-memory source data, a scripted step pipeline that counts its calls and
//! a calculator wired to a SQLite store in a temporary directory.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tempfile::TempDir;

use isocalc::calculation::{Calculator, Collaborators};
use isocalc::domain::{
    columns, AcquisitionRecord, ChannelCalibration, CorrInterval, CycleRecord, ReplicateAnalysis,
    ReplicateRecord, ReplicateType, SampleAnalysis, SampleRecord, ScanRecord, StepConfig,
};
use isocalc::infrastructure::config::CalculationConfig;
use isocalc::pipeline::{
    flag_error, ColumnDescription, DependencyManager, PipelineOutcome, PipelineRequest,
    PipelineScope, StaticDependencies, StepError, StepMetadata, StepMetadataResolver,
    StepPipeline,
};
use isocalc::{AppError, Result, SqliteCacheStore, SourceRepository, Value};

pub const MASS_SPEC: i64 = 1;
pub const INTERVAL: i64 = 10;
pub const ANALYSIS: i64 = 100;
pub const SECOND_ANALYSIS: i64 = 101;
pub const SAMPLE: i64 = 50;
pub const SAMPLE_ANALYSIS: i64 = 500;

pub const STANDARD_A: i64 = 1;
pub const STANDARD_B: i64 = 2;
pub const UNKNOWN_A: i64 = 3;
pub const UNKNOWN_B: i64 = 4;
pub const SCAN: i64 = 20;

pub const MASS_BIAS_COLUMN: &str = "Mass Bias";
pub const RATIO_COLUMN: &str = "206/204 corrected";
pub const SAMPLE_MEAN_COLUMN: &str = "206/204 mean";

pub fn at(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds, 0).unwrap()
}

// ============================================================================
// Source data
// ============================================================================

#[derive(Default)]
struct SourceData {
    intervals: Vec<CorrInterval>,
    replicates: Vec<ReplicateRecord>,
    acquisitions: HashMap<i64, Vec<AcquisitionRecord>>,
    scans: Vec<ScanRecord>,
    replicate_analyses: HashMap<i64, ReplicateAnalysis>,
    samples: HashMap<i64, SampleRecord>,
    sample_analyses: HashMap<i64, SampleAnalysis>,
    choices: HashMap<(i64, i64, i64), i64>,
    unavailable: bool,
}

/// In-memory source repository
#[derive(Default)]
pub struct FakeSource {
    data: Mutex<SourceData>,
}

impl FakeSource {
    /// One open interval with two standards, one scan and a sample of two
    /// replicates; analysis `ANALYSIS` is declared on the interval and
    /// accepted by `SAMPLE_ANALYSIS`
    pub fn standard() -> Self {
        let source = Self::default();
        source.add_interval(CorrInterval {
            id: INTERVAL,
            mass_spec_id: MASS_SPEC,
            valid_from: at(1_000),
            valid_until: None,
            replicate_analysis_ids: vec![ANALYSIS],
        });
        source.add_replicate_analysis(replicate_analysis(ANALYSIS, "Pb default"));
        source.add_replicate(replicate(STANDARD_A, None, at(1_100), ReplicateType::Standard));
        source.add_replicate(replicate(STANDARD_B, None, at(1_200), ReplicateType::Standard));
        source.add_replicate(replicate(UNKNOWN_A, Some(SAMPLE), at(1_300), ReplicateType::Sample));
        source.add_replicate(replicate(UNKNOWN_B, Some(SAMPLE), at(1_400), ReplicateType::Sample));
        source.add_scan(ScanRecord {
            id: SCAN,
            mass_spec_id: MASS_SPEC,
            date: at(1_050),
            user_name: "lab".to_string(),
            channels: vec![ChannelCalibration {
                channel: "H1".to_string(),
                coefficients: vec![1.0, 0.002],
            }],
        });
        source.add_sample(SampleRecord {
            id: SAMPLE,
            name: "BCR-2".to_string(),
        });
        source.add_sample_analysis(sample_analysis(SAMPLE_ANALYSIS, vec![ANALYSIS]));
        source
    }

    pub fn add_interval(&self, interval: CorrInterval) {
        let mut data = self.data.lock();
        data.intervals.retain(|existing| existing.id != interval.id);
        data.intervals.push(interval);
    }

    pub fn add_replicate(&self, replicate: ReplicateRecord) {
        let mut data = self.data.lock();
        data.acquisitions.insert(replicate.id, acquisitions());
        data.replicates.retain(|existing| existing.id != replicate.id);
        data.replicates.push(replicate);
    }

    pub fn add_scan(&self, scan: ScanRecord) {
        self.data.lock().scans.push(scan);
    }

    pub fn add_replicate_analysis(&self, analysis: ReplicateAnalysis) {
        self.data
            .lock()
            .replicate_analyses
            .insert(analysis.id, analysis);
    }

    pub fn add_sample(&self, sample: SampleRecord) {
        self.data.lock().samples.insert(sample.id, sample);
    }

    pub fn add_sample_analysis(&self, analysis: SampleAnalysis) {
        self.data.lock().sample_analyses.insert(analysis.id, analysis);
    }

    pub fn set_choice(&self, sample_id: i64, sample_analysis_id: i64, replicate_id: i64, choice: i64) {
        self.data
            .lock()
            .choices
            .insert((sample_id, sample_analysis_id, replicate_id), choice);
    }

    pub fn disable_replicate(&self, replicate_id: i64) {
        let mut data = self.data.lock();
        for replicate in data.replicates.iter_mut().filter(|r| r.id == replicate_id) {
            replicate.disabled = true;
        }
    }

    /// Make every query fail as if the database were gone
    pub fn set_unavailable(&self, unavailable: bool) {
        self.data.lock().unavailable = unavailable;
    }

    fn check(&self) -> Result<()> {
        if self.data.lock().unavailable {
            return Err(AppError::database_error("source database unavailable"));
        }
        Ok(())
    }
}

fn in_window(date: DateTime<Utc>, from: DateTime<Utc>, until: Option<DateTime<Utc>>) -> bool {
    date >= from && until.map_or(true, |until| date < until)
}

#[async_trait]
impl SourceRepository for FakeSource {
    async fn corr_interval(&self, id: i64) -> Result<Option<CorrInterval>> {
        self.check()?;
        Ok(self.data.lock().intervals.iter().find(|i| i.id == id).cloned())
    }

    async fn corr_interval_for(
        &self,
        mass_spec_id: i64,
        date: DateTime<Utc>,
    ) -> Result<Option<CorrInterval>> {
        self.check()?;
        Ok(self
            .data
            .lock()
            .intervals
            .iter()
            .find(|i| i.mass_spec_id == mass_spec_id && i.contains(date))
            .cloned())
    }

    async fn standard_replicates_in_window(
        &self,
        mass_spec_id: i64,
        from: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<ReplicateRecord>> {
        self.check()?;
        Ok(self
            .data
            .lock()
            .replicates
            .iter()
            .filter(|r| {
                r.mass_spec_id == mass_spec_id
                    && r.replicate_type == ReplicateType::Standard
                    && in_window(r.date, from, until)
            })
            .cloned()
            .collect())
    }

    async fn scans_in_window(
        &self,
        mass_spec_id: i64,
        from: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<ScanRecord>> {
        self.check()?;
        Ok(self
            .data
            .lock()
            .scans
            .iter()
            .filter(|s| s.mass_spec_id == mass_spec_id && in_window(s.date, from, until))
            .cloned()
            .collect())
    }

    async fn replicate(&self, id: i64) -> Result<Option<ReplicateRecord>> {
        self.check()?;
        Ok(self.data.lock().replicates.iter().find(|r| r.id == id).cloned())
    }

    async fn acquisitions(&self, replicate_id: i64) -> Result<Vec<AcquisitionRecord>> {
        self.check()?;
        Ok(self
            .data
            .lock()
            .acquisitions
            .get(&replicate_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn replicate_analysis(&self, id: i64) -> Result<Option<ReplicateAnalysis>> {
        self.check()?;
        Ok(self.data.lock().replicate_analyses.get(&id).cloned())
    }

    async fn sample(&self, id: i64) -> Result<Option<SampleRecord>> {
        self.check()?;
        Ok(self.data.lock().samples.get(&id).cloned())
    }

    async fn sample_analysis(&self, id: i64) -> Result<Option<SampleAnalysis>> {
        self.check()?;
        Ok(self.data.lock().sample_analyses.get(&id).cloned())
    }

    async fn sample_replicates(&self, sample_id: i64) -> Result<Vec<ReplicateRecord>> {
        self.check()?;
        Ok(self
            .data
            .lock()
            .replicates
            .iter()
            .filter(|r| r.sample_id == Some(sample_id))
            .cloned()
            .collect())
    }

    async fn rep_analysis_choice(
        &self,
        sample_id: i64,
        sample_analysis_id: i64,
        replicate_id: i64,
    ) -> Result<Option<i64>> {
        self.check()?;
        Ok(self
            .data
            .lock()
            .choices
            .get(&(sample_id, sample_analysis_id, replicate_id))
            .copied())
    }
}

pub fn replicate(
    id: i64,
    sample_id: Option<i64>,
    date: DateTime<Utc>,
    replicate_type: ReplicateType,
) -> ReplicateRecord {
    ReplicateRecord {
        id,
        sample_id,
        mass_spec_id: MASS_SPEC,
        date,
        user_name: "kim".to_string(),
        analysis: "Pb".to_string(),
        replicate_type,
        disabled: false,
    }
}

fn acquisitions() -> Vec<AcquisitionRecord> {
    let cycle = |number: i32, ratio: f64| CycleRecord {
        number,
        values: BTreeMap::from([("206/204".to_string(), ratio)]),
    };
    vec![AcquisitionRecord {
        number: 1,
        values: BTreeMap::from([("Baseline".to_string(), 0.01)]),
        cycles: vec![cycle(1, 18.10), cycle(2, 18.12), cycle(3, 18.08)],
    }]
}

pub fn replicate_analysis(id: i64, name: &str) -> ReplicateAnalysis {
    ReplicateAnalysis {
        id,
        name: name.to_string(),
        corr_interval_steps: vec![StepConfig::new("Mass Bias").with_output("bias", MASS_BIAS_COLUMN)],
        replicate_steps: vec![StepConfig::new("Ratio").with_output("ratio", RATIO_COLUMN)],
    }
}

pub fn sample_analysis(id: i64, accepted: Vec<i64>) -> SampleAnalysis {
    SampleAnalysis {
        id,
        name: "Pb isotopes".to_string(),
        steps: vec![StepConfig::new("Sample Mean").with_output("mean", SAMPLE_MEAN_COLUMN)],
        accepted_replicate_analysis_ids: accepted,
    }
}

// ============================================================================
// Step pipeline
// ============================================================================

#[derive(Default)]
struct Script {
    failing: Vec<PipelineScope>,
    /// Correction-interval scope: replicate ids flagged with an error
    flagged_standards: Vec<i64>,
    /// Replicate scope: flag the grafted replicate
    flag_grafted: bool,
    /// Replicate scope: detach the grafted replicate while running
    drop_grafted: bool,
    /// Sample scope: flag the sample node
    flag_sample: bool,
}

/// Scripted pipeline writing one column per scope
#[derive(Default)]
pub struct FakePipeline {
    script: Mutex<Script>,
    calls: Mutex<Vec<PipelineScope>>,
    /// Root child count of the scratch pad seen by replicate-scope runs
    replicate_views: Mutex<Vec<usize>>,
}

impl FakePipeline {
    pub fn fail(&self, scope: PipelineScope) {
        self.script.lock().failing.push(scope);
    }

    pub fn flag_standard(&self, replicate_id: i64) {
        self.script.lock().flagged_standards.push(replicate_id);
    }

    pub fn flag_grafted(&self) {
        self.script.lock().flag_grafted = true;
    }

    pub fn drop_grafted(&self) {
        self.script.lock().drop_grafted = true;
    }

    pub fn flag_sample(&self) {
        self.script.lock().flag_sample = true;
    }

    pub fn reset_script(&self) {
        *self.script.lock() = Script::default();
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_for(&self, scope: PipelineScope) -> usize {
        self.calls.lock().iter().filter(|s| **s == scope).count()
    }

    pub fn replicate_views(&self) -> Vec<usize> {
        self.replicate_views.lock().clone()
    }

    fn dependencies(step: &str, key: &str, value: &str) -> Vec<DependencyManager> {
        vec![DependencyManager::new(step).with_plugin(StaticDependencies {
            name: "fixture".to_string(),
            entries: vec![(key.to_string(), value.to_string())],
        })]
    }
}

impl StepPipeline for FakePipeline {
    fn execute(&self, request: PipelineRequest<'_>) -> PipelineOutcome {
        self.calls.lock().push(request.scope);
        let script = self.script.lock();
        let step_name = request.steps.first().map(|s| s.name.clone());

        if script.failing.contains(&request.scope) {
            PipelineOutcome::failed(StepError::new(step_name, "step exploded"))
        } else {
            let scratch_pad = request.scratch_pad;
            match request.scope {
                PipelineScope::CorrectionInterval => {
                    for child in scratch_pad.root_mut().children_mut() {
                        let id = child.get_value(columns::REPLICATE_ID).and_then(Value::as_i64);
                        if id.is_some_and(|id| script.flagged_standards.contains(&id)) {
                            flag_error(child, step_name.as_deref(), "bias out of range").unwrap();
                        } else {
                            child.set_value(MASS_BIAS_COLUMN, 1.0012).unwrap();
                        }
                    }
                    PipelineOutcome {
                        finished: true,
                        errors: Vec::new(),
                        dependency_managers: Self::dependencies("Mass Bias", "Standard", "NBS 981"),
                    }
                }
                PipelineScope::Replicate => {
                    self.replicate_views.lock().push(scratch_pad.child_count());
                    if script.drop_grafted {
                        let _ = scratch_pad.take_grafted();
                    } else if let Some(grafted) = scratch_pad.grafted_mut() {
                        if script.flag_grafted {
                            flag_error(grafted, step_name.as_deref(), "ratio undefined").unwrap();
                        } else {
                            grafted.set_value(RATIO_COLUMN, 18.0961).unwrap();
                        }
                    }
                    PipelineOutcome {
                        finished: true,
                        errors: Vec::new(),
                        dependency_managers: Self::dependencies(
                            "Ratio",
                            "Correction Interval",
                            &INTERVAL.to_string(),
                        ),
                    }
                }
                PipelineScope::Sample => {
                    if let Some(sample) = scratch_pad.root_mut().children_mut().first_mut() {
                        if script.flag_sample {
                            flag_error(sample, step_name.as_deref(), "no replicates").unwrap();
                        } else {
                            sample.set_value(SAMPLE_MEAN_COLUMN, 18.0955).unwrap();
                        }
                    }
                    PipelineOutcome {
                        finished: true,
                        errors: Vec::new(),
                        dependency_managers: Self::dependencies("Sample Mean", "Outliers", "none"),
                    }
                }
            }
        }
    }
}

// ============================================================================
// Step metadata
// ============================================================================

pub struct FakeResolver;

impl StepMetadataResolver for FakeResolver {
    fn resolve(&self, step_name: &str) -> Option<StepMetadata> {
        let output = |name: &str| ColumnDescription::new(name).with_format("0.00000");
        let outputs = match step_name {
            "Mass Bias" => vec![output("bias")],
            "Ratio" => vec![output("ratio")],
            "Sample Mean" => vec![output("mean")],
            _ => return None,
        };
        Some(StepMetadata {
            name: step_name.to_string(),
            outputs,
            ..StepMetadata::default()
        })
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub calculator: Calculator,
    pub store: Arc<SqliteCacheStore>,
    pub source: Arc<FakeSource>,
    pub pipeline: Arc<FakePipeline>,
    _dir: TempDir,
}

pub async fn harness(source: FakeSource) -> Harness {
    harness_with(source, CalculationConfig::default()).await
}

pub async fn harness_with(source: FakeSource, config: CalculationConfig) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteCacheStore::new(dir.path()).await.unwrap());
    let source = Arc::new(source);
    let pipeline = Arc::new(FakePipeline::default());

    let collaborators = Collaborators {
        source: source.clone(),
        store: store.clone(),
        pipeline: pipeline.clone(),
        metadata: Arc::new(FakeResolver),
    };

    Harness {
        calculator: Calculator::new(collaborators, &config),
        store,
        source,
        pipeline,
        _dir: dir,
    }
}
