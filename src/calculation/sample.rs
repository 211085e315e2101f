//! Sample cache
//!
//! Key: (sample_id, sample_analysis_id). The sample pad collects one
//! replicate child per enabled replicate of the sample, each either the
//! cached replicate result or an error leaf explaining why there is none.
//!
//! Replicate analysis resolution, per replicate: the candidates are the
//! analyses declared on the replicate's correction interval that the sample
//! analysis accepts.
//!
//! - no candidate: error leaf (unresolved analysis)
//! - one candidate: use it
//! - several: use the stored user choice if it is a candidate, otherwise
//!   error leaf (ambiguous analysis)

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::replicate::LoadOrCalculateReplicate;
use super::{first_reported_error, Collaborators};
use crate::domain::{columns, ReplicateRecord, SampleAnalysis};
use crate::error::{AppError, Result};
use crate::infrastructure::config::CalculationConfig;
use crate::pad::{Pad, PadKind, ScratchPad, Value};
use crate::pipeline::{
    flag_error, node_error, validate_steps, CalculationContext, Dependencies, PipelineRequest,
    PipelineScope,
};
use crate::storage::{CalcSampleCache, ReplicateResolution};
use crate::utils::KeyedLocks;

pub const UNRESOLVED_ANALYSIS: &str = "Unresolved analysis";
pub const AMBIGUOUS_ANALYSIS: &str = "Ambiguous analysis";

enum Lookup {
    Found(CalcSampleCache),
    Missing,
    Corrupt(Vec<i64>),
}

/// Computed row plus the replicate caches it was built from
struct Computed {
    row: CalcSampleCache,
    replicate_cache_ids: Vec<i64>,
}

impl From<CalcSampleCache> for Computed {
    fn from(row: CalcSampleCache) -> Self {
        Self {
            row,
            replicate_cache_ids: Vec::new(),
        }
    }
}

/// How one replicate ended up in the sample pad
struct ReplicateChild {
    pad: Pad,
    resolution: ReplicateResolution,
    replicate_cache_id: Option<i64>,
    dependencies: Option<Dependencies>,
}

pub struct LoadOrCalculateSample {
    collaborators: Collaborators,
    config: CalculationConfig,
    replicates: Arc<LoadOrCalculateReplicate>,
    locks: KeyedLocks<(i64, i64)>,
}

impl LoadOrCalculateSample {
    pub fn new(
        collaborators: Collaborators,
        config: CalculationConfig,
        replicates: Arc<LoadOrCalculateReplicate>,
    ) -> Self {
        let locks = KeyedLocks::new(config.per_key_locking);
        Self {
            collaborators,
            config,
            replicates,
            locks,
        }
    }

    pub async fn load_or_calculate(&self, sample_id: i64, sample_analysis_id: i64) -> CalcSampleCache {
        let key = (sample_id, sample_analysis_id);

        match self.lookup(key).await {
            Ok(Lookup::Found(row)) => return row,
            Ok(_) => {}
            Err(e) => return self.record_failure(key, e).await,
        }

        let _guard = self.locks.lock(key).await;

        match self.lookup(key).await {
            Ok(Lookup::Found(row)) => row,
            Ok(Lookup::Missing) => self.recompute(key).await,
            Ok(Lookup::Corrupt(ids)) => {
                warn!(
                    sample_id,
                    sample_analysis_id,
                    rows = ids.len(),
                    "Corrupt sample cache, recomputing"
                );
                for id in ids {
                    if let Err(e) = self.collaborators.store.delete_sample_cache(id).await {
                        return self.record_failure(key, e).await;
                    }
                }
                self.recompute(key).await
            }
            Err(e) => self.record_failure(key, e).await,
        }
    }

    /// Delete a sample cache row, its join rows and the replicate caches
    /// only it referenced
    pub async fn delete_by_id(&self, id: i64) -> Result<Vec<i64>> {
        self.collaborators.store.delete_sample_cache(id).await
    }

    pub async fn sample_cache_ids_for_sample(&self, sample_id: i64) -> Result<Vec<i64>> {
        self.collaborators.store.sample_cache_ids_for_sample(sample_id).await
    }

    pub async fn sample_cache_ids_for_replicate(&self, replicate_id: i64) -> Result<Vec<i64>> {
        self.collaborators
            .store
            .sample_cache_ids_for_replicate(replicate_id)
            .await
    }

    pub async fn sample_cache_ids_for_corr_interval(
        &self,
        corr_interval_id: i64,
        replicate_analysis_id: i64,
    ) -> Result<Vec<i64>> {
        self.collaborators
            .store
            .sample_cache_ids_for_corr_interval(corr_interval_id, replicate_analysis_id)
            .await
    }

    async fn lookup(&self, (sample_id, sa): (i64, i64)) -> Result<Lookup> {
        let mut found = self
            .collaborators
            .store
            .find_sample_caches(sample_id, sa)
            .await?;

        if found.is_clean() && found.rows.len() == 1 && found.rows[0].check_invariant().is_ok() {
            debug!(sample_id, sample_analysis_id = sa, "Sample cache hit");
            return Ok(found.rows.pop().map_or(Lookup::Missing, Lookup::Found));
        }
        if found.is_empty() {
            return Ok(Lookup::Missing);
        }

        let mut ids: Vec<i64> = found.rows.iter().map(|row| row.id).collect();
        ids.append(&mut found.corrupt);
        ids.sort_unstable();
        Ok(Lookup::Corrupt(ids))
    }

    async fn recompute(&self, key: (i64, i64)) -> CalcSampleCache {
        info!(
            sample_id = key.0,
            sample_analysis_id = key.1,
            "Sample cache miss, calculating"
        );
        match self.calculate(key).await {
            Ok(computed) => self.persist(computed).await,
            Err(e) => self.record_failure(key, e).await,
        }
    }

    async fn calculate(&self, (sample_id, sa): (i64, i64)) -> Result<Computed> {
        let source = &self.collaborators.source;

        let Some(sample) = source.sample(sample_id).await? else {
            return Ok(CalcSampleCache::failure(
                sample_id,
                sa,
                None,
                format!("Sample {} does not exist", sample_id),
            )
            .into());
        };
        let Some(analysis) = source.sample_analysis(sa).await? else {
            return Ok(CalcSampleCache::failure(
                sample_id,
                sa,
                None,
                format!("Sample analysis {} does not exist", sa),
            )
            .into());
        };
        let problems = validate_steps(&analysis.steps, self.collaborators.metadata.as_ref());
        if !problems.is_empty() {
            return Ok(CalcSampleCache::failure(sample_id, sa, None, problems.join("; ")).into());
        }

        let mut sample_pad = Pad::new(PadKind::Sample {
            name: sample.name.clone(),
        });
        sample_pad.set_value(columns::SAMPLE_ID, sample_id)?;

        let mut context = CalculationContext {
            sample_analysis: Some(analysis.clone()),
            ..CalculationContext::default()
        };
        let mut resolutions: HashMap<i64, ReplicateResolution> = HashMap::new();
        let mut replicate_cache_ids = Vec::new();
        let mut dependencies = Dependencies::default();

        let replicates = source.sample_replicates(sample_id).await?;
        for replicate in replicates.into_iter().filter(|r| !r.disabled) {
            let child = self.replicate_child(sample_id, &analysis, &replicate).await?;

            if let Some(id) = child.replicate_cache_id {
                replicate_cache_ids.push(id);
            }
            if let Some(replicate_dependencies) = &child.dependencies {
                dependencies.merge(replicate_dependencies);
            }
            resolutions.insert(replicate.id, child.resolution);
            sample_pad.add_child(child.pad)?;
            context.replicates.insert(replicate.id, replicate);
        }

        let mut scratch_pad = ScratchPad::new();
        scratch_pad.add_child(sample_pad)?;

        let outcome = self.collaborators.pipeline.execute(PipelineRequest {
            scope: PipelineScope::Sample,
            steps: &analysis.steps,
            scratch_pad: &mut scratch_pad,
            context: &context,
        });

        let failure = if !outcome.finished {
            Some(first_reported_error(&outcome, "Sample calculation did not finish"))
        } else {
            // Only the sample node itself; replicate error leaves are expected
            scratch_pad.children().first().and_then(node_error)
        };
        if let Some(failure) = failure {
            return Ok(Computed {
                row: CalcSampleCache::failure(sample_id, sa, failure.step_name, failure.message),
                replicate_cache_ids,
            });
        }

        dependencies.merge_managers(&outcome.dependency_managers);

        // Arrays follow the final, sorted replicate children
        let aligned = scratch_pad
            .children()
            .first()
            .map(|pad| {
                pad.children()
                    .iter()
                    .filter_map(|child| {
                        let id = child.get_value(columns::REPLICATE_ID).and_then(Value::as_i64)?;
                        resolutions.remove(&id)
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        scratch_pad.truncate_below(self.config.sample_resolution);

        Ok(Computed {
            row: CalcSampleCache::success(sample_id, sa, scratch_pad, dependencies, aligned),
            replicate_cache_ids,
        })
    }

    /// Resolve, compute and wrap one replicate of the sample
    async fn replicate_child(
        &self,
        sample_id: i64,
        analysis: &SampleAnalysis,
        replicate: &ReplicateRecord,
    ) -> Result<ReplicateChild> {
        let source = &self.collaborators.source;
        let interval = source
            .corr_interval_for(replicate.mass_spec_id, replicate.date)
            .await?;

        let candidates: Vec<i64> = interval
            .as_ref()
            .map(|interval| {
                interval
                    .replicate_analysis_ids
                    .iter()
                    .copied()
                    .filter(|id| analysis.accepted_replicate_analysis_ids.contains(id))
                    .collect()
            })
            .unwrap_or_default();

        let mut resolution = ReplicateResolution {
            replicate_id: replicate.id,
            corr_interval_id: interval.as_ref().map(|interval| interval.id),
            rep_analysis_id: None,
            candidates: candidates.clone(),
        };

        let chosen = match candidates.as_slice() {
            [] => {
                let message = match &interval {
                    None => format!(
                        "{}: no correction interval covers replicate {}",
                        UNRESOLVED_ANALYSIS, replicate.id
                    ),
                    Some(interval) => format!(
                        "{}: no replicate analysis of correction interval {} is accepted by '{}'",
                        UNRESOLVED_ANALYSIS, interval.id, analysis.name
                    ),
                };
                return error_child(replicate, resolution, None, &message);
            }
            [only] => *only,
            _ => {
                let choice = source
                    .rep_analysis_choice(sample_id, analysis.id, replicate.id)
                    .await?;
                match choice.filter(|choice| candidates.contains(choice)) {
                    Some(choice) => choice,
                    None => {
                        let message = format!(
                            "{}: {} replicate analyses apply to replicate {} and none was chosen",
                            AMBIGUOUS_ANALYSIS,
                            candidates.len(),
                            replicate.id
                        );
                        return error_child(replicate, resolution, None, &message);
                    }
                }
            }
        };
        resolution.rep_analysis_id = Some(chosen);

        let cached = self.replicates.load_or_calculate(replicate.id, chosen).await;
        let replicate_cache_id = (cached.id > 0).then_some(cached.id);

        let computed_pad = cached
            .scratch_pad
            .as_ref()
            .and_then(|scratch_pad| scratch_pad.children().first().cloned());
        match computed_pad {
            Some(pad) => Ok(ReplicateChild {
                pad,
                resolution,
                replicate_cache_id,
                dependencies: Some(cached.dependencies),
            }),
            None => {
                let message = cached
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "Replicate calculation produced no result".to_string());
                let mut child =
                    error_child(replicate, resolution, cached.error_rep_step.as_deref(), &message)?;
                child.replicate_cache_id = replicate_cache_id;
                Ok(child)
            }
        }
    }

    async fn persist(&self, computed: Computed) -> CalcSampleCache {
        let Computed {
            mut row,
            replicate_cache_ids,
        } = computed;

        match self
            .collaborators
            .store
            .insert_sample_cache(&row, &replicate_cache_ids)
            .await
        {
            Ok(id) => {
                row.id = id;
                if row.is_success() {
                    info!(
                        id,
                        sample_id = row.sample_id,
                        sample_analysis_id = row.sample_analysis_id,
                        replicates = row.replicate_ids.len(),
                        "Stored sample cache"
                    );
                } else {
                    warn!(
                        id,
                        sample_id = row.sample_id,
                        sample_analysis_id = row.sample_analysis_id,
                        step = row.error_sam_step.as_deref().unwrap_or("-"),
                        message = row.error_message.as_deref().unwrap_or("-"),
                        "Stored sample calculation failure"
                    );
                }
            }
            Err(e) => error!(
                sample_id = row.sample_id,
                sample_analysis_id = row.sample_analysis_id,
                error = %e,
                "Failed to store sample cache"
            ),
        }
        row
    }

    async fn record_failure(&self, (sample_id, sa): (i64, i64), e: AppError) -> CalcSampleCache {
        error!(
            sample_id,
            sample_analysis_id = sa,
            error = %e,
            "Sample calculation failed"
        );
        self.persist(
            CalcSampleCache::failure(
                sample_id,
                sa,
                None,
                format!("Sample calculation failed: {}", e),
            )
            .into(),
        )
        .await
    }
}

/// Replicate leaf carrying a calculation error instead of results
fn error_child(
    replicate: &ReplicateRecord,
    resolution: ReplicateResolution,
    step_name: Option<&str>,
    message: &str,
) -> Result<ReplicateChild> {
    let mut pad = Pad::new(PadKind::Replicate {
        date: replicate.date,
    });
    pad.set_value(columns::REPLICATE_ID, replicate.id)?;
    pad.set_value(columns::ANALYSIS_COLUMN, replicate.analysis.as_str())?;
    pad.set_value(columns::USER, replicate.user_name.as_str())?;
    flag_error(&mut pad, step_name, message)?;

    debug!(replicate_id = replicate.id, message, "Replicate added as error leaf");
    Ok(ReplicateChild {
        pad,
        resolution,
        replicate_cache_id: None,
        dependencies: None,
    })
}
