//! Replicate cache
//!
//! Key: exact (replicate_id, replicate_analysis_id). A replicate is always
//! calculated inside the scratch pad of its correction interval: its pad is
//! grafted onto that tree for the duration of the pipeline run and detached
//! again on every exit path.
//!
//! Duplicate or undecodable rows under a key are deleted and recomputed.
//! Sample caches joined to a deleted row are deleted with it, so no sample
//! result outlives the replicate rows it was built from.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::corr_interval::LoadOrCalculateCorrInterval;
use super::{first_node_error, first_reported_error, Collaborators};
use crate::domain::{CorrInterval, ReplicateAnalysis, ReplicateRecord};
use crate::error::{AppError, Result};
use crate::infrastructure::config::CalculationConfig;
use crate::pad::{Pad, ScratchPad};
use crate::pipeline::{
    column_layout, validate_steps, CalculationContext, Dependencies, PipelineRequest,
    PipelineScope,
};
use crate::storage::CalcReplicateCache;
use crate::utils::KeyedLocks;

enum Lookup {
    Found(CalcReplicateCache),
    Missing,
    Corrupt(Vec<i64>),
}

pub struct LoadOrCalculateReplicate {
    collaborators: Collaborators,
    config: CalculationConfig,
    corr_intervals: Arc<LoadOrCalculateCorrInterval>,
    locks: KeyedLocks<(i64, i64)>,
}

impl LoadOrCalculateReplicate {
    pub fn new(
        collaborators: Collaborators,
        config: CalculationConfig,
        corr_intervals: Arc<LoadOrCalculateCorrInterval>,
    ) -> Self {
        let locks = KeyedLocks::new(config.per_key_locking);
        Self {
            collaborators,
            config,
            corr_intervals,
            locks,
        }
    }

    pub async fn load_or_calculate(
        &self,
        replicate_id: i64,
        replicate_analysis_id: i64,
    ) -> CalcReplicateCache {
        let key = (replicate_id, replicate_analysis_id);

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
                    replicate_id,
                    replicate_analysis_id,
                    rows = ids.len(),
                    "Corrupt replicate cache, recomputing"
                );
                if let Err(e) = self.discard(&ids).await {
                    return self.record_failure(key, e).await;
                }
                self.recompute(key).await
            }
            Err(e) => self.record_failure(key, e).await,
        }
    }

    async fn lookup(&self, (replicate_id, ra): (i64, i64)) -> Result<Lookup> {
        let mut found = self
            .collaborators
            .store
            .find_replicate_caches(replicate_id, ra)
            .await?;

        if found.is_clean() && found.rows.len() == 1 && found.rows[0].check_invariant().is_ok() {
            debug!(replicate_id, replicate_analysis_id = ra, "Replicate cache hit");
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

    /// Delete replicate cache rows along with the sample caches built on them
    async fn discard(&self, ids: &[i64]) -> Result<()> {
        let store = &self.collaborators.store;
        for &id in ids {
            for sample_cache_id in store.sample_cache_ids_for_replicate_cache(id).await? {
                debug!(
                    replicate_cache_id = id,
                    sample_cache_id,
                    "Deleting sample cache of a corrupt replicate cache"
                );
                store.delete_sample_cache(sample_cache_id).await?;
            }
            store.delete_replicate_cache(id).await?;
        }
        Ok(())
    }

    async fn recompute(&self, key: (i64, i64)) -> CalcReplicateCache {
        info!(
            replicate_id = key.0,
            replicate_analysis_id = key.1,
            "Replicate cache miss, calculating"
        );
        match self.calculate(key).await {
            Ok(row) => self.persist(row).await,
            Err(e) => self.record_failure(key, e).await,
        }
    }

    async fn calculate(&self, (replicate_id, ra): (i64, i64)) -> Result<CalcReplicateCache> {
        let source = &self.collaborators.source;

        let Some(replicate) = source.replicate(replicate_id).await? else {
            return Ok(CalcReplicateCache::failure(
                replicate_id,
                ra,
                None,
                None,
                format!("Replicate {} does not exist", replicate_id),
            ));
        };
        let Some(interval) = source
            .corr_interval_for(replicate.mass_spec_id, replicate.date)
            .await?
        else {
            return Ok(CalcReplicateCache::failure(
                replicate_id,
                ra,
                None,
                None,
                format!(
                    "No correction interval covers replicate {} measured {}",
                    replicate_id,
                    replicate.date.to_rfc3339()
                ),
            ));
        };
        let Some(analysis) = source.replicate_analysis(ra).await? else {
            return Ok(CalcReplicateCache::failure(
                replicate_id,
                ra,
                Some(interval.id),
                None,
                format!("Replicate analysis {} does not exist", ra),
            ));
        };

        let problems = validate_steps(&analysis.replicate_steps, self.collaborators.metadata.as_ref());
        if !problems.is_empty() {
            return Ok(CalcReplicateCache::failure(
                replicate_id,
                ra,
                Some(interval.id),
                None,
                problems.join("; "),
            ));
        }

        let interval_outcome = self.corr_intervals.load_or_calculate(interval.id, ra).await;
        let Some(interval_row) = interval_outcome.scratch_pad else {
            let reason = interval_outcome
                .errors
                .first()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "no scratch pad".to_string());
            return Ok(CalcReplicateCache::failure(
                replicate_id,
                ra,
                Some(interval.id),
                None,
                format!("Correction interval {} failed: {}", interval.id, reason),
            ));
        };

        let acquisitions = source.acquisitions(replicate_id).await?;
        let replicate_pad = replicate.to_pad(&acquisitions)?;

        let mut interval_pad = interval_row.scratch_pad;
        self.calculate_with_interval(&mut interval_pad, &interval, &analysis, &replicate, replicate_pad)
    }

    /// Run the replicate pipeline with `replicate_pad` grafted onto a
    /// caller-owned correction-interval scratch pad
    ///
    /// `interval_pad` has the same children afterwards as before, whatever
    /// the outcome. The returned row is not persisted.
    pub fn calculate_with_interval(
        &self,
        interval_pad: &mut ScratchPad,
        interval: &CorrInterval,
        analysis: &ReplicateAnalysis,
        replicate: &ReplicateRecord,
        replicate_pad: Pad,
    ) -> Result<CalcReplicateCache> {
        let mut interval_pad = scopeguard::guard(interval_pad, |pad| {
            if pad.remove_grafted() {
                debug!("Removed temporary replicate from correction interval scratch pad");
            }
        });
        interval_pad.graft_temporary(replicate_pad)?;

        let mut context = CalculationContext {
            corr_interval: Some(interval.clone()),
            replicate_analysis: Some(analysis.clone()),
            ..CalculationContext::default()
        };
        context.replicates.insert(replicate.id, replicate.clone());

        let outcome = self.collaborators.pipeline.execute(PipelineRequest {
            scope: PipelineScope::Replicate,
            steps: &analysis.replicate_steps,
            scratch_pad: &mut **interval_pad,
            context: &context,
        });

        if !outcome.finished {
            let failure = first_reported_error(&outcome, "Replicate calculation did not finish");
            return Ok(CalcReplicateCache::failure(
                replicate.id,
                analysis.id,
                Some(interval.id),
                failure.step_name,
                failure.message,
            ));
        }

        let Some(mut result) = interval_pad.take_grafted() else {
            return Ok(CalcReplicateCache::failure(
                replicate.id,
                analysis.id,
                Some(interval.id),
                None,
                "Replicate calculation produced no result",
            ));
        };
        if let Some(failure) = first_node_error(&result) {
            return Ok(CalcReplicateCache::failure(
                replicate.id,
                analysis.id,
                Some(interval.id),
                failure.step_name,
                failure.message,
            ));
        }

        result.truncate_below(self.config.replicate_resolution);
        let mut private = ScratchPad::new();
        private.add_child(result)?;

        let (column_ordering, format_lookup) =
            column_layout(&analysis.replicate_steps, self.collaborators.metadata.as_ref());
        private.set_natural_column_order(column_ordering.0.clone());

        Ok(CalcReplicateCache::success(
            replicate.id,
            analysis.id,
            interval.id,
            private,
            Dependencies::from_managers(&outcome.dependency_managers),
            column_ordering,
            format_lookup,
        ))
    }

    async fn persist(&self, mut row: CalcReplicateCache) -> CalcReplicateCache {
        match self.collaborators.store.insert_replicate_cache(&row).await {
            Ok(id) => {
                row.id = id;
                if row.is_success() {
                    info!(
                        id,
                        replicate_id = row.replicate_id,
                        replicate_analysis_id = row.replicate_analysis_id,
                        "Stored replicate cache"
                    );
                } else {
                    warn!(
                        id,
                        replicate_id = row.replicate_id,
                        replicate_analysis_id = row.replicate_analysis_id,
                        step = row.error_rep_step.as_deref().unwrap_or("-"),
                        message = row.error_message.as_deref().unwrap_or("-"),
                        "Stored replicate calculation failure"
                    );
                }
            }
            Err(e) => error!(
                replicate_id = row.replicate_id,
                replicate_analysis_id = row.replicate_analysis_id,
                error = %e,
                "Failed to store replicate cache"
            ),
        }
        row
    }

    async fn record_failure(
        &self,
        (replicate_id, ra): (i64, i64),
        e: AppError,
    ) -> CalcReplicateCache {
        error!(
            replicate_id,
            replicate_analysis_id = ra,
            error = %e,
            "Replicate calculation failed"
        );
        self.persist(CalcReplicateCache::failure(
            replicate_id,
            ra,
            None,
            None,
            format!("Replicate calculation failed: {}", e),
        ))
        .await
    }
}
