//! Correction-interval cache
//!
//! Key: (corr_interval_id, replicate_analysis_id). A successful calculation
//! stores one scratch pad of every usable standard replicate and scan in the
//! interval's window; failures are kept in the append-only error log.
//!
//! | pads | errors | result                                      |
//! |------|--------|---------------------------------------------|
//! | 1    | any    | hit: the pad plus its logged errors          |
//! | 0    | > 0    | recorded failure, not retried                |
//! | 0    | 0      | cold: compute                                |
//! | > 1  | any    | corrupt: delete pads and errors, recompute   |
//!
//! A pad row that no longer decodes also counts as corrupt.

use tracing::{debug, error, info, warn};

use super::Collaborators;
use crate::domain::{columns, CorrInterval, ReplicateAnalysis, ReplicateType};
use crate::error::{AppError, Result};
use crate::infrastructure::config::CalculationConfig;
use crate::pad::{Pad, PadKind, ScratchPad, Value};
use crate::pipeline::{
    column_layout, node_error, validate_steps, CalculationContext, PipelineRequest, PipelineScope,
    StepError,
};
use crate::storage::{CorrIntervalError, CorrIntervalScratchPad};
use crate::utils::KeyedLocks;

/// Result of a correction-interval lookup
#[derive(Debug, Clone, Default)]
pub struct CorrIntervalOutcome {
    pub scratch_pad: Option<CorrIntervalScratchPad>,
    pub errors: Vec<CorrIntervalError>,
}

impl CorrIntervalOutcome {
    pub fn is_success(&self) -> bool {
        self.scratch_pad.is_some()
    }

    /// Message of the first logged error
    pub fn first_error_message(&self) -> Option<&str> {
        self.errors.first().map(|e| e.message.as_str())
    }
}

enum Lookup {
    Found(CorrIntervalOutcome),
    Cold,
    /// More than one pad, or pads that do not decode
    Corrupt { readable: usize, undecodable: usize },
}

pub struct LoadOrCalculateCorrInterval {
    collaborators: Collaborators,
    config: CalculationConfig,
    locks: KeyedLocks<(i64, i64)>,
}

impl LoadOrCalculateCorrInterval {
    pub fn new(collaborators: Collaborators, config: CalculationConfig) -> Self {
        let locks = KeyedLocks::new(config.per_key_locking);
        Self {
            collaborators,
            config,
            locks,
        }
    }

    pub async fn load_or_calculate(
        &self,
        corr_interval_id: i64,
        replicate_analysis_id: i64,
    ) -> CorrIntervalOutcome {
        let key = (corr_interval_id, replicate_analysis_id);

        match self.lookup(key).await {
            Ok(Lookup::Found(outcome)) => return outcome,
            Ok(_) => {}
            Err(e) => return self.record_failure(key, e).await,
        }

        let _guard = self.locks.lock(key).await;

        match self.lookup(key).await {
            Ok(Lookup::Found(outcome)) => outcome,
            Ok(Lookup::Cold) => self.recompute(key).await,
            Ok(Lookup::Corrupt {
                readable,
                undecodable,
            }) => {
                warn!(
                    corr_interval_id,
                    replicate_analysis_id,
                    readable,
                    undecodable,
                    "Corrupt correction interval scratch pads, recomputing"
                );
                if let Err(e) = self.clear(key).await {
                    return self.record_failure(key, e).await;
                }
                self.recompute(key).await
            }
            Err(e) => self.record_failure(key, e).await,
        }
    }

    async fn lookup(&self, (ci, ra): (i64, i64)) -> Result<Lookup> {
        let store = &self.collaborators.store;
        let found = store.find_corr_interval_scratch_pads(ci, ra).await?;
        let errors = store.find_corr_interval_errors(ci, ra).await?;

        if !found.is_clean() {
            return Ok(Lookup::Corrupt {
                readable: found.rows.len(),
                undecodable: found.corrupt.len(),
            });
        }

        let mut pads = found.rows;
        match pads.len() {
            1 => {
                debug!(corr_interval_id = ci, replicate_analysis_id = ra, "Correction interval cache hit");
                Ok(Lookup::Found(CorrIntervalOutcome {
                    scratch_pad: pads.pop(),
                    errors,
                }))
            }
            0 if !errors.is_empty() => {
                debug!(
                    corr_interval_id = ci,
                    replicate_analysis_id = ra,
                    errors = errors.len(),
                    "Correction interval has a recorded failure"
                );
                Ok(Lookup::Found(CorrIntervalOutcome {
                    scratch_pad: None,
                    errors,
                }))
            }
            0 => Ok(Lookup::Cold),
            readable => Ok(Lookup::Corrupt {
                readable,
                undecodable: 0,
            }),
        }
    }

    async fn clear(&self, (ci, ra): (i64, i64)) -> Result<()> {
        let store = &self.collaborators.store;
        store.delete_corr_interval_scratch_pads(ci, ra).await?;
        store.delete_corr_interval_errors(ci, ra).await?;
        Ok(())
    }

    async fn recompute(&self, key: (i64, i64)) -> CorrIntervalOutcome {
        info!(
            corr_interval_id = key.0,
            replicate_analysis_id = key.1,
            "Correction interval cache miss, calculating"
        );
        match self.calculate(key).await {
            Ok(outcome) => outcome,
            Err(e) => self.record_failure(key, e).await,
        }
    }

    async fn calculate(&self, (ci, ra): (i64, i64)) -> Result<CorrIntervalOutcome> {
        let source = &self.collaborators.source;

        let Some(interval) = source.corr_interval(ci).await? else {
            return Ok(self
                .record_errors(vec![CorrIntervalError::new(
                    ci,
                    ra,
                    format!("Correction interval {} does not exist", ci),
                )])
                .await);
        };
        let Some(analysis) = source.replicate_analysis(ra).await? else {
            return Ok(self
                .record_errors(vec![CorrIntervalError::new(
                    ci,
                    ra,
                    format!("Replicate analysis {} does not exist", ra),
                )])
                .await);
        };

        let mut problems = Vec::new();
        if !interval.replicate_analysis_ids.contains(&ra) {
            problems.push(format!(
                "Replicate analysis '{}' is not declared for correction interval {}",
                analysis.name, ci
            ));
        }
        problems.extend(validate_steps(
            &analysis.corr_interval_steps,
            self.collaborators.metadata.as_ref(),
        ));
        if !problems.is_empty() {
            warn!(
                corr_interval_id = ci,
                replicate_analysis_id = ra,
                problems = problems.len(),
                "Correction interval configuration is invalid"
            );
            let errors = problems
                .into_iter()
                .map(|problem| CorrIntervalError::new(ci, ra, problem))
                .collect();
            return Ok(self.record_errors(errors).await);
        }

        let (mut scratch_pad, context) = self.build_scratch_pad(&interval, &analysis).await?;
        let (column_ordering, format_lookup) = column_layout(
            &analysis.corr_interval_steps,
            self.collaborators.metadata.as_ref(),
        );
        scratch_pad.set_natural_column_order(column_ordering.0.clone());

        let outcome = self.collaborators.pipeline.execute(PipelineRequest {
            scope: PipelineScope::CorrectionInterval,
            steps: &analysis.corr_interval_steps,
            scratch_pad: &mut scratch_pad,
            context: &context,
        });

        let mut errors: Vec<CorrIntervalError> = outcome
            .errors
            .iter()
            .map(|e| CorrIntervalError::from_step_error(ci, ra, e))
            .collect();

        if !outcome.finished {
            if errors.is_empty() {
                errors.push(CorrIntervalError::new(
                    ci,
                    ra,
                    "Correction interval calculation did not finish",
                ));
            }
            warn!(
                corr_interval_id = ci,
                replicate_analysis_id = ra,
                errors = errors.len(),
                "Correction interval pipeline did not finish"
            );
            return Ok(self.record_errors(errors).await);
        }

        for child in scratch_pad.children() {
            if let Some(step_error) = node_error(child) {
                errors.push(flagged_replicate_error(ci, ra, child, &step_error));
            }
        }
        scratch_pad
            .root_mut()
            .retain_children(|child| node_error(child).is_none());
        scratch_pad.truncate_below(self.config.corr_interval_resolution);

        let mut row = CorrIntervalScratchPad {
            id: 0,
            corr_interval_id: ci,
            data_analysis_id: ra,
            scratch_pad,
            column_ordering,
            format_lookup,
        };
        row.id = self
            .collaborators
            .store
            .insert_corr_interval_scratch_pad(&row)
            .await?;

        info!(
            corr_interval_id = ci,
            replicate_analysis_id = ra,
            replicates = row.scratch_pad.child_count(),
            rejected = errors.len(),
            "Stored correction interval scratch pad"
        );

        let errors = self.persist_errors(errors).await;
        Ok(CorrIntervalOutcome {
            scratch_pad: Some(row),
            errors,
        })
    }

    /// Usable standards and scans of the interval's window
    async fn build_scratch_pad(
        &self,
        interval: &CorrInterval,
        analysis: &ReplicateAnalysis,
    ) -> Result<(ScratchPad, CalculationContext)> {
        let source = &self.collaborators.source;
        let mut scratch_pad = ScratchPad::new();
        let mut context = CalculationContext {
            corr_interval: Some(interval.clone()),
            replicate_analysis: Some(analysis.clone()),
            ..CalculationContext::default()
        };

        let standards = source
            .standard_replicates_in_window(
                interval.mass_spec_id,
                interval.valid_from,
                interval.valid_until,
            )
            .await?;
        for replicate in standards {
            if replicate.disabled
                || replicate.replicate_type != ReplicateType::Standard
                || replicate.mass_spec_id != interval.mass_spec_id
                || !interval.contains(replicate.date)
            {
                continue;
            }
            let acquisitions = source.acquisitions(replicate.id).await?;
            scratch_pad.add_child(replicate.to_pad(&acquisitions)?)?;
            context.replicates.insert(replicate.id, replicate);
        }

        let scans = source
            .scans_in_window(interval.mass_spec_id, interval.valid_from, interval.valid_until)
            .await?;
        for scan in scans {
            if scan.mass_spec_id != interval.mass_spec_id || !interval.contains(scan.date) {
                continue;
            }
            scratch_pad.add_child(scan.to_pad()?)?;
            context.scans.insert(scan.id, scan);
        }

        debug!(
            corr_interval_id = interval.id,
            replicates = context.replicates.len(),
            scans = context.scans.len(),
            "Built correction interval scratch pad"
        );
        Ok((scratch_pad, context))
    }

    async fn record_failure(&self, (ci, ra): (i64, i64), e: AppError) -> CorrIntervalOutcome {
        error!(
            corr_interval_id = ci,
            replicate_analysis_id = ra,
            error = %e,
            "Correction interval calculation failed"
        );
        self.record_errors(vec![CorrIntervalError::new(
            ci,
            ra,
            format!("Correction interval calculation failed: {}", e),
        )])
        .await
    }

    async fn record_errors(&self, errors: Vec<CorrIntervalError>) -> CorrIntervalOutcome {
        CorrIntervalOutcome {
            scratch_pad: None,
            errors: self.persist_errors(errors).await,
        }
    }

    async fn persist_errors(&self, errors: Vec<CorrIntervalError>) -> Vec<CorrIntervalError> {
        let mut persisted = Vec::with_capacity(errors.len());
        for mut entry in errors {
            match self.collaborators.store.insert_corr_interval_error(&entry).await {
                Ok(id) => entry.id = id,
                Err(e) => error!(
                    corr_interval_id = entry.corr_interval_id,
                    replicate_analysis_id = entry.data_analysis_id,
                    message = %entry.message,
                    error = %e,
                    "Failed to record correction interval error"
                ),
            }
            persisted.push(entry);
        }
        persisted
    }
}

fn flagged_replicate_error(
    ci: i64,
    ra: i64,
    pad: &Pad,
    step_error: &StepError,
) -> CorrIntervalError {
    let replicate_id = pad.get_value(columns::REPLICATE_ID).and_then(Value::as_i64);
    let replicate_date = match pad.kind() {
        PadKind::Replicate { date } => Some(*date),
        _ => None,
    };
    let replicate_user = pad
        .get_value(columns::USER)
        .and_then(Value::as_str)
        .map(str::to_string);

    CorrIntervalError::from_step_error(ci, ra, step_error).with_replicate(
        replicate_id,
        replicate_date,
        replicate_user,
    )
}
