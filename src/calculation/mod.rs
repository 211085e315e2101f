//! Load-or-calculate orchestration
//!
//! Each orchestrator owns one cache table. A call looks the key up, returns
//! the stored row on a hit and otherwise computes, persists and returns a
//! new one. Calls nest sample → replicate → correction interval, which is
//! also the order their per-key locks are taken in.
//!
//! Nothing here returns an infrastructure error from `load_or_calculate`:
//! failures end up as persisted domain error data (or are logged when even
//! that write fails).

pub mod corr_interval;
pub mod invalidation;
pub mod replicate;
pub mod sample;

use std::sync::Arc;

use crate::infrastructure::config::CalculationConfig;
use crate::pad::Pad;
use crate::pipeline::{node_error, PipelineOutcome, StepError, StepMetadataResolver, StepPipeline};
use crate::storage::{CacheStore, SourceRepository};

pub use corr_interval::{CorrIntervalOutcome, LoadOrCalculateCorrInterval};
pub use invalidation::{CacheInvalidator, InvalidationReport};
pub use replicate::LoadOrCalculateReplicate;
pub use sample::LoadOrCalculateSample;

/// External collaborators shared by every orchestrator
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn SourceRepository>,
    pub store: Arc<dyn CacheStore>,
    pub pipeline: Arc<dyn StepPipeline>,
    pub metadata: Arc<dyn StepMetadataResolver>,
}

/// The three orchestrators wired together, plus invalidation
pub struct Calculator {
    pub corr_intervals: Arc<LoadOrCalculateCorrInterval>,
    pub replicates: Arc<LoadOrCalculateReplicate>,
    pub samples: LoadOrCalculateSample,
    pub invalidator: CacheInvalidator,
}

impl Calculator {
    pub fn new(collaborators: Collaborators, config: &CalculationConfig) -> Self {
        let corr_intervals = Arc::new(LoadOrCalculateCorrInterval::new(
            collaborators.clone(),
            config.clone(),
        ));
        let replicates = Arc::new(LoadOrCalculateReplicate::new(
            collaborators.clone(),
            config.clone(),
            corr_intervals.clone(),
        ));
        let samples =
            LoadOrCalculateSample::new(collaborators.clone(), config.clone(), replicates.clone());
        let invalidator = CacheInvalidator::new(collaborators.store, collaborators.source);

        Self {
            corr_intervals,
            replicates,
            samples,
            invalidator,
        }
    }
}

/// Step and message of the first reported error, or `fallback`
pub(crate) fn first_reported_error(outcome: &PipelineOutcome, fallback: &str) -> StepError {
    outcome
        .errors
        .first()
        .cloned()
        .unwrap_or_else(|| StepError::new(None, fallback))
}

/// First calculation error attached to `pad` or any descendant, pre-order
pub(crate) fn first_node_error(pad: &Pad) -> Option<StepError> {
    let mut found = None;
    pad.walk(&mut |node| {
        if found.is_none() {
            found = node_error(node);
        }
    });
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pad::PadKind;
    use crate::pipeline::flag_error;

    #[test]
    fn test_first_node_error_searches_descendants() {
        let mut acquisition = Pad::new(PadKind::Acquisition { number: 1 });
        assert!(first_node_error(&acquisition).is_none());

        let mut cycle = Pad::new(PadKind::Cycle { number: 2 });
        flag_error(&mut cycle, Some("Outlier"), "rejected").unwrap();
        acquisition.add_child(cycle).unwrap();

        let error = first_node_error(&acquisition).unwrap();
        assert_eq!(error.step_name.as_deref(), Some("Outlier"));
    }

    #[test]
    fn test_first_reported_error_falls_back() {
        let outcome = PipelineOutcome::default();
        let error = first_reported_error(&outcome, "did not finish");
        assert_eq!(error.step_name, None);
        assert_eq!(error.message, "did not finish");
    }
}
