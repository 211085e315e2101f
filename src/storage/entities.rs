//! Persisted cache entities
//!
//! Every cache row holds exactly one of {scratch pad, error message}. The
//! `success`/`failure` constructors build valid rows and `check_invariant`
//! guards every write.

use chrono::{DateTime, SubsecRound, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::pad::ScratchPad;
use crate::pipeline::{ColumnOrdering, Dependencies, FormatLookup, StepError};

/// Encode a companion blob
pub fn encode_blob<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Decode a companion blob
pub fn decode_blob<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Rows stored under one cache key
///
/// `corrupt` holds the ids of rows whose blobs no longer decode.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedRows<T> {
    pub rows: Vec<T>,
    pub corrupt: Vec<i64>,
}

impl<T> Default for KeyedRows<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            corrupt: Vec::new(),
        }
    }
}

impl<T> KeyedRows<T> {
    /// Nothing stored under the key, readable or not
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.corrupt.is_empty()
    }

    pub fn is_clean(&self) -> bool {
        self.corrupt.is_empty()
    }
}

fn check_exclusive(has_scratch_pad: bool, error_message: Option<&str>, row: &str) -> Result<()> {
    match (has_scratch_pad, error_message) {
        (true, None) | (false, Some(_)) => Ok(()),
        (true, Some(message)) => Err(AppError::CacheInvariant(format!(
            "{} has both a scratch pad and error '{}'",
            row, message
        ))),
        (false, None) => Err(AppError::CacheInvariant(format!(
            "{} has neither a scratch pad nor an error",
            row
        ))),
    }
}

/// Successful correction-interval calculation, keyed by
/// (corr_interval_id, data_analysis_id)
#[derive(Debug, Clone, PartialEq)]
pub struct CorrIntervalScratchPad {
    pub id: i64,
    pub corr_interval_id: i64,
    pub data_analysis_id: i64,
    pub scratch_pad: ScratchPad,
    pub column_ordering: ColumnOrdering,
    pub format_lookup: FormatLookup,
}

/// Append-only failure log entry of a correction-interval calculation
#[derive(Debug, Clone, PartialEq)]
pub struct CorrIntervalError {
    pub id: i64,
    pub corr_interval_id: i64,
    pub data_analysis_id: i64,
    pub replicate_id: Option<i64>,
    pub replicate_date: Option<DateTime<Utc>>,
    pub replicate_user: Option<String>,
    pub step_name: Option<String>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl CorrIntervalError {
    pub fn new(corr_interval_id: i64, data_analysis_id: i64, message: impl Into<String>) -> Self {
        Self {
            id: 0,
            corr_interval_id,
            data_analysis_id,
            replicate_id: None,
            replicate_date: None,
            replicate_user: None,
            step_name: None,
            message: message.into(),
            // stored as epoch millis
            created_at: Utc::now().trunc_subsecs(3),
        }
    }

    pub fn from_step_error(corr_interval_id: i64, data_analysis_id: i64, error: &StepError) -> Self {
        Self {
            step_name: error.step_name.clone(),
            ..Self::new(corr_interval_id, data_analysis_id, error.message.clone())
        }
    }

    /// Tag the entry with the offending replicate
    pub fn with_replicate(
        mut self,
        replicate_id: Option<i64>,
        replicate_date: Option<DateTime<Utc>>,
        replicate_user: Option<String>,
    ) -> Self {
        self.replicate_id = replicate_id;
        self.replicate_date = replicate_date.map(|date| date.trunc_subsecs(3));
        self.replicate_user = replicate_user;
        self
    }
}

/// Cached replicate calculation, keyed by (replicate_id, replicate_analysis_id)
#[derive(Debug, Clone, PartialEq)]
pub struct CalcReplicateCache {
    pub id: i64,
    pub replicate_id: i64,
    pub replicate_analysis_id: i64,
    pub corr_interval_id: Option<i64>,
    pub scratch_pad: Option<ScratchPad>,
    pub dependencies: Dependencies,
    pub error_rep_step: Option<String>,
    pub error_message: Option<String>,
    pub column_ordering: ColumnOrdering,
    pub format_lookup: FormatLookup,
}

impl CalcReplicateCache {
    pub fn success(
        replicate_id: i64,
        replicate_analysis_id: i64,
        corr_interval_id: i64,
        scratch_pad: ScratchPad,
        dependencies: Dependencies,
        column_ordering: ColumnOrdering,
        format_lookup: FormatLookup,
    ) -> Self {
        Self {
            id: 0,
            replicate_id,
            replicate_analysis_id,
            corr_interval_id: Some(corr_interval_id),
            scratch_pad: Some(scratch_pad),
            dependencies,
            error_rep_step: None,
            error_message: None,
            column_ordering,
            format_lookup,
        }
    }

    pub fn failure(
        replicate_id: i64,
        replicate_analysis_id: i64,
        corr_interval_id: Option<i64>,
        error_rep_step: Option<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            replicate_id,
            replicate_analysis_id,
            corr_interval_id,
            scratch_pad: None,
            dependencies: Dependencies::default(),
            error_rep_step,
            error_message: Some(error_message.into()),
            column_ordering: ColumnOrdering::default(),
            format_lookup: FormatLookup::default(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.scratch_pad.is_some()
    }

    pub fn check_invariant(&self) -> Result<()> {
        check_exclusive(
            self.scratch_pad.is_some(),
            self.error_message.as_deref(),
            &format!(
                "replicate cache ({}, {})",
                self.replicate_id, self.replicate_analysis_id
            ),
        )
    }
}

/// How one replicate child of a sample scratch pad was resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicateResolution {
    pub replicate_id: i64,
    pub corr_interval_id: Option<i64>,
    pub rep_analysis_id: Option<i64>,
    /// Every replicate analysis that could have been used
    pub candidates: Vec<i64>,
}

/// Cached sample calculation, keyed by (sample_id, sample_analysis_id)
///
/// The four arrays are positionally aligned with the replicate children of
/// the sample pad.
#[derive(Debug, Clone, PartialEq)]
pub struct CalcSampleCache {
    pub id: i64,
    pub sample_id: i64,
    pub sample_analysis_id: i64,
    pub scratch_pad: Option<ScratchPad>,
    pub dependencies: Dependencies,
    pub error_sam_step: Option<String>,
    pub error_message: Option<String>,
    pub corr_interval_ids: Vec<Option<i64>>,
    pub rep_analysis_ids: Vec<Option<i64>>,
    pub replicate_ids: Vec<i64>,
    pub potential_rep_analyses: Vec<Vec<i64>>,
}

impl CalcSampleCache {
    pub fn success(
        sample_id: i64,
        sample_analysis_id: i64,
        scratch_pad: ScratchPad,
        dependencies: Dependencies,
        resolutions: Vec<ReplicateResolution>,
    ) -> Self {
        let mut row = Self {
            id: 0,
            sample_id,
            sample_analysis_id,
            scratch_pad: Some(scratch_pad),
            dependencies,
            error_sam_step: None,
            error_message: None,
            corr_interval_ids: Vec::with_capacity(resolutions.len()),
            rep_analysis_ids: Vec::with_capacity(resolutions.len()),
            replicate_ids: Vec::with_capacity(resolutions.len()),
            potential_rep_analyses: Vec::with_capacity(resolutions.len()),
        };
        for resolution in resolutions {
            row.corr_interval_ids.push(resolution.corr_interval_id);
            row.rep_analysis_ids.push(resolution.rep_analysis_id);
            row.replicate_ids.push(resolution.replicate_id);
            row.potential_rep_analyses.push(resolution.candidates);
        }
        row
    }

    pub fn failure(
        sample_id: i64,
        sample_analysis_id: i64,
        error_sam_step: Option<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            sample_id,
            sample_analysis_id,
            scratch_pad: None,
            dependencies: Dependencies::default(),
            error_sam_step,
            error_message: Some(error_message.into()),
            corr_interval_ids: Vec::new(),
            rep_analysis_ids: Vec::new(),
            replicate_ids: Vec::new(),
            potential_rep_analyses: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.scratch_pad.is_some()
    }

    /// Per-replicate resolution, in replicate-child order
    pub fn resolutions(&self) -> Vec<ReplicateResolution> {
        (0..self.replicate_ids.len())
            .map(|index| ReplicateResolution {
                replicate_id: self.replicate_ids[index],
                corr_interval_id: self.corr_interval_ids.get(index).copied().flatten(),
                rep_analysis_id: self.rep_analysis_ids.get(index).copied().flatten(),
                candidates: self
                    .potential_rep_analyses
                    .get(index)
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect()
    }

    pub fn check_invariant(&self) -> Result<()> {
        check_exclusive(
            self.scratch_pad.is_some(),
            self.error_message.as_deref(),
            &format!(
                "sample cache ({}, {})",
                self.sample_id, self.sample_analysis_id
            ),
        )?;

        let len = self.replicate_ids.len();
        if self.corr_interval_ids.len() != len
            || self.rep_analysis_ids.len() != len
            || self.potential_rep_analyses.len() != len
        {
            return Err(AppError::CacheInvariant(format!(
                "sample cache ({}, {}) has misaligned replicate arrays",
                self.sample_id, self.sample_analysis_id
            )));
        }
        Ok(())
    }
}

/// Join row between a sample cache and a replicate cache it consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalcRepToCalcSamp {
    pub calc_sample_cache_id: i64,
    pub calc_replicate_cache_id: i64,
}
