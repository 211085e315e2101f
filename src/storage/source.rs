//! Read access to the source data the caches are computed from

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    AcquisitionRecord, CorrInterval, ReplicateAnalysis, ReplicateRecord, SampleAnalysis,
    SampleRecord, ScanRecord,
};
use crate::error::Result;

/// Relational query façade over correction intervals, replicates, scans,
/// analyses and stored user choices
///
/// `Ok(None)` means the row does not exist; `Err` is an infrastructure
/// failure.
#[async_trait]
pub trait SourceRepository: Send + Sync {
    async fn corr_interval(&self, id: i64) -> Result<Option<CorrInterval>>;

    /// Interval of `mass_spec_id` whose window contains `date`
    async fn corr_interval_for(
        &self,
        mass_spec_id: i64,
        date: DateTime<Utc>,
    ) -> Result<Option<CorrInterval>>;

    /// Standard replicates of the mass spectrometer dated in `[from, until)`,
    /// disabled ones included
    async fn standard_replicates_in_window(
        &self,
        mass_spec_id: i64,
        from: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<ReplicateRecord>>;

    async fn scans_in_window(
        &self,
        mass_spec_id: i64,
        from: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<ScanRecord>>;

    async fn replicate(&self, id: i64) -> Result<Option<ReplicateRecord>>;

    /// Acquisitions of a replicate with their cycles
    async fn acquisitions(&self, replicate_id: i64) -> Result<Vec<AcquisitionRecord>>;

    async fn replicate_analysis(&self, id: i64) -> Result<Option<ReplicateAnalysis>>;

    async fn sample(&self, id: i64) -> Result<Option<SampleRecord>>;

    async fn sample_analysis(&self, id: i64) -> Result<Option<SampleAnalysis>>;

    /// Replicates belonging to the sample, disabled ones included
    async fn sample_replicates(&self, sample_id: i64) -> Result<Vec<ReplicateRecord>>;

    /// Replicate analysis the user picked for this replicate of the sample
    async fn rep_analysis_choice(
        &self,
        sample_id: i64,
        sample_analysis_id: i64,
        replicate_id: i64,
    ) -> Result<Option<i64>>;
}
