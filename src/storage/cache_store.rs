//! Cache persistence contract

use async_trait::async_trait;

use super::entities::{
    CalcRepToCalcSamp, CalcReplicateCache, CalcSampleCache, CorrIntervalError,
    CorrIntervalScratchPad, KeyedRows,
};
use crate::error::Result;

/// Storage of the three cache tables, the correction-interval error log and
/// the sample ↔ replicate join table
///
/// Inserts return the generated row id. Implementations reject rows that
/// break the scratch-pad/error exclusivity with `AppError::CacheInvariant`.
/// Keyed lookups decode row by row and list undecodable rows in
/// `KeyedRows::corrupt` instead of failing.
#[async_trait]
pub trait CacheStore: Send + Sync {
    // ---- correction interval ----

    async fn find_corr_interval_scratch_pads(
        &self,
        corr_interval_id: i64,
        data_analysis_id: i64,
    ) -> Result<KeyedRows<CorrIntervalScratchPad>>;

    async fn insert_corr_interval_scratch_pad(&self, row: &CorrIntervalScratchPad) -> Result<i64>;

    /// Returns the number of deleted rows
    async fn delete_corr_interval_scratch_pads(
        &self,
        corr_interval_id: i64,
        data_analysis_id: i64,
    ) -> Result<u64>;

    async fn find_corr_interval_errors(
        &self,
        corr_interval_id: i64,
        data_analysis_id: i64,
    ) -> Result<Vec<CorrIntervalError>>;

    async fn insert_corr_interval_error(&self, error: &CorrIntervalError) -> Result<i64>;

    async fn delete_corr_interval_errors(
        &self,
        corr_interval_id: i64,
        data_analysis_id: i64,
    ) -> Result<u64>;

    // ---- replicate ----

    async fn find_replicate_caches(
        &self,
        replicate_id: i64,
        replicate_analysis_id: i64,
    ) -> Result<KeyedRows<CalcReplicateCache>>;

    async fn get_replicate_cache(&self, id: i64) -> Result<Option<CalcReplicateCache>>;

    async fn insert_replicate_cache(&self, row: &CalcReplicateCache) -> Result<i64>;

    /// Deletes the row together with any join rows pointing at it
    async fn delete_replicate_cache(&self, id: i64) -> Result<bool>;

    async fn replicate_cache_ids_for_replicate(&self, replicate_id: i64) -> Result<Vec<i64>>;

    async fn replicate_cache_ids_for_corr_interval(
        &self,
        corr_interval_id: i64,
        replicate_analysis_id: i64,
    ) -> Result<Vec<i64>>;

    // ---- sample ----

    async fn find_sample_caches(
        &self,
        sample_id: i64,
        sample_analysis_id: i64,
    ) -> Result<KeyedRows<CalcSampleCache>>;

    async fn get_sample_cache(&self, id: i64) -> Result<Option<CalcSampleCache>>;

    /// Writes the row and one join row per replicate cache atomically
    async fn insert_sample_cache(
        &self,
        row: &CalcSampleCache,
        replicate_cache_ids: &[i64],
    ) -> Result<i64>;

    /// Deletes the row and its join rows, then every replicate cache it
    /// referenced that no other sample cache references. Returns the ids of
    /// those orphaned replicate caches.
    async fn delete_sample_cache(&self, id: i64) -> Result<Vec<i64>>;

    /// Join rows of a sample cache, ordered by replicate cache id
    async fn find_sample_joins(&self, sample_cache_id: i64) -> Result<Vec<CalcRepToCalcSamp>>;

    async fn sample_cache_ids_for_sample(&self, sample_id: i64) -> Result<Vec<i64>>;

    /// Sample caches joined to the replicate cache row `replicate_cache_id`
    async fn sample_cache_ids_for_replicate_cache(
        &self,
        replicate_cache_id: i64,
    ) -> Result<Vec<i64>>;

    /// Sample caches joined to any replicate cache of `replicate_id`
    async fn sample_cache_ids_for_replicate(&self, replicate_id: i64) -> Result<Vec<i64>>;

    /// Sample caches joined to replicate caches computed under the interval
    async fn sample_cache_ids_for_corr_interval(
        &self,
        corr_interval_id: i64,
        replicate_analysis_id: i64,
    ) -> Result<Vec<i64>>;
}
