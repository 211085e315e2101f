//! Explicit cache invalidation after upstream data changes
//!
//! Recorded failures are never retried on their own; deleting the affected
//! rows here is what makes the next load recompute them.

use std::sync::Arc;
use tracing::info;

use crate::error::Result;
use crate::storage::{CacheStore, SourceRepository};

/// Rows removed by one invalidation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    pub corr_interval_pads: u64,
    pub corr_interval_errors: u64,
    pub sample_caches: Vec<i64>,
    pub replicate_caches: Vec<i64>,
}

impl InvalidationReport {
    pub fn is_empty(&self) -> bool {
        self.corr_interval_pads == 0
            && self.corr_interval_errors == 0
            && self.sample_caches.is_empty()
            && self.replicate_caches.is_empty()
    }
}

pub struct CacheInvalidator {
    store: Arc<dyn CacheStore>,
    source: Arc<dyn SourceRepository>,
}

impl CacheInvalidator {
    pub fn new(store: Arc<dyn CacheStore>, source: Arc<dyn SourceRepository>) -> Self {
        Self { store, source }
    }

    /// Drop a correction interval's pad and error log, every sample cache
    /// built on it and every replicate cache computed under it
    pub async fn invalidate_corr_interval(
        &self,
        corr_interval_id: i64,
        replicate_analysis_id: i64,
    ) -> Result<InvalidationReport> {
        let mut report = InvalidationReport {
            corr_interval_pads: self
                .store
                .delete_corr_interval_scratch_pads(corr_interval_id, replicate_analysis_id)
                .await?,
            corr_interval_errors: self
                .store
                .delete_corr_interval_errors(corr_interval_id, replicate_analysis_id)
                .await?,
            ..InvalidationReport::default()
        };

        let sample_ids = self
            .store
            .sample_cache_ids_for_corr_interval(corr_interval_id, replicate_analysis_id)
            .await?;
        self.delete_sample_caches(sample_ids, &mut report).await?;

        let replicate_ids = self
            .store
            .replicate_cache_ids_for_corr_interval(corr_interval_id, replicate_analysis_id)
            .await?;
        self.delete_replicate_caches(replicate_ids, &mut report).await?;

        info!(
            corr_interval_id,
            replicate_analysis_id,
            samples = report.sample_caches.len(),
            replicates = report.replicate_caches.len(),
            "Invalidated correction interval"
        );
        Ok(report)
    }

    /// Drop every sample cache of the sample, whatever its analysis
    pub async fn invalidate_sample(&self, sample_id: i64) -> Result<InvalidationReport> {
        let mut report = InvalidationReport::default();
        let sample_ids = self.store.sample_cache_ids_for_sample(sample_id).await?;
        self.delete_sample_caches(sample_ids, &mut report).await?;

        info!(
            sample_id,
            samples = report.sample_caches.len(),
            replicates = report.replicate_caches.len(),
            "Invalidated sample"
        );
        Ok(report)
    }

    /// Drop the replicate's caches, the sample caches joined to them and the
    /// sample caches of the sample it belongs to
    pub async fn invalidate_replicate(&self, replicate_id: i64) -> Result<InvalidationReport> {
        let mut report = InvalidationReport::default();

        let mut sample_ids = self.store.sample_cache_ids_for_replicate(replicate_id).await?;
        if let Some(sample_id) = self
            .source
            .replicate(replicate_id)
            .await?
            .and_then(|replicate| replicate.sample_id)
        {
            sample_ids.extend(self.store.sample_cache_ids_for_sample(sample_id).await?);
        }
        sample_ids.sort_unstable();
        sample_ids.dedup();
        self.delete_sample_caches(sample_ids, &mut report).await?;

        let replicate_ids = self
            .store
            .replicate_cache_ids_for_replicate(replicate_id)
            .await?;
        self.delete_replicate_caches(replicate_ids, &mut report).await?;

        info!(
            replicate_id,
            samples = report.sample_caches.len(),
            replicates = report.replicate_caches.len(),
            "Invalidated replicate"
        );
        Ok(report)
    }

    async fn delete_sample_caches(
        &self,
        ids: Vec<i64>,
        report: &mut InvalidationReport,
    ) -> Result<()> {
        for id in ids {
            let orphans = self.store.delete_sample_cache(id).await?;
            report.sample_caches.push(id);
            report.replicate_caches.extend(orphans);
        }
        Ok(())
    }

    async fn delete_replicate_caches(
        &self,
        ids: Vec<i64>,
        report: &mut InvalidationReport,
    ) -> Result<()> {
        for id in ids {
            if self.store.delete_replicate_cache(id).await? {
                report.replicate_caches.push(id);
            }
        }
        Ok(())
    }
}
