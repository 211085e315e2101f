//! Cache persistence
//!
//! ```text
//! corr_interval_scratch_pad   (corr_interval_id, data_analysis_id) → pad
//! corr_interval_error         append-only failure log
//! calc_replicate_cache        (replicate_id, replicate_analysis_id) → pad | error
//! calc_sample_cache           (sample_id, sample_analysis_id) → pad | error
//! calc_rep_to_calc_samp       sample cache ↔ replicate caches it consumed
//! ```
//!
//! `CacheStore` is the write/read contract of those tables,
//! `SourceRepository` the read-only view of the data they are computed from.

pub mod cache_store;
pub mod entities;
pub mod source;
pub mod sqlite_store;

pub use cache_store::CacheStore;
pub use entities::{
    decode_blob, encode_blob, CalcRepToCalcSamp, CalcReplicateCache, CalcSampleCache,
    CorrIntervalError, CorrIntervalScratchPad, KeyedRows, ReplicateResolution,
};
pub use source::SourceRepository;
pub use sqlite_store::SqliteCacheStore;
