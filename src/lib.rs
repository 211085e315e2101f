//! isocalc
//!
//! Hierarchical scratch pads for isotope-ratio measurements and the
//! load-or-calculate caches built on them.
//!
//! ```text
//! pad/            tree model, accumulators, binary codec
//! domain/         source records and well-known column names
//! pipeline/       contracts of the external calculation steps
//! storage/        cache entities, persistence contracts, SQLite store
//! calculation/    correction interval → replicate → sample orchestrators
//! infrastructure/ configuration and logging
//! utils/          per-key locking
//! ```

pub mod calculation;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod pad;
pub mod pipeline;
pub mod storage;
pub mod utils;

pub use calculation::{
    Calculator, Collaborators, CorrIntervalOutcome, LoadOrCalculateCorrInterval,
    LoadOrCalculateReplicate, LoadOrCalculateSample,
};
pub use error::{AppError, Result};
pub use infrastructure::config::AppConfig;
pub use pad::{Pad, PadKind, PadLevel, ScratchPad, Value};
pub use storage::{CacheStore, SourceRepository, SqliteCacheStore};
