//! SQLite Cache Store
//!
//! `CacheStore` over a single SQLite database using sqlx.
//!
//! ## Database Schema
//!
//! - `corr_interval_scratch_pad`: correction-interval pads
//! - `corr_interval_error`: append-only correction-interval failure log
//! - `calc_replicate_cache`: replicate results or failures
//! - `calc_sample_cache`: sample results or failures
//! - `calc_rep_to_calc_samp`: which replicate caches fed which sample cache
//!
//! Scratch pads are stored in the pad codec format, the companion columns
//! (dependencies, column ordering, format lookup, sample arrays) as bincode
//! blobs. The cache tables enforce pad/error exclusivity with a CHECK
//! constraint on top of `check_invariant`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, Sqlite, SqlitePool};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::cache_store::CacheStore;
use super::entities::{
    decode_blob, encode_blob, CalcRepToCalcSamp, CalcReplicateCache, CalcSampleCache,
    CorrIntervalError, CorrIntervalScratchPad, KeyedRows,
};
use crate::error::{AppError, Result};
use crate::infrastructure::config::StorageConfig;
use crate::pad::ScratchPad;

/// SQLite-backed cache store
pub struct SqliteCacheStore {
    pool: SqlitePool,
}

fn db_error(action: &str, e: sqlx::Error) -> AppError {
    AppError::database_error(format!("Failed to {}: {}", action, e))
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name)
        .map_err(|e| AppError::database_error(format!("Failed to read column {}: {}", name, e)))
}

fn to_millis(date: DateTime<Utc>) -> i64 {
    date.timestamp_millis()
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn pad_blob(scratch_pad: Option<&ScratchPad>) -> Option<Vec<u8>> {
    scratch_pad.map(ScratchPad::to_bytes)
}

fn pad_from_blob(blob: Option<Vec<u8>>) -> Result<Option<ScratchPad>> {
    blob.map(|bytes| ScratchPad::from_bytes(&bytes)).transpose()
}

/// Decode each row on its own; rows that fail are reported by id
fn keyed_rows<T>(
    rows: &[SqliteRow],
    table: &str,
    decode: fn(&SqliteRow) -> Result<T>,
) -> Result<KeyedRows<T>> {
    let mut found = KeyedRows::default();
    for row in rows {
        match decode(row) {
            Ok(value) => found.rows.push(value),
            Err(e) => {
                let id: i64 = column(row, "id")?;
                warn!(table, id, error = %e, "Cache row cannot be decoded");
                found.corrupt.push(id);
            }
        }
    }
    Ok(found)
}

impl SqliteCacheStore {
    /// Open (or create) the cache database in `workspace_dir` with default
    /// pool settings
    pub async fn new(workspace_dir: &Path) -> Result<Self> {
        Self::open(&StorageConfig::in_dir(workspace_dir)).await
    }

    /// Open (or create) the cache database described by `config`
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - the data directory cannot be created
    /// - the database cannot be opened
    /// - the schema cannot be created
    pub async fn open(config: &StorageConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .map_err(|e| {
                AppError::io_error(
                    format!("Failed to create data directory: {}", e),
                    Some(config.data_dir.clone()),
                )
            })?;

        let db_path = config.database_path();
        info!(path = %db_path.display(), "Initializing cache store");

        // Pragmas go on the connect options so every pooled connection gets them
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect_with(options)
            .await
            .map_err(|e| db_error("connect to database", e))?;

        Self::init_schema(&pool).await?;

        info!(path = %db_path.display(), "Cache store ready (WAL mode)");
        Ok(Self { pool })
    }

    /// Initialize database schema
    async fn init_schema(pool: &SqlitePool) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS corr_interval_scratch_pad (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                corr_interval_id INTEGER NOT NULL,
                data_analysis_id INTEGER NOT NULL,
                scratch_pad BLOB NOT NULL,
                column_ordering BLOB NOT NULL,
                format_lookup BLOB NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS corr_interval_error (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                corr_interval_id INTEGER NOT NULL,
                data_analysis_id INTEGER NOT NULL,
                replicate_id INTEGER,
                replicate_date INTEGER,
                replicate_user TEXT,
                step_name TEXT,
                message TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS calc_replicate_cache (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                replicate_id INTEGER NOT NULL,
                replicate_analysis_id INTEGER NOT NULL,
                corr_interval_id INTEGER,
                scratch_pad BLOB,
                dependencies BLOB NOT NULL,
                error_rep_step TEXT,
                error_message TEXT,
                column_ordering BLOB NOT NULL,
                format_lookup BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                CHECK ((scratch_pad IS NULL) <> (error_message IS NULL))
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS calc_sample_cache (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sample_id INTEGER NOT NULL,
                sample_analysis_id INTEGER NOT NULL,
                scratch_pad BLOB,
                dependencies BLOB NOT NULL,
                error_sam_step TEXT,
                error_message TEXT,
                corr_interval_ids BLOB NOT NULL,
                rep_analysis_ids BLOB NOT NULL,
                replicate_ids BLOB NOT NULL,
                potential_rep_analyses BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                CHECK ((scratch_pad IS NULL) <> (error_message IS NULL))
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS calc_rep_to_calc_samp (
                calc_sample_cache_id INTEGER NOT NULL,
                calc_replicate_cache_id INTEGER NOT NULL,
                PRIMARY KEY (calc_sample_cache_id, calc_replicate_cache_id),
                FOREIGN KEY (calc_sample_cache_id) REFERENCES calc_sample_cache(id) ON DELETE CASCADE,
                FOREIGN KEY (calc_replicate_cache_id) REFERENCES calc_replicate_cache(id) ON DELETE CASCADE
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_ci_pad_key ON corr_interval_scratch_pad(corr_interval_id, data_analysis_id)",
            "CREATE INDEX IF NOT EXISTS idx_ci_error_key ON corr_interval_error(corr_interval_id, data_analysis_id)",
            "CREATE INDEX IF NOT EXISTS idx_rep_cache_key ON calc_replicate_cache(replicate_id, replicate_analysis_id)",
            "CREATE INDEX IF NOT EXISTS idx_rep_cache_interval ON calc_replicate_cache(corr_interval_id, replicate_analysis_id)",
            "CREATE INDEX IF NOT EXISTS idx_sample_cache_key ON calc_sample_cache(sample_id, sample_analysis_id)",
            "CREATE INDEX IF NOT EXISTS idx_join_replicate ON calc_rep_to_calc_samp(calc_replicate_cache_id)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(pool)
                .await
                .map_err(|e| db_error("initialize schema", e))?;
        }

        debug!("Cache schema initialized");
        Ok(())
    }

    /// Underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn corr_interval_pad_from_row(row: &SqliteRow) -> Result<CorrIntervalScratchPad> {
        let scratch_pad: Vec<u8> = column(row, "scratch_pad")?;
        let column_ordering: Vec<u8> = column(row, "column_ordering")?;
        let format_lookup: Vec<u8> = column(row, "format_lookup")?;
        Ok(CorrIntervalScratchPad {
            id: column(row, "id")?,
            corr_interval_id: column(row, "corr_interval_id")?,
            data_analysis_id: column(row, "data_analysis_id")?,
            scratch_pad: ScratchPad::from_bytes(&scratch_pad)?,
            column_ordering: decode_blob(&column_ordering)?,
            format_lookup: decode_blob(&format_lookup)?,
        })
    }

    fn corr_interval_error_from_row(row: &SqliteRow) -> Result<CorrIntervalError> {
        let replicate_date: Option<i64> = column(row, "replicate_date")?;
        let created_at: i64 = column(row, "created_at")?;
        Ok(CorrIntervalError {
            id: column(row, "id")?,
            corr_interval_id: column(row, "corr_interval_id")?,
            data_analysis_id: column(row, "data_analysis_id")?,
            replicate_id: column(row, "replicate_id")?,
            replicate_date: replicate_date.map(from_millis),
            replicate_user: column(row, "replicate_user")?,
            step_name: column(row, "step_name")?,
            message: column(row, "message")?,
            created_at: from_millis(created_at),
        })
    }

    fn replicate_cache_from_row(row: &SqliteRow) -> Result<CalcReplicateCache> {
        let dependencies: Vec<u8> = column(row, "dependencies")?;
        let column_ordering: Vec<u8> = column(row, "column_ordering")?;
        let format_lookup: Vec<u8> = column(row, "format_lookup")?;
        Ok(CalcReplicateCache {
            id: column(row, "id")?,
            replicate_id: column(row, "replicate_id")?,
            replicate_analysis_id: column(row, "replicate_analysis_id")?,
            corr_interval_id: column(row, "corr_interval_id")?,
            scratch_pad: pad_from_blob(column(row, "scratch_pad")?)?,
            dependencies: decode_blob(&dependencies)?,
            error_rep_step: column(row, "error_rep_step")?,
            error_message: column(row, "error_message")?,
            column_ordering: decode_blob(&column_ordering)?,
            format_lookup: decode_blob(&format_lookup)?,
        })
    }

    fn sample_cache_from_row(row: &SqliteRow) -> Result<CalcSampleCache> {
        let dependencies: Vec<u8> = column(row, "dependencies")?;
        let corr_interval_ids: Vec<u8> = column(row, "corr_interval_ids")?;
        let rep_analysis_ids: Vec<u8> = column(row, "rep_analysis_ids")?;
        let replicate_ids: Vec<u8> = column(row, "replicate_ids")?;
        let potential_rep_analyses: Vec<u8> = column(row, "potential_rep_analyses")?;
        Ok(CalcSampleCache {
            id: column(row, "id")?,
            sample_id: column(row, "sample_id")?,
            sample_analysis_id: column(row, "sample_analysis_id")?,
            scratch_pad: pad_from_blob(column(row, "scratch_pad")?)?,
            dependencies: decode_blob(&dependencies)?,
            error_sam_step: column(row, "error_sam_step")?,
            error_message: column(row, "error_message")?,
            corr_interval_ids: decode_blob(&corr_interval_ids)?,
            rep_analysis_ids: decode_blob(&rep_analysis_ids)?,
            replicate_ids: decode_blob(&replicate_ids)?,
            potential_rep_analyses: decode_blob(&potential_rep_analyses)?,
        })
    }

    async fn ids(&self, sql: &str, binds: &[i64]) -> Result<Vec<i64>> {
        let mut query = sqlx::query_scalar::<_, i64>(sql);
        for bind in binds {
            query = query.bind(*bind);
        }
        query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("look up cache ids", e))
    }
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    async fn find_corr_interval_scratch_pads(
        &self,
        corr_interval_id: i64,
        data_analysis_id: i64,
    ) -> Result<KeyedRows<CorrIntervalScratchPad>> {
        let rows = sqlx::query(
            "SELECT * FROM corr_interval_scratch_pad WHERE corr_interval_id = ? AND data_analysis_id = ? ORDER BY id",
        )
        .bind(corr_interval_id)
        .bind(data_analysis_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("query correction interval scratch pads", e))?;

        keyed_rows(&rows, "corr_interval_scratch_pad", Self::corr_interval_pad_from_row)
    }

    async fn insert_corr_interval_scratch_pad(&self, row: &CorrIntervalScratchPad) -> Result<i64> {
        let id = sqlx::query(
            r#"
            INSERT INTO corr_interval_scratch_pad (
                corr_interval_id, data_analysis_id, scratch_pad,
                column_ordering, format_lookup, created_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(row.corr_interval_id)
        .bind(row.data_analysis_id)
        .bind(row.scratch_pad.to_bytes())
        .bind(encode_blob(&row.column_ordering)?)
        .bind(encode_blob(&row.format_lookup)?)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("insert correction interval scratch pad", e))?
        .last_insert_rowid();

        debug!(
            id,
            corr_interval_id = row.corr_interval_id,
            data_analysis_id = row.data_analysis_id,
            "Inserted correction interval scratch pad"
        );
        Ok(id)
    }

    async fn delete_corr_interval_scratch_pads(
        &self,
        corr_interval_id: i64,
        data_analysis_id: i64,
    ) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM corr_interval_scratch_pad WHERE corr_interval_id = ? AND data_analysis_id = ?",
        )
        .bind(corr_interval_id)
        .bind(data_analysis_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("delete correction interval scratch pads", e))?;
        Ok(result.rows_affected())
    }

    async fn find_corr_interval_errors(
        &self,
        corr_interval_id: i64,
        data_analysis_id: i64,
    ) -> Result<Vec<CorrIntervalError>> {
        let rows = sqlx::query(
            "SELECT * FROM corr_interval_error WHERE corr_interval_id = ? AND data_analysis_id = ? ORDER BY id",
        )
        .bind(corr_interval_id)
        .bind(data_analysis_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("query correction interval errors", e))?;

        rows.iter().map(Self::corr_interval_error_from_row).collect()
    }

    async fn insert_corr_interval_error(&self, error: &CorrIntervalError) -> Result<i64> {
        let id = sqlx::query(
            r#"
            INSERT INTO corr_interval_error (
                corr_interval_id, data_analysis_id, replicate_id, replicate_date,
                replicate_user, step_name, message, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(error.corr_interval_id)
        .bind(error.data_analysis_id)
        .bind(error.replicate_id)
        .bind(error.replicate_date.map(to_millis))
        .bind(&error.replicate_user)
        .bind(&error.step_name)
        .bind(&error.message)
        .bind(to_millis(error.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("insert correction interval error", e))?
        .last_insert_rowid();
        Ok(id)
    }

    async fn delete_corr_interval_errors(
        &self,
        corr_interval_id: i64,
        data_analysis_id: i64,
    ) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM corr_interval_error WHERE corr_interval_id = ? AND data_analysis_id = ?",
        )
        .bind(corr_interval_id)
        .bind(data_analysis_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("delete correction interval errors", e))?;
        Ok(result.rows_affected())
    }

    async fn find_replicate_caches(
        &self,
        replicate_id: i64,
        replicate_analysis_id: i64,
    ) -> Result<KeyedRows<CalcReplicateCache>> {
        let rows = sqlx::query(
            "SELECT * FROM calc_replicate_cache WHERE replicate_id = ? AND replicate_analysis_id = ? ORDER BY id",
        )
        .bind(replicate_id)
        .bind(replicate_analysis_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("query replicate caches", e))?;

        keyed_rows(&rows, "calc_replicate_cache", Self::replicate_cache_from_row)
    }

    async fn get_replicate_cache(&self, id: i64) -> Result<Option<CalcReplicateCache>> {
        let row = sqlx::query("SELECT * FROM calc_replicate_cache WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("get replicate cache", e))?;

        row.as_ref().map(Self::replicate_cache_from_row).transpose()
    }

    async fn insert_replicate_cache(&self, row: &CalcReplicateCache) -> Result<i64> {
        row.check_invariant()?;

        let id = sqlx::query(
            r#"
            INSERT INTO calc_replicate_cache (
                replicate_id, replicate_analysis_id, corr_interval_id, scratch_pad,
                dependencies, error_rep_step, error_message, column_ordering,
                format_lookup, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(row.replicate_id)
        .bind(row.replicate_analysis_id)
        .bind(row.corr_interval_id)
        .bind(pad_blob(row.scratch_pad.as_ref()))
        .bind(encode_blob(&row.dependencies)?)
        .bind(&row.error_rep_step)
        .bind(&row.error_message)
        .bind(encode_blob(&row.column_ordering)?)
        .bind(encode_blob(&row.format_lookup)?)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("insert replicate cache", e))?
        .last_insert_rowid();

        debug!(
            id,
            replicate_id = row.replicate_id,
            replicate_analysis_id = row.replicate_analysis_id,
            success = row.is_success(),
            "Inserted replicate cache"
        );
        Ok(id)
    }

    async fn delete_replicate_cache(&self, id: i64) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin transaction", e))?;

        sqlx::query("DELETE FROM calc_rep_to_calc_samp WHERE calc_replicate_cache_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("delete replicate cache joins", e))?;

        let result = sqlx::query("DELETE FROM calc_replicate_cache WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("delete replicate cache", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("commit transaction", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn replicate_cache_ids_for_replicate(&self, replicate_id: i64) -> Result<Vec<i64>> {
        self.ids(
            "SELECT id FROM calc_replicate_cache WHERE replicate_id = ? ORDER BY id",
            &[replicate_id],
        )
        .await
    }

    async fn replicate_cache_ids_for_corr_interval(
        &self,
        corr_interval_id: i64,
        replicate_analysis_id: i64,
    ) -> Result<Vec<i64>> {
        self.ids(
            "SELECT id FROM calc_replicate_cache WHERE corr_interval_id = ? AND replicate_analysis_id = ? ORDER BY id",
            &[corr_interval_id, replicate_analysis_id],
        )
        .await
    }

    async fn find_sample_caches(
        &self,
        sample_id: i64,
        sample_analysis_id: i64,
    ) -> Result<KeyedRows<CalcSampleCache>> {
        let rows = sqlx::query(
            "SELECT * FROM calc_sample_cache WHERE sample_id = ? AND sample_analysis_id = ? ORDER BY id",
        )
        .bind(sample_id)
        .bind(sample_analysis_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("query sample caches", e))?;

        keyed_rows(&rows, "calc_sample_cache", Self::sample_cache_from_row)
    }

    async fn get_sample_cache(&self, id: i64) -> Result<Option<CalcSampleCache>> {
        let row = sqlx::query("SELECT * FROM calc_sample_cache WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("get sample cache", e))?;

        row.as_ref().map(Self::sample_cache_from_row).transpose()
    }

    async fn insert_sample_cache(
        &self,
        row: &CalcSampleCache,
        replicate_cache_ids: &[i64],
    ) -> Result<i64> {
        row.check_invariant()?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin transaction", e))?;

        let id = sqlx::query(
            r#"
            INSERT INTO calc_sample_cache (
                sample_id, sample_analysis_id, scratch_pad, dependencies,
                error_sam_step, error_message, corr_interval_ids, rep_analysis_ids,
                replicate_ids, potential_rep_analyses, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(row.sample_id)
        .bind(row.sample_analysis_id)
        .bind(pad_blob(row.scratch_pad.as_ref()))
        .bind(encode_blob(&row.dependencies)?)
        .bind(&row.error_sam_step)
        .bind(&row.error_message)
        .bind(encode_blob(&row.corr_interval_ids)?)
        .bind(encode_blob(&row.rep_analysis_ids)?)
        .bind(encode_blob(&row.replicate_ids)?)
        .bind(encode_blob(&row.potential_rep_analyses)?)
        .bind(to_millis(Utc::now()))
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("insert sample cache", e))?
        .last_insert_rowid();

        for replicate_cache_id in replicate_cache_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO calc_rep_to_calc_samp (calc_sample_cache_id, calc_replicate_cache_id) VALUES (?, ?)",
            )
            .bind(id)
            .bind(*replicate_cache_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("insert sample/replicate join", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| db_error("commit transaction", e))?;

        debug!(
            id,
            sample_id = row.sample_id,
            sample_analysis_id = row.sample_analysis_id,
            joins = replicate_cache_ids.len(),
            success = row.is_success(),
            "Inserted sample cache"
        );
        Ok(id)
    }

    async fn delete_sample_cache(&self, id: i64) -> Result<Vec<i64>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin transaction", e))?;

        let referenced: Vec<i64> = sqlx::query_scalar(
            "SELECT calc_replicate_cache_id FROM calc_rep_to_calc_samp WHERE calc_sample_cache_id = ?",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| db_error("query sample/replicate joins", e))?;

        sqlx::query("DELETE FROM calc_rep_to_calc_samp WHERE calc_sample_cache_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("delete sample/replicate joins", e))?;

        sqlx::query("DELETE FROM calc_sample_cache WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("delete sample cache", e))?;

        let mut orphans = Vec::new();
        for replicate_cache_id in referenced {
            let remaining: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM calc_rep_to_calc_samp WHERE calc_replicate_cache_id = ?",
            )
            .bind(replicate_cache_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| db_error("count sample/replicate joins", e))?;

            if remaining == 0 {
                sqlx::query("DELETE FROM calc_replicate_cache WHERE id = ?")
                    .bind(replicate_cache_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| db_error("delete orphaned replicate cache", e))?;
                orphans.push(replicate_cache_id);
            }
        }

        tx.commit()
            .await
            .map_err(|e| db_error("commit transaction", e))?;

        info!(
            sample_cache_id = id,
            orphans = orphans.len(),
            "Deleted sample cache"
        );
        Ok(orphans)
    }

    async fn find_sample_joins(&self, sample_cache_id: i64) -> Result<Vec<CalcRepToCalcSamp>> {
        let rows = sqlx::query_as::<_, (i64, i64)>(
            "SELECT calc_sample_cache_id, calc_replicate_cache_id FROM calc_rep_to_calc_samp WHERE calc_sample_cache_id = ? ORDER BY calc_replicate_cache_id",
        )
        .bind(sample_cache_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("query sample/replicate joins", e))?;

        Ok(rows
            .into_iter()
            .map(|(calc_sample_cache_id, calc_replicate_cache_id)| CalcRepToCalcSamp {
                calc_sample_cache_id,
                calc_replicate_cache_id,
            })
            .collect())
    }

    async fn sample_cache_ids_for_sample(&self, sample_id: i64) -> Result<Vec<i64>> {
        self.ids(
            "SELECT id FROM calc_sample_cache WHERE sample_id = ? ORDER BY id",
            &[sample_id],
        )
        .await
    }

    async fn sample_cache_ids_for_replicate_cache(
        &self,
        replicate_cache_id: i64,
    ) -> Result<Vec<i64>> {
        self.ids(
            "SELECT calc_sample_cache_id FROM calc_rep_to_calc_samp WHERE calc_replicate_cache_id = ? ORDER BY calc_sample_cache_id",
            &[replicate_cache_id],
        )
        .await
    }

    async fn sample_cache_ids_for_replicate(&self, replicate_id: i64) -> Result<Vec<i64>> {
        self.ids(
            r#"
            SELECT DISTINCT j.calc_sample_cache_id
            FROM calc_rep_to_calc_samp j
            JOIN calc_replicate_cache r ON r.id = j.calc_replicate_cache_id
            WHERE r.replicate_id = ?
            ORDER BY j.calc_sample_cache_id
            "#,
            &[replicate_id],
        )
        .await
    }

    async fn sample_cache_ids_for_corr_interval(
        &self,
        corr_interval_id: i64,
        replicate_analysis_id: i64,
    ) -> Result<Vec<i64>> {
        self.ids(
            r#"
            SELECT DISTINCT j.calc_sample_cache_id
            FROM calc_rep_to_calc_samp j
            JOIN calc_replicate_cache r ON r.id = j.calc_replicate_cache_id
            WHERE r.corr_interval_id = ? AND r.replicate_analysis_id = ?
            ORDER BY j.calc_sample_cache_id
            "#,
            &[corr_interval_id, replicate_analysis_id],
        )
        .await
    }
}
