//! Resilient single-session Postgres access, staging + merge engine, issue
//! flagging pass, and raw-report archive for the benchmarking mirror.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use ebm_core::PropertyYearRecord;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgQueryResult;
use sqlx::{Connection, PgConnection, Postgres, QueryBuilder, Transaction};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ebm-storage";

/// Rows per staging INSERT. Batching exists purely for transport-size
/// limits; the merge itself is one set-based statement.
pub const MERGE_CHUNK_SIZE: usize = 350;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        source: sqlx::Error,
    },
    #[error("refusing to merge an empty batch")]
    EmptyBatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Timeout/connection-class failures are retryable; everything else fails
/// fast so a genuine SQL error never loops.
pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => RetryDisposition::Retryable,
        sqlx::Error::Database(db) => {
            // SQLSTATE class 08 is "connection exception"; 57P01 is an
            // administrator-initiated disconnect.
            match db.code() {
                Some(code) => {
                    let code = code.as_ref();
                    if code.starts_with("08") || code == "57P01" {
                        RetryDisposition::Retryable
                    } else {
                        RetryDisposition::NonRetryable
                    }
                }
                None => RetryDisposition::NonRetryable,
            }
        }
        other => {
            if other.to_string().to_ascii_lowercase().contains("timed out") {
                RetryDisposition::Retryable
            } else {
                RetryDisposition::NonRetryable
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Total attempts, including the first.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Retry an owned async operation under `policy`. The closure receives the
/// zero-based attempt index; only errors the classifier marks retryable are
/// retried, and the last error is returned once attempts are exhausted.
pub async fn retry_async<T, E, C, Op, Fut>(
    policy: &BackoffPolicy,
    classify: C,
    mut op: Op,
) -> Result<T, E>
where
    C: Fn(&E) -> RetryDisposition,
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0usize;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if classify(&err) == RetryDisposition::Retryable
                    && attempt + 1 < policy.max_attempts
                {
                    tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                    attempt += 1;
                } else {
                    return Err(err);
                }
            }
        }
    }
}

/// Owns exactly one live Postgres connection. All pipeline DB access goes
/// through this object; there is no ambient global and no concurrent use.
pub struct DbSession {
    conn: PgConnection,
    database_url: String,
    backoff: BackoffPolicy,
}

impl DbSession {
    pub async fn connect_with_retry(
        database_url: &str,
        backoff: BackoffPolicy,
    ) -> Result<Self, StorageError> {
        let conn = Self::open_with_retry(database_url, &backoff).await?;
        Ok(Self {
            conn,
            database_url: database_url.to_string(),
            backoff,
        })
    }

    async fn open_with_retry(
        database_url: &str,
        backoff: &BackoffPolicy,
    ) -> Result<PgConnection, StorageError> {
        let mut attempt = 0usize;
        loop {
            info!(
                attempt = attempt + 1,
                max_attempts = backoff.max_attempts,
                "connecting to database"
            );
            match PgConnection::connect(database_url).await {
                Ok(conn) => return Ok(conn),
                Err(err) => {
                    let retryable = classify_sqlx_error(&err) == RetryDisposition::Retryable;
                    if retryable && attempt + 1 < backoff.max_attempts {
                        let delay = backoff.delay_for_attempt(attempt);
                        warn!(
                            error = %err,
                            delay_ms = delay.as_millis() as u64,
                            "connection attempt failed; retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    } else if retryable {
                        return Err(StorageError::RetriesExhausted {
                            attempts: attempt + 1,
                            source: err,
                        });
                    } else {
                        return Err(StorageError::Sqlx(err));
                    }
                }
            }
        }
    }

    /// Health-check with a trivial round trip; on failure the dead
    /// connection is replaced before returning.
    pub async fn ensure_alive(&mut self) -> Result<(), StorageError> {
        match sqlx::query("SELECT 1").execute(&mut self.conn).await {
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(error = %err, "connection lost; reconnecting");
                self.reconnect().await
            }
        }
    }

    async fn reconnect(&mut self) -> Result<(), StorageError> {
        let fresh = Self::open_with_retry(&self.database_url, &self.backoff).await?;
        let stale = std::mem::replace(&mut self.conn, fresh);
        if let Err(err) = stale.close().await {
            warn!(error = %err, "closing stale connection failed");
        }
        Ok(())
    }

    /// Execute one statement with the per-query retry loop: retryable
    /// failures force a reconnect before the next attempt; exhaustion is a
    /// terminal error for the caller.
    pub async fn execute_with_retry(&mut self, sql: &str) -> Result<PgQueryResult, StorageError> {
        let mut attempt = 0usize;
        loop {
            self.ensure_alive().await?;
            match sqlx::query(sql).execute(&mut self.conn).await {
                Ok(done) => return Ok(done),
                Err(err) => {
                    let retryable = classify_sqlx_error(&err) == RetryDisposition::Retryable;
                    if retryable && attempt + 1 < self.backoff.max_attempts {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(
                            error = %err,
                            delay_ms = delay.as_millis() as u64,
                            "statement failed on a connection error; retrying"
                        );
                        tokio::time::sleep(delay).await;
                        self.reconnect().await?;
                        attempt += 1;
                    } else if retryable {
                        return Err(StorageError::RetriesExhausted {
                            attempts: attempt + 1,
                            source: err,
                        });
                    } else {
                        return Err(StorageError::Sqlx(err));
                    }
                }
            }
        }
    }

    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.conn
    }

    pub async fn close(self) -> Result<(), StorageError> {
        self.conn.close().await.map_err(StorageError::Sqlx)
    }
}

const CREATE_PROPERTY_YEAR: &str = r#"
CREATE TABLE IF NOT EXISTS property_year (
    property_id         BIGINT  NOT NULL,
    data_year           TEXT    NOT NULL,
    building_name       TEXT,
    floor_area          TEXT,
    address             TEXT,
    occupancy           TEXT,
    building_count      TEXT,
    use_type            TEXT,
    year_built          TEXT,
    site_eui            TEXT,
    water_intensity     TEXT,
    energy_gap          TEXT,
    water_gap           TEXT,
    energy_months_short TEXT,
    water_months_short  TEXT,
    parent_property_id  BIGINT,
    has_issue           BOOLEAN NOT NULL DEFAULT FALSE,
    CONSTRAINT property_year_pkey PRIMARY KEY (property_id, data_year)
)
"#;

/// Columns added after the table first shipped. Replayed every run so an
/// older deployment catches up without a migration tool.
const EVOLVED_COLUMNS: &[(&str, &str)] = &[
    ("occupancy", "TEXT"),
    ("building_count", "TEXT"),
    ("use_type", "TEXT"),
    ("year_built", "TEXT"),
    ("site_eui", "TEXT"),
    ("water_intensity", "TEXT"),
    ("energy_gap", "TEXT"),
    ("water_gap", "TEXT"),
    ("energy_months_short", "TEXT"),
    ("water_months_short", "TEXT"),
    ("parent_property_id", "BIGINT"),
    ("has_issue", "BOOLEAN NOT NULL DEFAULT FALSE"),
];

const CREATE_ISSUE_INDEX: &str = "CREATE INDEX IF NOT EXISTS property_year_issue_idx \
     ON property_year (property_id, data_year DESC) WHERE has_issue";

/// Best-effort schema migration: create the permanent table if absent and
/// replay column additions. Duplicate-object errors are expected and
/// swallowed; any other DDL failure is a warning, never an abort.
pub async fn ensure_schema(session: &mut DbSession) -> Result<(), StorageError> {
    session.execute_with_retry(CREATE_PROPERTY_YEAR).await?;
    for (name, column_type) in EVOLVED_COLUMNS {
        let sql =
            format!("ALTER TABLE property_year ADD COLUMN IF NOT EXISTS {name} {column_type}");
        if let Err(err) = session.execute_with_retry(&sql).await {
            if is_duplicate_object(&err) {
                continue;
            }
            warn!(column = name, error = %err, "schema evolution statement failed; continuing");
        }
    }
    if let Err(err) = session.execute_with_retry(CREATE_ISSUE_INDEX).await {
        if !is_duplicate_object(&err) {
            warn!(error = %err, "could not ensure issue index; continuing");
        }
    }
    Ok(())
}

fn is_duplicate_object(err: &StorageError) -> bool {
    // 42701 duplicate column, 42P07 duplicate table/index.
    if let StorageError::Sqlx(sqlx::Error::Database(db)) = err {
        matches!(db.code().as_deref(), Some("42701") | Some("42P07"))
    } else {
        false
    }
}

const CREATE_STAGING: &str = r#"
CREATE TEMP TABLE property_year_staging (
    property_id         BIGINT NOT NULL,
    data_year           TEXT   NOT NULL,
    building_name       TEXT,
    floor_area          TEXT,
    address             TEXT,
    occupancy           TEXT,
    building_count      TEXT,
    use_type            TEXT,
    year_built          TEXT,
    site_eui            TEXT,
    water_intensity     TEXT,
    energy_gap          TEXT,
    water_gap           TEXT,
    energy_months_short TEXT,
    water_months_short  TEXT,
    parent_property_id  BIGINT,
    CONSTRAINT property_year_staging_pkey PRIMARY KEY (property_id, data_year)
) ON COMMIT DROP
"#;

const STAGING_INSERT_PREFIX: &str = "INSERT INTO property_year_staging (\
     property_id, data_year, building_name, floor_area, address, occupancy, \
     building_count, use_type, year_built, site_eui, water_intensity, \
     energy_gap, water_gap, energy_months_short, water_months_short, \
     parent_property_id) ";

/// Set-based conditional upsert. The row-constructor `IS DISTINCT FROM`
/// comparison is null-safe per field, so an unchanged row produces no write
/// and `rows_affected` counts only genuine inserts and updates.
const MERGE_UPSERT: &str = r#"
INSERT INTO property_year (
    property_id, data_year, building_name, floor_area, address, occupancy,
    building_count, use_type, year_built, site_eui, water_intensity,
    energy_gap, water_gap, energy_months_short, water_months_short,
    parent_property_id
)
SELECT
    property_id, data_year, building_name, floor_area, address, occupancy,
    building_count, use_type, year_built, site_eui, water_intensity,
    energy_gap, water_gap, energy_months_short, water_months_short,
    parent_property_id
FROM property_year_staging
ON CONFLICT (property_id, data_year) DO UPDATE SET
    building_name       = EXCLUDED.building_name,
    floor_area          = EXCLUDED.floor_area,
    address             = EXCLUDED.address,
    occupancy           = EXCLUDED.occupancy,
    building_count      = EXCLUDED.building_count,
    use_type            = EXCLUDED.use_type,
    year_built          = EXCLUDED.year_built,
    site_eui            = EXCLUDED.site_eui,
    water_intensity     = EXCLUDED.water_intensity,
    energy_gap          = EXCLUDED.energy_gap,
    water_gap           = EXCLUDED.water_gap,
    energy_months_short = EXCLUDED.energy_months_short,
    water_months_short  = EXCLUDED.water_months_short,
    parent_property_id  = EXCLUDED.parent_property_id
WHERE ROW(
    property_year.building_name, property_year.floor_area,
    property_year.address, property_year.occupancy,
    property_year.building_count, property_year.use_type,
    property_year.year_built, property_year.site_eui,
    property_year.water_intensity, property_year.energy_gap,
    property_year.water_gap, property_year.energy_months_short,
    property_year.water_months_short, property_year.parent_property_id
) IS DISTINCT FROM ROW(
    EXCLUDED.building_name, EXCLUDED.floor_area,
    EXCLUDED.address, EXCLUDED.occupancy,
    EXCLUDED.building_count, EXCLUDED.use_type,
    EXCLUDED.year_built, EXCLUDED.site_eui,
    EXCLUDED.water_intensity, EXCLUDED.energy_gap,
    EXCLUDED.water_gap, EXCLUDED.energy_months_short,
    EXCLUDED.water_months_short, EXCLUDED.parent_property_id
)
"#;

const RECOMPUTE_HAS_ISSUE: &str = r#"
UPDATE property_year SET has_issue = (
    lower(coalesce(energy_gap, '')) = 'possible issue'
    OR lower(coalesce(water_gap, '')) = 'possible issue'
    OR lower(coalesce(energy_months_short, '')) = 'possible issue'
    OR lower(coalesce(water_months_short, '')) = 'possible issue'
)
WHERE has_issue IS DISTINCT FROM (
    lower(coalesce(energy_gap, '')) = 'possible issue'
    OR lower(coalesce(water_gap, '')) = 'possible issue'
    OR lower(coalesce(energy_months_short, '')) = 'possible issue'
    OR lower(coalesce(water_months_short, '')) = 'possible issue'
)
"#;

const ENSURE_HAS_ISSUE_COLUMN: &str =
    "ALTER TABLE property_year ADD COLUMN IF NOT EXISTS has_issue BOOLEAN NOT NULL DEFAULT FALSE";

#[derive(Debug, Clone, Copy)]
pub struct MergeOutcome {
    /// Rows loaded into the staging table.
    pub staged: usize,
    /// Rows actually inserted or updated by the upsert. Zero on an
    /// idempotent rerun.
    pub committed: u64,
    /// Rows whose `has_issue` flag changed in the post-merge pass.
    pub reflagged: u64,
}

/// Load `records` into a fresh session-scoped staging table and upsert them
/// into `property_year`, then recompute issue flags — all in one
/// transaction. Rows absent from `records` are left untouched.
pub async fn merge(
    session: &mut DbSession,
    records: &[PropertyYearRecord],
) -> Result<MergeOutcome, StorageError> {
    if records.is_empty() {
        return Err(StorageError::EmptyBatch);
    }
    session.ensure_alive().await?;

    let mut tx = session.connection().begin().await?;

    // A prior run on a reused session may have left staging behind.
    sqlx::query("DROP TABLE IF EXISTS property_year_staging")
        .execute(&mut *tx)
        .await?;
    sqlx::query(CREATE_STAGING).execute(&mut *tx).await?;

    for chunk in records.chunks(MERGE_CHUNK_SIZE) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(STAGING_INSERT_PREFIX);
        builder.push_values(chunk, |mut row, record| {
            row.push_bind(record.property_id)
                .push_bind(&record.data_year)
                .push_bind(&record.building_name)
                .push_bind(&record.floor_area)
                .push_bind(&record.address)
                .push_bind(&record.occupancy)
                .push_bind(&record.building_count)
                .push_bind(&record.use_type)
                .push_bind(&record.year_built)
                .push_bind(&record.site_eui)
                .push_bind(&record.water_intensity)
                .push_bind(record.energy_gap.as_label())
                .push_bind(record.water_gap.as_label())
                .push_bind(record.energy_months_short.as_label())
                .push_bind(record.water_months_short.as_label())
                .push_bind(record.parent_property_id);
        });
        builder.build().execute(&mut *tx).await?;
    }

    let upserted = sqlx::query(MERGE_UPSERT).execute(&mut *tx).await?;
    let reflagged = recompute_flags_in_tx(&mut tx).await?;
    tx.commit().await?;

    info!(
        staged = records.len(),
        committed = upserted.rows_affected(),
        reflagged,
        "merge committed"
    );
    Ok(MergeOutcome {
        staged: records.len(),
        committed: upserted.rows_affected(),
        reflagged,
    })
}

async fn recompute_flags_in_tx(tx: &mut Transaction<'_, Postgres>) -> Result<u64, StorageError> {
    let done = sqlx::query(RECOMPUTE_HAS_ISSUE).execute(&mut **tx).await?;
    Ok(done.rows_affected())
}

/// Standalone issue-flagging pass: ensure the derived column and its partial
/// index exist, then recompute the flag over the full table. Safe to run any
/// number of times.
pub async fn reflag(session: &mut DbSession) -> Result<u64, StorageError> {
    if let Err(err) = session.execute_with_retry(ENSURE_HAS_ISSUE_COLUMN).await {
        if !is_duplicate_object(&err) {
            warn!(error = %err, "could not ensure has_issue column; continuing");
        }
    }
    let done = session.execute_with_retry(RECOMPUTE_HAS_ISSUE).await?;
    if let Err(err) = session.execute_with_retry(CREATE_ISSUE_INDEX).await {
        if !is_duplicate_object(&err) {
            warn!(error = %err, "could not ensure issue index; continuing");
        }
    }
    Ok(done.rows_affected())
}

#[derive(Debug, Clone)]
pub struct StoredReport {
    pub content_hash: String,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Archives each downloaded report payload at a timestamped, hash-addressed
/// path so a bad merge can be replayed from the exact bytes.
#[derive(Debug, Clone)]
pub struct ReportArchive {
    root: PathBuf,
}

impl ReportArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Store report bytes immutably via an atomic temp-file rename; an
    /// identical payload already on disk is detected by its hash path.
    pub async fn store_report(
        &self,
        fetched_at: DateTime<Utc>,
        bytes: &[u8],
    ) -> anyhow::Result<StoredReport> {
        let content_hash = Self::sha256_hex(bytes);
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        let absolute_path = self
            .root
            .join(stamp)
            .join(format!("report-{content_hash}.xml"));

        let parent = absolute_path
            .parent()
            .context("report path always has a parent")?;
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(StoredReport {
                content_hash,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp report file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp report file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp report file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredReport {
                content_hash,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp report {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}
