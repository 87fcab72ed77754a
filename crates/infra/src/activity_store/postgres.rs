//! Postgres-backed activity store.
//!
//! Every conditional write is a single `UPDATE ... WHERE <current> = <expected>`
//! statement; `rows_affected() == 1` means the caller won. Job + unit seeding
//! runs in one transaction. A partial unique index on `fingerprint` (for jobs
//! that are not `failed`) serializes concurrent identical submissions.
//!
//! The [`ActivityStore`] trait is synchronous. Calls are bridged onto the
//! runtime handle captured at construction, so callers must be on a thread
//! that is allowed to block (worker threads, `spawn_blocking`).

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use uuid::Uuid;

use cubeflow_channels::DeadLetterRecord;
use cubeflow_core::{
    ControlEntry, ControlKey, CubeDefinition, CubeMetadata, DeadLetterId, Fingerprint, Job, JobId,
    JobStatus, UnitCounts, UnitId, UnitStatus, WorkUnit,
};

use super::store::{
    ActivityStore, DeadLetterEntry, JobProgress, StoreError, TransitionUpdate, check_job_transition,
    check_unit_transition,
};

/// Schema statements, applied in order by [`PostgresActivityStore::ensure_schema`].
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS cube_jobs (
        job_id       UUID PRIMARY KEY,
        fingerprint  UUID NOT NULL,
        definition   JSONB NOT NULL,
        status       TEXT NOT NULL,
        created_at   TIMESTAMPTZ NOT NULL,
        updated_at   TIMESTAMPTZ NOT NULL,
        started_at   TIMESTAMPTZ,
        finished_at  TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS cube_jobs_active_fingerprint
        ON cube_jobs (fingerprint) WHERE status <> 'failed'
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS work_units (
        unit_id       UUID PRIMARY KEY,
        job_id        UUID NOT NULL REFERENCES cube_jobs (job_id),
        tile_id       TEXT NOT NULL,
        period_id     TEXT NOT NULL,
        status        TEXT NOT NULL,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        last_error    TEXT,
        updated_at    TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS work_units_job_id ON work_units (job_id)"#,
    r#"
    CREATE TABLE IF NOT EXISTS control_entries (
        cube        TEXT NOT NULL,
        tile_id     TEXT NOT NULL,
        period_id   TEXT NOT NULL,
        merged      JSONB NOT NULL,
        version     BIGINT NOT NULL,
        updated_at  TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (cube, tile_id, period_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cube_metadata (
        job_id    UUID PRIMARY KEY REFERENCES cube_jobs (job_id),
        metadata  JSONB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dead_letters (
        dead_letter_id UUID PRIMARY KEY,
        job_id         UUID NOT NULL,
        unit_id        UUID NOT NULL,
        record         JSONB NOT NULL,
        recorded_at    TIMESTAMPTZ NOT NULL,
        redriven_at    TIMESTAMPTZ
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS dead_letters_job_id ON dead_letters (job_id)"#,
];

const JOB_COLUMNS: &str =
    "job_id, fingerprint, definition, status, created_at, updated_at, started_at, finished_at";
const UNIT_COLUMNS: &str =
    "unit_id, job_id, tile_id, period_id, status, attempt_count, last_error, updated_at";
const DEAD_LETTER_COLUMNS: &str = "record, recorded_at, redriven_at";

#[derive(Debug, Clone)]
pub struct PostgresActivityStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresActivityStore {
    /// Wrap a pool. Must be called from within a tokio runtime.
    pub fn new(pool: PgPool) -> Result<Self, StoreError> {
        let runtime = Handle::try_current().map_err(|_| {
            StoreError::Storage(
                "PostgresActivityStore must be created inside a tokio runtime".to_string(),
            )
        })?;
        Ok(Self {
            pool: Arc::new(pool),
            runtime,
        })
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    pub async fn insert_job(&self, job: &Job, units: &[WorkUnit]) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin transaction", e))?;

        sqlx::query(
            r#"
            INSERT INTO cube_jobs (job_id, fingerprint, definition, status, created_at, updated_at, started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(*job.id.as_uuid())
        .bind(*job.fingerprint.as_uuid())
        .bind(Json(&job.definition))
        .bind(job.status.as_str())
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert job", e))?;

        for unit in units {
            sqlx::query(
                r#"
                INSERT INTO work_units (unit_id, job_id, tile_id, period_id, status, attempt_count, last_error, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(*unit.id.as_uuid())
            .bind(*unit.job_id.as_uuid())
            .bind(unit.tile_id.as_str())
            .bind(unit.period_id.as_str())
            .bind(unit.status.as_str())
            .bind(unit.attempt_count as i32)
            .bind(unit.last_error.as_deref())
            .bind(unit.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert unit", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit transaction", e))
    }

    pub async fn fetch_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM cube_jobs WHERE job_id = $1");
        let row = sqlx::query(&sql)
            .bind(*job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    pub async fn fetch_active_by_fingerprint(&self, fingerprint: Fingerprint) -> Result<Option<Job>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM cube_jobs WHERE fingerprint = $1 AND status <> 'failed' \
             ORDER BY created_at DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(*fingerprint.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch job by fingerprint", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    pub async fn fetch_jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM cube_jobs WHERE ($1::TEXT IS NULL OR status = $1) \
             ORDER BY created_at DESC, job_id DESC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(status.map(|s| s.as_str()))
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list jobs", e))?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn fetch_unit(&self, unit_id: UnitId) -> Result<Option<WorkUnit>, StoreError> {
        let sql = format!("SELECT {UNIT_COLUMNS} FROM work_units WHERE unit_id = $1");
        let row = sqlx::query(&sql)
            .bind(*unit_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch unit", e))?;
        row.as_ref().map(unit_from_row).transpose()
    }

    pub async fn fetch_units(&self, job_id: JobId) -> Result<Vec<WorkUnit>, StoreError> {
        let sql = format!(
            "SELECT {UNIT_COLUMNS} FROM work_units WHERE job_id = $1 ORDER BY tile_id, period_id"
        );
        let rows = sqlx::query(&sql)
            .bind(*job_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list units", e))?;
        rows.iter().map(unit_from_row).collect()
    }

    pub async fn update_unit_status(
        &self,
        unit_id: UnitId,
        expected: UnitStatus,
        next: UnitStatus,
        update: TransitionUpdate,
    ) -> Result<bool, StoreError> {
        check_unit_transition(expected, next)?;

        let result = sqlx::query(
            r#"
            UPDATE work_units
               SET status = $3,
                   attempt_count = COALESCE($4, attempt_count),
                   last_error = COALESCE($5, last_error),
                   updated_at = now()
             WHERE unit_id = $1 AND status = $2
            "#,
        )
        .bind(*unit_id.as_uuid())
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(update.attempt_count.map(|n| n as i32))
        .bind(update.last_error)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("transition unit", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.fetch_unit(unit_id).await?.is_none() {
            return Err(StoreError::NotFound(format!("unit {unit_id}")));
        }
        Ok(false)
    }

    pub async fn fetch_progress(&self, job_id: JobId) -> Result<JobProgress, StoreError> {
        let rows = sqlx::query(
            r#"SELECT status, COUNT(*) AS n FROM work_units WHERE job_id = $1 GROUP BY status"#,
        )
        .bind(*job_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("job state", e))?;

        if rows.is_empty() {
            return Err(StoreError::NotFound(format!("job {job_id}")));
        }

        let mut counts = UnitCounts::default();
        for row in &rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("job state", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("job state", e))?;
            counts.add_n(parse_unit_status(&status)?, n as usize);
        }
        Ok(JobProgress {
            job_id,
            counts,
            status: counts.derive_status(),
        })
    }

    pub async fn update_job_status(
        &self,
        job_id: JobId,
        expected: JobStatus,
        next: JobStatus,
    ) -> Result<bool, StoreError> {
        check_job_transition(expected, next)?;

        let result = sqlx::query(
            r#"
            UPDATE cube_jobs
               SET status = $3,
                   updated_at = $4,
                   started_at = CASE WHEN $3 <> 'pending' THEN COALESCE(started_at, $4) ELSE started_at END,
                   finished_at = CASE WHEN $5 THEN $4 ELSE NULL END
             WHERE job_id = $1 AND status = $2
            "#,
        )
        .bind(*job_id.as_uuid())
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(Utc::now())
        .bind(next.is_terminal())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("transition job", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.fetch_job(job_id).await?.is_none() {
            return Err(StoreError::NotFound(format!("job {job_id}")));
        }
        Ok(false)
    }

    pub async fn fetch_control(&self, key: &ControlKey) -> Result<Option<ControlEntry>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT merged, version, updated_at FROM control_entries
             WHERE cube = $1 AND tile_id = $2 AND period_id = $3
            "#,
        )
        .bind(&key.cube)
        .bind(key.tile_id.as_str())
        .bind(key.period_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch control", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let merged: Json<BTreeSet<String>> =
            row.try_get("merged").map_err(|e| map_sqlx_error("fetch control", e))?;
        let version: i64 = row.try_get("version").map_err(|e| map_sqlx_error("fetch control", e))?;
        let updated_at: DateTime<Utc> =
            row.try_get("updated_at").map_err(|e| map_sqlx_error("fetch control", e))?;

        Ok(Some(ControlEntry {
            key: key.clone(),
            merged: merged.0,
            version: version as u64,
            updated_at: Some(updated_at),
        }))
    }

    pub async fn compare_and_put_control(&self, entry: &ControlEntry, expected_version: u64) -> Result<bool, StoreError> {
        let key = &entry.key;
        let result = if expected_version == 0 {
            sqlx::query(
                r#"
                INSERT INTO control_entries (cube, tile_id, period_id, merged, version, updated_at)
                VALUES ($1, $2, $3, $4, 1, now())
                ON CONFLICT (cube, tile_id, period_id) DO NOTHING
                "#,
            )
            .bind(&key.cube)
            .bind(key.tile_id.as_str())
            .bind(key.period_id.as_str())
            .bind(Json(&entry.merged))
            .execute(&*self.pool)
            .await
        } else {
            sqlx::query(
                r#"
                UPDATE control_entries
                   SET merged = $4, version = $5 + 1, updated_at = now()
                 WHERE cube = $1 AND tile_id = $2 AND period_id = $3 AND version = $5
                "#,
            )
            .bind(&key.cube)
            .bind(key.tile_id.as_str())
            .bind(key.period_id.as_str())
            .bind(Json(&entry.merged))
            .bind(expected_version as i64)
            .execute(&*self.pool)
            .await
        }
        .map_err(|e| map_sqlx_error("swap control", e))?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn put_cube_metadata(&self, metadata: &CubeMetadata) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO cube_metadata (job_id, metadata) VALUES ($1, $2)
            ON CONFLICT (job_id) DO UPDATE SET metadata = EXCLUDED.metadata
            "#,
        )
        .bind(*metadata.job_id.as_uuid())
        .bind(Json(metadata))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record cube metadata", e))?;
        Ok(())
    }

    pub async fn fetch_cube_metadata(&self, job_id: JobId) -> Result<Option<CubeMetadata>, StoreError> {
        let row = sqlx::query(r#"SELECT metadata FROM cube_metadata WHERE job_id = $1"#)
            .bind(*job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch cube metadata", e))?;
        row.map(|r| {
            r.try_get::<Json<CubeMetadata>, _>("metadata")
                .map(|j| j.0)
                .map_err(|e| map_sqlx_error("fetch cube metadata", e))
        })
        .transpose()
    }

    pub async fn insert_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO dead_letters (dead_letter_id, job_id, unit_id, record, recorded_at, redriven_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (dead_letter_id) DO NOTHING
            "#,
        )
        .bind(*entry.id.as_uuid())
        .bind(*entry.job_id.as_uuid())
        .bind(*entry.unit_id.as_uuid())
        .bind(Json(&entry.record))
        .bind(entry.recorded_at)
        .bind(entry.redriven_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record dead letter", e))?;
        Ok(())
    }

    pub async fn fetch_dead_letter(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, StoreError> {
        let sql = format!("SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE dead_letter_id = $1");
        let row = sqlx::query(&sql)
            .bind(*id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch dead letter", e))?;
        row.as_ref().map(dead_letter_from_row).transpose()
    }

    pub async fn fetch_dead_letters(&self, job_id: Option<JobId>, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let sql = format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE ($1::UUID IS NULL OR job_id = $1) \
             ORDER BY recorded_at DESC, dead_letter_id DESC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(job_id.map(Uuid::from))
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list dead letters", e))?;
        rows.iter().map(dead_letter_from_row).collect()
    }

    pub async fn set_dead_letter_redriven(&self, id: DeadLetterId, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"UPDATE dead_letters SET redriven_at = $2 WHERE dead_letter_id = $1 AND redriven_at IS NULL"#,
        )
        .bind(*id.as_uuid())
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark dead letter redriven", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.fetch_dead_letter(id).await?.is_none() {
            return Err(StoreError::NotFound(format!("dead letter {id}")));
        }
        Ok(false)
    }
}

impl ActivityStore for PostgresActivityStore {
    fn create_job(&self, job: &Job, units: &[WorkUnit]) -> Result<(), StoreError> {
        self.block_on(self.insert_job(job, units))
    }

    fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        self.block_on(self.fetch_job(job_id))
    }

    fn find_active_by_fingerprint(&self, fingerprint: Fingerprint) -> Result<Option<Job>, StoreError> {
        self.block_on(self.fetch_active_by_fingerprint(fingerprint))
    }

    fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.block_on(self.fetch_jobs(status, limit))
    }

    fn get_unit(&self, unit_id: UnitId) -> Result<Option<WorkUnit>, StoreError> {
        self.block_on(self.fetch_unit(unit_id))
    }

    fn list_units(&self, job_id: JobId) -> Result<Vec<WorkUnit>, StoreError> {
        self.block_on(self.fetch_units(job_id))
    }

    fn transition(
        &self,
        unit_id: UnitId,
        expected: UnitStatus,
        next: UnitStatus,
        update: TransitionUpdate,
    ) -> Result<bool, StoreError> {
        self.block_on(self.update_unit_status(unit_id, expected, next, update))
    }

    fn job_state(&self, job_id: JobId) -> Result<JobProgress, StoreError> {
        self.block_on(self.fetch_progress(job_id))
    }

    fn transition_job(&self, job_id: JobId, expected: JobStatus, next: JobStatus) -> Result<bool, StoreError> {
        self.block_on(self.update_job_status(job_id, expected, next))
    }

    fn control(&self, key: &ControlKey) -> Result<Option<ControlEntry>, StoreError> {
        self.block_on(self.fetch_control(key))
    }

    fn swap_control(&self, entry: &ControlEntry, expected_version: u64) -> Result<bool, StoreError> {
        self.block_on(self.compare_and_put_control(entry, expected_version))
    }

    fn record_cube_metadata(&self, metadata: &CubeMetadata) -> Result<(), StoreError> {
        self.block_on(self.put_cube_metadata(metadata))
    }

    fn cube_metadata(&self, job_id: JobId) -> Result<Option<CubeMetadata>, StoreError> {
        self.block_on(self.fetch_cube_metadata(job_id))
    }

    fn record_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), StoreError> {
        self.block_on(self.insert_dead_letter(entry))
    }

    fn get_dead_letter(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, StoreError> {
        self.block_on(self.fetch_dead_letter(id))
    }

    fn list_dead_letters(&self, job_id: Option<JobId>, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError> {
        self.block_on(self.fetch_dead_letters(job_id, limit))
    }

    fn mark_dead_letter_redriven(&self, id: DeadLetterId, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.block_on(self.set_dead_letter_redriven(id, at))
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let get_err = |e| map_sqlx_error("decode job", e);
    let definition: Json<CubeDefinition> = row.try_get("definition").map_err(get_err)?;
    let status: String = row.try_get("status").map_err(get_err)?;

    Ok(Job {
        id: JobId::from_uuid(row.try_get("job_id").map_err(get_err)?),
        fingerprint: Fingerprint::from_uuid(row.try_get("fingerprint").map_err(get_err)?),
        definition: definition.0,
        status: status
            .parse()
            .map_err(|e: cubeflow_core::DomainError| StoreError::Serialization(e.to_string()))?,
        created_at: row.try_get("created_at").map_err(get_err)?,
        updated_at: row.try_get("updated_at").map_err(get_err)?,
        started_at: row.try_get("started_at").map_err(get_err)?,
        finished_at: row.try_get("finished_at").map_err(get_err)?,
    })
}

fn unit_from_row(row: &PgRow) -> Result<WorkUnit, StoreError> {
    let get_err = |e| map_sqlx_error("decode unit", e);
    let tile: String = row.try_get("tile_id").map_err(get_err)?;
    let period: String = row.try_get("period_id").map_err(get_err)?;
    let status: String = row.try_get("status").map_err(get_err)?;
    let attempts: i32 = row.try_get("attempt_count").map_err(get_err)?;

    Ok(WorkUnit {
        id: UnitId::from_uuid(row.try_get("unit_id").map_err(get_err)?),
        job_id: JobId::from_uuid(row.try_get("job_id").map_err(get_err)?),
        tile_id: tile.parse().map_err(|e: cubeflow_core::DomainError| StoreError::Serialization(e.to_string()))?,
        period_id: period.parse().map_err(|e: cubeflow_core::DomainError| StoreError::Serialization(e.to_string()))?,
        status: parse_unit_status(&status)?,
        attempt_count: attempts.max(0) as u32,
        last_error: row.try_get("last_error").map_err(get_err)?,
        updated_at: row.try_get("updated_at").map_err(get_err)?,
    })
}

fn dead_letter_from_row(row: &PgRow) -> Result<DeadLetterEntry, StoreError> {
    let get_err = |e| map_sqlx_error("decode dead letter", e);
    let record: Json<DeadLetterRecord> = row.try_get("record").map_err(get_err)?;
    let mut entry = DeadLetterEntry::new(record.0, row.try_get("recorded_at").map_err(get_err)?);
    entry.redriven_at = row.try_get("redriven_at").map_err(get_err)?;
    Ok(entry)
}

fn parse_unit_status(raw: &str) -> Result<UnitStatus, StoreError> {
    raw.parse()
        .map_err(|e: cubeflow_core::DomainError| StoreError::Serialization(e.to_string()))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Unique violation
                Some("23505") => StoreError::Conflict(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => StoreError::Storage(format!("connection pool closed in {operation}")),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(format!("decode error in {operation}: {err}"))
        }
        _ => StoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}
