//! Postgres-backed job store.
//!
//! Jobs and processes live in `sync_jobs` / `sync_processes` (see
//! `migrations/0001_sync_engine.sql`). Statuses and pipeline/stage tags are stored
//! as text and parsed back through the core `FromStr` impls.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (foreign key violation) | `23503` | `Storage` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / Io / other | N/A | `Storage` |
//!
//! A status update that matches no row is diagnosed with a follow-up read: a
//! missing row becomes `*NotFound`, an existing row becomes the state machine's
//! `InvalidTransition`.
//!
//! ## Concurrency
//!
//! Multi-row writes (job + seed, fan-out, sweeps) run in a transaction. There is
//! no row versioning: one worker per pipeline is assumed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use pipesync_core::{
    Job, JobId, PipelineType, Process, ProcessId, Status, TenantId,
};

use super::{Affected, JobCounts, JobStore, RecordUpdate, StoreError};

/// DDL applied by [`PostgresJobStore::ensure_schema`].
pub const SCHEMA: &str = include_str!("../../migrations/0001_sync_engine.sql");

const JOB_COLUMNS: &str = "job_id, tenant_id, pipeline_type, status, retry_count, \
                           log_message, payload, created_at, updated_at";

const PROCESS_COLUMNS: &str = "process_id, job_id, tenant_id, pipeline_type, stage, status, \
                               retry_count, log_message, payload, created_at, updated_at";

/// Postgres-backed job store.
///
/// Uses the SQLx connection pool (thread-safe); cloning the store shares the pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create tables and indexes if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn fetch_job(&self, sql: &str, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_job", e))?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    /// Explain why a guarded status update matched no row.
    async fn diagnose_process(&self, process_id: ProcessId, next: Status) -> StoreError {
        let current = sqlx::query_scalar::<_, String>(
            "SELECT status FROM sync_processes WHERE process_id = $1",
        )
        .bind(process_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await;

        match current {
            Ok(Some(status)) => transition_error(&status, next),
            Ok(None) => StoreError::ProcessNotFound(process_id),
            Err(e) => map_sqlx_error("diagnose_process", e),
        }
    }

    async fn diagnose_job(&self, job_id: JobId, next: Status) -> StoreError {
        let current =
            sqlx::query_scalar::<_, String>("SELECT status FROM sync_jobs WHERE job_id = $1")
                .bind(job_id.as_uuid())
                .fetch_optional(&*self.pool)
                .await;

        match current {
            Ok(Some(status)) => transition_error(&status, next),
            Ok(None) => StoreError::JobNotFound(job_id),
            Err(e) => map_sqlx_error("diagnose_job", e),
        }
    }
}

fn transition_error(current: &str, next: Status) -> StoreError {
    match current.parse::<Status>() {
        Ok(status) => match status.check_transition(next) {
            Err(e) => e.into(),
            Ok(()) => StoreError::Storage(format!(
                "row changed concurrently ({status} -> {next})"
            )),
        },
        Err(e) => e.into(),
    }
}

fn predecessors(next: Option<Status>) -> Vec<String> {
    next.map(|s| {
        s.allowed_predecessors()
            .iter()
            .map(|p| p.as_str().to_string())
            .collect()
    })
    .unwrap_or_default()
}

async fn insert_process(
    tx: &mut Transaction<'_, Postgres>,
    process: &Process,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO sync_processes (
            process_id, job_id, tenant_id, pipeline_type, stage, status,
            retry_count, log_message, payload, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(process.id.as_uuid())
    .bind(process.job_id.as_uuid())
    .bind(process.tenant_id.as_uuid())
    .bind(process.pipeline.as_str())
    .bind(&process.stage)
    .bind(process.status.as_str())
    .bind(process.retry_count as i32)
    .bind(&process.log_message)
    .bind(&process.payload)
    .bind(process.created_at)
    .bind(process.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_process", e))?;
    Ok(())
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job, seed), fields(job_id = %job.id, tenant_id = %job.tenant_id), err)]
    async fn create_job(&self, job: Job, seed: Process) -> Result<(Job, Process), StoreError> {
        if seed.job_id != job.id || seed.tenant_id != job.tenant_id {
            return Err(StoreError::TenantIsolation(format!(
                "seed process {} does not belong to job {}",
                seed.id, job.id
            )));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query(
            r#"
            INSERT INTO sync_jobs (
                job_id, tenant_id, pipeline_type, status, retry_count,
                log_message, payload, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.tenant_id.as_uuid())
        .bind(job.pipeline.as_str())
        .bind(job.status.as_str())
        .bind(job.retry_count as i32)
        .bind(&job.log_message)
        .bind(&job.payload)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;

        insert_process(&mut tx, &seed).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok((job, seed))
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE job_id = $1");
        self.fetch_job(&sql, job_id).await
    }

    async fn get_process(&self, process_id: ProcessId) -> Result<Option<Process>, StoreError> {
        let sql = format!("SELECT {PROCESS_COLUMNS} FROM sync_processes WHERE process_id = $1");
        let row = sqlx::query(&sql)
            .bind(process_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_process", e))?;
        row.map(|r| process_from_row(&r)).transpose()
    }

    #[instrument(skip(self), fields(pipeline = %pipeline), err)]
    async fn oldest_active_job(&self, pipeline: PipelineType) -> Result<Option<Job>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs \
             WHERE pipeline_type = $1 AND status IN ('pending', 'processing') \
             ORDER BY created_at ASC, seq ASC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(pipeline.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("oldest_active_job", e))?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    async fn oldest_pending_process(&self, job_id: JobId) -> Result<Option<Process>, StoreError> {
        let sql = format!(
            "SELECT {PROCESS_COLUMNS} FROM sync_processes \
             WHERE job_id = $1 AND status = 'pending' \
             ORDER BY updated_at ASC, seq ASC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("oldest_pending_process", e))?;
        row.map(|r| process_from_row(&r)).transpose()
    }

    async fn list_processes(&self, job_id: JobId) -> Result<Vec<Process>, StoreError> {
        let sql = format!(
            "SELECT {PROCESS_COLUMNS} FROM sync_processes \
             WHERE job_id = $1 ORDER BY created_at ASC, seq ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_processes", e))?;
        rows.iter().map(process_from_row).collect()
    }

    #[instrument(skip(self, processes), fields(count = processes.len()), err)]
    async fn insert_processes(&self, processes: Vec<Process>) -> Result<(), StoreError> {
        if processes.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        for process in &processes {
            let owner = sqlx::query("SELECT tenant_id FROM sync_jobs WHERE job_id = $1")
                .bind(process.job_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("lookup_job_tenant", e))?
                .ok_or(StoreError::JobNotFound(process.job_id))?;
            let owner: uuid::Uuid = owner
                .try_get("tenant_id")
                .map_err(|e| map_sqlx_error("lookup_job_tenant", e))?;
            if owner != *process.tenant_id.as_uuid() {
                return Err(StoreError::TenantIsolation(format!(
                    "process {} tenant does not match job {}",
                    process.id, process.job_id
                )));
            }
            insert_process(&mut tx, process).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(process_id = %process_id, operation = tracing::field::Empty), err)]
    async fn begin_process_attempt(
        &self,
        process_id: ProcessId,
        now: DateTime<Utc>,
    ) -> Result<Process, StoreError> {
        let span = Span::current();
        span.record("operation", "begin_process_attempt");

        let sql = format!(
            "UPDATE sync_processes \
             SET status = 'processing', retry_count = retry_count + 1, updated_at = $2 \
             WHERE process_id = $1 AND status = ANY($3) \
             RETURNING {PROCESS_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(process_id.as_uuid())
            .bind(now)
            .bind(predecessors(Some(Status::Processing)))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("begin_process_attempt", e))?;

        match row {
            Some(row) => process_from_row(&row),
            None => Err(self.diagnose_process(process_id, Status::Processing).await),
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn record_job_attempt(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let sql = format!(
            "UPDATE sync_jobs SET retry_count = retry_count + 1, updated_at = $2 \
             WHERE job_id = $1 RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("record_job_attempt", e))?
            .ok_or(StoreError::JobNotFound(job_id))?;
        job_from_row(&row)
    }

    #[instrument(skip(self, update), fields(process_id = %process_id, status = ?update.status), err)]
    async fn update_process(
        &self,
        process_id: ProcessId,
        update: RecordUpdate,
        now: DateTime<Utc>,
    ) -> Result<Process, StoreError> {
        let sql = format!(
            "UPDATE sync_processes SET \
                status = COALESCE($2, status), \
                log_message = COALESCE($3, log_message), \
                payload = COALESCE($4, payload), \
                updated_at = $5 \
             WHERE process_id = $1 AND ($2::text IS NULL OR status = ANY($6)) \
             RETURNING {PROCESS_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(process_id.as_uuid())
            .bind(update.status.map(|s| s.as_str()))
            .bind(&update.log_message)
            .bind(&update.payload)
            .bind(now)
            .bind(predecessors(update.status))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_process", e))?;

        match (row, update.status) {
            (Some(row), _) => process_from_row(&row),
            (None, Some(next)) => Err(self.diagnose_process(process_id, next).await),
            (None, None) => Err(StoreError::ProcessNotFound(process_id)),
        }
    }

    #[instrument(skip(self, update), fields(job_id = %job_id, status = ?update.status), err)]
    async fn update_job(
        &self,
        job_id: JobId,
        update: RecordUpdate,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let sql = format!(
            "UPDATE sync_jobs SET \
                status = COALESCE($2, status), \
                log_message = COALESCE($3, log_message), \
                payload = COALESCE($4, payload), \
                updated_at = $5 \
             WHERE job_id = $1 AND ($2::text IS NULL OR status = ANY($6)) \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .bind(update.status.map(|s| s.as_str()))
            .bind(&update.log_message)
            .bind(&update.payload)
            .bind(now)
            .bind(predecessors(update.status))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_job", e))?;

        match (row, update.status) {
            (Some(row), _) => job_from_row(&row),
            (None, Some(next)) => Err(self.diagnose_job(job_id, next).await),
            (None, None) => Err(StoreError::JobNotFound(job_id)),
        }
    }

    #[instrument(skip(self, message), fields(cutoff = %cutoff, operation = tracing::field::Empty), err)]
    async fn reap_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        message: &str,
    ) -> Result<Affected, StoreError> {
        let span = Span::current();
        span.record("operation", "reap_stale");

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let jobs = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'failed', retry_count = retry_count + 1, log_message = $3, updated_at = $2
            WHERE status = 'processing' AND updated_at <= $1
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .bind(message)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("reap_jobs", e))?
        .rows_affected();

        let processes = sqlx::query(
            r#"
            UPDATE sync_processes
            SET status = 'failed', retry_count = retry_count + 1, log_message = $3, updated_at = $2
            WHERE status = 'processing' AND updated_at <= $1
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .bind(message)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("reap_processes", e))?
        .rows_affected();

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(Affected {
            jobs: jobs as usize,
            processes: processes as usize,
        })
    }

    #[instrument(skip(self, message), fields(tenant_id = %tenant_id, pipeline = %pipeline), err)]
    async fn fail_active(
        &self,
        tenant_id: TenantId,
        pipeline: PipelineType,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Affected, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let jobs = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'failed', log_message = $3, updated_at = $4
            WHERE tenant_id = $1 AND pipeline_type = $2 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(pipeline.as_str())
        .bind(message)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("fail_active_jobs", e))?
        .rows_affected();

        let processes = sqlx::query(
            r#"
            UPDATE sync_processes
            SET status = 'failed', log_message = $3, updated_at = $4
            WHERE tenant_id = $1 AND pipeline_type = $2 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(pipeline.as_str())
        .bind(message)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("fail_active_processes", e))?
        .rows_affected();

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(Affected {
            jobs: jobs as usize,
            processes: processes as usize,
        })
    }

    async fn latest_job(
        &self,
        tenant_id: TenantId,
        pipeline: PipelineType,
    ) -> Result<Option<Job>, StoreError> {
        let active_sql = format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs \
             WHERE tenant_id = $1 AND pipeline_type = $2 AND status IN ('pending', 'processing') \
             ORDER BY created_at ASC, seq ASC LIMIT 1"
        );
        let recent_sql = format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs \
             WHERE tenant_id = $1 AND pipeline_type = $2 \
             ORDER BY created_at DESC, seq DESC LIMIT 1"
        );

        for sql in [active_sql, recent_sql] {
            let row = sqlx::query(&sql)
                .bind(tenant_id.as_uuid())
                .bind(pipeline.as_str())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("latest_job", e))?;
            if let Some(row) = row {
                return job_from_row(&row).map(Some);
            }
        }
        Ok(None)
    }

    async fn job_counts(
        &self,
        tenant_id: TenantId,
        pipeline: PipelineType,
    ) -> Result<JobCounts, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS total
            FROM sync_jobs
            WHERE tenant_id = $1 AND pipeline_type = $2
            GROUP BY status
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(pipeline.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("job_counts", e))?;

        let mut counts = JobCounts::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("job_counts", e))?;
            let total: i64 = row
                .try_get("total")
                .map_err(|e| map_sqlx_error("job_counts", e))?;
            let total = total.max(0) as usize;
            match status.parse::<Status>()? {
                Status::Pending => counts.pending = total,
                Status::Processing => counts.processing = total,
                Status::Completed => counts.completed = total,
                Status::Failed => counts.failed = total,
            }
        }
        Ok(counts)
    }
}

/// Map SQLx errors to store errors.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::AlreadyExists(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row mapping

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, StoreError> {
    let map = |e| map_sqlx_error("decode_job", e);
    let pipeline: String = row.try_get("pipeline_type").map_err(map)?;
    let status: String = row.try_get("status").map_err(map)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(map)?;

    Ok(Job {
        id: JobId::from_uuid(row.try_get("job_id").map_err(map)?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(map)?),
        pipeline: pipeline.parse()?,
        status: status.parse()?,
        retry_count: retry_count.max(0) as u32,
        log_message: row.try_get("log_message").map_err(map)?,
        payload: row.try_get("payload").map_err(map)?,
        created_at: row.try_get("created_at").map_err(map)?,
        updated_at: row.try_get("updated_at").map_err(map)?,
    })
}

fn process_from_row(row: &sqlx::postgres::PgRow) -> Result<Process, StoreError> {
    let map = |e| map_sqlx_error("decode_process", e);
    let pipeline: String = row.try_get("pipeline_type").map_err(map)?;
    let status: String = row.try_get("status").map_err(map)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(map)?;

    Ok(Process {
        id: ProcessId::from_uuid(row.try_get("process_id").map_err(map)?),
        job_id: JobId::from_uuid(row.try_get("job_id").map_err(map)?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(map)?),
        pipeline: pipeline.parse()?,
        stage: row.try_get("stage").map_err(map)?,
        status: status.parse()?,
        retry_count: retry_count.max(0) as u32,
        log_message: row.try_get("log_message").map_err(map)?,
        payload: row.try_get("payload").map_err(map)?,
        created_at: row.try_get("created_at").map_err(map)?,
        updated_at: row.try_get("updated_at").map_err(map)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predecessors_follow_the_state_machine() {
        assert_eq!(predecessors(None), Vec::<String>::new());
        assert_eq!(predecessors(Some(Status::Processing)), vec!["pending".to_string()]);
        assert_eq!(
            predecessors(Some(Status::Failed)),
            vec!["pending".to_string(), "processing".to_string(), "failed".to_string()]
        );
    }

    #[test]
    fn transition_error_reports_invalid_move() {
        let err = transition_error("completed", Status::Processing);
        assert!(matches!(err, StoreError::Domain(_)));

        let err = transition_error("bogus", Status::Processing);
        assert!(matches!(err, StoreError::Domain(_)));
    }

    #[test]
    fn schema_declares_both_tables() {
        assert!(SCHEMA.contains("CREATE TABLE IF NOT EXISTS sync_jobs"));
        assert!(SCHEMA.contains("CREATE TABLE IF NOT EXISTS sync_processes"));
        assert!(SCHEMA.contains("CREATE TABLE IF NOT EXISTS sync_tenants"));
    }
}
