use async_trait::async_trait;
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{entities::ExecutionHistory, repositories::ExecutionHistoryRepository};
use sqlx::{Row, SqlitePool};

use crate::database::mapping::MappingHelpers;

pub(crate) const HISTORY_COLUMNS: &str = "id, execution_uuid, hostname, worker_id, queue, job_definition_id, \
     job_instance_id, token_id, shell, exit_status, term_signal, started_at, finished_at, created_at";

pub(crate) fn row_to_history(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<ExecutionHistory> {
    Ok(ExecutionHistory {
        id: row.try_get("id")?,
        execution_uuid: MappingHelpers::parse_uuid(row, "execution_uuid")?,
        hostname: row.try_get("hostname")?,
        worker_id: row.try_get("worker_id")?,
        queue: row.try_get("queue")?,
        job_definition_id: row.try_get("job_definition_id")?,
        job_instance_id: row.try_get("job_instance_id")?,
        token_id: row.try_get("token_id")?,
        shell: row.try_get("shell")?,
        exit_status: row.try_get("exit_status")?,
        term_signal: row.try_get("term_signal")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        created_at: row.try_get("created_at")?,
    })
}

pub struct SqliteExecutionHistoryRepository {
    pool: SqlitePool,
}

impl SqliteExecutionHistoryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExecutionHistoryRepository for SqliteExecutionHistoryRepository {
    async fn find_by_token(&self, token_id: i64) -> SchedulerResult<Vec<ExecutionHistory>> {
        let rows = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM execution_histories WHERE token_id = $1 ORDER BY id"
        ))
        .bind(token_id)
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        rows.iter().map(row_to_history).collect()
    }

    async fn find_by_instance(&self, job_instance_id: i64) -> SchedulerResult<Vec<ExecutionHistory>> {
        let rows = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM execution_histories WHERE job_instance_id = $1 ORDER BY id"
        ))
        .bind(job_instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        rows.iter().map(row_to_history).collect()
    }
}
