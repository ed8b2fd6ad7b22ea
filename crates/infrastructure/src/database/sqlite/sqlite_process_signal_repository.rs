use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{entities::ProcessSignal, repositories::ProcessSignalRepository};
use sqlx::{Row, SqlitePool};
use tracing::debug;

const SIGNAL_COLUMNS: &str = "id, hostname, pid, number, message, execution_id, started_at, created_at";

pub struct SqliteProcessSignalRepository {
    pool: SqlitePool,
}

impl SqliteProcessSignalRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_signal(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<ProcessSignal> {
        Ok(ProcessSignal {
            id: row.try_get("id")?,
            hostname: row.try_get("hostname")?,
            pid: row.try_get("pid")?,
            number: row.try_get("number")?,
            message: row.try_get("message")?,
            execution_id: row.try_get("execution_id")?,
            started_at: row.try_get("started_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl ProcessSignalRepository for SqliteProcessSignalRepository {
    async fn create(&self, signal: &ProcessSignal) -> SchedulerResult<ProcessSignal> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO process_signals (hostname, pid, number, message, execution_id, started_at, created_at)
            VALUES ($1, $2, $3, $4, $5, NULL, $6)
            RETURNING {SIGNAL_COLUMNS}
            "#
        ))
        .bind(&signal.hostname)
        .bind(signal.pid)
        .bind(signal.number)
        .bind(&signal.message)
        .bind(signal.execution_id)
        .bind(signal.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        let created = Self::row_to_signal(&row)?;
        debug!(
            "创建进程信号: ID {}, {}:{} 信号 {}",
            created.id, created.hostname, created.pid, created.number
        );
        Ok(created)
    }

    async fn find_undelivered(&self, hostname: &str) -> SchedulerResult<Vec<ProcessSignal>> {
        let rows = sqlx::query(&format!(
            "SELECT {SIGNAL_COLUMNS} FROM process_signals WHERE hostname = $1 AND started_at IS NULL ORDER BY id"
        ))
        .bind(hostname)
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_signal).collect()
    }

    async fn find_by_execution(&self, execution_id: i64) -> SchedulerResult<Vec<ProcessSignal>> {
        let rows = sqlx::query(&format!(
            "SELECT {SIGNAL_COLUMNS} FROM process_signals WHERE execution_id = $1 ORDER BY id"
        ))
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_signal).collect()
    }

    async fn mark_delivered(&self, id: i64, now: DateTime<Utc>) -> SchedulerResult<bool> {
        let result = sqlx::query("UPDATE process_signals SET started_at = $2 WHERE id = $1 AND started_at IS NULL")
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected() > 0)
    }
}
