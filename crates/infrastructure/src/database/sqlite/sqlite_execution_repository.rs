use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    entities::{Execution, ExecutionHistory},
    repositories::ExecutionRepository,
};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, warn};

use super::sqlite_execution_history_repository::{row_to_history, HISTORY_COLUMNS};
use crate::database::mapping::MappingHelpers;

const EXECUTION_COLUMNS: &str = "id, uuid, job_definition_id, job_definition_version, job_instance_id, token_id, \
     queue, shell, context, pid, output, exit_status, term_signal, hostname, worker_id, claimed_at, started_at, \
     finished_at, mailed_at, created_at, updated_at";

pub struct SqliteExecutionRepository {
    pool: SqlitePool,
}

impl SqliteExecutionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_execution(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<Execution> {
        Ok(Execution {
            id: row.try_get("id")?,
            uuid: MappingHelpers::parse_uuid(row, "uuid")?,
            job_definition_id: row.try_get("job_definition_id")?,
            job_definition_version: row.try_get("job_definition_version")?,
            job_instance_id: row.try_get("job_instance_id")?,
            token_id: row.try_get("token_id")?,
            queue: row.try_get("queue")?,
            shell: row.try_get("shell")?,
            context: MappingHelpers::parse_variables(row, "context")?,
            pid: row.try_get("pid")?,
            output: row.try_get("output")?,
            exit_status: row.try_get("exit_status")?,
            term_signal: row.try_get("term_signal")?,
            hostname: row.try_get("hostname")?,
            worker_id: row.try_get("worker_id")?,
            claimed_at: row.try_get("claimed_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            mailed_at: row.try_get("mailed_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    /// 把执行记录复制到历史表后删除，`only_unclaimed` 时要求尚未被认领
    async fn move_to_history(
        tx: &mut Transaction<'_, Sqlite>,
        id: i64,
        only_unclaimed: bool,
    ) -> SchedulerResult<Option<ExecutionHistory>> {
        let guard = if only_unclaimed { "AND hostname IS NULL" } else { "" };
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO execution_histories (execution_uuid, hostname, worker_id, queue, job_definition_id,
                                             job_instance_id, token_id, shell, exit_status, term_signal,
                                             started_at, finished_at, created_at)
            SELECT uuid, hostname, worker_id, queue, job_definition_id, job_instance_id, token_id, shell,
                   exit_status, term_signal, started_at, finished_at, $2
            FROM executions WHERE id = $1 {guard}
            RETURNING {HISTORY_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(Utc::now())
        .fetch_optional(&mut **tx)
        .await
        .map_err(SchedulerError::Database)?;

        let Some(row) = row else {
            return Ok(None);
        };

        sqlx::query("DELETE FROM executions WHERE id = $1")
            .bind(id)
            .execute(&mut **tx)
            .await
            .map_err(SchedulerError::Database)?;

        sqlx::query("UPDATE workers SET working = 0, execution_id = NULL, updated_at = $2 WHERE execution_id = $1")
            .bind(id)
            .bind(Utc::now())
            .execute(&mut **tx)
            .await
            .map_err(SchedulerError::Database)?;

        Ok(Some(row_to_history(&row)?))
    }
}

#[async_trait]
impl ExecutionRepository for SqliteExecutionRepository {
    async fn dispatch(&self, execution: &Execution) -> SchedulerResult<Execution> {
        let mut tx = self.pool.begin().await.map_err(SchedulerError::Database)?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO executions (uuid, job_definition_id, job_definition_version, job_instance_id, token_id,
                                    queue, shell, context, output, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, '', $9, $9)
            RETURNING {EXECUTION_COLUMNS}
            "#
        ))
        .bind(execution.uuid.to_string())
        .bind(execution.job_definition_id)
        .bind(execution.job_definition_version)
        .bind(execution.job_instance_id)
        .bind(execution.token_id)
        .bind(&execution.queue)
        .bind(&execution.shell)
        .bind(MappingHelpers::encode_variables(&execution.context)?)
        .bind(execution.created_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(SchedulerError::Database)?;
        let created = Self::row_to_execution(&row)?;

        let advanced = sqlx::query(
            "UPDATE tokens SET status = 'RUNNING', updated_at = $2 WHERE id = $1 AND status = 'PENDING'",
        )
        .bind(execution.token_id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(SchedulerError::Database)?;

        if advanced.rows_affected() == 0 {
            tx.rollback().await.map_err(SchedulerError::Database)?;
            return Err(SchedulerError::InvalidStateTransition(format!(
                "令牌 {} 不处于 PENDING，无法派发执行",
                execution.token_id
            )));
        }

        tx.commit().await.map_err(SchedulerError::Database)?;
        debug!(
            "派发执行成功: ID {}, 令牌 {}, 队列 {}",
            created.id, created.token_id, created.queue
        );
        Ok(created)
    }

    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<Execution>> {
        let row = sqlx::query(&format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        match row {
            Some(row) => Ok(Some(Self::row_to_execution(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_by_token(&self, token_id: i64) -> SchedulerResult<Option<Execution>> {
        let row = sqlx::query(&format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE token_id = $1"))
            .bind(token_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        match row {
            Some(row) => Ok(Some(Self::row_to_execution(&row)?)),
            None => Ok(None),
        }
    }

    async fn claim(
        &self,
        hostname: &str,
        worker_id: i32,
        queue: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<Execution>> {
        let mut tx = self.pool.begin().await.map_err(SchedulerError::Database)?;

        // 单条条件更新完成"选择+占用"，外层 hostname IS NULL 保证同一行只会被一个Worker占用
        let row = sqlx::query(&format!(
            r#"
            UPDATE executions
            SET hostname = $1, worker_id = $2, claimed_at = $3, updated_at = $3
            WHERE id = (
                SELECT e.id FROM executions e
                JOIN job_definitions d ON d.id = e.job_definition_id
                JOIN job_instances i ON i.id = e.job_instance_id
                WHERE e.queue = $4
                  AND e.hostname IS NULL
                  AND e.finished_at IS NULL
                  AND d.suspended = 0
                  AND i.canceled_at IS NULL
                  AND (
                      d.prevent_multi <= 0
                      OR (
                          SELECT COUNT(DISTINCT o.job_instance_id) FROM executions o
                          WHERE o.job_definition_id = e.job_definition_id
                            AND o.job_instance_id != e.job_instance_id
                            AND o.hostname IS NOT NULL
                            AND o.finished_at IS NULL
                      ) < d.prevent_multi
                  )
                  AND EXISTS (
                      SELECT 1 FROM workers w
                      WHERE w.hostname = $1 AND w.worker_id = $2
                        AND w.suspended = 0 AND w.working = 0
                  )
                ORDER BY e.id
                LIMIT 1
            )
            AND hostname IS NULL
            RETURNING {EXECUTION_COLUMNS}
            "#
        ))
        .bind(hostname)
        .bind(worker_id)
        .bind(now)
        .bind(queue)
        .fetch_optional(&mut *tx)
        .await
        .map_err(SchedulerError::Database)?;

        let Some(row) = row else {
            tx.rollback().await.map_err(SchedulerError::Database)?;
            return Ok(None);
        };
        let claimed = Self::row_to_execution(&row)?;

        sqlx::query(
            "UPDATE workers SET working = 1, execution_id = $3, updated_at = $4 WHERE hostname = $1 AND worker_id = $2",
        )
        .bind(hostname)
        .bind(worker_id)
        .bind(claimed.id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(SchedulerError::Database)?;

        tx.commit().await.map_err(SchedulerError::Database)?;
        debug!("Worker {}#{} 认领执行 {}", hostname, worker_id, claimed.id);
        Ok(Some(claimed))
    }

    async fn record_pid(&self, id: i64, pid: i32, started_at: DateTime<Utc>) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE executions SET pid = $2, started_at = $3, updated_at = $3 WHERE id = $1 AND finished_at IS NULL",
        )
        .bind(id)
        .bind(pid)
        .bind(started_at)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn append_output(&self, id: i64, chunk: &str) -> SchedulerResult<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE executions SET output = output || $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(chunk)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        Ok(())
    }

    async fn complete(
        &self,
        id: i64,
        exit_status: Option<i32>,
        term_signal: Option<i32>,
        finished_at: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let mut tx = self.pool.begin().await.map_err(SchedulerError::Database)?;

        let result = sqlx::query(
            r#"
            UPDATE executions
            SET exit_status = $2, term_signal = $3, finished_at = $4, updated_at = $4
            WHERE id = $1 AND finished_at IS NULL
            "#,
        )
        .bind(id)
        .bind(exit_status)
        .bind(term_signal)
        .bind(finished_at)
        .execute(&mut *tx)
        .await
        .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            tx.rollback().await.map_err(SchedulerError::Database)?;
            warn!("执行 {} 已结束或不存在，忽略完成上报", id);
            return Ok(false);
        }

        sqlx::query("UPDATE workers SET working = 0, execution_id = NULL, updated_at = $2 WHERE execution_id = $1")
            .bind(id)
            .bind(finished_at)
            .execute(&mut *tx)
            .await
            .map_err(SchedulerError::Database)?;

        tx.commit().await.map_err(SchedulerError::Database)?;
        debug!(
            "执行 {} 结束: exit_status={:?}, term_signal={:?}",
            id, exit_status, term_signal
        );
        Ok(true)
    }

    async fn find_running_on_host(&self, hostname: &str) -> SchedulerResult<Vec<Execution>> {
        let rows = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions \
             WHERE hostname = $1 AND pid IS NOT NULL AND finished_at IS NULL ORDER BY id"
        ))
        .bind(hostname)
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_execution).collect()
    }

    async fn find_orphaned(&self, heartbeat_cutoff: DateTime<Utc>) -> SchedulerResult<Vec<Execution>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS} FROM executions
            WHERE hostname IS NOT NULL
              AND finished_at IS NULL
              AND NOT EXISTS (
                  SELECT 1 FROM workers w
                  WHERE w.hostname = executions.hostname
                    AND w.worker_id = executions.worker_id
                    AND w.heartbeat_at >= $1
              )
            ORDER BY id
            "#
        ))
        .bind(heartbeat_cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_execution).collect()
    }

    async fn find_long_running(&self, started_before: DateTime<Utc>) -> SchedulerResult<Vec<Execution>> {
        let rows = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions \
             WHERE finished_at IS NULL AND mailed_at IS NULL AND started_at IS NOT NULL AND started_at < $1 \
             ORDER BY id"
        ))
        .bind(started_before)
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_execution).collect()
    }

    async fn mark_mailed(&self, id: i64, now: DateTime<Utc>) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE executions SET mailed_at = $2, updated_at = $2 WHERE id = $1 AND mailed_at IS NULL",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn archive(&self, id: i64) -> SchedulerResult<Option<ExecutionHistory>> {
        let mut tx = self.pool.begin().await.map_err(SchedulerError::Database)?;
        let history = Self::move_to_history(&mut tx, id, false).await?;
        tx.commit().await.map_err(SchedulerError::Database)?;

        if history.is_some() {
            debug!("执行 {} 已归档", id);
        }
        Ok(history)
    }

    async fn withdraw_unclaimed(&self, id: i64) -> SchedulerResult<bool> {
        let mut tx = self.pool.begin().await.map_err(SchedulerError::Database)?;
        let history = Self::move_to_history(&mut tx, id, true).await?;
        tx.commit().await.map_err(SchedulerError::Database)?;

        Ok(history.is_some())
    }
}
