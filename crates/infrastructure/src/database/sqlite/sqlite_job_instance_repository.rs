use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{entities::JobInstance, repositories::JobInstanceRepository};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::database::mapping::MappingHelpers;

const INSTANCE_COLUMNS: &str = "id, job_definition_id, job_definition_version, script, context, started_at, \
     finished_at, canceled_at, error_at, retrying, created_at, updated_at";

/// 三个终态标记均为空
const UNRESOLVED: &str = "finished_at IS NULL AND canceled_at IS NULL AND error_at IS NULL";

pub struct SqliteJobInstanceRepository {
    pool: SqlitePool,
}

impl SqliteJobInstanceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_instance(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<JobInstance> {
        Ok(JobInstance {
            id: row.try_get("id")?,
            job_definition_id: row.try_get("job_definition_id")?,
            job_definition_version: row.try_get("job_definition_version")?,
            script: row.try_get("script")?,
            context: MappingHelpers::parse_variables(row, "context")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            canceled_at: row.try_get("canceled_at")?,
            error_at: row.try_get("error_at")?,
            retrying: row.try_get("retrying")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn set_terminal_marker(&self, id: i64, column: &str, now: DateTime<Utc>) -> SchedulerResult<bool> {
        let result = sqlx::query(&format!(
            "UPDATE job_instances SET {column} = $2, retrying = 0, updated_at = $2 WHERE id = $1 AND {UNRESOLVED}"
        ))
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        let changed = result.rows_affected() > 0;
        if changed {
            debug!("作业实例 {} 设置 {}", id, column);
        }
        Ok(changed)
    }
}

#[async_trait]
impl JobInstanceRepository for SqliteJobInstanceRepository {
    async fn create(&self, instance: &JobInstance) -> SchedulerResult<JobInstance> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO job_instances (job_definition_id, job_definition_version, script, context,
                                       retrying, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            RETURNING {INSTANCE_COLUMNS}
            "#
        ))
        .bind(instance.job_definition_id)
        .bind(instance.job_definition_version)
        .bind(&instance.script)
        .bind(MappingHelpers::encode_variables(&instance.context)?)
        .bind(instance.retrying)
        .bind(instance.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        let created = Self::row_to_instance(&row)?;
        debug!(
            "创建作业实例成功: ID {}, 定义 {} v{}",
            created.id, created.job_definition_id, created.job_definition_version
        );
        Ok(created)
    }

    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<JobInstance>> {
        let row = sqlx::query(&format!("SELECT {INSTANCE_COLUMNS} FROM job_instances WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        match row {
            Some(row) => Ok(Some(Self::row_to_instance(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_by_definition(&self, job_definition_id: i64) -> SchedulerResult<Vec<JobInstance>> {
        let rows = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM job_instances WHERE job_definition_id = $1 ORDER BY id"
        ))
        .bind(job_definition_id)
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_instance).collect()
    }

    async fn find_pending(&self, limit: u32) -> SchedulerResult<Vec<JobInstance>> {
        let rows = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM job_instances WHERE started_at IS NULL AND {UNRESOLVED} \
             ORDER BY id LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_instance).collect()
    }

    async fn find_running(&self) -> SchedulerResult<Vec<JobInstance>> {
        let rows = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM job_instances WHERE started_at IS NOT NULL AND {UNRESOLVED} \
             ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_instance).collect()
    }

    async fn find_active(&self) -> SchedulerResult<Vec<JobInstance>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {INSTANCE_COLUMNS} FROM job_instances
            WHERE started_at IS NOT NULL
              AND (
                  ({UNRESOLVED})
                  OR EXISTS (
                      SELECT 1 FROM tokens t
                      WHERE t.job_instance_id = job_instances.id
                        AND t.status IN ('PENDING', 'RUNNING', 'CANCELING')
                  )
              )
            ORDER BY id
            "#
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_instance).collect()
    }

    async fn try_admit(&self, id: i64, now: DateTime<Utc>) -> SchedulerResult<bool> {
        // 定义级别的条件检查，与执行认领相互独立
        let result = sqlx::query(&format!(
            r#"
            UPDATE job_instances
            SET started_at = $2, updated_at = $2
            WHERE id = $1
              AND started_at IS NULL
              AND {UNRESOLVED}
              AND EXISTS (
                  SELECT 1 FROM job_definitions d
                  WHERE d.id = job_instances.job_definition_id
                    AND d.suspended = 0
                    AND (
                        d.prevent_multi <= 0
                        OR (
                            SELECT COUNT(*) FROM job_instances o
                            WHERE o.job_definition_id = d.id
                              AND o.id != job_instances.id
                              AND o.started_at IS NOT NULL
                              AND o.finished_at IS NULL
                              AND o.canceled_at IS NULL
                              AND o.error_at IS NULL
                        ) < d.prevent_multi
                    )
              )
            "#
        ))
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_finished(&self, id: i64, now: DateTime<Utc>) -> SchedulerResult<bool> {
        self.set_terminal_marker(id, "finished_at", now).await
    }

    async fn mark_error(&self, id: i64, now: DateTime<Utc>) -> SchedulerResult<bool> {
        self.set_terminal_marker(id, "error_at", now).await
    }

    async fn mark_canceled(&self, id: i64, now: DateTime<Utc>) -> SchedulerResult<bool> {
        self.set_terminal_marker(id, "canceled_at", now).await
    }

    async fn mark_retrying(&self, id: i64) -> SchedulerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_instances
            SET error_at = NULL, retrying = 1, updated_at = $2
            WHERE id = $1 AND error_at IS NOT NULL AND finished_at IS NULL AND canceled_at IS NULL
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_resolved_before(&self, cutoff: DateTime<Utc>) -> SchedulerResult<Vec<i64>> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM job_instances
            WHERE COALESCE(finished_at, canceled_at, error_at) IS NOT NULL
              AND COALESCE(finished_at, canceled_at, error_at) < $1
            ORDER BY id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        rows.iter()
            .map(|row| row.try_get::<i64, _>("id").map_err(SchedulerError::Database))
            .collect()
    }
}
