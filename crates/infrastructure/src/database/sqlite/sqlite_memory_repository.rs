use async_trait::async_trait;
use chrono::Utc;
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    entities::{MemoryConsumptionLog, MemoryExpectancy},
    repositories::MemoryRepository,
};
use sqlx::{Row, SqlitePool};
use tracing::debug;

pub struct SqliteMemoryRepository {
    pool: SqlitePool,
}

impl SqliteMemoryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_consumption(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<MemoryConsumptionLog> {
        Ok(MemoryConsumptionLog {
            id: row.try_get("id")?,
            job_instance_id: row.try_get("job_instance_id")?,
            execution_id: row.try_get("execution_id")?,
            value: row.try_get("value")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_expectancy(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<MemoryExpectancy> {
        Ok(MemoryExpectancy {
            id: row.try_get("id")?,
            job_definition_id: row.try_get("job_definition_id")?,
            expected_value: row.try_get("expected_value")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl MemoryRepository for SqliteMemoryRepository {
    async fn append_consumption(&self, log: &MemoryConsumptionLog) -> SchedulerResult<MemoryConsumptionLog> {
        let row = sqlx::query(
            r#"
            INSERT INTO memory_consumption_logs (job_instance_id, execution_id, value, created_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id, job_instance_id, execution_id, value, created_at
            "#,
        )
        .bind(log.job_instance_id)
        .bind(log.execution_id)
        .bind(log.value)
        .bind(log.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        Self::row_to_consumption(&row)
    }

    async fn find_consumption_by_instance(&self, job_instance_id: i64) -> SchedulerResult<Vec<MemoryConsumptionLog>> {
        let rows = sqlx::query(
            "SELECT id, job_instance_id, execution_id, value, created_at FROM memory_consumption_logs \
             WHERE job_instance_id = $1 ORDER BY id",
        )
        .bind(job_instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_consumption).collect()
    }

    async fn find_expectancy(&self, job_definition_id: i64) -> SchedulerResult<Option<MemoryExpectancy>> {
        let row = sqlx::query(
            "SELECT id, job_definition_id, expected_value, updated_at FROM memory_expectancies \
             WHERE job_definition_id = $1",
        )
        .bind(job_definition_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        match row {
            Some(row) => Ok(Some(Self::row_to_expectancy(&row)?)),
            None => Ok(None),
        }
    }

    async fn set_expectancy(&self, job_definition_id: i64, expected_value: i64) -> SchedulerResult<MemoryExpectancy> {
        let row = sqlx::query(
            r#"
            INSERT INTO memory_expectancies (job_definition_id, expected_value, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT(job_definition_id) DO UPDATE SET
                expected_value = excluded.expected_value,
                updated_at = excluded.updated_at
            RETURNING id, job_definition_id, expected_value, updated_at
            "#,
        )
        .bind(job_definition_id)
        .bind(expected_value)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        debug!("设置内存期望值: 定义 {} => {} KB", job_definition_id, expected_value);
        Self::row_to_expectancy(&row)
    }
}
