use async_trait::async_trait;
use chrono::Utc;
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    entities::{InstanceLog, InstanceLogLevel},
    repositories::InstanceLogRepository,
};
use sqlx::{Row, SqlitePool};

pub struct SqliteInstanceLogRepository {
    pool: SqlitePool,
}

impl SqliteInstanceLogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InstanceLogRepository for SqliteInstanceLogRepository {
    async fn append(&self, job_instance_id: i64, level: InstanceLogLevel, message: &str) -> SchedulerResult<()> {
        sqlx::query("INSERT INTO logs (job_instance_id, level, message, created_at) VALUES ($1, $2, $3, $4)")
            .bind(job_instance_id)
            .bind(level)
            .bind(message)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        Ok(())
    }

    async fn find_by_instance(&self, job_instance_id: i64) -> SchedulerResult<Vec<InstanceLog>> {
        let rows = sqlx::query(
            "SELECT id, job_instance_id, level, message, created_at FROM logs WHERE job_instance_id = $1 ORDER BY id",
        )
        .bind(job_instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        rows.iter()
            .map(|row| -> SchedulerResult<InstanceLog> {
                Ok(InstanceLog {
                    id: row.try_get("id")?,
                    job_instance_id: row.try_get("job_instance_id")?,
                    level: row.try_get("level")?,
                    message: row.try_get("message")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}
