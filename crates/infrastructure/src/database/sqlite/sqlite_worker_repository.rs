use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{entities::Worker, repositories::WorkerRepository};
use sqlx::{Row, SqlitePool};
use tracing::debug;

const WORKER_COLUMNS: &str = "id, hostname, worker_id, queue, working, execution_id, suspendable, suspended, \
     heartbeat_at, created_at, updated_at";

pub struct SqliteWorkerRepository {
    pool: SqlitePool,
}

impl SqliteWorkerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_worker(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<Worker> {
        Ok(Worker {
            id: row.try_get("id")?,
            hostname: row.try_get("hostname")?,
            worker_id: row.try_get("worker_id")?,
            queue: row.try_get("queue")?,
            working: row.try_get("working")?,
            execution_id: row.try_get("execution_id")?,
            suspendable: row.try_get("suspendable")?,
            suspended: row.try_get("suspended")?,
            heartbeat_at: row.try_get("heartbeat_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl WorkerRepository for SqliteWorkerRepository {
    async fn register(&self, worker: &Worker) -> SchedulerResult<Worker> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO workers (hostname, worker_id, queue, working, execution_id, suspendable, suspended,
                                 heartbeat_at, created_at, updated_at)
            VALUES ($1, $2, $3, 0, NULL, $4, 0, $5, $5, $5)
            ON CONFLICT(hostname, worker_id) DO UPDATE SET
                queue = excluded.queue,
                working = 0,
                execution_id = NULL,
                suspendable = excluded.suspendable,
                heartbeat_at = excluded.heartbeat_at,
                updated_at = excluded.updated_at
            RETURNING {WORKER_COLUMNS}
            "#
        ))
        .bind(&worker.hostname)
        .bind(worker.worker_id)
        .bind(&worker.queue)
        .bind(worker.suspendable)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        debug!("注册Worker成功: {}#{}", worker.hostname, worker.worker_id);
        Self::row_to_worker(&row)
    }

    async fn find(&self, hostname: &str, worker_id: i32) -> SchedulerResult<Option<Worker>> {
        let row = sqlx::query(&format!(
            "SELECT {WORKER_COLUMNS} FROM workers WHERE hostname = $1 AND worker_id = $2"
        ))
        .bind(hostname)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        match row {
            Some(row) => Ok(Some(Self::row_to_worker(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_all(&self) -> SchedulerResult<Vec<Worker>> {
        let rows = sqlx::query(&format!("SELECT {WORKER_COLUMNS} FROM workers ORDER BY hostname, worker_id"))
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_worker).collect()
    }

    async fn heartbeat(&self, hostname: &str, worker_id: i32, now: DateTime<Utc>) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE workers SET heartbeat_at = $3, updated_at = $3 WHERE hostname = $1 AND worker_id = $2",
        )
        .bind(hostname)
        .bind(worker_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_suspended(&self, hostname: &str, worker_id: i32, suspended: bool) -> SchedulerResult<Worker> {
        let worker = self
            .find(hostname, worker_id)
            .await?
            .ok_or_else(|| SchedulerError::WorkerNotFound {
                hostname: hostname.to_string(),
                worker_id,
            })?;

        if suspended && !worker.suspendable {
            return Err(SchedulerError::WorkerNotSuspendable {
                hostname: hostname.to_string(),
                worker_id,
            });
        }

        let row = sqlx::query(&format!(
            "UPDATE workers SET suspended = $3, updated_at = $4 WHERE hostname = $1 AND worker_id = $2 \
             RETURNING {WORKER_COLUMNS}"
        ))
        .bind(hostname)
        .bind(worker_id)
        .bind(suspended)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        debug!("Worker {}#{} suspended={}", hostname, worker_id, suspended);
        Self::row_to_worker(&row)
    }

    async fn find_stale(&self, heartbeat_cutoff: DateTime<Utc>) -> SchedulerResult<Vec<Worker>> {
        let rows = sqlx::query(&format!(
            "SELECT {WORKER_COLUMNS} FROM workers WHERE heartbeat_at < $1 ORDER BY hostname, worker_id"
        ))
        .bind(heartbeat_cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_worker).collect()
    }

    async fn release(&self, hostname: &str, worker_id: i32) -> SchedulerResult<()> {
        sqlx::query(
            "UPDATE workers SET working = 0, execution_id = NULL, updated_at = $3 WHERE hostname = $1 AND worker_id = $2",
        )
        .bind(hostname)
        .bind(worker_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;
        Ok(())
    }

    async fn unregister(&self, hostname: &str, worker_id: i32) -> SchedulerResult<bool> {
        let result = sqlx::query("DELETE FROM workers WHERE hostname = $1 AND worker_id = $2")
            .bind(hostname)
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        let removed = result.rows_affected() > 0;
        if removed {
            debug!("注销Worker成功: {}#{}", hostname, worker_id);
        }
        Ok(removed)
    }
}
