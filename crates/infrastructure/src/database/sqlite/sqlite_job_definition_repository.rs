use async_trait::async_trait;
use chrono::Utc;
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    entities::{JobDefinition, ScriptRevision},
    repositories::JobDefinitionRepository,
    script::normalize_script,
};
use sqlx::{Row, SqlitePool};
use tracing::debug;

const DEFINITION_COLUMNS: &str = "id, name, description, script, version, suspended, prevent_multi, \
     notify_cancellation, created_at, updated_at";

pub struct SqliteJobDefinitionRepository {
    pool: SqlitePool,
}

impl SqliteJobDefinitionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_definition(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<JobDefinition> {
        Ok(JobDefinition {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            script: row.try_get("script")?,
            version: row.try_get("version")?,
            suspended: row.try_get("suspended")?,
            prevent_multi: row.try_get("prevent_multi")?,
            notify_cancellation: row.try_get("notify_cancellation")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_revision(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<ScriptRevision> {
        Ok(ScriptRevision {
            id: row.try_get("id")?,
            job_definition_id: row.try_get("job_definition_id")?,
            script: row.try_get("script")?,
            editor: row.try_get("editor")?,
            changed_at: row.try_get("changed_at")?,
        })
    }
}

#[async_trait]
impl JobDefinitionRepository for SqliteJobDefinitionRepository {
    async fn create(&self, definition: &JobDefinition, editor: Option<&str>) -> SchedulerResult<JobDefinition> {
        let script = normalize_script(&definition.script);
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(SchedulerError::Database)?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO job_definitions (name, description, script, version, suspended, prevent_multi,
                                         notify_cancellation, created_at, updated_at)
            VALUES ($1, $2, $3, 1, $4, $5, $6, $7, $7)
            RETURNING {DEFINITION_COLUMNS}
            "#
        ))
        .bind(&definition.name)
        .bind(&definition.description)
        .bind(&script)
        .bind(definition.suspended)
        .bind(definition.prevent_multi)
        .bind(definition.notify_cancellation)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(SchedulerError::Database)?;
        let created = Self::row_to_definition(&row)?;

        sqlx::query(
            "INSERT INTO script_revisions (job_definition_id, script, editor, changed_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(created.id)
        .bind(&script)
        .bind(editor)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(SchedulerError::Database)?;

        tx.commit().await.map_err(SchedulerError::Database)?;
        debug!("创建作业定义成功: {} (ID: {})", created.name, created.id);
        Ok(created)
    }

    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<JobDefinition>> {
        let row = sqlx::query(&format!("SELECT {DEFINITION_COLUMNS} FROM job_definitions WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        match row {
            Some(row) => Ok(Some(Self::row_to_definition(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_all(&self) -> SchedulerResult<Vec<JobDefinition>> {
        let rows = sqlx::query(&format!("SELECT {DEFINITION_COLUMNS} FROM job_definitions ORDER BY id"))
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_definition).collect()
    }

    async fn update(&self, definition: &JobDefinition) -> SchedulerResult<JobDefinition> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE job_definitions
            SET name = $2, description = $3, suspended = $4, prevent_multi = $5,
                notify_cancellation = $6, updated_at = $7
            WHERE id = $1
            RETURNING {DEFINITION_COLUMNS}
            "#
        ))
        .bind(definition.id)
        .bind(&definition.name)
        .bind(&definition.description)
        .bind(definition.suspended)
        .bind(definition.prevent_multi)
        .bind(definition.notify_cancellation)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(SchedulerError::Database)?
        .ok_or(SchedulerError::JobDefinitionNotFound { id: definition.id })?;

        debug!("更新作业定义成功: ID {}", definition.id);
        Self::row_to_definition(&row)
    }

    async fn update_script(&self, id: i64, script: &str, editor: Option<&str>) -> SchedulerResult<JobDefinition> {
        let script = normalize_script(script);
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(SchedulerError::Database)?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE job_definitions
            SET script = $2, version = version + 1, updated_at = $3
            WHERE id = $1
            RETURNING {DEFINITION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&script)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(SchedulerError::Database)?
        .ok_or(SchedulerError::JobDefinitionNotFound { id })?;
        let updated = Self::row_to_definition(&row)?;

        sqlx::query(
            "INSERT INTO script_revisions (job_definition_id, script, editor, changed_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(id)
        .bind(&script)
        .bind(editor)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(SchedulerError::Database)?;

        tx.commit().await.map_err(SchedulerError::Database)?;
        debug!("更新作业脚本成功: ID {}, 版本 {}", id, updated.version);
        Ok(updated)
    }

    async fn find_revisions(&self, id: i64) -> SchedulerResult<Vec<ScriptRevision>> {
        let rows = sqlx::query(
            "SELECT id, job_definition_id, script, editor, changed_at FROM script_revisions \
             WHERE job_definition_id = $1 ORDER BY id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_revision).collect()
    }

    async fn delete(&self, id: i64) -> SchedulerResult<bool> {
        let mut tx = self.pool.begin().await.map_err(SchedulerError::Database)?;

        // 先写定义行，取得写锁后再检查实例
        let touched = sqlx::query("UPDATE job_definitions SET updated_at = $2 WHERE id = $1")
            .bind(id)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(SchedulerError::Database)?
            .rows_affected();
        if touched == 0 {
            return Ok(false);
        }

        let unresolved: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM job_instances WHERE job_definition_id = $1 \
             AND finished_at IS NULL AND canceled_at IS NULL AND error_at IS NULL",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .map_err(SchedulerError::Database)?;
        if unresolved > 0 {
            return Err(SchedulerError::InvalidStateTransition(format!(
                "作业定义 {id} 仍有 {unresolved} 个未终结的实例，不能删除"
            )));
        }

        let instances = "SELECT id FROM job_instances WHERE job_definition_id = $1";
        let statements = [
            format!(
                "DELETE FROM process_signals WHERE execution_id IN \
                 (SELECT id FROM executions WHERE job_instance_id IN ({instances}))"
            ),
            format!("DELETE FROM executions WHERE job_instance_id IN ({instances})"),
            format!("DELETE FROM tokens WHERE job_instance_id IN ({instances})"),
            format!("DELETE FROM logs WHERE job_instance_id IN ({instances})"),
            format!("DELETE FROM memory_consumption_logs WHERE job_instance_id IN ({instances})"),
            "DELETE FROM job_instances WHERE job_definition_id = $1".to_string(),
            "DELETE FROM memory_expectancies WHERE job_definition_id = $1".to_string(),
            "DELETE FROM script_revisions WHERE job_definition_id = $1".to_string(),
            "DELETE FROM job_definitions WHERE id = $1".to_string(),
        ];
        for statement in &statements {
            sqlx::query(statement)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(SchedulerError::Database)?;
        }

        tx.commit().await.map_err(SchedulerError::Database)?;
        debug!("删除作业定义成功: ID {}", id);
        Ok(true)
    }
}
