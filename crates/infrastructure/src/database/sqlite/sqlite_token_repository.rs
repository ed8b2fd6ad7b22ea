use async_trait::async_trait;
use chrono::Utc;
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    entities::{Token, TokenStatus},
    repositories::TokenRepository,
    value_objects::Variables,
};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::database::mapping::MappingHelpers;

const TOKEN_COLUMNS: &str = "id, uuid, job_definition_id, job_definition_version, job_instance_id, parent_id, \
     path, status, script, context, message, retry_count, created_at, updated_at";

pub struct SqliteTokenRepository {
    pool: SqlitePool,
}

impl SqliteTokenRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_token(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<Token> {
        Ok(Token {
            id: row.try_get("id")?,
            uuid: MappingHelpers::parse_uuid(row, "uuid")?,
            job_definition_id: row.try_get("job_definition_id")?,
            job_definition_version: row.try_get("job_definition_version")?,
            job_instance_id: row.try_get("job_instance_id")?,
            parent_id: row.try_get("parent_id")?,
            path: MappingHelpers::parse_path(row, "path")?,
            status: row.try_get("status")?,
            script: row.try_get("script")?,
            context: MappingHelpers::parse_variables(row, "context")?,
            message: row.try_get("message")?,
            retry_count: row.try_get("retry_count")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl TokenRepository for SqliteTokenRepository {
    async fn create(&self, token: &Token) -> SchedulerResult<Token> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO tokens (uuid, job_definition_id, job_definition_version, job_instance_id, parent_id,
                                path, status, script, context, message, retry_count, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12)
            RETURNING {TOKEN_COLUMNS}
            "#
        ))
        .bind(token.uuid.to_string())
        .bind(token.job_definition_id)
        .bind(token.job_definition_version)
        .bind(token.job_instance_id)
        .bind(token.parent_id)
        .bind(token.path.to_string())
        .bind(token.status)
        .bind(&token.script)
        .bind(MappingHelpers::encode_variables(&token.context)?)
        .bind(&token.message)
        .bind(token.retry_count)
        .bind(token.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        let created = Self::row_to_token(&row)?;
        debug!(
            "创建令牌成功: ID {}, 实例 {}, 路径 {}",
            created.id, created.job_instance_id, created.path
        );
        Ok(created)
    }

    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<Token>> {
        let row = sqlx::query(&format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        match row {
            Some(row) => Ok(Some(Self::row_to_token(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_by_instance(&self, job_instance_id: i64) -> SchedulerResult<Vec<Token>> {
        let rows = sqlx::query(&format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE job_instance_id = $1 ORDER BY id"
        ))
        .bind(job_instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_token).collect()
    }

    async fn find_root(&self, job_instance_id: i64) -> SchedulerResult<Option<Token>> {
        let row = sqlx::query(&format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE job_instance_id = $1 AND parent_id IS NULL"
        ))
        .bind(job_instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        match row {
            Some(row) => Ok(Some(Self::row_to_token(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_children(&self, parent_id: i64) -> SchedulerResult<Vec<Token>> {
        let rows = sqlx::query(&format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE parent_id = $1 ORDER BY id"
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_token).collect()
    }

    async fn transition(
        &self,
        id: i64,
        from: TokenStatus,
        to: TokenStatus,
        message: Option<&str>,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tokens
            SET status = $3, message = COALESCE($4, message), updated_at = $5
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from)
        .bind(to)
        .bind(message)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        let changed = result.rows_affected() > 0;
        if changed {
            debug!("令牌 {} 状态 {} -> {}", id, from.as_str(), to.as_str());
        }
        Ok(changed)
    }

    async fn reset_for_retry(&self, id: i64, from: TokenStatus, retry_count: i32) -> SchedulerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tokens
            SET status = 'PENDING', retry_count = $3, message = NULL, updated_at = $4
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from)
        .bind(retry_count)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_context(&self, id: i64, context: &Variables) -> SchedulerResult<()> {
        let result = sqlx::query("UPDATE tokens SET context = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(MappingHelpers::encode_variables(context)?)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::TokenNotFound { id });
        }
        Ok(())
    }

    async fn delete_by_instance(&self, job_instance_id: i64) -> SchedulerResult<u64> {
        let result = sqlx::query("DELETE FROM tokens WHERE job_instance_id = $1")
            .bind(job_instance_id)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected())
    }
}
