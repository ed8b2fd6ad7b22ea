use std::str::FromStr;
use std::sync::Arc;

use scheduler_core::{DatabaseConfig, SchedulerError, SchedulerResult};
use scheduler_domain::Repositories;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use super::sqlite::{
    SqliteExecutionHistoryRepository, SqliteExecutionRepository, SqliteInstanceLogRepository,
    SqliteJobDefinitionRepository, SqliteJobInstanceRepository, SqliteMemoryRepository,
    SqliteProcessSignalRepository, SqliteTokenRepository, SqliteWorkerRepository,
};

/// 数据库管理器：连接池、迁移与仓储构建
#[derive(Clone)]
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    /// 按配置创建连接池，数据库文件不存在时自动创建
    pub async fn new(config: &DatabaseConfig) -> SchedulerResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(SchedulerError::Database)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout());

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connection_timeout())
            .idle_timeout(config.idle_timeout())
            .connect_with(options)
            .await
            .map_err(SchedulerError::Database)?;

        info!("数据库连接池已创建: {}", config.url);
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// 执行内嵌的数据库迁移
    pub async fn migrate(&self) -> SchedulerResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("数据库迁移完成");
        Ok(())
    }

    pub async fn health_check(&self) -> SchedulerResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn repositories(&self) -> Repositories {
        let pool = self.pool.clone();
        Repositories {
            definitions: Arc::new(SqliteJobDefinitionRepository::new(pool.clone())),
            instances: Arc::new(SqliteJobInstanceRepository::new(pool.clone())),
            tokens: Arc::new(SqliteTokenRepository::new(pool.clone())),
            executions: Arc::new(SqliteExecutionRepository::new(pool.clone())),
            histories: Arc::new(SqliteExecutionHistoryRepository::new(pool.clone())),
            workers: Arc::new(SqliteWorkerRepository::new(pool.clone())),
            signals: Arc::new(SqliteProcessSignalRepository::new(pool.clone())),
            memory: Arc::new(SqliteMemoryRepository::new(pool.clone())),
            logs: Arc::new(SqliteInstanceLogRepository::new(pool)),
        }
    }
}
