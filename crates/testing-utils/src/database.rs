use scheduler_core::{DatabaseConfig, SchedulerResult};
use scheduler_domain::Repositories;
use scheduler_infrastructure::DatabaseManager;
use tempfile::TempDir;

/// 已完成迁移的临时SQLite数据库，随实例析构删除
pub struct TestDatabase {
    _dir: TempDir,
    pub manager: DatabaseManager,
    pub repos: Repositories,
}

impl TestDatabase {
    pub async fn new() -> SchedulerResult<Self> {
        Self::with_max_connections(4).await
    }

    /// 并发测试需要多个连接，才能让认领请求真正在存储层竞争
    pub async fn with_max_connections(max_connections: u32) -> SchedulerResult<Self> {
        let dir = TempDir::new()?;
        let url = format!("sqlite:{}", dir.path().join("scheduler_test.db").display());

        let config = DatabaseConfig {
            url,
            max_connections,
            min_connections: 1,
            busy_timeout_seconds: 30,
            ..DatabaseConfig::default()
        };

        let manager = DatabaseManager::new(&config).await?;
        manager.migrate().await?;
        let repos = manager.repositories();

        Ok(Self {
            _dir: dir,
            manager,
            repos,
        })
    }
}
