use anyhow::Result;
use scheduler_core::DatabaseConfig;
use scheduler_infrastructure::DatabaseManager;
use tempfile::TempDir;

#[tokio::test]
async fn test_migrations_are_idempotent() -> Result<()> {
    let dir = TempDir::new()?;
    let config = DatabaseConfig {
        url: format!("sqlite:{}", dir.path().join("migrate.db").display()),
        ..DatabaseConfig::default()
    };

    let manager = DatabaseManager::new(&config).await?;
    manager.migrate().await?;
    manager.migrate().await?;
    manager.health_check().await?;

    let tables: Vec<(String,)> = sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table'")
        .fetch_all(manager.pool())
        .await?;
    let names: Vec<_> = tables.into_iter().map(|(name,)| name).collect();
    for expected in [
        "job_definitions",
        "job_instances",
        "tokens",
        "executions",
        "execution_histories",
        "workers",
        "process_signals",
        "memory_consumption_logs",
        "memory_expectancies",
    ] {
        assert!(names.iter().any(|n| n == expected), "缺少表 {expected}");
    }

    manager.close().await;
    Ok(())
}
