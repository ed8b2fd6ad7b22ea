use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;

use scheduler_core::{init_logging, AppConfig};
use workflow_scheduler::cli::{execute, Cli};
use workflow_scheduler::Application;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).context("加载配置失败")?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    init_logging(&config.logging.level, &config.logging.format).context("初始化日志失败")?;

    debug!("数据库: {}", config.database.url);
    let app = Application::new(config).await?;
    execute(app, cli.command).await
}
