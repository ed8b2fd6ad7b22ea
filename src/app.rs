use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::info;

use scheduler_core::AppConfig;
use scheduler_dispatcher::{DispatcherService, LogNotifier, Notifier};
use scheduler_domain::Repositories;
use scheduler_infrastructure::DatabaseManager;
use scheduler_worker::WorkerService;

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum AppMode {
    /// 仅运行调度循环
    Dispatcher,
    /// 仅运行本主机的Worker
    Worker,
    /// 同一进程内运行全部组件
    All,
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    database: DatabaseManager,
    repos: Repositories,
}

impl Application {
    /// 连接存储并完成迁移
    pub async fn new(config: AppConfig) -> Result<Self> {
        let database = DatabaseManager::new(&config.database)
            .await
            .with_context(|| format!("连接数据库失败: {}", config.database.url))?;
        database.migrate().await.context("数据库迁移失败")?;
        let repos = database.repositories();
        Ok(Self {
            config,
            database,
            repos,
        })
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 带日志通知器的调度服务，运维命令也通过它触发、取消和重试
    pub fn dispatcher(&self) -> DispatcherService {
        let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
        DispatcherService::new(self.repos.clone(), self.config.dispatcher.clone(), notifier)
    }

    pub fn worker(&self) -> WorkerService {
        WorkerService::new(
            self.repos.clone(),
            self.config.worker.clone(),
            self.config.memory_guard.clone(),
            self.config.signal_relay.clone(),
        )
    }

    /// 按模式运行服务循环直到收到关闭信号
    pub async fn run(&self, mode: AppMode, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用程序，模式: {:?}", mode);

        match mode {
            AppMode::Dispatcher => self.run_dispatcher(shutdown_rx).await?,
            AppMode::Worker => self.run_worker(shutdown_rx).await?,
            AppMode::All => {
                let dispatcher = async {
                    if self.config.dispatcher.enabled {
                        self.run_dispatcher(shutdown_rx.resubscribe()).await
                    } else {
                        Ok(())
                    }
                };
                let worker = async {
                    if self.config.worker.enabled {
                        self.run_worker(shutdown_rx.resubscribe()).await
                    } else {
                        Ok(())
                    }
                };
                let (dispatcher, worker) = tokio::join!(dispatcher, worker);
                dispatcher?;
                worker?;
            }
        }

        self.database.close().await;
        info!("应用程序已停止");
        Ok(())
    }

    async fn run_dispatcher(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        self.dispatcher().run(shutdown_rx).await.context("调度服务异常退出")
    }

    async fn run_worker(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        self.worker().run(shutdown_rx).await.context("Worker服务异常退出")
    }
}
