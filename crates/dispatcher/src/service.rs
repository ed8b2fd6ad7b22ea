use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info};

use scheduler_core::{DispatcherConfig, SchedulerResult};
use scheduler_domain::Repositories;

use crate::archiver::HistoryArchiver;
use crate::executor::{ExecutorSettings, TokenExecutor};
use crate::lifecycle::LifecycleController;
use crate::notifier::Notifier;
use crate::reaper::ExecutionReaper;
use crate::trigger::TriggerService;
use crate::watchdog::LongRunningWatchdog;

/// 调度进程的组合根，持有各组件并驱动定时循环
pub struct DispatcherService {
    repos: Repositories,
    config: DispatcherConfig,
    executor: Arc<TokenExecutor>,
    lifecycle: Arc<LifecycleController>,
    reaper: ExecutionReaper,
    archiver: Arc<HistoryArchiver>,
    watchdog: LongRunningWatchdog,
    trigger: TriggerService,
}

impl DispatcherService {
    pub fn new(repos: Repositories, config: DispatcherConfig, notifier: Arc<dyn Notifier>) -> Self {
        let archiver = Arc::new(HistoryArchiver::new(
            repos.clone(),
            Duration::from_secs(config.token_retention_seconds),
        ));
        let executor = Arc::new(TokenExecutor::new(
            repos.clone(),
            archiver.clone(),
            ExecutorSettings {
                cancel_timeout: Duration::from_secs(config.cancel_timeout_seconds),
            },
        ));
        let lifecycle = Arc::new(LifecycleController::new(
            repos.clone(),
            executor.clone(),
            notifier.clone(),
        ));
        let reaper = ExecutionReaper::new(
            repos.clone(),
            Duration::from_secs(config.worker_heartbeat_timeout_seconds),
        );
        let watchdog = LongRunningWatchdog::new(
            repos.clone(),
            notifier,
            Duration::from_secs(config.long_running_threshold_seconds),
        );
        let trigger = TriggerService::new(repos.clone());

        Self {
            repos,
            config,
            executor,
            lifecycle,
            reaper,
            archiver,
            watchdog,
            trigger,
        }
    }

    pub fn trigger(&self) -> &TriggerService {
        &self.trigger
    }

    pub fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }

    pub fn reaper(&self) -> &ExecutionReaper {
        &self.reaper
    }

    pub fn archiver(&self) -> &HistoryArchiver {
        &self.archiver
    }

    pub fn watchdog(&self) -> &LongRunningWatchdog {
        &self.watchdog
    }

    /// 一次完整推进：准入、推进所有活动实例、决议终态
    pub async fn tick(&self) -> SchedulerResult<()> {
        let admitted = self.executor.admit_pending(self.config.admission_batch_size).await?;
        if admitted > 0 {
            debug!("本轮准入 {} 个实例", admitted);
        }

        for instance in self.repos.instances.find_active().await? {
            // 单个实例出错不影响其他实例
            if let Err(e) = self.executor.advance_instance(&instance).await {
                if e.is_fatal() {
                    return Err(e);
                }
                error!(instance_id = instance.id, "推进作业实例失败: {}", e);
                continue;
            }
            if let Err(e) = self.lifecycle.resolve(&instance).await {
                error!(instance_id = instance.id, "决议作业实例状态失败: {}", e);
            }
        }
        Ok(())
    }

    /// 运行调度循环直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> SchedulerResult<()> {
        info!("启动调度服务");

        let mut tick = tokio::time::interval(self.config.tick_interval());
        let mut reap = tokio::time::interval(self.config.reaper_interval());
        let mut archive = tokio::time::interval(self.config.archiver_interval());
        for interval in [&mut tick, &mut reap, &mut archive] {
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("收到关闭信号，停止调度服务");
                    break;
                }
                _ = tick.tick() => {
                    if let Err(e) = self.tick().await {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        error!("调度推进失败: {}", e);
                    }
                }
                _ = reap.tick() => {
                    if let Err(e) = self.reaper.reap().await {
                        error!("回收失联执行失败: {}", e);
                    }
                }
                _ = archive.tick() => {
                    if let Err(e) = self.archiver.sweep_tokens().await {
                        error!("清理过期令牌失败: {}", e);
                    }
                    if let Err(e) = self.watchdog.check().await {
                        error!("检查长时间运行的执行失败: {}", e);
                    }
                }
            }
        }

        Ok(())
    }
}
