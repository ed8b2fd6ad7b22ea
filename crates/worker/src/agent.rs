use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use scheduler_core::{SchedulerResult, WorkerConfig};
use scheduler_domain::{Execution, Repositories, Worker};

use crate::retry::RetryPolicy;
use crate::runner::{ProcessOutcome, ProcessRunner};

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub hostname: String,
    pub queue: String,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub suspendable: bool,
    /// 上报执行结果失败时的重试策略
    pub store_retry: RetryPolicy,
}

impl From<&WorkerConfig> for AgentSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            hostname: config.hostname.clone(),
            queue: config.queue.clone(),
            poll_interval: config.poll_interval(),
            heartbeat_interval: config.heartbeat_interval(),
            suspendable: config.suspendable,
            store_retry: RetryPolicy::default(),
        }
    }
}

/// 轮询代理：注册身份、保持心跳、认领执行并交给进程执行器
///
/// 同一时刻最多运行一个进程。空闲时按轮询间隔加随机抖动等待，
/// 避免同一主机上的多个代理同时访问存储。
#[derive(Clone)]
pub struct WorkerAgent {
    repos: Repositories,
    worker_id: i32,
    settings: AgentSettings,
    runner: Arc<ProcessRunner>,
}

impl WorkerAgent {
    pub fn new(repos: Repositories, worker_id: i32, settings: AgentSettings, runner: Arc<ProcessRunner>) -> Self {
        Self {
            repos,
            worker_id,
            settings,
            runner,
        }
    }

    pub fn worker_id(&self) -> i32 {
        self.worker_id
    }

    fn name(&self) -> String {
        format!("{}#{}", self.settings.hostname, self.worker_id)
    }

    pub async fn register(&self) -> SchedulerResult<Worker> {
        let mut worker = Worker::new(&self.settings.hostname, self.worker_id, &self.settings.queue);
        worker.suspendable = self.settings.suspendable;
        let worker = self.repos.workers.register(&worker).await?;
        info!(worker = %worker.display_name(), queue = %worker.queue, "Worker已注册");
        Ok(worker)
    }

    /// 刷新心跳，注册记录被回收后重新注册
    pub async fn heartbeat(&self) -> SchedulerResult<()> {
        let refreshed = self
            .repos
            .workers
            .heartbeat(&self.settings.hostname, self.worker_id, Utc::now())
            .await?;
        if !refreshed {
            warn!(worker = %self.name(), "Worker注册记录不存在，重新注册");
            self.register().await?;
        }
        Ok(())
    }

    /// 认领并运行一个执行，队列中没有可认领的执行时返回 `None`
    pub async fn run_next(&self) -> SchedulerResult<Option<(Execution, ProcessOutcome)>> {
        let Some(execution) = self
            .repos
            .executions
            .claim(&self.settings.hostname, self.worker_id, &self.settings.queue, Utc::now())
            .await?
        else {
            return Ok(None);
        };
        info!(worker = %self.name(), execution_id = execution.id, "开始执行: {}", execution.shell);

        let outcome = match self.runner.run(&execution).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(execution_id = execution.id, "执行进程失败: {}", e);
                ProcessOutcome::default()
            }
        };

        self.report(&execution, outcome).await?;
        Ok(Some((execution, outcome)))
    }

    /// 写入退出信息；存储暂时不可用时退避重试，未写入前不再认领新的执行
    async fn report(&self, execution: &Execution, outcome: ProcessOutcome) -> SchedulerResult<()> {
        let finished_at = Utc::now();
        let completed = self
            .settings
            .store_retry
            .run("上报执行结果", || {
                self.repos
                    .executions
                    .complete(execution.id, outcome.exit_status, outcome.term_signal, finished_at)
            })
            .await?;
        if !completed {
            // 执行已被调度器强制结束，绑定仍需释放
            debug!(execution_id = execution.id, "执行已被其他组件结束");
            self.settings
                .store_retry
                .run("释放Worker绑定", || {
                    self.repos.workers.release(&self.settings.hostname, self.worker_id)
                })
                .await?;
        }
        Ok(())
    }

    fn idle_wait(&self) -> Duration {
        let base = self.settings.poll_interval.as_millis() as u64;
        let jitter = rand::rng().random_range(0..=base / 4);
        Duration::from_millis(base + jitter)
    }

    fn spawn_heartbeat(&self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let agent = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(agent.settings.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = agent.heartbeat().await {
                            error!(worker = %agent.name(), "发送心跳失败: {}", e);
                        }
                    }
                }
            }
        })
    }

    /// 运行认领循环直到收到关闭信号
    ///
    /// 正在运行的进程会被等待结束后才退出，退出前注销注册记录。
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> SchedulerResult<()> {
        self.register().await?;
        let heartbeat = self.spawn_heartbeat(shutdown_rx.resubscribe());
        info!(worker = %self.name(), "Worker开始认领执行");

        loop {
            let busy = match self.run_next().await {
                Ok(ran) => ran.is_some(),
                Err(e) if e.is_fatal() => {
                    heartbeat.abort();
                    return Err(e);
                }
                Err(e) => {
                    error!(worker = %self.name(), "认领执行失败: {}", e);
                    false
                }
            };

            if busy {
                if !matches!(shutdown_rx.try_recv(), Err(TryRecvError::Empty)) {
                    break;
                }
                continue;
            }

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(self.idle_wait()) => {}
            }
        }

        if let Err(e) = heartbeat.await {
            warn!(worker = %self.name(), "心跳任务异常退出: {}", e);
        }
        self.repos
            .workers
            .unregister(&self.settings.hostname, self.worker_id)
            .await?;
        info!(worker = %self.name(), "Worker已注销");
        Ok(())
    }
}
