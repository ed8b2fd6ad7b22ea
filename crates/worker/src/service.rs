use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use scheduler_core::{
    MemoryGuardConfig, SchedulerError, SchedulerResult, SignalRelayConfig, WorkerConfig,
};
use scheduler_domain::Repositories;

use crate::agent::{AgentSettings, WorkerAgent};
use crate::guard::MemoryGuard;
use crate::relay::SignalRelay;
use crate::runner::{ProcessRunner, RunnerSettings};

/// Worker进程的组合根：若干轮询代理、一个信号中继和一个内存守护
pub struct WorkerService {
    repos: Repositories,
    worker: WorkerConfig,
    memory_guard: MemoryGuardConfig,
    signal_relay: SignalRelayConfig,
}

impl WorkerService {
    pub fn new(
        repos: Repositories,
        worker: WorkerConfig,
        memory_guard: MemoryGuardConfig,
        signal_relay: SignalRelayConfig,
    ) -> Self {
        Self {
            repos,
            worker,
            memory_guard,
            signal_relay,
        }
    }

    /// 按配置的数量构建代理，worker_id 从 0 开始
    pub fn agents(&self) -> Vec<WorkerAgent> {
        let runner = Arc::new(ProcessRunner::new(
            self.repos.clone(),
            RunnerSettings::from(&self.worker),
        ));
        let settings = AgentSettings::from(&self.worker);
        (0..self.worker.worker_count)
            .map(|index| WorkerAgent::new(self.repos.clone(), index as i32, settings.clone(), runner.clone()))
            .collect()
    }

    /// 启动所有组件并等待它们在关闭信号后退出
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> SchedulerResult<()> {
        info!(
            "启动Worker服务: {} ({} 个Worker, 队列 {})",
            self.worker.hostname, self.worker.worker_count, self.worker.queue
        );

        let mut tasks: Vec<(String, JoinHandle<SchedulerResult<()>>)> = Vec::new();
        for agent in self.agents() {
            let name = format!("worker#{}", agent.worker_id());
            tasks.push((name, tokio::spawn(agent.run(shutdown_rx.resubscribe()))));
        }

        let relay = SignalRelay::new(self.repos.clone(), &self.worker.hostname);
        tasks.push((
            "signal-relay".to_string(),
            tokio::spawn(relay.run(self.signal_relay.poll_interval(), shutdown_rx.resubscribe())),
        ));

        if self.memory_guard.enabled {
            let guard = MemoryGuard::new(self.repos.clone(), &self.worker.hostname);
            tasks.push((
                "memory-guard".to_string(),
                tokio::spawn(guard.run(self.memory_guard.sample_interval(), shutdown_rx.resubscribe())),
            ));
        }

        let mut first_error = None;
        for (name, task) in tasks {
            let result = task
                .await
                .map_err(|e| SchedulerError::Internal(format!("{name} 任务异常退出: {e}")))
                .and_then(|r| r);
            if let Err(e) = result {
                error!("{} 退出时出错: {}", name, e);
                first_error.get_or_insert(e);
            }
        }

        info!("Worker服务已停止");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
