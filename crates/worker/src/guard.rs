use std::collections::HashMap;
use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, System};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use scheduler_core::SchedulerResult;
use scheduler_domain::{
    Execution, InstanceLogLevel, MemoryConsumptionLog, ProcessSignal, Repositories, StepKind,
};

/// 进程内存采样
pub trait MemorySampler: Send {
    /// 进程及其子孙进程的常驻内存 (KB)，进程不存在时返回 `None`
    fn sample(&mut self, pid: i32) -> Option<i64>;
}

pub struct SysinfoSampler {
    system: System,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for SysinfoSampler {
    fn sample(&mut self, pid: i32) -> Option<i64> {
        let root = Pid::from_u32(u32::try_from(pid).ok()?);
        self.system
            .refresh_processes_specifics(ProcessRefreshKind::new().with_memory());

        let processes = self.system.processes();
        processes.get(&root)?;

        let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (child, process) in processes {
            let Some(parent) = process.parent() else {
                continue;
            };
            // 线程与所属进程同名且共享内存，不重复计入
            let is_thread = processes
                .get(&parent)
                .is_some_and(|p| p.name() == process.name() && p.memory() == process.memory());
            if !is_thread {
                children.entry(parent).or_default().push(*child);
            }
        }

        let mut bytes = 0u64;
        let mut stack = vec![root];
        while let Some(current) = stack.pop() {
            if let Some(process) = processes.get(&current) {
                bytes += process.memory();
            }
            if let Some(descendants) = children.get(&current) {
                stack.extend(descendants.iter().copied());
            }
        }
        Some((bytes / 1024) as i64)
    }
}

/// 内存守护
///
/// 定期采样本主机上运行中的执行，记录内存消耗。超过预期内存的执行会收到
/// 一次终止信号，随后以被信号终止的失败结束。预期内存优先取命令步骤上的
/// `expected_memory`，否则取作业定义的期望值，0 表示不限制。
pub struct MemoryGuard<S: MemorySampler = SysinfoSampler> {
    repos: Repositories,
    hostname: String,
    sampler: S,
}

impl MemoryGuard<SysinfoSampler> {
    pub fn new(repos: Repositories, hostname: impl Into<String>) -> Self {
        Self::with_sampler(repos, hostname, SysinfoSampler::new())
    }
}

impl<S: MemorySampler> MemoryGuard<S> {
    pub fn with_sampler(repos: Repositories, hostname: impl Into<String>, sampler: S) -> Self {
        Self {
            repos,
            hostname: hostname.into(),
            sampler,
        }
    }

    /// 采样一轮，返回本轮新发出的终止信号数
    pub async fn check(&mut self) -> SchedulerResult<usize> {
        let mut issued = 0;
        for execution in self.repos.executions.find_running_on_host(&self.hostname).await? {
            let Some(pid) = execution.pid else {
                continue;
            };
            let Some(kilobytes) = self.sampler.sample(pid) else {
                debug!(execution_id = execution.id, "进程 {} 不存在，跳过采样", pid);
                continue;
            };
            self.repos
                .memory
                .append_consumption(&MemoryConsumptionLog::sample(
                    execution.job_instance_id,
                    execution.id,
                    kilobytes,
                ))
                .await?;

            let limit = self.limit_for(&execution).await?;
            if limit > 0 && kilobytes > limit && self.terminate(&execution, pid, kilobytes, limit).await? {
                issued += 1;
            }
        }
        Ok(issued)
    }

    async fn limit_for(&self, execution: &Execution) -> SchedulerResult<i64> {
        if let Some(token) = self.repos.tokens.find_by_id(execution.token_id).await? {
            if let StepKind::Command(command) = token.step()?.kind {
                if let Some(limit) = command.expected_memory {
                    return Ok(limit);
                }
            }
        }
        Ok(self
            .repos
            .memory
            .find_expectancy(execution.job_definition_id)
            .await?
            .map_or(0, |e| e.expected_value))
    }

    /// 每个执行最多一个终止信号
    async fn terminate(&self, execution: &Execution, pid: i32, kilobytes: i64, limit: i64) -> SchedulerResult<bool> {
        if !self.repos.signals.find_by_execution(execution.id).await?.is_empty() {
            return Ok(false);
        }

        let message = format!("内存超出预期: {kilobytes}KB > {limit}KB");
        self.repos
            .signals
            .create(&ProcessSignal::terminate(&self.hostname, pid, execution.id, &message))
            .await?;
        self.repos
            .logs
            .append(execution.job_instance_id, InstanceLogLevel::Warn, &message)
            .await?;
        warn!(execution_id = execution.id, "{}，请求终止进程 {}", message, pid);
        Ok(true)
    }

    pub async fn run(mut self, sample_interval: Duration, mut shutdown_rx: broadcast::Receiver<()>) -> SchedulerResult<()> {
        info!("启动内存守护: {}", self.hostname);
        let mut ticker = tokio::time::interval(sample_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("内存守护已停止");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.check().await {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        error!("内存采样失败: {}", e);
                    }
                }
            }
        }
        Ok(())
    }
}
