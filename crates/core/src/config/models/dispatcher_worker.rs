use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::validation::{ConfigValidator, ValidationUtils};
use crate::SchedulerResult;

/// 单个进程内允许启动的Worker上限
const MAX_WORKERS_PER_PROCESS: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub enabled: bool,
    /// 令牌树推进间隔（毫秒）
    pub tick_interval_millis: u64,
    /// 失联Worker回收间隔
    pub reaper_interval_seconds: u64,
    /// 超过该时长未心跳的Worker视为失联
    pub worker_heartbeat_timeout_seconds: u64,
    /// 取消中的令牌等待进程退出的上限，超时强制置为CANCELED
    pub cancel_timeout_seconds: u64,
    pub archiver_interval_seconds: u64,
    /// 终态实例的令牌保留时长
    pub token_retention_seconds: u64,
    /// 长时间运行通知阈值，0 表示关闭
    pub long_running_threshold_seconds: u64,
    /// 每轮最多准入的待启动实例数
    pub admission_batch_size: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_millis: 500,
            reaper_interval_seconds: 30,
            worker_heartbeat_timeout_seconds: 90,
            cancel_timeout_seconds: 300,
            archiver_interval_seconds: 300,
            token_retention_seconds: 7 * 24 * 3600,
            long_running_threshold_seconds: 24 * 3600,
            admission_batch_size: 100,
        }
    }
}

impl DispatcherConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_millis)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_seconds)
    }

    pub fn archiver_interval(&self) -> Duration {
        Duration::from_secs(self.archiver_interval_seconds)
    }
}

impl ConfigValidator for DispatcherConfig {
    fn validate(&self) -> SchedulerResult<()> {
        ValidationUtils::validate_positive(self.tick_interval_millis, "dispatcher.tick_interval_millis")?;
        ValidationUtils::validate_positive(
            self.reaper_interval_seconds,
            "dispatcher.reaper_interval_seconds",
        )?;
        ValidationUtils::validate_positive(
            self.worker_heartbeat_timeout_seconds,
            "dispatcher.worker_heartbeat_timeout_seconds",
        )?;
        ValidationUtils::validate_positive(
            self.cancel_timeout_seconds,
            "dispatcher.cancel_timeout_seconds",
        )?;
        ValidationUtils::validate_positive(
            self.archiver_interval_seconds,
            "dispatcher.archiver_interval_seconds",
        )?;
        ValidationUtils::validate_positive(
            self.admission_batch_size as u64,
            "dispatcher.admission_batch_size",
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub hostname: String,
    /// 本进程启动的Worker数量，worker_id 从 0 开始编号
    pub worker_count: usize,
    pub queue: String,
    pub poll_interval_millis: u64,
    pub heartbeat_interval_seconds: u64,
    /// 单次执行保存的输出上限（字节），超出部分丢弃
    pub output_limit_bytes: usize,
    pub output_flush_interval_millis: u64,
    pub shell: String,
    pub suspendable: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hostname: local_hostname(),
            worker_count: 1,
            queue: "@default".to_string(),
            poll_interval_millis: 1000,
            heartbeat_interval_seconds: 10,
            output_limit_bytes: 1024 * 1024,
            output_flush_interval_millis: 1000,
            shell: "/bin/sh".to_string(),
            suspendable: true,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn output_flush_interval(&self) -> Duration {
        Duration::from_millis(self.output_flush_interval_millis)
    }
}

impl ConfigValidator for WorkerConfig {
    fn validate(&self) -> SchedulerResult<()> {
        ValidationUtils::validate_not_empty(&self.hostname, "worker.hostname")?;
        ValidationUtils::validate_not_empty(&self.queue, "worker.queue")?;
        ValidationUtils::validate_not_empty(&self.shell, "worker.shell")?;
        ValidationUtils::validate_count(self.worker_count, "worker.worker_count", MAX_WORKERS_PER_PROCESS)?;
        ValidationUtils::validate_positive(self.poll_interval_millis, "worker.poll_interval_millis")?;
        ValidationUtils::validate_positive(
            self.heartbeat_interval_seconds,
            "worker.heartbeat_interval_seconds",
        )?;
        ValidationUtils::validate_positive(self.output_limit_bytes as u64, "worker.output_limit_bytes")?;
        ValidationUtils::validate_positive(
            self.output_flush_interval_millis,
            "worker.output_flush_interval_millis",
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryGuardConfig {
    pub enabled: bool,
    pub sample_interval_seconds: u64,
}

impl Default for MemoryGuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval_seconds: 10,
        }
    }
}

impl MemoryGuardConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_seconds)
    }
}

impl ConfigValidator for MemoryGuardConfig {
    fn validate(&self) -> SchedulerResult<()> {
        ValidationUtils::validate_positive(
            self.sample_interval_seconds,
            "memory_guard.sample_interval_seconds",
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalRelayConfig {
    pub poll_interval_millis: u64,
}

impl Default for SignalRelayConfig {
    fn default() -> Self {
        Self {
            poll_interval_millis: 1000,
        }
    }
}

impl SignalRelayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }
}

impl ConfigValidator for SignalRelayConfig {
    fn validate(&self) -> SchedulerResult<()> {
        ValidationUtils::validate_positive(self.poll_interval_millis, "signal_relay.poll_interval_millis")
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}
