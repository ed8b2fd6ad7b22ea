use std::time::Duration;

use chrono::Utc;
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{ProcessSignal, Repositories};

/// 向进程所在的进程组发送信号，目标不是组长时退回到单个进程
///
/// 返回 `false` 表示进程已经不存在。
pub(crate) fn send_signal(pid: i32, number: i32) -> SchedulerResult<bool> {
    // 0 与 -1 在 kill(2) 中有特殊含义，1 是 init
    if pid <= 1 {
        return Err(SchedulerError::Process(format!("拒绝向进程 {pid} 发送信号")));
    }
    let signal = Signal::try_from(number)
        .map_err(|e| SchedulerError::Process(format!("无效的信号编号 {number}: {e}")))?;

    let target = Pid::from_raw(pid);
    let result = match killpg(target, signal) {
        Err(Errno::ESRCH) => kill(target, signal),
        other => other,
    };
    match result {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(SchedulerError::Process(format!(
            "向进程 {pid} 发送 {} 失败: {e}",
            signal.as_str()
        ))),
    }
}

/// 信号中继
///
/// 每台主机上的Worker进程消费发往本主机的 ProcessSignal 并投递给自己的子进程。
/// 目标执行已结束、pid 已变化或进程已退出的请求只标记为已投递，不产生任何效果。
#[derive(Clone)]
pub struct SignalRelay {
    repos: Repositories,
    hostname: String,
}

impl SignalRelay {
    pub fn new(repos: Repositories, hostname: impl Into<String>) -> Self {
        Self {
            repos,
            hostname: hostname.into(),
        }
    }

    /// 处理本主机所有未投递的信号，返回实际送达进程的数量
    pub async fn deliver_pending(&self) -> SchedulerResult<usize> {
        let mut sent = 0;
        for signal in self.repos.signals.find_undelivered(&self.hostname).await? {
            if self.targets_live_execution(&signal).await? {
                match send_signal(signal.pid, signal.number) {
                    Ok(true) => {
                        sent += 1;
                        info!(
                            signal_id = signal.id,
                            execution_id = ?signal.execution_id,
                            "已向进程 {} 发送信号 {}: {}",
                            signal.pid,
                            signal.number,
                            signal.message.as_deref().unwrap_or("")
                        );
                    }
                    Ok(false) => debug!(signal_id = signal.id, "进程 {} 已退出，忽略信号", signal.pid),
                    Err(e) => warn!(signal_id = signal.id, "投递信号失败: {}", e),
                }
            } else {
                debug!(signal_id = signal.id, "信号的目标执行已结束，跳过");
            }
            self.repos.signals.mark_delivered(signal.id, Utc::now()).await?;
        }
        Ok(sent)
    }

    async fn targets_live_execution(&self, signal: &ProcessSignal) -> SchedulerResult<bool> {
        let Some(execution_id) = signal.execution_id else {
            return Ok(true);
        };
        let execution = self.repos.executions.find_by_id(execution_id).await?;
        Ok(execution.is_some_and(|e| {
            !e.is_finished() && e.pid == Some(signal.pid) && e.hostname.as_deref() == Some(self.hostname.as_str())
        }))
    }

    pub async fn run(self, poll_interval: Duration, mut shutdown_rx: broadcast::Receiver<()>) -> SchedulerResult<()> {
        info!("启动信号中继: {}", self.hostname);
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("信号中继已停止");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.deliver_pending().await {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        error!("处理信号请求失败: {}", e);
                    }
                }
            }
        }
        Ok(())
    }
}
