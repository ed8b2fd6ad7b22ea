use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use scheduler_core::{SchedulerError, SchedulerResult, WorkerConfig};
use scheduler_domain::{Execution, Repositories, DEFAULT_SIGNAL};

use crate::relay::send_signal;
use crate::retry::RetryPolicy;

/// 进程退出后等待输出管道关闭的最长时间，后台子进程可能一直持有管道
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const TRUNCATION_NOTICE: &str = "...[输出超出上限，后续内容已丢弃]\n";

/// 每次从管道读取的最大字节数
const READ_CHUNK_BYTES: usize = 8 * 1024;

/// 读取任务与执行循环之间最多缓冲的块数
const OUTPUT_CHANNEL_CAPACITY: usize = 16;

/// 记录pid的最多尝试次数，失败后终止进程
const RECORD_PID_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub shell: String,
    pub output_limit_bytes: usize,
    pub output_flush_interval: Duration,
    pub store_retry: RetryPolicy,
}

impl From<&WorkerConfig> for RunnerSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            output_limit_bytes: config.output_limit_bytes,
            output_flush_interval: config.output_flush_interval(),
            store_retry: RetryPolicy::default(),
        }
    }
}

/// 进程的退出信息，两者皆空表示进程未能启动
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub exit_status: Option<i32>,
    pub term_signal: Option<i32>,
}

/// 把一个已认领的执行变成子进程
///
/// 子进程以 `shell -c <命令>` 启动并独占一个进程组，执行上下文以环境变量传入。
/// 标准输出与标准错误合并后按刷新间隔追加到执行记录。
pub struct ProcessRunner {
    repos: Repositories,
    settings: RunnerSettings,
}

impl ProcessRunner {
    pub fn new(repos: Repositories, settings: RunnerSettings) -> Self {
        Self { repos, settings }
    }

    pub async fn run(&self, execution: &Execution) -> SchedulerResult<ProcessOutcome> {
        let mut command = Command::new(&self.settings.shell);
        command
            .arg("-c")
            .arg(&execution.shell)
            .envs(&execution.context)
            .env("SCHEDULER_JOB_INSTANCE_ID", execution.job_instance_id.to_string())
            .env("SCHEDULER_EXECUTION_ID", execution.id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(execution_id = execution.id, "启动进程失败: {}", e);
                self.repos
                    .executions
                    .append_output(execution.id, &format!("启动进程失败: {e}\n"))
                    .await?;
                return Ok(ProcessOutcome::default());
            }
        };

        if let Err(e) = self.record_pid(execution, &mut child).await {
            error!(execution_id = execution.id, "{}", e);
            let note = format!("{e}\n");
            if let Err(e) = self.repos.executions.append_output(execution.id, &note).await {
                warn!(execution_id = execution.id, "写入执行输出失败: {}", e);
            }
            return Err(e);
        }

        let (tx, mut rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, tx);
        }

        let mut output = OutputBuffer::new(self.settings.output_limit_bytes);
        let mut flush = tokio::time::interval(self.settings.output_flush_interval);
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let status = loop {
            tokio::select! {
                Some(chunk) = rx.recv() => output.push(&chunk),
                status = child.wait() => break status?,
                _ = flush.tick() => self.flush(execution.id, &mut output).await,
            }
        };

        let drain = async {
            while let Some(chunk) = rx.recv().await {
                output.push(&chunk);
            }
        };
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drain).await.is_err() {
            debug!(execution_id = execution.id, "输出管道仍被后台进程占用，停止读取");
        }
        self.flush(execution.id, &mut output).await;

        let outcome = ProcessOutcome {
            exit_status: status.code(),
            term_signal: status.signal(),
        };
        info!(
            execution_id = execution.id,
            "进程结束: exit_status={:?}, term_signal={:?}", outcome.exit_status, outcome.term_signal
        );
        Ok(outcome)
    }

    /// 记录pid，存储持续失败时终止刚启动的进程，避免留下无法被信号触达的进程
    async fn record_pid(&self, execution: &Execution, child: &mut Child) -> SchedulerResult<()> {
        let Some(pid) = child.id().map(|pid| pid as i32) else {
            return Ok(());
        };
        let recorded = self
            .settings
            .store_retry
            .clone()
            .with_max_attempts(RECORD_PID_ATTEMPTS)
            .run("记录进程pid", || self.repos.executions.record_pid(execution.id, pid, Utc::now()))
            .await;

        match recorded {
            Ok(true) => {
                debug!(execution_id = execution.id, "进程已启动: pid={}", pid);
                Ok(())
            }
            // 启动前执行已被强制结束，进程照常回收
            Ok(false) => {
                warn!(execution_id = execution.id, "执行已结束，终止刚启动的进程 {}", pid);
                if let Err(e) = send_signal(pid, DEFAULT_SIGNAL) {
                    error!(execution_id = execution.id, "终止进程失败: {}", e);
                }
                Ok(())
            }
            Err(e) => {
                if let Err(kill_error) = send_signal(pid, DEFAULT_SIGNAL) {
                    warn!(execution_id = execution.id, "终止进程组失败: {}", kill_error);
                }
                if let Err(kill_error) = child.kill().await {
                    warn!(execution_id = execution.id, "强制结束进程失败: {}", kill_error);
                }
                Err(SchedulerError::Process(format!("记录进程 {pid} 失败，进程已被终止: {e}")))
            }
        }
    }

    async fn flush(&self, execution_id: i64, output: &mut OutputBuffer) {
        let Some(chunk) = output.take() else {
            return;
        };
        if let Err(e) = self.repos.executions.append_output(execution_id, &chunk).await {
            warn!(execution_id, "写入执行输出失败，稍后重试: {}", e);
            output.restore(chunk);
        }
    }
}

/// 按固定大小的块读取管道，直到对端关闭
fn spawn_reader<R>(mut reader: R, tx: mpsc::Sender<Vec<u8>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = [0u8; READ_CHUNK_BYTES];
        loop {
            match reader.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buffer[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// 待写入的输出，超过上限后丢弃后续字节并只追加一次截断提示
#[derive(Debug)]
struct OutputBuffer {
    pending: Vec<u8>,
    written: usize,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    fn new(limit: usize) -> Self {
        Self {
            pending: Vec::new(),
            written: 0,
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        if self.truncated {
            return;
        }
        let room = self.limit.saturating_sub(self.written + self.pending.len());
        if chunk.len() <= room {
            self.pending.extend_from_slice(chunk);
            return;
        }
        self.pending.extend_from_slice(&chunk[..room]);
        self.truncated = true;
        self.pending.extend_from_slice(TRUNCATION_NOTICE.as_bytes());
    }

    /// 取出可写入的文本，末尾不完整的 UTF-8 字符留到下一次
    fn take(&mut self) -> Option<String> {
        let complete = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(e) if e.error_len().is_none() && !self.truncated => e.valid_up_to(),
            Err(_) => self.pending.len(),
        };
        if complete == 0 {
            return None;
        }
        let rest = self.pending.split_off(complete);
        let bytes = std::mem::replace(&mut self.pending, rest);
        self.written += bytes.len();
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// 写入失败时放回，保持顺序
    fn restore(&mut self, chunk: String) {
        let mut bytes = chunk.into_bytes();
        self.written = self.written.saturating_sub(bytes.len());
        bytes.append(&mut self.pending);
        self.pending = bytes;
    }
}
