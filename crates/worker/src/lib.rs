//! Worker进程：认领执行、运行子进程、投递信号、监控内存

pub mod agent;
pub mod guard;
pub mod relay;
pub mod retry;
pub mod runner;
pub mod service;

pub use agent::{AgentSettings, WorkerAgent};
pub use guard::{MemoryGuard, MemorySampler, SysinfoSampler};
pub use relay::SignalRelay;
pub use retry::RetryPolicy;
pub use runner::{ProcessOutcome, ProcessRunner, RunnerSettings};
pub use service::WorkerService;
