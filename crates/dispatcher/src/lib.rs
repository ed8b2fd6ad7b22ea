//! Dispatcher
//!
//! 中心调度进程：实例触发与准入、令牌树推进、实例终态决议、
//! 失联执行回收、历史归档与长时间运行提醒。

pub mod archiver;
pub mod executor;
pub mod lifecycle;
pub mod notifier;
pub mod reaper;
pub mod service;
pub mod trigger;
pub mod watchdog;

pub use archiver::HistoryArchiver;
pub use executor::{ExecutorSettings, TokenExecutor};
pub use lifecycle::LifecycleController;
pub use notifier::{LogNotifier, Notifier};
pub use reaper::ExecutionReaper;
pub use service::DispatcherService;
pub use trigger::TriggerService;
pub use watchdog::LongRunningWatchdog;
