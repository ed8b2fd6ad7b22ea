//! 应用配置
//!
//! 加载顺序: 默认值 → TOML配置文件 → `SCHEDULER_` 前缀环境变量。

pub mod models;
pub mod validation;

pub use models::{
    AppConfig, DatabaseConfig, DispatcherConfig, LoggingConfig, MemoryGuardConfig,
    SignalRelayConfig, WorkerConfig,
};
pub use validation::{ConfigValidator, ValidationUtils};
