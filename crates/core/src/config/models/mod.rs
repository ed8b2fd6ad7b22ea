pub mod app_config;
pub mod database;
pub mod dispatcher_worker;

pub use app_config::{AppConfig, LoggingConfig};
pub use database::DatabaseConfig;
pub use dispatcher_worker::{DispatcherConfig, MemoryGuardConfig, SignalRelayConfig, WorkerConfig};
