pub mod config;
pub mod errors;
pub mod logging;

pub use config::{
    AppConfig, ConfigValidator, DatabaseConfig, DispatcherConfig, LoggingConfig,
    MemoryGuardConfig, SignalRelayConfig, ValidationUtils, WorkerConfig,
};
pub use errors::*;
pub use logging::init_logging;
