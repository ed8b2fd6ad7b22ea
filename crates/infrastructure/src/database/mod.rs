pub mod manager;
pub mod mapping;
pub mod sqlite;

pub use manager::DatabaseManager;
pub use sqlite::{
    SqliteExecutionHistoryRepository, SqliteExecutionRepository, SqliteInstanceLogRepository,
    SqliteJobDefinitionRepository, SqliteJobInstanceRepository, SqliteMemoryRepository,
    SqliteProcessSignalRepository, SqliteTokenRepository, SqliteWorkerRepository,
};
