pub mod sqlite_execution_history_repository;
pub mod sqlite_execution_repository;
pub mod sqlite_instance_log_repository;
pub mod sqlite_job_definition_repository;
pub mod sqlite_job_instance_repository;
pub mod sqlite_memory_repository;
pub mod sqlite_process_signal_repository;
pub mod sqlite_token_repository;
pub mod sqlite_worker_repository;

pub use sqlite_execution_history_repository::SqliteExecutionHistoryRepository;
pub use sqlite_execution_repository::SqliteExecutionRepository;
pub use sqlite_instance_log_repository::SqliteInstanceLogRepository;
pub use sqlite_job_definition_repository::SqliteJobDefinitionRepository;
pub use sqlite_job_instance_repository::SqliteJobInstanceRepository;
pub use sqlite_memory_repository::SqliteMemoryRepository;
pub use sqlite_process_signal_repository::SqliteProcessSignalRepository;
pub use sqlite_token_repository::SqliteTokenRepository;
pub use sqlite_worker_repository::SqliteWorkerRepository;
