use scheduler_core::AppConfig;
use std::io::Write;

#[test]
fn test_default_config_is_valid() {
    let config = AppConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.worker.queue, "@default");
    assert_eq!(config.dispatcher.worker_heartbeat_timeout_seconds, 90);
}

#[test]
fn test_from_toml_partial_sections() {
    let toml = r#"
        [database]
        url = "sqlite::memory:"
        max_connections = 2

        [worker]
        hostname = "batch-01"
        worker_count = 4
        queue = "heavy"
    "#;

    let config = AppConfig::from_toml(toml).unwrap();
    assert_eq!(config.database.url, "sqlite::memory:");
    assert_eq!(config.database.max_connections, 2);
    assert_eq!(config.worker.hostname, "batch-01");
    assert_eq!(config.worker.worker_count, 4);
    assert_eq!(config.worker.queue, "heavy");
    // 未出现的配置节使用默认值
    assert_eq!(config.logging.level, "info");
    assert!(config.memory_guard.enabled);
}

#[test]
fn test_invalid_database_url_rejected() {
    let toml = r#"
        [database]
        url = "postgres://localhost/scheduler"
    "#;
    assert!(AppConfig::from_toml(toml).is_err());
}

#[test]
fn test_invalid_worker_count_rejected() {
    let toml = r#"
        [worker]
        worker_count = 0
    "#;
    assert!(AppConfig::from_toml(toml).is_err());
}

#[test]
fn test_invalid_log_format_rejected() {
    let toml = r#"
        [logging]
        format = "xml"
    "#;
    assert!(AppConfig::from_toml(toml).is_err());
}

#[test]
fn test_load_from_file_and_roundtrip_toml() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        r#"
[dispatcher]
tick_interval_millis = 250
cancel_timeout_seconds = 60

[logging]
format = "json"
"#
    )
    .unwrap();

    let config = AppConfig::load(Some(file.path().to_str().unwrap())).unwrap();
    assert_eq!(config.dispatcher.tick_interval_millis, 250);
    assert_eq!(config.dispatcher.cancel_timeout_seconds, 60);
    assert_eq!(config.logging.format, "json");

    let serialized = config.to_toml().unwrap();
    let reparsed = AppConfig::from_toml(&serialized).unwrap();
    assert_eq!(reparsed.dispatcher.tick_interval_millis, 250);
}

#[test]
fn test_load_missing_file_fails() {
    assert!(AppConfig::load(Some("/nonexistent/scheduler.toml")).is_err());
}
