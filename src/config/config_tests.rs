use super::*;
use std::io::Write;
use tempfile::TempDir;

#[test]
fn test_default_config_values() {
    let config = ShellConfig::with_home("/tmp/shell-home");
    assert_eq!(config.pipe_interval_ms, DEFAULT_PIPE_INTERVAL_MS);
    assert_eq!(config.bunch_limit, DEFAULT_BUNCH_LIMIT);
    assert_eq!(config.bunch_sleep_ms, DEFAULT_BUNCH_SLEEP_MS);
    assert_eq!(config.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS);
    assert_eq!(config.log_retention_days, DEFAULT_LOG_RETENTION_DAYS);
}

#[test]
fn test_derived_paths_follow_home() {
    let config = ShellConfig::with_home("/tmp/shell-home");
    assert_eq!(
        config.log_root(),
        std::path::PathBuf::from("/tmp/shell-home/logs/scripts")
    );
    assert_eq!(
        config.err_root(),
        std::path::PathBuf::from("/tmp/shell-home/logs/err")
    );
    assert_eq!(
        config.store_root(),
        std::path::PathBuf::from("/tmp/shell-home/store")
    );
    assert_eq!(
        config.scripts_dir(),
        std::path::PathBuf::from("/tmp/shell-home/scripts")
    );
}

#[test]
fn test_explicit_roots_win() {
    let mut config = ShellConfig::with_home("/tmp/shell-home");
    config.log_root = Some("/var/log/scripts".into());
    assert_eq!(config.log_root(), std::path::PathBuf::from("/var/log/scripts"));
}

#[test]
fn test_runtime_table_overrides() {
    let mut config = ShellConfig::with_home("/tmp/shell-home");
    assert_eq!(config.runtime_table().get("js").map(String::as_str), Some("node"));

    config.runtimes.insert(".js".to_string(), "deno".to_string());
    config.runtimes.insert("rb".to_string(), "ruby".to_string());
    let table = config.runtime_table();
    assert_eq!(table.get("js").map(String::as_str), Some("deno"));
    assert_eq!(table.get("rb").map(String::as_str), Some("ruby"));
    assert_eq!(table.get("ts").map(String::as_str), Some("bun"));
}

#[test]
fn test_load_config_from_partial_json() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.json");
    let mut file = std::fs::File::create(&path).unwrap();
    write!(
        file,
        r#"{{"home": "{}", "bunchLimit": 2, "pipeIntervalMs": 10}}"#,
        temp_dir.path().display()
    )
    .unwrap();

    let config = load_config_from(&path).unwrap();
    assert_eq!(config.bunch_limit, 2);
    assert_eq!(config.pipe_interval_ms, 10);
    assert_eq!(config.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS);
    assert_eq!(config.home, temp_dir.path());
}

#[test]
fn test_load_config_from_invalid_json_is_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.json");
    std::fs::write(&path, "{ not json").unwrap();

    let err = load_config_from(&path).unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to parse config JSON"));
}

#[test]
fn test_config_serialization_roundtrip_uses_camel_case() {
    let config = ShellConfig::with_home("/tmp/shell-home");
    let json = serde_json::to_string(&config).unwrap();
    assert!(json.contains("pipeIntervalMs"));
    assert!(json.contains("requestTimeoutMs"));
    assert!(!json.contains("logRoot"));
}

#[test]
fn test_validate_rejects_unusable_values() {
    let mut config = ShellConfig::with_home("/tmp/shell-home");
    assert!(config.validate().is_ok());

    config.pipe_interval_ms = 0;
    let err = config.validate().unwrap_err();
    assert!(matches!(err, crate::error::ShellError::Config(_)));
    assert_eq!(err.user_message(), "Configuration issue: pipeIntervalMs must be positive");

    config.pipe_interval_ms = 10;
    config.log_retention_days = -1;
    assert!(config.validate().is_err());

    config.log_retention_days = 7;
    config.runtimes.insert("py".to_string(), " ".to_string());
    assert!(config.validate().unwrap_err().to_string().contains(".py"));
}

#[test]
fn test_load_config_from_rejects_invalid_values() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.json");
    std::fs::write(&path, r#"{"requestTimeoutMs": 0}"#).unwrap();

    let err = load_config_from(&path).unwrap_err();
    let chain = format!("{:#}", err);
    assert!(chain.contains("Invalid config"), "{}", chain);
    assert!(chain.contains("requestTimeoutMs must be positive"), "{}", chain);
}
