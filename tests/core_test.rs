//! Core functionality tests

use std::time::Instant;

#[test]
fn test_error_handling_basics() {
    use mcp_core::error::{AppError, AppResult, ErrorSeverity};
    use mcp_core::mcp::MCPError;

    let error = AppError::application("test error");
    assert!(error.is_recoverable());
    assert_eq!(error.severity(), ErrorSeverity::Medium);

    let protocol: AppError = MCPError::internal("boom").into();
    assert_eq!(protocol.severity(), ErrorSeverity::Critical);
    assert_eq!(protocol.severity().as_str(), "CRITICAL");
    assert!(protocol.is_recoverable());

    let closed: AppError = MCPError::connection_closed("gone").into();
    assert!(!closed.is_recoverable());

    let result: AppResult<()> = Err(error);
    assert!(result.is_err());

    println!("✓ Error handling works correctly");
}

#[test]
fn test_configuration_defaults() {
    use mcp_core::config::Config;

    let config = Config::default();

    assert_eq!(config.client.name, "mcp-core-client");
    assert_eq!(config.client.protocol_version, "2024-11-05");
    assert!(config.client.request_timeout_ms > 0);
    assert!(config.client.connect_timeout_ms > 0);

    assert_eq!(config.server.name, "mcp-core-server");
    assert!(config.server.tools && config.server.resources && config.server.prompts);

    assert_eq!(config.logging.level, "mcp_core=info");
    assert!(config.validate().is_ok());

    println!("✓ Configuration defaults are correct");
}

#[tokio::test]
async fn test_config_file_round_trip() {
    use mcp_core::config::Config;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("mcp-core.toml");

    let mut config = Config::default();
    config.client.name = "round-trip".to_string();
    config.client.auth_token = Some("secret".to_string());
    config.server.resource_subscribe = false;

    config.save_to_file(&path).await.unwrap();
    let loaded = Config::load_from_file(&path).await.unwrap();

    assert_eq!(loaded, config);
    let server = loaded.server_config();
    assert!(!server.capabilities.resources.unwrap().subscribe);

    println!("✓ Configuration survives save and load");
}

#[tokio::test]
async fn test_invalid_config_file_rejected() {
    use mcp_core::{config::Config, error::AppError};
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[client]\nrequest_timeout_ms = 0").unwrap();
    let err = Config::load_from_file(file.path()).await.unwrap_err();
    assert!(matches!(err, AppError::Invalid { .. }));

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[client\nname = ").unwrap();
    let err = Config::load_from_file(file.path()).await.unwrap_err();
    assert!(matches!(err, AppError::TomlDe(_)));

    println!("✓ Invalid configuration files are rejected");
}

#[test]
fn test_env_overrides_file() {
    use mcp_core::config::Config;
    use std::io::Write;

    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "[client]\nname = \"from-file\"\nrequest_timeout_ms = 1500").unwrap();

    std::env::set_var("MCP_CLIENT__REQUEST_TIMEOUT_MS", "2500");
    let config = Config::load_with_env(Some(file.path()));
    std::env::remove_var("MCP_CLIENT__REQUEST_TIMEOUT_MS");

    let config = config.unwrap();
    assert_eq!(config.client.name, "from-file");
    assert_eq!(config.client.request_timeout_ms, 2500);

    println!("✓ Environment variables override file settings");
}

#[test]
fn test_logging_initialization() {
    use mcp_core::initialize_logging;

    let start_time = Instant::now();
    // A subscriber may already be installed by another test in this binary.
    let _ = initialize_logging();
    assert!(start_time.elapsed().as_millis() < 50);

    println!("✓ Logging initialized");
}
