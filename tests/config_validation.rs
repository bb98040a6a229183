//! Integration tests for configuration validation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use serial_test::serial;
use std::time::Duration;
use tracing::Level;
use votifier_protocol::config::{
    KeyConfig, LoggingConfig, RateLimitConfig, ServerConfig, VotifierConfig, DEFAULT_PORT,
};

#[test]
fn test_default_config_validates() {
    let config = VotifierConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
    assert_eq!(config.server.address, format!("0.0.0.0:{DEFAULT_PORT}"));
}

#[test]
fn test_invalid_server_address() {
    let mut config = VotifierConfig::default();
    config.server.address = "invalid_address".to_string();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Invalid server address")));
}

#[test]
fn test_empty_server_address() {
    let mut config = VotifierConfig::default();
    config.server.address = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("cannot be empty")));
}

#[test]
fn test_address_checked_apart_from_limits() {
    let config = ServerConfig {
        address: "localhost:8192".to_string(),
        max_connections: 0,
        ..ServerConfig::default()
    };

    assert_eq!(config.validate_address().len(), 1);
    let limits = config.validate_limits();
    assert_eq!(limits.len(), 1);
    assert!(limits[0].contains("Max connections"));
    assert_eq!(config.validate().len(), 2);
}

#[test]
fn test_short_connection_timeout() {
    let config = ServerConfig {
        connection_timeout: Duration::from_millis(50),
        ..ServerConfig::default()
    };
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Connection timeout too short")));
}

#[test]
fn test_long_shutdown_timeout() {
    let config = ServerConfig {
        shutdown_timeout: Duration::from_secs(120),
        ..ServerConfig::default()
    };
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Shutdown timeout too long")));
}

#[test]
fn test_zero_max_connections() {
    let config = ServerConfig {
        max_connections: 0,
        ..ServerConfig::default()
    };
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Max connections must be greater than 0")));
}

#[test]
fn test_frame_size_bounds() {
    let tiny = ServerConfig {
        max_frame_size: 16,
        ..ServerConfig::default()
    };
    assert!(tiny.validate().iter().any(|e| e.contains("too small")));

    let huge = ServerConfig {
        max_frame_size: 70_000,
        ..ServerConfig::default()
    };
    assert!(huge
        .validate()
        .iter()
        .any(|e| e.contains("16-bit length prefix")));
}

#[test]
fn test_key_size_bounds() {
    let weak = KeyConfig {
        key_bits: 512,
        ..KeyConfig::default()
    };
    assert!(weak.validate().iter().any(|e| e.contains("too small")));

    let absurd = KeyConfig {
        key_bits: 16_384,
        ..KeyConfig::default()
    };
    assert!(absurd.validate().iter().any(|e| e.contains("too large")));
}

#[test]
fn test_empty_token_secret_rejected() {
    let mut keys = KeyConfig::default();
    keys.tokens.insert("ExampleList".into(), String::new());
    assert!(keys.validate().iter().any(|e| e.contains("empty secret")));
}

#[test]
fn test_quiet_period_shorter_than_window() {
    let config = RateLimitConfig {
        window: Duration::from_secs(60),
        quiet_period: Duration::from_secs(10),
        ..RateLimitConfig::default()
    };
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Quiet period")));
}

#[test]
fn test_unlimited_rate_limit_is_valid() {
    let config = RateLimitConfig::unlimited();
    assert!(config.validate().is_empty());
    assert_eq!(config.max_connections_per_window, 0);
    assert_eq!(config.max_votes_per_window, 0);
}

#[test]
fn test_no_protocol_servable() {
    let mut config = VotifierConfig::default();
    config.server.disable_v1 = true;
    config.keys.generate_default_token = false;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("no protocol can be served")));

    config.keys.tokens.insert("default".into(), "secret".into());
    assert!(config.validate().is_empty());
}

#[test]
fn test_empty_app_name() {
    let config = LoggingConfig {
        app_name: String::new(),
        ..LoggingConfig::default()
    };
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Application name cannot be empty")));
}

#[test]
fn test_validate_strict_with_valid_config() {
    assert!(VotifierConfig::default().validate_strict().is_ok());
}

#[test]
fn test_validate_strict_with_invalid_config() {
    let config = VotifierConfig::default_with_overrides(|c| {
        c.server.address = String::new();
        c.server.max_connections = 0;
    });

    let err = config.validate_strict().unwrap_err().to_string();
    assert!(err.contains("Configuration validation failed"));
    assert!(err.contains("cannot be empty"));
    assert!(err.contains("Max connections"));
}

#[test]
fn test_toml_round_trip() {
    let mut config = VotifierConfig::default();
    config.server.address = "127.0.0.1:8193".into();
    config.server.connection_timeout = Duration::from_millis(2500);
    config.keys.tokens.insert("ExampleList".into(), "abc123".into());
    config.logging.log_level = Level::DEBUG;

    let text = toml::to_string_pretty(&config).unwrap();
    let back = VotifierConfig::from_toml(&text).unwrap();

    assert_eq!(back.server.address, "127.0.0.1:8193");
    assert_eq!(back.server.connection_timeout, Duration::from_millis(2500));
    assert_eq!(back.keys.tokens.get("ExampleList").unwrap(), "abc123");
    assert_eq!(back.logging.log_level, Level::DEBUG);
}

#[test]
fn test_partial_toml_uses_defaults() {
    let text = r#"
        [server]
        address = "127.0.0.1:9000"
        connection_timeout = 1000
        shutdown_timeout = 1000
        max_connections = 10
        max_frame_size = 4096

        [keys.tokens]
        default = "s3cret"
    "#;
    let config = VotifierConfig::from_toml(text).unwrap();

    assert_eq!(config.server.max_connections, 10);
    assert!(!config.server.disable_v1);
    assert_eq!(config.keys.tokens.get("default").unwrap(), "s3cret");
    assert_eq!(config.rate_limit.max_votes_per_window, 30);
}

#[test]
fn test_invalid_log_level_rejected() {
    let text = r#"
        [logging]
        app_name = "votifier"
        log_level = "loud"
        json_format = false
    "#;
    assert!(VotifierConfig::from_toml(text).is_err());
}

#[test]
fn test_save_and_load_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("votifier.toml");

    let mut config = VotifierConfig::default();
    config.server.disable_v1 = true;
    config.keys.tokens.insert("default".into(), "file-secret".into());
    config.save_to_file(&path).unwrap();

    let loaded = VotifierConfig::from_file(&path).unwrap();
    assert!(loaded.server.disable_v1);
    assert_eq!(loaded.keys.tokens.get("default").unwrap(), "file-secret");
}

#[test]
fn test_missing_file_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = VotifierConfig::from_file(dir.path().join("absent.toml")).unwrap_err();
    assert!(err.to_string().contains("Failed to open config file"));
}

#[test]
fn test_example_config_parses() {
    let example = VotifierConfig::example_config();
    let parsed = VotifierConfig::from_toml(&example).unwrap();
    assert!(parsed.validate().is_empty());
}

#[test]
#[serial]
fn test_env_overrides() {
    std::env::set_var("VOTIFIER_ADDRESS", "127.0.0.1:7000");
    std::env::set_var("VOTIFIER_CONNECTION_TIMEOUT_MS", "1500");
    std::env::set_var("VOTIFIER_DISABLE_V1", "true");

    let config = VotifierConfig::from_env().unwrap();

    std::env::remove_var("VOTIFIER_ADDRESS");
    std::env::remove_var("VOTIFIER_CONNECTION_TIMEOUT_MS");
    std::env::remove_var("VOTIFIER_DISABLE_V1");

    assert_eq!(config.server.address, "127.0.0.1:7000");
    assert_eq!(config.server.connection_timeout, Duration::from_millis(1500));
    assert!(config.server.disable_v1);
}

#[test]
#[serial]
fn test_env_garbage_keeps_defaults() {
    std::env::set_var("VOTIFIER_CONNECTION_TIMEOUT_MS", "soon");

    let config = VotifierConfig::from_env().unwrap();
    std::env::remove_var("VOTIFIER_CONNECTION_TIMEOUT_MS");

    assert_eq!(
        config.server.connection_timeout,
        ServerConfig::default().connection_timeout
    );
}
