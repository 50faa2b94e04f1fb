//! Tests for loading configuration files.

use std::time::Duration;

use toolgate::types::config::{DEFAULT_BASE_URL, DEFAULT_CHAT_STREAM_PATH};
use toolgate::types::Config;

use crate::common::TestContext;

#[test]
fn test_missing_file_yields_defaults() {
    let ctx = TestContext::new();
    let config = Config::load(&ctx.path().join("absent.toml")).unwrap();
    assert_eq!(config.base_url(), DEFAULT_BASE_URL);
    assert_eq!(config.chat_stream_path(), DEFAULT_CHAT_STREAM_PATH);
}

#[test]
fn test_file_overrides_defaults() {
    let ctx = TestContext::new();
    let path = ctx.create_file(
        "config.toml",
        r#"
base_url = "https://agent.internal:8443"
auto_approve = true
request_timeout = "2m"
"#,
    );

    let config = Config::load(&path).unwrap();
    assert_eq!(config.base_url(), "https://agent.internal:8443");
    assert!(config.auto_approve());
    assert_eq!(config.request_timeout(), Duration::from_secs(120));
    assert!(config.validate().is_ok());
}

#[test]
fn test_unknown_keys_are_rejected() {
    let ctx = TestContext::new();
    let path = ctx.create_file("config.toml", "api_token = \"leaked\"\n");
    let err = Config::load(&path).unwrap_err();
    assert!(err.to_string().contains("config"));
}

#[test]
fn test_invalid_url_fails_validation() {
    let ctx = TestContext::new();
    let path = ctx.create_file("config.toml", "base_url = \"localhost:8000\"\n");
    let config = Config::load(&path).unwrap();
    assert!(config.validate().is_err());
}
