//! Configuration types for Toolgate.
//!
//! Configuration is resolved in layers:
//!
//! 1. Built-in defaults ([`Config::default`])
//! 2. The optional TOML file at [`Config::default_config_path`]
//! 3. Environment variables and command-line flags (applied by the binary)
//!
//! The API token is never read from the config file; it only comes from the
//! environment or the command line and is held as a [`SecretString`].

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{ConsoleError, ConsoleResult};

/// Default server base URL.
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";

/// Default path of the streaming chat endpoint.
pub const DEFAULT_CHAT_STREAM_PATH: &str = "/api/chat/stream";

/// Default timeout for single-shot requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// On-disk configuration. Every field is optional and overrides the default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Server base URL.
    pub base_url: Option<String>,
    /// Whether chat turns auto-approve risky tools.
    pub auto_approve: Option<bool>,
    /// Single-shot request timeout in humantime format (e.g. "30s").
    pub request_timeout: Option<String>,
    /// Path of the streaming chat endpoint.
    pub chat_stream_path: Option<String>,
}

/// Application configuration.
///
/// # Examples
///
/// ```
/// use toolgate::types::Config;
///
/// let config = Config::default()
///     .with_base_url("http://localhost:9000")
///     .with_auto_approve(true);
/// assert!(config.validate().is_ok());
/// assert!(config.auto_approve());
/// ```
#[derive(Clone)]
pub struct Config {
    base_url: String,
    api_token: Option<SecretString>,
    auto_approve: bool,
    request_timeout: Duration,
    chat_stream_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_token: None,
            auto_approve: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            chat_stream_path: DEFAULT_CHAT_STREAM_PATH.to_string(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("base_url", &self.base_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .field("auto_approve", &self.auto_approve)
            .field("request_timeout", &self.request_timeout)
            .field("chat_stream_path", &self.chat_stream_path)
            .finish()
    }
}

impl Config {
    /// Returns the default config file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the config directory cannot be determined.
    pub fn default_config_path() -> ConsoleResult<PathBuf> {
        let dirs = directories::ProjectDirs::from("com", "toolgate", "toolgate")
            .ok_or_else(|| ConsoleError::config("could not determine config directory"))?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Loads the defaults overlaid with a config file.
    ///
    /// A missing file is not an error; it yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> ConsoleResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .map_err(|e| ConsoleError::config(format!("{}: {e}", path.display())))?;
        let file: FileConfig = toml::from_str(&content)
            .map_err(|e| ConsoleError::config(format!("{}: {e}", path.display())))?;
        Self::default().merge(file)
    }

    /// Overlays a parsed config file onto this configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `request_timeout` is not a valid duration.
    pub fn merge(mut self, file: FileConfig) -> ConsoleResult<Self> {
        if let Some(base_url) = file.base_url {
            self.base_url = base_url;
        }
        if let Some(auto_approve) = file.auto_approve {
            self.auto_approve = auto_approve;
        }
        if let Some(timeout) = file.request_timeout {
            self.request_timeout = parse_timeout(&timeout)?;
        }
        if let Some(path) = file.chat_stream_path {
            self.chat_stream_path = path;
        }
        Ok(self)
    }

    /// Checks that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error for a non-http(s) base URL, a chat path that does not
    /// start with `/`, or a zero timeout.
    pub fn validate(&self) -> ConsoleResult<()> {
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(ConsoleError::config(format!(
                "invalid base_url '{}': expected http:// or https:// URL",
                self.base_url
            )));
        }
        if !self.chat_stream_path.starts_with('/') {
            return Err(ConsoleError::config(format!(
                "invalid chat_stream_path '{}': must start with '/'",
                self.chat_stream_path
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(ConsoleError::config("request_timeout must be positive"));
        }
        Ok(())
    }

    /// Sets the server base URL. A trailing slash is dropped.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Sets the bearer token sent with every request.
    #[must_use]
    pub fn with_api_token(mut self, token: SecretString) -> Self {
        self.api_token = Some(token);
        self
    }

    /// Sets whether chat turns auto-approve risky tools.
    #[must_use]
    pub fn with_auto_approve(mut self, auto_approve: bool) -> Self {
        self.auto_approve = auto_approve;
        self
    }

    /// Sets the single-shot request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Returns the server base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the bearer token, if any.
    #[must_use]
    pub fn api_token(&self) -> Option<&SecretString> {
        self.api_token.as_ref()
    }

    /// Returns whether chat turns auto-approve risky tools.
    #[must_use]
    pub fn auto_approve(&self) -> bool {
        self.auto_approve
    }

    /// Returns the single-shot request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Returns the chat stream path.
    #[must_use]
    pub fn chat_stream_path(&self) -> &str {
        &self.chat_stream_path
    }
}

/// Parses a humantime duration such as `"30s"` or `"2m"`.
///
/// # Errors
///
/// Returns a config error for unparseable input.
pub fn parse_timeout(value: &str) -> ConsoleResult<Duration> {
    humantime::parse_duration(value.trim())
        .map_err(|e| ConsoleError::config(format!("invalid request_timeout '{value}': {e}")))
}
