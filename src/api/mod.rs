//! HTTP transport to the assistant server.
//!
//! All traffic to the tool/approval boundary uses two request shapes:
//!
//! - single-shot `POST <tool-path>` with `{args, approval}`, answered by a
//!   [`ToolInvocationResult`] ([`ConsoleClient::call_tool`]);
//! - streaming `POST <chat-stream-path>` with
//!   `{session_id, message, auto_approve}`, answered by an SSE body
//!   ([`ConsoleClient::open_chat_stream`]).
//!
//! The state machines depend on the [`ToolTransport`] and [`ChatTransport`]
//! traits rather than on the client, so they can be driven by fakes in tests.
//! Nothing in this module retries.

pub mod sse;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{ConsoleError, ConsoleResult};
use crate::types::{Config, ToolDescriptor, ToolInvocationRequest, ToolInvocationResult};

pub use sse::{FrameDecoder, FrameRead, FrameStream};

/// Registry listing path.
pub const REGISTRY_PATH: &str = "/api/system/registry";
/// Health check path.
pub const HEALTH_PATH: &str = "/api/system/health";
/// Chat session listing path.
pub const SESSIONS_PATH: &str = "/api/chat/sessions";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Body of a streaming chat request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatRequest {
    /// Session to continue; empty starts a new one.
    pub session_id: String,
    /// The user's message.
    pub message: String,
    /// Whether the server may run risky tools without approval.
    pub auto_approve: bool,
}

/// Depth of the health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthLevel {
    /// Fast liveness check.
    #[default]
    Quick,
    /// Full readiness check.
    Full,
}

impl HealthLevel {
    fn as_str(self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Full => "full",
        }
    }
}

/// A chat session known to the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionInfo {
    /// Session identifier.
    pub session_id: String,
    /// Number of stored messages.
    pub message_count: usize,
}

#[derive(Deserialize)]
struct RegistryTool {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    risky: bool,
    #[serde(default)]
    parameters: Value,
}

#[derive(Deserialize)]
struct RegistryResponse {
    #[serde(default)]
    tools: Vec<RegistryTool>,
    #[serde(default)]
    modules: std::collections::HashMap<String, String>,
    #[serde(default)]
    risky_tools: Vec<String>,
}

#[derive(Deserialize)]
struct DeleteResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Single-shot tool invocation.
#[allow(async_fn_in_trait)]
pub trait ToolTransport {
    /// Sends one tool call and decodes the result.
    ///
    /// # Errors
    ///
    /// Returns a local error for an invalid request, a transport error when
    /// no usable response arrives, or a protocol error for an undecodable
    /// response.
    async fn invoke(&self, request: &ToolInvocationRequest) -> ConsoleResult<ToolInvocationResult>;
}

/// Opening of a chat event stream.
#[allow(async_fn_in_trait)]
pub trait ChatTransport {
    /// Opens the stream for one turn. The token abandons it when cancelled.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the stream cannot be opened.
    async fn open_stream(
        &self,
        request: &ChatRequest,
        token: CancellationToken,
    ) -> ConsoleResult<FrameStream>;
}

impl<T: ToolTransport + ?Sized> ToolTransport for &T {
    async fn invoke(&self, request: &ToolInvocationRequest) -> ConsoleResult<ToolInvocationResult> {
        (**self).invoke(request).await
    }
}

impl<T: ToolTransport + ?Sized> ToolTransport for Arc<T> {
    async fn invoke(&self, request: &ToolInvocationRequest) -> ConsoleResult<ToolInvocationResult> {
        (**self).invoke(request).await
    }
}

impl<T: ChatTransport + ?Sized> ChatTransport for &T {
    async fn open_stream(
        &self,
        request: &ChatRequest,
        token: CancellationToken,
    ) -> ConsoleResult<FrameStream> {
        (**self).open_stream(request, token).await
    }
}

/// HTTP client for the assistant server.
#[derive(Clone)]
pub struct ConsoleClient {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<SecretString>,
    chat_stream_path: String,
    request_timeout: Duration,
}

impl std::fmt::Debug for ConsoleClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleClient")
            .field("base_url", &self.base_url)
            .field("chat_stream_path", &self.chat_stream_path)
            .finish_non_exhaustive()
    }
}

impl ConsoleClient {
    /// Creates a client from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the HTTP client
    /// cannot be built.
    pub fn new(config: &Config) -> ConsoleResult<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ConsoleError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url().trim_end_matches('/').to_string(),
            api_token: config.api_token().cloned(),
            chat_stream_path: config.chat_stream_path().to_string(),
            request_timeout: config.request_timeout(),
        })
    }

    /// Creates a client with default settings for the given base URL.
    ///
    /// This is primarily useful for testing with mock servers.
    #[must_use]
    pub fn new_with_base_url(base_url: &str) -> Self {
        let defaults = Config::default();
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: None,
            chat_stream_path: defaults.chat_stream_path().to_string(),
            request_timeout: defaults.request_timeout(),
        }
    }

    /// Returns the base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => builder.bearer_auth(token.expose_secret()),
            None => builder,
        }
    }

    /// Sends a request and returns the non-empty body of a success response.
    async fn send_for_body(&self, builder: reqwest::RequestBuilder, url: &str) -> ConsoleResult<String> {
        let response = self
            .authorized(builder)
            .timeout(self.request_timeout)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ConsoleError::http_status(status.as_u16(), body));
        }
        if body.trim().is_empty() {
            return Err(ConsoleError::empty_body(url));
        }
        Ok(body)
    }

    /// Sends a single-shot tool call.
    ///
    /// The request is validated before anything is sent.
    ///
    /// # Errors
    ///
    /// See [`ToolTransport::invoke`].
    pub async fn call_tool(
        &self,
        request: &ToolInvocationRequest,
    ) -> ConsoleResult<ToolInvocationResult> {
        request.validate()?;
        let url = self.url(&request.path);
        debug!(
            url = %url,
            dry_run = request.approval.is_dry_run(),
            confirm = request.approval.approval_id().is_some(),
            "sending tool call"
        );

        let body = self
            .send_for_body(self.client.post(&url).json(&request.body()), &url)
            .await?;
        let result: ToolInvocationResult = serde_json::from_str(&body)?;
        debug!(tool = %result.tool, status = %result.status, "tool call answered");
        Ok(result)
    }

    /// Opens the chat event stream for one turn.
    ///
    /// # Errors
    ///
    /// Returns a transport error for connection failures and non-success
    /// statuses.
    pub async fn open_chat_stream(
        &self,
        request: &ChatRequest,
        token: CancellationToken,
    ) -> ConsoleResult<FrameStream> {
        let url = self.url(&self.chat_stream_path);
        info!(url = %url, session = %request.session_id, "opening chat stream");

        let response = self
            .authorized(self.client.post(&url))
            .header("accept", "text/event-stream")
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConsoleError::http_status(status.as_u16(), body));
        }

        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(ConsoleError::from));
        Ok(FrameStream::from_chunks(chunks, token))
    }

    /// Fetches the tool registry.
    ///
    /// # Errors
    ///
    /// Returns a transport or protocol error.
    pub async fn registry(&self) -> ConsoleResult<Vec<ToolDescriptor>> {
        let url = self.url(REGISTRY_PATH);
        let body = self.send_for_body(self.client.get(&url), &url).await?;
        let registry: RegistryResponse = serde_json::from_str(&body)?;

        let mut tools: Vec<ToolDescriptor> = registry
            .tools
            .into_iter()
            .map(|tool| {
                let risky = tool.risky || registry.risky_tools.contains(&tool.name);
                ToolDescriptor {
                    path: ToolDescriptor::default_path(&tool.name),
                    module: registry.modules.get(&tool.name).cloned(),
                    name: tool.name,
                    description: tool.description,
                    parameters: tool.parameters,
                    risky,
                }
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(count = tools.len(), "loaded tool registry");
        Ok(tools)
    }

    /// Runs the server health check.
    ///
    /// # Errors
    ///
    /// Returns a transport or protocol error.
    pub async fn health(&self, level: HealthLevel) -> ConsoleResult<ToolInvocationResult> {
        let url = self.url(&format!("{HEALTH_PATH}?level={}", level.as_str()));
        let body = self.send_for_body(self.client.get(&url), &url).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Lists chat sessions held by the server.
    ///
    /// # Errors
    ///
    /// Returns a transport or protocol error.
    pub async fn list_sessions(&self) -> ConsoleResult<Vec<SessionInfo>> {
        let url = self.url(SESSIONS_PATH);
        let body = self.send_for_body(self.client.get(&url), &url).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Deletes a chat session. Returns `false` if the server did not know it.
    ///
    /// # Errors
    ///
    /// Returns a transport or protocol error.
    pub async fn delete_session(&self, session_id: &str) -> ConsoleResult<bool> {
        let url = self.url(&format!(
            "{SESSIONS_PATH}/{}",
            urlencoding::encode(session_id)
        ));
        let body = self.send_for_body(self.client.delete(&url), &url).await?;
        let response: DeleteResponse = serde_json::from_str(&body)?;
        if let Some(error) = response.error.filter(|_| !response.ok) {
            debug!(session = session_id, error = %error, "session delete refused");
        }
        Ok(response.ok)
    }
}

impl ToolTransport for ConsoleClient {
    async fn invoke(&self, request: &ToolInvocationRequest) -> ConsoleResult<ToolInvocationResult> {
        self.call_tool(request).await
    }
}

impl ChatTransport for ConsoleClient {
    async fn open_stream(
        &self,
        request: &ChatRequest,
        token: CancellationToken,
    ) -> ConsoleResult<FrameStream> {
        self.open_chat_stream(request, token).await
    }
}
