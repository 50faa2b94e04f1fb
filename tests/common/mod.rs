//! Common test utilities and fixtures for Toolgate.
//!
//! This module provides shared test infrastructure including:
//! - A temp-dir context for config file tests
//! - SSE body builders
//! - Scripted transports standing in for the server

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Mutex;

use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use toolgate::api::{ChatRequest, ChatTransport, FrameStream, ToolTransport};
use toolgate::error::{ConsoleError, ConsoleResult};
use toolgate::types::{ToolArgs, ToolInvocationRequest, ToolInvocationResult};

/// Test context providing common setup for integration tests.
pub struct TestContext {
    /// Temporary directory for test file operations.
    pub temp_dir: tempfile::TempDir,
}

impl TestContext {
    /// Creates a new test context with a temporary directory.
    ///
    /// # Panics
    ///
    /// Panics if the temporary directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        Self {
            temp_dir: tempfile::tempdir().expect("failed to create temp dir"),
        }
    }

    /// Returns the path to the temporary directory.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.temp_dir.path().to_path_buf()
    }

    /// Creates a file in the temporary directory with the given content.
    pub fn create_file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        std::fs::write(&path, content).expect("failed to write file");
        path
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Renders `(event, data)` pairs as an SSE body.
pub fn sse_body(frames: &[(&str, Value)]) -> String {
    frames
        .iter()
        .map(|(event, data)| format!("event: {event}\ndata: {data}\n\n"))
        .collect()
}

/// Converts a JSON object literal into tool arguments.
pub fn args(value: Value) -> ToolArgs {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// Parses a server answer.
pub fn answer(value: Value) -> ConsoleResult<ToolInvocationResult> {
    Ok(serde_json::from_value(value).expect("invalid ToolInvocationResult fixture"))
}

/// Chat transport that replays fixed chunks.
///
/// With `hang` set the stream never closes after the last chunk, like a
/// server that stalls mid-turn.
#[derive(Default)]
pub struct ScriptedChat {
    pub chunks: Vec<Vec<u8>>,
    pub hang: bool,
    pub fail_open: bool,
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedChat {
    pub fn replaying(body: &str) -> Self {
        Self {
            chunks: vec![body.as_bytes().to_vec()],
            ..Self::default()
        }
    }

    pub fn stalling(body: &str) -> Self {
        Self {
            hang: true,
            ..Self::replaying(body)
        }
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl ChatTransport for ScriptedChat {
    async fn open_stream(
        &self,
        request: &ChatRequest,
        token: CancellationToken,
    ) -> ConsoleResult<FrameStream> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail_open {
            return Err(ConsoleError::http_status(503, "unavailable"));
        }
        let chunks = futures::stream::iter(self.chunks.clone().into_iter().map(Ok));
        if self.hang {
            Ok(FrameStream::from_chunks(
                chunks.chain(futures::stream::pending()),
                token,
            ))
        } else {
            Ok(FrameStream::from_chunks(chunks, token))
        }
    }
}

/// Tool transport that replays canned answers in order and records every
/// request it was given.
#[derive(Default)]
pub struct RecordingTransport {
    answers: Mutex<Vec<ConsoleResult<ToolInvocationResult>>>,
    sent: Mutex<Vec<ToolInvocationRequest>>,
}

impl RecordingTransport {
    pub fn answering(answers: Vec<ConsoleResult<ToolInvocationResult>>) -> Self {
        let mut answers = answers;
        answers.reverse();
        Self {
            answers: Mutex::new(answers),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<ToolInvocationRequest> {
        self.sent.lock().unwrap().clone()
    }
}

impl ToolTransport for RecordingTransport {
    async fn invoke(&self, request: &ToolInvocationRequest) -> ConsoleResult<ToolInvocationResult> {
        self.sent.lock().unwrap().push(request.clone());
        self.answers
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Err(ConsoleError::network("no scripted answer")))
    }
}
