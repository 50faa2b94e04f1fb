//! Stream event types for chat turns.
//!
//! The chat endpoint answers with Server-Sent Events. The decoder in
//! [`crate::api::sse`] turns the byte stream into [`StreamFrame`]s; this module
//! maps a frame onto the typed [`TurnEvent`] the turn state machine consumes.
//!
//! # Wire protocol
//!
//! | event               | payload                                   |
//! |---------------------|-------------------------------------------|
//! | `session`           | `{session_id}`                            |
//! | `token`             | `{text}`                                  |
//! | `tool_start`        | `{tool, args, call_id?}`                  |
//! | `tool_result`       | `{tool, result, elapsed_ms?, call_id?}`   |
//! | `approval_required` | `{tool, args, tool_call_id?}`             |
//! | `done`              | `{session_id?, message_count?}`           |
//! | `error`             | `{message}`                               |
//!
//! Frames with an unknown name or a payload missing required fields map to
//! `None` and are dropped by the caller, exactly like a corrupt frame.

use serde::Deserialize;
use serde_json::Value;

use super::tool::ToolArgs;

/// One named frame parsed out of the event stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFrame {
    /// The `event:` field (defaults to `message`).
    pub event: String,
    /// The parsed `data:` payload.
    pub data: Value,
}

impl StreamFrame {
    /// Creates a frame.
    #[must_use]
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// A typed event of one assistant turn, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// The server bound (or re-bound) the conversation session.
    SessionOpened {
        /// Session identifier for follow-up turns.
        session_id: String,
    },

    /// A fragment of assistant text.
    TextDelta(String),

    /// The server started executing a tool.
    ToolStarted {
        /// Tool name.
        tool: String,
        /// Arguments the tool was called with.
        args: ToolArgs,
        /// Server-issued call id, when the transport supplies one.
        call_id: Option<String>,
    },

    /// A tool finished.
    ToolFinished {
        /// Tool name.
        tool: String,
        /// Result text as delivered.
        result: String,
        /// Server-side execution time in milliseconds.
        elapsed_ms: Option<f64>,
        /// Server-issued call id, when the transport supplies one.
        call_id: Option<String>,
    },

    /// A risky tool needs a human decision outside the chat surface.
    ApprovalNeeded {
        /// Tool name.
        tool: String,
        /// Arguments the tool would run with.
        args: ToolArgs,
        /// Server-issued call id, when the transport supplies one.
        call_id: Option<String>,
    },

    /// The turn completed.
    TurnDone,

    /// The turn failed on the server.
    TurnError(String),
}

#[derive(Deserialize)]
struct SessionPayload {
    session_id: String,
}

#[derive(Deserialize)]
struct TokenPayload {
    text: String,
}

#[derive(Deserialize)]
struct ToolStartPayload {
    tool: String,
    #[serde(default)]
    args: ToolArgs,
    #[serde(default)]
    call_id: Option<String>,
}

#[derive(Deserialize)]
struct ToolResultPayload {
    tool: String,
    #[serde(default)]
    result: String,
    #[serde(default)]
    elapsed_ms: Option<f64>,
    #[serde(default)]
    call_id: Option<String>,
}

#[derive(Deserialize)]
struct ApprovalPayload {
    tool: String,
    #[serde(default)]
    args: ToolArgs,
    #[serde(default, alias = "call_id")]
    tool_call_id: Option<String>,
}

#[derive(Deserialize)]
struct ErrorPayload {
    message: String,
}

impl TurnEvent {
    /// Maps a decoded frame onto a turn event.
    ///
    /// Returns `None` for unknown event names and malformed payloads.
    #[must_use]
    pub fn from_frame(frame: &StreamFrame) -> Option<Self> {
        let data = frame.data.clone();
        let event = match frame.event.as_str() {
            "session" => {
                let p: SessionPayload = serde_json::from_value(data).ok()?;
                Self::SessionOpened {
                    session_id: p.session_id,
                }
            }
            "token" => {
                let p: TokenPayload = serde_json::from_value(data).ok()?;
                Self::TextDelta(p.text)
            }
            "tool_start" => {
                let p: ToolStartPayload = serde_json::from_value(data).ok()?;
                Self::ToolStarted {
                    tool: p.tool,
                    args: p.args,
                    call_id: non_empty(p.call_id),
                }
            }
            "tool_result" => {
                let p: ToolResultPayload = serde_json::from_value(data).ok()?;
                Self::ToolFinished {
                    tool: p.tool,
                    result: p.result,
                    elapsed_ms: p.elapsed_ms,
                    call_id: non_empty(p.call_id),
                }
            }
            "approval_required" => {
                let p: ApprovalPayload = serde_json::from_value(data).ok()?;
                Self::ApprovalNeeded {
                    tool: p.tool,
                    args: p.args,
                    call_id: non_empty(p.tool_call_id),
                }
            }
            "done" => Self::TurnDone,
            "error" => {
                let p: ErrorPayload = serde_json::from_value(data).ok()?;
                Self::TurnError(p.message)
            }
            _ => return None,
        };
        Some(event)
    }

    /// Returns `true` for `TurnDone` and `TurnError`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TurnDone | Self::TurnError(_))
    }

    /// Extracts the text if this is a text delta.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::TextDelta(text) => Some(text),
            _ => None,
        }
    }
}

fn non_empty(id: Option<String>) -> Option<String> {
    id.filter(|id| !id.is_empty())
}
