//! Centralized error types for Toolgate.
//!
//! Every failure the orchestration engine can report falls into one of the
//! categories below. Keeping them in one enum lets callers decide how to
//! render a failure without string matching:
//!
//! - **Transport**: the request never produced a usable response
//!   (network failure, non-success HTTP status, empty body). Never retried
//!   automatically.
//! - **Protocol**: the server answered with something that breaks the wire
//!   contract (for example a `needs_approval` result without an approval id).
//! - **Domain**: a well-formed `status: error` result, whose server text is
//!   carried verbatim, or a gated tool refused to run without approval.
//! - **Local**: rejected before any network call (invalid approval
//!   directive, nothing to confirm, stale approval id, bad configuration).
//!
//! Cancellation is deliberately absent: a cancelled turn is a terminal state,
//! not an error.
//!
//! # Example
//!
//! ```
//! use toolgate::error::{ConsoleError, ErrorKind};
//!
//! let err = ConsoleError::nothing_to_confirm();
//! assert_eq!(err.kind(), ErrorKind::Local);
//! assert!(err.to_string().contains("nothing to confirm"));
//! ```

use thiserror::Error;

/// Result type alias using `ConsoleError`.
pub type ConsoleResult<T> = Result<T, ConsoleError>;

/// Broad category of a [`ConsoleError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network failure, bad status or empty body.
    Transport,
    /// Response violated the wire contract.
    Protocol,
    /// Server reported `status: error`.
    Domain,
    /// Rejected locally before any request was sent.
    Local,
}

/// Centralized error type for Toolgate.
#[derive(Debug, Error)]
pub enum ConsoleError {
    // ============== Transport Errors ==============
    /// The request could not be sent or the connection failed mid-way.
    #[error("transport: network error: {message}")]
    Network {
        /// Description of the network error.
        message: String,
    },

    /// The server answered with a non-success HTTP status.
    #[error("transport: HTTP {status}: {body}")]
    HttpStatus {
        /// The HTTP status code.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },

    /// The server answered with an empty body where one was required.
    #[error("transport: empty response body from {url}")]
    EmptyBody {
        /// The URL that returned nothing.
        url: String,
    },

    // ============== Protocol Errors ==============
    /// The response could not be decoded or broke an invariant.
    #[error("protocol: invalid response: {message}")]
    InvalidResponse {
        /// Description of the violation.
        message: String,
    },

    // ============== Domain Errors ==============
    /// The tool reported `status: error`.
    #[error("{tool}: {message}")]
    Tool {
        /// Echoed tool name.
        tool: String,
        /// Server-provided error text, verbatim.
        message: String,
    },

    /// A direct call was answered with `needs_approval`: the tool is gated
    /// and must go through preview and confirm.
    #[error("{tool}: approval required, preview the call first")]
    ApprovalRequired {
        /// Echoed tool name.
        tool: String,
    },

    // ============== Local Errors ==============
    /// An approval directive combination the server does not recognize.
    #[error("invalid approval directive: {reason}")]
    InvalidDirective {
        /// Why the combination was rejected.
        reason: String,
    },

    /// `confirm()` was called with no pending approval.
    #[error("nothing to confirm")]
    NothingToConfirm,

    /// `confirm` was called with an approval id that is no longer pending.
    #[error("nothing to confirm: approval '{approval_id}' is no longer pending")]
    StaleApproval {
        /// The stale approval id.
        approval_id: String,
    },

    /// Configuration could not be loaded or failed validation.
    #[error("config: {message}")]
    Config {
        /// Description of the configuration problem.
        message: String,
    },
}

// ============== Constructor Methods ==============

impl ConsoleError {
    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates an HTTP status error.
    #[must_use]
    pub fn http_status(status: u16, body: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            body: body.into(),
        }
    }

    /// Creates an empty body error.
    #[must_use]
    pub fn empty_body(url: impl Into<String>) -> Self {
        Self::EmptyBody { url: url.into() }
    }

    /// Creates an invalid response error.
    #[must_use]
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            message: message.into(),
        }
    }

    /// Creates a domain error from a tool's `status: error` result.
    #[must_use]
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Creates the error for a gated tool called directly.
    #[must_use]
    pub fn approval_required(tool: impl Into<String>) -> Self {
        Self::ApprovalRequired { tool: tool.into() }
    }

    /// Creates an invalid directive error.
    #[must_use]
    pub fn invalid_directive(reason: impl Into<String>) -> Self {
        Self::InvalidDirective {
            reason: reason.into(),
        }
    }

    /// Creates the "nothing to confirm" error.
    #[must_use]
    pub fn nothing_to_confirm() -> Self {
        Self::NothingToConfirm
    }

    /// Creates a stale approval error.
    #[must_use]
    pub fn stale_approval(approval_id: impl Into<String>) -> Self {
        Self::StaleApproval {
            approval_id: approval_id.into(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

// ============== Category Methods ==============

impl ConsoleError {
    /// Returns the broad category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network { .. } | Self::HttpStatus { .. } | Self::EmptyBody { .. } => {
                ErrorKind::Transport
            }
            Self::InvalidResponse { .. } => ErrorKind::Protocol,
            Self::Tool { .. } | Self::ApprovalRequired { .. } => ErrorKind::Domain,
            Self::InvalidDirective { .. }
            | Self::NothingToConfirm
            | Self::StaleApproval { .. }
            | Self::Config { .. } => ErrorKind::Local,
        }
    }

    /// Returns `true` for transport failures.
    ///
    /// After a transport failure during a commit the outcome on the server is
    /// unknown; the caller must decide whether to retry or abandon.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    /// Returns `true` if the error was raised before any network call.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.kind() == ErrorKind::Local
    }

    /// Returns `true` for the "nothing to confirm" family of errors.
    #[must_use]
    pub fn is_nothing_to_confirm(&self) -> bool {
        matches!(self, Self::NothingToConfirm | Self::StaleApproval { .. })
    }
}

// ============== Conversion Implementations ==============

impl From<reqwest::Error> for ConsoleError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::http_status(status.as_u16(), err.to_string());
        }
        if err.is_decode() {
            return Self::invalid_response(err.to_string());
        }
        Self::network(err.to_string())
    }
}

impl From<serde_json::Error> for ConsoleError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_response(err.to_string())
    }
}
