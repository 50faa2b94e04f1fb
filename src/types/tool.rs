//! Tool invocation contracts.
//!
//! These types describe the single-shot request/response boundary between the
//! console and the server-side tool executor:
//!
//! ```text
//! POST <tool-path>  { "args": {...}, "approval": {...} }
//!     → { "status": "ok" | "needs_approval" | "error", ... }
//! ```
//!
//! The approval directive only has three legal shapes, so it is modelled as an
//! enum rather than a bag of flags. Flag combinations coming from a form are
//! funnelled through [`ApprovalDirective::from_flags`], which rejects anything
//! else before a request is built.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConsoleError, ConsoleResult};

/// Argument mapping for a tool call. Keys are unique by construction.
pub type ToolArgs = serde_json::Map<String, Value>;

/// Default single-shot path of the generic tool endpoint.
pub const TOOL_CALL_PATH: &str = "/api/tool/call";

/// A tool as listed by the server registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name (e.g. "delete_file").
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Declared parameter schema (JSON Schema object).
    #[serde(default)]
    pub parameters: Value,
    /// Whether the tool requires approval before it runs.
    #[serde(default)]
    pub risky: bool,
    /// Server module that registered the tool, when known.
    #[serde(default)]
    pub module: Option<String>,
    /// Path used for single-shot invocation.
    #[serde(default)]
    pub path: String,
}

impl ToolDescriptor {
    /// Returns the generic invocation path for a tool name.
    #[must_use]
    pub fn default_path(name: &str) -> String {
        format!("{TOOL_CALL_PATH}?tool={}", urlencoding::encode(name))
    }
}

/// How a single-shot call should be gated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDirective {
    /// `{}`: direct, non-gated execution.
    Direct,
    /// `{dry_run: true, confirm: false}`: preview only, never mutates state.
    DryRun,
    /// `{confirm: true, dry_run: false, approval_id}`: commit a previewed call.
    Confirm {
        /// Ticket returned by the preceding dry run.
        approval_id: String,
    },
}

impl ApprovalDirective {
    /// Builds a directive from raw form flags.
    ///
    /// # Errors
    ///
    /// Returns [`ConsoleError::InvalidDirective`] for any combination other
    /// than the three recognized shapes.
    pub fn from_flags(
        dry_run: bool,
        confirm: bool,
        approval_id: Option<&str>,
    ) -> ConsoleResult<Self> {
        let approval_id = approval_id.map(str::trim).filter(|id| !id.is_empty());
        match (dry_run, confirm, approval_id) {
            (false, false, None) => Ok(Self::Direct),
            (true, false, None) => Ok(Self::DryRun),
            (false, true, Some(id)) => Ok(Self::Confirm {
                approval_id: id.to_string(),
            }),
            (true, true, _) => Err(ConsoleError::invalid_directive(
                "dry_run and confirm are mutually exclusive",
            )),
            (false, true, None) => Err(ConsoleError::invalid_directive(
                "confirm requires an approval_id",
            )),
            (_, false, Some(_)) => Err(ConsoleError::invalid_directive(
                "approval_id is only valid together with confirm",
            )),
        }
    }

    /// Returns `true` for the dry-run shape.
    #[must_use]
    pub fn is_dry_run(&self) -> bool {
        matches!(self, Self::DryRun)
    }

    /// Returns the approval id carried by a confirm directive.
    #[must_use]
    pub fn approval_id(&self) -> Option<&str> {
        match self {
            Self::Confirm { approval_id } => Some(approval_id),
            _ => None,
        }
    }
}

/// A single-shot tool call as the console sends it.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocationRequest {
    /// Endpoint path relative to the server base URL.
    pub path: String,
    /// Arguments exactly as they will be sent.
    pub args: ToolArgs,
    /// Gating directive.
    pub approval: ApprovalDirective,
    /// Caller identity for the server's audit trace.
    pub actor: Option<String>,
}

impl ToolInvocationRequest {
    /// Creates a request with no actor.
    #[must_use]
    pub fn new(path: impl Into<String>, args: ToolArgs, approval: ApprovalDirective) -> Self {
        Self {
            path: path.into(),
            args,
            approval,
            actor: None,
        }
    }

    /// Sets the actor label sent along with the approval directive.
    #[must_use]
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Checks the request before it is put on the wire.
    ///
    /// # Errors
    ///
    /// Returns [`ConsoleError::InvalidDirective`] for an empty path or an
    /// empty approval id.
    pub fn validate(&self) -> ConsoleResult<()> {
        if self.path.trim().is_empty() {
            return Err(ConsoleError::invalid_directive("tool path is empty"));
        }
        if let ApprovalDirective::Confirm { approval_id } = &self.approval {
            if approval_id.trim().is_empty() {
                return Err(ConsoleError::invalid_directive(
                    "confirm requires an approval_id",
                ));
            }
        }
        Ok(())
    }

    /// Returns the JSON body for this request.
    #[must_use]
    pub fn body(&self) -> Value {
        let mut approval = serde_json::Map::new();
        match &self.approval {
            ApprovalDirective::Direct => {}
            ApprovalDirective::DryRun => {
                approval.insert("dry_run".into(), Value::Bool(true));
                approval.insert("confirm".into(), Value::Bool(false));
            }
            ApprovalDirective::Confirm { approval_id } => {
                approval.insert("confirm".into(), Value::Bool(true));
                approval.insert("dry_run".into(), Value::Bool(false));
                approval.insert("approval_id".into(), Value::String(approval_id.clone()));
            }
        }
        if let Some(actor) = &self.actor {
            approval.insert("actor".into(), Value::String(actor.clone()));
        }

        let mut body = serde_json::Map::new();
        body.insert("args".into(), Value::Object(self.args.clone()));
        body.insert("approval".into(), Value::Object(approval));
        Value::Object(body)
    }
}

/// Outcome category of a single-shot call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    /// The tool ran (or the dry run needs no approval).
    Ok,
    /// The tool is gated; an approval id was issued.
    NeedsApproval,
    /// The tool or the executor reported an error.
    Error,
}

impl fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::NeedsApproval => write!(f, "needs_approval"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawInvocationResult {
    status: InvocationStatus,
    #[serde(default)]
    tool: String,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    approval_id: Option<String>,
    #[serde(default)]
    preview: Option<String>,
    #[serde(default)]
    duration_ms: Option<f64>,
}

/// The server's answer to a single-shot call.
///
/// `approval_id` is present if and only if `status` is
/// [`InvocationStatus::NeedsApproval`]; deserialization fails otherwise.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawInvocationResult")]
pub struct ToolInvocationResult {
    /// Outcome category.
    pub status: InvocationStatus,
    /// Echoed tool name.
    pub tool: String,
    /// Result text.
    pub result: Option<String>,
    /// Error text for `status: error`.
    pub error: Option<String>,
    /// Human-readable preview of a gated operation.
    pub preview: Option<String>,
    /// Approval ticket for a gated operation.
    pub approval_id: Option<String>,
    /// Server-side execution time.
    pub duration: Duration,
}

impl TryFrom<RawInvocationResult> for ToolInvocationResult {
    type Error = String;

    fn try_from(raw: RawInvocationResult) -> Result<Self, Self::Error> {
        let approval_id = raw.approval_id.filter(|id| !id.is_empty());
        match (raw.status, &approval_id) {
            (InvocationStatus::NeedsApproval, None) => {
                return Err("needs_approval result without approval_id".to_string());
            }
            (InvocationStatus::Ok | InvocationStatus::Error, Some(id)) => {
                return Err(format!(
                    "approval_id '{id}' present on a '{}' result",
                    raw.status
                ));
            }
            _ => {}
        }

        let duration = raw
            .duration_ms
            .filter(|ms| ms.is_finite() && *ms > 0.0)
            .and_then(|ms| Duration::try_from_secs_f64(ms / 1000.0).ok())
            .unwrap_or_default();

        Ok(Self {
            status: raw.status,
            tool: raw.tool,
            result: raw.result,
            error: raw.error,
            preview: raw.preview,
            approval_id,
            duration,
        })
    }
}

impl ToolInvocationResult {
    /// Returns `true` for `status: ok`.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == InvocationStatus::Ok
    }

    /// Returns `true` for `status: needs_approval`.
    #[must_use]
    pub fn needs_approval(&self) -> bool {
        self.status == InvocationStatus::NeedsApproval
    }

    /// Returns `true` for `status: error`.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.status == InvocationStatus::Error
    }

    /// The text shown to the user for this result.
    ///
    /// Error results prefer the `error` field and fall back to `result`.
    #[must_use]
    pub fn message(&self) -> &str {
        let text = match self.status {
            InvocationStatus::Error => self.error.as_deref().or(self.result.as_deref()),
            _ => self.result.as_deref(),
        };
        text.unwrap_or_default()
    }

    /// Converts a domain error into a [`ConsoleError::Tool`].
    ///
    /// # Errors
    ///
    /// Returns the server text verbatim when `status` is `error`.
    pub fn into_domain_result(self) -> ConsoleResult<Self> {
        if self.is_error() {
            return Err(ConsoleError::tool(self.tool.clone(), self.message()));
        }
        Ok(self)
    }
}
