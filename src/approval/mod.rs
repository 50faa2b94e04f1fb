//! Two-phase execution of risky tool calls.
//!
//! Every gated call runs as *preview, then confirm*:
//!
//! 1. [`ApprovalMachine::execute`] sends a dry run. A tool that needs no
//!    approval answers `ok` (or `error`) right away and nothing is stored.
//! 2. A `needs_approval` answer is stored as the requester's single
//!    [`PendingApproval`], snapshotting the exact path and arguments.
//! 3. [`ApprovalMachine::confirm`] commits the stored snapshot with its
//!    approval id. [`ApprovalMachine::cancel`] drops it without a request.
//!
//! # State Machine
//!
//! ```text
//!            execute()                      needs_approval
//! ┌──────┐ ───────────→ ┌────────────┐ ─────────────────→ ┌─────────────────┐
//! │ Idle │              │ Previewing │                    │ ApprovedPending │
//! └──────┘ ←─────────── └────────────┘                    └───────┬─────────┘
//!    ↑  ↑   ok / error / transport error                          │ confirm()
//!    │  │                                                         ▼
//!    │  │   server answered                              ┌────────────┐
//!    │  └─────────────────────────────────────────────── │ Confirming │
//!    │                                                   └─────┬──────┘
//!    │  cancel()                                               │ transport error
//!    │                                                         ▼
//!    └──────────────────────────────────────────────── ┌──────────────────┐
//!                                                      │ AwaitingDecision │
//!                                                      └──────────────────┘
//! ```
//!
//! A transport failure while confirming leaves the server-side outcome
//! unknown, so the record is parked in `AwaitingDecision` until the caller
//! retries the confirm or cancels. Nothing is retried automatically.
//!
//! The pending slot is written only by `execute`, `execute_direct`, `confirm`
//! and `cancel`. A new `execute` supersedes an existing record (last writer
//! wins); the superseded approval id can no longer be confirmed.

use std::fmt;

use tracing::{debug, info, warn};

use crate::api::ToolTransport;
use crate::error::{ConsoleError, ConsoleResult};
use crate::session::Requester;
use crate::types::{ApprovalDirective, ToolArgs, ToolInvocationRequest, ToolInvocationResult};

/// State of a requester's approval flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ApprovalState {
    /// Nothing in flight.
    #[default]
    Idle,
    /// Dry run sent.
    Previewing,
    /// Direct, non-gated call sent.
    ExecutingDirect,
    /// A preview is waiting for a human decision.
    ApprovedPending,
    /// Commit sent.
    Confirming,
    /// The commit failed in transit; retry or cancel.
    AwaitingDecision,
}

impl fmt::Display for ApprovalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Previewing => "previewing",
            Self::ExecutingDirect => "executing-direct",
            Self::ApprovedPending => "approved-pending",
            Self::Confirming => "confirming",
            Self::AwaitingDecision => "awaiting-decision",
        };
        f.write_str(label)
    }
}

/// A previewed operation waiting for confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingApproval {
    /// Endpoint path the preview was issued against.
    pub path: String,
    /// Tool name echoed by the server.
    pub tool: String,
    /// The arguments that produced the preview. Sent unchanged on confirm.
    pub args: ToolArgs,
    /// Ticket binding the preview to its commit.
    pub approval_id: String,
    /// Human-readable description of what the commit will do.
    pub preview: String,
}

/// Result of [`ApprovalMachine::execute`] and [`ApprovalMachine::confirm`].
#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    /// The server answered `ok` or `error`; no approval is pending.
    Finished(ToolInvocationResult),
    /// The server gated the call; the record is now pending.
    NeedsApproval(PendingApproval),
}

impl Execution {
    /// Returns the pending record, if the call was gated.
    #[must_use]
    pub fn pending(&self) -> Option<&PendingApproval> {
        match self {
            Self::NeedsApproval(pending) => Some(pending),
            Self::Finished(_) => None,
        }
    }

    /// Returns the final result, if the call finished.
    #[must_use]
    pub fn into_result(self) -> Option<ToolInvocationResult> {
        match self {
            Self::Finished(result) => Some(result),
            Self::NeedsApproval(_) => None,
        }
    }
}

/// Per-requester approval flow over a [`ToolTransport`].
#[derive(Debug)]
pub struct ApprovalMachine<T> {
    transport: T,
    requester: Requester,
    state: ApprovalState,
    pending: Option<PendingApproval>,
}

impl<T: ToolTransport> ApprovalMachine<T> {
    /// Creates an idle machine for one requester.
    #[must_use]
    pub fn new(transport: T, requester: Requester) -> Self {
        Self {
            transport,
            requester,
            state: ApprovalState::Idle,
            pending: None,
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> ApprovalState {
        self.state
    }

    /// Returns the pending approval, if any. Read-only.
    #[must_use]
    pub fn pending(&self) -> Option<&PendingApproval> {
        self.pending.as_ref()
    }

    /// Returns the requester this machine acts for.
    #[must_use]
    pub fn requester(&self) -> &Requester {
        &self.requester
    }

    /// Returns the underlying transport.
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Previews a call with a dry run.
    ///
    /// Any existing pending record is superseded first, even if the dry run
    /// then fails.
    ///
    /// # Errors
    ///
    /// Returns transport and protocol errors. A `status: error` answer is not
    /// an error here; it comes back as [`Execution::Finished`].
    pub async fn execute(&mut self, path: &str, args: ToolArgs) -> ConsoleResult<Execution> {
        self.recover();
        self.supersede("new dry run");

        let request = self.request(path, args.clone(), ApprovalDirective::DryRun);
        self.state = ApprovalState::Previewing;
        debug!(requester = %self.requester, path, "previewing");

        let result = match self.transport.invoke(&request).await {
            Ok(result) => result,
            Err(err) => {
                self.state = ApprovalState::Idle;
                return Err(err);
            }
        };

        if result.needs_approval() {
            let Some(approval_id) = result.approval_id.clone() else {
                self.state = ApprovalState::Idle;
                return Err(ConsoleError::invalid_response(
                    "needs_approval result without approval_id",
                ));
            };
            let pending = PendingApproval {
                path: path.to_string(),
                approval_id,
                tool: result.tool,
                args,
                preview: result.preview.unwrap_or_default(),
            };
            info!(
                requester = %self.requester,
                tool = %pending.tool,
                approval_id = %pending.approval_id,
                "approval pending"
            );
            self.pending = Some(pending.clone());
            self.state = ApprovalState::ApprovedPending;
            return Ok(Execution::NeedsApproval(pending));
        }

        self.state = ApprovalState::Idle;
        Ok(Execution::Finished(result))
    }

    /// Runs a non-gated call with the empty directive.
    ///
    /// Never creates a pending record; an existing one is superseded.
    ///
    /// # Errors
    ///
    /// Returns transport and protocol errors, and
    /// [`ConsoleError::ApprovalRequired`] when the server gates the tool. The
    /// ticket the server issued with that answer is not kept.
    pub async fn execute_direct(
        &mut self,
        path: &str,
        args: ToolArgs,
    ) -> ConsoleResult<ToolInvocationResult> {
        self.recover();
        self.supersede("direct call");

        let request = self.request(path, args, ApprovalDirective::Direct);
        self.state = ApprovalState::ExecutingDirect;
        debug!(requester = %self.requester, path, "executing directly");

        let result = self.transport.invoke(&request).await;
        self.state = ApprovalState::Idle;
        let result = result?;

        if result.needs_approval() {
            warn!(
                requester = %self.requester,
                tool = %result.tool,
                "direct call refused, tool requires approval"
            );
            return Err(ConsoleError::approval_required(result.tool));
        }
        Ok(result)
    }

    /// Commits the pending approval.
    ///
    /// Sends the stored path, arguments and approval id, never live caller
    /// state. Any server answer clears the record; if that answer is itself
    /// `needs_approval`, the new ticket becomes the pending record.
    ///
    /// # Errors
    ///
    /// Returns [`ConsoleError::NothingToConfirm`] without any request when
    /// nothing is pending. On a transport or protocol failure the record is
    /// kept in [`ApprovalState::AwaitingDecision`] and the error returned.
    pub async fn confirm(&mut self) -> ConsoleResult<Execution> {
        self.recover();
        let Some(pending) = self.pending.clone() else {
            return Err(ConsoleError::nothing_to_confirm());
        };

        let request = self.request(
            &pending.path,
            pending.args.clone(),
            ApprovalDirective::Confirm {
                approval_id: pending.approval_id.clone(),
            },
        );
        self.state = ApprovalState::Confirming;
        debug!(
            requester = %self.requester,
            approval_id = %pending.approval_id,
            "confirming"
        );

        let result = match self.transport.invoke(&request).await {
            Ok(result) => result,
            Err(err) => {
                self.state = if err.is_local() {
                    ApprovalState::ApprovedPending
                } else {
                    warn!(
                        requester = %self.requester,
                        approval_id = %pending.approval_id,
                        error = %err,
                        "confirm failed, outcome unknown"
                    );
                    ApprovalState::AwaitingDecision
                };
                return Err(err);
            }
        };

        self.pending = None;
        self.state = ApprovalState::Idle;

        match (result.needs_approval(), result.approval_id.clone()) {
            (true, Some(approval_id)) => {
                let renewed = PendingApproval {
                    approval_id,
                    preview: result.preview.unwrap_or_default(),
                    tool: result.tool,
                    ..pending
                };
                info!(
                    requester = %self.requester,
                    approval_id = %renewed.approval_id,
                    "server issued a new approval"
                );
                self.pending = Some(renewed.clone());
                self.state = ApprovalState::ApprovedPending;
                Ok(Execution::NeedsApproval(renewed))
            }
            _ => {
                info!(
                    requester = %self.requester,
                    tool = %result.tool,
                    status = %result.status,
                    "approval resolved"
                );
                Ok(Execution::Finished(result))
            }
        }
    }

    /// Commits the pending approval only if it carries `approval_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ConsoleError::StaleApproval`] without any request when
    /// `approval_id` is not the pending one (superseded, cancelled or never
    /// issued to this requester). Otherwise as [`Self::confirm`].
    pub async fn confirm_approval(&mut self, approval_id: &str) -> ConsoleResult<Execution> {
        let current = self.pending.as_ref().map(|p| p.approval_id.as_str());
        if current != Some(approval_id) {
            debug!(requester = %self.requester, approval_id, "rejecting stale approval");
            return Err(ConsoleError::stale_approval(approval_id));
        }
        self.confirm().await
    }

    /// Drops the pending approval without any request.
    ///
    /// Returns the dropped record, or `None` if nothing was pending.
    pub fn cancel(&mut self) -> Option<PendingApproval> {
        self.recover();
        let dropped = self.pending.take();
        if let Some(pending) = &dropped {
            info!(
                requester = %self.requester,
                approval_id = %pending.approval_id,
                "approval cancelled"
            );
        }
        self.state = ApprovalState::Idle;
        dropped
    }

    fn request(&self, path: &str, args: ToolArgs, approval: ApprovalDirective) -> ToolInvocationRequest {
        ToolInvocationRequest::new(path, args, approval).with_actor(self.requester.label())
    }

    fn supersede(&mut self, reason: &str) {
        if let Some(old) = self.pending.take() {
            warn!(
                requester = %self.requester,
                approval_id = %old.approval_id,
                reason,
                "superseding pending approval"
            );
        }
    }

    /// Repairs the state after an operation future was dropped mid-flight.
    fn recover(&mut self) {
        let recovered = match self.state {
            ApprovalState::Previewing | ApprovalState::ExecutingDirect => ApprovalState::Idle,
            ApprovalState::Confirming => ApprovalState::AwaitingDecision,
            state => state,
        };
        if recovered != self.state {
            debug!(from = %self.state, to = %recovered, "recovering interrupted operation");
            self.state = recovered;
        }
    }
}
