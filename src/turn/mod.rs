//! Turn state machine.
//!
//! A [`TurnMachine`] consumes the [`TurnEvent`]s of one assistant turn, in
//! arrival order, and applies them to the [`Timeline`]. Every call returns the
//! [`TimelineMutation`]s it performed so a presentation layer can redraw
//! incrementally without diffing the timeline.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐  open()   ┌─────────┐  session   ┌───────────┐
//! │ Idle │ ────────→ │ Opening │ ─────────→ │ Streaming │
//! └──────┘           └────┬────┘            └─────┬─────┘
//!                         │                       │
//!             cancel() / fail() / closed          │ done / error / cancel() / closed
//!                         ▼                       ▼
//!              ┌──────┬─────────┬───────────┐
//!              │ Done │ Errored │ Cancelled │   (terminal)
//!              └──────┴─────────┴───────────┘
//! ```
//!
//! While the turn is active the machine exclusively owns the assistant entry
//! and every tool entry it opened. Once terminal it ignores all further input.

use std::fmt;

use tracing::debug;

use crate::types::{EntryId, EntryRole, EntryStatus, Timeline, ToolArgs, ToolDetail, TurnEvent};

/// Text appended to the assistant entry when the stream ends without a
/// terminal frame.
pub const STREAM_CLOSED_MESSAGE: &str = "stream closed before the turn completed";

/// State of one assistant turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TurnState {
    /// Not started.
    #[default]
    Idle,
    /// Request sent, no session bound yet.
    Opening,
    /// Receiving events.
    Streaming,
    /// Finished with `done`.
    Done,
    /// Finished with an error, explicit or implicit.
    Errored,
    /// Stopped by the user.
    Cancelled,
}

impl TurnState {
    /// Returns true once the turn can no longer change.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Errored | Self::Cancelled)
    }

    /// Returns true while the turn accepts events.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Opening | Self::Streaming)
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The server sent `done`.
    Done,
    /// The turn failed.
    Failed {
        /// Error text shown to the user.
        message: String,
        /// `true` when no `error` frame was received (connection closed or
        /// failed).
        implicit: bool,
    },
    /// The user cancelled the turn.
    Cancelled,
}

impl TurnOutcome {
    /// Returns `true` for either kind of failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

impl fmt::Display for TurnOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Done => write!(f, "done"),
            Self::Failed { message, .. } => write!(f, "failed: {message}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One change applied to the timeline.
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineMutation {
    /// The server bound the conversation to a session.
    SessionBound(String),
    /// A user or assistant entry was appended.
    EntryOpened {
        /// The new entry.
        id: EntryId,
        /// Its role.
        role: EntryRole,
    },
    /// Text was appended to an entry.
    TextAppended {
        /// Target entry.
        id: EntryId,
        /// The appended fragment.
        text: String,
    },
    /// A tool entry was appended.
    ToolOpened {
        /// The new entry.
        id: EntryId,
        /// Tool name.
        tool: String,
    },
    /// A tool entry received its result.
    ToolClosed {
        /// The closed entry.
        id: EntryId,
        /// Tool name.
        tool: String,
    },
    /// A tool entry was flagged as awaiting approval.
    ApprovalRaised {
        /// The flagged entry.
        id: EntryId,
        /// Tool name.
        tool: String,
    },
    /// An entry stopped streaming.
    EntryFrozen {
        /// The frozen entry.
        id: EntryId,
        /// Its final status.
        status: EntryStatus,
    },
    /// The empty assistant placeholder was removed.
    EntryRemoved(EntryId),
    /// The turn reached a terminal state.
    Finished(TurnOutcome),
}

#[derive(Debug, Clone)]
struct OpenTool {
    entry: EntryId,
    name: String,
    call_id: Option<String>,
}

/// Drives one assistant turn.
#[derive(Debug, Default)]
pub struct TurnMachine {
    state: TurnState,
    session_id: String,
    assistant: Option<EntryId>,
    open_tools: Vec<OpenTool>,
    outcome: Option<TurnOutcome>,
}

impl TurnMachine {
    /// Creates a machine for a turn of the given session (empty for a new
    /// conversation).
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Returns the session id, updated by `session` frames.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Returns how the turn ended, once terminal.
    #[must_use]
    pub fn outcome(&self) -> Option<&TurnOutcome> {
        self.outcome.as_ref()
    }

    /// Loading-stage label for the presentation layer.
    #[must_use]
    pub fn stage(&self, timeline: &Timeline) -> String {
        match self.state {
            TurnState::Idle => "idle".to_string(),
            TurnState::Opening => "connecting".to_string(),
            TurnState::Streaming => {
                let latest = self.open_tools.last().and_then(|open| {
                    timeline
                        .get(open.entry)
                        .and_then(|entry| entry.tool.as_ref())
                });
                match latest {
                    Some(tool) if tool.awaiting_approval => {
                        format!("awaiting approval: {}", tool.name)
                    }
                    Some(tool) => format!("running {}", tool.name),
                    None => "thinking".to_string(),
                }
            }
            TurnState::Done => "done".to_string(),
            TurnState::Errored => "failed".to_string(),
            TurnState::Cancelled => "cancelled".to_string(),
        }
    }

    /// Starts the turn: appends the user prompt and an empty assistant
    /// placeholder.
    ///
    /// Only valid from `Idle`; otherwise nothing happens.
    pub fn open(&mut self, timeline: &mut Timeline, message: &str) -> Vec<TimelineMutation> {
        if self.state != TurnState::Idle {
            debug!(state = ?self.state, "open ignored: turn already started");
            return Vec::new();
        }

        let user = timeline.push_user_message(message);
        let assistant = timeline.push_assistant_placeholder();
        self.assistant = Some(assistant);
        self.state = TurnState::Opening;
        debug!(session = %self.session_id, "turn opening");

        vec![
            TimelineMutation::EntryOpened {
                id: user,
                role: EntryRole::User,
            },
            TimelineMutation::EntryOpened {
                id: assistant,
                role: EntryRole::Assistant,
            },
        ]
    }

    /// Applies one stream event.
    ///
    /// Events outside an active turn are ignored. An event other than
    /// `session` while still opening moves the turn to streaming.
    pub fn apply(&mut self, timeline: &mut Timeline, event: TurnEvent) -> Vec<TimelineMutation> {
        if !self.state.is_active() {
            debug!(state = ?self.state, "event ignored: turn not active");
            return Vec::new();
        }
        if self.state == TurnState::Opening {
            self.state = TurnState::Streaming;
        }

        match event {
            TurnEvent::SessionOpened { session_id } => {
                debug!(session = %session_id, "session bound");
                self.session_id.clone_from(&session_id);
                vec![TimelineMutation::SessionBound(session_id)]
            }
            TurnEvent::TextDelta(text) => self.append_text(timeline, text),
            TurnEvent::ToolStarted {
                tool,
                args,
                call_id,
            } => {
                let id = self.open_tool(timeline, tool.clone(), args, call_id, false);
                vec![TimelineMutation::ToolOpened { id, tool }]
            }
            TurnEvent::ToolFinished {
                tool,
                result,
                elapsed_ms,
                call_id,
            } => self.close_tool(timeline, tool, result, elapsed_ms, call_id),
            TurnEvent::ApprovalNeeded {
                tool,
                args,
                call_id,
            } => self.raise_approval(timeline, tool, args, call_id),
            TurnEvent::TurnDone => self.finish_done(timeline),
            TurnEvent::TurnError(message) => self.finish_error(timeline, message, false),
        }
    }

    /// Cancels the turn.
    ///
    /// An assistant entry without content is removed; otherwise it is frozen
    /// to `done` with its partial text. Open tool entries are frozen to
    /// `done`. Does nothing once terminal.
    pub fn cancel(&mut self, timeline: &mut Timeline) -> Vec<TimelineMutation> {
        if self.state.is_terminal() {
            return Vec::new();
        }

        let mut mutations = Vec::new();
        if let Some(id) = self.assistant {
            let empty = timeline.get(id).is_some_and(|e| e.content.is_empty());
            if empty {
                timeline.remove(id);
                self.assistant = None;
                mutations.push(TimelineMutation::EntryRemoved(id));
            } else {
                timeline.set_status(id, EntryStatus::Done);
                mutations.push(TimelineMutation::EntryFrozen {
                    id,
                    status: EntryStatus::Done,
                });
            }
        }
        mutations.extend(self.freeze_open_tools(timeline));

        debug!(session = %self.session_id, "turn cancelled");
        self.finish(TurnState::Cancelled, TurnOutcome::Cancelled, mutations)
    }

    /// Handles the connection closing.
    ///
    /// Closing without a terminal frame is an implicit error. Tool entries
    /// still waiting for their result stay `streaming`.
    pub fn stream_closed(&mut self, timeline: &mut Timeline) -> Vec<TimelineMutation> {
        if !self.state.is_active() {
            return Vec::new();
        }
        self.finish_error(timeline, STREAM_CLOSED_MESSAGE.to_string(), true)
    }

    /// Fails the turn because of a transport error.
    pub fn fail(&mut self, timeline: &mut Timeline, message: &str) -> Vec<TimelineMutation> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        self.finish_error(timeline, message.to_string(), true)
    }

    fn append_text(&mut self, timeline: &mut Timeline, text: String) -> Vec<TimelineMutation> {
        let Some(id) = self.assistant else {
            return Vec::new();
        };
        if text.is_empty() {
            return Vec::new();
        }
        timeline.append_text(id, &text);
        vec![TimelineMutation::TextAppended { id, text }]
    }

    fn open_tool(
        &mut self,
        timeline: &mut Timeline,
        tool: String,
        args: ToolArgs,
        call_id: Option<String>,
        awaiting_approval: bool,
    ) -> EntryId {
        let mut detail = ToolDetail::new(tool.clone(), args, call_id.clone());
        detail.awaiting_approval = awaiting_approval;
        let id = timeline.push_tool(detail, EntryStatus::Streaming);
        debug!(tool = %tool, entry = %id, "tool started");
        self.open_tools.push(OpenTool {
            entry: id,
            name: tool,
            call_id,
        });
        id
    }

    /// Finds the open tool entry an event refers to: by call id when it
    /// matches, else the most recent unmatched entry with the same name.
    fn match_open_tool(&self, tool: &str, call_id: Option<&str>) -> Option<usize> {
        if let Some(call_id) = call_id {
            let by_id = self
                .open_tools
                .iter()
                .rposition(|open| open.call_id.as_deref() == Some(call_id));
            if by_id.is_some() {
                return by_id;
            }
        }
        self.open_tools.iter().rposition(|open| open.name == tool)
    }

    fn close_tool(
        &mut self,
        timeline: &mut Timeline,
        tool: String,
        result: String,
        elapsed_ms: Option<f64>,
        call_id: Option<String>,
    ) -> Vec<TimelineMutation> {
        let mut mutations = Vec::new();
        let id = match self.match_open_tool(&tool, call_id.as_deref()) {
            Some(idx) => self.open_tools.remove(idx).entry,
            None => {
                debug!(tool = %tool, "result without an open tool entry");
                let detail = ToolDetail::new(tool.clone(), ToolArgs::new(), call_id);
                let id = timeline.push_tool(detail, EntryStatus::Streaming);
                mutations.push(TimelineMutation::ToolOpened {
                    id,
                    tool: tool.clone(),
                });
                id
            }
        };

        if let Some(entry) = timeline.get_mut(id) {
            entry.content = result;
            entry.status = EntryStatus::Done;
            if let Some(detail) = entry.tool.as_mut() {
                detail.finished = true;
                detail.elapsed_ms = elapsed_ms;
            }
        }
        mutations.push(TimelineMutation::ToolClosed { id, tool });
        mutations.push(TimelineMutation::EntryFrozen {
            id,
            status: EntryStatus::Done,
        });
        mutations
    }

    fn raise_approval(
        &mut self,
        timeline: &mut Timeline,
        tool: String,
        args: ToolArgs,
        call_id: Option<String>,
    ) -> Vec<TimelineMutation> {
        let mut mutations = Vec::new();
        let id = match self.match_open_tool(&tool, call_id.as_deref()) {
            Some(idx) => {
                let id = self.open_tools[idx].entry;
                if let Some(detail) = timeline.get_mut(id).and_then(|e| e.tool.as_mut()) {
                    detail.awaiting_approval = true;
                }
                id
            }
            None => {
                let id = self.open_tool(timeline, tool.clone(), args, call_id, true);
                mutations.push(TimelineMutation::ToolOpened {
                    id,
                    tool: tool.clone(),
                });
                id
            }
        };
        debug!(tool = %tool, entry = %id, "approval required");
        mutations.push(TimelineMutation::ApprovalRaised { id, tool });
        mutations
    }

    fn freeze_open_tools(&mut self, timeline: &mut Timeline) -> Vec<TimelineMutation> {
        self.open_tools
            .drain(..)
            .map(|open| {
                timeline.set_status(open.entry, EntryStatus::Done);
                TimelineMutation::EntryFrozen {
                    id: open.entry,
                    status: EntryStatus::Done,
                }
            })
            .collect()
    }

    fn finish_done(&mut self, timeline: &mut Timeline) -> Vec<TimelineMutation> {
        let mut mutations = Vec::new();
        if let Some(id) = self.assistant {
            timeline.set_status(id, EntryStatus::Done);
            mutations.push(TimelineMutation::EntryFrozen {
                id,
                status: EntryStatus::Done,
            });
        }
        mutations.extend(self.freeze_open_tools(timeline));

        debug!(session = %self.session_id, "turn done");
        self.finish(TurnState::Done, TurnOutcome::Done, mutations)
    }

    fn finish_error(
        &mut self,
        timeline: &mut Timeline,
        message: String,
        implicit: bool,
    ) -> Vec<TimelineMutation> {
        let mut mutations = Vec::new();
        if let Some(id) = self.assistant {
            let separator = match timeline.get(id) {
                Some(entry) if !entry.content.is_empty() => "\n",
                _ => "",
            };
            let text = format!("{separator}{message}");
            timeline.append_text(id, &text);
            timeline.set_status(id, EntryStatus::Error);
            mutations.push(TimelineMutation::TextAppended { id, text });
            mutations.push(TimelineMutation::EntryFrozen {
                id,
                status: EntryStatus::Error,
            });
        }

        debug!(session = %self.session_id, implicit, error = %message, "turn failed");
        self.finish(
            TurnState::Errored,
            TurnOutcome::Failed { message, implicit },
            mutations,
        )
    }

    fn finish(
        &mut self,
        state: TurnState,
        outcome: TurnOutcome,
        mut mutations: Vec<TimelineMutation>,
    ) -> Vec<TimelineMutation> {
        self.state = state;
        self.outcome = Some(outcome.clone());
        mutations.push(TimelineMutation::Finished(outcome));
        mutations
    }
}
