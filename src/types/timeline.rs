//! The ordered, user-visible projection of a conversation.
//!
//! The [`Timeline`] is the single source of truth for what the presentation
//! layer shows: user prompts, assistant replies and tool records, in order.
//! Presentation code only gets read access; every mutation goes through the
//! turn state machine (for chat) or [`Timeline::push_invocation`] (for
//! single-shot tool calls).
//!
//! Entries are addressed by a monotonically increasing [`EntryId`] rather than
//! by index, so removing a placeholder never invalidates references held by a
//! state machine.
//!
//! # Example
//!
//! ```
//! use toolgate::types::{EntryRole, EntryStatus, Timeline};
//!
//! let mut timeline = Timeline::new();
//! timeline.push_user_message("Hello!");
//! assert_eq!(timeline.len(), 1);
//! assert_eq!(timeline.entries()[0].role, EntryRole::User);
//! assert_eq!(timeline.entries()[0].status, EntryStatus::Done);
//! ```

use std::fmt;

use super::tool::{ToolArgs, ToolInvocationResult};

/// Stable identifier of a timeline entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Who produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryRole {
    /// A user prompt.
    User,
    /// An assistant reply.
    Assistant,
    /// A tool record.
    Tool,
}

/// Lifecycle status of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// Still receiving content.
    Streaming,
    /// Frozen, successfully or by cancellation.
    Done,
    /// Frozen with an error.
    Error,
}

/// Tool-specific details of a [`EntryRole::Tool`] entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDetail {
    /// Tool name.
    pub name: String,
    /// Arguments the tool ran (or would run) with.
    pub args: ToolArgs,
    /// Server-issued call id, when known.
    pub call_id: Option<String>,
    /// Execution time reported with the result, in milliseconds.
    pub elapsed_ms: Option<f64>,
    /// Set when the server asked for a human decision. Informational only.
    pub awaiting_approval: bool,
    /// Set once a result has been attached.
    pub finished: bool,
}

impl ToolDetail {
    pub(crate) fn new(name: impl Into<String>, args: ToolArgs, call_id: Option<String>) -> Self {
        Self {
            name: name.into(),
            args,
            call_id,
            elapsed_ms: None,
            awaiting_approval: false,
            finished: false,
        }
    }
}

/// One item of the timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    /// Stable id.
    pub id: EntryId,
    /// Producer.
    pub role: EntryRole,
    /// Text content (assistant text, user prompt or tool result).
    pub content: String,
    /// Lifecycle status.
    pub status: EntryStatus,
    /// Tool details for tool entries.
    pub tool: Option<ToolDetail>,
}

impl TimelineEntry {
    /// Returns `true` while the entry is still receiving content.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.status == EntryStatus::Streaming
    }

    /// Returns the tool name for tool entries.
    #[must_use]
    pub fn tool_name(&self) -> Option<&str> {
        self.tool.as_ref().map(|t| t.name.as_str())
    }
}

impl fmt::Display for TimelineEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self.status {
            EntryStatus::Streaming => "streaming",
            EntryStatus::Done => "done",
            EntryStatus::Error => "error",
        };
        match (&self.role, &self.tool) {
            (EntryRole::User, _) => write!(f, "User: {}", self.content),
            (EntryRole::Assistant, _) => write!(f, "Assistant ({status}): {}", self.content),
            (EntryRole::Tool, Some(tool)) => {
                write!(f, "Tool[{}] ({status}): {}", tool.name, self.content)
            }
            (EntryRole::Tool, None) => write!(f, "Tool ({status}): {}", self.content),
        }
    }
}

/// Append-only ordered sequence of entries.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    entries: Vec<TimelineEntry>,
    next_id: u64,
}

impl Timeline {
    /// Creates an empty timeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the entries in order.
    #[must_use]
    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    /// Iterates over the entries in order.
    pub fn iter(&self) -> impl Iterator<Item = &TimelineEntry> {
        self.entries.iter()
    }

    /// Returns the entry with the given id.
    #[must_use]
    pub fn get(&self, id: EntryId) -> Option<&TimelineEntry> {
        self.position(id).map(|idx| &self.entries[idx])
    }

    /// Returns the last entry.
    #[must_use]
    pub fn last(&self) -> Option<&TimelineEntry> {
        self.entries.last()
    }

    /// Returns `true` if any entry is still streaming.
    #[must_use]
    pub fn has_streaming(&self) -> bool {
        self.entries.iter().any(TimelineEntry::is_streaming)
    }

    /// Appends a user prompt.
    pub fn push_user_message(&mut self, content: impl Into<String>) -> EntryId {
        self.push(EntryRole::User, content.into(), EntryStatus::Done, None)
    }

    /// Appends the outcome of a single-shot tool call as a closed tool entry.
    ///
    /// `args` are the arguments the call was made with; for a confirmed
    /// approval these are the previewed arguments.
    pub fn push_invocation(&mut self, result: &ToolInvocationResult, args: ToolArgs) -> EntryId {
        let status = if result.is_error() {
            EntryStatus::Error
        } else {
            EntryStatus::Done
        };
        let mut detail = ToolDetail::new(result.tool.clone(), args, None);
        detail.finished = true;
        detail.awaiting_approval = result.needs_approval();
        detail.elapsed_ms = Some(result.duration.as_secs_f64() * 1000.0);
        self.push(
            EntryRole::Tool,
            result.message().to_string(),
            status,
            Some(detail),
        )
    }

    pub(crate) fn push_assistant_placeholder(&mut self) -> EntryId {
        self.push(
            EntryRole::Assistant,
            String::new(),
            EntryStatus::Streaming,
            None,
        )
    }

    pub(crate) fn push_tool(&mut self, detail: ToolDetail, status: EntryStatus) -> EntryId {
        self.push(EntryRole::Tool, String::new(), status, Some(detail))
    }

    pub(crate) fn get_mut(&mut self, id: EntryId) -> Option<&mut TimelineEntry> {
        let idx = self.position(id)?;
        self.entries.get_mut(idx)
    }

    pub(crate) fn append_text(&mut self, id: EntryId, text: &str) {
        if let Some(entry) = self.get_mut(id) {
            entry.content.push_str(text);
        }
    }

    pub(crate) fn set_status(&mut self, id: EntryId, status: EntryStatus) {
        if let Some(entry) = self.get_mut(id) {
            entry.status = status;
        }
    }

    /// Removes an entry. Only used to drop an empty placeholder on cancel.
    pub(crate) fn remove(&mut self, id: EntryId) -> Option<TimelineEntry> {
        self.position(id).map(|idx| self.entries.remove(idx))
    }

    fn push(
        &mut self,
        role: EntryRole,
        content: String,
        status: EntryStatus,
        tool: Option<ToolDetail>,
    ) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        self.entries.push(TimelineEntry {
            id,
            role,
            content,
            status,
            tool,
        });
        id
    }

    // Ids are assigned in increasing order and never reused.
    fn position(&self, id: EntryId) -> Option<usize> {
        self.entries.binary_search_by_key(&id, |e| e.id).ok()
    }
}
