//! Core type definitions for Toolgate.
//!
//! - [`config`] - Application configuration
//! - [`tool`] - Single-shot tool invocation contracts
//! - [`stream`] - Chat stream frames and turn events
//! - [`timeline`] - The ordered, user-visible conversation projection
//!
//! # Re-exports
//!
//! ```
//! use toolgate::types::{Timeline, ToolInvocationResult, TurnEvent};
//! ```

pub mod config;
pub mod stream;
pub mod timeline;
pub mod tool;

pub use config::Config;
pub use stream::{StreamFrame, TurnEvent};
pub use timeline::{EntryId, EntryRole, EntryStatus, Timeline, TimelineEntry, ToolDetail};
pub use tool::{
    ApprovalDirective, InvocationStatus, ToolArgs, ToolDescriptor, ToolInvocationRequest,
    ToolInvocationResult,
};
