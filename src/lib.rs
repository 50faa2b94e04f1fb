//! Toolgate - client console engine for a tool-calling assistant.
//!
//! The library holds the orchestration engine behind the console:
//!
//! - [`api`]: HTTP transport and the SSE frame decoder
//! - [`turn`]: the per-turn state machine that projects stream events onto
//!   the [`types::Timeline`]
//! - [`approval`]: dry-run-then-confirm execution of risky tools
//! - [`session`]: turn generations and cancellation
//!
//! Rendering is left to the caller, which only reads the timeline and the
//! pending approval.

pub mod api;
pub mod approval;
pub mod error;
pub mod session;
pub mod turn;
pub mod types;

// Re-export core types for convenient access
pub use error::{ConsoleError, ConsoleResult};
pub use types::{Config, Timeline, TurnEvent};
