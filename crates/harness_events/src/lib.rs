#![forbid(unsafe_code)]
//! Canonical event model shared by every agent-switchboard backend.
//!
//! This crate is intentionally transport-free. It provides:
//! - The [`AgentEvent`] envelope and its payload variants, with the wire
//!   shape `{type, agent, timestamp, sessionId, payload, metadata?}`.
//! - A session-id supplier ([`new_session_id`]).
//! - A bounded-memory NDJSON [`LineFramer`] for byte-chunked line ingestion.

mod event;
mod framer;

pub use event::{
    is_event_value, new_session_id, now_ms, AgentEvent, DonePayload, ErrorPayload, EventPayload,
    InitPayload, PermissionRequestPayload, SessionStatus, TextDeltaPayload, TextPayload,
    ThinkingPayload, ToolOutcome, ToolResultPayload, ToolUsePayload, UsageTotals,
};
pub use framer::{FrameError, FramedLine, LineFramer};
