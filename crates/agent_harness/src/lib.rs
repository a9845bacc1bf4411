#![forbid(unsafe_code)]
//! `agent_harness` — a uniform, driver-style facade over interactive
//! coding-agent backends.
//!
//! Callers submit a prompt and consume one well-typed event stream
//! describing the agent's progress, regardless of how the backend actually
//! talks: typed stream-json over a subprocess (claude), thread JSONL over a
//! subprocess (codex), raw NDJSON with exit-code semantics (gemini), or SSE
//! against a managed local server (opencode).
//!
//! # Architecture
//!
//! ```text
//! caller
//!   │  drive(name, prompt, options, registry)
//!   ▼
//! driver          ← lifecycle normalization: exactly one done, nothing
//!   │               after it, cancellation races, error synthesis
//!   ▼
//! Adapter::run    ← backend normalizer (claude / codex / gemini / opencode)
//!   │
//!   ▼
//! transport       ← subprocess stdout, SSE stream, …
//! ```
//!
//! The parallel driver ([`drive_all`]) fans N sessions into one merged
//! stream while keeping each task's lifecycle independent: one task's
//! failure never terminates the others, and tripping any task's token
//! cancels all of them.
//!
//! # Example
//!
//! ```rust,no_run
//! use agent_harness::{drive, AdapterRegistry, RunOptions};
//! use agent_harness::backends::claude::ClaudeAdapter;
//! use futures_util::StreamExt;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), agent_harness::HarnessError> {
//! let mut registry = AdapterRegistry::new();
//! registry.register(Arc::new(ClaudeAdapter::new()))?;
//!
//! let mut stream = drive("claude", "say hello", RunOptions::default(), &registry)?;
//! while let Some(event) = stream.next().await {
//!     println!("{} {}", event.kind(), event.session_id);
//! }
//! # Ok(()) }
//! ```

mod adapter;
mod driver;
mod error;
mod options;
mod parallel;
mod process;
mod registry;

pub mod backends;

pub use adapter::{Adapter, AdapterStream};
pub use driver::{
    collect_session, drive, drive_adapter, SessionStream, CODE_ADAPTER_ERROR, CODE_MISSING_DONE,
};
pub use error::{AdapterError, HarnessError};
pub use options::{CapabilityDecision, CapabilityPolicy, RunOptions};
pub use parallel::{drive_all, SessionTask};
pub use registry::AdapterRegistry;

pub use harness_events as events;
