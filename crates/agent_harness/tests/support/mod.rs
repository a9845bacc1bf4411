//! Shared test fixtures: a scripted adapter and stream-invariant checks.
#![allow(dead_code)] // not every test binary uses every fixture

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use agent_harness::{Adapter, AdapterError, AdapterStream, RunOptions};
use futures::Stream;
use harness_events::{
    AgentEvent, DonePayload, EventPayload, SessionStatus, TextPayload, UsageTotals,
};
use tokio::sync::mpsc;

/// One step of a scripted production.
#[derive(Clone)]
pub enum ScriptStep {
    /// Emit an event carrying the adapter's session id.
    Event(EventPayload),
    /// Emit an event carrying an explicit session id.
    EventWithSession(String, EventPayload),
    /// Yield an `Err` (the adapter "raises") and end the production.
    Fail(String),
    /// Produce nothing further until the driver closes the stream.
    Stall,
}

/// Adapter that replays a fixed script. `invoked` observes whether `run` was
/// ever called (for pre-abort assertions).
pub struct ScriptedAdapter {
    pub backend: &'static str,
    pub session: String,
    pub steps: Vec<ScriptStep>,
    pub invoked: Arc<AtomicBool>,
}

impl ScriptedAdapter {
    pub fn new(backend: &'static str, session: &str, steps: Vec<ScriptStep>) -> Self {
        Self {
            backend,
            session: session.to_string(),
            steps,
            invoked: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Adapter for ScriptedAdapter {
    fn id(&self) -> &str {
        self.backend
    }

    fn available(&self) -> bool {
        true
    }

    fn run(&self, _prompt: &str, _options: &RunOptions) -> AdapterStream {
        self.invoked.store(true, Ordering::SeqCst);
        let backend = self.backend;
        let session = self.session.clone();
        let steps = self.steps.clone();

        let (tx, rx) = mpsc::channel::<Result<AgentEvent, AdapterError>>(16);
        tokio::spawn(async move {
            for step in steps {
                match step {
                    ScriptStep::Event(payload) => {
                        let event = AgentEvent::new(backend, &session, payload);
                        if tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                    ScriptStep::EventWithSession(session, payload) => {
                        let event = AgentEvent::new(backend, &session, payload);
                        if tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                    ScriptStep::Fail(message) => {
                        let _ = tx.send(Err(AdapterError::Message(message))).await;
                        return;
                    }
                    ScriptStep::Stall => {
                        // Wake up only when the driver drops the stream.
                        tx.closed().await;
                        return;
                    }
                }
            }
        });

        Box::pin(RxStream(rx))
    }
}

struct RxStream(mpsc::Receiver<Result<AgentEvent, AdapterError>>);

impl Stream for RxStream {
    type Item = Result<AgentEvent, AdapterError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.0.poll_recv(cx)
    }
}

// ─── Payload shorthands ───────────────────────────────────────────────────

pub fn text(content: &str) -> EventPayload {
    EventPayload::Text(TextPayload {
        text: content.to_string(),
    })
}

pub fn done_success() -> EventPayload {
    EventPayload::Done(DonePayload {
        status: SessionStatus::Success,
        final_text: None,
        usage: UsageTotals {
            input_tokens: 1,
            output_tokens: 2,
            tool_uses: 0,
            total_cost_usd: None,
        },
        duration_ms: 10,
    })
}

// ─── Invariant checks ─────────────────────────────────────────────────────

/// Asserts the universal per-session properties on one session's events:
/// exactly one terminal `done` and it comes last, a single session id,
/// nondecreasing timestamps, every `tool_result` correlated to an earlier
/// `tool_use`, and no extension events after the terminal.
pub fn assert_session_invariants(events: &[AgentEvent]) {
    assert!(!events.is_empty(), "session stream must not be empty");

    let done_count = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(done_count, 1, "exactly one done per session");
    assert!(
        events.last().unwrap().is_terminal(),
        "done must be the last event"
    );

    let session_id = &events.last().unwrap().session_id;
    for event in events {
        assert_eq!(
            &event.session_id, session_id,
            "all events must share one session id"
        );
    }

    for pair in events.windows(2) {
        assert!(
            pair[0].timestamp_ms <= pair[1].timestamp_ms,
            "timestamps must be nondecreasing"
        );
    }

    let mut seen_tool_use_ids = HashSet::new();
    for event in events {
        match &event.payload {
            EventPayload::ToolUse(tool_use) => {
                seen_tool_use_ids.insert(tool_use.tool_use_id.clone());
            }
            EventPayload::ToolResult(result) => {
                assert!(
                    seen_tool_use_ids.contains(&result.tool_use_id),
                    "tool_result {} must follow a tool_use",
                    result.tool_use_id
                );
            }
            _ => {}
        }
    }
}

/// Splits a merged stream into per-backend projections, in arrival order.
pub fn project_by_agent(events: &[AgentEvent]) -> Vec<(String, Vec<AgentEvent>)> {
    let mut out: Vec<(String, Vec<AgentEvent>)> = Vec::new();
    for event in events {
        match out.iter_mut().find(|(agent, _)| agent == &event.agent) {
            Some((_, bucket)) => bucket.push(event.clone()),
            None => out.push((event.agent.clone(), vec![event.clone()])),
        }
    }
    out
}
