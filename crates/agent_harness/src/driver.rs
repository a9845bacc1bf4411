use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use futures_core::Stream;
use futures_util::StreamExt;
use harness_events::{
    new_session_id, AgentEvent, DonePayload, ErrorPayload, EventPayload, SessionStatus, UsageTotals,
};
use tokio::sync::mpsc;

use crate::adapter::Adapter;
use crate::error::HarnessError;
use crate::options::RunOptions;
use crate::registry::AdapterRegistry;

/// Synthesized when an adapter production yields an `Err` before its own
/// terminal event.
pub const CODE_ADAPTER_ERROR: &str = "ADAPTER_ERROR";
/// Synthesized when an adapter production ends without a `done`.
pub const CODE_MISSING_DONE: &str = "MISSING_DONE";

// ─── SessionStream ────────────────────────────────────────────────────────

/// The caller-facing event stream produced by [`drive`] and
/// [`crate::drive_all`].
///
/// Backed by an mpsc channel fed from spawned driver tasks. Dropping the
/// stream closes the receiver; the driver tasks notice on their next send
/// and tear the underlying adapter productions down.
#[derive(Debug)]
pub struct SessionStream {
    rx: mpsc::Receiver<AgentEvent>,
}

impl SessionStream {
    pub(crate) fn new(rx: mpsc::Receiver<AgentEvent>) -> Self {
        Self { rx }
    }
}

impl Stream for SessionStream {
    type Item = AgentEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Gathers a full stream into memory. Convenience for callers and tests that
/// want the terminal result rather than incremental delivery.
pub async fn collect_session(stream: SessionStream) -> Vec<AgentEvent> {
    stream.collect().await
}

// ─── Per-session lifecycle state ──────────────────────────────────────────

/// Tracks one session's identity and terminal state while the driver pulls
/// its adapter, and builds the synthesized events of §4.4.
pub(crate) struct SessionLifecycle {
    agent: String,
    session_id: String,
    started: Instant,
    last_ts: u64,
    terminal_emitted: bool,
}

impl SessionLifecycle {
    pub(crate) fn new(agent: &str) -> Self {
        Self {
            agent: agent.to_string(),
            session_id: new_session_id(),
            started: Instant::now(),
            last_ts: harness_events::now_ms(),
            terminal_emitted: false,
        }
    }

    /// Adopts the adapter's session id and terminal state from an event that
    /// is about to be yielded unchanged. Synthesized terminals inherit the
    /// most recent adapter-supplied id.
    pub(crate) fn observe(&mut self, event: &AgentEvent) {
        self.session_id = event.session_id.clone();
        self.last_ts = self.last_ts.max(event.timestamp_ms);
        if event.is_terminal() {
            self.terminal_emitted = true;
        }
    }

    fn synthesize(&mut self, payload: EventPayload) -> AgentEvent {
        let mut event = AgentEvent::new(&self.agent, &self.session_id, payload);
        // Wall clock may step backwards; per-session timestamps must not.
        event.timestamp_ms = event.timestamp_ms.max(self.last_ts);
        self.last_ts = event.timestamp_ms;
        event
    }

    fn done(&mut self, status: SessionStatus, duration_ms: u64) -> AgentEvent {
        self.terminal_emitted = true;
        self.synthesize(EventPayload::Done(DonePayload {
            status,
            final_text: None,
            usage: UsageTotals::default(),
            duration_ms,
        }))
    }

    /// Terminal for a token that was already tripped before the adapter was
    /// invoked: `done{interrupted}` with zero duration.
    pub(crate) fn pre_aborted(&mut self) -> AgentEvent {
        self.done(SessionStatus::Interrupted, 0)
    }

    /// Terminal for a trip during production, unless the adapter already
    /// produced its own `done`.
    pub(crate) fn interrupted(&mut self) -> Option<AgentEvent> {
        if self.terminal_emitted {
            return None;
        }
        let duration = self.started.elapsed().as_millis() as u64;
        Some(self.done(SessionStatus::Interrupted, duration))
    }

    /// `error{ADAPTER_ERROR}` + `done{error}` for an adapter that raised
    /// before its own terminal. A raise after `done` is silently cleaned.
    pub(crate) fn adapter_failure(&mut self, message: &str) -> Vec<AgentEvent> {
        self.failure_pair(CODE_ADAPTER_ERROR, message.to_string())
    }

    /// `error{MISSING_DONE}` + `done{error}` for a production that exhausted
    /// without a terminal event.
    pub(crate) fn missing_done(&mut self) -> Vec<AgentEvent> {
        self.failure_pair(
            CODE_MISSING_DONE,
            "protocol violation: adapter completed without terminal event".to_string(),
        )
    }

    fn failure_pair(&mut self, code: &str, message: String) -> Vec<AgentEvent> {
        if self.terminal_emitted {
            return Vec::new();
        }
        let error = self.synthesize(EventPayload::Error(ErrorPayload {
            code: Some(code.to_string()),
            message,
            recoverable: false,
        }));
        let duration = self.started.elapsed().as_millis() as u64;
        vec![error, self.done(SessionStatus::Error, duration)]
    }

    pub(crate) fn terminal_emitted(&self) -> bool {
        self.terminal_emitted
    }
}

// ─── Single-session driver ────────────────────────────────────────────────

/// Drives one session of the named backend, normalizing its lifecycle.
///
/// Fails synchronously when `backend` is not registered; every other failure
/// mode is visible only as events on the returned stream. Must be called
/// from within a tokio runtime.
pub fn drive(
    backend: &str,
    prompt: impl Into<String>,
    options: RunOptions,
    registry: &AdapterRegistry,
) -> Result<SessionStream, HarnessError> {
    let adapter = registry
        .lookup(backend)
        .ok_or_else(|| HarnessError::UnknownBackend(backend.to_string()))?;
    Ok(drive_adapter(adapter, prompt.into(), options))
}

/// [`drive`] for an adapter handle obtained outside the registry.
pub fn drive_adapter(
    adapter: Arc<dyn Adapter>,
    prompt: String,
    options: RunOptions,
) -> SessionStream {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(run_session(adapter, prompt, options, tx));
    SessionStream::new(rx)
}

/// The per-session driver loop, shared by [`drive`] and the parallel driver.
///
/// Guarantees on the emitted sequence: exactly one `done`, nothing after it,
/// a stable session id on synthesized terminals, and no adapter invocation
/// when the token was tripped up front.
pub(crate) async fn run_session(
    adapter: Arc<dyn Adapter>,
    prompt: String,
    options: RunOptions,
    tx: mpsc::Sender<AgentEvent>,
) {
    let mut lifecycle = SessionLifecycle::new(adapter.id());
    let cancel = options.cancel.clone();

    if cancel.is_cancelled() {
        let _ = tx.send(lifecycle.pre_aborted()).await;
        return;
    }

    let mut production = adapter.run(&prompt, &options);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Some(done) = lifecycle.interrupted() {
                    let _ = tx.send(done).await;
                }
                break;
            }
            item = production.next() => match item {
                Some(Ok(event)) => {
                    lifecycle.observe(&event);
                    let terminal = event.is_terminal();
                    if tx.send(event).await.is_err() {
                        break;
                    }
                    if terminal {
                        // Post-terminal activity is a protocol violation;
                        // stop pulling and let drop close the production.
                        break;
                    }
                }
                Some(Err(err)) => {
                    if lifecycle.terminal_emitted() {
                        tracing::debug!(
                            agent = adapter.id(),
                            error = %err,
                            "adapter raised after its terminal event; swallowed"
                        );
                    }
                    for event in lifecycle.adapter_failure(&err.to_string()) {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    break;
                }
                None => {
                    if !lifecycle.terminal_emitted() {
                        tracing::warn!(
                            agent = adapter.id(),
                            "adapter production ended without a terminal event"
                        );
                    }
                    for event in lifecycle.missing_done() {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pre_abort_terminal_has_zero_duration_and_zeroed_usage() {
        let mut lifecycle = SessionLifecycle::new("claude");
        let event = lifecycle.pre_aborted();
        let done = event.as_done().unwrap();
        assert_eq!(done.status, SessionStatus::Interrupted);
        assert_eq!(done.duration_ms, 0);
        assert_eq!(done.usage, UsageTotals::default());
        assert!(lifecycle.terminal_emitted());
    }

    #[test]
    fn synthesized_terminal_inherits_observed_session_id() {
        let mut lifecycle = SessionLifecycle::new("codex");
        let seeded = lifecycle.session_id.clone();

        let adopted = AgentEvent::new(
            "codex",
            "thread-77",
            EventPayload::Text(harness_events::TextPayload { text: "hi".into() }),
        );
        lifecycle.observe(&adopted);

        let done = lifecycle.interrupted().unwrap();
        assert_eq!(done.session_id, "thread-77");
        assert_ne!(done.session_id, seeded);
    }

    #[test]
    fn interrupt_after_terminal_is_suppressed() {
        let mut lifecycle = SessionLifecycle::new("gemini");
        let done = AgentEvent::new(
            "gemini",
            "s",
            EventPayload::Done(DonePayload {
                status: SessionStatus::Success,
                final_text: None,
                usage: UsageTotals::default(),
                duration_ms: 5,
            }),
        );
        lifecycle.observe(&done);
        assert!(lifecycle.interrupted().is_none());
        assert!(lifecycle.adapter_failure("late boom").is_empty());
        assert!(lifecycle.missing_done().is_empty());
    }

    #[test]
    fn failure_pair_shares_session_id_and_orders_error_before_done() {
        let mut lifecycle = SessionLifecycle::new("claude");
        let events = lifecycle.adapter_failure("boom");
        assert_eq!(events.len(), 2);

        let error = events[0].as_error().unwrap();
        assert_eq!(error.code.as_deref(), Some(CODE_ADAPTER_ERROR));
        assert_eq!(error.message, "boom");
        assert!(!error.recoverable);

        let done = events[1].as_done().unwrap();
        assert_eq!(done.status, SessionStatus::Error);
        assert_eq!(events[0].session_id, events[1].session_id);
        assert!(events[0].timestamp_ms <= events[1].timestamp_ms);
    }

    #[test]
    fn missing_done_pair_uses_protocol_violation_message() {
        let mut lifecycle = SessionLifecycle::new("claude");
        let events = lifecycle.missing_done();
        let error = events[0].as_error().unwrap();
        assert_eq!(error.code.as_deref(), Some(CODE_MISSING_DONE));
        assert!(error.message.contains("protocol violation"));
    }
}
