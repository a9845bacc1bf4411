use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use harness_events::AgentEvent;
use tokio::sync::mpsc;

use crate::error::AdapterError;
use crate::options::RunOptions;

/// Type-erased adapter production: a finite stream of events.
///
/// An `Err` item is the adapter "raising" mid-production and ends the stream.
/// Dropping the stream is the close request; conforming producers propagate
/// it into child-process / socket / temp-file teardown.
pub type AdapterStream = Pin<Box<dyn Stream<Item = Result<AgentEvent, AdapterError>> + Send>>;

/// A concrete producer for one backend.
///
/// A run SHOULD begin with an `init` event and end with a `done`, and every
/// event of the run MUST carry the same session id. The driver tolerates
/// violations: it synthesizes missing terminals, suppresses post-terminal
/// activity, and converts `Err` items into an error + terminal pair.
pub trait Adapter: Send + Sync {
    /// Stable backend identifier (also the `agent` field of emitted events).
    fn id(&self) -> &str;

    /// Cheap, side-effect-free availability probe. Must not panic.
    fn available(&self) -> bool;

    /// Starts one session. The production cooperates with
    /// `options.cancel`: once tripped it stops emitting promptly; a
    /// `done{interrupted}` is permitted but not required.
    fn run(&self, prompt: &str, options: &RunOptions) -> AdapterStream;
}

/// Channel-backed [`AdapterStream`] used by the in-tree backends: a spawned
/// task owns the transport and forwards events; dropping the stream closes
/// the receiver, which ends the task on its next send.
pub(crate) struct ChannelProduction {
    rx: mpsc::Receiver<Result<AgentEvent, AdapterError>>,
}

impl Stream for ChannelProduction {
    type Item = Result<AgentEvent, AdapterError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

pub(crate) fn production_channel() -> (
    mpsc::Sender<Result<AgentEvent, AdapterError>>,
    AdapterStream,
) {
    let (tx, rx) = mpsc::channel(32);
    (tx, Box::pin(ChannelProduction { rx }))
}

/// Scans `PATH` for an executable file with the given name.
pub(crate) fn binary_on_path(name: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(name).is_file())
}

/// Availability probe for a configured binary: explicit paths are checked
/// directly, bare names are resolved against `PATH`.
pub(crate) fn binary_available(binary: &std::path::Path) -> bool {
    if binary.components().count() > 1 {
        binary.is_file()
    } else {
        binary.to_str().map(binary_on_path).unwrap_or(false)
    }
}
