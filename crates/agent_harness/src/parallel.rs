use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::adapter::Adapter;
use crate::driver::{run_session, SessionLifecycle, SessionStream};
use crate::options::RunOptions;

/// One unit of work for [`drive_all`].
pub struct SessionTask {
    pub adapter: Arc<dyn Adapter>,
    pub prompt: String,
    pub options: RunOptions,
}

impl SessionTask {
    pub fn new(adapter: Arc<dyn Adapter>, prompt: impl Into<String>) -> Self {
        Self {
            adapter,
            prompt: prompt.into(),
            options: RunOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }
}

/// Drives N independent sessions over one merged stream.
///
/// Each task gets its own lifecycle: exactly one `done` per task, one task's
/// failure never terminates the others, and per-task event order is the
/// arrival order of its producer. No cross-task ordering is guaranteed.
///
/// Tripping ANY task's cancellation token cancels ALL tasks: the tasks'
/// tokens are bridged into one internal parent whose children replace the
/// per-task tokens, so backends observe the merged signal too. If any token
/// is already tripped up front, no adapter is invoked at all and one
/// `done{interrupted}` per task is emitted in task order.
pub fn drive_all(tasks: Vec<SessionTask>) -> SessionStream {
    let (tx, rx) = mpsc::channel(32);
    let stream = SessionStream::new(rx);

    if tasks.is_empty() {
        return stream;
    }

    if tasks.iter().any(|t| t.options.cancel.is_cancelled()) {
        tokio::spawn(async move {
            for task in tasks {
                let mut lifecycle = SessionLifecycle::new(task.adapter.id());
                if tx.send(lifecycle.pre_aborted()).await.is_err() {
                    break;
                }
            }
        });
        return stream;
    }

    let any_cancel = CancellationToken::new();
    let all_settled = CancellationToken::new();

    let mut sessions = Vec::with_capacity(tasks.len());
    for task in tasks {
        // Bridge this task's own token into the shared any-cancel signal.
        // The watcher dies with `all_settled` so it cannot outlive the run.
        let own = task.options.cancel.clone();
        let any = any_cancel.clone();
        let settled = all_settled.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = own.cancelled() => any.cancel(),
                _ = settled.cancelled() => {}
            }
        });

        let mut options = task.options;
        options.cancel = any_cancel.child_token();
        sessions.push(tokio::spawn(run_session(
            task.adapter,
            task.prompt,
            options,
            tx.clone(),
        )));
    }
    drop(tx);

    tokio::spawn(async move {
        for session in sessions {
            let _ = session.await;
        }
        all_settled.cancel();
    });

    stream
}
