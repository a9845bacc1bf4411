//! Parallel driver contract: merged fan-in with independent per-task
//! lifecycles, error isolation, and global cancellation.

mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use agent_harness::{collect_session, drive_all, RunOptions, SessionTask};
use futures::StreamExt;
use harness_events::SessionStatus;
use support::{
    assert_session_invariants, done_success, project_by_agent, text, ScriptStep, ScriptedAdapter,
};

#[tokio::test]
async fn empty_task_list_produces_nothing() {
    let events = collect_session(drive_all(Vec::new())).await;
    assert!(events.is_empty());
}

#[tokio::test]
async fn merged_stream_has_one_done_per_task() {
    let first = ScriptedAdapter::new(
        "claude",
        "s1",
        vec![
            ScriptStep::Event(text("one")),
            ScriptStep::Event(done_success()),
        ],
    );
    let second = ScriptedAdapter::new(
        "gemini",
        "s2",
        vec![
            ScriptStep::Event(text("two")),
            ScriptStep::Event(text("more")),
            ScriptStep::Event(done_success()),
        ],
    );

    let events = collect_session(drive_all(vec![
        SessionTask::new(Arc::new(first), "p1"),
        SessionTask::new(Arc::new(second), "p2"),
    ]))
    .await;

    let projections = project_by_agent(&events);
    assert_eq!(projections.len(), 2);
    for (agent, session) in &projections {
        assert_session_invariants(session);
        let done = session.last().unwrap().as_done().unwrap();
        assert_eq!(done.status, SessionStatus::Success, "agent {agent}");
    }
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 2);
}

#[tokio::test]
async fn one_failing_task_does_not_terminate_the_others() {
    let failing = ScriptedAdapter::new(
        "codex",
        "s1",
        vec![
            ScriptStep::Event(text("about to fail")),
            ScriptStep::Fail("exploded".into()),
        ],
    );
    let healthy = ScriptedAdapter::new(
        "claude",
        "s2",
        vec![
            ScriptStep::Event(text("fine")),
            ScriptStep::Event(done_success()),
        ],
    );

    let events = collect_session(drive_all(vec![
        SessionTask::new(Arc::new(failing), "p1"),
        SessionTask::new(Arc::new(healthy), "p2"),
    ]))
    .await;

    let projections = project_by_agent(&events);
    for (_, session) in &projections {
        assert_session_invariants(session);
    }

    let statuses: Vec<SessionStatus> = projections
        .iter()
        .map(|(_, session)| session.last().unwrap().as_done().unwrap().status)
        .collect();
    assert!(statuses.contains(&SessionStatus::Error));
    assert!(statuses.contains(&SessionStatus::Success));
}

#[tokio::test]
async fn tripping_one_token_cancels_all_tasks() {
    let first = ScriptedAdapter::new(
        "claude",
        "s1",
        vec![ScriptStep::Event(text("one")), ScriptStep::Stall],
    );
    let second = ScriptedAdapter::new(
        "gemini",
        "s2",
        vec![ScriptStep::Event(text("two")), ScriptStep::Stall],
    );

    let first_options = RunOptions::default();
    let trip = first_options.cancel.clone();

    let mut stream = drive_all(vec![
        SessionTask::new(Arc::new(first), "p1").with_options(first_options),
        SessionTask::new(Arc::new(second), "p2"),
    ]);

    // Wait for both tasks to produce their text before cancelling one token.
    let mut events = Vec::new();
    while events.iter().filter(|e: &&harness_events::AgentEvent| e.kind() == "text").count() < 2 {
        let event = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("both tasks must emit")
            .expect("stream must stay open");
        events.push(event);
    }

    trip.cancel();

    let rest: Vec<_> = tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
        .await
        .expect("merged stream must end after global cancel");
    events.extend(rest);

    let interrupted: Vec<_> = events
        .iter()
        .filter(|e| {
            e.as_done()
                .map(|d| d.status == SessionStatus::Interrupted)
                .unwrap_or(false)
        })
        .collect();
    assert_eq!(interrupted.len(), 2, "one interrupted done per task");

    let agents: std::collections::HashSet<_> =
        interrupted.iter().map(|e| e.agent.as_str()).collect();
    assert!(agents.contains("claude"));
    assert!(agents.contains("gemini"));

    for (_, session) in project_by_agent(&events) {
        assert_session_invariants(&session);
    }
}

#[tokio::test]
async fn pre_tripped_token_aborts_every_task_without_invoking_adapters() {
    let first = ScriptedAdapter::new("claude", "s1", vec![ScriptStep::Event(done_success())]);
    let second = ScriptedAdapter::new("gemini", "s2", vec![ScriptStep::Event(done_success())]);
    let first_invoked = Arc::clone(&first.invoked);
    let second_invoked = Arc::clone(&second.invoked);

    let tripped = RunOptions::default();
    tripped.cancel.cancel();

    let events = collect_session(drive_all(vec![
        SessionTask::new(Arc::new(first), "p1").with_options(tripped),
        SessionTask::new(Arc::new(second), "p2"),
    ]))
    .await;

    assert_eq!(events.len(), 2);
    // Task order is preserved in the pre-abort path.
    assert_eq!(events[0].agent, "claude");
    assert_eq!(events[1].agent, "gemini");
    for event in &events {
        let done = event.as_done().unwrap();
        assert_eq!(done.status, SessionStatus::Interrupted);
        assert_eq!(done.duration_ms, 0);
    }
    assert!(!first_invoked.load(Ordering::SeqCst));
    assert!(!second_invoked.load(Ordering::SeqCst));
}
