//! Tests for turn generations, cancellation and `run_turn`.

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use toolgate::api::FrameStream;
use toolgate::session::{run_turn, spawn_turn_stream, Requester, SessionController, StreamMessage};
use toolgate::turn::{TimelineMutation, TurnOutcome};
use toolgate::types::{EntryRole, EntryStatus, Timeline, TurnEvent};

use crate::common::{sse_body, ScriptedChat};

fn stream(body: &str, token: CancellationToken) -> FrameStream {
    FrameStream::from_chunks(
        futures::stream::iter(vec![Ok(body.as_bytes().to_vec())]),
        token,
    )
}

#[tokio::test]
async fn test_run_turn_binds_session_for_next_turn() {
    let body = sse_body(&[
        ("session", json!({"session_id": "s1"})),
        ("token", json!({"text": "Hi"})),
        ("token", json!({"text": " there"})),
        ("done", json!({"session_id": "s1", "message_count": 2})),
    ]);
    let transport = ScriptedChat::replaying(&body);
    let mut controller = SessionController::new(Requester::chat(), false);
    let mut timeline = Timeline::new();
    let stop = CancellationToken::new();

    let mut seen = Vec::new();
    let outcome = run_turn(&mut controller, &transport, &mut timeline, "hello", &stop, |_, m| {
        seen.push(m.clone());
    })
    .await;

    assert_eq!(outcome, TurnOutcome::Done);
    assert_eq!(controller.session_id(), "s1");
    assert!(!controller.is_active());
    assert_eq!(timeline.last().unwrap().content, "Hi there");
    assert_eq!(seen.last(), Some(&TimelineMutation::Finished(TurnOutcome::Done)));

    run_turn(&mut controller, &transport, &mut timeline, "again", &stop, |_, _| {}).await;
    let requests = transport.requests();
    assert_eq!(requests[0].session_id, "");
    assert_eq!(requests[1].session_id, "s1");
    assert_eq!(requests[1].message, "again");
}

#[tokio::test]
async fn test_stop_before_any_content_removes_placeholder() {
    let transport = ScriptedChat::stalling("");
    let mut controller = SessionController::new(Requester::chat(), false);
    let mut timeline = Timeline::new();
    let stop = CancellationToken::new();
    stop.cancel();

    let outcome = run_turn(&mut controller, &transport, &mut timeline, "hello", &stop, |_, _| {}).await;

    assert_eq!(outcome, TurnOutcome::Cancelled);
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline.entries()[0].role, EntryRole::User);
}

#[tokio::test]
async fn test_stop_after_partial_text_keeps_it() {
    let body = sse_body(&[
        ("session", json!({"session_id": "s1"})),
        ("token", json!({"text": "Hel"})),
    ]);
    let transport = ScriptedChat::stalling(&body);
    let mut controller = SessionController::new(Requester::chat(), false);
    let mut timeline = Timeline::new();
    let stop = CancellationToken::new();
    let generation_before = controller.generation();

    let trigger = stop.clone();
    let outcome = run_turn(&mut controller, &transport, &mut timeline, "hello", &stop, |_, m| {
        if matches!(m, TimelineMutation::TextAppended { .. }) {
            trigger.cancel();
        }
    })
    .await;

    assert_eq!(outcome, TurnOutcome::Cancelled);
    let assistant = timeline.last().unwrap();
    assert_eq!(assistant.content, "Hel");
    assert_eq!(assistant.status, EntryStatus::Done);
    // One bump to start the turn, one to cancel it.
    assert_eq!(controller.generation(), generation_before + 2);
    assert_eq!(controller.session_id(), "s1");
}

#[tokio::test]
async fn test_open_failure_is_a_failed_turn() {
    let transport = ScriptedChat {
        fail_open: true,
        ..ScriptedChat::default()
    };
    let mut controller = SessionController::new(Requester::chat(), false);
    let mut timeline = Timeline::new();

    let outcome = run_turn(
        &mut controller,
        &transport,
        &mut timeline,
        "hello",
        &CancellationToken::new(),
        |_, _| {},
    )
    .await;

    assert!(outcome.is_failure());
    assert_eq!(timeline.last().unwrap().status, EntryStatus::Error);
    assert!(timeline.last().unwrap().content.contains("503"));
}

#[tokio::test]
async fn test_stream_without_terminal_frame_is_implicit_error() {
    let body = sse_body(&[
        ("session", json!({"session_id": "s1"})),
        ("tool_start", json!({"tool": "search", "args": {}})),
    ]);
    let transport = ScriptedChat::replaying(&body);
    let mut controller = SessionController::new(Requester::chat(), false);
    let mut timeline = Timeline::new();

    let outcome = run_turn(
        &mut controller,
        &transport,
        &mut timeline,
        "hello",
        &CancellationToken::new(),
        |_, _| {},
    )
    .await;

    assert!(matches!(outcome, TurnOutcome::Failed { implicit: true, .. }));
    let tool = timeline.last().unwrap();
    assert_eq!(tool.tool_name(), Some("search"));
    assert_eq!(tool.status, EntryStatus::Streaming);
}

#[tokio::test]
async fn test_superseded_stream_cannot_reach_the_timeline() {
    let mut controller = SessionController::new(Requester::chat(), false);
    let old = controller.begin_turn("one");
    let new = controller.begin_turn("two");
    assert!(old.token.is_cancelled());

    let (tx, mut rx) = mpsc::channel(16);
    // The old stream ignores its cancelled token and keeps delivering.
    let old_body = sse_body(&[("token", json!({"text": "stale"}))]);
    let new_body = sse_body(&[("token", json!({"text": "fresh"}))]);
    spawn_turn_stream(stream(&old_body, CancellationToken::new()), old.generation, tx.clone())
        .await
        .unwrap();
    spawn_turn_stream(stream(&new_body, new.token.clone()), new.generation, tx)
        .await
        .unwrap();

    let mut texts = Vec::new();
    while let Some(frame) = rx.recv().await {
        if let Some(StreamMessage::Event(TurnEvent::TextDelta(text))) = controller.accept(frame) {
            texts.push(text);
        }
    }
    assert_eq!(texts, vec!["fresh".to_string()]);
}

#[tokio::test]
async fn test_cancelled_reader_forwards_nothing() {
    let token = CancellationToken::new();
    token.cancel();
    let body = sse_body(&[("token", json!({"text": "never"}))]);
    let (tx, mut rx) = mpsc::channel(4);

    spawn_turn_stream(stream(&body, token), 1, tx).await.unwrap();
    assert!(rx.recv().await.is_none());
}
