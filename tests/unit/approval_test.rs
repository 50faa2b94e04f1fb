//! Tests for the approval state machine against a recording transport.

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_test::{assert_err, assert_ok};
use toolgate::approval::{ApprovalMachine, ApprovalState, Execution};
use toolgate::error::{ConsoleError, ErrorKind};
use toolgate::session::Requester;
use toolgate::types::{ApprovalDirective, EntryStatus, Timeline};

use crate::common::{answer, args, RecordingTransport};

fn needs_approval(id: &str, preview: &str) -> serde_json::Value {
    json!({
        "success": false,
        "status": "needs_approval",
        "tool": "delete_file",
        "approval_id": id,
        "preview": preview,
        "duration_ms": 0.4
    })
}

#[tokio::test]
async fn test_delete_scenario() {
    let transport = RecordingTransport::answering(vec![
        answer(needs_approval("ap_1", "will delete a.txt")),
        answer(json!({"success": true, "status": "ok", "tool": "delete_file", "result": "deleted"})),
    ]);
    let mut machine = ApprovalMachine::new(&transport, Requester::form("files"));
    let mut timeline = Timeline::new();

    let execution = assert_ok!(machine.execute("/files/delete", args(json!({"path": "a.txt"}))).await);
    let pending = execution.pending().cloned().unwrap();
    assert_eq!(pending.approval_id, "ap_1");
    assert_eq!(pending.preview, "will delete a.txt");
    assert_eq!(machine.state(), ApprovalState::ApprovedPending);

    let result = assert_ok!(machine.confirm().await).into_result().unwrap();
    timeline.push_invocation(&result, pending.args.clone());

    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(
        sent[1].body(),
        json!({
            "args": {"path": "a.txt"},
            "approval": {"confirm": true, "dry_run": false, "approval_id": "ap_1", "actor": "form:files"}
        })
    );
    assert!(machine.pending().is_none());
    assert_eq!(machine.state(), ApprovalState::Idle);
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline.entries()[0].status, EntryStatus::Done);
    assert_eq!(timeline.entries()[0].content, "deleted");
    assert_eq!(timeline.entries()[0].tool.as_ref().unwrap().args, pending.args);
}

#[tokio::test]
async fn test_confirm_sends_snapshot_not_live_args() {
    let transport = RecordingTransport::answering(vec![
        answer(needs_approval("ap_1", "will delete a.txt")),
        answer(json!({"status": "ok", "tool": "delete_file", "result": "deleted"})),
    ]);
    let mut machine = ApprovalMachine::new(&transport, Requester::form("files"));

    let mut form = args(json!({"path": "a.txt"}));
    machine.execute("/files/delete", form.clone()).await.unwrap();
    form.insert("path".into(), json!("important.txt"));

    machine.confirm().await.unwrap();
    assert_eq!(transport.sent()[1].args["path"], "a.txt");
    assert_eq!(transport.sent()[1].path, "/files/delete");
}

#[tokio::test]
async fn test_second_execute_supersedes_first() {
    let transport = RecordingTransport::answering(vec![
        answer(needs_approval("ap_1", "will delete a.txt")),
        answer(needs_approval("ap_2", "will delete b.txt")),
    ]);
    let mut machine = ApprovalMachine::new(&transport, Requester::form("files"));

    machine.execute("/files/delete", args(json!({"path": "a.txt"}))).await.unwrap();
    machine.execute("/files/delete", args(json!({"path": "b.txt"}))).await.unwrap();

    let err = assert_err!(machine.confirm_approval("ap_1").await);
    assert!(err.is_nothing_to_confirm());
    assert_eq!(err.kind(), ErrorKind::Local);
    assert_eq!(transport.sent().len(), 2);
    assert_eq!(machine.pending().map(|p| p.approval_id.as_str()), Some("ap_2"));
}

#[tokio::test]
async fn test_failed_dry_run_leaves_nothing_pending() {
    let transport = RecordingTransport::answering(vec![
        answer(needs_approval("ap_1", "will delete a.txt")),
        Err(ConsoleError::http_status(500, "internal error")),
    ]);
    let mut machine = ApprovalMachine::new(&transport, Requester::form("files"));

    machine.execute("/files/delete", args(json!({"path": "a.txt"}))).await.unwrap();
    let err = assert_err!(machine.execute("/files/delete", args(json!({"path": "b.txt"}))).await);
    assert!(err.is_transport());
    assert!(machine.pending().is_none());
    assert_eq!(machine.state(), ApprovalState::Idle);
}

#[tokio::test]
async fn test_domain_error_from_dry_run_is_returned_verbatim() {
    let transport = RecordingTransport::answering(vec![answer(json!({
        "success": false,
        "status": "error",
        "tool": "delete_file",
        "error": "Tool not found: delete_file"
    }))]);
    let mut machine = ApprovalMachine::new(&transport, Requester::chat());

    let execution = machine.execute("/files/delete", args(json!({}))).await.unwrap();
    let Execution::Finished(result) = execution else {
        panic!("expected a finished execution");
    };
    let err = result.into_domain_result().unwrap_err();
    assert_eq!(err.to_string(), "delete_file: Tool not found: delete_file");
    assert!(machine.pending().is_none());
}

#[tokio::test]
async fn test_requesters_do_not_share_pending_slot() {
    let chat_transport = RecordingTransport::answering(vec![answer(needs_approval("ap_chat", "chat preview"))]);
    let form_transport = RecordingTransport::answering(vec![answer(needs_approval("ap_form", "form preview"))]);
    let mut chat = ApprovalMachine::new(&chat_transport, Requester::chat());
    let mut form = ApprovalMachine::new(&form_transport, Requester::form("files"));

    chat.execute("/files/delete", args(json!({"path": "a.txt"}))).await.unwrap();
    form.execute("/files/delete", args(json!({"path": "b.txt"}))).await.unwrap();
    form.cancel();

    assert_eq!(chat.pending().map(|p| p.approval_id.as_str()), Some("ap_chat"));
    assert!(form.pending().is_none());
    assert_eq!(chat_transport.sent()[0].actor.as_deref(), Some("chat"));
    assert_eq!(form_transport.sent()[0].approval, ApprovalDirective::DryRun);
}

#[tokio::test]
async fn test_abandon_after_failed_confirm() {
    let transport = RecordingTransport::answering(vec![
        answer(needs_approval("ap_1", "will delete a.txt")),
        Err(ConsoleError::network("connection reset by peer")),
    ]);
    let mut machine = ApprovalMachine::new(&transport, Requester::chat());
    machine.execute("/files/delete", args(json!({"path": "a.txt"}))).await.unwrap();

    let err = assert_err!(machine.confirm().await);
    assert!(err.is_transport());
    assert_eq!(machine.state(), ApprovalState::AwaitingDecision);

    assert_eq!(machine.cancel().map(|p| p.approval_id), Some("ap_1".to_string()));
    assert!(assert_err!(machine.confirm().await).is_nothing_to_confirm());
    assert_eq!(transport.sent().len(), 2);
}

#[tokio::test]
async fn test_direct_call_to_gated_tool_is_refused() {
    let transport = RecordingTransport::answering(vec![answer(needs_approval("ap_1", "will delete a.txt"))]);
    let mut machine = ApprovalMachine::new(&transport, Requester::form("cli"));

    let err = assert_err!(
        machine
            .execute_direct("/files/delete", args(json!({"path": "a.txt"})))
            .await
    );
    assert_eq!(err.kind(), ErrorKind::Domain);
    assert!(matches!(err, ConsoleError::ApprovalRequired { ref tool } if tool == "delete_file"));
    assert!(machine.pending().is_none());
    assert_eq!(machine.state(), ApprovalState::Idle);
    assert_eq!(transport.sent()[0].approval, ApprovalDirective::Direct);
}
