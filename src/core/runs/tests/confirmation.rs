use serde_json::json;

use super::{Harness, args, new_run};
use crate::core::command::Command;
use crate::core::error::CoreError;
use crate::core::policy::{PolicyAction, RuleConfig};
use crate::core::runs::{
    ApplyOutcome, ConfirmDecision, Run, RunStatus, StepStatus, WakeReason, step_key,
};

async fn parked_for_confirmation(h: &Harness, config: RuleConfig) -> (Run, String) {
    h.add_rule("files", PolicyAction::Confirm, config).await;
    let run = h.running(new_run("r1")).await;
    let outcome = h
        .engine
        .apply(
            &run,
            &Command::ToolCall {
                name: "files.delete".into(),
                args: args(json!({"path": "/tmp/old"})),
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome, ApplyOutcome::Parked(WakeReason::ToolConfirm));

    let parked = h.store.require_run("r1").await.unwrap();
    let request_id = parked
        .pending_confirmation
        .as_ref()
        .unwrap()
        .request_id
        .clone();
    (parked, request_id)
}

fn decide(request_id: Option<&str>, approved: bool) -> ConfirmDecision {
    ConfirmDecision {
        request_id: request_id.map(str::to_string),
        approved,
        decided_by: Some("owner".into()),
        reason: None,
    }
}

#[tokio::test]
async fn confirm_parks_with_a_pending_call() {
    let h = Harness::new().await;
    let (parked, request_id) = parked_for_confirmation(&h, RuleConfig::default()).await;

    assert_eq!(parked.status, RunStatus::Waiting);
    assert_eq!(parked.wake_reason, Some(WakeReason::ToolConfirm));
    assert_eq!(parked.iteration, 1);
    assert_eq!(h.tool_calls(), 0);

    let call = h
        .store
        .get_step_by_key("r1", &step_key(0, "tool_call"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(call.status, StepStatus::Pending);
    assert_eq!(call.id, request_id);
}

#[tokio::test]
async fn mismatched_request_id_conflicts_and_leaves_the_run_waiting() {
    let h = Harness::new().await;
    parked_for_confirmation(&h, RuleConfig::default()).await;

    let err = h
        .engine
        .confirm_tool("r1", decide(Some("someone-else"), true))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ConfirmationConflict { .. }));
    assert_eq!(err.status_code(), 409);

    let run = h.store.require_run("r1").await.unwrap();
    assert_eq!(run.status, RunStatus::Waiting);
    assert_eq!(run.wake_reason, Some(WakeReason::ToolConfirm));
}

#[tokio::test]
async fn approval_executes_the_stored_call_on_the_next_iteration() {
    let h = Harness::new().await;
    let (_, request_id) = parked_for_confirmation(&h, RuleConfig::default()).await;

    let woken = h
        .engine
        .confirm_tool("r1", decide(Some(&request_id), true))
        .await
        .unwrap();
    assert_eq!(woken.status, RunStatus::Pending);
    assert_eq!(woken.wake_reason, Some(WakeReason::Confirmed));
    assert!(h.run_jobs().contains(&format!("confirm:r1:{request_id}")));

    // Deciding twice is refused.
    let again = h.engine.confirm_tool("r1", decide(None, true)).await;
    assert!(matches!(again, Err(CoreError::NotWaitingForConfirmation { .. })));

    let run = h.engine.claim("r1", false).await.unwrap().unwrap();
    h.engine.execute_confirmed(&run).await.unwrap();
    assert_eq!(h.tool_calls(), 1);

    let call = h
        .store
        .get_step_by_key("r1", &step_key(0, "tool_call"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(call.status, StepStatus::Completed);
    let result = h
        .store
        .get_step_by_key("r1", &step_key(0, "tool_result"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.status, StepStatus::Completed);

    // Replays are no-ops once the confirmation is cleared.
    let run = h.store.require_run("r1").await.unwrap();
    assert!(run.pending_confirmation.is_none());
    h.engine.execute_confirmed(&run).await.unwrap();
    assert_eq!(h.tool_calls(), 1);
}

#[tokio::test]
async fn rejection_records_a_failed_result() {
    let h = Harness::new().await;
    parked_for_confirmation(&h, RuleConfig::default()).await;

    h.engine
        .confirm_tool("r1", decide(None, false))
        .await
        .unwrap();
    let run = h.engine.claim("r1", false).await.unwrap().unwrap();
    h.engine.execute_confirmed(&run).await.unwrap();

    assert_eq!(h.tool_calls(), 0);
    let result = h
        .store
        .get_step_by_key("r1", &step_key(0, "tool_result"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.status, StepStatus::Failed);
    let body = result.result_json.unwrap();
    assert_eq!(body["rejected"], true);
    assert_eq!(body["decidedBy"], "owner");
}

#[tokio::test]
async fn rules_can_require_a_reason() {
    let h = Harness::new().await;
    parked_for_confirmation(
        &h,
        RuleConfig {
            require_reason: true,
            ..RuleConfig::default()
        },
    )
    .await;

    let err = h
        .engine
        .confirm_tool(
            "r1",
            ConfirmDecision {
                reason: Some("   ".into()),
                ..decide(None, true)
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ReasonRequired));
    assert_eq!(err.status_code(), 400);

    let run = h
        .engine
        .confirm_tool(
            "r1",
            ConfirmDecision {
                reason: Some("cleanup approved".into()),
                ..decide(None, true)
            },
        )
        .await
        .unwrap();
    assert_eq!(
        run.pending_confirmation.unwrap().reason.as_deref(),
        Some("cleanup approved")
    );
}
