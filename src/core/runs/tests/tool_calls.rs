use serde_json::json;

use super::{Harness, args, new_run};
use crate::core::command::{Command, RecoverAction};
use crate::core::policy::{PolicyAction, RuleConfig};
use crate::core::quota::{Period, TOOL_CALLS};
use crate::core::runs::{ApplyOutcome, NewRun, StepStatus, StepType, step_key};

fn call(name: &str, value: serde_json::Value) -> Command {
    Command::ToolCall {
        name: name.into(),
        args: args(value),
    }
}

#[tokio::test]
async fn allowed_call_records_call_and_result() {
    let h = Harness::new().await;
    let run = h.running(new_run("r1")).await;

    let outcome = h
        .engine
        .apply(&run, &call("notes.echo", json!({"text": "hi"})))
        .await
        .unwrap();
    assert_eq!(outcome, ApplyOutcome::Continue);
    assert_eq!(h.tool_calls(), 1);

    let steps = h.engine.list_steps("r1", 0).await.unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].step_type, StepType::ToolCall);
    assert_eq!(steps[0].status, StepStatus::Completed);
    assert_eq!(steps[1].step_type, StepType::ToolResult);
    assert_eq!(steps[1].result_json.as_ref().unwrap()["result"]["echo"]["text"], "hi");
}

#[tokio::test]
async fn replaying_an_iteration_does_not_execute_twice() {
    let h = Harness::new().await;
    let run = h.running(new_run("r1")).await;
    let command = call("notes.echo", json!({"text": "hi"}));

    h.engine.apply(&run, &command).await.unwrap();
    h.engine.apply(&run, &command).await.unwrap();

    assert_eq!(h.tool_calls(), 1);
    assert_eq!(h.engine.list_steps("r1", 0).await.unwrap().len(), 2);
}

#[tokio::test]
async fn denied_call_is_a_failed_result_not_an_error() {
    let h = Harness::new().await;
    h.add_rule(
        "files",
        PolicyAction::Deny,
        RuleConfig {
            message: Some("no deleting".into()),
            ..RuleConfig::default()
        },
    )
    .await;
    let run = h.running(new_run("r1")).await;

    let outcome = h
        .engine
        .apply(&run, &call("files.delete", json!({"path": "/tmp/x"})))
        .await
        .unwrap();
    assert_eq!(outcome, ApplyOutcome::Continue);
    assert_eq!(h.tool_calls(), 0);

    let result = h
        .store
        .get_step_by_key("r1", &step_key(0, "tool_result"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.status, StepStatus::Failed);
    let body = result.result_json.unwrap();
    assert_eq!(body["denied"], true);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn quota_denial_reports_usage() {
    let h = Harness::new().await;
    h.add_rule(
        "notes",
        PolicyAction::RateLimit,
        RuleConfig {
            rate_per_hour: Some(1),
            ..RuleConfig::default()
        },
    )
    .await;
    let run = h.running(new_run("r1")).await;
    let command = call("notes.echo", json!({}));

    h.engine.apply(&run, &command).await.unwrap();
    let run = h.next_iteration(&run).await;
    h.engine.apply(&run, &command).await.unwrap();

    assert_eq!(h.tool_calls(), 1);
    let result = h
        .store
        .get_step_by_key("r1", &step_key(1, "tool_result"))
        .await
        .unwrap()
        .unwrap();
    let body = result.result_json.unwrap();
    assert_eq!(body["denied"], true);
    assert_eq!(body["quota"]["limit"], 1);

    // The denied attempt is still counted in the tenant's hourly bucket.
    let usage = h.engine.current_usage("t1").await.unwrap();
    let hourly = usage
        .iter()
        .find(|row| row.resource_type == TOOL_CALLS && row.period == Period::Hour)
        .expect("hourly tool call bucket");
    assert_eq!(hourly.usage_count, 2);
    assert_eq!(hourly.usage_limit, Some(1));
    assert_eq!(hourly.remaining, Some(-1));
    assert!(h.engine.current_usage("t2").await.unwrap().is_empty());
}

#[tokio::test]
async fn tools_outside_the_allow_list_are_refused() {
    let h = Harness::new().await;
    let run = h
        .running(NewRun {
            allowed_tools: Some(vec!["notes.*".into()]),
            ..new_run("r1")
        })
        .await;

    h.engine
        .apply(&run, &call("files.delete", json!({})))
        .await
        .unwrap();
    assert_eq!(h.tool_calls(), 0);
    let result = h
        .store
        .get_step_by_key("r1", &step_key(0, "tool_result"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.status, StepStatus::Failed);
    assert!(result.result_json.unwrap()["error"]
        .as_str()
        .unwrap()
        .contains("not available"));
}

#[tokio::test]
async fn recover_retry_reruns_the_last_failed_call() {
    let h = Harness::new().await;
    let run = h.running(new_run("r1")).await;
    h.engine
        .apply(&run, &call("notes.echo", json!({"fail": true})))
        .await
        .unwrap();
    assert_eq!(h.tool_calls(), 1);

    let run = h.next_iteration(&run).await;
    h.engine
        .apply(
            &run,
            &Command::Recover {
                reason: "transient".into(),
                action: RecoverAction::Retry,
                message: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(h.tool_calls(), 2);
    assert!(
        h.store
            .get_step_by_key("r1", &step_key(1, "tool_result"))
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn recover_abort_fails_the_run() {
    let h = Harness::new().await;
    let run = h.running(new_run("r1")).await;
    let outcome = h
        .engine
        .apply(
            &run,
            &Command::Recover {
                reason: "stuck".into(),
                action: RecoverAction::Abort,
                message: Some("Could not finish the task.".into()),
            },
        )
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ApplyOutcome::Finished(crate::core::runs::RunStatus::Failed)
    );
    let run = h.store.require_run("r1").await.unwrap();
    assert_eq!(run.output_text.as_deref(), Some("Could not finish the task."));
}
