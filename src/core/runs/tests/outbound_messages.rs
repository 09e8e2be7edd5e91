use tokio_stream::StreamExt;

use super::{Harness, new_run};
use crate::core::command::{Command, Importance};
use crate::core::queue::{DELIVERY_QUEUE, MEMORY_QUEUE};
use crate::core::runs::events::StepEvent;
use crate::core::runs::{NewRun, StepStatus, StepType, step_key};
use crate::core::store::MessageDirection;

fn say(text: &str) -> Command {
    Command::SendMessage {
        message: text.into(),
        file_ids: Vec::new(),
    }
}

#[tokio::test]
async fn one_message_per_iteration_and_no_repeats() {
    let h = Harness::new().await;
    let run = h
        .running(NewRun {
            channel_id: Some("chan".into()),
            context_id: Some("ctx".into()),
            ..new_run("r1")
        })
        .await;

    h.engine.apply(&run, &say("Working on it.")).await.unwrap();
    // Redelivery of the same iteration delivers nothing new.
    h.engine.apply(&run, &say("Working on it.")).await.unwrap();
    assert_eq!(h.queue.jobs(DELIVERY_QUEUE).len(), 1);

    let run = h.next_iteration(&run).await;
    h.engine.apply(&run, &say("working on it!")).await.unwrap();
    let blocked = h
        .store
        .get_step_by_key("r1", &step_key(1, "send_message"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(blocked.status, StepStatus::Failed);
    assert!(blocked.result_json.unwrap()["error"]
        .as_str()
        .unwrap()
        .starts_with("already_committed"));

    let run = h.next_iteration(&run).await;
    h.engine.apply(&run, &say("Here is the report.")).await.unwrap();
    assert_eq!(h.queue.jobs(DELIVERY_QUEUE).len(), 2);

    let outbound: Vec<_> = h
        .store
        .context_messages("ctx")
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.direction == MessageDirection::Outbound)
        .map(|m| m.content)
        .collect();
    assert_eq!(outbound, vec!["Working on it.", "Here is the report."]);
}

#[tokio::test]
async fn decisions_and_notes_go_to_memory() {
    let h = Harness::new().await;
    let run = h.running(new_run("r1")).await;
    h.engine
        .apply(
            &run,
            &Command::Decision {
                content: "Use the staging db".into(),
                importance: Importance::High,
            },
        )
        .await
        .unwrap();
    let run = h.next_iteration(&run).await;
    h.engine
        .apply(
            &run,
            &Command::Note {
                category: "env".into(),
                content: "staging is slow".into(),
            },
        )
        .await
        .unwrap();

    let jobs = h.queue.jobs(MEMORY_QUEUE);
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].1["kind"], "decision");
    assert_eq!(jobs[0].1["entry"]["importance"], "high");
    assert_eq!(jobs[1].1["entry"]["category"], "env");

    let steps = h.engine.list_steps("r1", 0).await.unwrap();
    assert!(steps.iter().all(|s| s.step_type == StepType::Message));
}

#[tokio::test]
async fn subscribers_see_steps_then_the_terminal_status() {
    let h = Harness::new().await;
    let run = h.running(new_run("r1")).await;
    let mut events = h.engine.subscribe("r1");

    h.engine
        .apply(
            &run,
            &Command::Finish {
                output: Some("ok".into()),
                mode: Default::default(),
            },
        )
        .await
        .unwrap();

    let mut seen = Vec::new();
    while let Some(Ok(event)) = events.next().await {
        seen.push(event);
    }
    assert!(matches!(&seen[0], StepEvent::Appended(s) if s.step_type == StepType::Finish));
    assert!(matches!(
        seen.last(),
        Some(StepEvent::Status { status, .. }) if status.is_terminal()
    ));
}
