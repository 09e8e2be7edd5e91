use std::time::Duration;

use chrono::Utc;

use super::{Harness, new_run};
use crate::core::command::Command;
use crate::core::runs::{ApplyOutcome, RunSettings, RunStatus, StepStatus, WakeReason, step_key};

fn sleep_for(secs: u64) -> Command {
    Command::Sleep {
        reason: Some("wait for the build".into()),
        wake_at: None,
        delay_seconds: Some(secs),
        cron: None,
    }
}

#[tokio::test]
async fn sleepers_wake_only_when_due() {
    let h = Harness::new().await;
    let run = h.running(new_run("r1")).await;
    let outcome = h.engine.apply(&run, &sleep_for(600)).await.unwrap();
    assert_eq!(outcome, ApplyOutcome::Parked(WakeReason::Sleep));

    let parked = h.store.require_run("r1").await.unwrap();
    assert_eq!(parked.status, RunStatus::Waiting);
    let wake_at = parked.wake_at.unwrap();

    assert_eq!(h.engine.wake_due_sleepers(Utc::now()).await.unwrap(), 0);
    let later = wake_at + chrono::Duration::seconds(1);
    assert_eq!(h.engine.wake_due_sleepers(later).await.unwrap(), 1);
    assert_eq!(h.engine.wake_due_sleepers(later).await.unwrap(), 0);

    let woken = h.store.require_run("r1").await.unwrap();
    assert_eq!(woken.status, RunStatus::Pending);
    assert_eq!(woken.wake_at, None);
    assert!(h.run_jobs().contains(&"wake:r1:1".to_string()));
}

#[tokio::test]
async fn cron_sleep_resolves_the_next_fire_time() {
    let h = Harness::new().await;
    let run = h.running(new_run("r1")).await;
    h.engine
        .apply(
            &run,
            &Command::Sleep {
                reason: None,
                wake_at: None,
                delay_seconds: None,
                cron: Some("0 9 * * *".into()),
            },
        )
        .await
        .unwrap();
    let parked = h.store.require_run("r1").await.unwrap();
    let wake_at = parked.wake_at.unwrap();
    assert!(wake_at > Utc::now());
    assert_eq!(wake_at.format("%H:%M:%S").to_string(), "09:00:00");
}

#[tokio::test]
async fn unresolvable_sleep_is_recorded_and_skipped() {
    let h = Harness::new().await;
    let run = h.running(new_run("r1")).await;
    let outcome = h
        .engine
        .apply(
            &run,
            &Command::Sleep {
                reason: None,
                wake_at: None,
                delay_seconds: None,
                cron: Some("not a cron".into()),
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome, ApplyOutcome::Continue);
    let step = h
        .store
        .get_step_by_key("r1", &step_key(0, "sleep"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(h.store.require_run("r1").await.unwrap().status, RunStatus::Running);
}

#[tokio::test]
async fn stale_running_runs_are_requeued() {
    let h = Harness::with_settings(RunSettings {
        stale_after: Duration::from_secs(60),
        ..RunSettings::default()
    })
    .await;
    h.running(new_run("r1")).await;

    assert_eq!(h.engine.recover_stale(Utc::now()).await.unwrap(), 0);
    let later = Utc::now() + chrono::Duration::minutes(10);
    assert_eq!(h.engine.recover_stale(later).await.unwrap(), 1);

    let run = h.store.require_run("r1").await.unwrap();
    assert_eq!(run.status, RunStatus::Pending);
    assert_eq!(run.wake_reason, Some(WakeReason::Recovered));
    // Same iteration: the replay reuses recorded steps.
    assert_eq!(run.iteration, 0);
    assert!(h.run_jobs().contains(&"recover:r1:0".to_string()));
}
