//! Misfire grace and coalescing behavior.

use chime::events::codes;
use chime::triggers::IntervalTrigger;
use chime::{JobRequest, Scheduler, SchedulerEvent};
use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;

use crate::common::{noop_runner, Recorder};

/// A job that "slept" through ten firings: the ones older than grace are
/// reported missed, the rest coalesce into a single run at the latest
/// missed instant.
#[tokio::test(flavor = "multi_thread")]
async fn missed_firings_are_reported_and_coalesced() {
    let scheduler = Scheduler::new();
    let recorder = Recorder::new();
    scheduler.add_listener(recorder.clone(), codes::ALL_EVENTS).await;
    scheduler.start(false).await.unwrap();

    let behind = Utc::now() - ChronoDuration::seconds(10);
    let trigger = IntervalTrigger::starting_at(Duration::from_secs(1), behind).unwrap();
    scheduler
        .add_job(
            JobRequest::new(trigger, noop_runner())
                .with_id("sleeper")
                .with_misfire_grace(Some(Duration::from_secs(5)))
                .with_coalesce(true)
                .with_next_run_time(Some(behind)),
        )
        .await
        .unwrap();

    assert!(
        recorder
            .wait_for(codes::JOB_EXECUTED, 1, Duration::from_secs(3))
            .await
    );

    let events = recorder.events().await;

    // Firings more than five seconds stale were dropped as missed.
    let missed = events
        .iter()
        .filter(|e| e.code() == codes::JOB_MISSED)
        .count();
    assert!((4..=6).contains(&missed), "missed {missed} firings");

    // The rest collapsed into one submission with a single scheduled time.
    let first_submission = events
        .iter()
        .find_map(|e| match e {
            SchedulerEvent::JobSubmitted {
                scheduled_run_times,
                ..
            } => Some(scheduled_run_times.clone()),
            _ => None,
        })
        .expect("a submission event");
    assert_eq!(first_submission.len(), 1);

    // Every missed firing was reported before that submission.
    let first_submitted_index = events
        .iter()
        .position(|e| e.code() == codes::JOB_SUBMITTED)
        .unwrap();
    let last_missed_index = events
        .iter()
        .rposition(|e| e.code() == codes::JOB_MISSED)
        .unwrap();
    assert!(last_missed_index < first_submitted_index);

    scheduler.shutdown(true).await.unwrap();
}

/// Without coalescing, every kept firing is submitted in one batch and the
/// executor reports each of them.
#[tokio::test(flavor = "multi_thread")]
async fn uncoalesced_batch_reports_every_firing() {
    let scheduler = Scheduler::new();
    let recorder = Recorder::new();
    scheduler.add_listener(recorder.clone(), codes::ALL_EVENTS).await;
    scheduler.start(false).await.unwrap();

    let behind = Utc::now() - ChronoDuration::seconds(3);
    let trigger = IntervalTrigger::starting_at(Duration::from_secs(1), behind).unwrap();
    scheduler
        .add_job(
            JobRequest::new(trigger, noop_runner())
                .with_id("backlog")
                .with_misfire_grace(None)
                .with_coalesce(false)
                .with_next_run_time(Some(behind)),
        )
        .await
        .unwrap();

    // The first submission covers the whole backlog.
    assert!(
        recorder
            .wait_for(codes::JOB_SUBMITTED, 1, Duration::from_secs(3))
            .await
    );
    let batch = recorder
        .events()
        .await
        .iter()
        .find_map(|e| match e {
            SchedulerEvent::JobSubmitted {
                scheduled_run_times,
                ..
            } => Some(scheduled_run_times.len()),
            _ => None,
        })
        .unwrap();
    assert!(batch >= 3, "expected a backlog batch, got {batch}");

    // One terminal event per firing in the batch.
    assert!(
        recorder
            .wait_for(codes::JOB_EXECUTED, batch, Duration::from_secs(3))
            .await
    );
    assert_eq!(recorder.count(codes::JOB_MISSED).await, 0);

    scheduler.shutdown(true).await.unwrap();
}

/// A firing within grace runs even though it is late.
#[tokio::test(flavor = "multi_thread")]
async fn late_firing_within_grace_still_runs() {
    let scheduler = Scheduler::new();
    let recorder = Recorder::new();
    scheduler.add_listener(recorder.clone(), codes::ALL_EVENTS).await;
    scheduler.start(false).await.unwrap();

    let slightly_behind = Utc::now() - ChronoDuration::seconds(2);
    let trigger =
        IntervalTrigger::starting_at(Duration::from_secs(3600), slightly_behind).unwrap();
    scheduler
        .add_job(
            JobRequest::new(trigger, noop_runner())
                .with_id("late")
                .with_misfire_grace(Some(Duration::from_secs(30)))
                .with_next_run_time(Some(slightly_behind)),
        )
        .await
        .unwrap();

    assert!(
        recorder
            .wait_for(codes::JOB_EXECUTED, 1, Duration::from_secs(3))
            .await
    );
    assert_eq!(recorder.count(codes::JOB_MISSED).await, 0);

    scheduler.shutdown(true).await.unwrap();
}
