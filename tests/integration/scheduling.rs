//! End-to-end trigger rollover scenarios.

use chime::events::codes;
use chime::triggers::{DateTrigger, IntervalTrigger, OrTrigger, Trigger};
use chime::{JobRequest, Scheduler};
use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;

use crate::common::{noop_runner, Recorder};

#[tokio::test(flavor = "multi_thread")]
async fn interval_job_fires_repeatedly_and_rolls_forward() {
    let scheduler = Scheduler::new();
    let recorder = Recorder::new();
    scheduler.add_listener(recorder.clone(), codes::ALL_EVENTS).await;
    scheduler.start(false).await.unwrap();

    let start = Utc::now();
    let trigger = IntervalTrigger::starting_at(Duration::from_millis(100), start).unwrap();
    scheduler
        .add_job(
            JobRequest::new(trigger, noop_runner())
                .with_id("ticker")
                .with_misfire_grace(None),
        )
        .await
        .unwrap();

    assert!(
        recorder
            .wait_for(codes::JOB_EXECUTED, 3, Duration::from_secs(3))
            .await,
        "expected at least three executions"
    );

    // The job is still scheduled, with its next fire on the grid ahead of
    // now.
    let job = scheduler.get_job("ticker", None).await.unwrap();
    let next = job.next_run_time().unwrap();
    assert!(next > start);
    let since_start = next - start;
    assert_eq!(since_start.num_milliseconds() % 100, 0);

    scheduler.shutdown(true).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn date_job_fires_once_and_is_removed() {
    let scheduler = Scheduler::new();
    let recorder = Recorder::new();
    scheduler.add_listener(recorder.clone(), codes::ALL_EVENTS).await;
    scheduler.start(false).await.unwrap();

    let run_at = Utc::now() + ChronoDuration::milliseconds(150);
    scheduler
        .add_job(
            JobRequest::new(DateTrigger::at(run_at), noop_runner()).with_id("once"),
        )
        .await
        .unwrap();

    assert!(
        recorder
            .wait_for(codes::JOB_EXECUTED, 1, Duration::from_secs(3))
            .await
    );
    assert!(
        recorder
            .wait_for(codes::JOB_REMOVED, 1, Duration::from_secs(3))
            .await,
        "exhausted job should be removed from its store"
    );

    // Give a potential second firing time to happen, then check it didn't.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(recorder.count(codes::JOB_EXECUTED).await, 1);
    assert!(scheduler.get_job("once", None).await.is_none());

    scheduler.shutdown(true).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn or_trigger_fires_date_branch_then_interval_branch() {
    let scheduler = Scheduler::new();
    let recorder = Recorder::new();
    scheduler.add_listener(recorder.clone(), codes::ALL_EVENTS).await;
    scheduler.start(false).await.unwrap();

    let now = Utc::now();
    let interval_start = now + ChronoDuration::seconds(60);
    let or = OrTrigger::new(vec![
        Trigger::from(
            IntervalTrigger::starting_at(Duration::from_secs(60), interval_start).unwrap(),
        ),
        Trigger::from(DateTrigger::at(now + ChronoDuration::milliseconds(100))),
    ])
    .unwrap();

    scheduler
        .add_job(JobRequest::new(or, noop_runner()).with_id("either"))
        .await
        .unwrap();

    assert!(
        recorder
            .wait_for(codes::JOB_EXECUTED, 1, Duration::from_secs(3))
            .await
    );

    // After the date branch fired, the interval branch keeps the job alive.
    let job = scheduler.get_job("either", None).await.unwrap();
    assert_eq!(job.next_run_time(), Some(interval_start));

    scheduler.shutdown(true).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn modifying_a_job_wakes_the_loop() {
    let scheduler = Scheduler::new();
    let recorder = Recorder::new();
    scheduler.add_listener(recorder.clone(), codes::ALL_EVENTS).await;
    scheduler.start(false).await.unwrap();

    // Far in the future: the loop settles into a long sleep.
    let far = Utc::now() + ChronoDuration::seconds(3600);
    scheduler
        .add_job(JobRequest::new(DateTrigger::at(far), noop_runner()).with_id("moved"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Rescheduling to (nearly) now must cut the sleep short.
    let soon = Utc::now() + ChronoDuration::milliseconds(100);
    scheduler
        .reschedule_job("moved", DateTrigger::at(soon), None)
        .await
        .unwrap();

    assert!(
        recorder
            .wait_for(codes::JOB_EXECUTED, 1, Duration::from_secs(3))
            .await,
        "rescheduled job should run without waiting for the old deadline"
    );

    scheduler.shutdown(true).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn paused_job_does_not_fire() {
    let scheduler = Scheduler::new();
    let recorder = Recorder::new();
    scheduler.add_listener(recorder.clone(), codes::ALL_EVENTS).await;
    scheduler.start(false).await.unwrap();

    let trigger = IntervalTrigger::starting_at(Duration::from_millis(50), Utc::now()).unwrap();
    scheduler
        .add_job(
            JobRequest::new(trigger, noop_runner())
                .with_id("dormant")
                .with_next_run_time(None),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(recorder.count(codes::JOB_EXECUTED).await, 0);

    // Resuming recomputes the next run time and firing begins.
    scheduler.resume_job("dormant", None).await.unwrap();
    assert!(
        recorder
            .wait_for(codes::JOB_EXECUTED, 1, Duration::from_secs(3))
            .await
    );

    scheduler.shutdown(true).await.unwrap();
}
