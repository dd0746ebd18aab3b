//! Lifecycle, topology and listener behavior.

use chime::events::codes;
use chime::triggers::IntervalTrigger;
use chime::{DebugExecutor, JobRequest, MemoryStore, Scheduler};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::common::{noop_runner, Recorder};

fn far_trigger() -> IntervalTrigger {
    IntervalTrigger::starting_at(
        Duration::from_secs(3600),
        Utc::now() + ChronoDuration::seconds(3600),
    )
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn lifecycle_events_in_order() {
    let scheduler = Scheduler::new();
    let recorder = Recorder::new();
    scheduler.add_listener(recorder.clone(), codes::ALL_EVENTS).await;

    scheduler.start(false).await.unwrap();
    scheduler.pause().await.unwrap();
    scheduler.resume().await.unwrap();
    scheduler.shutdown(true).await.unwrap();

    let lifecycle: Vec<u32> = recorder
        .codes()
        .await
        .into_iter()
        .filter(|c| {
            matches!(
                *c,
                codes::SCHEDULER_STARTED
                    | codes::SCHEDULER_PAUSED
                    | codes::SCHEDULER_RESUMED
                    | codes::SCHEDULER_SHUTDOWN
            )
        })
        .collect();
    assert_eq!(
        lifecycle,
        vec![
            codes::SCHEDULER_STARTED,
            codes::SCHEDULER_PAUSED,
            codes::SCHEDULER_RESUMED,
            codes::SCHEDULER_SHUTDOWN,
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn topology_events() {
    let scheduler = Scheduler::new();
    let recorder = Recorder::new();
    scheduler.add_listener(recorder.clone(), codes::ALL_EVENTS).await;

    scheduler
        .add_store(Arc::new(MemoryStore::new()), "archive")
        .await
        .unwrap();
    scheduler
        .add_executor(Arc::new(DebugExecutor::new()), "sync")
        .await
        .unwrap();
    scheduler.remove_executor("sync", true).await.unwrap();
    scheduler.remove_store("archive", true).await.unwrap();

    assert_eq!(recorder.count(codes::STORE_ADDED).await, 1);
    assert_eq!(recorder.count(codes::EXECUTOR_ADDED).await, 1);
    assert_eq!(recorder.count(codes::EXECUTOR_REMOVED).await, 1);
    assert_eq!(recorder.count(codes::STORE_REMOVED).await, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn job_topology_events() {
    let scheduler = Scheduler::new();
    let recorder = Recorder::new();
    scheduler.add_listener(recorder.clone(), codes::ALL_EVENTS).await;
    scheduler.start(false).await.unwrap();

    scheduler
        .add_job(JobRequest::new(far_trigger(), noop_runner()).with_id("tracked"))
        .await
        .unwrap();
    scheduler.pause_job("tracked", None).await.unwrap();
    scheduler.remove_job("tracked", None).await.unwrap();
    scheduler.remove_all_jobs(None).await.unwrap();

    assert_eq!(recorder.count(codes::JOB_ADDED).await, 1);
    assert_eq!(recorder.count(codes::JOB_MODIFIED).await, 1);
    assert_eq!(recorder.count(codes::JOB_REMOVED).await, 1);
    assert_eq!(recorder.count(codes::ALL_JOBS_REMOVED).await, 1);

    scheduler.shutdown(true).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn listener_mask_limits_delivery() {
    let scheduler = Scheduler::new();
    let all = Recorder::new();
    let only_jobs = Recorder::new();
    scheduler.add_listener(all.clone(), codes::ALL_EVENTS).await;
    scheduler
        .add_listener(only_jobs.clone(), codes::JOB_ADDED | codes::JOB_REMOVED)
        .await;

    scheduler.start(false).await.unwrap();
    scheduler
        .add_job(JobRequest::new(far_trigger(), noop_runner()).with_id("masked"))
        .await
        .unwrap();
    scheduler.remove_job("masked", None).await.unwrap();
    scheduler.shutdown(true).await.unwrap();

    assert!(all.count(codes::SCHEDULER_STARTED).await == 1);
    assert_eq!(only_jobs.count(codes::SCHEDULER_STARTED).await, 0);
    assert_eq!(only_jobs.count(codes::SCHEDULER_SHUTDOWN).await, 0);
    assert_eq!(only_jobs.count(codes::JOB_ADDED).await, 1);
    assert_eq!(only_jobs.count(codes::JOB_REMOVED).await, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn removed_listener_stops_receiving() {
    let scheduler = Scheduler::new();
    let recorder = Recorder::new();
    let id = scheduler
        .add_listener(recorder.clone(), codes::ALL_EVENTS)
        .await;

    scheduler.start(false).await.unwrap();
    assert!(scheduler.remove_listener(id).await);
    scheduler.shutdown(true).await.unwrap();

    assert_eq!(recorder.count(codes::SCHEDULER_SHUTDOWN).await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn paused_scheduler_does_not_dispatch() {
    let scheduler = Scheduler::new();
    let recorder = Recorder::new();
    scheduler.add_listener(recorder.clone(), codes::ALL_EVENTS).await;
    scheduler.start(true).await.unwrap();

    let due_now = IntervalTrigger::starting_at(Duration::from_millis(50), Utc::now()).unwrap();
    scheduler
        .add_job(
            JobRequest::new(due_now, noop_runner())
                .with_id("held")
                .with_misfire_grace(None),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(recorder.count(codes::JOB_SUBMITTED).await, 0);

    scheduler.resume().await.unwrap();
    assert!(
        recorder
            .wait_for(codes::JOB_SUBMITTED, 1, Duration::from_secs(3))
            .await
    );

    scheduler.shutdown(true).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_flushes_jobs_added_after_shutdown() {
    let scheduler = Scheduler::new();
    scheduler.start(false).await.unwrap();
    scheduler.shutdown(true).await.unwrap();

    // Accepted while stopped, scheduled on the next start.
    scheduler
        .add_job(JobRequest::new(far_trigger(), noop_runner()).with_id("afterlife"))
        .await
        .unwrap();
    scheduler.start(false).await.unwrap();

    let job = scheduler.get_job("afterlife", None).await.unwrap();
    assert!(job.next_run_time().is_some());

    scheduler.shutdown(true).await.unwrap();
}
