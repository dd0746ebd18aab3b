//! Per-job concurrency cap under a fast trigger and a slow runner.

use chime::events::codes;
use chime::triggers::IntervalTrigger;
use chime::{FnRunner, JobRequest, Scheduler};
use chrono::Utc;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::common::Recorder;

#[tokio::test(flavor = "multi_thread")]
async fn max_instances_bounds_concurrent_runs() {
    let scheduler = Scheduler::new();
    let recorder = Recorder::new();
    scheduler.add_listener(recorder.clone(), codes::ALL_EVENTS).await;
    scheduler.start(false).await.unwrap();

    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let runner = {
        let in_flight = Arc::clone(&in_flight);
        let peak = Arc::clone(&peak);
        Arc::new(FnRunner::new(move |_inv| {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            async move {
                let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(2)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        }))
    };

    let trigger = IntervalTrigger::starting_at(Duration::from_millis(100), Utc::now()).unwrap();
    scheduler
        .add_job(
            JobRequest::new(trigger, runner)
                .with_id("crowded")
                .with_max_instances(2)
                .with_coalesce(false)
                .with_misfire_grace(None),
        )
        .await
        .unwrap();

    // Both slots fill, then further ticks bounce off the cap.
    assert!(
        recorder
            .wait_for(codes::JOB_SUBMITTED, 2, Duration::from_secs(3))
            .await
    );
    assert!(
        recorder
            .wait_for(codes::JOB_MAX_INSTANCES, 2, Duration::from_secs(3))
            .await,
        "further ticks should be skipped while both slots are busy"
    );

    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert_eq!(recorder.count(codes::JOB_SUBMITTED).await, 2);

    scheduler.shutdown(false).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn independent_jobs_do_not_share_the_cap() {
    let scheduler = Scheduler::new();
    let recorder = Recorder::new();
    scheduler.add_listener(recorder.clone(), codes::ALL_EVENTS).await;
    scheduler.start(false).await.unwrap();

    let busy_runner = Arc::new(FnRunner::new(|_inv| async {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(Value::Null)
    }));

    for id in ["first", "second"] {
        let trigger =
            IntervalTrigger::starting_at(Duration::from_millis(100), Utc::now()).unwrap();
        scheduler
            .add_job(
                JobRequest::new(trigger, busy_runner.clone())
                    .with_id(id)
                    .with_max_instances(1)
                    .with_misfire_grace(None),
            )
            .await
            .unwrap();
    }

    // One slot per job: both jobs get submitted despite each being capped
    // at a single instance.
    assert!(
        recorder
            .wait_for(codes::JOB_SUBMITTED, 2, Duration::from_secs(3))
            .await
    );
    let submitted: Vec<String> = recorder
        .events()
        .await
        .iter()
        .filter(|e| e.code() == codes::JOB_SUBMITTED)
        .filter_map(|e| e.job_id().map(|id| id.as_str().to_string()))
        .collect();
    assert!(submitted.contains(&"first".to_string()));
    assert!(submitted.contains(&"second".to_string()));

    scheduler.shutdown(false).await.unwrap();
}
