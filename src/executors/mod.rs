//! Executors run submitted job batches with bounded parallelism.
//!
//! An executor accepts a job snapshot plus the scheduled run times of the
//! batch, enforces the per-job concurrency cap, and reports the outcome of
//! every firing through the event bus: exactly one `JobExecuted` or
//! `JobError` event per scheduled run time. User failures (errors and
//! panics) never escape an executor.

mod debug;
mod inline;
mod pool;

pub use debug::DebugExecutor;
pub use inline::InlineExecutor;
pub use pool::ThreadPoolExecutor;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{info, warn};

use crate::core::job::{Job, JobRunner, RunnerRef, RunnerRegistry};
use crate::core::types::JobId;
use crate::events::{EventBus, FailureKind, SchedulerEvent};

/// Errors raised when submitting work to an executor.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The job already has `limit` runs in flight; the scheduler converts
    /// this into a `JobMaxInstances` event and does not retry this tick.
    #[error("job {job_id} already has {limit} instances running")]
    MaxInstancesReached { job_id: JobId, limit: usize },

    /// The executor has not been started by a scheduler yet.
    #[error("executor has not been started")]
    NotStarted,
}

/// Handle to the scheduler facilities an executor needs.
#[derive(Clone)]
pub struct ExecutorContext {
    pub(crate) alias: String,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) registry: Arc<RunnerRegistry>,
}

impl ExecutorContext {
    pub(crate) fn new(alias: impl Into<String>, bus: Arc<EventBus>, registry: Arc<RunnerRegistry>) -> Self {
        Self {
            alias: alias.into(),
            bus,
            registry,
        }
    }

    /// The alias this executor was registered under.
    pub fn alias(&self) -> &str {
        &self.alias
    }
}

/// Capability of running job batches.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Called when the owning scheduler starts or the executor is added to
    /// a running scheduler.
    fn start(&self, ctx: ExecutorContext);

    /// Drain (`wait`) or abort pending work. Work already running on a
    /// blocking thread cannot be aborted.
    async fn shutdown(&self, wait: bool);

    /// Accept a run batch. Emits `JobSubmitted` on acceptance; fails with
    /// [`ExecutorError::MaxInstancesReached`] when the job's cap is hit.
    async fn submit(&self, job: &Job, run_times: Vec<DateTime<Utc>>) -> Result<(), ExecutorError>;
}

/// Per-job in-flight run counts, shared across an executor's submissions.
#[derive(Default)]
pub(crate) struct InstanceTracker {
    counts: Mutex<HashMap<JobId, usize>>,
}

impl InstanceTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reserve an instance slot, failing once `max_instances` are in
    /// flight. The slot is released when the returned guard drops.
    pub fn acquire(self: &Arc<Self>, job: &Job) -> Result<InstanceGuard, ExecutorError> {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = counts.entry(job.id().clone()).or_insert(0);
        if *count >= job.max_instances() {
            return Err(ExecutorError::MaxInstancesReached {
                job_id: job.id().clone(),
                limit: job.max_instances(),
            });
        }
        *count += 1;
        Ok(InstanceGuard {
            tracker: Arc::clone(self),
            job_id: job.id().clone(),
        })
    }

    /// In-flight runs of one job.
    #[cfg(test)]
    pub fn count(&self, id: &JobId) -> usize {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    fn release(&self, id: &JobId) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = counts.get_mut(id) {
            *count -= 1;
            if *count == 0 {
                counts.remove(id);
            }
        }
    }
}

/// RAII slot reservation; dropping it releases the instance count even when
/// the run panicked.
pub(crate) struct InstanceGuard {
    tracker: Arc<InstanceTracker>,
    job_id: JobId,
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        self.tracker.release(&self.job_id);
    }
}

/// Run one accepted batch and emit a terminal event per firing.
///
/// With `on_blocking_thread` the runner future is driven on a blocking
/// thread; otherwise each firing runs as its own task on the executor's
/// runtime. Either way a panicking runner is contained and reported as a
/// user-code failure.
pub(crate) async fn run_batch(
    job: Job,
    run_times: Vec<DateTime<Utc>>,
    ctx: ExecutorContext,
    on_blocking_thread: bool,
    _guard: InstanceGuard,
) {
    let runner: Arc<dyn JobRunner> = match job.runner() {
        RunnerRef::Direct(runner) => Arc::clone(runner),
        RunnerRef::Named(name) => match ctx.registry.get(name) {
            Some(runner) => runner,
            None => {
                warn!(job_id = %job.id(), runner = %name, "No runner registered under this name");
                for run_time in &run_times {
                    ctx.bus
                        .dispatch(SchedulerEvent::job_error(
                            job.id().clone(),
                            job.store_alias(),
                            *run_time,
                            format!("no runner registered under the name {name:?}"),
                            FailureKind::Infrastructure,
                        ))
                        .await;
                }
                return;
            }
        },
    };

    for run_time in run_times.clone() {
        let invocation = job.invocation(run_time, run_times.clone());
        info!(job_id = %job.id(), scheduled_at = %run_time, "Running job");

        let outcome = {
            let runner = Arc::clone(&runner);
            if on_blocking_thread {
                let handle = tokio::runtime::Handle::current();
                tokio::task::spawn_blocking(move || handle.block_on(runner.run(&invocation)))
                    .await
            } else {
                tokio::spawn(async move { runner.run(&invocation).await }).await
            }
        };

        let event = match outcome {
            Ok(Ok(value)) => {
                info!(job_id = %job.id(), "Job executed successfully");
                SchedulerEvent::job_executed(job.id().clone(), job.store_alias(), run_time, value)
            }
            Ok(Err(err)) => {
                warn!(job_id = %job.id(), error = %err, "Job raised an error");
                SchedulerEvent::job_error(
                    job.id().clone(),
                    job.store_alias(),
                    run_time,
                    err.to_string(),
                    FailureKind::UserCode,
                )
            }
            Err(join_err) if join_err.is_panic() => {
                warn!(job_id = %job.id(), "Job panicked");
                SchedulerEvent::job_error(
                    job.id().clone(),
                    job.store_alias(),
                    run_time,
                    "job panicked",
                    FailureKind::UserCode,
                )
            }
            Err(_) => SchedulerEvent::job_error(
                job.id().clone(),
                job.store_alias(),
                run_time,
                "job task was cancelled",
                FailureKind::Infrastructure,
            ),
        };
        ctx.bus.dispatch(event).await;
    }
}
