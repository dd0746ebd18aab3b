//! Executor driving jobs on blocking threads with a bounded worker count.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use super::{run_batch, Executor, ExecutorContext, ExecutorError, InstanceTracker};
use crate::core::job::Job;
use crate::events::SchedulerEvent;

const DEFAULT_WORKERS: usize = 10;

/// Runs each accepted batch on a blocking thread, with at most `workers`
/// batches executing at once. Runners are free to block.
///
/// `shutdown(wait = false)` aborts batches still queued for a worker slot;
/// batches already on a thread run to completion.
pub struct ThreadPoolExecutor {
    workers: usize,
    semaphore: Arc<Semaphore>,
    ctx: Mutex<Option<ExecutorContext>>,
    tracker: Arc<InstanceTracker>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for ThreadPoolExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}

impl ThreadPoolExecutor {
    /// Create a pool executing at most `workers` batches concurrently.
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            workers,
            semaphore: Arc::new(Semaphore::new(workers)),
            ctx: Mutex::new(None),
            tracker: InstanceTracker::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// The configured worker bound.
    pub fn workers(&self) -> usize {
        self.workers
    }

    fn context(&self) -> Result<ExecutorContext, ExecutorError> {
        self.ctx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ExecutorError::NotStarted)
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }
}

#[async_trait]
impl Executor for ThreadPoolExecutor {
    fn start(&self, ctx: ExecutorContext) {
        *self.ctx.lock().unwrap_or_else(PoisonError::into_inner) = Some(ctx);
    }

    async fn shutdown(&self, wait: bool) {
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
            guard.drain(..).collect()
        };
        for handle in handles {
            if wait {
                let _ = handle.await;
            } else {
                handle.abort();
            }
        }
        *self.ctx.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    async fn submit(&self, job: &Job, run_times: Vec<DateTime<Utc>>) -> Result<(), ExecutorError> {
        let ctx = self.context()?;
        let guard = self.tracker.acquire(job)?;

        ctx.bus
            .dispatch(SchedulerEvent::job_submitted(
                job.id().clone(),
                job.store_alias(),
                run_times.clone(),
            ))
            .await;

        let job = job.clone();
        let semaphore = Arc::clone(&self.semaphore);
        let handle = tokio::spawn(async move {
            // Queued until a worker slot frees up; abortable until then.
            let Ok(_permit) = semaphore.acquire().await else {
                return;
            };
            run_batch(job, run_times, ctx, true, guard).await;
        });
        self.track(handle);
        Ok(())
    }
}
