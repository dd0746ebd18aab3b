//! Executor running jobs as tasks on the scheduler's own runtime.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;

use super::{run_batch, Executor, ExecutorContext, ExecutorError, InstanceTracker};
use crate::core::job::Job;
use crate::events::SchedulerEvent;

/// Runs each accepted batch as a `tokio::spawn`ed task. The right choice
/// for async runners that do not block.
pub struct InlineExecutor {
    ctx: Mutex<Option<ExecutorContext>>,
    tracker: Arc<InstanceTracker>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for InlineExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl InlineExecutor {
    pub fn new() -> Self {
        Self {
            ctx: Mutex::new(None),
            tracker: InstanceTracker::new(),
            handles: Mutex::new(Vec::new()),
        }
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
impl Executor for InlineExecutor {
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
        let handle = tokio::spawn(run_batch(job, run_times, ctx, false, guard));
        self.track(handle);
        Ok(())
    }
}
