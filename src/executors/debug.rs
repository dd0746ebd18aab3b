//! Executor running jobs inline inside `submit`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, PoisonError};

use super::{run_batch, Executor, ExecutorContext, ExecutorError, InstanceTracker};
use crate::core::job::Job;
use crate::events::SchedulerEvent;
use std::sync::Arc;

/// Runs the whole batch before `submit` returns, blocking the scheduler
/// tick. Deterministic ordering makes it the executor of choice in tests.
pub struct DebugExecutor {
    ctx: Mutex<Option<ExecutorContext>>,
    tracker: Arc<InstanceTracker>,
}

impl Default for DebugExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl DebugExecutor {
    pub fn new() -> Self {
        Self {
            ctx: Mutex::new(None),
            tracker: InstanceTracker::new(),
        }
    }

    fn context(&self) -> Result<ExecutorContext, ExecutorError> {
        self.ctx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ExecutorError::NotStarted)
    }
}

#[async_trait]
impl Executor for DebugExecutor {
    fn start(&self, ctx: ExecutorContext) {
        *self.ctx.lock().unwrap_or_else(PoisonError::into_inner) = Some(ctx);
    }

    async fn shutdown(&self, _wait: bool) {
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

        run_batch(job.clone(), run_times, ctx, false, guard).await;
        Ok(())
    }
}
