//! The scheduler: public API and the wake-dispatch loop.
//!
//! The loop runs as one task on the scheduler's runtime. Each tick it
//! collects the due jobs of every store in ascending next-run-time order,
//! classifies their firings against the misfire grace window, coalesces,
//! submits to the routed executor, rolls each job's next run time forward
//! (removing jobs whose trigger is exhausted), and then sleeps until the
//! earliest next run time across all stores, bounded by `tick_max`. Any
//! mutation through the public API nudges the loop awake early.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{JobDefaults, SchedulerBuilder};
use crate::core::job::{Job, JobRequest, JobUpdates, RunnerRegistry};
use crate::core::types::{JobId, ListenerId};
use crate::events::{EventBus, EventListener, SchedulerEvent};
use crate::executors::{Executor, ExecutorContext, ExecutorError, InlineExecutor};
use crate::storage::{JobStore, MemoryStore, StoreError};
use crate::triggers::Trigger;

/// Errors surfaced by the scheduler's public API.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// `start` on a scheduler that is not stopped.
    #[error("scheduler is already running")]
    AlreadyRunning,

    /// Lifecycle operation on a stopped scheduler.
    #[error("scheduler is not running")]
    NotRunning,

    /// Operation on an unknown job id.
    #[error("no job with id {0}")]
    JobNotFound(JobId),

    /// Store or executor alias already registered.
    #[error("alias {0:?} is already in use")]
    ConflictingAlias(String),

    /// No executor registered under the alias.
    #[error("no executor with alias {0:?}")]
    UnknownExecutor(String),

    /// No store registered under the alias.
    #[error("no store with alias {0:?}")]
    UnknownStore(String),

    /// Store-level failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Lifecycle state of a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Not started, or shut down. Jobs added now are queued until `start`.
    Stopped,
    /// Processing jobs.
    Running,
    /// Started but not dispatching; `resume` continues.
    Paused,
}

/// A job queued while the scheduler was stopped.
struct PendingJob {
    job: Job,
    replace_existing: bool,
    /// Compute the first run time from the trigger at flush; false when the
    /// request pinned one explicitly (or asked for a paused start).
    compute_next: bool,
}

struct SchedulerInner {
    timezone: Tz,
    tick_max: Duration,
    store_retry_interval: Duration,
    defaults: JobDefaults,
    registry: Arc<RunnerRegistry>,
    bus: Arc<EventBus>,
    state: RwLock<SchedulerState>,
    stores: RwLock<Vec<(String, Arc<dyn JobStore>)>>,
    executors: RwLock<Vec<(String, Arc<dyn Executor>)>>,
    pending: Mutex<Vec<PendingJob>>,
    wakeup: Notify,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

/// An in-process job scheduler.
///
/// Cheap to clone; all clones share the same state. The public API is safe
/// to call from any task or thread.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Build a scheduler with default configuration.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start configuring a scheduler.
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::default()
    }

    pub(crate) fn from_builder(builder: SchedulerBuilder) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                timezone: builder.timezone,
                tick_max: builder.tick_max,
                store_retry_interval: builder.store_retry_interval,
                defaults: builder.defaults,
                registry: builder.registry,
                bus: Arc::new(EventBus::new()),
                state: RwLock::new(SchedulerState::Stopped),
                stores: RwLock::new(Vec::new()),
                executors: RwLock::new(Vec::new()),
                pending: Mutex::new(Vec::new()),
                wakeup: Notify::new(),
                loop_handle: Mutex::new(None),
            }),
        }
    }

    /// The scheduler's event bus.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    /// The registry resolving named runner references.
    pub fn registry(&self) -> &Arc<RunnerRegistry> {
        &self.inner.registry
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> SchedulerState {
        *self.inner.state.read().await
    }

    /// Start the executors and stores and begin processing jobs.
    ///
    /// With `paused` the scheduler starts without dispatching until
    /// [`resume`](Scheduler::resume) is called. Installs a default
    /// [`MemoryStore`] and [`InlineExecutor`] under the `"default"` alias
    /// when none were added.
    pub async fn start(&self, paused: bool) -> Result<(), SchedulerError> {
        let inner = &self.inner;
        let mut state = inner.state.write().await;
        if *state != SchedulerState::Stopped {
            return Err(SchedulerError::AlreadyRunning);
        }

        {
            let mut executors = inner.executors.write().await;
            if !executors.iter().any(|(alias, _)| alias == "default") {
                executors.push(("default".to_string(), Arc::new(InlineExecutor::new())));
            }
        }
        {
            let mut stores = inner.stores.write().await;
            if !stores.iter().any(|(alias, _)| alias == "default") {
                stores.push(("default".to_string(), Arc::new(MemoryStore::new())));
            }
        }

        for (alias, executor) in inner.executors.read().await.iter() {
            executor.start(ExecutorContext::new(
                alias.clone(),
                Arc::clone(&inner.bus),
                Arc::clone(&inner.registry),
            ));
        }
        for (alias, store) in inner.stores.read().await.iter() {
            if let Err(err) = store.start().await {
                error!(store = %alias, error = %err, "Failed to start store");
                return Err(err.into());
            }
        }

        // Schedule everything queued while stopped.
        let pending: Vec<PendingJob> = inner.pending.lock().await.drain(..).collect();
        let mut events = Vec::new();
        for entry in pending {
            let job_id = entry.job.id().clone();
            match inner
                .real_add_job(entry.job, entry.replace_existing, entry.compute_next)
                .await
            {
                Ok(event) => events.push(event),
                Err(err) => {
                    error!(job_id = %job_id, error = %err, "Failed to schedule pending job")
                }
            }
        }

        *state = if paused {
            SchedulerState::Paused
        } else {
            SchedulerState::Running
        };
        drop(state);

        for event in events {
            inner.bus.dispatch(event).await;
        }
        inner.bus.dispatch(SchedulerEvent::scheduler_started()).await;
        info!(paused, "Scheduler started");

        let loop_inner = Arc::clone(inner);
        *inner.loop_handle.lock().await = Some(tokio::spawn(run_loop(loop_inner)));
        if !paused {
            inner.wakeup.notify_one();
        }
        Ok(())
    }

    /// Shut down the scheduler, its executors and its stores.
    ///
    /// With `wait`, drains running work; otherwise pending work is aborted
    /// where the executor supports it. Running jobs are never interrupted.
    pub async fn shutdown(&self, wait: bool) -> Result<(), SchedulerError> {
        let inner = &self.inner;
        {
            let mut state = inner.state.write().await;
            if *state == SchedulerState::Stopped {
                return Err(SchedulerError::NotRunning);
            }
            *state = SchedulerState::Stopped;
        }
        inner.wakeup.notify_one();

        for (_, executor) in inner.executors.read().await.iter() {
            executor.shutdown(wait).await;
        }
        for (_, store) in inner.stores.read().await.iter() {
            store.shutdown().await;
        }

        if let Some(handle) = inner.loop_handle.lock().await.take() {
            let _ = handle.await;
        }

        inner
            .bus
            .dispatch(SchedulerEvent::scheduler_shutdown())
            .await;
        info!("Scheduler has been shut down");
        Ok(())
    }

    /// Stop dispatching until [`resume`](Scheduler::resume). Running jobs
    /// continue.
    pub async fn pause(&self) -> Result<(), SchedulerError> {
        let inner = &self.inner;
        {
            let mut state = inner.state.write().await;
            match *state {
                SchedulerState::Stopped => return Err(SchedulerError::NotRunning),
                SchedulerState::Paused => return Ok(()),
                SchedulerState::Running => *state = SchedulerState::Paused,
            }
        }
        inner.bus.dispatch(SchedulerEvent::scheduler_paused()).await;
        info!("Paused scheduler job processing");
        inner.wakeup.notify_one();
        Ok(())
    }

    /// Resume dispatching after [`pause`](Scheduler::pause).
    pub async fn resume(&self) -> Result<(), SchedulerError> {
        let inner = &self.inner;
        {
            let mut state = inner.state.write().await;
            match *state {
                SchedulerState::Stopped => return Err(SchedulerError::NotRunning),
                SchedulerState::Running => return Ok(()),
                SchedulerState::Paused => *state = SchedulerState::Running,
            }
        }
        inner
            .bus
            .dispatch(SchedulerEvent::scheduler_resumed())
            .await;
        info!("Resumed scheduler job processing");
        inner.wakeup.notify_one();
        Ok(())
    }

    /// Schedule a job. Returns its id (generated when the request did not
    /// carry one).
    ///
    /// Legal in every state: while stopped the job is queued and scheduled
    /// at the next [`start`](Scheduler::start).
    pub async fn add_job(&self, request: JobRequest) -> Result<JobId, SchedulerError> {
        let inner = &self.inner;
        let compute_next = !request.has_explicit_next_run_time();
        let replace_existing = request.replace_existing;
        let job = request.into_job(&inner.defaults);
        let job_id = job.id().clone();

        if *inner.state.read().await == SchedulerState::Stopped {
            inner.pending.lock().await.push(PendingJob {
                job,
                replace_existing,
                compute_next,
            });
            info!(job_id = %job_id, "Job added tentatively; it will be scheduled when the scheduler starts");
            return Ok(job_id);
        }

        let event = inner
            .real_add_job(job, replace_existing, compute_next)
            .await?;
        inner.bus.dispatch(event).await;
        inner.wakeup.notify_one();
        Ok(job_id)
    }

    /// Apply a change-set to a job. Recomputes the next run time when the
    /// trigger changed without an explicit override.
    pub async fn update_job(
        &self,
        id: impl Into<JobId>,
        store: Option<&str>,
        updates: JobUpdates,
    ) -> Result<Job, SchedulerError> {
        let inner = &self.inner;
        let id = id.into();
        let now = Utc::now();
        let explicit_next = updates.next_run_time.is_some();

        let (job, alias) = if *inner.state.read().await == SchedulerState::Stopped {
            let mut pending = inner.pending.lock().await;
            let entry = pending
                .iter_mut()
                .find(|p| {
                    p.job.id() == &id
                        && store.map_or(true, |alias| p.job.store_alias() == alias)
                })
                .ok_or_else(|| SchedulerError::JobNotFound(id.clone()))?;
            entry.job.apply_updates(updates, now);
            if explicit_next {
                entry.compute_next = false;
            }
            (entry.job.clone(), entry.job.store_alias().to_string())
        } else {
            let (mut job, alias) = inner.lookup_job(&id, store).await?;
            job.apply_updates(updates, now);
            inner
                .find_store(&alias)
                .await
                .ok_or_else(|| SchedulerError::UnknownStore(alias.clone()))?
                .update_job(job.clone())
                .await?;
            (job, alias)
        };

        inner
            .bus
            .dispatch(SchedulerEvent::job_modified(id, alias))
            .await;
        inner.wakeup.notify_one();
        Ok(job)
    }

    /// Replace a job's trigger and recompute its next run time.
    pub async fn reschedule_job(
        &self,
        id: impl Into<JobId>,
        trigger: impl Into<Trigger>,
        store: Option<&str>,
    ) -> Result<Job, SchedulerError> {
        let trigger = trigger.into();
        let next = trigger.next_fire_time(None, Utc::now());
        self.update_job(
            id,
            store,
            JobUpdates::new().trigger(trigger).next_run_time(next),
        )
        .await
    }

    /// Suspend a job's firings until [`resume_job`](Scheduler::resume_job).
    pub async fn pause_job(
        &self,
        id: impl Into<JobId>,
        store: Option<&str>,
    ) -> Result<Job, SchedulerError> {
        self.update_job(id, store, JobUpdates::new().next_run_time(None))
            .await
    }

    /// Resume a paused job, recomputing its next run time; removes the job
    /// instead (returning `None`) when its trigger is exhausted.
    pub async fn resume_job(
        &self,
        id: impl Into<JobId>,
        store: Option<&str>,
    ) -> Result<Option<Job>, SchedulerError> {
        let id = id.into();
        let (job, _) = self.lookup(&id, store).await?;
        match job.trigger().next_fire_time(None, Utc::now()) {
            Some(next) => self
                .update_job(id, store, JobUpdates::new().next_run_time(Some(next)))
                .await
                .map(Some),
            None => {
                self.remove_job(id, store).await?;
                Ok(None)
            }
        }
    }

    /// Remove a job, preventing further firings. Runs already submitted
    /// are not cancelled.
    pub async fn remove_job(
        &self,
        id: impl Into<JobId>,
        store: Option<&str>,
    ) -> Result<(), SchedulerError> {
        let inner = &self.inner;
        let id = id.into();

        let alias = if *inner.state.read().await == SchedulerState::Stopped {
            let mut pending = inner.pending.lock().await;
            let index = pending
                .iter()
                .position(|p| {
                    p.job.id() == &id
                        && store.map_or(true, |alias| p.job.store_alias() == alias)
                })
                .ok_or_else(|| SchedulerError::JobNotFound(id.clone()))?;
            let entry = pending.remove(index);
            entry.job.store_alias().to_string()
        } else {
            let mut removed_from = None;
            for (alias, job_store) in inner.stores.read().await.iter() {
                if store.is_some_and(|wanted| wanted != alias) {
                    continue;
                }
                match job_store.remove_job(&id).await {
                    Ok(()) => {
                        removed_from = Some(alias.clone());
                        break;
                    }
                    Err(StoreError::JobNotFound(_)) => continue,
                    Err(err) => return Err(err.into()),
                }
            }
            removed_from.ok_or_else(|| SchedulerError::JobNotFound(id.clone()))?
        };

        inner
            .bus
            .dispatch(SchedulerEvent::job_removed(id.clone(), alias))
            .await;
        info!(job_id = %id, "Removed job");
        inner.wakeup.notify_one();
        Ok(())
    }

    /// Remove every job from one store, or from all stores.
    pub async fn remove_all_jobs(&self, store: Option<&str>) -> Result<(), SchedulerError> {
        let inner = &self.inner;
        if *inner.state.read().await == SchedulerState::Stopped {
            inner
                .pending
                .lock()
                .await
                .retain(|p| store.is_some_and(|alias| p.job.store_alias() != alias));
        } else {
            for (alias, job_store) in inner.stores.read().await.iter() {
                if store.is_some_and(|wanted| wanted != alias) {
                    continue;
                }
                job_store.remove_all_jobs().await?;
            }
        }
        inner
            .bus
            .dispatch(SchedulerEvent::AllJobsRemoved {
                alias: store.map(str::to_string),
                timestamp: Utc::now(),
            })
            .await;
        inner.wakeup.notify_one();
        Ok(())
    }

    /// Look up a job by id.
    pub async fn get_job(&self, id: impl Into<JobId>, store: Option<&str>) -> Option<Job> {
        self.lookup(&id.into(), store).await.ok().map(|(job, _)| job)
    }

    /// All jobs of one store, or of every store, ordered by next run time
    /// with paused jobs last.
    pub async fn get_jobs(&self, store: Option<&str>) -> Result<Vec<Job>, SchedulerError> {
        let inner = &self.inner;
        if *inner.state.read().await == SchedulerState::Stopped {
            let pending = inner.pending.lock().await;
            return Ok(pending
                .iter()
                .filter(|p| store.map_or(true, |alias| p.job.store_alias() == alias))
                .map(|p| p.job.clone())
                .collect());
        }

        let mut jobs = Vec::new();
        for (alias, job_store) in inner.stores.read().await.iter() {
            if store.is_some_and(|wanted| wanted != alias) {
                continue;
            }
            jobs.extend(job_store.get_all_jobs().await?);
        }
        Ok(jobs)
    }

    /// Register a job store under an alias.
    pub async fn add_store(
        &self,
        store: Arc<dyn JobStore>,
        alias: impl Into<String>,
    ) -> Result<(), SchedulerError> {
        let inner = &self.inner;
        let alias = alias.into();
        {
            let mut stores = inner.stores.write().await;
            if stores.iter().any(|(existing, _)| *existing == alias) {
                return Err(SchedulerError::ConflictingAlias(alias));
            }
            stores.push((alias.clone(), store.clone()));
        }
        if *inner.state.read().await != SchedulerState::Stopped {
            store.start().await?;
        }
        inner
            .bus
            .dispatch(SchedulerEvent::StoreAdded {
                alias,
                timestamp: Utc::now(),
            })
            .await;
        inner.wakeup.notify_one();
        Ok(())
    }

    /// Remove the store registered under `alias`.
    pub async fn remove_store(
        &self,
        alias: &str,
        shutdown: bool,
    ) -> Result<(), SchedulerError> {
        let inner = &self.inner;
        let store = {
            let mut stores = inner.stores.write().await;
            let index = stores
                .iter()
                .position(|(existing, _)| existing == alias)
                .ok_or_else(|| SchedulerError::UnknownStore(alias.to_string()))?;
            stores.remove(index).1
        };
        if shutdown {
            store.shutdown().await;
        }
        inner
            .bus
            .dispatch(SchedulerEvent::StoreRemoved {
                alias: alias.to_string(),
                timestamp: Utc::now(),
            })
            .await;
        Ok(())
    }

    /// Register an executor under an alias.
    pub async fn add_executor(
        &self,
        executor: Arc<dyn Executor>,
        alias: impl Into<String>,
    ) -> Result<(), SchedulerError> {
        let inner = &self.inner;
        let alias = alias.into();
        {
            let mut executors = inner.executors.write().await;
            if executors.iter().any(|(existing, _)| *existing == alias) {
                return Err(SchedulerError::ConflictingAlias(alias));
            }
            executors.push((alias.clone(), executor.clone()));
        }
        if *inner.state.read().await != SchedulerState::Stopped {
            executor.start(ExecutorContext::new(
                alias.clone(),
                Arc::clone(&inner.bus),
                Arc::clone(&inner.registry),
            ));
        }
        inner
            .bus
            .dispatch(SchedulerEvent::ExecutorAdded {
                alias,
                timestamp: Utc::now(),
            })
            .await;
        Ok(())
    }

    /// Remove the executor registered under `alias`.
    pub async fn remove_executor(
        &self,
        alias: &str,
        shutdown: bool,
    ) -> Result<(), SchedulerError> {
        let inner = &self.inner;
        let executor = {
            let mut executors = inner.executors.write().await;
            let index = executors
                .iter()
                .position(|(existing, _)| existing == alias)
                .ok_or_else(|| SchedulerError::UnknownExecutor(alias.to_string()))?;
            executors.remove(index).1
        };
        if shutdown {
            executor.shutdown(true).await;
        }
        inner
            .bus
            .dispatch(SchedulerEvent::ExecutorRemoved {
                alias: alias.to_string(),
                timestamp: Utc::now(),
            })
            .await;
        Ok(())
    }

    /// Register an event listener; see [`codes`](crate::events::codes) for
    /// mask values.
    pub async fn add_listener(
        &self,
        listener: Arc<dyn EventListener>,
        mask: u32,
    ) -> ListenerId {
        self.inner.bus.add_listener(listener, mask).await
    }

    /// Remove a previously registered listener.
    pub async fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.bus.remove_listener(id).await
    }

    async fn lookup(
        &self,
        id: &JobId,
        store: Option<&str>,
    ) -> Result<(Job, String), SchedulerError> {
        let inner = &self.inner;
        if *inner.state.read().await == SchedulerState::Stopped {
            let pending = inner.pending.lock().await;
            return pending
                .iter()
                .find(|p| {
                    p.job.id() == id
                        && store.map_or(true, |alias| p.job.store_alias() == alias)
                })
                .map(|p| (p.job.clone(), p.job.store_alias().to_string()))
                .ok_or_else(|| SchedulerError::JobNotFound(id.clone()));
        }
        inner.lookup_job(id, store).await
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerInner {
    async fn find_store(&self, alias: &str) -> Option<Arc<dyn JobStore>> {
        self.stores
            .read()
            .await
            .iter()
            .find(|(existing, _)| existing == alias)
            .map(|(_, store)| Arc::clone(store))
    }

    async fn find_executor(&self, alias: &str) -> Option<Arc<dyn Executor>> {
        self.executors
            .read()
            .await
            .iter()
            .find(|(existing, _)| existing == alias)
            .map(|(_, executor)| Arc::clone(executor))
    }

    async fn lookup_job(
        &self,
        id: &JobId,
        store: Option<&str>,
    ) -> Result<(Job, String), SchedulerError> {
        for (alias, job_store) in self.stores.read().await.iter() {
            if store.is_some_and(|wanted| wanted != alias) {
                continue;
            }
            if let Some(mut job) = job_store.lookup_job(id).await? {
                job.set_store_alias(alias.clone());
                return Ok((job, alias.clone()));
            }
        }
        Err(SchedulerError::JobNotFound(id.clone()))
    }

    /// Write a job into its store, computing the first run time when the
    /// request did not pin one.
    async fn real_add_job(
        &self,
        mut job: Job,
        replace_existing: bool,
        compute_next: bool,
    ) -> Result<SchedulerEvent, SchedulerError> {
        if compute_next {
            job.set_next_run_time(job.trigger().next_fire_time(None, Utc::now()));
        }
        let alias = job.store_alias().to_string();
        let store = self
            .find_store(&alias)
            .await
            .ok_or_else(|| SchedulerError::UnknownStore(alias.clone()))?;

        let job_id = job.id().clone();
        match store.add_job(job.clone()).await {
            Ok(()) => {}
            Err(StoreError::ConflictingId(_)) if replace_existing => {
                store.update_job(job).await?;
            }
            Err(err) => return Err(err.into()),
        }
        info!(job_id = %job_id, store = %alias, "Added job to store");
        Ok(SchedulerEvent::job_added(job_id, alias))
    }

    /// One dispatch pass. Returns how long to sleep before the next pass,
    /// or `None` to wait for an explicit wakeup.
    async fn process_jobs(&self) -> Option<Duration> {
        debug!("Looking for jobs to run");
        let now = Utc::now();
        let mut next_wakeup: Option<DateTime<Utc>> = None;
        let note_wakeup = |candidate: DateTime<Utc>, current: &mut Option<DateTime<Utc>>| {
            if current.map_or(true, |t| candidate < t) {
                *current = Some(candidate);
            }
        };

        let stores: Vec<(String, Arc<dyn JobStore>)> =
            self.stores.read().await.iter().cloned().collect();

        for (alias, store) in &stores {
            let due = match store.get_due_jobs(now).await {
                Ok(due) => due,
                Err(err) => {
                    warn!(store = %alias, error = %err, "Error getting due jobs from store");
                    let retry_at = now
                        + chrono::Duration::from_std(self.store_retry_interval)
                            .unwrap_or_else(|_| chrono::Duration::seconds(10));
                    note_wakeup(retry_at, &mut next_wakeup);
                    continue;
                }
            };

            for mut job in due {
                job.set_store_alias(alias.clone());
                let executor = match self.find_executor(job.executor_alias()).await {
                    Some(executor) => executor,
                    None => {
                        error!(
                            job_id = %job.id(),
                            executor = %job.executor_alias(),
                            "Executor lookup failed; removing job from its store"
                        );
                        if store.remove_job(job.id()).await.is_ok() {
                            self.bus
                                .dispatch(SchedulerEvent::job_removed(
                                    job.id().clone(),
                                    alias.clone(),
                                ))
                                .await;
                        }
                        continue;
                    }
                };

                let due_times = job.due_run_times(now);
                for missed in &due_times.missed {
                    warn!(
                        job_id = %job.id(),
                        scheduled_at = %missed,
                        "Run time was missed by more than the grace time"
                    );
                    self.bus
                        .dispatch(SchedulerEvent::job_missed(
                            job.id().clone(),
                            alias.clone(),
                            *missed,
                        ))
                        .await;
                }

                let mut run_times = due_times.kept;
                if job.coalesce() && run_times.len() > 1 {
                    run_times = vec![*run_times.last().expect("checked non-empty")];
                }

                if !run_times.is_empty() {
                    match executor.submit(&job, run_times.clone()).await {
                        Ok(()) => {}
                        Err(ExecutorError::MaxInstancesReached { limit, .. }) => {
                            warn!(
                                job_id = %job.id(),
                                limit,
                                "Execution skipped: maximum number of running instances reached"
                            );
                            self.bus
                                .dispatch(SchedulerEvent::job_max_instances(
                                    job.id().clone(),
                                    alias.clone(),
                                    run_times,
                                ))
                                .await;
                        }
                        Err(err) => {
                            error!(
                                job_id = %job.id(),
                                executor = %job.executor_alias(),
                                error = %err,
                                "Error submitting job to executor"
                            );
                        }
                    }
                }

                match due_times.next {
                    Some(next) => {
                        let mut updated = job.clone();
                        updated.set_next_run_time(Some(next));
                        if let Err(err) = store.update_job(updated).await {
                            warn!(job_id = %job.id(), error = %err, "Failed to roll job forward");
                        }
                    }
                    None => {
                        // Exhausted trigger: the job will never fire again.
                        if store.remove_job(job.id()).await.is_ok() {
                            self.bus
                                .dispatch(SchedulerEvent::job_removed(
                                    job.id().clone(),
                                    alias.clone(),
                                ))
                                .await;
                        }
                    }
                }
            }

            match store.get_next_run_time().await {
                Ok(Some(t)) => note_wakeup(t, &mut next_wakeup),
                Ok(None) => {}
                Err(err) => {
                    warn!(store = %alias, error = %err, "Error reading next run time from store");
                    let retry_at = now
                        + chrono::Duration::from_std(self.store_retry_interval)
                            .unwrap_or_else(|_| chrono::Duration::seconds(10));
                    note_wakeup(retry_at, &mut next_wakeup);
                }
            }
        }

        match next_wakeup {
            Some(t) => {
                let wait = (t - now).to_std().unwrap_or(Duration::ZERO).min(self.tick_max);
                debug!(
                    next_wakeup = %t.with_timezone(&self.timezone),
                    wait_seconds = wait.as_secs_f64(),
                    "Next wakeup scheduled"
                );
                Some(wait)
            }
            None => {
                debug!("No scheduled jobs; waiting until a job is added");
                None
            }
        }
    }
}

/// The wake-dispatch loop.
async fn run_loop(inner: Arc<SchedulerInner>) {
    loop {
        match *inner.state.read().await {
            SchedulerState::Stopped => break,
            SchedulerState::Paused => {
                debug!("Scheduler is paused; not processing jobs");
                inner.wakeup.notified().await;
                continue;
            }
            SchedulerState::Running => {}
        }

        match inner.process_jobs().await {
            Some(wait) => {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = inner.wakeup.notified() => {}
                }
            }
            None => inner.wakeup.notified().await,
        }
    }
    debug!("Scheduler loop exited");
}
