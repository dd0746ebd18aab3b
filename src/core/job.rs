//! Job definition, runner seam, and the typed add/update option records.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;

use super::types::JobId;
use crate::triggers::Trigger;

/// Failure reported by user job code.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct RunnerError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl RunnerError {
    /// Create a failure with a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap an underlying error.
    pub fn from_source(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

/// The data handed to user code for one run.
///
/// `scheduled_run_time` is the firing this invocation covers;
/// `scheduled_run_times` is the full batch of the submission, longer than
/// one entry only when coalescing was disabled and several due firings were
/// submitted together.
#[derive(Debug, Clone)]
pub struct JobInvocation {
    pub job_id: JobId,
    pub name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub scheduled_run_time: DateTime<Utc>,
    pub scheduled_run_times: Vec<DateTime<Utc>>,
}

/// User code executed when a job fires.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Run the job once. The returned value is carried on the
    /// `JobExecuted` event.
    async fn run(&self, invocation: &JobInvocation) -> Result<Value, RunnerError>;
}

/// Adapter turning an async closure into a [`JobRunner`].
pub struct FnRunner<F> {
    f: F,
}

impl<F, Fut> FnRunner<F>
where
    F: Fn(JobInvocation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, RunnerError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> JobRunner for FnRunner<F>
where
    F: Fn(JobInvocation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, RunnerError>> + Send,
{
    async fn run(&self, invocation: &JobInvocation) -> Result<Value, RunnerError> {
        (self.f)(invocation.clone()).await
    }
}

/// Registry resolving named runner references.
///
/// Persistent stores can only rehydrate jobs whose runner is a name known
/// to the registry; direct runner values never cross a serialization
/// boundary.
#[derive(Default)]
pub struct RunnerRegistry {
    runners: RwLock<HashMap<String, Arc<dyn JobRunner>>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runner under `name`, replacing any previous entry.
    pub fn register(&self, name: impl Into<String>, runner: Arc<dyn JobRunner>) {
        self.runners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), runner);
    }

    /// Look up a runner by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn JobRunner>> {
        self.runners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }
}

/// Reference to the code a job executes.
#[derive(Clone, Serialize, Deserialize)]
pub enum RunnerRef {
    /// In-process runner value. Never crosses a serialization boundary:
    /// persisting a job holding one fails.
    #[serde(skip)]
    Direct(Arc<dyn JobRunner>),
    /// Name resolved through the scheduler's [`RunnerRegistry`].
    Named(String),
}

impl fmt::Debug for RunnerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerRef::Direct(_) => f.write_str("Direct(..)"),
            RunnerRef::Named(name) => write!(f, "Named({name:?})"),
        }
    }
}

/// Firings of one due job split by the misfire grace window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DueRunTimes {
    /// Due firings within grace, ascending.
    pub kept: Vec<DateTime<Utc>>,
    /// Due firings older than grace, ascending.
    pub missed: Vec<DateTime<Utc>>,
    /// The first candidate after `now`, `None` when the trigger is
    /// exhausted.
    pub next: Option<DateTime<Utc>>,
}

/// A scheduled job as held by a job store.
#[derive(Clone, Serialize, Deserialize)]
pub struct Job {
    id: JobId,
    name: String,
    runner: RunnerRef,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    trigger: Trigger,
    /// `None` while the job is paused or its trigger is exhausted.
    next_run_time: Option<DateTime<Utc>>,
    /// Max lateness for a firing to still run; `None` means unlimited.
    misfire_grace: Option<Duration>,
    coalesce: bool,
    max_instances: usize,
    executor_alias: String,
    store_alias: String,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("trigger", &self.trigger)
            .field("next_run_time", &self.next_run_time)
            .field("misfire_grace", &self.misfire_grace)
            .field("coalesce", &self.coalesce)
            .field("max_instances", &self.max_instances)
            .field("executor", &self.executor_alias)
            .field("store", &self.store_alias)
            .finish()
    }
}

impl Job {
    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn runner(&self) -> &RunnerRef {
        &self.runner
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.kwargs
    }

    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    pub fn next_run_time(&self) -> Option<DateTime<Utc>> {
        self.next_run_time
    }

    pub fn misfire_grace(&self) -> Option<Duration> {
        self.misfire_grace
    }

    pub fn coalesce(&self) -> bool {
        self.coalesce
    }

    pub fn max_instances(&self) -> usize {
        self.max_instances
    }

    pub fn executor_alias(&self) -> &str {
        &self.executor_alias
    }

    pub fn store_alias(&self) -> &str {
        &self.store_alias
    }

    pub(crate) fn set_next_run_time(&mut self, next: Option<DateTime<Utc>>) {
        self.next_run_time = next;
    }

    pub(crate) fn set_store_alias(&mut self, alias: impl Into<String>) {
        self.store_alias = alias.into();
    }

    /// Build the invocation payload for one firing of a submitted batch.
    pub(crate) fn invocation(
        &self,
        scheduled_run_time: DateTime<Utc>,
        scheduled_run_times: Vec<DateTime<Utc>>,
    ) -> JobInvocation {
        JobInvocation {
            job_id: self.id.clone(),
            name: self.name.clone(),
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
            scheduled_run_time,
            scheduled_run_times,
        }
    }

    /// Walk the trigger from the current `next_run_time` and classify every
    /// firing due at `now` against the misfire grace window.
    pub(crate) fn due_run_times(&self, now: DateTime<Utc>) -> DueRunTimes {
        let grace = self
            .misfire_grace
            .and_then(|g| ChronoDuration::from_std(g).ok());

        let mut kept = Vec::new();
        let mut missed = Vec::new();
        let mut candidate = self.next_run_time;

        while let Some(t) = candidate {
            if t > now {
                break;
            }
            match grace {
                Some(grace) if now - t > grace => missed.push(t),
                _ => kept.push(t),
            }
            candidate = self.trigger.next_fire_time(Some(t), now);
        }

        DueRunTimes {
            kept,
            missed,
            next: candidate,
        }
    }

    /// Apply a change-set, recomputing `next_run_time` when the trigger
    /// changed and no explicit value was supplied.
    pub(crate) fn apply_updates(&mut self, updates: JobUpdates, now: DateTime<Utc>) {
        let JobUpdates {
            name,
            args,
            kwargs,
            trigger,
            next_run_time,
            misfire_grace,
            coalesce,
            max_instances,
            executor_alias,
        } = updates;

        if let Some(name) = name {
            self.name = name;
        }
        if let Some(args) = args {
            self.args = args;
        }
        if let Some(kwargs) = kwargs {
            self.kwargs = kwargs;
        }
        let trigger_changed = trigger.is_some();
        if let Some(trigger) = trigger {
            self.trigger = trigger;
        }
        if let Some(misfire_grace) = misfire_grace {
            self.misfire_grace = misfire_grace;
        }
        if let Some(coalesce) = coalesce {
            self.coalesce = coalesce;
        }
        if let Some(max_instances) = max_instances {
            self.max_instances = max_instances.max(1);
        }
        if let Some(executor_alias) = executor_alias {
            self.executor_alias = executor_alias;
        }
        match next_run_time {
            Some(explicit) => self.next_run_time = explicit,
            None if trigger_changed => {
                self.next_run_time = self.trigger.next_fire_time(None, now);
            }
            None => {}
        }
    }
}

/// Typed change-set for `update_job`. Unset fields are left untouched.
#[derive(Debug, Default)]
pub struct JobUpdates {
    pub name: Option<String>,
    pub args: Option<Vec<Value>>,
    pub kwargs: Option<Map<String, Value>>,
    pub trigger: Option<Trigger>,
    /// `Some(None)` pauses the job; `Some(Some(t))` pins the next firing.
    pub next_run_time: Option<Option<DateTime<Utc>>>,
    pub misfire_grace: Option<Option<Duration>>,
    pub coalesce: Option<bool>,
    pub max_instances: Option<usize>,
    pub executor_alias: Option<String>,
}

impl JobUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn trigger(mut self, trigger: impl Into<Trigger>) -> Self {
        self.trigger = Some(trigger.into());
        self
    }

    pub fn next_run_time(mut self, next: Option<DateTime<Utc>>) -> Self {
        self.next_run_time = Some(next);
        self
    }

    pub fn misfire_grace(mut self, grace: Option<Duration>) -> Self {
        self.misfire_grace = Some(grace);
        self
    }

    pub fn coalesce(mut self, coalesce: bool) -> Self {
        self.coalesce = Some(coalesce);
        self
    }

    pub fn max_instances(mut self, max: usize) -> Self {
        self.max_instances = Some(max);
        self
    }

    pub fn executor(mut self, alias: impl Into<String>) -> Self {
        self.executor_alias = Some(alias.into());
        self
    }

    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = Some(args);
        self
    }

    pub fn kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = Some(kwargs);
        self
    }
}

/// Request to schedule a new job.
///
/// Options left unset fall back to the scheduler's job defaults when the
/// job is added.
pub struct JobRequest {
    pub(crate) trigger: Trigger,
    pub(crate) runner: RunnerRef,
    pub(crate) id: Option<JobId>,
    pub(crate) name: Option<String>,
    pub(crate) args: Vec<Value>,
    pub(crate) kwargs: Map<String, Value>,
    pub(crate) misfire_grace: Option<Option<Duration>>,
    pub(crate) coalesce: Option<bool>,
    pub(crate) max_instances: Option<usize>,
    pub(crate) next_run_time: Option<Option<DateTime<Utc>>>,
    pub(crate) executor_alias: String,
    pub(crate) store_alias: String,
    pub(crate) replace_existing: bool,
}

impl JobRequest {
    /// Schedule `runner` on `trigger`.
    pub fn new(trigger: impl Into<Trigger>, runner: Arc<dyn JobRunner>) -> Self {
        Self::with_runner_ref(trigger, RunnerRef::Direct(runner))
    }

    /// Schedule a registry-resolved runner on `trigger`.
    pub fn named(trigger: impl Into<Trigger>, runner_name: impl Into<String>) -> Self {
        Self::with_runner_ref(trigger, RunnerRef::Named(runner_name.into()))
    }

    /// Schedule an async closure on `trigger`.
    pub fn call<F, Fut>(trigger: impl Into<Trigger>, f: F) -> Self
    where
        F: Fn(JobInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RunnerError>> + Send + 'static,
    {
        Self::new(trigger, Arc::new(FnRunner::new(f)))
    }

    fn with_runner_ref(trigger: impl Into<Trigger>, runner: RunnerRef) -> Self {
        Self {
            trigger: trigger.into(),
            runner,
            id: None,
            name: None,
            args: Vec::new(),
            kwargs: Map::new(),
            misfire_grace: None,
            coalesce: None,
            max_instances: None,
            next_run_time: None,
            executor_alias: "default".to_string(),
            store_alias: "default".to_string(),
            replace_existing: false,
        }
    }

    /// Explicit job id; a random one is generated when omitted.
    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Human-readable label; defaults to the id.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Positional arguments passed to the runner.
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Keyword arguments passed to the runner.
    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    /// Max lateness for a firing to still run; `None` disables the limit.
    pub fn with_misfire_grace(mut self, grace: Option<Duration>) -> Self {
        self.misfire_grace = Some(grace);
        self
    }

    /// Collapse several missed firings into one run.
    pub fn with_coalesce(mut self, coalesce: bool) -> Self {
        self.coalesce = Some(coalesce);
        self
    }

    /// Cap on concurrent in-flight runs of this job.
    pub fn with_max_instances(mut self, max: usize) -> Self {
        self.max_instances = Some(max.max(1));
        self
    }

    /// Pin the first firing, overriding the trigger; `None` adds the job
    /// paused.
    pub fn with_next_run_time(mut self, next: Option<DateTime<Utc>>) -> Self {
        self.next_run_time = Some(next);
        self
    }

    /// Executor alias to run on.
    pub fn with_executor(mut self, alias: impl Into<String>) -> Self {
        self.executor_alias = alias.into();
        self
    }

    /// Store alias to persist in.
    pub fn with_store(mut self, alias: impl Into<String>) -> Self {
        self.store_alias = alias.into();
        self
    }

    /// Replace a job with the same id instead of failing.
    pub fn replace_existing(mut self, replace: bool) -> Self {
        self.replace_existing = replace;
        self
    }

    /// Materialize the job, filling unset options from `defaults`.
    pub(crate) fn into_job(self, defaults: &crate::scheduler::JobDefaults) -> Job {
        let id = self.id.unwrap_or_else(JobId::random);
        let name = self.name.unwrap_or_else(|| id.as_str().to_string());
        Job {
            id,
            name,
            runner: self.runner,
            args: self.args,
            kwargs: self.kwargs,
            trigger: self.trigger,
            next_run_time: self.next_run_time.unwrap_or(None),
            misfire_grace: self.misfire_grace.unwrap_or(defaults.misfire_grace),
            coalesce: self.coalesce.unwrap_or(defaults.coalesce),
            max_instances: self.max_instances.unwrap_or(defaults.max_instances),
            executor_alias: self.executor_alias,
            store_alias: self.store_alias,
        }
    }

    /// Whether an explicit first run time (or paused start) was requested.
    pub(crate) fn has_explicit_next_run_time(&self) -> bool {
        self.next_run_time.is_some()
    }
}
