//! Lifecycle events and the listener bus.
//!
//! Every event carries a bitmask code; listeners register with a mask and
//! only see matching events. Dispatch is synchronous on the emitting task,
//! in listener registration order — a slow listener delays later ones but
//! can never abort delivery to them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::core::types::{JobId, ListenerId};

/// Event codes, one bit each so listener masks compose with `|`.
pub mod codes {
    pub const SCHEDULER_STARTED: u32 = 1 << 0;
    pub const SCHEDULER_SHUTDOWN: u32 = 1 << 1;
    pub const SCHEDULER_PAUSED: u32 = 1 << 2;
    pub const SCHEDULER_RESUMED: u32 = 1 << 3;
    pub const EXECUTOR_ADDED: u32 = 1 << 4;
    pub const EXECUTOR_REMOVED: u32 = 1 << 5;
    pub const STORE_ADDED: u32 = 1 << 6;
    pub const STORE_REMOVED: u32 = 1 << 7;
    pub const ALL_JOBS_REMOVED: u32 = 1 << 8;
    pub const JOB_ADDED: u32 = 1 << 9;
    pub const JOB_REMOVED: u32 = 1 << 10;
    pub const JOB_MODIFIED: u32 = 1 << 11;
    pub const JOB_EXECUTED: u32 = 1 << 12;
    pub const JOB_ERROR: u32 = 1 << 13;
    pub const JOB_MISSED: u32 = 1 << 14;
    pub const JOB_SUBMITTED: u32 = 1 << 15;
    pub const JOB_MAX_INSTANCES: u32 = 1 << 16;

    /// Every event.
    pub const ALL_EVENTS: u32 = (1 << 17) - 1;
}

/// Distinguishes how a job run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The job's own code returned an error or panicked.
    UserCode,
    /// The run could not be carried out at all (e.g. the named runner is
    /// not registered).
    Infrastructure,
}

/// A scheduler lifecycle event. Events are observations; they never mutate
/// state.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    SchedulerStarted {
        timestamp: DateTime<Utc>,
    },
    SchedulerShutdown {
        timestamp: DateTime<Utc>,
    },
    SchedulerPaused {
        timestamp: DateTime<Utc>,
    },
    SchedulerResumed {
        timestamp: DateTime<Utc>,
    },
    ExecutorAdded {
        alias: String,
        timestamp: DateTime<Utc>,
    },
    ExecutorRemoved {
        alias: String,
        timestamp: DateTime<Utc>,
    },
    StoreAdded {
        alias: String,
        timestamp: DateTime<Utc>,
    },
    StoreRemoved {
        alias: String,
        timestamp: DateTime<Utc>,
    },
    /// Bulk removal; `alias` is `None` when every store was cleared.
    AllJobsRemoved {
        alias: Option<String>,
        timestamp: DateTime<Utc>,
    },
    JobAdded {
        job_id: JobId,
        store_alias: String,
        timestamp: DateTime<Utc>,
    },
    JobRemoved {
        job_id: JobId,
        store_alias: String,
        timestamp: DateTime<Utc>,
    },
    JobModified {
        job_id: JobId,
        store_alias: String,
        timestamp: DateTime<Utc>,
    },
    /// A run batch was accepted by an executor.
    JobSubmitted {
        job_id: JobId,
        store_alias: String,
        scheduled_run_times: Vec<DateTime<Utc>>,
        timestamp: DateTime<Utc>,
    },
    /// A run batch was skipped because the concurrency cap was reached.
    JobMaxInstances {
        job_id: JobId,
        store_alias: String,
        scheduled_run_times: Vec<DateTime<Utc>>,
        timestamp: DateTime<Utc>,
    },
    /// One firing completed successfully.
    JobExecuted {
        job_id: JobId,
        store_alias: String,
        scheduled_run_time: DateTime<Utc>,
        return_value: Value,
        timestamp: DateTime<Utc>,
    },
    /// One firing failed.
    JobError {
        job_id: JobId,
        store_alias: String,
        scheduled_run_time: DateTime<Utc>,
        error: String,
        kind: FailureKind,
        timestamp: DateTime<Utc>,
    },
    /// One firing was dropped for exceeding the misfire grace window.
    JobMissed {
        job_id: JobId,
        store_alias: String,
        scheduled_run_time: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
}

impl SchedulerEvent {
    /// The event's bitmask code.
    pub fn code(&self) -> u32 {
        match self {
            SchedulerEvent::SchedulerStarted { .. } => codes::SCHEDULER_STARTED,
            SchedulerEvent::SchedulerShutdown { .. } => codes::SCHEDULER_SHUTDOWN,
            SchedulerEvent::SchedulerPaused { .. } => codes::SCHEDULER_PAUSED,
            SchedulerEvent::SchedulerResumed { .. } => codes::SCHEDULER_RESUMED,
            SchedulerEvent::ExecutorAdded { .. } => codes::EXECUTOR_ADDED,
            SchedulerEvent::ExecutorRemoved { .. } => codes::EXECUTOR_REMOVED,
            SchedulerEvent::StoreAdded { .. } => codes::STORE_ADDED,
            SchedulerEvent::StoreRemoved { .. } => codes::STORE_REMOVED,
            SchedulerEvent::AllJobsRemoved { .. } => codes::ALL_JOBS_REMOVED,
            SchedulerEvent::JobAdded { .. } => codes::JOB_ADDED,
            SchedulerEvent::JobRemoved { .. } => codes::JOB_REMOVED,
            SchedulerEvent::JobModified { .. } => codes::JOB_MODIFIED,
            SchedulerEvent::JobSubmitted { .. } => codes::JOB_SUBMITTED,
            SchedulerEvent::JobMaxInstances { .. } => codes::JOB_MAX_INSTANCES,
            SchedulerEvent::JobExecuted { .. } => codes::JOB_EXECUTED,
            SchedulerEvent::JobError { .. } => codes::JOB_ERROR,
            SchedulerEvent::JobMissed { .. } => codes::JOB_MISSED,
        }
    }

    /// When the event was created.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            SchedulerEvent::SchedulerStarted { timestamp }
            | SchedulerEvent::SchedulerShutdown { timestamp }
            | SchedulerEvent::SchedulerPaused { timestamp }
            | SchedulerEvent::SchedulerResumed { timestamp }
            | SchedulerEvent::ExecutorAdded { timestamp, .. }
            | SchedulerEvent::ExecutorRemoved { timestamp, .. }
            | SchedulerEvent::StoreAdded { timestamp, .. }
            | SchedulerEvent::StoreRemoved { timestamp, .. }
            | SchedulerEvent::AllJobsRemoved { timestamp, .. }
            | SchedulerEvent::JobAdded { timestamp, .. }
            | SchedulerEvent::JobRemoved { timestamp, .. }
            | SchedulerEvent::JobModified { timestamp, .. }
            | SchedulerEvent::JobSubmitted { timestamp, .. }
            | SchedulerEvent::JobMaxInstances { timestamp, .. }
            | SchedulerEvent::JobExecuted { timestamp, .. }
            | SchedulerEvent::JobError { timestamp, .. }
            | SchedulerEvent::JobMissed { timestamp, .. } => *timestamp,
        }
    }

    /// The id of the job the event concerns, when it concerns one.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            SchedulerEvent::JobAdded { job_id, .. }
            | SchedulerEvent::JobRemoved { job_id, .. }
            | SchedulerEvent::JobModified { job_id, .. }
            | SchedulerEvent::JobSubmitted { job_id, .. }
            | SchedulerEvent::JobMaxInstances { job_id, .. }
            | SchedulerEvent::JobExecuted { job_id, .. }
            | SchedulerEvent::JobError { job_id, .. }
            | SchedulerEvent::JobMissed { job_id, .. } => Some(job_id),
            _ => None,
        }
    }

    pub fn scheduler_started() -> Self {
        SchedulerEvent::SchedulerStarted {
            timestamp: Utc::now(),
        }
    }

    pub fn scheduler_shutdown() -> Self {
        SchedulerEvent::SchedulerShutdown {
            timestamp: Utc::now(),
        }
    }

    pub fn scheduler_paused() -> Self {
        SchedulerEvent::SchedulerPaused {
            timestamp: Utc::now(),
        }
    }

    pub fn scheduler_resumed() -> Self {
        SchedulerEvent::SchedulerResumed {
            timestamp: Utc::now(),
        }
    }

    pub fn job_added(job_id: JobId, store_alias: impl Into<String>) -> Self {
        SchedulerEvent::JobAdded {
            job_id,
            store_alias: store_alias.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn job_removed(job_id: JobId, store_alias: impl Into<String>) -> Self {
        SchedulerEvent::JobRemoved {
            job_id,
            store_alias: store_alias.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn job_modified(job_id: JobId, store_alias: impl Into<String>) -> Self {
        SchedulerEvent::JobModified {
            job_id,
            store_alias: store_alias.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn job_submitted(
        job_id: JobId,
        store_alias: impl Into<String>,
        scheduled_run_times: Vec<DateTime<Utc>>,
    ) -> Self {
        SchedulerEvent::JobSubmitted {
            job_id,
            store_alias: store_alias.into(),
            scheduled_run_times,
            timestamp: Utc::now(),
        }
    }

    pub fn job_max_instances(
        job_id: JobId,
        store_alias: impl Into<String>,
        scheduled_run_times: Vec<DateTime<Utc>>,
    ) -> Self {
        SchedulerEvent::JobMaxInstances {
            job_id,
            store_alias: store_alias.into(),
            scheduled_run_times,
            timestamp: Utc::now(),
        }
    }

    pub fn job_executed(
        job_id: JobId,
        store_alias: impl Into<String>,
        scheduled_run_time: DateTime<Utc>,
        return_value: Value,
    ) -> Self {
        SchedulerEvent::JobExecuted {
            job_id,
            store_alias: store_alias.into(),
            scheduled_run_time,
            return_value,
            timestamp: Utc::now(),
        }
    }

    pub fn job_error(
        job_id: JobId,
        store_alias: impl Into<String>,
        scheduled_run_time: DateTime<Utc>,
        error: impl Into<String>,
        kind: FailureKind,
    ) -> Self {
        SchedulerEvent::JobError {
            job_id,
            store_alias: store_alias.into(),
            scheduled_run_time,
            error: error.into(),
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn job_missed(
        job_id: JobId,
        store_alias: impl Into<String>,
        scheduled_run_time: DateTime<Utc>,
    ) -> Self {
        SchedulerEvent::JobMissed {
            job_id,
            store_alias: store_alias.into(),
            scheduled_run_time,
            timestamp: Utc::now(),
        }
    }
}

/// Receiver of scheduler events.
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: &SchedulerEvent);
}

type BoxedCallback =
    Box<dyn Fn(SchedulerEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct CallbackListener {
    callback: BoxedCallback,
}

#[async_trait]
impl EventListener for CallbackListener {
    async fn on_event(&self, event: &SchedulerEvent) {
        (self.callback)(event.clone()).await;
    }
}

struct Registration {
    id: ListenerId,
    mask: u32,
    listener: Arc<dyn EventListener>,
}

/// Fan-out of events to registered listeners.
pub struct EventBus {
    listeners: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create a bus with no listeners.
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a listener for events matching `mask`
    /// (see [`codes`]). Returns a token for [`remove_listener`].
    ///
    /// [`remove_listener`]: EventBus::remove_listener
    pub async fn add_listener(&self, listener: Arc<dyn EventListener>, mask: u32) -> ListenerId {
        let id = ListenerId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().await.push(Registration {
            id,
            mask,
            listener,
        });
        id
    }

    /// Register an async closure as a listener.
    pub async fn add_callback<F, Fut>(&self, mask: u32, callback: F) -> ListenerId
    where
        F: Fn(SchedulerEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = CallbackListener {
            callback: Box::new(move |event| Box::pin(callback(event))),
        };
        self.add_listener(Arc::new(listener), mask).await
    }

    /// Remove a previously registered listener. Returns whether it was
    /// still registered.
    pub async fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().await;
        let before = listeners.len();
        listeners.retain(|registration| registration.id != id);
        listeners.len() != before
    }

    /// Deliver `event` to every listener whose mask matches, in
    /// registration order.
    pub async fn dispatch(&self, event: SchedulerEvent) {
        let matching: Vec<Arc<dyn EventListener>> = {
            let listeners = self.listeners.read().await;
            listeners
                .iter()
                .filter(|registration| registration.mask & event.code() != 0)
                .map(|registration| Arc::clone(&registration.listener))
                .collect()
        };
        for listener in matching {
            listener.on_event(&event).await;
        }
    }

    /// Number of registered listeners.
    pub async fn listener_count(&self) -> usize {
        self.listeners.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
