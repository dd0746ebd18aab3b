//! Chime is an in-process job scheduler: jobs paired with triggers are kept
//! in job stores, dispatched to executors when due, and observed through a
//! bitmask-filtered event bus.
//!
//! ```no_run
//! use chime::{JobRequest, Scheduler, Trigger};
//! use chime::triggers::IntervalTrigger;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), chime::SchedulerError> {
//!     let scheduler = Scheduler::builder().build();
//!     scheduler.start(false).await?;
//!
//!     let interval = IntervalTrigger::every(Duration::from_secs(60)).expect("non-zero period");
//!     let trigger = Trigger::from(interval);
//!     let request = JobRequest::call(trigger, |_inv| async move {
//!         println!("tick");
//!         Ok(serde_json::Value::Null)
//!     })
//!     .with_id("heartbeat");
//!     scheduler.add_job(request).await?;
//!
//!     tokio::time::sleep(Duration::from_secs(300)).await;
//!     scheduler.shutdown(true).await
//! }
//! ```

pub mod core;
pub mod events;
pub mod executors;
pub mod scheduler;
pub mod storage;
pub mod triggers;

pub use self::core::job::{
    FnRunner, Job, JobInvocation, JobRequest, JobRunner, JobUpdates, RunnerError, RunnerRef,
    RunnerRegistry,
};
pub use self::core::types::{JobId, ListenerId};

pub use events::{EventBus, EventListener, FailureKind, SchedulerEvent};

pub use executors::{
    DebugExecutor, Executor, ExecutorContext, ExecutorError, InlineExecutor, ThreadPoolExecutor,
};

pub use scheduler::{JobDefaults, Scheduler, SchedulerBuilder, SchedulerError, SchedulerState};

pub use storage::{JobStore, MemoryStore, StoreError};

pub use triggers::{
    AndTrigger, CronTrigger, DateTrigger, IntervalTrigger, OrTrigger, Trigger, TriggerError,
};
