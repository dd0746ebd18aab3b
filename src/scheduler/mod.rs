//! Scheduler construction and configuration.

mod engine;

pub use engine::{Scheduler, SchedulerError, SchedulerState};

use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Duration;

use crate::core::job::RunnerRegistry;

/// Default upper bound on one loop sleep.
const DEFAULT_TICK_MAX: Duration = Duration::from_secs(60);

/// Default wait before retrying a store whose due-jobs query failed.
const DEFAULT_STORE_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Defaults applied to jobs that leave the corresponding options unset.
#[derive(Debug, Clone)]
pub struct JobDefaults {
    /// Max lateness for a firing to still run; `None` means unlimited.
    pub misfire_grace: Option<Duration>,
    /// Collapse several missed firings into one run.
    pub coalesce: bool,
    /// Cap on concurrent in-flight runs per job.
    pub max_instances: usize,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            misfire_grace: Some(Duration::from_secs(1)),
            coalesce: true,
            max_instances: 1,
        }
    }
}

/// Builder for [`Scheduler`].
pub struct SchedulerBuilder {
    pub(crate) timezone: Tz,
    pub(crate) tick_max: Duration,
    pub(crate) store_retry_interval: Duration,
    pub(crate) defaults: JobDefaults,
    pub(crate) registry: Arc<RunnerRegistry>,
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self {
            timezone: Tz::UTC,
            tick_max: DEFAULT_TICK_MAX,
            store_retry_interval: DEFAULT_STORE_RETRY_INTERVAL,
            defaults: JobDefaults::default(),
            registry: Arc::new(RunnerRegistry::new()),
        }
    }
}

impl SchedulerBuilder {
    /// Timezone used when logging wall-clock instants. Triggers carry
    /// their own timezone configuration.
    pub fn timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    /// Upper bound on one loop sleep; a due change always wakes the loop
    /// earlier.
    pub fn tick_max(mut self, tick_max: Duration) -> Self {
        self.tick_max = tick_max;
        self
    }

    /// Wait before retrying a store whose due-jobs query failed.
    pub fn store_retry_interval(mut self, interval: Duration) -> Self {
        self.store_retry_interval = interval;
        self
    }

    /// Defaults for jobs that leave options unset.
    pub fn job_defaults(mut self, defaults: JobDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Registry resolving named runner references.
    pub fn runner_registry(mut self, registry: Arc<RunnerRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Build the scheduler in the stopped state.
    pub fn build(self) -> Scheduler {
        Scheduler::from_builder(self)
    }
}
