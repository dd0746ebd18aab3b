//! One-shot trigger firing at a fixed instant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fires exactly once at the configured instant, then reports exhaustion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateTrigger {
    run_at: DateTime<Utc>,
}

impl DateTrigger {
    /// Create a trigger that fires once at `run_at`.
    pub fn at(run_at: DateTime<Utc>) -> Self {
        Self { run_at }
    }

    /// The configured firing instant.
    pub fn run_at(&self) -> DateTime<Utc> {
        self.run_at
    }

    /// Returns the configured instant on the first call, `None` afterwards.
    pub fn next_fire_time(
        &self,
        previous: Option<DateTime<Utc>>,
        _now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match previous {
            None => Some(self.run_at),
            Some(_) => None,
        }
    }
}
