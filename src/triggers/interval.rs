//! Fixed-period trigger.
//!
//! Firings lie on a grid anchored at the start instant: `start`,
//! `start + period`, `start + 2·period`, … The grid anchoring keeps the
//! schedule stable under composition and misfires: a late or skipped firing
//! never shifts subsequent ones.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::TriggerError;

/// Fires every `interval`, starting at `start` and optionally ending at `end`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalTrigger {
    interval: Duration,
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
}

impl IntervalTrigger {
    /// Create a trigger firing every `interval`, first at `now + interval`.
    pub fn every(interval: Duration) -> Result<Self, TriggerError> {
        let chrono_interval = Self::validate(interval)?;
        Ok(Self {
            interval,
            start: Utc::now() + chrono_interval,
            end: None,
        })
    }

    /// Create a trigger firing every `interval`, first at `start`.
    pub fn starting_at(interval: Duration, start: DateTime<Utc>) -> Result<Self, TriggerError> {
        Self::validate(interval)?;
        Ok(Self {
            interval,
            start,
            end: None,
        })
    }

    /// Stop firing after `end` (inclusive).
    pub fn with_end(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }

    /// The configured period.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// The grid anchor (and first fire time).
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    fn validate(interval: Duration) -> Result<ChronoDuration, TriggerError> {
        if interval.is_zero() {
            return Err(TriggerError::ZeroInterval);
        }
        ChronoDuration::from_std(interval).map_err(|_| TriggerError::ZeroInterval)
    }

    /// Next grid instant strictly after `previous` (or the first instant at
    /// or after `now` when `previous` is `None`), `None` once past `end`.
    pub fn next_fire_time(
        &self,
        previous: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let next = match previous {
            None => self.first_grid_instant_at_or_after(now),
            Some(prev) if prev < self.start => self.start,
            Some(prev) => {
                let mut next = self.first_grid_instant_at_or_after(prev);
                if next == prev {
                    next += self.chrono_interval();
                }
                next
            }
        };

        match self.end {
            Some(end) if next > end => None,
            _ => Some(next),
        }
    }

    fn chrono_interval(&self) -> ChronoDuration {
        // Validated at construction.
        ChronoDuration::from_std(self.interval).unwrap_or(ChronoDuration::MAX)
    }

    /// Smallest `start + k·interval` that is `>= at` (with `k >= 0`).
    fn first_grid_instant_at_or_after(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        if at <= self.start {
            return self.start;
        }

        let interval = self.chrono_interval();
        let elapsed_ns = (at - self.start).num_nanoseconds();
        let interval_ns = interval.num_nanoseconds();
        match (elapsed_ns, interval_ns) {
            (Some(elapsed), Some(step)) if step > 0 => {
                let periods = elapsed / step;
                let mut next = self.start + ChronoDuration::nanoseconds(periods * step);
                if next < at {
                    next += interval;
                }
                next
            }
            // Periods long enough to overflow nanosecond arithmetic: step
            // linearly, there can only be a handful of them.
            _ => {
                let mut next = self.start;
                while next < at {
                    next += interval;
                }
                next
            }
        }
    }
}
