//! Triggers compute the firing instants of a job.
//!
//! A trigger is an immutable value: given the previous fire time and the
//! current instant, [`Trigger::next_fire_time`] returns the next instant the
//! job should run, or `None` when the trigger is exhausted. The same inputs
//! always produce the same output; calendar and DST rules are part of the
//! trigger's own configuration.
//!
//! Variants:
//! - [`DateTrigger`]: fires exactly once at a configured instant
//! - [`IntervalTrigger`]: fires on a fixed-period grid
//! - [`CronTrigger`]: fires on matching calendar field values
//! - [`AndTrigger`] / [`OrTrigger`]: composite intersection / union

mod combining;
pub mod cron;
mod date;
mod interval;

pub use combining::{AndTrigger, OrTrigger};
pub use cron::CronTrigger;
pub use date::DateTrigger;
pub use interval::IntervalTrigger;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while constructing a trigger.
///
/// These surface synchronously to the caller; a constructed trigger is
/// always valid.
#[derive(Debug, Error)]
pub enum TriggerError {
    /// Invalid cron field expression.
    #[error("invalid cron expression {expression:?} for field {field}")]
    InvalidCronExpression { field: &'static str, expression: String },

    /// A cron field value falls outside the field's bounds.
    #[error("value {value} is out of range for field {field} ({min}-{max})")]
    ValueOutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    /// The interval period must be positive.
    #[error("interval period must be greater than zero")]
    ZeroInterval,

    /// A composite trigger needs at least one child.
    #[error("composite trigger requires at least one child trigger")]
    EmptyComposite,

    /// Unknown timezone name.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),
}

/// A job's firing schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Trigger {
    /// One-shot firing at a fixed instant.
    Date(DateTrigger),
    /// Fixed-period firings.
    Interval(IntervalTrigger),
    /// Calendar-field firings.
    Cron(Box<CronTrigger>),
    /// Fires only when every child would fire at the same instant.
    And(AndTrigger),
    /// Fires at the earliest instant any child would fire.
    Or(OrTrigger),
}

impl Trigger {
    /// Compute the next fire time strictly after `previous`.
    ///
    /// Returns `None` when the trigger has no further firings. The result
    /// may legally lie in the past; the dispatcher evaluates such firings
    /// against the job's misfire grace window.
    pub fn next_fire_time(
        &self,
        previous: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Date(t) => t.next_fire_time(previous, now),
            Trigger::Interval(t) => t.next_fire_time(previous, now),
            Trigger::Cron(t) => t.next_fire_time(previous, now),
            Trigger::And(t) => t.next_fire_time(previous, now),
            Trigger::Or(t) => t.next_fire_time(previous, now),
        }
    }
}

impl From<DateTrigger> for Trigger {
    fn from(t: DateTrigger) -> Self {
        Trigger::Date(t)
    }
}

impl From<IntervalTrigger> for Trigger {
    fn from(t: IntervalTrigger) -> Self {
        Trigger::Interval(t)
    }
}

impl From<CronTrigger> for Trigger {
    fn from(t: CronTrigger) -> Self {
        Trigger::Cron(Box::new(t))
    }
}

impl From<AndTrigger> for Trigger {
    fn from(t: AndTrigger) -> Self {
        Trigger::And(t)
    }
}

impl From<OrTrigger> for Trigger {
    fn from(t: OrTrigger) -> Self {
        Trigger::Or(t)
    }
}
