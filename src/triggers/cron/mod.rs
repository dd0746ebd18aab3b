//! Calendar-field trigger.
//!
//! Fires at the smallest instant strictly after the previous fire time whose
//! year, month, day, ISO week, weekday, hour, minute and second all match
//! their configured expressions. Resolution walks the fields from the most
//! significant downward: when a field cannot match, the next more
//! significant real field is bumped and everything below it resets to its
//! minimum.

mod field;

use chrono::{
    DateTime, Datelike, Duration as ChronoDuration, NaiveDateTime, Timelike, TimeZone, Utc,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use self::field::{CronField, FieldKind, Parts, FIELD_ORDER};
use super::TriggerError;

/// Search horizon: candidates beyond this many years ahead report exhaustion.
const MAX_YEARS_AHEAD: i32 = 100;

/// Retry bound while stepping over a DST gap, sized to the widest observed
/// gap (two hours) at one-second resolution.
const MAX_DST_SKIPS: u32 = 7320;

/// Serialized form: the field expression strings plus window and timezone.
///
/// `CronTrigger` round-trips through this so a deserialized trigger is
/// always re-parsed and valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub week: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hour: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minute: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub second: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    pub timezone: Tz,
}

impl CronSpec {
    fn expression(&self, kind: FieldKind) -> Option<&str> {
        match kind {
            FieldKind::Year => self.year.as_deref(),
            FieldKind::Month => self.month.as_deref(),
            FieldKind::Day => self.day.as_deref(),
            FieldKind::Week => self.week.as_deref(),
            FieldKind::DayOfWeek => self.day_of_week.as_deref(),
            FieldKind::Hour => self.hour.as_deref(),
            FieldKind::Minute => self.minute.as_deref(),
            FieldKind::Second => self.second.as_deref(),
        }
    }

    /// Default expression for a field that was not given explicitly.
    ///
    /// Fields more significant than the least significant explicit one
    /// default to `*`; the rest default to their minimum (the date-derived
    /// fields always to `*`).
    fn default_expression(kind: FieldKind) -> &'static str {
        match kind {
            FieldKind::Year | FieldKind::Week | FieldKind::DayOfWeek => "*",
            FieldKind::Month | FieldKind::Day => "1",
            FieldKind::Hour | FieldKind::Minute | FieldKind::Second => "0",
        }
    }
}

/// Fires when every configured calendar field matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "CronSpec", into = "CronSpec")]
pub struct CronTrigger {
    spec: CronSpec,
    fields: Vec<CronField>,
}

impl TryFrom<CronSpec> for CronTrigger {
    type Error = TriggerError;

    fn try_from(spec: CronSpec) -> Result<Self, Self::Error> {
        let least_significant_given = FIELD_ORDER
            .iter()
            .rposition(|kind| spec.expression(*kind).is_some());

        let mut fields = Vec::with_capacity(FIELD_ORDER.len());
        for (index, kind) in FIELD_ORDER.into_iter().enumerate() {
            let expression = match spec.expression(kind) {
                Some(expr) => expr,
                None if Some(index) < least_significant_given || least_significant_given.is_none() => {
                    "*"
                }
                None => CronSpec::default_expression(kind),
            };
            fields.push(CronField::parse(kind, expression)?);
        }
        Ok(Self { spec, fields })
    }
}

impl From<CronTrigger> for CronSpec {
    fn from(trigger: CronTrigger) -> Self {
        trigger.spec
    }
}

impl CronTrigger {
    /// Start building a cron trigger; all fields default as in
    /// [`CronSpec::default_expression`], timezone defaults to UTC.
    pub fn builder() -> CronTriggerBuilder {
        CronTriggerBuilder::default()
    }

    /// The trigger's timezone.
    pub fn timezone(&self) -> Tz {
        self.spec.timezone
    }

    /// Smallest matching instant strictly after `previous` (or at/after
    /// `max(now, start)` on the first call), `None` when exhausted.
    pub fn next_fire_time(
        &self,
        previous: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let search_start = match previous {
            Some(prev) => prev + ChronoDuration::seconds(1),
            None => match self.spec.start {
                Some(start) if start > now => start,
                _ => now,
            },
        };

        let tz = self.spec.timezone;
        let mut search_from = ceil_to_second(search_start.with_timezone(&tz).naive_local());

        for _ in 0..MAX_DST_SKIPS {
            let candidate = self.find_next_naive(search_from)?;
            if let Some(end) = self.spec.end {
                if candidate > end.with_timezone(&tz).naive_local() {
                    return None;
                }
            }
            match tz.from_local_datetime(&candidate) {
                chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                // Repeated local hour: take the earlier offset.
                chrono::LocalResult::Ambiguous(earlier, _) => {
                    return Some(earlier.with_timezone(&Utc))
                }
                // Skipped local time (DST gap): keep searching behind it.
                chrono::LocalResult::None => {
                    search_from = candidate + ChronoDuration::seconds(1);
                }
            }
        }
        None
    }

    /// Field-expansion walk over naive local time.
    fn find_next_naive(&self, from: NaiveDateTime) -> Option<NaiveDateTime> {
        let max_year = from.year() + MAX_YEARS_AHEAD;
        let mut parts = Parts::from_naive(from);
        let mut fieldnum: i32 = 0;

        while (0..self.fields.len() as i32).contains(&fieldnum) {
            if parts.year > max_year {
                return None;
            }
            let field = &self.fields[fieldnum as usize];
            let current = field.kind.value(&parts);
            match field.next_value(&parts) {
                // No value matches this cycle: bump the next more
                // significant real field.
                None => {
                    fieldnum = increment_field(&mut parts, fieldnum - 1);
                }
                Some(next) if next > current => {
                    if field.kind.is_real() {
                        field.kind.set(&mut parts, next);
                        reset_following(&mut parts, fieldnum as usize + 1);
                        fieldnum += 1;
                    } else {
                        // Derived fields advance by walking the day forward.
                        fieldnum = increment_field(&mut parts, fieldnum);
                    }
                }
                Some(_) => fieldnum += 1,
            }
        }

        if fieldnum >= 0 {
            parts.to_naive()
        } else {
            None
        }
    }
}

/// Increment the real field at or above `fieldnum`, resetting everything
/// less significant to its minimum. Returns the index of the incremented
/// field, or -1 when even the year cannot be advanced.
fn increment_field(parts: &mut Parts, mut fieldnum: i32) -> i32 {
    while fieldnum >= 0 {
        let kind = FIELD_ORDER[fieldnum as usize];
        if !kind.is_real() {
            fieldnum -= 1;
            continue;
        }
        let value = kind.value(parts);
        if value >= kind.max(parts) {
            fieldnum -= 1;
            continue;
        }
        kind.set(parts, value + 1);
        reset_following(parts, fieldnum as usize + 1);
        return fieldnum;
    }
    -1
}

/// Reset every real field below `index` to its minimum.
fn reset_following(parts: &mut Parts, index: usize) {
    for kind in &FIELD_ORDER[index.min(FIELD_ORDER.len())..] {
        if kind.is_real() {
            kind.set(parts, kind.min());
        }
    }
}

fn ceil_to_second(dt: NaiveDateTime) -> NaiveDateTime {
    if dt.nanosecond() == 0 {
        dt
    } else {
        dt.with_nanosecond(0).unwrap_or(dt) + ChronoDuration::seconds(1)
    }
}

/// Builder for [`CronTrigger`].
#[derive(Debug, Clone)]
pub struct CronTriggerBuilder {
    spec: CronSpec,
}

impl Default for CronTriggerBuilder {
    fn default() -> Self {
        Self {
            spec: CronSpec {
                year: None,
                month: None,
                day: None,
                week: None,
                day_of_week: None,
                hour: None,
                minute: None,
                second: None,
                start: None,
                end: None,
                timezone: Tz::UTC,
            },
        }
    }
}

impl CronTriggerBuilder {
    pub fn year(mut self, expr: impl Into<String>) -> Self {
        self.spec.year = Some(expr.into());
        self
    }

    pub fn month(mut self, expr: impl Into<String>) -> Self {
        self.spec.month = Some(expr.into());
        self
    }

    pub fn day(mut self, expr: impl Into<String>) -> Self {
        self.spec.day = Some(expr.into());
        self
    }

    pub fn week(mut self, expr: impl Into<String>) -> Self {
        self.spec.week = Some(expr.into());
        self
    }

    pub fn day_of_week(mut self, expr: impl Into<String>) -> Self {
        self.spec.day_of_week = Some(expr.into());
        self
    }

    pub fn hour(mut self, expr: impl Into<String>) -> Self {
        self.spec.hour = Some(expr.into());
        self
    }

    pub fn minute(mut self, expr: impl Into<String>) -> Self {
        self.spec.minute = Some(expr.into());
        self
    }

    pub fn second(mut self, expr: impl Into<String>) -> Self {
        self.spec.second = Some(expr.into());
        self
    }

    /// Earliest instant the trigger may fire.
    pub fn start_at(mut self, start: DateTime<Utc>) -> Self {
        self.spec.start = Some(start);
        self
    }

    /// Latest instant the trigger may fire.
    pub fn end_at(mut self, end: DateTime<Utc>) -> Self {
        self.spec.end = Some(end);
        self
    }

    /// Timezone the calendar fields are evaluated in.
    pub fn timezone(mut self, tz: Tz) -> Self {
        self.spec.timezone = tz;
        self
    }

    /// Parse the field expressions and build the trigger.
    pub fn build(self) -> Result<CronTrigger, TriggerError> {
        CronTrigger::try_from(self.spec)
    }
}
