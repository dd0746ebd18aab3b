//! Calendar field expressions and their expansion.
//!
//! Each cron field holds a list of expressions combined with OR semantics.
//! Expansion asks a field for the smallest matching value at or above the
//! current one, in the context of the candidate date (month lengths and
//! weekday positions depend on it).

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use crate::triggers::TriggerError;

/// Candidate instant decomposed into calendar parts, always a valid date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Parts {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

impl Parts {
    pub fn from_naive(dt: NaiveDateTime) -> Self {
        Self {
            year: dt.year(),
            month: dt.month(),
            day: dt.day(),
            hour: dt.hour(),
            minute: dt.minute(),
            second: dt.second(),
        }
    }

    pub fn to_naive(self) -> Option<NaiveDateTime> {
        let date = NaiveDate::from_ymd_opt(self.year, self.month, self.day)?;
        let time = NaiveTime::from_hms_opt(self.hour, self.minute, self.second)?;
        Some(date.and_time(time))
    }

    fn date(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, self.day)
    }

    /// ISO week number of the candidate date.
    fn iso_week(&self) -> u32 {
        self.date().map(|d| d.iso_week().week()).unwrap_or(1)
    }

    /// Weekday of the candidate date, 0 = Monday … 6 = Sunday.
    fn weekday(&self) -> u32 {
        self.date()
            .map(|d| d.weekday().num_days_from_monday())
            .unwrap_or(0)
    }
}

pub(crate) fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 => {
            if NaiveDate::from_ymd_opt(year, 2, 29).is_some() {
                29
            } else {
                28
            }
        }
        _ => 0,
    }
}

/// The calendar fields, in significance order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FieldKind {
    Year,
    Month,
    Day,
    Week,
    DayOfWeek,
    Hour,
    Minute,
    Second,
}

/// Significance order used by the expansion loop.
pub(crate) const FIELD_ORDER: [FieldKind; 8] = [
    FieldKind::Year,
    FieldKind::Month,
    FieldKind::Day,
    FieldKind::Week,
    FieldKind::DayOfWeek,
    FieldKind::Hour,
    FieldKind::Minute,
    FieldKind::Second,
];

impl FieldKind {
    pub fn name(self) -> &'static str {
        match self {
            FieldKind::Year => "year",
            FieldKind::Month => "month",
            FieldKind::Day => "day",
            FieldKind::Week => "week",
            FieldKind::DayOfWeek => "day_of_week",
            FieldKind::Hour => "hour",
            FieldKind::Minute => "minute",
            FieldKind::Second => "second",
        }
    }

    /// Real fields are stored directly in the candidate; week and
    /// day_of_week are derived from the date and advanced by bumping the
    /// day.
    pub fn is_real(self) -> bool {
        !matches!(self, FieldKind::Week | FieldKind::DayOfWeek)
    }

    pub fn min(self) -> u32 {
        match self {
            FieldKind::Year => 1970,
            FieldKind::Month | FieldKind::Day | FieldKind::Week => 1,
            FieldKind::DayOfWeek | FieldKind::Hour | FieldKind::Minute | FieldKind::Second => 0,
        }
    }

    pub fn max(self, parts: &Parts) -> u32 {
        match self {
            FieldKind::Year => 9999,
            FieldKind::Month => 12,
            FieldKind::Day => days_in_month(parts.year, parts.month),
            FieldKind::Week => 53,
            FieldKind::DayOfWeek => 6,
            FieldKind::Hour => 23,
            FieldKind::Minute | FieldKind::Second => 59,
        }
    }

    pub fn value(self, parts: &Parts) -> u32 {
        match self {
            FieldKind::Year => parts.year as u32,
            FieldKind::Month => parts.month,
            FieldKind::Day => parts.day,
            FieldKind::Week => parts.iso_week(),
            FieldKind::DayOfWeek => parts.weekday(),
            FieldKind::Hour => parts.hour,
            FieldKind::Minute => parts.minute,
            FieldKind::Second => parts.second,
        }
    }

    /// Write `value` into the candidate. Only valid for real fields.
    pub fn set(self, parts: &mut Parts, value: u32) {
        match self {
            FieldKind::Year => parts.year = value as i32,
            FieldKind::Month => parts.month = value,
            FieldKind::Day => parts.day = value,
            FieldKind::Hour => parts.hour = value,
            FieldKind::Minute => parts.minute = value,
            FieldKind::Second => parts.second = value,
            FieldKind::Week | FieldKind::DayOfWeek => {
                debug_assert!(false, "derived fields cannot be set directly")
            }
        }
    }
}

const WEEKDAY_NAMES: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];
const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const POSITION_NAMES: [&str; 6] = ["1st", "2nd", "3rd", "4th", "5th", "last"];

/// Nth-weekday-of-month selector for the day field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Position {
    Nth(u32),
    Last,
}

/// A single parsed expression within a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FieldExpr {
    /// `*` or `*/step`.
    All { step: Option<u32> },
    /// `first`, `first-last`, `first-last/step` or `first/step` (open end).
    Range {
        first: u32,
        last: Option<u32>,
        step: Option<u32>,
    },
    /// Day field: `last`.
    LastDayOfMonth,
    /// Day field: `last fri`, `1st mon`, …
    WeekdayPosition { position: Position, weekday: u32 },
}

impl FieldExpr {
    /// Smallest matching value `>= start` within the field bounds for the
    /// candidate date, or `None` when the expression cannot match anymore
    /// this cycle.
    fn next_value(&self, parts: &Parts, start: u32, maxval: u32) -> Option<u32> {
        match *self {
            FieldExpr::All { step } => {
                let next = match step {
                    None => start,
                    Some(s) => ceil_to_step(start, 0, s),
                };
                (next <= maxval).then_some(next)
            }
            FieldExpr::Range { first, last, step } => {
                let last = last.unwrap_or(maxval).min(maxval);
                if start > last {
                    return None;
                }
                let base = start.max(first);
                let next = match step {
                    None => base,
                    Some(s) => ceil_to_step(base, first, s),
                };
                (next <= last).then_some(next)
            }
            FieldExpr::LastDayOfMonth => {
                let day = days_in_month(parts.year, parts.month);
                (day >= start).then_some(day)
            }
            FieldExpr::WeekdayPosition { position, weekday } => {
                let day = weekday_position_day(parts.year, parts.month, position, weekday)?;
                (day >= start).then_some(day)
            }
        }
    }
}

/// Smallest `anchor + k·step >= value`.
fn ceil_to_step(value: u32, anchor: u32, step: u32) -> u32 {
    if value <= anchor {
        return anchor;
    }
    let offset = value - anchor;
    anchor + offset.div_ceil(step) * step
}

/// Day of month of the Nth/last `weekday` (0 = Monday) in the given month.
fn weekday_position_day(year: i32, month: u32, position: Position, weekday: u32) -> Option<u32> {
    let length = days_in_month(year, month);
    match position {
        Position::Last => {
            let last = NaiveDate::from_ymd_opt(year, month, length)?;
            let back = (last.weekday().num_days_from_monday() + 7 - weekday) % 7;
            Some(length - back)
        }
        Position::Nth(n) => {
            let first = NaiveDate::from_ymd_opt(year, month, 1)?;
            let forward = (weekday + 7 - first.weekday().num_days_from_monday()) % 7;
            let day = 1 + forward + 7 * (n - 1);
            (day <= length).then_some(day)
        }
    }
}

/// A parsed cron field: one or more expressions, OR-combined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CronField {
    pub kind: FieldKind,
    exprs: Vec<FieldExpr>,
}

impl CronField {
    /// Parse a comma-separated field expression list.
    pub fn parse(kind: FieldKind, expression: &str) -> Result<Self, TriggerError> {
        let mut exprs = Vec::new();
        for piece in expression.split(',') {
            let piece = piece.trim().to_ascii_lowercase();
            if piece.is_empty() {
                return Err(invalid(kind, expression));
            }
            exprs.push(parse_expr(kind, &piece).ok_or_else(|| invalid(kind, expression))?);
        }
        let field = Self { kind, exprs };
        field.validate()?;
        Ok(field)
    }

    fn validate(&self) -> Result<(), TriggerError> {
        let (min, max) = (self.kind.min(), self.kind.static_max());
        for expr in &self.exprs {
            if let FieldExpr::Range { first, last, step } = *expr {
                for value in [Some(first), last].into_iter().flatten() {
                    if value < min || value > max {
                        return Err(TriggerError::ValueOutOfRange {
                            field: self.kind.name(),
                            value,
                            min,
                            max,
                        });
                    }
                }
                if let Some(last) = last {
                    if first > last {
                        return Err(invalid(self.kind, &format!("{first}-{last}")));
                    }
                }
                if step == Some(0) {
                    return Err(invalid(self.kind, "step 0"));
                }
            }
            if let FieldExpr::All { step: Some(0) } = expr {
                return Err(invalid(self.kind, "step 0"));
            }
        }
        Ok(())
    }

    /// Smallest matching value at or above the field's current value for
    /// the candidate, or `None` when no expression can match this cycle.
    pub fn next_value(&self, parts: &Parts) -> Option<u32> {
        let start = self.kind.value(parts).max(self.kind.min());
        let maxval = self.kind.max(parts);
        self.exprs
            .iter()
            .filter_map(|expr| expr.next_value(parts, start, maxval))
            .min()
    }
}

impl FieldKind {
    /// Date-independent upper bound, used for construction-time validation.
    fn static_max(self) -> u32 {
        match self {
            FieldKind::Day => 31,
            other => other.max(&Parts {
                year: 2000,
                month: 1,
                day: 1,
                hour: 0,
                minute: 0,
                second: 0,
            }),
        }
    }
}

fn invalid(kind: FieldKind, expression: &str) -> TriggerError {
    TriggerError::InvalidCronExpression {
        field: kind.name(),
        expression: expression.to_string(),
    }
}

fn parse_expr(kind: FieldKind, piece: &str) -> Option<FieldExpr> {
    // Day-field position expressions: "last", "last fri", "2nd mon".
    if kind == FieldKind::Day {
        let tokens: Vec<&str> = piece.split_whitespace().collect();
        match tokens.as_slice() {
            ["last"] => return Some(FieldExpr::LastDayOfMonth),
            [pos, name] if POSITION_NAMES.contains(pos) => {
                let weekday = lookup_name(&WEEKDAY_NAMES, name)?;
                let position = match *pos {
                    "last" => Position::Last,
                    nth => Position::Nth(nth[..1].parse().ok()?),
                };
                return Some(FieldExpr::WeekdayPosition { position, weekday });
            }
            _ => {}
        }
    }

    let (body, step) = match piece.split_once('/') {
        Some((body, step)) => (body, Some(step.parse().ok()?)),
        None => (piece, None),
    };

    if body == "*" {
        return Some(FieldExpr::All { step });
    }

    let (first_token, last_token) = match body.split_once('-') {
        Some((first, last)) => (first, Some(last)),
        None => (body, None),
    };
    let first = resolve_value(kind, first_token)?;
    let last = match last_token {
        Some(token) => Some(resolve_value(kind, token)?),
        // A bare value is an exact match unless a step opens the range.
        None if step.is_none() => Some(first),
        None => None,
    };
    Some(FieldExpr::Range { first, last, step })
}

/// Resolve a numeric value or a three-letter month/weekday name.
fn resolve_value(kind: FieldKind, token: &str) -> Option<u32> {
    if let Ok(value) = token.parse() {
        return Some(value);
    }
    match kind {
        FieldKind::Month => lookup_name(&MONTH_NAMES, token).map(|i| i + 1),
        FieldKind::DayOfWeek => lookup_name(&WEEKDAY_NAMES, token),
        _ => None,
    }
}

fn lookup_name(names: &[&str], token: &str) -> Option<u32> {
    names.iter().position(|n| *n == token).map(|i| i as u32)
}
