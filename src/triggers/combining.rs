//! Composite triggers combining child schedules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Trigger, TriggerError};

/// Upper bound on the And-trigger fixpoint iteration. Pathological child
/// combinations that never agree on an instant return `None` instead of
/// spinning.
const MAX_AND_PROBES: usize = 1000;

/// Fires only at instants every child trigger would also fire at.
///
/// The next fire time is found by advancing to the maximum of the children's
/// candidates and re-probing until all children agree, or any child reports
/// exhaustion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AndTrigger {
    triggers: Vec<Trigger>,
}

impl AndTrigger {
    /// Combine `triggers`; fails on an empty list.
    pub fn new(triggers: Vec<Trigger>) -> Result<Self, TriggerError> {
        if triggers.is_empty() {
            return Err(TriggerError::EmptyComposite);
        }
        Ok(Self { triggers })
    }

    /// The child triggers.
    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    /// Smallest instant all children agree on, `None` if any child is
    /// exhausted or no agreement is reached within the probe bound.
    ///
    /// The first round passes `previous` through so exhausted children
    /// (e.g. an already-fired date trigger) short-circuit the composite.
    /// Subsequent rounds re-probe with the latest candidate as the
    /// first-fire reference instant, advancing every child onto or past it.
    pub fn next_fire_time(
        &self,
        previous: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let mut probe = now;
        let mut first_round = previous;
        for _ in 0..MAX_AND_PROBES {
            let mut earliest: Option<DateTime<Utc>> = None;
            let mut latest: Option<DateTime<Utc>> = None;
            for trigger in &self.triggers {
                let candidate = trigger.next_fire_time(first_round, probe)?;
                earliest = Some(earliest.map_or(candidate, |t| t.min(candidate)));
                latest = Some(latest.map_or(candidate, |t| t.max(candidate)));
            }
            let (earliest, latest) = (earliest?, latest?);
            if earliest == latest {
                return Some(earliest);
            }
            probe = latest;
            first_round = None;
        }
        None
    }
}

/// Fires at the earliest instant any child would fire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrTrigger {
    triggers: Vec<Trigger>,
}

impl OrTrigger {
    /// Combine `triggers`; fails on an empty list.
    pub fn new(triggers: Vec<Trigger>) -> Result<Self, TriggerError> {
        if triggers.is_empty() {
            return Err(TriggerError::EmptyComposite);
        }
        Ok(Self { triggers })
    }

    /// The child triggers.
    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    /// Minimum of the children's candidates, ignoring exhausted children;
    /// `None` only when every child is exhausted.
    pub fn next_fire_time(
        &self,
        previous: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        self.triggers
            .iter()
            .filter_map(|trigger| trigger.next_fire_time(previous, now))
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::triggers::{DateTrigger, IntervalTrigger};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn secs(n: i64) -> ChronoDuration {
        ChronoDuration::seconds(n)
    }

    fn interval(period_secs: u64, start: DateTime<Utc>) -> Trigger {
        Trigger::from(IntervalTrigger::starting_at(Duration::from_secs(period_secs), start).unwrap())
    }

    #[test]
    fn test_empty_composite_rejected() {
        assert!(matches!(AndTrigger::new(vec![]), Err(TriggerError::EmptyComposite)));
        assert!(matches!(OrTrigger::new(vec![]), Err(TriggerError::EmptyComposite)));
    }

    #[test]
    fn test_or_returns_min_of_children() {
        // Interval anchored one period after t0 plus a one-shot at t0+2.
        let or = OrTrigger::new(vec![
            interval(5, t0() + secs(5)),
            Trigger::from(DateTrigger::at(t0() + secs(2))),
        ])
        .unwrap();

        assert_eq!(or.next_fire_time(None, t0()), Some(t0() + secs(2)));
        assert_eq!(
            or.next_fire_time(Some(t0() + secs(2)), t0() + secs(2)),
            Some(t0() + secs(5))
        );
        assert_eq!(
            or.next_fire_time(Some(t0() + secs(5)), t0() + secs(5)),
            Some(t0() + secs(10))
        );
    }

    #[test]
    fn test_or_is_exhausted_only_when_all_children_are() {
        let or = OrTrigger::new(vec![Trigger::from(DateTrigger::at(t0()))]).unwrap();
        assert_eq!(or.next_fire_time(Some(t0()), t0() + secs(1)), None);
    }

    #[test]
    fn test_and_agrees_on_common_grid_instant() {
        // Periods 2 and 3 on the same anchor agree every 6 seconds.
        let and = AndTrigger::new(vec![interval(2, t0()), interval(3, t0())]).unwrap();

        assert_eq!(and.next_fire_time(None, t0() + secs(1)), Some(t0() + secs(6)));
        assert_eq!(
            and.next_fire_time(Some(t0() + secs(6)), t0() + secs(6)),
            Some(t0() + secs(12))
        );
    }

    #[test]
    fn test_and_exhausts_when_any_child_does() {
        let and = AndTrigger::new(vec![
            interval(1, t0()),
            Trigger::from(DateTrigger::at(t0() + secs(30))),
        ])
        .unwrap();

        // The date child already fired: no common instant remains.
        assert_eq!(and.next_fire_time(Some(t0() + secs(30)), t0()), None);
    }

    #[test]
    fn test_and_with_unaligned_date_returns_none() {
        // Date at t0+2.5 never lands on the 1-second grid probe sequence of
        // matching instants: the date child keeps answering t0+2.5 while the
        // interval child answers whole seconds, so no agreement is reached.
        let off_grid = t0() + ChronoDuration::milliseconds(2500);
        let and = AndTrigger::new(vec![
            interval(1, t0()),
            Trigger::from(DateTrigger::at(off_grid)),
        ])
        .unwrap();

        assert_eq!(and.next_fire_time(None, t0()), None);
    }

    #[test]
    fn test_and_with_aligned_date_fires_once() {
        let and = AndTrigger::new(vec![
            interval(1, t0()),
            Trigger::from(DateTrigger::at(t0() + secs(3))),
        ])
        .unwrap();

        assert_eq!(and.next_fire_time(None, t0()), Some(t0() + secs(3)));
        assert_eq!(and.next_fire_time(Some(t0() + secs(3)), t0() + secs(3)), None);
    }
}
