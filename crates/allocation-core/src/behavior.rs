//! Counting and refresh behaviors
//!
//! A strategy combines one of each:
//! - **Counting** decides where accounting windows begin and end
//!   (calendar-fixed, fixed start, or trailing span)
//! - **Refresh** decides what balance a window opens with
//!   (granted once, or reset at every window boundary)

use chrono::{DateTime, Datelike, Days, Months, NaiveDate, NaiveTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AllocationError, Result};
use crate::types::{Allocation, TimeAmount};

/// Half-open time range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Portion of `[start, end]` inside this window.
    ///
    /// Returns `None` when nothing overlaps. A zero-length interval lying
    /// inside the window is kept as a zero-length overlap.
    pub fn clip(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Option<TimeWindow> {
        let clipped_start = start.max(self.start);
        let clipped_end = end.min(self.end);
        if clipped_start < clipped_end || (start == end && self.contains(start)) {
            Some(TimeWindow::new(clipped_start, clipped_end))
        } else {
            None
        }
    }

    /// Intersection with `other`, collapsed to an empty window at
    /// `other.end` when they do not meet
    fn within(&self, other: &TimeWindow) -> TimeWindow {
        let end = self.end.min(other.end);
        let start = self.start.max(other.start).min(end);
        TimeWindow::new(start, end)
    }
}

impl std::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// Calendar period used by fixed windows (UTC, weeks start on Monday)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalendarPeriod {
    Day,
    Week,
    Month,
    Year,
}

impl CalendarPeriod {
    /// Start of the period containing `at`
    pub fn floor(self, at: DateTime<Utc>) -> DateTime<Utc> {
        let date = at.date_naive();
        let first = match self {
            CalendarPeriod::Day => date,
            CalendarPeriod::Week => date - Days::new(date.weekday().num_days_from_monday() as u64),
            CalendarPeriod::Month => date - Days::new(date.day0() as u64),
            CalendarPeriod::Year => date - Days::new(date.ordinal0() as u64),
        };
        midnight(first)
    }

    /// Start of the period after the one beginning at `start`, or `None`
    /// past the last representable date
    pub fn next(self, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let date = start.date_naive();
        let next = match self {
            CalendarPeriod::Day => date.checked_add_days(Days::new(1)),
            CalendarPeriod::Week => date.checked_add_days(Days::new(7)),
            CalendarPeriod::Month => date.checked_add_months(Months::new(1)),
            CalendarPeriod::Year => date.checked_add_months(Months::new(12)),
        };
        next.map(midnight)
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// How accounting windows are laid out
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CountingBehavior {
    /// Calendar-fixed windows, e.g. the 1st of every month
    FixedWindow { period: CalendarPeriod },

    /// Window opens at a fixed point and runs up to the evaluation time.
    ///
    /// Without an explicit `start` the window opens at the allocation's
    /// creation or its most recent recharge, whichever is later.
    FixedStartSlidingWindow {
        #[serde(default)]
        start: Option<DateTime<Utc>>,
    },

    /// Trailing window of fixed length ending at the evaluation time
    FixedEndSlidingWindow { span: TimeAmount },
}

impl CountingBehavior {
    pub fn monthly() -> Self {
        CountingBehavior::FixedWindow {
            period: CalendarPeriod::Month,
        }
    }

    /// Reject trailing spans that are negative, not finite or longer than
    /// chrono can represent
    pub fn validate(&self) -> Result<()> {
        if let CountingBehavior::FixedEndSlidingWindow { span } = self {
            span_delta(span)?;
        }
        Ok(())
    }

    /// Window in effect at `evaluated_at`.
    ///
    /// `anchor` is where a fixed-start window opens when it has no explicit
    /// start. Calendar windows ignore it.
    pub fn window_for(
        &self,
        evaluated_at: DateTime<Utc>,
        anchor: DateTime<Utc>,
    ) -> Result<TimeWindow> {
        let window = match self {
            CountingBehavior::FixedWindow { period } => {
                let start = period.floor(evaluated_at);
                let end = period.next(start).unwrap_or(DateTime::<Utc>::MAX_UTC);
                TimeWindow::new(start, end)
            }
            CountingBehavior::FixedStartSlidingWindow { start } => {
                let start = start.unwrap_or(anchor).min(evaluated_at);
                TimeWindow::new(start, evaluated_at)
            }
            CountingBehavior::FixedEndSlidingWindow { span } => {
                // Spans reaching past the earliest representable instant open there
                let start = evaluated_at
                    .checked_sub_signed(span_delta(span)?)
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
                TimeWindow::new(start, evaluated_at)
            }
        };
        Ok(window)
    }

    /// Accounting periods covering `query`, in order.
    ///
    /// Always returns at least one period; an empty query yields one empty
    /// period.
    pub fn periods(&self, query: TimeWindow, anchor: DateTime<Utc>) -> Result<Vec<TimeWindow>> {
        match self {
            CountingBehavior::FixedWindow { period } => {
                if query.is_empty() {
                    return Ok(vec![query]);
                }
                let mut periods = Vec::new();
                let mut start = period.floor(query.start);
                while start < query.end {
                    let Some(next) = period.next(start) else {
                        periods.push(TimeWindow::new(start, query.end).within(&query));
                        break;
                    };
                    periods.push(TimeWindow::new(start, next).within(&query));
                    start = next;
                }
                Ok(periods)
            }
            CountingBehavior::FixedStartSlidingWindow { .. }
            | CountingBehavior::FixedEndSlidingWindow { .. } => {
                Ok(vec![self.window_for(query.end, anchor)?.within(&query)])
            }
        }
    }
}

fn span_delta(span: &TimeAmount) -> Result<TimeDelta> {
    let seconds = span.validated_seconds("sliding window span")?;
    TimeDelta::try_seconds(seconds)
        .ok_or_else(|| AllocationError::config(format!("sliding window span {} is out of range", span)))
}

impl std::fmt::Display for CountingBehavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CountingBehavior::FixedWindow { period } => write!(f, "FixedWindow({:?})", period),
            CountingBehavior::FixedStartSlidingWindow { start: Some(start) } => {
                write!(f, "FixedStartSlidingWindow({})", start.to_rfc3339())
            }
            CountingBehavior::FixedStartSlidingWindow { start: None } => {
                write!(f, "FixedStartSlidingWindow(allocation start)")
            }
            CountingBehavior::FixedEndSlidingWindow { span } => {
                write!(f, "FixedEndSlidingWindow({})", span)
            }
        }
    }
}

/// How a window's opening balance is replenished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshBehavior {
    /// Credit is granted once; later windows inherit the running balance
    OneTimeRefresh,
    /// Every window boundary resets the balance to the nominal budget
    RecurringRefresh,
}

/// What opened an accounting period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodBoundary {
    /// First period of the evaluation
    Opening,
    /// Boundary produced by the counting behavior
    Counting,
    /// Explicit recharge, carrying the recharged amount in seconds
    Recharge(i64),
}

impl RefreshBehavior {
    /// Balance the first period of an evaluation opens with
    pub fn opening_balance(&self, allocation: &Allocation, first_start: DateTime<Utc>) -> i64 {
        match self {
            RefreshBehavior::RecurringRefresh => allocation.nominal_seconds(),
            RefreshBehavior::OneTimeRefresh => {
                let last_recharge = allocation
                    .recharges()
                    .filter(|r| r.date < first_start)
                    .max_by_key(|r| r.date);
                let (base, since) = match last_recharge {
                    Some(r) => (r.amount.to_seconds(), Some(r.date)),
                    None => (allocation.nominal_seconds(), None),
                };
                allocation
                    .increases()
                    .filter(|i| i.date < first_start && since.is_none_or(|s| i.date >= s))
                    .fold(base, |total, i| total.saturating_add(i.amount.to_seconds()))
            }
        }
    }

    /// Balance a later period opens with.
    ///
    /// `rollover` adds the unused part of the previous balance on top of a
    /// reset. A running balance is inherited as is, debt included.
    pub fn balance_after(
        &self,
        boundary: PeriodBoundary,
        nominal: i64,
        previous_remaining: i64,
        rollover: bool,
    ) -> i64 {
        let carried = if rollover { previous_remaining.max(0) } else { 0 };
        match (boundary, self) {
            (PeriodBoundary::Recharge(amount), _) => amount.saturating_add(carried),
            (_, RefreshBehavior::OneTimeRefresh) => previous_remaining,
            (_, RefreshBehavior::RecurringRefresh) => nominal.saturating_add(carried),
        }
    }
}

impl std::fmt::Display for RefreshBehavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefreshBehavior::OneTimeRefresh => write!(f, "OneTimeRefresh"),
            RefreshBehavior::RecurringRefresh => write!(f, "RecurringRefresh"),
        }
    }
}
