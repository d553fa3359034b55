//! Calculation results
//!
//! Built once per `calculate` call and never mutated afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::behavior::TimeWindow;
use crate::rules::Charge;
use crate::types::InstanceStatus;

/// Burn of one history interval inside one period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceHistoryResult {
    pub status: InstanceStatus,
    pub size: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub clock_seconds: i64,
    pub burn_rate: f64,
    pub burn_seconds: i64,
    pub carried_forward: bool,
}

impl From<&Charge<'_>> for InstanceHistoryResult {
    fn from(charge: &Charge<'_>) -> Self {
        Self {
            status: charge.status,
            size: charge.history.size.as_ref().map(|s| s.id.clone()),
            start: charge.start,
            end: charge.end,
            clock_seconds: charge.clock_seconds(),
            burn_rate: charge.burn_rate,
            burn_seconds: charge.burn_seconds(),
            carried_forward: charge.carried_forward,
        }
    }
}

/// Burn of one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceResult {
    pub instance_id: String,
    pub histories: Vec<InstanceHistoryResult>,
    pub clock_seconds: i64,
    pub burn_seconds: i64,
}

impl InstanceResult {
    pub fn new(instance_id: impl Into<String>, histories: Vec<InstanceHistoryResult>) -> Self {
        let clock_seconds = histories
            .iter()
            .map(|h| h.clock_seconds)
            .fold(0, i64::saturating_add);
        let burn_seconds = histories
            .iter()
            .map(|h| h.burn_seconds)
            .fold(0, i64::saturating_add);
        Self {
            instance_id: instance_id.into(),
            histories,
            clock_seconds,
            burn_seconds,
        }
    }

    pub fn from_charges(instance_id: impl Into<String>, charges: &[Charge<'_>]) -> Self {
        Self::new(instance_id, charges.iter().map(InstanceHistoryResult::from).collect())
    }
}

/// Accounting of one period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimePeriodResult {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Balance the period opened with, increases included
    pub credit_seconds: i64,
    pub burn_seconds: i64,
    /// `credit_seconds - burn_seconds`; negative when over allocation
    pub remaining_seconds: i64,
    pub instances: Vec<InstanceResult>,
}

impl TimePeriodResult {
    pub fn new(window: TimeWindow, credit_seconds: i64, instances: Vec<InstanceResult>) -> Self {
        let burn_seconds = instances
            .iter()
            .map(|i| i.burn_seconds)
            .fold(0, i64::saturating_add);
        Self {
            start: window.start,
            end: window.end,
            credit_seconds,
            burn_seconds,
            remaining_seconds: credit_seconds.saturating_sub(burn_seconds),
            instances,
        }
    }

    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.start, self.end)
    }

    pub fn is_over_allocation(&self) -> bool {
        self.remaining_seconds < 0
    }
}

/// Outcome of evaluating one allocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationResult {
    pub allocation_id: String,
    pub strategy: String,
    /// Current (last) accounting period
    pub window: TimePeriodResult,
    pub time_periods: Vec<TimePeriodResult>,
    pub total_burn_seconds: i64,
    /// Balance at the end of the current period; `i64::MAX` when unlimited
    pub remaining_seconds: i64,
    pub unlimited: bool,
    pub per_instance: Vec<InstanceResult>,
}

impl AllocationResult {
    /// Assemble the result from its periods.
    ///
    /// `instance_order` fixes the order of `per_instance`; instances that
    /// never appear in a period are left out. `query` stands in as an empty
    /// current window when there are no periods.
    pub fn from_periods(
        allocation_id: impl Into<String>,
        strategy: impl Into<String>,
        query: TimeWindow,
        time_periods: Vec<TimePeriodResult>,
        instance_order: &[&str],
    ) -> Self {
        let per_instance = instance_order
            .iter()
            .filter_map(|id| {
                let mut seen = false;
                let histories: Vec<InstanceHistoryResult> = time_periods
                    .iter()
                    .flat_map(|p| p.instances.iter())
                    .filter(|i| i.instance_id == *id)
                    .flat_map(|i| {
                        seen = true;
                        i.histories.iter().cloned()
                    })
                    .collect();
                seen.then(|| InstanceResult::new(*id, histories))
            })
            .collect();

        let total_burn_seconds = time_periods
            .iter()
            .map(|p| p.burn_seconds)
            .fold(0, i64::saturating_add);
        let window = time_periods
            .last()
            .cloned()
            .unwrap_or_else(|| TimePeriodResult::new(query, 0, Vec::new()));

        Self {
            allocation_id: allocation_id.into(),
            strategy: strategy.into(),
            remaining_seconds: window.remaining_seconds,
            window,
            time_periods,
            total_burn_seconds,
            unlimited: false,
            per_instance,
        }
    }

    /// Result for an allocation without limits: nothing is consumed
    pub fn unlimited(
        allocation_id: impl Into<String>,
        strategy: impl Into<String>,
        query: TimeWindow,
    ) -> Self {
        let window = TimePeriodResult::new(query, i64::MAX, Vec::new());
        Self {
            allocation_id: allocation_id.into(),
            strategy: strategy.into(),
            window: window.clone(),
            time_periods: vec![window],
            total_burn_seconds: 0,
            remaining_seconds: i64::MAX,
            unlimited: true,
            per_instance: Vec::new(),
        }
    }

    /// Opening balance of the current period
    pub fn total_credit_seconds(&self) -> i64 {
        self.window.credit_seconds
    }

    pub fn is_over_allocation(&self) -> bool {
        !self.unlimited && self.remaining_seconds < 0
    }

    pub fn total_burn_hours(&self) -> f64 {
        self.total_burn_seconds as f64 / 3_600.0
    }

    pub fn instance(&self, instance_id: &str) -> Option<&InstanceResult> {
        self.per_instance.iter().find(|i| i.instance_id == instance_id)
    }
}
