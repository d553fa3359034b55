//! Allocation strategies
//!
//! A [`Strategy`] glues an ordered rule pipeline to a counting and a refresh
//! behavior and exposes a single entry point, [`Strategy::calculate`].
//!
//! ## Calculation
//!
//! 1. Validate the query window and every history record (all-or-nothing)
//! 2. Short-circuit allocations with an unlimited grant
//! 3. Lay out accounting periods (counting behavior, split at recharges)
//! 4. Per period: clip histories, run global rules, then per instance run
//!    filter rules and counting rules
//! 5. Book each period's burn against the balance the refresh behavior
//!    opens it with
//!
//! ## Presets
//!
//! `GlobalRules`, `NewUserRules` and `StaffRules` are fixed rule sequences,
//! built once and handed out by reference through [`RulePresets`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::behavior::{CountingBehavior, PeriodBoundary, RefreshBehavior, TimeWindow};
use crate::error::{AllocationError, IntervalFault, Result};
use crate::results::{AllocationResult, InstanceResult, TimePeriodResult};
use crate::rules::{
    CarryForwardTime, Charge, IgnoreStatusRule, MultiplySizeCpu, Rule, RuleContext,
};
use crate::types::{Allocation, InstanceHistory, InstanceStatus, TimeAmount, UserProfile};

/// Named rule pipeline with its counting and refresh policy
#[derive(Debug, Clone)]
pub struct Strategy {
    name: String,
    rules: Vec<Arc<dyn Rule>>,
    counting: CountingBehavior,
    refresh: RefreshBehavior,
}

/// Printable description of a strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySummary {
    pub name: String,
    pub rules: Vec<String>,
    pub counting: CountingBehavior,
    pub refresh: RefreshBehavior,
}

impl Strategy {
    /// Create a strategy.
    ///
    /// Rules are ordered by stage (global, filter, counting); the given
    /// order is kept inside each stage.
    pub fn new(
        name: impl Into<String>,
        mut rules: Vec<Arc<dyn Rule>>,
        counting: CountingBehavior,
        refresh: RefreshBehavior,
    ) -> Self {
        rules.sort_by_key(|r| r.stage());
        Self {
            name: name.into(),
            rules,
            counting,
            refresh,
        }
    }

    /// Non-active time is free, active time is charged per CPU, the budget
    /// resets on the 1st of every month
    pub fn global_rules() -> Self {
        Self::new(
            "GlobalRules",
            vec![Arc::new(IgnoreStatusRule::non_active()), Arc::new(MultiplySizeCpu)],
            CountingBehavior::monthly(),
            RefreshBehavior::RecurringRefresh,
        )
    }

    /// Pay-down allocation counted from the allocation start, granted once
    pub fn new_user_rules() -> Self {
        Self::new(
            "NewUserRules",
            vec![
                Arc::new(CarryForwardTime),
                Arc::new(IgnoreStatusRule::non_active()),
                Arc::new(MultiplySizeCpu),
            ],
            CountingBehavior::FixedStartSlidingWindow { start: None },
            RefreshBehavior::OneTimeRefresh,
        )
    }

    /// Trailing 30-day burn of active wall-clock time
    pub fn staff_rules() -> Self {
        Self::new(
            "StaffRules",
            vec![Arc::new(IgnoreStatusRule::non_active())],
            CountingBehavior::FixedEndSlidingWindow {
                span: TimeAmount::days(30.0),
            },
            RefreshBehavior::RecurringRefresh,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rules(&self) -> &[Arc<dyn Rule>] {
        &self.rules
    }

    pub fn counting(&self) -> CountingBehavior {
        self.counting
    }

    pub fn refresh(&self) -> RefreshBehavior {
        self.refresh
    }

    pub fn summary(&self) -> StrategySummary {
        StrategySummary {
            name: self.name.clone(),
            rules: self.rules.iter().map(|r| r.name().to_string()).collect(),
            counting: self.counting,
            refresh: self.refresh,
        }
    }

    /// Whether unused credit rolls into the next period
    fn rollover(&self) -> bool {
        self.rules.iter().any(|r| r.carries_forward())
    }

    /// Where a fixed-start window opens when it has no explicit start
    pub fn anchor(&self, allocation: &Allocation, evaluated_at: DateTime<Utc>) -> DateTime<Utc> {
        allocation
            .recharges()
            .map(|r| r.date)
            .filter(|d| *d <= evaluated_at)
            .fold(allocation.start_date, |latest, date| latest.max(date))
    }

    /// Window in effect for `allocation` at `evaluated_at`
    pub fn window_for(
        &self,
        allocation: &Allocation,
        evaluated_at: DateTime<Utc>,
    ) -> Result<TimeWindow> {
        self.counting
            .window_for(evaluated_at, self.anchor(allocation, evaluated_at))
    }

    /// Compute burn and remaining credit of `allocation` over
    /// `[query_start, query_end)`.
    ///
    /// Open history intervals are closed at `query_end`.
    pub fn calculate(
        &self,
        allocation: &Allocation,
        histories: &[InstanceHistory],
        query_start: DateTime<Utc>,
        query_end: DateTime<Utc>,
    ) -> Result<AllocationResult> {
        self.calculate_until(allocation, histories, query_start, query_end, &|| false)
    }

    /// [`calculate`](Self::calculate) that gives up with `Cancelled` once
    /// `stop` returns true.
    ///
    /// `stop` is polled before every period and every instance.
    pub fn calculate_until(
        &self,
        allocation: &Allocation,
        histories: &[InstanceHistory],
        query_start: DateTime<Utc>,
        query_end: DateTime<Utc>,
        stop: &dyn Fn() -> bool,
    ) -> Result<AllocationResult> {
        if query_end < query_start {
            return Err(AllocationError::InvalidWindow {
                start: query_start,
                end: query_end,
            });
        }
        let query = TimeWindow::new(query_start, query_end);
        self.counting.validate()?;
        allocation.validate()?;
        let statuses = validate_histories(histories)?;
        let instance_order = instance_order(histories);

        debug!(
            allocation = %allocation.id,
            strategy = %self.name,
            query = %query,
            instances = instance_order.len(),
            histories = histories.len(),
            "Evaluating allocation"
        );

        if allocation.is_unlimited_at(query.end) {
            debug!(allocation = %allocation.id, "Unlimited allocation, skipping accounting");
            return Ok(AllocationResult::unlimited(&allocation.id, &self.name, query));
        }

        let nominal = allocation.nominal_seconds();
        let rollover = self.rollover();
        let mut balance: Option<i64> = None;
        let mut time_periods = Vec::new();

        for (idx, (window, boundary)) in self.periods(allocation, query)?.into_iter().enumerate() {
            if stop() {
                return Err(AllocationError::Cancelled);
            }
            let opening = match (boundary, balance) {
                (PeriodBoundary::Recharge(amount), None) => amount,
                (_, None) => self.refresh.opening_balance(allocation, window.start),
                (boundary, Some(previous)) => {
                    self.refresh.balance_after(boundary, nominal, previous, rollover)
                }
            };
            let credit = allocation
                .increases()
                .filter(|i| window.contains(i.date))
                .fold(opening, |total, i| total.saturating_add(i.amount.to_seconds()));

            let ctx = RuleContext {
                window,
                query,
                opening: idx == 0,
            };
            let instances =
                self.evaluate_period(histories, &statuses, &instance_order, &ctx, stop)?;
            let period = TimePeriodResult::new(window, credit, instances);

            trace!(
                allocation = %allocation.id,
                window = %window,
                credit = period.credit_seconds,
                burn = period.burn_seconds,
                "Period booked"
            );
            balance = Some(period.remaining_seconds);
            time_periods.push(period);
        }

        let result = AllocationResult::from_periods(
            &allocation.id,
            &self.name,
            query,
            time_periods,
            &instance_order,
        );
        if result.is_over_allocation() {
            warn!(
                allocation = %allocation.id,
                remaining = result.remaining_seconds,
                "Allocation is over its budget"
            );
        }
        debug!(
            allocation = %allocation.id,
            burn = result.total_burn_seconds,
            remaining = result.remaining_seconds,
            periods = result.time_periods.len(),
            "Allocation evaluated"
        );
        Ok(result)
    }

    /// Counting periods, further split at recharges inside the query
    fn periods(
        &self,
        allocation: &Allocation,
        query: TimeWindow,
    ) -> Result<Vec<(TimeWindow, PeriodBoundary)>> {
        let anchor = self.anchor(allocation, query.end);
        // Later entries win when two recharges share a date. A recharge at
        // the query start opens the first period even when the query is empty.
        let recharges: BTreeMap<DateTime<Utc>, i64> = allocation
            .recharges()
            .filter(|r| query.contains(r.date) || r.date == query.start)
            .map(|r| (r.date, r.amount.to_seconds()))
            .collect();

        let mut periods = Vec::new();
        for (idx, window) in self.counting.periods(query, anchor)?.into_iter().enumerate() {
            let mut start = window.start;
            let mut boundary = match recharges.get(&start) {
                Some(amount) => PeriodBoundary::Recharge(*amount),
                None if idx == 0 => PeriodBoundary::Opening,
                None => PeriodBoundary::Counting,
            };
            for (date, amount) in recharges.range(window.start..window.end) {
                if *date == window.start {
                    continue;
                }
                periods.push((TimeWindow::new(start, *date), boundary));
                start = *date;
                boundary = PeriodBoundary::Recharge(*amount);
            }
            periods.push((TimeWindow::new(start, window.end), boundary));
        }
        Ok(periods)
    }

    fn evaluate_period(
        &self,
        histories: &[InstanceHistory],
        statuses: &[InstanceStatus],
        instance_order: &[&str],
        ctx: &RuleContext,
        stop: &dyn Fn() -> bool,
    ) -> Result<Vec<InstanceResult>> {
        let mut charges: Vec<Charge<'_>> = histories
            .iter()
            .zip(statuses)
            .filter_map(|(history, status)| {
                ctx.window
                    .clip(history.start, history.end_or(ctx.query.end))
                    .map(|counted| Charge::new(history, *status, counted))
            })
            .collect();
        let present: HashSet<&str> = charges.iter().map(|c| c.instance_id()).collect();

        for rule in self.rules.iter().filter(|r| r.stage().is_global()) {
            charges = rule.apply(charges, ctx)?;
        }

        let mut by_instance: HashMap<&str, Vec<Charge<'_>>> = HashMap::new();
        for charge in charges {
            by_instance.entry(charge.instance_id()).or_default().push(charge);
        }

        let mut results = Vec::with_capacity(present.len());
        for id in instance_order.iter().filter(|id| present.contains(**id)) {
            if stop() {
                return Err(AllocationError::Cancelled);
            }
            let mut instance_charges = by_instance.remove(*id).unwrap_or_default();
            for rule in self.rules.iter().filter(|r| !r.stage().is_global()) {
                instance_charges = rule.apply(instance_charges, ctx)?;
            }
            results.push(InstanceResult::from_charges(*id, &instance_charges));
        }
        Ok(results)
    }
}

/// Parse every status and check interval ordering per instance
fn validate_histories(histories: &[InstanceHistory]) -> Result<Vec<InstanceStatus>> {
    let mut previous: HashMap<&str, &InstanceHistory> = HashMap::new();
    histories
        .iter()
        .map(|history| {
            let status = InstanceStatus::from_token(&history.status).ok_or_else(|| {
                AllocationError::unknown_status(&history.instance_id, &history.status)
            })?;
            let invalid = |fault| AllocationError::InvalidInterval {
                instance_id: history.instance_id.clone(),
                start: history.start,
                fault,
            };
            if history.end.is_some_and(|end| end < history.start) {
                return Err(invalid(IntervalFault::EndsBeforeStart));
            }
            if let Some(prev) = previous.insert(history.instance_id.as_str(), history) {
                match prev.end {
                    None => return Err(invalid(IntervalFault::AfterOpenInterval)),
                    Some(prev_end) if history.start < prev_end => {
                        return Err(invalid(IntervalFault::Overlaps));
                    }
                    Some(_) => {}
                }
            }
            Ok(status)
        })
        .collect()
}

/// Instance ids in order of first appearance
fn instance_order(histories: &[InstanceHistory]) -> Vec<&str> {
    let mut seen = HashSet::new();
    histories
        .iter()
        .map(|h| h.instance_id.as_str())
        .filter(|id| seen.insert(*id))
        .collect()
}

/// The named presets, built once and shared
#[derive(Debug, Clone)]
pub struct RulePresets {
    pub global: Arc<Strategy>,
    pub new_user: Arc<Strategy>,
    pub staff: Arc<Strategy>,
    new_user_period: TimeDelta,
}

impl Default for RulePresets {
    fn default() -> Self {
        Self::with_period(TimeDelta::days(30))
    }
}

impl RulePresets {
    /// Users who joined less than `new_user_period` ago get `NewUserRules`
    pub fn new(new_user_period: TimeAmount) -> Result<Self> {
        let seconds = new_user_period.validated_seconds("new-user period")?;
        let period = TimeDelta::try_seconds(seconds).ok_or_else(|| {
            AllocationError::config(format!("new-user period {} is out of range", new_user_period))
        })?;
        Ok(Self::with_period(period))
    }

    fn with_period(new_user_period: TimeDelta) -> Self {
        Self {
            global: Arc::new(Strategy::global_rules()),
            new_user: Arc::new(Strategy::new_user_rules()),
            staff: Arc::new(Strategy::staff_rules()),
            new_user_period,
        }
    }

    /// Pick the preset that applies to `user` at `as_of`
    pub fn for_user(&self, user: &UserProfile, as_of: DateTime<Utc>) -> &Arc<Strategy> {
        if user.is_staff {
            return &self.staff;
        }
        let new_user_since = as_of
            .checked_sub_signed(self.new_user_period)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        if user.date_joined > new_user_since {
            &self.new_user
        } else {
            &self.global
        }
    }

    /// Look a preset up by name (`GlobalRules` or `global`, and so on)
    pub fn by_name(&self, name: &str) -> Option<&Arc<Strategy>> {
        match name.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "global" | "globalrules" => Some(&self.global),
            "newuser" | "newuserrules" => Some(&self.new_user),
            "staff" | "staffrules" => Some(&self.staff),
            _ => None,
        }
    }

    pub fn all(&self) -> [&Arc<Strategy>; 3] {
        [&self.global, &self.new_user, &self.staff]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{IgnoreProviderRule, MultiplyBurnTime};
    use crate::types::{
        AllocationIncrease, AllocationRecharge, AllocationUnlimited, Credit, Instance, Machine,
        Provider, Size, TimeUnit,
    };
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn instance(id: &str, cpu: u32) -> Instance {
        Instance::new(
            id,
            Provider::new("p-1", "openstack"),
            Machine::new("m-1", "ubuntu-20.04"),
            Size::new(format!("cpu{}", cpu), cpu, 4096, 20),
        )
    }

    fn allocation(hours: f64) -> Allocation {
        Allocation::new("alloc-1", at(2020, 6, 1, 0), TimeAmount::hours(hours))
    }

    #[test]
    fn test_rules_sorted_by_stage() {
        let strategy = Strategy::new(
            "mixed",
            vec![
                Arc::new(MultiplySizeCpu),
                Arc::new(IgnoreStatusRule::non_active()),
                Arc::new(CarryForwardTime),
                Arc::new(MultiplyBurnTime::new(2.0).unwrap()),
                Arc::new(IgnoreProviderRule::new(["p-9"])),
            ],
            CountingBehavior::monthly(),
            RefreshBehavior::RecurringRefresh,
        );

        assert_eq!(
            strategy.summary().rules,
            vec![
                "CarryForwardTime",
                "IgnoreNonActiveStatus",
                "IgnoreProviderRule",
                "MultiplySizeCPU",
                "MultiplyBurnTime",
            ]
        );
    }

    #[test]
    fn test_plain_sum_without_rules() {
        let strategy = Strategy::new(
            "plain",
            Vec::new(),
            CountingBehavior::monthly(),
            RefreshBehavior::RecurringRefresh,
        );
        let a = instance("a", 4);
        let b = instance("b", 1);
        let histories = vec![
            a.history("active", at(2021, 1, 1, 0), Some(at(2021, 1, 1, 3))),
            b.history("suspended", at(2021, 1, 2, 0), Some(at(2021, 1, 2, 1))),
            a.history("active", at(2021, 1, 1, 5), Some(at(2021, 1, 1, 6))),
            // Clipped at the query end
            b.history("active", at(2021, 1, 31, 23), None),
        ];

        let result = strategy
            .calculate(&allocation(100.0), &histories, at(2021, 1, 1, 0), at(2021, 2, 1, 0))
            .unwrap();

        assert_eq!(result.total_burn_seconds, (3 + 1 + 1 + 1) * 3_600);
        assert_eq!(result.instance("a").unwrap().burn_seconds, 4 * 3_600);
        assert_eq!(result.instance("b").unwrap().burn_seconds, 2 * 3_600);
    }

    #[test]
    fn test_recurring_refresh_resets_at_boundary() {
        let a = instance("a", 1);
        let histories = vec![a.history("active", at(2021, 1, 10, 0), Some(at(2021, 1, 10, 4)))];

        let result = Strategy::global_rules()
            .calculate(&allocation(10.0), &histories, at(2021, 1, 1, 0), at(2021, 3, 1, 0))
            .unwrap();

        assert_eq!(result.time_periods.len(), 2);
        assert_eq!(result.time_periods[0].remaining_seconds, 6 * 3_600);
        assert_eq!(result.time_periods[1].credit_seconds, 10 * 3_600);
        assert_eq!(result.remaining_seconds, 10 * 3_600);
        assert_eq!(result.total_burn_seconds, 4 * 3_600);
    }

    #[test]
    fn test_recurring_with_carry_forward_rolls_over() {
        let strategy = Strategy::new(
            "rollover",
            vec![Arc::new(CarryForwardTime)],
            CountingBehavior::monthly(),
            RefreshBehavior::RecurringRefresh,
        );
        let a = instance("a", 1);
        let histories = vec![a.history("active", at(2021, 1, 10, 0), Some(at(2021, 1, 10, 4)))];

        let result = strategy
            .calculate(&allocation(10.0), &histories, at(2021, 1, 1, 0), at(2021, 3, 1, 0))
            .unwrap();

        assert_eq!(result.time_periods[1].credit_seconds, 16 * 3_600);
        assert_eq!(result.remaining_seconds, 16 * 3_600);
    }

    #[test]
    fn test_one_time_refresh_keeps_running_balance() {
        let strategy = Strategy::new(
            "paydown",
            Vec::new(),
            CountingBehavior::monthly(),
            RefreshBehavior::OneTimeRefresh,
        );
        let a = instance("a", 1);
        let histories = vec![
            a.history("active", at(2021, 1, 10, 0), Some(at(2021, 1, 10, 4))),
            a.history("active", at(2021, 2, 10, 0), Some(at(2021, 2, 10, 4))),
        ];

        let result = strategy
            .calculate(&allocation(10.0), &histories, at(2021, 1, 1, 0), at(2021, 3, 1, 0))
            .unwrap();

        assert_eq!(result.remaining_seconds, 2 * 3_600);
    }

    #[test]
    fn test_carry_forward_is_not_double_counted() {
        let strategy = Strategy::new(
            "carry",
            vec![Arc::new(CarryForwardTime)],
            CountingBehavior::monthly(),
            RefreshBehavior::OneTimeRefresh,
        );
        let a = instance("a", 1);
        let histories = vec![a.history("active", at(2021, 1, 31, 23), Some(at(2021, 2, 1, 1)))];

        let result = strategy
            .calculate(&allocation(10.0), &histories, at(2021, 1, 1, 0), at(2021, 3, 1, 0))
            .unwrap();

        assert_eq!(result.total_burn_seconds, 2 * 3_600);
        assert_eq!(result.time_periods[0].burn_seconds, 3_600);
        assert_eq!(result.time_periods[1].burn_seconds, 3_600);
    }

    #[test]
    fn test_increase_and_recharge_inside_query() {
        let strategy = Strategy::new(
            "paydown",
            Vec::new(),
            CountingBehavior::FixedStartSlidingWindow {
                start: Some(at(2021, 1, 1, 0)),
            },
            RefreshBehavior::OneTimeRefresh,
        );
        let alloc = allocation(10.0)
            .with_credit(Credit::Increase(AllocationIncrease {
                name: "bonus".into(),
                amount: TimeAmount::hours(5.0),
                date: at(2021, 1, 5, 0),
            }))
            .with_credit(Credit::Recharge(AllocationRecharge {
                name: "renewal".into(),
                amount: TimeAmount::hours(20.0),
                date: at(2021, 1, 15, 0),
            }));
        let a = instance("a", 1);
        let histories = vec![
            a.history("active", at(2021, 1, 10, 0), Some(at(2021, 1, 10, 12))),
            a.history("active", at(2021, 1, 20, 0), Some(at(2021, 1, 20, 3))),
        ];

        let result = strategy
            .calculate(&alloc, &histories, at(2021, 1, 1, 0), at(2021, 2, 1, 0))
            .unwrap();

        assert_eq!(result.time_periods.len(), 2);
        assert_eq!(result.time_periods[0].credit_seconds, 15 * 3_600);
        assert_eq!(result.time_periods[0].remaining_seconds, 3 * 3_600);
        assert_eq!(result.time_periods[1].credit_seconds, 20 * 3_600);
        assert_eq!(result.remaining_seconds, 17 * 3_600);
    }

    #[test]
    fn test_unlimited_short_circuits() {
        let alloc = allocation(1.0).with_credit(Credit::Unlimited(AllocationUnlimited {
            name: "staff grant".into(),
            date: at(2020, 1, 1, 0),
        }));
        let a = instance("a", 64);
        let histories = vec![a.history("active", at(2021, 1, 1, 0), None)];

        let result = Strategy::global_rules()
            .calculate(&alloc, &histories, at(2021, 1, 1, 0), at(2021, 2, 1, 0))
            .unwrap();

        assert!(result.unlimited);
        assert_eq!(result.total_burn_seconds, 0);
        assert!(!result.is_over_allocation());
    }

    #[test]
    fn test_validation_errors() {
        let strategy = Strategy::global_rules();
        let alloc = allocation(10.0);
        let a = instance("a", 1);
        let (start, end) = (at(2021, 1, 1, 0), at(2021, 2, 1, 0));

        let backwards = vec![a.history("active", at(2021, 1, 2, 0), Some(at(2021, 1, 1, 0)))];
        assert!(matches!(
            strategy.calculate(&alloc, &backwards, start, end),
            Err(AllocationError::InvalidInterval {
                fault: IntervalFault::EndsBeforeStart,
                ..
            })
        ));

        let overlapping = vec![
            a.history("active", at(2021, 1, 1, 0), Some(at(2021, 1, 1, 5))),
            a.history("active", at(2021, 1, 1, 4), Some(at(2021, 1, 1, 6))),
        ];
        assert!(matches!(
            strategy.calculate(&alloc, &overlapping, start, end),
            Err(AllocationError::InvalidInterval {
                fault: IntervalFault::Overlaps,
                ..
            })
        ));

        let after_open = vec![
            a.history("active", at(2021, 1, 1, 0), None),
            a.history("suspended", at(2021, 1, 1, 4), Some(at(2021, 1, 1, 6))),
        ];
        assert!(matches!(
            strategy.calculate(&alloc, &after_open, start, end),
            Err(AllocationError::InvalidInterval {
                fault: IntervalFault::AfterOpenInterval,
                ..
            })
        ));

        // Outside the query window still fails: nothing is partially computed
        let unknown = vec![a.history("hibernating", at(2019, 1, 1, 0), Some(at(2019, 1, 2, 0)))];
        assert!(matches!(
            strategy.calculate(&alloc, &unknown, start, end),
            Err(AllocationError::UnknownStatus { .. })
        ));

        assert!(matches!(
            strategy.calculate(&alloc, &[], end, start),
            Err(AllocationError::InvalidWindow { .. })
        ));
    }

    #[test]
    fn test_zero_length_interval_is_valid() {
        let a = instance("a", 1);
        let histories = vec![a.history("active", at(2021, 1, 3, 0), Some(at(2021, 1, 3, 0)))];

        let result = Strategy::global_rules()
            .calculate(&allocation(10.0), &histories, at(2021, 1, 1, 0), at(2021, 2, 1, 0))
            .unwrap();

        assert_eq!(result.total_burn_seconds, 0);
        assert_eq!(result.per_instance.len(), 1);
    }

    #[test]
    fn test_new_user_window_opens_at_allocation_start() {
        let strategy = Strategy::new_user_rules();
        let alloc = Allocation::new("trial", at(2021, 1, 10, 0), TimeAmount::hours(10.0));
        let a = instance("a", 2);
        let histories = vec![
            a.history("active", at(2021, 1, 5, 0), Some(at(2021, 1, 6, 0))),
            a.history("active", at(2021, 1, 12, 0), Some(at(2021, 1, 12, 1))),
        ];

        let window = strategy.window_for(&alloc, at(2021, 1, 20, 0)).unwrap();
        assert_eq!(window, TimeWindow::new(at(2021, 1, 10, 0), at(2021, 1, 20, 0)));

        let result = strategy
            .calculate(&alloc, &histories, at(2021, 1, 1, 0), at(2021, 1, 20, 0))
            .unwrap();
        // Only the interval after the allocation start, times 2 cpu
        assert_eq!(result.total_burn_seconds, 2 * 3_600);
        assert_eq!(result.remaining_seconds, 8 * 3_600);
    }

    #[test]
    fn test_recharge_at_empty_query_start() {
        let alloc = allocation(10.0).with_credit(Credit::Recharge(AllocationRecharge {
            name: "renewal".into(),
            amount: TimeAmount::hours(20.0),
            date: at(2021, 1, 15, 0),
        }));

        let result = Strategy::global_rules()
            .calculate(&alloc, &[], at(2021, 1, 15, 0), at(2021, 1, 15, 0))
            .unwrap();

        assert_eq!(result.time_periods.len(), 1);
        assert_eq!(result.total_credit_seconds(), 20 * 3_600);
        assert_eq!(result.remaining_seconds, 20 * 3_600);
    }

    #[test]
    fn test_unusable_amounts_are_rejected() {
        let strategy = Strategy::global_rules();
        let (start, end) = (at(2021, 1, 1, 0), at(2021, 2, 1, 0));
        let bonus = |amount| {
            allocation(10.0).with_credit(Credit::Increase(AllocationIncrease {
                name: "bonus".into(),
                amount,
                date: at(2021, 1, 5, 0),
            }))
        };

        for alloc in [
            allocation(1e300),
            allocation(-4.0),
            bonus(TimeAmount::hours(f64::NAN)),
            bonus(TimeAmount::hours(1e300)),
        ] {
            let err = strategy.calculate(&alloc, &[], start, end).unwrap_err();
            assert!(matches!(err, AllocationError::Config(_)), "{:?}", err);
        }

        let huge_span = Strategy::new(
            "rolling",
            Vec::new(),
            CountingBehavior::FixedEndSlidingWindow {
                span: TimeAmount::new(1e12, TimeUnit::Year),
            },
            RefreshBehavior::RecurringRefresh,
        );
        let err = huge_span.calculate(&allocation(10.0), &[], start, end).unwrap_err();
        assert!(matches!(err, AllocationError::Config(_)), "{:?}", err);
    }

    #[test]
    fn test_stop_cancels_calculation() {
        let strategy = Strategy::global_rules();
        let histories = vec![
            instance("a", 1).history("active", at(2021, 1, 2, 0), Some(at(2021, 1, 2, 1))),
            instance("b", 1).history("active", at(2021, 1, 2, 0), Some(at(2021, 1, 2, 1))),
        ];
        let (start, end) = (at(2021, 1, 1, 0), at(2021, 2, 1, 0));

        let err = strategy
            .calculate_until(&allocation(10.0), &histories, start, end, &|| true)
            .unwrap_err();
        assert!(matches!(err, AllocationError::Cancelled));

        // Period, then instance a, then instance b
        let polls = std::cell::Cell::new(0);
        let stop = || {
            polls.set(polls.get() + 1);
            polls.get() > 2
        };
        let err = strategy
            .calculate_until(&allocation(10.0), &histories, start, end, &stop)
            .unwrap_err();
        assert!(matches!(err, AllocationError::Cancelled));
        assert_eq!(polls.get(), 3);
    }

    #[test]
    fn test_new_user_period_bounds() {
        for period in [
            TimeAmount::days(-1.0),
            TimeAmount::days(f64::INFINITY),
            TimeAmount::new(1e12, TimeUnit::Year),
        ] {
            assert!(matches!(
                RulePresets::new(period),
                Err(AllocationError::Config(_))
            ));
        }

        // Reaches past the earliest representable instant
        let presets = RulePresets::new(TimeAmount::new(1e6, TimeUnit::Year)).unwrap();
        let old_timer = UserProfile {
            username: "ada".into(),
            is_staff: false,
            date_joined: at(1970, 1, 1, 0),
        };
        assert_eq!(presets.for_user(&old_timer, at(2021, 1, 1, 0)).name(), "NewUserRules");
    }

    #[test]
    fn test_presets_for_user() {
        let presets = RulePresets::default();
        let now = at(2021, 3, 1, 0);
        let user = |is_staff, date_joined| UserProfile {
            username: "ada".into(),
            is_staff,
            date_joined,
        };

        assert_eq!(presets.for_user(&user(true, at(2021, 2, 27, 0)), now).name(), "StaffRules");
        assert_eq!(presets.for_user(&user(false, at(2021, 2, 20, 0)), now).name(), "NewUserRules");
        assert_eq!(presets.for_user(&user(false, at(2020, 2, 20, 0)), now).name(), "GlobalRules");

        assert_eq!(presets.by_name("new-user").unwrap().name(), "NewUserRules");
        assert_eq!(presets.by_name("StaffRules").unwrap().name(), "StaffRules");
        assert!(presets.by_name("vip").is_none());
    }
}
