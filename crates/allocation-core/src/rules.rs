//! Rules that shape burn time
//!
//! A rule takes the charges of one accounting period and returns them
//! filtered or re-weighted. Three stages exist:
//!
//! - **Global**: runs once over every instance's charges (`CarryForwardTime`)
//! - **Filter**: per instance, drops charges (`IgnoreStatusRule`,
//!   `IgnoreMachineRule`, `IgnoreProviderRule`)
//! - **Counting**: per instance, multiplies the burn rate of what is left
//!   (`MultiplyBurnTime`, `MultiplySizeCpu`, `MultiplySizeDisk`,
//!   `MultiplySizeRam`)
//!
//! Rules hold no mutable state. Ordering across stages is enforced by
//! [`Strategy`](crate::strategy::Strategy); within a stage the configured
//! order is kept. Several multipliers on one charge compose multiplicatively.

use std::collections::BTreeSet;

use chrono::{DateTime, TimeDelta, Utc};

use crate::behavior::TimeWindow;
use crate::error::{AllocationError, Result};
use crate::types::{InstanceHistory, InstanceStatus, Size};

/// Stage a rule runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RuleStage {
    /// Sees every instance at once
    Global,
    /// Per-instance, removes charges
    Filter,
    /// Per-instance, scales burn time
    Counting,
}

impl RuleStage {
    pub fn is_global(self) -> bool {
        matches!(self, RuleStage::Global)
    }
}

/// Where a rule is being applied
#[derive(Debug, Clone, Copy)]
pub struct RuleContext {
    /// Accounting period being evaluated
    pub window: TimeWindow,
    /// Whole range the caller asked about
    pub query: TimeWindow,
    /// First period of the evaluation
    pub opening: bool,
}

/// A history interval as it counts against the current period
#[derive(Debug, Clone)]
pub struct Charge<'h> {
    pub history: &'h InstanceHistory,
    pub status: InstanceStatus,
    /// Counted start, normally the history start clipped to the period
    pub start: DateTime<Utc>,
    /// Counted end
    pub end: DateTime<Utc>,
    pub burn_rate: f64,
    pub carried_forward: bool,
}

impl<'h> Charge<'h> {
    pub fn new(history: &'h InstanceHistory, status: InstanceStatus, counted: TimeWindow) -> Self {
        Self {
            history,
            status,
            start: counted.start,
            end: counted.end,
            burn_rate: 1.0,
            carried_forward: false,
        }
    }

    pub fn instance_id(&self) -> &'h str {
        &self.history.instance_id
    }

    /// Counted wall-clock seconds, any partial second rounded up
    pub fn clock_seconds(&self) -> i64 {
        ceil_seconds(self.end - self.start)
    }

    /// Clock seconds scaled by the burn rate, rounded up
    pub fn burn_seconds(&self) -> i64 {
        let raw = self.clock_seconds() as f64 * self.burn_rate;
        let nearest = raw.round();
        if (raw - nearest).abs() < 1e-6 {
            nearest as i64
        } else {
            raw.ceil() as i64
        }
    }
}

fn ceil_seconds(delta: TimeDelta) -> i64 {
    if delta <= TimeDelta::zero() {
        return 0;
    }
    let seconds = delta.num_seconds();
    if delta.subsec_nanos() > 0 {
        seconds + 1
    } else {
        seconds
    }
}

/// A transform over the charges of one period
pub trait Rule: std::fmt::Debug + Send + Sync {
    /// Rule name, as reported in logs and summaries
    fn name(&self) -> &str;

    fn stage(&self) -> RuleStage;

    /// Apply the rule.
    ///
    /// Global rules receive every charge of the period; instance rules
    /// receive one instance's charges at a time.
    fn apply<'h>(&self, charges: Vec<Charge<'h>>, ctx: &RuleContext) -> Result<Vec<Charge<'h>>>;

    /// Whether the rule carries time and credit across window boundaries
    fn carries_forward(&self) -> bool {
        false
    }
}

/// Instance rule that removes matching charges
pub trait FilterOutRule {
    fn excludes(&self, charge: &Charge<'_>) -> bool;
}

/// Instance counting rule that scales burn time
pub trait InstanceMultiplierRule {
    fn multiplier(&self, charge: &Charge<'_>) -> Result<f64>;
}

fn filter_out<'h, R: FilterOutRule + ?Sized>(rule: &R, charges: Vec<Charge<'h>>) -> Vec<Charge<'h>> {
    charges.into_iter().filter(|c| !rule.excludes(c)).collect()
}

fn multiply<'h, R: InstanceMultiplierRule + ?Sized>(
    rule: &R,
    mut charges: Vec<Charge<'h>>,
) -> Result<Vec<Charge<'h>>> {
    for charge in &mut charges {
        charge.burn_rate *= rule.multiplier(charge)?;
    }
    Ok(charges)
}

/// Charges the pre-window part of an interval that was already running
/// when the evaluation opened.
///
/// It also turns on rollover: unused credit of a period is added to the
/// next period's balance.
#[derive(Debug, Clone, Copy, Default)]
pub struct CarryForwardTime;

impl Rule for CarryForwardTime {
    fn name(&self) -> &str {
        "CarryForwardTime"
    }

    fn stage(&self) -> RuleStage {
        RuleStage::Global
    }

    fn apply<'h>(&self, mut charges: Vec<Charge<'h>>, ctx: &RuleContext) -> Result<Vec<Charge<'h>>> {
        // Later periods start where the previous one stopped counting
        if !ctx.opening {
            return Ok(charges);
        }
        for charge in &mut charges {
            if charge.history.start < ctx.window.start && charge.start == ctx.window.start {
                charge.start = charge.history.start;
                charge.carried_forward = true;
            }
        }
        Ok(charges)
    }

    fn carries_forward(&self) -> bool {
        true
    }
}

/// Drops charges whose status is in the exclude set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoreStatusRule {
    name: String,
    statuses: BTreeSet<InstanceStatus>,
}

impl IgnoreStatusRule {
    pub fn new(name: impl Into<String>, statuses: impl IntoIterator<Item = InstanceStatus>) -> Self {
        Self {
            name: name.into(),
            statuses: statuses.into_iter().collect(),
        }
    }

    /// Excludes every recognised status other than `active`
    pub fn non_active() -> Self {
        Self::new(
            "IgnoreNonActiveStatus",
            InstanceStatus::ALL.into_iter().filter(|s| !s.is_active()),
        )
    }

    pub fn statuses(&self) -> &BTreeSet<InstanceStatus> {
        &self.statuses
    }
}

impl FilterOutRule for IgnoreStatusRule {
    fn excludes(&self, charge: &Charge<'_>) -> bool {
        self.statuses.contains(&charge.status)
    }
}

impl Rule for IgnoreStatusRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn stage(&self) -> RuleStage {
        RuleStage::Filter
    }

    fn apply<'h>(&self, charges: Vec<Charge<'h>>, _ctx: &RuleContext) -> Result<Vec<Charge<'h>>> {
        Ok(filter_out(self, charges))
    }
}

/// Drops charges of instances launched from the listed machines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoreMachineRule {
    machine_ids: BTreeSet<String>,
}

impl IgnoreMachineRule {
    pub fn new<S: Into<String>>(machine_ids: impl IntoIterator<Item = S>) -> Self {
        Self {
            machine_ids: machine_ids.into_iter().map(Into::into).collect(),
        }
    }
}

impl FilterOutRule for IgnoreMachineRule {
    fn excludes(&self, charge: &Charge<'_>) -> bool {
        self.machine_ids.contains(&charge.history.machine.id)
    }
}

impl Rule for IgnoreMachineRule {
    fn name(&self) -> &str {
        "IgnoreMachineRule"
    }

    fn stage(&self) -> RuleStage {
        RuleStage::Filter
    }

    fn apply<'h>(&self, charges: Vec<Charge<'h>>, _ctx: &RuleContext) -> Result<Vec<Charge<'h>>> {
        Ok(filter_out(self, charges))
    }
}

/// Drops charges of instances on the listed providers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoreProviderRule {
    provider_ids: BTreeSet<String>,
}

impl IgnoreProviderRule {
    pub fn new<S: Into<String>>(provider_ids: impl IntoIterator<Item = S>) -> Self {
        Self {
            provider_ids: provider_ids.into_iter().map(Into::into).collect(),
        }
    }
}

impl FilterOutRule for IgnoreProviderRule {
    fn excludes(&self, charge: &Charge<'_>) -> bool {
        self.provider_ids.contains(&charge.history.provider.id)
    }
}

impl Rule for IgnoreProviderRule {
    fn name(&self) -> &str {
        "IgnoreProviderRule"
    }

    fn stage(&self) -> RuleStage {
        RuleStage::Filter
    }

    fn apply<'h>(&self, charges: Vec<Charge<'h>>, _ctx: &RuleContext) -> Result<Vec<Charge<'h>>> {
        Ok(filter_out(self, charges))
    }
}

/// Scales every charge by a flat factor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MultiplyBurnTime {
    factor: f64,
}

impl MultiplyBurnTime {
    pub fn new(factor: f64) -> Result<Self> {
        if !factor.is_finite() || factor < 0.0 {
            return Err(AllocationError::rule_config(
                "MultiplyBurnTime",
                format!("factor must be a non-negative number, got {}", factor),
            ));
        }
        Ok(Self { factor })
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }
}

impl InstanceMultiplierRule for MultiplyBurnTime {
    fn multiplier(&self, _charge: &Charge<'_>) -> Result<f64> {
        Ok(self.factor)
    }
}

impl Rule for MultiplyBurnTime {
    fn name(&self) -> &str {
        "MultiplyBurnTime"
    }

    fn stage(&self) -> RuleStage {
        RuleStage::Counting
    }

    fn apply<'h>(&self, charges: Vec<Charge<'h>>, _ctx: &RuleContext) -> Result<Vec<Charge<'h>>> {
        multiply(self, charges)
    }
}

fn size_of<'h>(rule: &str, charge: &Charge<'h>) -> Result<&'h Size> {
    charge.history.size.as_ref().ok_or_else(|| {
        AllocationError::rule_config(
            rule,
            format!("instance {} has no size to multiply by", charge.instance_id()),
        )
    })
}

/// Charges proportionally to CPU count
#[derive(Debug, Clone, Copy, Default)]
pub struct MultiplySizeCpu;

impl InstanceMultiplierRule for MultiplySizeCpu {
    fn multiplier(&self, charge: &Charge<'_>) -> Result<f64> {
        Ok(size_of(self.name(), charge)?.cpu as f64)
    }
}

impl Rule for MultiplySizeCpu {
    fn name(&self) -> &str {
        "MultiplySizeCPU"
    }

    fn stage(&self) -> RuleStage {
        RuleStage::Counting
    }

    fn apply<'h>(&self, charges: Vec<Charge<'h>>, _ctx: &RuleContext) -> Result<Vec<Charge<'h>>> {
        multiply(self, charges)
    }
}

/// Charges proportionally to disk size in GB
#[derive(Debug, Clone, Copy, Default)]
pub struct MultiplySizeDisk;

impl InstanceMultiplierRule for MultiplySizeDisk {
    fn multiplier(&self, charge: &Charge<'_>) -> Result<f64> {
        Ok(size_of(self.name(), charge)?.disk_gb as f64)
    }
}

impl Rule for MultiplySizeDisk {
    fn name(&self) -> &str {
        "MultiplySizeDisk"
    }

    fn stage(&self) -> RuleStage {
        RuleStage::Counting
    }

    fn apply<'h>(&self, charges: Vec<Charge<'h>>, _ctx: &RuleContext) -> Result<Vec<Charge<'h>>> {
        multiply(self, charges)
    }
}

/// Charges proportionally to RAM in GB
#[derive(Debug, Clone, Copy, Default)]
pub struct MultiplySizeRam;

impl InstanceMultiplierRule for MultiplySizeRam {
    fn multiplier(&self, charge: &Charge<'_>) -> Result<f64> {
        Ok(size_of(self.name(), charge)?.ram_gb())
    }
}

impl Rule for MultiplySizeRam {
    fn name(&self) -> &str {
        "MultiplySizeRAM"
    }

    fn stage(&self) -> RuleStage {
        RuleStage::Counting
    }

    fn apply<'h>(&self, charges: Vec<Charge<'h>>, _ctx: &RuleContext) -> Result<Vec<Charge<'h>>> {
        multiply(self, charges)
    }
}
