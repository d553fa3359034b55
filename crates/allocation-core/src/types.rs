//! Input types for allocation calculations
//!
//! Everything here is plain data handed over by the persistence layer.
//! Nothing is mutated during a calculation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AllocationError, Result};

/// Longest span in seconds a `TimeAmount` may describe (chrono's `TimeDelta` limit)
pub const MAX_SECONDS: i64 = i64::MAX / 1_000;

/// Unit a compute-time amount is expressed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    /// 30 days
    Month,
    /// 365 days
    Year,
}

impl TimeUnit {
    /// Number of seconds in one unit
    pub const fn seconds(self) -> i64 {
        match self {
            TimeUnit::Second => 1,
            TimeUnit::Minute => 60,
            TimeUnit::Hour => 3_600,
            TimeUnit::Day => 86_400,
            TimeUnit::Week => 604_800,
            TimeUnit::Month => 2_592_000,
            TimeUnit::Year => 31_536_000,
        }
    }
}

impl std::fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TimeUnit::Second => "second",
            TimeUnit::Minute => "minute",
            TimeUnit::Hour => "hour",
            TimeUnit::Day => "day",
            TimeUnit::Week => "week",
            TimeUnit::Month => "month",
            TimeUnit::Year => "year",
        };
        write!(f, "{}", name)
    }
}

/// A quantity of compute time, e.g. `10 hour`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeAmount {
    pub amount: f64,
    pub unit: TimeUnit,
}

impl TimeAmount {
    pub fn new(amount: f64, unit: TimeUnit) -> Self {
        Self { amount, unit }
    }

    pub fn hours(amount: f64) -> Self {
        Self::new(amount, TimeUnit::Hour)
    }

    pub fn days(amount: f64) -> Self {
        Self::new(amount, TimeUnit::Day)
    }

    /// Whole seconds, rounded to the nearest second
    pub fn to_seconds(&self) -> i64 {
        (self.amount * self.unit.seconds() as f64).round() as i64
    }

    /// Whole seconds if the amount is finite, non-negative and no longer
    /// than [`MAX_SECONDS`]
    pub fn checked_seconds(&self) -> Option<i64> {
        let seconds = (self.amount * self.unit.seconds() as f64).round();
        (seconds.is_finite() && (0.0..=MAX_SECONDS as f64).contains(&seconds))
            .then_some(seconds as i64)
    }

    /// [`checked_seconds`](Self::checked_seconds) as a configuration error
    /// naming `what`
    pub fn validated_seconds(&self, what: &str) -> Result<i64> {
        self.checked_seconds().ok_or_else(|| {
            AllocationError::config(format!(
                "{} must be a non-negative amount of at most {} seconds, got {}",
                what, MAX_SECONDS, self
            ))
        })
    }
}

impl std::fmt::Display for TimeAmount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.amount, self.unit)
    }
}

/// Cloud backend an instance runs on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub name: String,
}

impl Provider {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Machine image an instance was launched from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Machine {
    pub id: String,
    pub name: String,
}

impl Machine {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Hardware flavor of an instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub id: String,
    pub name: String,
    pub cpu: u32,
    pub ram_mb: u64,
    pub disk_gb: u64,
}

impl Size {
    pub fn new(id: impl Into<String>, cpu: u32, ram_mb: u64, disk_gb: u64) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            cpu,
            ram_mb,
            disk_gb,
        }
    }

    pub fn ram_gb(&self) -> f64 {
        self.ram_mb as f64 / 1024.0
    }
}

/// Recognised instance status vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Active,
    Build,
    Networking,
    Deploying,
    Redeploy,
    DeployError,
    Suspended,
    Shutoff,
    Stopped,
    Paused,
    Shelved,
    ShelvedOffloaded,
    Error,
    Pending,
    Unknown,
    Deleted,
    Terminated,
}

impl InstanceStatus {
    /// Every canonical status
    pub const ALL: [InstanceStatus; 17] = [
        InstanceStatus::Active,
        InstanceStatus::Build,
        InstanceStatus::Networking,
        InstanceStatus::Deploying,
        InstanceStatus::Redeploy,
        InstanceStatus::DeployError,
        InstanceStatus::Suspended,
        InstanceStatus::Shutoff,
        InstanceStatus::Stopped,
        InstanceStatus::Paused,
        InstanceStatus::Shelved,
        InstanceStatus::ShelvedOffloaded,
        InstanceStatus::Error,
        InstanceStatus::Pending,
        InstanceStatus::Unknown,
        InstanceStatus::Deleted,
        InstanceStatus::Terminated,
    ];

    /// Parse a status token.
    ///
    /// Accepts the canonical names and the provider task names that map onto
    /// them (`spawning` is `build`, `suspending` is `suspended`, ...).
    /// Matching ignores case and surrounding whitespace.
    pub fn from_token(token: &str) -> Option<Self> {
        let token = token.trim().to_ascii_lowercase();
        let status = match token.as_str() {
            "active" => InstanceStatus::Active,
            "build" | "resuming" | "powering-on" | "initializing" | "scheduling" | "spawning" => {
                InstanceStatus::Build
            }
            "networking" => InstanceStatus::Networking,
            "deploying" | "running_boot_script" => InstanceStatus::Deploying,
            "redeploy" | "redeploying" => InstanceStatus::Redeploy,
            "deploy_error" | "boot_script_error" => InstanceStatus::DeployError,
            "suspended" | "suspending" | "shutting-down" => InstanceStatus::Suspended,
            "shutoff" => InstanceStatus::Shutoff,
            "stopped" => InstanceStatus::Stopped,
            "paused" => InstanceStatus::Paused,
            "shelved"
            | "shelving"
            | "shelving_image_uploading"
            | "shelving_image_pending_upload" => InstanceStatus::Shelved,
            "shelved_offloaded" => InstanceStatus::ShelvedOffloaded,
            "error" => InstanceStatus::Error,
            "pending" => InstanceStatus::Pending,
            "unknown" => InstanceStatus::Unknown,
            "deleted" => InstanceStatus::Deleted,
            "terminated" => InstanceStatus::Terminated,
            _ => return None,
        };
        Some(status)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Active => "active",
            InstanceStatus::Build => "build",
            InstanceStatus::Networking => "networking",
            InstanceStatus::Deploying => "deploying",
            InstanceStatus::Redeploy => "redeploy",
            InstanceStatus::DeployError => "deploy_error",
            InstanceStatus::Suspended => "suspended",
            InstanceStatus::Shutoff => "shutoff",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Paused => "paused",
            InstanceStatus::Shelved => "shelved",
            InstanceStatus::ShelvedOffloaded => "shelved_offloaded",
            InstanceStatus::Error => "error",
            InstanceStatus::Pending => "pending",
            InstanceStatus::Unknown => "unknown",
            InstanceStatus::Deleted => "deleted",
            InstanceStatus::Terminated => "terminated",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, InstanceStatus::Active)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A virtual machine and the resources it references
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub provider: Provider,
    pub machine: Machine,
    pub size: Option<Size>,
}

impl Instance {
    pub fn new(id: impl Into<String>, provider: Provider, machine: Machine, size: Size) -> Self {
        Self {
            id: id.into(),
            provider,
            machine,
            size: Some(size),
        }
    }

    /// Build a history record for this instance
    pub fn history(
        &self,
        status: impl Into<String>,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> InstanceHistory {
        InstanceHistory {
            instance_id: self.id.clone(),
            status: status.into(),
            start,
            end,
            size: self.size.clone(),
            machine: self.machine.clone(),
            provider: self.provider.clone(),
        }
    }
}

/// One status interval of one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceHistory {
    pub instance_id: String,
    /// Raw status token, checked against [`InstanceStatus`] during validation
    pub status: String,
    pub start: DateTime<Utc>,
    /// `None` while the instance is still in this status
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub size: Option<Size>,
    pub machine: Machine,
    pub provider: Provider,
}

impl InstanceHistory {
    /// End of the interval, closing an open interval at `evaluated_at`
    pub fn end_or(&self, evaluated_at: DateTime<Utc>) -> DateTime<Utc> {
        self.end.unwrap_or(evaluated_at)
    }

    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }
}

/// One-time addition to the budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationIncrease {
    pub name: String,
    pub amount: TimeAmount,
    pub date: DateTime<Utc>,
}

/// Resets the remaining budget to `amount` at `date`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRecharge {
    pub name: String,
    pub amount: TimeAmount,
    pub date: DateTime<Utc>,
}

/// Lifts every limit from `date` on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationUnlimited {
    pub name: String,
    pub date: DateTime<Utc>,
}

/// Adjustment to an allocation's budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credit {
    Increase(AllocationIncrease),
    Recharge(AllocationRecharge),
    Unlimited(AllocationUnlimited),
}

impl Credit {
    pub fn date(&self) -> DateTime<Utc> {
        match self {
            Credit::Increase(c) => c.date,
            Credit::Recharge(c) => c.date,
            Credit::Unlimited(c) => c.date,
        }
    }
}

/// A named compute-time budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: String,
    pub name: String,
    /// Creation date; sliding windows without an explicit start open here
    pub start_date: DateTime<Utc>,
    pub initial_credit: TimeAmount,
    #[serde(default)]
    pub credits: Vec<Credit>,
}

impl Allocation {
    pub fn new(
        id: impl Into<String>,
        start_date: DateTime<Utc>,
        initial_credit: TimeAmount,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            start_date,
            initial_credit,
            credits: Vec::new(),
        }
    }

    /// Check that every credit amount is a usable number of seconds
    pub fn validate(&self) -> Result<()> {
        self.initial_credit
            .validated_seconds(&format!("initial credit of allocation {}", self.id))?;
        for credit in &self.credits {
            let amount = match credit {
                Credit::Increase(c) => &c.amount,
                Credit::Recharge(c) => &c.amount,
                Credit::Unlimited(_) => continue,
            };
            amount.validated_seconds(&format!("credit of allocation {} dated {}", self.id, credit.date()))?;
        }
        Ok(())
    }

    pub fn with_credit(mut self, credit: Credit) -> Self {
        self.credits.push(credit);
        self
    }

    /// Nominal budget in seconds
    pub fn nominal_seconds(&self) -> i64 {
        self.initial_credit.to_seconds()
    }

    /// Whether an unlimited grant is in effect at `at`
    pub fn is_unlimited_at(&self, at: DateTime<Utc>) -> bool {
        self.credits
            .iter()
            .any(|c| matches!(c, Credit::Unlimited(u) if u.date <= at))
    }

    pub fn increases(&self) -> impl Iterator<Item = &AllocationIncrease> {
        self.credits.iter().filter_map(|c| match c {
            Credit::Increase(i) => Some(i),
            _ => None,
        })
    }

    pub fn recharges(&self) -> impl Iterator<Item = &AllocationRecharge> {
        self.credits.iter().filter_map(|c| match c {
            Credit::Recharge(r) => Some(r),
            _ => None,
        })
    }
}

/// Account attributes used to pick a strategy preset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub username: String,
    #[serde(default)]
    pub is_staff: bool,
    pub date_joined: DateTime<Utc>,
}
