//! Strategy definitions loaded from JSON
//!
//! ```json
//! {
//!   "name": "workshop",
//!   "rules": [
//!     { "rule": "ignore_status", "statuses": ["suspended", "shelved"] },
//!     { "rule": "multiply_size_cpu" }
//!   ],
//!   "counting": { "type": "fixed_window", "period": "week" },
//!   "refresh": "recurring_refresh"
//! }
//! ```
//!
//! Required rule parameters are optional in the document so that a missing
//! one is reported as `UnknownRuleConfiguration` rather than a parse error.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::behavior::{CountingBehavior, RefreshBehavior};
use crate::error::{AllocationError, Result};
use crate::rules::{
    CarryForwardTime, IgnoreMachineRule, IgnoreProviderRule, IgnoreStatusRule, MultiplyBurnTime,
    MultiplySizeCpu, MultiplySizeDisk, MultiplySizeRam, Rule,
};
use crate::strategy::Strategy;
use crate::types::InstanceStatus;

/// One rule of a strategy document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum RuleConfig {
    CarryForwardTime,
    IgnoreStatus {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        statuses: Option<Vec<String>>,
    },
    IgnoreNonActiveStatus,
    IgnoreMachine {
        #[serde(default)]
        machines: Option<Vec<String>>,
    },
    IgnoreProvider {
        #[serde(default)]
        providers: Option<Vec<String>>,
    },
    MultiplyBurnTime {
        #[serde(default)]
        factor: Option<f64>,
    },
    MultiplySizeCpu,
    MultiplySizeDisk,
    MultiplySizeRam,
}

fn required<T>(value: Option<T>, rule: &str, field: &str) -> Result<T> {
    value.ok_or_else(|| AllocationError::rule_config(rule, format!("missing '{}'", field)))
}

impl RuleConfig {
    pub fn build(&self) -> Result<Arc<dyn Rule>> {
        let rule: Arc<dyn Rule> = match self {
            RuleConfig::CarryForwardTime => Arc::new(CarryForwardTime),
            RuleConfig::IgnoreStatus { name, statuses } => {
                let tokens = required(statuses.as_ref(), "IgnoreStatusRule", "statuses")?;
                let statuses = tokens
                    .iter()
                    .map(|token| {
                        InstanceStatus::from_token(token).ok_or_else(|| {
                            AllocationError::rule_config(
                                "IgnoreStatusRule",
                                format!("unknown status '{}'", token),
                            )
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                let name = name.clone().unwrap_or_else(|| "IgnoreStatusRule".to_string());
                Arc::new(IgnoreStatusRule::new(name, statuses))
            }
            RuleConfig::IgnoreNonActiveStatus => Arc::new(IgnoreStatusRule::non_active()),
            RuleConfig::IgnoreMachine { machines } => {
                let machines = required(machines.as_ref(), "IgnoreMachineRule", "machines")?;
                Arc::new(IgnoreMachineRule::new(machines.iter().cloned()))
            }
            RuleConfig::IgnoreProvider { providers } => {
                let providers = required(providers.as_ref(), "IgnoreProviderRule", "providers")?;
                Arc::new(IgnoreProviderRule::new(providers.iter().cloned()))
            }
            RuleConfig::MultiplyBurnTime { factor } => {
                let factor = required(*factor, "MultiplyBurnTime", "factor")?;
                Arc::new(MultiplyBurnTime::new(factor)?)
            }
            RuleConfig::MultiplySizeCpu => Arc::new(MultiplySizeCpu),
            RuleConfig::MultiplySizeDisk => Arc::new(MultiplySizeDisk),
            RuleConfig::MultiplySizeRam => Arc::new(MultiplySizeRam),
        };
        Ok(rule)
    }
}

/// A complete strategy document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    pub counting: CountingBehavior,
    pub refresh: RefreshBehavior,
}

impl StrategyConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        if config.name.trim().is_empty() {
            return Err(AllocationError::config("strategy name must not be empty"));
        }
        Ok(config)
    }

    pub fn build(&self) -> Result<Strategy> {
        let rules = self
            .rules
            .iter()
            .map(RuleConfig::build)
            .collect::<Result<Vec<_>>>()?;
        self.counting.validate()?;
        Ok(Strategy::new(self.name.clone(), rules, self.counting, self.refresh))
    }
}
