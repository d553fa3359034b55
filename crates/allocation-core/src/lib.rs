//! Allocation Core - Compute-time accounting for cloud allocations
//!
//! Turns instance status histories into consumed and remaining credit for an
//! allocation over a query window.
//!
//! Key types:
//! - `Strategy` (rule pipeline + counting behavior + refresh behavior)
//! - `Rule` trait and the built-in filter and multiplier rules
//! - `AllocationResult` with per-period and per-instance breakdowns
//! - `StrategyConfig` for strategies defined in JSON
//! - `batch::evaluate_all` (feature `async`) for many allocations at once

pub mod types;
pub mod error;
pub mod behavior;
pub mod rules;
pub mod results;
pub mod strategy;
pub mod config;
#[cfg(feature = "async")]
pub mod batch;

pub use types::*;
pub use error::*;
pub use behavior::{CalendarPeriod, CountingBehavior, RefreshBehavior, TimeWindow};
pub use rules::{Rule, RuleContext, RuleStage};
pub use results::*;
pub use strategy::{RulePresets, Strategy, StrategySummary};
pub use config::{RuleConfig, StrategyConfig};
