//! Error types for the allocation engine

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Result type for allocation operations
pub type Result<T> = std::result::Result<T, AllocationError>;

/// Why a history interval was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalFault {
    /// `end` is earlier than `start`
    EndsBeforeStart,
    /// Starts before the previous interval of the same instance ended
    Overlaps,
    /// Follows an interval that is still open
    AfterOpenInterval,
}

impl std::fmt::Display for IntervalFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntervalFault::EndsBeforeStart => write!(f, "ends before it starts"),
            IntervalFault::Overlaps => write!(f, "overlaps the previous interval"),
            IntervalFault::AfterOpenInterval => write!(f, "follows an interval that never ended"),
        }
    }
}

/// Core error type for allocation calculations
#[derive(Error, Debug)]
pub enum AllocationError {
    /// Malformed history interval
    #[error("Invalid interval for instance {instance_id} starting {start}: {fault}")]
    InvalidInterval {
        instance_id: String,
        start: DateTime<Utc>,
        fault: IntervalFault,
    },

    /// Query window that ends before it starts
    #[error("Invalid query window: {end} is before {start}")]
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    /// Status token outside the recognised vocabulary
    #[error("Unknown status '{status}' for instance {instance_id}")]
    UnknownStatus { instance_id: String, status: String },

    /// A rule is missing a parameter it needs
    #[error("Rule {rule} is misconfigured: {reason}")]
    UnknownRuleConfiguration { rule: String, reason: String },

    /// Malformed strategy or scenario document
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Evaluation did not finish inside its wall-clock budget
    #[error("Evaluation timed out after {0:?}")]
    Timeout(Duration),

    /// Evaluation was told to stop before it finished
    #[error("Evaluation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AllocationError {
    /// Create a rule configuration error
    pub fn rule_config(rule: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnknownRuleConfiguration {
            rule: rule.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an unknown status error
    pub fn unknown_status(instance_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self::UnknownStatus {
            instance_id: instance_id.into(),
            status: status.into(),
        }
    }
}
