//! Scenario files
//!
//! A scenario bundles the allocations to evaluate with their histories and a
//! shared query window. Each job may name a preset, carry an inline strategy
//! document, or leave the choice to the owning user's profile.

use std::path::Path;
use std::sync::Arc;

use allocation_core::batch::AllocationJob;
use allocation_core::{
    Allocation, InstanceHistory, RulePresets, Strategy, StrategyConfig, UserProfile,
};
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub query_start: DateTime<Utc>,
    pub query_end: DateTime<Utc>,
    pub jobs: Vec<ScenarioJob>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioJob {
    pub allocation: Allocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategyChoice>,
    #[serde(default)]
    pub histories: Vec<InstanceHistory>,
}

/// Preset name or inline strategy document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StrategyChoice {
    Preset(String),
    Inline(StrategyConfig),
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse scenario {}", path.display()))
    }

    /// Histories across every job
    pub fn history_count(&self) -> usize {
        self.jobs.iter().map(|j| j.histories.len()).sum()
    }

    /// Resolve every job's strategy and turn the scenario into batch jobs
    pub fn into_jobs(self, presets: &RulePresets) -> Result<Vec<AllocationJob>> {
        let (query_start, query_end) = (self.query_start, self.query_end);
        self.jobs
            .into_iter()
            .map(|job| {
                let strategy = resolve_strategy(&job, presets, query_end)
                    .with_context(|| format!("Allocation {}", job.allocation.id))?;
                Ok(AllocationJob::new(
                    job.allocation,
                    strategy,
                    job.histories,
                    query_start,
                    query_end,
                ))
            })
            .collect()
    }
}

/// Explicit choice first, then the user's preset, then `GlobalRules`
fn resolve_strategy(
    job: &ScenarioJob,
    presets: &RulePresets,
    as_of: DateTime<Utc>,
) -> Result<Arc<Strategy>> {
    match (&job.strategy, &job.user) {
        (Some(StrategyChoice::Preset(name)), _) => match presets.by_name(name) {
            Some(strategy) => Ok(Arc::clone(strategy)),
            None => bail!("Unknown strategy preset '{}'", name),
        },
        (Some(StrategyChoice::Inline(config)), _) => Ok(Arc::new(config.build()?)),
        (None, Some(user)) => Ok(Arc::clone(presets.for_user(user, as_of))),
        (None, None) => Ok(Arc::clone(&presets.global)),
    }
}
