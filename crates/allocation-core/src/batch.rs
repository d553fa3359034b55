//! Concurrent evaluation of many allocations
//!
//! Each job runs on its own blocking task. Jobs share strategies through
//! `Arc`, so a preset is built once for the whole batch. Jobs that have not
//! finished when the budget runs out are reported as timed out and told to
//! stop; they give up at their next period or instance.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::error::{AllocationError, Result};
use crate::results::AllocationResult;
use crate::strategy::Strategy;
use crate::types::{Allocation, InstanceHistory};

/// One allocation to evaluate
#[derive(Debug, Clone)]
pub struct AllocationJob {
    pub allocation: Allocation,
    pub strategy: Arc<Strategy>,
    pub histories: Vec<InstanceHistory>,
    pub query_start: DateTime<Utc>,
    pub query_end: DateTime<Utc>,
}

impl AllocationJob {
    pub fn new(
        allocation: Allocation,
        strategy: Arc<Strategy>,
        histories: Vec<InstanceHistory>,
        query_start: DateTime<Utc>,
        query_end: DateTime<Utc>,
    ) -> Self {
        Self {
            allocation,
            strategy,
            histories,
            query_start,
            query_end,
        }
    }

    pub fn run(&self) -> Result<AllocationResult> {
        self.run_until(&|| false)
    }

    /// Run, giving up with `Cancelled` once `stop` returns true
    pub fn run_until(&self, stop: &dyn Fn() -> bool) -> Result<AllocationResult> {
        self.strategy.calculate_until(
            &self.allocation,
            &self.histories,
            self.query_start,
            self.query_end,
            stop,
        )
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "evaluation panicked".to_string()
    }
}

/// Evaluate `jobs` concurrently and collect the outcomes by allocation id.
///
/// A job whose allocation id was already submitted is skipped with a
/// warning; the first one wins.
pub async fn evaluate_all(
    jobs: Vec<AllocationJob>,
    budget: Duration,
) -> BTreeMap<String, Result<AllocationResult>> {
    let deadline = Instant::now() + budget;
    let stop = Arc::new(AtomicBool::new(false));
    let mut pending = BTreeSet::new();
    let mut set = JoinSet::new();

    for job in jobs {
        let id = job.allocation.id.clone();
        if !pending.insert(id.clone()) {
            warn!("Skipping duplicate job for allocation {}", id);
            continue;
        }
        let stop = Arc::clone(&stop);
        set.spawn_blocking(move || {
            let stopped = || stop.load(Ordering::Relaxed);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| job.run_until(&stopped)))
                .unwrap_or_else(|payload| Err(AllocationError::Internal(panic_message(payload))));
            (id, outcome)
        });
    }

    info!("Evaluating {} allocations (budget {:?})", pending.len(), budget);

    let mut results = BTreeMap::new();
    let mut expired = false;
    loop {
        match timeout_at(deadline, set.join_next()).await {
            Ok(Some(Ok((id, outcome)))) => {
                debug!("Allocation {} finished", id);
                pending.remove(&id);
                results.insert(id, outcome);
            }
            Ok(Some(Err(e))) => warn!("Evaluation task failed: {}", e),
            Ok(None) => break,
            Err(_) => {
                expired = true;
                break;
            }
        }
    }
    // Blocking tasks ignore abort; running jobs poll `stop` instead
    stop.store(true, Ordering::Relaxed);
    set.abort_all();

    if !pending.is_empty() {
        warn!("{} allocations did not finish", pending.len());
    }
    for id in pending {
        let error = if expired {
            AllocationError::Timeout(budget)
        } else {
            AllocationError::Internal(format!("evaluation of {} was lost", id))
        };
        results.insert(id, Err(error));
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::{CountingBehavior, RefreshBehavior};
    use crate::rules::{Charge, Rule, RuleContext, RuleStage};
    use crate::types::{Instance, Machine, Provider, Size, TimeAmount};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    /// Counting rule that takes its time over every instance
    #[derive(Debug)]
    struct Sluggish {
        calls: Arc<AtomicUsize>,
    }

    impl Rule for Sluggish {
        fn name(&self) -> &str {
            "Sluggish"
        }

        fn stage(&self) -> RuleStage {
            RuleStage::Counting
        }

        fn apply<'h>(
            &self,
            charges: Vec<Charge<'h>>,
            _ctx: &RuleContext,
        ) -> crate::error::Result<Vec<Charge<'h>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(100));
            Ok(charges)
        }
    }

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 1, d, h, 0, 0).unwrap()
    }

    fn job(id: &str, strategy: &Arc<Strategy>, hours: u32) -> AllocationJob {
        let instance = Instance::new(
            format!("{}-vm", id),
            Provider::new("p1", "Provider"),
            Machine::new("m1", "Ubuntu"),
            Size::new("tiny", 1, 1024, 10),
        );
        let histories = vec![instance.history("active", at(2, 0), Some(at(2, hours)))];
        AllocationJob::new(
            Allocation::new(id, at(1, 0), TimeAmount::hours(10.0)),
            Arc::clone(strategy),
            histories,
            at(1, 0),
            Utc.with_ymd_and_hms(2021, 2, 1, 0, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_evaluate_all_by_id() {
        let strategy = Arc::new(Strategy::global_rules());
        let jobs = vec![job("b", &strategy, 3), job("a", &strategy, 2)];

        let results = evaluate_all(jobs, Duration::from_secs(10)).await;

        let ids: Vec<&String> = results.keys().collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(results["a"].as_ref().unwrap().total_burn_seconds, 7_200);
        assert_eq!(results["b"].as_ref().unwrap().total_burn_seconds, 10_800);
    }

    #[tokio::test]
    async fn test_duplicate_ids_keep_first() {
        let strategy = Arc::new(Strategy::global_rules());
        let jobs = vec![job("a", &strategy, 1), job("a", &strategy, 5)];

        let results = evaluate_all(jobs, Duration::from_secs(10)).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results["a"].as_ref().unwrap().total_burn_seconds, 3_600);
    }

    #[tokio::test]
    async fn test_errors_are_per_job() {
        let strategy = Arc::new(Strategy::global_rules());
        let mut bad = job("bad", &strategy, 1);
        bad.query_end = at(1, 0) - chrono::TimeDelta::days(1);
        let jobs = vec![bad, job("good", &strategy, 1)];

        let results = evaluate_all(jobs, Duration::from_secs(10)).await;

        assert!(matches!(
            results["bad"],
            Err(AllocationError::InvalidWindow { .. })
        ));
        assert!(results["good"].is_ok());
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let results = evaluate_all(Vec::new(), Duration::from_millis(1)).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_deadline_stops_running_jobs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let strategy = Arc::new(Strategy::new(
            "sluggish",
            vec![Arc::new(Sluggish {
                calls: Arc::clone(&calls),
            })],
            CountingBehavior::monthly(),
            RefreshBehavior::RecurringRefresh,
        ));
        let mut slow = job("slow", &strategy, 1);
        slow.histories = (0..20)
            .map(|n| {
                Instance::new(
                    format!("vm-{}", n),
                    Provider::new("p1", "Provider"),
                    Machine::new("m1", "Ubuntu"),
                    Size::new("tiny", 1, 1024, 10),
                )
                .history("active", at(2, 0), Some(at(2, 1)))
            })
            .collect();

        let results = evaluate_all(vec![slow], Duration::from_millis(50)).await;
        let calls_at_deadline = calls.load(Ordering::SeqCst);

        assert!(matches!(results["slow"], Err(AllocationError::Timeout(_))));
        tokio::time::sleep(Duration::from_millis(400)).await;
        let calls_after = calls.load(Ordering::SeqCst);
        assert!(calls_after <= calls_at_deadline + 1, "{} -> {}", calls_at_deadline, calls_after);
        assert!(calls_after < 20);
    }
}
