//! Synthetic scenarios for trying strategies out
//!
//! Each instance walks through a chain of status intervals: mostly `active`,
//! with suspended, shelved and build spells in between. The last interval is
//! left open about half the time.

use allocation_core::{Allocation, Instance, InstanceHistory, Machine, Provider, Size, TimeAmount};
use chrono::{DateTime, TimeDelta, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::scenario::{Scenario, ScenarioJob};

const SIZES: [(&str, u32, u64, u64); 4] = [
    ("m1.tiny", 1, 2_048, 8),
    ("m1.small", 2, 4_096, 20),
    ("m1.medium", 6, 16_384, 60),
    ("m1.large", 10, 30_720, 60),
];

const IDLE_STATUSES: [&str; 3] = ["suspended", "shelved", "build"];

pub struct SynthParams {
    pub instances: usize,
    pub days: u32,
    pub budget_hours: f64,
    pub seed: u64,
    pub start: DateTime<Utc>,
}

/// Build a one-allocation scenario covering `[start, start + days)`
pub fn generate(params: &SynthParams) -> Scenario {
    let mut rng = StdRng::seed_from_u64(params.seed);
    let query_end = params.start + TimeDelta::days(i64::from(params.days));
    let provider = Provider::new("provider-1", "Jetstream");
    let machine = Machine::new("image-1", "Ubuntu 22.04");

    let mut histories = Vec::new();
    for n in 0..params.instances {
        let (name, cpu, ram_mb, disk_gb) = SIZES[rng.gen_range(0..SIZES.len())];
        let instance = Instance::new(
            format!("vm-{:03}", n),
            provider.clone(),
            machine.clone(),
            Size::new(name, cpu, ram_mb, disk_gb),
        );
        histories.extend(walk(&mut rng, &instance, params.start, query_end));
    }

    let allocation = Allocation::new(
        format!("synthetic-{}", params.seed),
        params.start,
        TimeAmount::hours(params.budget_hours),
    );

    Scenario {
        query_start: params.start,
        query_end,
        jobs: vec![ScenarioJob {
            allocation,
            user: None,
            strategy: None,
            histories,
        }],
    }
}

fn walk(
    rng: &mut StdRng,
    instance: &Instance,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<InstanceHistory> {
    let mut histories = Vec::new();
    let mut cursor = start + TimeDelta::minutes(rng.gen_range(0..24 * 60));

    while cursor < end {
        let status = if rng.gen_bool(0.7) {
            "active"
        } else {
            IDLE_STATUSES.choose(rng).copied().unwrap_or("suspended")
        };
        let next = cursor + TimeDelta::minutes(rng.gen_range(30..48 * 60));
        if next >= end {
            let close = if rng.gen_bool(0.5) { None } else { Some(end) };
            histories.push(instance.history(status, cursor, close));
            break;
        }
        histories.push(instance.history(status, cursor, Some(next)));
        cursor = next;
    }
    histories
}
