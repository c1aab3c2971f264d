//! Deficit Round Robin dispatch ordering.
//!
//! Decides, for one consumer poll, which tenants get served and in what
//! order. Tenants accrue `quantum` deficit credit per round (capped at
//! `max_deficit`) and are only served while their deficit covers the unit
//! cost, which bounds how far any one tenant can outrun the others.
//!
//! The scheduler is pure over its inputs: the queue engine gathers the
//! candidate snapshot (tenants with pending work plus their concurrency
//! state) and this module turns it into an ordered plan. All randomness
//! flows through one seedable generator so orderings are reproducible.

use std::collections::HashMap;
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::concurrency::Capacity;

/// Unit cost of serving one tenant in a round.
const SERVICE_COST: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Deficit credit added per tenant per round.
    pub quantum: f64,
    /// Cap on accumulated deficit, so a long-idle tenant cannot monopolize
    /// the dispatcher when it returns.
    pub max_deficit: f64,
    /// Maximum dispatch-index entries considered per poll.
    pub parent_queue_limit: usize,
    /// Bias selection toward tenants with higher concurrency limits.
    /// 0 disables (uniform shuffle).
    pub concurrency_limit_bias: f64,
    /// Bias selection toward tenants with more free capacity. 0 disables.
    pub available_capacity_bias: f64,
    /// 0 orders queues strictly oldest-first; 1 is fully random; values in
    /// between blend age weighting with uniform randomness.
    pub queue_age_randomization: f64,
    /// Serve the same computed plan to a (parent_queue, consumer) pair for
    /// this many additional polls before recomputing.
    pub reuse_snapshot_count: u32,
    /// Cap on distinct tenants per poll, selected by weighted draw favoring
    /// older average queue age. `None` means no cap.
    pub maximum_env_count: Option<usize>,
    /// Fixed RNG seed for reproducible orderings. `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            quantum: 1.0,
            max_deficit: 10.0,
            parent_queue_limit: 100,
            concurrency_limit_bias: 0.0,
            available_capacity_bias: 0.0,
            queue_age_randomization: 0.0,
            reuse_snapshot_count: 0,
            maximum_env_count: None,
            seed: None,
        }
    }
}

/// One tenant eligible for dispatch this poll, with the concurrency state
/// needed for capacity filtering and bias weighting.
#[derive(Debug, Clone)]
pub struct TenantCandidate {
    pub tenant_id: String,
    /// Score of the tenant's oldest dispatch-index entry.
    pub oldest_score_ms: i64,
    pub concurrency_limit: u32,
    pub available_capacity: Capacity,
    /// The tenant's non-empty queues: (queue id, age score).
    pub queues: Vec<QueueCandidate>,
}

#[derive(Debug, Clone)]
pub struct QueueCandidate {
    pub queue_id: String,
    pub score_ms: i64,
}

/// Ordered output of one scheduling round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchPlan {
    pub entries: Vec<PlanEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub tenant_id: String,
    pub queue_ids: Vec<String>,
}

struct CachedPlan {
    plan: DispatchPlan,
    served: u32,
}

pub struct DrrScheduler {
    config: SchedulerConfig,
    deficits: Mutex<HashMap<String, f64>>,
    rng: Mutex<StdRng>,
    // Keyed by (parent_queue, consumer_id).
    snapshots: Mutex<HashMap<(String, String), CachedPlan>>,
}

impl DrrScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            deficits: Mutex::new(HashMap::new()),
            rng: Mutex::new(rng),
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Compute (or reuse) the dispatch plan for one consumer poll.
    pub fn plan_round(
        &self,
        parent_queue: &str,
        consumer_id: &str,
        candidates: Vec<TenantCandidate>,
    ) -> DispatchPlan {
        if self.config.reuse_snapshot_count > 0 {
            let mut snapshots = self.snapshots.lock().unwrap();
            let key = (parent_queue.to_string(), consumer_id.to_string());
            if let Some(cached) = snapshots.get_mut(&key) {
                if cached.served < self.config.reuse_snapshot_count {
                    cached.served += 1;
                    return cached.plan.clone();
                }
                snapshots.remove(&key);
            }
        }

        let plan = self.compute_plan(candidates);

        if self.config.reuse_snapshot_count > 0 {
            let mut snapshots = self.snapshots.lock().unwrap();
            snapshots.insert(
                (parent_queue.to_string(), consumer_id.to_string()),
                CachedPlan {
                    plan: plan.clone(),
                    served: 0,
                },
            );
        }
        plan
    }

    /// Drop any cached snapshot for a consumer, forcing a fresh computation
    /// on its next poll.
    pub fn invalidate_snapshot(&self, parent_queue: &str, consumer_id: &str) {
        self.snapshots
            .lock()
            .unwrap()
            .remove(&(parent_queue.to_string(), consumer_id.to_string()));
    }

    fn compute_plan(&self, mut candidates: Vec<TenantCandidate>) -> DispatchPlan {
        candidates.truncate(self.config.parent_queue_limit);

        // Tenants at full capacity consume no scheduling bandwidth: drop
        // them before weighting rather than letting them win slots they
        // cannot use.
        candidates.retain(|c| !c.available_capacity.is_exhausted());

        if let Some(max_envs) = self.config.maximum_env_count {
            candidates = self.select_by_average_age(candidates, max_envs);
        }

        // DRR accounting: accrue quantum, serve those whose deficit covers
        // the unit cost, and charge the cost to each tenant served.
        let served: Vec<TenantCandidate> = {
            let mut deficits = self.deficits.lock().unwrap();
            let mut served = Vec::with_capacity(candidates.len());
            for candidate in candidates {
                let deficit = deficits.entry(candidate.tenant_id.clone()).or_insert(0.0);
                *deficit = (*deficit + self.config.quantum).min(self.config.max_deficit);
                if *deficit >= SERVICE_COST {
                    *deficit -= SERVICE_COST;
                    served.push(candidate);
                }
            }
            served
        };

        let ordered = self.weighted_shuffle(served);

        let entries = ordered
            .into_iter()
            .map(|candidate| {
                let queue_ids = self.order_queues(candidate.queues);
                PlanEntry {
                    tenant_id: candidate.tenant_id,
                    queue_ids,
                }
            })
            .collect();
        DispatchPlan { entries }
    }

    /// Weighted draw of up to `max_envs` tenants, favoring older average
    /// queue age.
    fn select_by_average_age(
        &self,
        mut candidates: Vec<TenantCandidate>,
        max_envs: usize,
    ) -> Vec<TenantCandidate> {
        if candidates.len() <= max_envs {
            return candidates;
        }
        let now = crate::now_epoch_ms();
        let mut selected = Vec::with_capacity(max_envs);
        let mut rng = self.rng.lock().unwrap();
        while selected.len() < max_envs && !candidates.is_empty() {
            let weights: Vec<f64> = candidates
                .iter()
                .map(|c| {
                    let ages: f64 = c
                        .queues
                        .iter()
                        .map(|q| (now - q.score_ms).max(0) as f64)
                        .sum();
                    let avg = if c.queues.is_empty() {
                        0.0
                    } else {
                        ages / c.queues.len() as f64
                    };
                    avg.max(1.0)
                })
                .collect();
            let idx = pick_weighted(&mut rng, &weights);
            selected.push(candidates.swap_remove(idx));
        }
        selected
    }

    /// Shuffle tenants by the configured biases. With both biases at zero
    /// every weight is 1 and this degenerates to a uniform shuffle.
    fn weighted_shuffle(&self, mut candidates: Vec<TenantCandidate>) -> Vec<TenantCandidate> {
        if candidates.len() <= 1 {
            return candidates;
        }
        let max_limit = candidates
            .iter()
            .map(|c| c.concurrency_limit)
            .max()
            .unwrap_or(1)
            .max(1) as f64;

        let mut out = Vec::with_capacity(candidates.len());
        let mut rng = self.rng.lock().unwrap();
        while !candidates.is_empty() {
            // Recompute remaining weight exactly each draw; incremental
            // subtraction drifts for long candidate lists.
            let weights: Vec<f64> = candidates
                .iter()
                .map(|c| self.tenant_weight(c, max_limit))
                .collect();
            let idx = pick_weighted(&mut rng, &weights);
            out.push(candidates.swap_remove(idx));
        }
        out
    }

    fn tenant_weight(&self, candidate: &TenantCandidate, max_limit: f64) -> f64 {
        let mut weight = 1.0;
        if self.config.concurrency_limit_bias > 0.0 {
            let normalized = candidate.concurrency_limit as f64 / max_limit;
            weight *= 1.0 + (normalized * self.config.concurrency_limit_bias).powi(2);
        }
        if self.config.available_capacity_bias > 0.0 {
            let free_fraction = match candidate.available_capacity {
                Capacity::Unbounded => 1.0,
                Capacity::Available(free) => {
                    if candidate.concurrency_limit == 0 {
                        0.0
                    } else {
                        free as f64 / candidate.concurrency_limit as f64
                    }
                }
            };
            weight *= 1.0 + (free_fraction * self.config.available_capacity_bias).powi(2);
        }
        weight
    }

    /// Order one tenant's queues: strictly oldest-first at randomization 0,
    /// otherwise a weighted-random order blending age with uniform chance.
    fn order_queues(&self, mut queues: Vec<QueueCandidate>) -> Vec<String> {
        if queues.len() <= 1 || self.config.queue_age_randomization <= 0.0 {
            queues.sort_by(|a, b| a.score_ms.cmp(&b.score_ms).then(a.queue_id.cmp(&b.queue_id)));
            return queues.into_iter().map(|q| q.queue_id).collect();
        }

        let randomization = self.config.queue_age_randomization.min(1.0);
        let now = crate::now_epoch_ms();
        let mut out = Vec::with_capacity(queues.len());
        let mut rng = self.rng.lock().unwrap();
        while !queues.is_empty() {
            let n = queues.len() as f64;
            let total_age: f64 = queues
                .iter()
                .map(|q| (now - q.score_ms).max(1) as f64)
                .sum();
            let weights: Vec<f64> = queues
                .iter()
                .map(|q| {
                    let age_fraction = (now - q.score_ms).max(1) as f64 / total_age;
                    (1.0 - randomization) * age_fraction + randomization / n
                })
                .collect();
            let idx = pick_weighted(&mut rng, &weights);
            out.push(queues.swap_remove(idx).queue_id);
        }
        out
    }
}

fn pick_weighted(rng: &mut StdRng, weights: &[f64]) -> usize {
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return rng.gen_range(0..weights.len());
    }
    let mut target = rng.gen_range(0.0..total);
    for (i, w) in weights.iter().enumerate() {
        if target < *w {
            return i;
        }
        target -= w;
    }
    weights.len() - 1
}
