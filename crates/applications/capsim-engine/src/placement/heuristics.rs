//! Node scoring heuristics
//!
//! Every heuristic maps (replica, usage snapshot, demand, source node) to a
//! per-node score. Ineligible nodes score `None`. A node is eligible when it
//! is not excluded for the replica, is not the source node, and fits the
//! demand in cpu, memory and disk.
//!
//! ## Strategies
//!
//! - **WorstFit**: prefer the node left with the most room after placement
//! - **BestFit**: prefer the node left with the least room
//! - **WorstFitUpgrade**: WorstFit, penalising nodes an upgrade pass reaches first
//! - **DotProduct** / **InnerProduct**: align demand with availability
//! - **L2Norm**: minimise the distance between demand and availability
//! - **SumOfSquares**: 10-bucket potential over headroom
//! - **MinStdDiv**: minimise the growth of cross-node variance
//! - **Penalties**: keep the emptiest nodes in reserve
//! - **Probability variants**: WorstFit / BestFit restricted to nodes the
//!   violation predictor considers safe

use capsim_core::{NODES_PER_UPGRADE_DOMAIN, NodeId, ReplicaId, ResourceUsage, Role};
use rand::{Rng, RngCore};
use std::collections::BTreeSet;

use super::PlacementSelector;
use crate::cluster::ClusterManager;
use crate::config::{MetricWeightingScheme, PlacementHeuristic};

const NUM_BUCKETS: usize = 10;

/// Direction in which a heuristic's scores improve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Objective {
    Minimize,
    Maximize,
}

/// Per-node scores of one search
#[derive(Debug, Clone, PartialEq)]
pub struct NodeScores {
    scores: Vec<Option<f64>>,
    objective: Objective,
}

impl NodeScores {
    pub fn new(num_nodes: usize, objective: Objective) -> Self {
        Self {
            scores: vec![None; num_nodes],
            objective,
        }
    }

    pub fn get(&self, node: usize) -> Option<f64> {
        self.scores.get(node).copied().flatten()
    }

    pub fn set(&mut self, node: usize, score: f64) {
        self.scores[node] = Some(score);
    }

    pub fn invalidate(&mut self, node: usize) {
        if let Some(slot) = self.scores.get_mut(node) {
            *slot = None;
        }
    }

    pub fn objective(&self) -> Objective {
        self.objective
    }

    /// Best score over eligible nodes
    pub fn optimum(&self) -> Option<f64> {
        self.scores.iter().flatten().copied().reduce(|a, b| match self.objective {
            Objective::Minimize => a.min(b),
            Objective::Maximize => a.max(b),
        })
    }

    /// Nodes scoring exactly the optimum, ascending
    pub fn best_nodes(&self) -> Vec<NodeId> {
        let Some(best) = self.optimum() else {
            return Vec::new();
        };
        self.scores
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == Some(best))
            .map(|(i, _)| NodeId(i))
            .collect()
    }

    /// Uniform pick among the optimal nodes
    pub fn choose(&self, rng: &mut dyn RngCore) -> Option<NodeId> {
        let candidates = self.best_nodes();
        if candidates.is_empty() {
            return None;
        }
        Some(candidates[rng.gen_range(0..candidates.len())])
    }
}

/// One scoring request
#[derive(Debug, Clone, Copy)]
pub struct ScoreInput<'a> {
    pub replica: &'a ReplicaId,
    pub usages: &'a [ResourceUsage],
    pub demand: &'a ResourceUsage,
    pub src: Option<NodeId>,
}

/// Per-resource fractions of node capacity
#[derive(Debug, Clone, Copy)]
struct Fractions {
    cpu: f64,
    memory: f64,
    disk: f64,
}

impl Fractions {
    fn of(usage: &ResourceUsage, capacity: &ResourceUsage) -> Self {
        Self {
            cpu: usage.cpu.ratio(capacity.cpu),
            memory: usage.memory / capacity.memory,
            disk: usage.disk / capacity.disk,
        }
    }

    /// Room left once `usage` is occupied
    fn headroom(usage: &ResourceUsage, capacity: &ResourceUsage) -> Self {
        let used = Self::of(usage, capacity);
        Self {
            cpu: 1.0 - used.cpu,
            memory: 1.0 - used.memory,
            disk: 1.0 - used.disk,
        }
    }

    fn max(&self) -> f64 {
        self.disk.max(self.memory).max(self.cpu)
    }
}

/// Mean usage across nodes; cpu in units
#[derive(Debug, Clone, Copy)]
struct Means {
    cpu: f64,
    memory: f64,
    disk: f64,
}

impl Means {
    /// Initial placements count the arriving demand in the means
    fn of(usages: &[ResourceUsage], demand: &ResourceUsage, src: Option<NodeId>) -> Self {
        let mut total = match src {
            None => *demand,
            Some(_) => ResourceUsage::ZERO,
        };
        for usage in usages {
            total += *usage;
        }
        let n = usages.len().max(1) as f64;
        Self {
            cpu: total.cpu.as_f64() / n,
            memory: total.memory / n,
            disk: total.disk / n,
        }
    }

    fn weights(&self, capacity: &ResourceUsage) -> Fractions {
        Fractions {
            cpu: self.cpu / capacity.cpu.as_f64(),
            memory: self.memory / capacity.memory,
            disk: self.disk / capacity.disk,
        }
    }
}

/// Context shared by the scoring loops of one request
struct Scoring<'a> {
    cluster: &'a ClusterManager,
    input: ScoreInput<'a>,
    capacity: ResourceUsage,
    excluded: BTreeSet<NodeId>,
    means: Means,
}

impl Scoring<'_> {
    fn num_nodes(&self) -> usize {
        self.input.usages.len()
    }

    fn eligible(&self, node: usize) -> bool {
        let id = NodeId(node);
        !self.excluded.contains(&id)
            && self.input.src != Some(id)
            && (self.input.usages[node] + *self.input.demand).fits_within(&self.capacity)
    }

    fn headroom_after(&self, node: usize) -> Fractions {
        Fractions::headroom(&(self.input.usages[node] + *self.input.demand), &self.capacity)
    }

    fn headroom(&self, node: usize) -> Fractions {
        Fractions::headroom(&self.input.usages[node], &self.capacity)
    }
}

impl PlacementSelector {
    /// Score every node for the request with the configured heuristic
    pub fn compute_node_scores(&self, cluster: &ClusterManager, input: ScoreInput<'_>) -> NodeScores {
        let ctx = Scoring {
            cluster,
            capacity: cluster.capacity(),
            excluded: cluster.excluded_nodes(input.replica),
            means: Means::of(input.usages, input.demand, input.src),
            input,
        };
        match self.heuristic {
            PlacementHeuristic::WorstFit => self.fit_scores(&ctx, -1.0, false),
            PlacementHeuristic::BestFit => self.fit_scores(&ctx, 1.0, false),
            PlacementHeuristic::WorstFitUpgrade => self.fit_scores(&ctx, -1.0, true),
            PlacementHeuristic::DotProduct => self.dot_product_scores(&ctx),
            PlacementHeuristic::InnerProduct => self.inner_product_scores(&ctx),
            PlacementHeuristic::L2Norm => self.l2_norm_scores(&ctx),
            PlacementHeuristic::SumOfSquares => self.sum_of_squares_scores(&ctx),
            PlacementHeuristic::MinStdDiv => self.min_std_div_scores(&ctx),
            PlacementHeuristic::Penalties => self.penalties_scores(&ctx),
            PlacementHeuristic::WorstFitProbabilityViolation => self.probability_worst_fit_scores(&ctx, false),
            PlacementHeuristic::WorstFitProbabilityViolationUpgrade => {
                self.probability_worst_fit_scores(&ctx, true)
            }
            PlacementHeuristic::BestFitProbabilityViolation => self.probability_best_fit_scores(&ctx),
        }
    }

    /// Combine per-resource terms with the weighting scheme
    fn aggregate(&self, terms: Fractions, means: &Means, capacity: &ResourceUsage) -> f64 {
        match self.weighting {
            MetricWeightingScheme::MinWeight => terms.disk.min(terms.memory).min(terms.cpu),
            MetricWeightingScheme::UnweightedAvg => (terms.disk + terms.memory + terms.cpu) / 3.0,
            MetricWeightingScheme::FfSumWeight => {
                let w = means.weights(capacity);
                (w.cpu * terms.cpu + w.disk * terms.disk + w.memory * terms.memory) / 3.0
            }
        }
    }

    /// `sign · agg(headroom after placement)`, minimised
    fn fit_score(&self, ctx: &Scoring<'_>, node: usize, sign: f64) -> f64 {
        sign * self.aggregate(ctx.headroom_after(node), &ctx.means, &ctx.capacity)
    }

    fn fit_scores(&self, ctx: &Scoring<'_>, sign: f64, upgrade_aware: bool) -> NodeScores {
        let mut scores = NodeScores::new(ctx.num_nodes(), Objective::Minimize);
        for node in (0..ctx.num_nodes()).filter(|&n| ctx.eligible(n)) {
            let mut score = self.fit_score(ctx, node, sign);
            if upgrade_aware {
                score += upgrade_penalty(ctx.cluster, ctx.input.replica, node);
            }
            scores.set(node, score);
        }
        scores
    }

    fn dot_product_scores(&self, ctx: &Scoring<'_>) -> NodeScores {
        let mut scores = NodeScores::new(ctx.num_nodes(), Objective::Maximize);
        let demand = Fractions::of(ctx.input.demand, &ctx.capacity);
        let w = ctx.means.weights(&ctx.capacity);
        for node in (0..ctx.num_nodes()).filter(|&n| ctx.eligible(n)) {
            let avail = ctx.headroom(node);
            let score = match self.weighting {
                MetricWeightingScheme::UnweightedAvg => {
                    demand.disk * avail.disk + demand.memory * avail.memory + demand.cpu * avail.cpu
                }
                _ => {
                    w.disk * demand.disk * avail.disk
                        + w.memory * demand.memory * avail.memory
                        + w.cpu * demand.cpu * avail.cpu
                }
            };
            scores.set(node, score);
        }
        scores
    }

    fn inner_product_scores(&self, ctx: &Scoring<'_>) -> NodeScores {
        let mut scores = NodeScores::new(ctx.num_nodes(), Objective::Maximize);
        let demand = Fractions::of(ctx.input.demand, &ctx.capacity);
        for node in (0..ctx.num_nodes()).filter(|&n| ctx.eligible(n)) {
            let avail = ctx.headroom(node);
            scores.set(
                node,
                demand.disk * avail.disk + demand.memory * avail.memory + demand.cpu * avail.cpu,
            );
        }
        scores
    }

    fn l2_norm_scores(&self, ctx: &Scoring<'_>) -> NodeScores {
        let mut scores = NodeScores::new(ctx.num_nodes(), Objective::Minimize);
        let demand = Fractions::of(ctx.input.demand, &ctx.capacity);
        let w = ctx.means.weights(&ctx.capacity);
        for node in (0..ctx.num_nodes()).filter(|&n| ctx.eligible(n)) {
            let avail = ctx.headroom(node);
            let (disk, memory, cpu) = (
                (demand.disk - avail.disk).powi(2),
                (demand.memory - avail.memory).powi(2),
                (demand.cpu - avail.cpu).powi(2),
            );
            let score = match self.weighting {
                MetricWeightingScheme::UnweightedAvg => disk + memory + cpu,
                _ => w.disk * disk + w.memory * memory + w.cpu * cpu,
            };
            scores.set(node, score);
        }
        scores
    }

    /// Bucket counts carry over from node to node and each node is scored
    /// on the counts seen before its own update. The source-node terms mix
    /// the source's memory and disk with the candidate's cpu.
    fn sum_of_squares_scores(&self, ctx: &Scoring<'_>) -> NodeScores {
        let mut scores = NodeScores::new(ctx.num_nodes(), Objective::Minimize);
        let mut counts = [0i64; NUM_BUCKETS];
        for node in (0..ctx.num_nodes()).filter(|&n| ctx.eligible(n)) {
            let after = ctx.headroom_after(node).max();
            let old = after;
            let src_terms = ctx.input.src.map(|src| {
                let src_after = ctx.headroom_after(src.index());
                let mut src_old = src_after;
                src_old.cpu = ctx.headroom_after(node).cpu;
                (src_after.max(), src_old.max())
            });

            let snapshot = counts;
            for (bucket, count) in counts.iter_mut().enumerate() {
                if in_bucket(after, bucket) {
                    *count += 1;
                }
                if in_bucket(old, bucket) {
                    *count -= 1;
                }
                if let Some((src_after, src_old)) = src_terms {
                    if in_bucket(src_after, bucket) {
                        *count += 1;
                    }
                    if in_bucket(src_old, bucket) {
                        *count -= 1;
                    }
                }
            }

            let score = snapshot
                .iter()
                .enumerate()
                .map(|(bucket, &count)| (count as f64 * bucket_weight(bucket)).powi(2))
                .sum();
            scores.set(node, score);
        }
        scores
    }

    fn min_std_div_scores(&self, ctx: &Scoring<'_>) -> NodeScores {
        let mut scores = NodeScores::new(ctx.num_nodes(), Objective::Minimize);
        let means = &ctx.means;
        let (mut disk_variance, mut memory_variance) = (0.0, 0.0);
        for usage in ctx.input.usages {
            disk_variance += (usage.disk - means.disk).powi(2);
            memory_variance += (usage.memory - means.memory).powi(2);
        }
        let w = means.weights(&ctx.capacity);
        let demand = ctx.input.demand;

        for node in (0..ctx.num_nodes()).filter(|&n| ctx.eligible(n)) {
            let usage = &ctx.input.usages[node];
            let disk = disk_variance - (usage.disk - means.disk).powi(2)
                + (usage.disk + demand.disk - means.disk).powi(2);
            let memory = memory_variance - (usage.memory - means.memory).powi(2)
                + (usage.memory + demand.memory - means.memory).powi(2);
            let score = match self.weighting {
                MetricWeightingScheme::FfSumWeight => w.disk * disk + w.memory * memory,
                _ => disk + memory,
            };
            scores.set(node, score);
        }
        scores
    }

    /// The first `nodes_to_reserve` nodes in ascending `-agg(headroom)`
    /// order, i.e. the emptiest ones
    fn reserved_nodes(&self, ctx: &Scoring<'_>) -> BTreeSet<usize> {
        let mut order: Vec<(usize, f64)> = (0..ctx.num_nodes())
            .map(|n| (n, -self.aggregate(ctx.headroom(n), &ctx.means, &ctx.capacity)))
            .collect();
        order.sort_by(|a, b| a.1.total_cmp(&b.1));
        order
            .into_iter()
            .take(self.nodes_to_reserve)
            .map(|(n, _)| n)
            .collect()
    }

    fn penalties_scores(&self, ctx: &Scoring<'_>) -> NodeScores {
        let reserved = self.reserved_nodes(ctx);
        let mut scores = NodeScores::new(ctx.num_nodes(), Objective::Minimize);
        for node in (0..ctx.num_nodes()).filter(|&n| ctx.eligible(n) && !reserved.contains(&n)) {
            scores.set(node, self.fit_score(ctx, node, -1.0));
        }

        let dip_into_reserve = match scores.optimum() {
            Some(best) => best.abs() < self.penalties_threshold,
            None => true,
        };
        if dip_into_reserve {
            for &node in reserved.iter().filter(|&&n| ctx.eligible(n)) {
                scores.set(node, self.fit_score(ctx, node, -1.0));
            }
        }
        scores
    }

    fn violation_probability(&self, node: usize) -> f64 {
        self.violation_probability.get(node).copied().unwrap_or(0.0)
    }

    fn probability_worst_fit_scores(&self, ctx: &Scoring<'_>, upgrade_aware: bool) -> NodeScores {
        let reserved = self.reserved_nodes(ctx);
        let threshold = self.violation_threshold;
        let any_safe = (0..ctx.num_nodes()).any(|n| {
            !ctx.excluded.contains(&NodeId(n))
                && !reserved.contains(&n)
                && self.violation_probability(n) < threshold
        });

        let mut scores = NodeScores::new(ctx.num_nodes(), Objective::Minimize);
        for node in (0..ctx.num_nodes()).filter(|&n| ctx.eligible(n)) {
            if reserved.contains(&node) || (any_safe && self.violation_probability(node) >= threshold) {
                continue;
            }
            let mut score = self.fit_score(ctx, node, -1.0);
            if upgrade_aware {
                score += upgrade_penalty(ctx.cluster, ctx.input.replica, node);
            }
            scores.set(node, score);
        }
        scores
    }

    fn probability_best_fit_scores(&self, ctx: &Scoring<'_>) -> NodeScores {
        let threshold = self.violation_threshold;
        let any_safe = (0..ctx.num_nodes())
            .any(|n| !ctx.excluded.contains(&NodeId(n)) && self.violation_probability(n) < threshold);

        let mut scores = NodeScores::new(ctx.num_nodes(), Objective::Minimize);
        for node in (0..ctx.num_nodes()).filter(|&n| ctx.eligible(n)) {
            let probability = self.violation_probability(node);
            if any_safe && probability >= threshold {
                continue;
            }
            let score = if any_safe {
                self.fit_score(ctx, node, 1.0)
            } else {
                probability
            };
            scores.set(node, score);
        }
        scores
    }
}

/// Extra cost of landing on a node an upgrade pass reaches early: standards
/// on the first domain, primaries below every placed sibling
fn upgrade_penalty(cluster: &ClusterManager, replica: &ReplicaId, node: usize) -> f64 {
    match cluster.role_of(replica) {
        Some(Role::Standard) if node < NODES_PER_UPGRADE_DOMAIN => 1.0,
        Some(Role::Primary) => {
            let lowest = cluster
                .group_of(replica)
                .unwrap_or_default()
                .iter()
                .filter(|r| *r != replica)
                .filter_map(|r| cluster.placement_of(r))
                .all(|n| n.index() >= node);
            if lowest { 1.0 } else { 0.0 }
        }
        _ => 0.0,
    }
}

/// Bucket `b` covers `(b/10, (b+1)/10]`
fn in_bucket(value: f64, bucket: usize) -> bool {
    let lower = bucket as f64 / NUM_BUCKETS as f64;
    let upper = if bucket + 1 == NUM_BUCKETS {
        1.0
    } else {
        (bucket + 1) as f64 / NUM_BUCKETS as f64
    };
    value > lower && value <= upper
}

fn bucket_weight(bucket: usize) -> f64 {
    ((bucket + 1) * 10) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::tests::{cluster, params, selector, standard, trace_set, usage};
    use crate::config::ExperimentParams;
    use capsim_core::{CpuUnits, SimTime};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::Arc;

    fn mb(memory: f64, disk: f64) -> ResourceUsage {
        ResourceUsage::new(CpuUnits::from_cores(0.5), memory, disk)
    }

    fn scores_for(params: &ExperimentParams, usages: &[ResourceUsage], demand: ResourceUsage) -> NodeScores {
        let traces = trace_set(&[usage(10.0, 10.0)], &[]);
        let cluster = cluster(params, Arc::clone(&traces));
        let selector = selector(params);
        let replica = &standard(0, 1)[0];
        selector.compute_node_scores(
            &cluster,
            ScoreInput {
                replica,
                usages,
                demand: &demand,
                src: None,
            },
        )
    }

    #[test]
    fn test_choose_breaks_ties_uniformly() {
        let mut scores = NodeScores::new(4, Objective::Minimize);
        for node in 0..4 {
            scores.set(node, -0.5);
        }
        let mut seen = BTreeSet::new();
        for seed in 0..40 {
            let mut rng = StdRng::seed_from_u64(seed);
            seen.insert(scores.choose(&mut rng).unwrap());
        }
        assert_eq!(seen.len(), 4);

        let empty = NodeScores::new(4, Objective::Maximize);
        assert_eq!(empty.optimum(), None);
        assert_eq!(empty.choose(&mut StdRng::seed_from_u64(0)), None);
    }

    #[test]
    fn test_worst_fit_prefers_emptiest_node() {
        let params = params(4);
        let usages = vec![mb(4000.0, 10_000.0), mb(1000.0, 10_000.0), mb(6000.0, 10_000.0), mb(2000.0, 10_000.0)];
        let scores = scores_for(&params, &usages, mb(1000.0, 1000.0));
        assert_eq!(scores.best_nodes(), vec![NodeId(1)]);
    }

    #[test]
    fn test_best_fit_prefers_fullest_node_that_fits() {
        let params = params(4).with_heuristic(PlacementHeuristic::BestFit);
        let usages = vec![mb(4000.0, 10_000.0), mb(1000.0, 10_000.0), mb(7500.0, 10_000.0), mb(6000.0, 10_000.0)];
        let scores = scores_for(&params, &usages, mb(1000.0, 1000.0));
        assert_eq!(scores.get(2), None);
        assert_eq!(scores.best_nodes(), vec![NodeId(3)]);
    }

    #[test]
    fn test_inner_product_maximises() {
        let params = params(4).with_heuristic(PlacementHeuristic::InnerProduct);
        let usages = vec![mb(4000.0, 0.0), mb(1000.0, 0.0), mb(6000.0, 0.0), mb(2000.0, 0.0)];
        let scores = scores_for(&params, &usages, mb(1000.0, 1000.0));
        assert_eq!(scores.objective(), Objective::Maximize);
        assert_eq!(scores.best_nodes(), vec![NodeId(1)]);
    }

    #[test]
    fn test_min_std_div_picks_least_loaded() {
        let params = params(4).with_heuristic(PlacementHeuristic::MinStdDiv);
        let usages = vec![mb(4000.0, 50_000.0), mb(3000.0, 40_000.0), mb(500.0, 5_000.0), mb(2000.0, 20_000.0)];
        let scores = scores_for(&params, &usages, mb(1000.0, 10_000.0));
        assert_eq!(scores.best_nodes(), vec![NodeId(2)]);
    }

    #[test]
    fn test_penalties_keeps_emptiest_in_reserve() {
        let mut params = params(4).with_heuristic(PlacementHeuristic::Penalties);
        params.nodes_to_reserve = 1;
        params.penalties_threshold = 0.05;
        let usages = vec![mb(4000.0, 10_000.0), mb(1000.0, 10_000.0), mb(6000.0, 10_000.0), mb(2000.0, 10_000.0)];
        let scores = scores_for(&params, &usages, mb(1000.0, 1000.0));
        assert_eq!(scores.get(1), None);
        assert_eq!(scores.best_nodes(), vec![NodeId(3)]);

        // Everything outside the reserve is nearly full
        let tight = vec![mb(7000.0, 10_000.0), mb(1000.0, 10_000.0), mb(7100.0, 10_000.0), mb(7150.0, 10_000.0)];
        let scores = scores_for(&params, &tight, mb(1000.0, 1000.0));
        assert_eq!(scores.best_nodes(), vec![NodeId(1)]);
    }

    #[test]
    fn test_sum_of_squares_scores_first_node_zero() {
        let params = params(4).with_heuristic(PlacementHeuristic::SumOfSquares);
        let usages = vec![mb(4000.0, 10_000.0); 4];
        let scores = scores_for(&params, &usages, mb(1000.0, 1000.0));
        for node in 0..4 {
            assert_eq!(scores.get(node), Some(0.0));
        }
    }

    #[test]
    fn test_buckets() {
        assert!(in_bucket(0.05, 0));
        assert!(in_bucket(0.1, 0));
        assert!(!in_bucket(0.0, 0));
        assert!(in_bucket(1.0, 9));
        assert_eq!(bucket_weight(9), 100.0);
    }

    #[test]
    fn test_probability_worst_fit_avoids_risky_nodes() {
        let params = params(4).with_heuristic(PlacementHeuristic::WorstFitProbabilityViolation);
        let traces = trace_set(&[usage(10.0, 10.0)], &[]);
        let cluster = cluster(&params, Arc::clone(&traces));
        let mut selector = selector(&params);
        selector.violation_probability = vec![0.9, 0.0, 0.9, 0.01];
        let usages = vec![mb(100.0, 100.0), mb(4000.0, 100.0), mb(100.0, 100.0), mb(5000.0, 100.0)];
        let demand = mb(1000.0, 1000.0);
        let replica = &standard(0, 1)[0];
        let scores = selector.compute_node_scores(
            &cluster,
            ScoreInput {
                replica,
                usages: &usages,
                demand: &demand,
                src: None,
            },
        );
        assert_eq!(scores.get(0), None);
        assert_eq!(scores.get(2), None);
        assert_eq!(scores.best_nodes(), vec![NodeId(1)]);

        selector.violation_probability = vec![0.9; 4];
        let scores = selector.compute_node_scores(
            &cluster,
            ScoreInput {
                replica,
                usages: &usages,
                demand: &demand,
                src: None,
            },
        );
        assert_eq!(scores.best_nodes().len(), 2);
    }

    #[test]
    fn test_probability_best_fit_falls_back_to_probability() {
        let params = params(4).with_heuristic(PlacementHeuristic::BestFitProbabilityViolation);
        let traces = trace_set(&[usage(10.0, 10.0)], &[]);
        let cluster = cluster(&params, Arc::clone(&traces));
        let mut selector = selector(&params);
        selector.violation_probability = vec![0.5, 0.2, 0.9, 0.3];
        let usages = vec![mb(100.0, 100.0); 4];
        let demand = mb(1000.0, 1000.0);
        let replica = &standard(0, 1)[0];
        let scores = selector.compute_node_scores(
            &cluster,
            ScoreInput {
                replica,
                usages: &usages,
                demand: &demand,
                src: None,
            },
        );
        assert_eq!(scores.best_nodes(), vec![NodeId(1)]);
    }

    #[test]
    fn test_upgrade_penalty_for_standard_on_first_domain() {
        let params = params(8).with_heuristic(PlacementHeuristic::WorstFitUpgrade);
        let traces = trace_set(&[usage(10.0, 10.0)], &[]);
        let mut cluster = cluster(&params, Arc::clone(&traces));
        let mut selector = selector(&params);
        let mut rng = StdRng::seed_from_u64(3);
        let group = standard(0, 1);
        cluster.place(&mut selector, SimTime::ZERO, &group, &mut rng).unwrap();
        let src = cluster.placement_of(&group[0]);

        let usages = vec![mb(100.0, 100.0); 8];
        let demand = mb(1000.0, 1000.0);
        let scores = selector.compute_node_scores(
            &cluster,
            ScoreInput {
                replica: &group[0],
                usages: &usages,
                demand: &demand,
                src,
            },
        );
        let best = scores.best_nodes();
        assert!(!best.is_empty());
        assert!(best.iter().all(|n| n.index() >= NODES_PER_UPGRADE_DOMAIN));
    }
}
