//! Placement selection
//!
//! A [`PlacementSelector`] decides where replicas land. The search runs in
//! two stages:
//!
//! 1. Direct: score every node with the configured heuristic, bias the
//!    scores towards already upgraded nodes while an upgrade is running, and
//!    pick uniformly among the optimal nodes.
//! 2. Clear space: plan, per candidate node and on copied usage buffers,
//!    the evacuations that would make room, and take the candidate needing
//!    the fewest moves.
//!
//! The selector only plans. The cluster manager applies the planned moves.

mod heuristics;
mod violation;

pub use heuristics::{NodeScores, Objective, ScoreInput};

use capsim_core::{
    CapsimError, NODES_PER_UPGRADE_DOMAIN, NodeId, PlacementPreference, ReplicaId, ResourceUsage, Result,
    SimTime,
};
use rand::{Rng, RngCore};
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use tracing::debug;

use crate::cluster::{ClusterManager, SortResource};
use crate::config::{ExperimentParams, MetricWeightingScheme, PlacementHeuristic};
use crate::predictor::{SampledTenants, ViolationPredictor};

/// One evacuation of a clear-space plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedMove {
    pub replica: ReplicaId,
    pub dst: NodeId,
}

/// Evacuations that free room on `node`
#[derive(Debug, Clone, PartialEq)]
pub struct ClearPlan {
    pub node: NodeId,
    pub moves: Vec<PlannedMove>,
    /// Memory and disk both cleared
    pub complete: bool,
    /// Node usage once the moves are applied
    pub usage_after: ResourceUsage,
}

impl ClearPlan {
    pub fn num_moves(&self) -> usize {
        self.moves.len()
    }
}

/// Destination chosen for a replica, possibly after clearing space
#[derive(Debug, Clone, PartialEq)]
pub struct NodePick {
    pub node: NodeId,
    pub clearing: Option<ClearPlan>,
}

impl NodePick {
    fn direct(node: NodeId) -> Self {
        Self { node, clearing: None }
    }

    fn after_clearing(plan: ClearPlan) -> Self {
        Self {
            node: plan.node,
            clearing: Some(plan),
        }
    }
}

/// Node selection with one scoring heuristic
pub struct PlacementSelector {
    heuristic: PlacementHeuristic,
    weighting: MetricWeightingScheme,
    nodes_to_reserve: usize,
    penalties_threshold: f64,
    violation_threshold: f64,
    mc_repetitions: usize,
    extrapolate_growing_tenants: bool,
    apply_placement_preference: bool,
    predictor: Arc<ViolationPredictor>,
    /// Monte-Carlo samples reused across probability queries
    sample_cache: BTreeMap<ReplicaId, SampledTenants>,
    /// Per-node violation probability of the current request
    violation_probability: Vec<f64>,
}

impl PlacementSelector {
    pub fn from_params(params: &ExperimentParams, predictor: Arc<ViolationPredictor>) -> Self {
        Self {
            heuristic: params.placement_heuristic,
            weighting: params.weighting_scheme,
            nodes_to_reserve: params.nodes_to_reserve,
            penalties_threshold: params.penalties_threshold,
            violation_threshold: params.violation_threshold,
            mc_repetitions: params.mc_repetitions,
            extrapolate_growing_tenants: params.extrapolate_growing_tenants,
            apply_placement_preference: params.apply_placement_preference,
            predictor,
            sample_cache: BTreeMap::new(),
            violation_probability: Vec::new(),
        }
    }

    /// WorstFit selector sharing the rest of the experiment's settings, used
    /// to evacuate domains during upgrades
    pub fn worst_fit(params: &ExperimentParams, predictor: Arc<ViolationPredictor>) -> Self {
        let mut selector = Self::from_params(params, predictor);
        selector.heuristic = PlacementHeuristic::WorstFit;
        selector
    }

    pub fn heuristic(&self) -> PlacementHeuristic {
        self.heuristic
    }

    pub fn violation_probabilities(&self) -> &[f64] {
        &self.violation_probability
    }

    /// Drop cached samples of replicas that left the cluster
    pub fn forget(&mut self, replicas: &[ReplicaId]) {
        for replica in replicas {
            self.sample_cache.remove(replica);
        }
    }

    /// Node for an arriving replica with placement demand `demand`
    pub fn choose_node_to_place(
        &mut self,
        cluster: &ClusterManager,
        now: SimTime,
        replica: &ReplicaId,
        slo: &str,
        demand: &ResourceUsage,
        rng: &mut dyn RngCore,
    ) -> Result<Option<NodePick>> {
        if self.heuristic.uses_violation_probability() {
            self.compute_placement_violation_probabilities(cluster, now, replica, slo, demand, rng)?;
        }
        let usages = cluster.usages();
        if let Some(node) = self.find_node(cluster, replica, &usages, demand, None, rng) {
            return Ok(Some(NodePick::direct(node)));
        }
        Ok(self
            .find_node_after_clearing_space(cluster, now, replica, demand, None, rng)?
            .map(NodePick::after_clearing))
    }

    /// New node for a placed replica, carrying its current usage
    pub fn choose_node_to_move(
        &mut self,
        cluster: &ClusterManager,
        now: SimTime,
        replica: &ReplicaId,
        rng: &mut dyn RngCore,
    ) -> Result<Option<NodePick>> {
        let src = cluster
            .placement_of(replica)
            .ok_or_else(|| CapsimError::UnknownReplica(replica.to_string()))?;
        let usage = cluster.current_usage(replica, now)?;
        if self.heuristic.uses_violation_probability() {
            self.compute_move_violation_probabilities(cluster, now, replica, &usage, rng)?;
        }
        let usages = cluster.usages();
        if let Some(node) = self.find_node(cluster, replica, &usages, &usage, Some(src), rng) {
            return Ok(Some(NodePick::direct(node)));
        }
        Ok(self
            .find_node_after_clearing_space(cluster, now, replica, &usage, Some(src), rng)?
            .map(NodePick::after_clearing))
    }

    /// Direct search over a usage snapshot
    pub fn find_node(
        &self,
        cluster: &ClusterManager,
        replica: &ReplicaId,
        usages: &[ResourceUsage],
        demand: &ResourceUsage,
        src: Option<NodeId>,
        rng: &mut dyn RngCore,
    ) -> Option<NodeId> {
        let mut scores = self.compute_node_scores(
            cluster,
            ScoreInput {
                replica,
                usages,
                demand,
                src,
            },
        );
        self.apply_upgrade_preference(cluster, &mut scores);
        scores.choose(rng)
    }

    /// Node ranges already upgraded and still to upgrade in this pass.
    /// `None` unless a domain is under upgrade with a preference applied.
    fn upgrade_sides(&self, cluster: &ClusterManager) -> Option<(Range<usize>, Range<usize>)> {
        if !self.apply_placement_preference {
            return None;
        }
        let domain = cluster.domain_under_upgrade()?;
        let lower = domain * NODES_PER_UPGRADE_DOMAIN;
        let upper = lower + NODES_PER_UPGRADE_DOMAIN;
        let n = cluster.num_nodes();
        match cluster.placement_preference() {
            PlacementPreference::LowerUpgradeDomains => Some((0..lower, upper..n)),
            PlacementPreference::UpperUpgradeDomains => Some((upper..n, 0..lower)),
            PlacementPreference::None => None,
        }
    }

    /// Invalidate the not-yet-upgraded side when any upgraded node is eligible
    fn apply_upgrade_preference(&self, cluster: &ClusterManager, scores: &mut NodeScores) {
        let Some((upgraded, pending)) = self.upgrade_sides(cluster) else {
            return;
        };
        if upgraded.into_iter().any(|n| scores.get(n).is_some()) {
            for node in pending {
                scores.invalidate(node);
            }
        }
    }

    /// Cheapest complete clear-space plan. During an upgrade the upgraded
    /// side is searched first and the other side only if it yields nothing.
    fn find_node_after_clearing_space(
        &self,
        cluster: &ClusterManager,
        now: SimTime,
        replica: &ReplicaId,
        demand: &ResourceUsage,
        src: Option<NodeId>,
        rng: &mut dyn RngCore,
    ) -> Result<Option<ClearPlan>> {
        let excluded = cluster.excluded_nodes(replica);
        let capacity = cluster.capacity();
        let passes = match self.upgrade_sides(cluster) {
            Some((upgraded, pending)) => vec![upgraded, pending],
            None => vec![0..cluster.num_nodes()],
        };

        for pass in passes {
            let mut best: Option<ClearPlan> = None;
            for node in pass.map(NodeId) {
                if excluded.contains(&node) || src == Some(node) {
                    continue;
                }
                let plan = self.attempt_clearing_space_on_node(cluster, now, node, demand, rng)?;
                let usable = plan.complete && (plan.usage_after + *demand).fits_within(&capacity);
                if usable && best.as_ref().is_none_or(|b| plan.num_moves() < b.num_moves()) {
                    best = Some(plan);
                }
            }
            if let Some(plan) = best {
                debug!("Clearing {} with {} moves for {}", plan.node, plan.num_moves(), replica);
                return Ok(Some(plan));
            }
        }
        Ok(None)
    }

    /// Plan evacuations that make `node` hold `demand` in memory, then in
    /// disk. Residents are taken from the smallest one whose usage alone
    /// covers the shortfall downwards; each is re-homed with a direct
    /// search over the planning buffers.
    pub fn attempt_clearing_space_on_node(
        &self,
        cluster: &ClusterManager,
        now: SimTime,
        node: NodeId,
        demand: &ResourceUsage,
        rng: &mut dyn RngCore,
    ) -> Result<ClearPlan> {
        let capacity = cluster.capacity();
        let mut usages = cluster.usages();
        let mut moves: Vec<PlannedMove> = Vec::new();
        let mut complete = true;

        for resource in [SortResource::Memory, SortResource::Disk] {
            let limit = resource.of(&capacity);
            let wanted = resource.of(demand);
            let mut need = wanted - (limit - resource.of(&usages[node.index()]));
            if need <= 0.0 {
                continue;
            }
            let residents = cluster.replicas_on_node_sorted(now, node, resource)?;
            if residents.is_empty() {
                complete = false;
                break;
            }
            let sizes: Vec<f64> = residents.iter().map(|(_, u)| resource.of(u)).collect();
            let start = sizes.iter().position(|&s| need <= s).unwrap_or(sizes.len() - 1);

            let mut cursor = Some(start);
            while let Some(idx) = cursor {
                let mut next = idx.checked_sub(1);
                let (resident, usage) = &residents[idx];
                if !moves.iter().any(|m| &m.replica == resident) {
                    if let Some(dst) = self.find_node(cluster, resident, &usages, usage, Some(node), rng) {
                        moves.push(PlannedMove {
                            replica: resident.clone(),
                            dst,
                        });
                        usages[node.index()] -= *usage;
                        usages[dst.index()] += *usage;
                        need -= resource.of(usage);
                        if wanted <= limit - resource.of(&usages[node.index()]) {
                            break;
                        }
                        // Larger residents than the remaining need are skipped
                        let mut shifted = idx;
                        while shifted > 0 && need <= sizes[shifted - 1] {
                            shifted -= 1;
                        }
                        if shifted != idx {
                            next = Some(shifted);
                        }
                    }
                }
                cursor = next;
            }

            if wanted > limit - resource.of(&usages[node.index()]) {
                complete = false;
                break;
            }
        }

        Ok(ClearPlan {
            node,
            moves,
            complete,
            usage_after: usages[node.index()],
        })
    }

    /// Post-check of a node that was just cleared: it must now take the
    /// replica directly
    pub fn verify_cleared_node(
        &self,
        cluster: &ClusterManager,
        replica: &ReplicaId,
        demand: &ResourceUsage,
        src: Option<NodeId>,
        node: NodeId,
    ) -> Result<()> {
        let excluded = cluster.excluded_nodes(replica);
        let fits = (cluster.node(node).current + *demand).fits_within(&cluster.capacity());
        if excluded.contains(&node) || src == Some(node) || !fits {
            return Err(CapsimError::invariant(format!(
                "{node} cleared for {replica} cannot take it"
            )));
        }
        Ok(())
    }

    /// Sibling of `replica` to exchange nodes with. Both nodes must hold
    /// their new residents. With a preference applied the lowest (Lower) or
    /// highest (Upper) sibling node wins; otherwise later candidates replace
    /// the current choice on a coin flip.
    pub fn choose_replica_to_swap_with(
        &self,
        cluster: &ClusterManager,
        now: SimTime,
        replica: &ReplicaId,
        preference: PlacementPreference,
        rng: &mut dyn RngCore,
    ) -> Result<Option<ReplicaId>> {
        let src = cluster
            .placement_of(replica)
            .ok_or_else(|| CapsimError::UnknownReplica(replica.to_string()))?;
        let usage = cluster.current_usage(replica, now)?;
        let capacity = cluster.capacity();

        let mut choice: Option<(ReplicaId, NodeId)> = None;
        for sibling in cluster.group_of(replica).unwrap_or_default() {
            if sibling == replica {
                continue;
            }
            let Some(dst) = cluster.placement_of(sibling) else {
                continue;
            };
            let sibling_usage = cluster.current_usage(sibling, now)?;
            let into_dst = cluster.node(dst).current - sibling_usage + usage;
            let into_src = cluster.node(src).current - usage + sibling_usage;
            if !into_dst.fits_within(&capacity) || !into_src.fits_within(&capacity) {
                continue;
            }

            let take = match &choice {
                None => true,
                Some((_, best)) if self.apply_placement_preference => match preference {
                    PlacementPreference::LowerUpgradeDomains => dst < *best,
                    PlacementPreference::UpperUpgradeDomains => dst > *best,
                    PlacementPreference::None => false,
                },
                Some(_) => rng.gen_bool(0.5),
            };
            if take {
                choice = Some((sibling.clone(), dst));
            }
        }
        Ok(choice.map(|(sibling, _)| sibling))
    }
}
