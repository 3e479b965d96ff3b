//! Cluster manager
//!
//! Owns every piece of mutable state of a run:
//! - Per-node current and high-watermark usage
//! - Replica residency and placement times
//! - Tenant registration and the active tenant set
//! - Ring-wide allocated footprint and the CPU ceiling
//! - Upgrade-domain exclusion and the placement preference
//!
//! Node choices come from a [`PlacementSelector`], which only reads this
//! state. The manager applies the moves it plans and is the sole mutator of
//! resource accounting.

use capsim_core::{
    CapsimError, CpuUnits, NODES_PER_UPGRADE_DOMAIN, NodeId, PlacementPreference, ReplicaId,
    ResourceUsage, Result, Role, SimTime, SloCatalog, TenantKey, UsageTrace,
};
use rand::RngCore;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

use crate::config::ExperimentParams;
use crate::placement::{ClearPlan, PlacementSelector};
use crate::predictor::ViolationPredictor;
use crate::trace::{ReplicaTrace, TraceSet};

/// One node of the ring
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    /// Sum of the residents' current usage
    pub current: ResourceUsage,
    /// Sum of the residents' trace maxima
    pub max: ResourceUsage,
    replicas: BTreeSet<ReplicaId>,
}

impl Node {
    fn new(id: NodeId) -> Self {
        Self {
            id,
            current: ResourceUsage::ZERO,
            max: ResourceUsage::ZERO,
            replicas: BTreeSet::new(),
        }
    }

    pub fn replicas(&self) -> impl Iterator<Item = &ReplicaId> {
        self.replicas.iter()
    }

    pub fn num_replicas(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn hosts(&self, replica: &ReplicaId) -> bool {
        self.replicas.contains(replica)
    }
}

#[derive(Debug, Clone, Copy)]
struct Placement {
    node: NodeId,
    placed_at: SimTime,
}

/// Why a replica moves; decides which counter the move lands in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveKind {
    Regular,
    /// Clearing space so an arriving replica fits
    EnablePlacement,
    /// Half of a primary/secondary swap
    Swap,
}

/// Resource residents of a node are ordered by when clearing space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortResource {
    Memory,
    Disk,
}

impl SortResource {
    pub fn of(self, usage: &ResourceUsage) -> f64 {
        match self {
            SortResource::Memory => usage.memory,
            SortResource::Disk => usage.disk,
        }
    }
}

/// Move statistics accumulated between two reporting intervals
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IntervalCounters {
    pub moves: u64,
    pub moves_due_to_clear_space: u64,
    /// Cores moved
    pub cpu_moved: f64,
    pub memory_moved: f64,
    pub disk_moved: f64,
}

/// Cluster state for one simulation run
pub struct ClusterManager {
    capacity: ResourceUsage,
    nodes: Vec<Node>,
    placements: BTreeMap<ReplicaId, Placement>,
    tenants: BTreeMap<TenantKey, Vec<ReplicaId>>,
    active_tenants: BTreeSet<TenantKey>,
    traces: Arc<TraceSet>,
    slos: Arc<dyn SloCatalog>,
    predictor: Arc<ViolationPredictor>,
    apply_fault_domain_constraints: bool,
    nodes_under_upgrade: BTreeSet<NodeId>,
    domain_under_upgrade: Option<usize>,
    placement_preference: PlacementPreference,
    allocated: ResourceUsage,
    ceiling: ResourceUsage,
    domain_cpu_share: CpuUnits,
    ceiling_shrunk: bool,

    pub num_moves: u64,
    pub num_moves_to_enable_placement: u64,
    pub num_swaps: u64,
    pub interval: IntervalCounters,
}

impl ClusterManager {
    pub fn new(
        params: &ExperimentParams,
        traces: Arc<TraceSet>,
        slos: Arc<dyn SloCatalog>,
        predictor: Arc<ViolationPredictor>,
    ) -> Result<Self> {
        params.validate()?;
        let num_nodes = params.num_nodes as f64;
        let ceiling = ResourceUsage::new(
            CpuUnits::from_cores(
                params.cpu_cap * params.node_num_cores * num_nodes * params.overbooking_ratio,
            ),
            params.memory_cap * params.node_memory_mb * num_nodes,
            params.disk_cap * params.node_disk_mb * num_nodes,
        );
        let num_domains = params.num_upgrade_domains() as f64;

        Ok(Self {
            capacity: ResourceUsage::new(
                CpuUnits::from_cores(params.node_num_cores),
                params.node_memory_mb,
                params.node_disk_mb,
            ),
            nodes: (0..params.num_nodes).map(|i| Node::new(NodeId(i))).collect(),
            placements: BTreeMap::new(),
            tenants: BTreeMap::new(),
            active_tenants: BTreeSet::new(),
            traces,
            slos,
            predictor,
            apply_fault_domain_constraints: params.apply_fault_domain_constraints,
            nodes_under_upgrade: BTreeSet::new(),
            domain_under_upgrade: None,
            placement_preference: PlacementPreference::None,
            allocated: ResourceUsage::ZERO,
            ceiling,
            domain_cpu_share: ceiling.cpu.scale(1.0 / num_domains),
            ceiling_shrunk: false,
            num_moves: 0,
            num_moves_to_enable_placement: 0,
            num_swaps: 0,
            interval: IntervalCounters::default(),
        })
    }

    // ----- Read access -----

    /// Per-node capacity
    pub fn capacity(&self) -> ResourceUsage {
        self.capacity
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_upgrade_domains(&self) -> usize {
        self.nodes.len() / NODES_PER_UPGRADE_DOMAIN
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Node of the ring; `id` must come from this ring
    pub(crate) fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn get_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    fn checked_node(&self, id: NodeId) -> Result<&Node> {
        self.get_node(id)
            .ok_or_else(|| CapsimError::invariant(format!("{id} is not part of the ring")))
    }

    /// Nodes of an upgrade domain that exist in this ring
    fn domain_nodes(&self, domain: usize) -> impl Iterator<Item = &Node> + '_ {
        NodeId::in_upgrade_domain(domain).filter_map(move |n| self.get_node(n))
    }

    /// Snapshot of every node's current usage, indexed by node
    pub fn usages(&self) -> Vec<ResourceUsage> {
        self.nodes.iter().map(|n| n.current).collect()
    }

    pub fn traces(&self) -> &TraceSet {
        &self.traces
    }

    pub fn slos(&self) -> &dyn SloCatalog {
        self.slos.as_ref()
    }

    pub fn predictor(&self) -> &ViolationPredictor {
        &self.predictor
    }

    pub fn placement_of(&self, replica: &ReplicaId) -> Option<NodeId> {
        self.placements.get(replica).map(|p| p.node)
    }

    pub fn placed_at(&self, replica: &ReplicaId) -> Option<SimTime> {
        self.placements.get(replica).map(|p| p.placed_at)
    }

    pub fn num_active_tenants(&self) -> usize {
        self.active_tenants.len()
    }

    pub fn num_placed_replicas(&self) -> usize {
        self.placements.len()
    }

    /// Replica group of the replica's tenant, primary first
    pub fn group_of(&self, replica: &ReplicaId) -> Option<&[ReplicaId]> {
        self.tenants.get(&replica.tenant_key()).map(Vec::as_slice)
    }

    pub fn role_of(&self, replica: &ReplicaId) -> Option<Role> {
        let group = self.group_of(replica)?;
        let idx = group.iter().position(|r| r == replica)?;
        Some(Role::of(idx, group.len()))
    }

    pub fn is_primary(&self, replica: &ReplicaId) -> bool {
        self.role_of(replica) == Some(Role::Primary)
    }

    pub fn is_standard(&self, replica: &ReplicaId) -> bool {
        self.role_of(replica) == Some(Role::Standard)
    }

    pub fn slo_of(&self, replica: &ReplicaId) -> Result<&str> {
        self.traces.slo_of(replica.tenant())
    }

    pub fn replica_trace(&self, replica: &ReplicaId) -> Result<&ReplicaTrace> {
        self.traces.trace(&replica.canonical).map(|t| t.as_ref())
    }

    /// Time since the replica was placed
    pub fn age(&self, replica: &ReplicaId, now: SimTime) -> Result<SimTime> {
        let placement = self.placement(replica)?;
        Ok(now.since(placement.placed_at))
    }

    /// Usage the replica's trace reports at `now`
    pub fn current_usage(&self, replica: &ReplicaId, now: SimTime) -> Result<ResourceUsage> {
        let age = self.age(replica, now)?;
        Ok(self.replica_trace(replica)?.usage_at(age))
    }

    fn placement(&self, replica: &ReplicaId) -> Result<Placement> {
        self.placements
            .get(replica)
            .copied()
            .ok_or_else(|| CapsimError::UnknownReplica(replica.to_string()))
    }

    /// Nodes a replica may not be placed on or moved to: nodes under
    /// upgrade plus, for multi-replica tenants, the upgrade domain (and
    /// fault domain, when enforced) of every placed sibling
    pub fn excluded_nodes(&self, replica: &ReplicaId) -> BTreeSet<NodeId> {
        let mut excluded = self.nodes_under_upgrade.clone();
        let Some(group) = self.group_of(replica) else {
            return excluded;
        };
        if group.len() < 2 {
            return excluded;
        }
        for sibling in group.iter().filter(|r| *r != replica) {
            let Some(node) = self.placement_of(sibling) else {
                continue;
            };
            excluded.extend(NodeId::in_upgrade_domain(node.upgrade_domain()));
            if self.apply_fault_domain_constraints {
                excluded.extend(self.fault_domain_nodes(node.fault_domain()));
            }
        }
        excluded
    }

    fn fault_domain_nodes(&self, fault_domain: usize) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len())
            .map(NodeId)
            .filter(move |n| n.fault_domain() == fault_domain)
    }

    // ----- Capacity predicates -----

    /// Ring-wide sum of active replicas' guaranteed footprints
    pub fn allocated(&self) -> ResourceUsage {
        self.allocated
    }

    pub fn cpu_ceiling(&self) -> CpuUnits {
        self.ceiling.cpu
    }

    /// Allocated CPU has reached the (possibly shrunk) ring ceiling
    pub fn is_cpu_capacity_reached(&self) -> bool {
        self.allocated.cpu >= self.ceiling.cpu
    }

    pub fn is_node_in_memory_violation(&self, node: NodeId) -> bool {
        self.get_node(node)
            .is_some_and(|n| n.current.memory > self.capacity.memory)
    }

    pub fn is_node_in_disk_violation(&self, node: NodeId) -> bool {
        self.get_node(node)
            .is_some_and(|n| n.current.disk > self.capacity.disk)
    }

    pub fn is_node_in_cpu_violation(&self, node: NodeId) -> bool {
        self.get_node(node).is_some_and(|n| n.current.cpu > self.capacity.cpu)
    }

    pub fn is_node_in_violation(&self, node: NodeId) -> bool {
        self.is_node_in_memory_violation(node) || self.is_node_in_disk_violation(node)
    }

    pub fn is_any_node_in_violation(&self) -> bool {
        self.nodes.iter().any(|n| self.is_node_in_violation(n.id))
    }

    // ----- Upgrade bookkeeping -----

    pub fn nodes_under_upgrade(&self) -> &BTreeSet<NodeId> {
        &self.nodes_under_upgrade
    }

    pub fn domain_under_upgrade(&self) -> Option<usize> {
        self.domain_under_upgrade
    }

    pub fn placement_preference(&self) -> PlacementPreference {
        self.placement_preference
    }

    pub fn set_placement_preference(&mut self, preference: PlacementPreference) {
        self.placement_preference = preference;
    }

    /// Exclude a domain's nodes from placement while it is upgraded
    pub fn begin_domain_upgrade(&mut self, domain: usize) {
        self.domain_under_upgrade = Some(domain);
        self.nodes_under_upgrade = NodeId::in_upgrade_domain(domain).collect();
    }

    /// Shrink the CPU ceiling by one domain's share for an upgrade cycle
    pub fn shrink_cpu_ceiling(&mut self) {
        if !self.ceiling_shrunk {
            self.ceiling.cpu -= self.domain_cpu_share;
            self.ceiling_shrunk = true;
        }
    }

    /// Lift all upgrade exclusions and restore the ceiling
    pub fn end_upgrade_cycle(&mut self) {
        self.domain_under_upgrade = None;
        self.nodes_under_upgrade.clear();
        if self.ceiling_shrunk {
            self.ceiling.cpu += self.domain_cpu_share;
            self.ceiling_shrunk = false;
        }
    }

    /// Remove the footprints of a cleared domain's residents from the ring
    pub fn release_domain_footprint(&mut self, domain: usize) -> Result<()> {
        let total = self.domain_footprint(domain)?;
        self.allocated -= total;
        Ok(())
    }

    /// Add a domain's residents back once it leaves maintenance
    pub fn restore_domain_footprint(&mut self, domain: usize) -> Result<()> {
        let total = self.domain_footprint(domain)?;
        self.allocated += total;
        Ok(())
    }

    fn domain_footprint(&self, domain: usize) -> Result<ResourceUsage> {
        let mut total = ResourceUsage::ZERO;
        for node in self.domain_nodes(domain) {
            for replica in &node.replicas {
                total += self.footprint(replica)?;
            }
        }
        Ok(total)
    }

    fn footprint(&self, replica: &ReplicaId) -> Result<ResourceUsage> {
        self.slos.footprint(self.slo_of(replica)?)
    }

    // ----- Placement -----

    /// Register a tenant and place its replicas, secondaries first. A
    /// failure unwinds every replica of the group committed so far.
    pub fn place(
        &mut self,
        selector: &mut PlacementSelector,
        now: SimTime,
        group: &[ReplicaId],
        rng: &mut dyn RngCore,
    ) -> Result<()> {
        let Some(first) = group.first() else {
            return Err(CapsimError::invariant("empty replica group"));
        };
        let key = first.tenant_key();
        if self.tenants.contains_key(&key) {
            return Err(CapsimError::invariant(format!("tenant {key} placed twice")));
        }
        let slo = self.traces.slo_of(&key.tenant)?.to_string();
        self.tenants.insert(key.clone(), group.to_vec());

        let mut committed: Vec<&ReplicaId> = Vec::with_capacity(group.len());
        for idx in placement_order(group.len()) {
            let replica = &group[idx];
            match self.place_replica(selector, now, replica, &slo, rng) {
                Ok(()) => committed.push(replica),
                Err(e) => {
                    for placed in committed {
                        self.withdraw(now, placed)?;
                    }
                    self.active_tenants.remove(&key);
                    self.tenants.remove(&key);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn place_replica(
        &mut self,
        selector: &mut PlacementSelector,
        now: SimTime,
        replica: &ReplicaId,
        slo: &str,
        rng: &mut dyn RngCore,
    ) -> Result<()> {
        let reserved = ReplicaTrace::placement_demand(self.slos.max_cpu(slo)?);
        let demand = self.predictor.predicted_max_usage(reserved, slo);

        let pick = selector
            .choose_node_to_place(&*self, now, replica, slo, &demand, rng)?
            .ok_or_else(|| CapsimError::infeasible(replica, "no node fits even after clearing space"))?;
        if let Some(plan) = &pick.clearing {
            self.apply_clear_plan(now, plan, MoveKind::EnablePlacement)?;
            // Only eligibility is checked; a fresh search could prefer another node
            selector.verify_cleared_node(&*self, replica, &demand, None, plan.node)?;
        }

        let trace = Arc::clone(self.traces.trace(&replica.canonical)?);
        let actual = trace.usage_at(SimTime::ZERO);
        self.active_tenants.insert(replica.tenant_key());
        self.allocated += self.slos.footprint(slo)?;
        self.placements.insert(
            replica.clone(),
            Placement {
                node: pick.node,
                placed_at: now,
            },
        );
        let node = &mut self.nodes[pick.node.index()];
        node.replicas.insert(replica.clone());
        node.current += actual;
        node.max += trace.max_usage();
        debug!("Placed {} on {}", replica, pick.node);
        Ok(())
    }

    /// Undo a placement made at `now`
    fn withdraw(&mut self, now: SimTime, replica: &ReplicaId) -> Result<()> {
        let placement = self.placement(replica)?;
        let trace = self.replica_trace(replica)?;
        let usage = trace.usage_at(now.since(placement.placed_at));
        let max = trace.max_usage();
        let footprint = self.footprint(replica)?;

        self.placements.remove(replica);
        let node = &mut self.nodes[placement.node.index()];
        node.replicas.remove(replica);
        node.current -= usage;
        node.max -= max;
        if !self.nodes_under_upgrade.contains(&placement.node) {
            self.allocated -= footprint;
        }
        Ok(())
    }

    // ----- Lifecycle -----

    /// Evict every tenant whose primary trace has ended, releasing its
    /// footprint unless the replica sits in the domain under upgrade. Nodes
    /// that lost residents are re-reported at `now`. Returns the evicted
    /// replicas.
    pub fn evict_tenants_if_lifetime_elapsed(&mut self, now: SimTime) -> Result<Vec<ReplicaId>> {
        let mut expired = Vec::new();
        for key in &self.active_tenants {
            let Some(first) = self.tenants.get(key).and_then(|g| g.first()) else {
                continue;
            };
            let age = self.age(first, now)?;
            if !self.replica_trace(first)?.is_active(age) {
                expired.push(key.clone());
            }
        }

        let mut evicted = Vec::new();
        let mut touched = BTreeSet::new();
        for key in expired {
            self.active_tenants.remove(&key);
            let group = self.tenants.remove(&key).unwrap_or_default();
            for replica in group {
                let Some(placement) = self.placements.remove(&replica) else {
                    continue;
                };
                let footprint = self.footprint(&replica)?;
                self.nodes[placement.node.index()].replicas.remove(&replica);
                touched.insert(placement.node);
                if !self.nodes_under_upgrade.contains(&placement.node) {
                    self.allocated -= footprint;
                }
                evicted.push(replica);
            }
        }
        for node in touched {
            self.report_node(now, node)?;
        }
        if !evicted.is_empty() {
            debug!("Evicted {} replicas at {}", evicted.len(), now);
        }
        Ok(evicted)
    }

    fn report_node(&mut self, now: SimTime, node: NodeId) -> Result<()> {
        let mut current = ResourceUsage::ZERO;
        let mut max = ResourceUsage::ZERO;
        for replica in &self.node(node).replicas {
            let placement = self.placement(replica)?;
            let trace = self.replica_trace(replica)?;
            current += trace.usage_at(now.since(placement.placed_at));
            max += trace.max_usage();
        }
        let node = &mut self.nodes[node.index()];
        node.current = current;
        node.max = max;
        Ok(())
    }

    /// Recompute every node's current and max usage from the traces
    pub fn update_resource_usage_with_new_reports(&mut self, now: SimTime) -> Result<()> {
        let mut current = vec![ResourceUsage::ZERO; self.nodes.len()];
        let mut max = vec![ResourceUsage::ZERO; self.nodes.len()];
        for (replica, placement) in &self.placements {
            let trace = self.traces.trace(&replica.canonical)?;
            current[placement.node.index()] += trace.usage_at(now.since(placement.placed_at));
            max[placement.node.index()] += trace.max_usage();
        }
        for (node, (current, max)) in self.nodes.iter_mut().zip(current.into_iter().zip(max)) {
            node.current = current;
            node.max = max;
        }
        Ok(())
    }

    // ----- Movement -----

    /// Move a replica with its current usage from its node to `dst`
    pub fn move_replica(
        &mut self,
        now: SimTime,
        replica: &ReplicaId,
        dst: NodeId,
        kind: MoveKind,
    ) -> Result<()> {
        let placement = self.placement(replica)?;
        let src = placement.node;
        if src == dst {
            return Err(CapsimError::invariant(format!("{replica} moved onto its own node {dst}")));
        }
        if dst.index() >= self.nodes.len() {
            return Err(CapsimError::invariant(format!("{replica} moved to missing {dst}")));
        }
        let trace = self.replica_trace(replica)?;
        let usage = trace.usage_at(now.since(placement.placed_at));
        let max = trace.max_usage();

        match kind {
            MoveKind::Regular => self.num_moves += 1,
            MoveKind::EnablePlacement => self.num_moves_to_enable_placement += 1,
            MoveKind::Swap => {}
        }

        let from = &mut self.nodes[src.index()];
        from.current -= usage;
        from.max -= max;
        from.replicas.remove(replica);
        let to = &mut self.nodes[dst.index()];
        to.current += usage;
        to.max += max;
        to.replicas.insert(replica.clone());
        if let Some(p) = self.placements.get_mut(replica) {
            p.node = dst;
        }

        self.interval.moves += 1;
        self.interval.cpu_moved += usage.cpu.cores();
        self.interval.memory_moved += usage.memory;
        self.interval.disk_moved += usage.disk;
        debug!("Moved {} from {} to {} ({:?})", replica, src, dst, kind);
        Ok(())
    }

    /// Exchange the nodes of two replicas
    pub fn swap(&mut self, now: SimTime, a: &ReplicaId, b: &ReplicaId) -> Result<()> {
        let node_a = self.placement(a)?.node;
        let node_b = self.placement(b)?.node;
        self.num_swaps += 1;
        self.move_replica(now, a, node_b, MoveKind::Swap)?;
        self.move_replica(now, b, node_a, MoveKind::Swap)
    }

    /// Ask the selector for a new node and move the replica there
    pub fn move_with_selector(
        &mut self,
        selector: &mut PlacementSelector,
        now: SimTime,
        replica: &ReplicaId,
        rng: &mut dyn RngCore,
    ) -> Result<NodeId> {
        let src = self.placement(replica)?.node;
        let usage = self.current_usage(replica, now)?;
        let pick = selector
            .choose_node_to_move(&*self, now, replica, rng)?
            .ok_or_else(|| CapsimError::infeasible(replica, format!("cannot be moved off {src}")))?;
        if let Some(plan) = &pick.clearing {
            self.apply_clear_plan(now, plan, MoveKind::Regular)?;
            // Only eligibility is checked; a fresh search could prefer another node
            selector.verify_cleared_node(&*self, replica, &usage, Some(src), plan.node)?;
        }
        self.move_replica(now, replica, pick.node, MoveKind::Regular)?;
        Ok(pick.node)
    }

    /// Apply the moves of a clear-space plan in order
    pub fn apply_clear_plan(&mut self, now: SimTime, plan: &ClearPlan, kind: MoveKind) -> Result<()> {
        for planned in &plan.moves {
            self.move_replica(now, &planned.replica, planned.dst, kind)?;
        }
        self.interval.moves_due_to_clear_space += plan.moves.len() as u64;
        Ok(())
    }

    /// Plan moves that bring a node back within its memory and disk
    /// capacity. The plan is returned even when it falls short.
    pub fn find_replicas_to_move_to_fix_violation_on_node(
        &self,
        selector: &PlacementSelector,
        now: SimTime,
        node: NodeId,
        rng: &mut dyn RngCore,
    ) -> Result<ClearPlan> {
        self.checked_node(node)?;
        selector.attempt_clearing_space_on_node(self, now, node, &ResourceUsage::ZERO, rng)
    }

    // ----- Ordered views -----

    /// Residents of a node with their current usage, ascending by `resource`
    pub fn replicas_on_node_sorted(
        &self,
        now: SimTime,
        node: NodeId,
        resource: SortResource,
    ) -> Result<Vec<(ReplicaId, ResourceUsage)>> {
        let mut residents = self
            .checked_node(node)?
            .replicas
            .iter()
            .map(|r| Ok((r.clone(), self.current_usage(r, now)?)))
            .collect::<Result<Vec<_>>>()?;
        residents.sort_by(|a, b| resource.of(&a.1).total_cmp(&resource.of(&b.1)));
        Ok(residents)
    }

    /// Primaries resident in a domain, largest first
    pub fn primary_replicas_sorted(&self, now: SimTime, domain: usize) -> Result<Vec<ReplicaId>> {
        self.domain_replicas_sorted(now, domain, |role| role == Role::Primary, &BTreeSet::new())
    }

    /// Standards resident in a domain merged with `extra`, largest first
    pub fn standard_replicas_sorted(
        &self,
        now: SimTime,
        domain: usize,
        extra: &BTreeSet<ReplicaId>,
    ) -> Result<Vec<ReplicaId>> {
        self.domain_replicas_sorted(now, domain, |role| role == Role::Standard, extra)
    }

    /// Primaries and standards resident in a domain, largest first
    pub fn primary_and_standard_replicas_sorted(
        &self,
        now: SimTime,
        domain: usize,
    ) -> Result<Vec<ReplicaId>> {
        self.domain_replicas_sorted(now, domain, |role| role != Role::Secondary, &BTreeSet::new())
    }

    fn domain_replicas_sorted(
        &self,
        now: SimTime,
        domain: usize,
        keep: impl Fn(Role) -> bool,
        extra: &BTreeSet<ReplicaId>,
    ) -> Result<Vec<ReplicaId>> {
        let mut selected: Vec<ReplicaId> = self
            .domain_nodes(domain)
            .flat_map(|n| n.replicas.iter())
            .filter(|r| self.role_of(r).is_some_and(&keep))
            .cloned()
            .collect();
        let merged: Vec<ReplicaId> = extra.iter().filter(|r| !selected.contains(r)).cloned().collect();
        selected.extend(merged);

        let mut weighted = selected
            .into_iter()
            .map(|r| {
                let usage = self.current_usage(&r, now)?;
                let weight = (usage.memory / self.capacity.memory).max(usage.disk / self.capacity.disk);
                Ok((r, weight))
            })
            .collect::<Result<Vec<_>>>()?;
        weighted.sort_by(|a, b| b.1.total_cmp(&a.1));
        Ok(weighted.into_iter().map(|(r, _)| r).collect())
    }

    /// Replica count per node of a domain
    pub fn domain_replica_counts(&self, domain: usize) -> [usize; NODES_PER_UPGRADE_DOMAIN] {
        let mut counts = [0; NODES_PER_UPGRADE_DOMAIN];
        for (slot, node) in counts.iter_mut().zip(self.domain_nodes(domain)) {
            *slot = node.num_replicas();
        }
        counts
    }

    /// Residency maps agree with each other
    pub fn check_consistency(&self) -> Result<()> {
        let resident: usize = self.nodes.iter().map(Node::num_replicas).sum();
        if resident != self.placements.len() {
            return Err(CapsimError::invariant(format!(
                "{} residents but {} placements",
                resident,
                self.placements.len()
            )));
        }
        for (replica, placement) in &self.placements {
            if !self.node(placement.node).hosts(replica) {
                return Err(CapsimError::invariant(format!(
                    "{replica} placed on {} but not resident there",
                    placement.node
                )));
            }
        }
        Ok(())
    }
}

/// Commit order of a replica group: replica 1 first so the primary sees a
/// placed sibling
fn placement_order(len: usize) -> Vec<usize> {
    if len < 2 {
        return (0..len).collect();
    }
    let mut order = vec![1, 0];
    order.extend(2..len);
    order
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::slo::{SloEntry, SloSpecification};
    use crate::trace::tests::flat_trace;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    pub(crate) const STANDARD_SLO: &str = "SQLDB_GP_1";
    pub(crate) const PREMIUM_SLO: &str = "SQLDB_BC_1";

    /// One-core SLOs; replicas reserve 3072 MB memory and 50000 MB disk
    pub(crate) fn test_catalog() -> Arc<SloSpecification> {
        Arc::new(SloSpecification::from_entries(
            vec![
                SloEntry::new(STANDARD_SLO, 1.0, 100.0, 100.0, false),
                SloEntry::new(PREMIUM_SLO, 1.0, 100.0, 100.0, true),
            ],
            "Gen5",
        ))
    }

    /// Trace set of standard tenants `s{i}` and premium tenants `p{i}`, all
    /// with flat usage for 10 days
    pub(crate) fn trace_set(standards: &[ResourceUsage], premiums: &[ResourceUsage]) -> Arc<TraceSet> {
        let lifetime = 10 * 24 * 60;
        let mut traces = Vec::new();
        for (i, usage) in standards.iter().enumerate() {
            traces.push((format!("tr1_DB{i}_s{i}"), STANDARD_SLO.to_string(), flat_trace(*usage, lifetime)));
        }
        for (i, usage) in premiums.iter().enumerate() {
            for r in 0..4 {
                traces.push((
                    format!("tr1_DB{}_p{i}", 100 + r),
                    PREMIUM_SLO.to_string(),
                    flat_trace(*usage, lifetime),
                ));
            }
        }
        Arc::new(TraceSet::from_traces(traces, false).unwrap())
    }

    /// Nodes of 4 cores, 8192 MB memory and 200000 MB disk
    pub(crate) fn params(num_nodes: usize) -> ExperimentParams {
        ExperimentParams::default().with_nodes(num_nodes, 4.0, 8192.0, 200_000.0)
    }

    pub(crate) fn cluster(params: &ExperimentParams, traces: Arc<TraceSet>) -> ClusterManager {
        ClusterManager::new(params, traces, test_catalog(), predictor()).unwrap()
    }

    pub(crate) fn predictor() -> Arc<ViolationPredictor> {
        Arc::new(ViolationPredictor::default())
    }

    pub(crate) fn selector(params: &ExperimentParams) -> PlacementSelector {
        PlacementSelector::from_params(params, predictor())
    }

    pub(crate) fn usage(memory: f64, disk: f64) -> ResourceUsage {
        ResourceUsage::new(CpuUnits::from_cores(0.1), memory, disk)
    }

    pub(crate) fn standard(i: usize, instance: u64) -> Vec<ReplicaId> {
        vec![ReplicaId::new(format!("tr1_DB{i}_s{i}"), instance)]
    }

    pub(crate) fn premium(set: &TraceSet, i: usize, instance: u64) -> Vec<ReplicaId> {
        set.replicas_of(&format!("p{i}"))
            .unwrap()
            .iter()
            .map(|c| ReplicaId::new(c.clone(), instance))
            .collect()
    }

    #[test]
    fn test_placement_order() {
        assert_eq!(placement_order(1), vec![0]);
        assert_eq!(placement_order(4), vec![1, 0, 2, 3]);
    }

    #[test]
    fn test_place_accounts_usage_and_footprint() {
        let traces = trace_set(&[usage(200.0, 150.0)], &[]);
        let params = params(4);
        let mut cluster = cluster(&params, Arc::clone(&traces));
        let mut selector = selector(&params);
        let mut rng = StdRng::seed_from_u64(0);

        let group = standard(0, 1);
        cluster.place(&mut selector, SimTime::ZERO, &group, &mut rng).unwrap();

        let node = cluster.placement_of(&group[0]).unwrap();
        assert_eq!(cluster.node(node).current.memory, 200.0);
        assert_eq!(cluster.node(node).current.disk, 150.0);
        assert_eq!(cluster.allocated().cpu, CpuUnits::from_cores(1.0));
        assert_eq!(cluster.allocated().memory, 100.0);
        assert_eq!(cluster.num_active_tenants(), 1);
        assert!(cluster.is_standard(&group[0]));
        cluster.check_consistency().unwrap();
    }

    #[test]
    fn test_premium_replicas_spread_over_domains() {
        let traces = trace_set(&[], &[usage(100.0, 100.0)]);
        let params = params(16).with_fault_domains(true);
        let mut cluster = cluster(&params, Arc::clone(&traces));
        let mut selector = selector(&params);
        let mut rng = StdRng::seed_from_u64(3);

        let group = premium(&traces, 0, 1);
        cluster.place(&mut selector, SimTime::ZERO, &group, &mut rng).unwrap();

        let domains: BTreeSet<usize> = group
            .iter()
            .map(|r| cluster.placement_of(r).unwrap().upgrade_domain())
            .collect();
        assert_eq!(domains.len(), 4);
        assert!(cluster.is_primary(&group[0]));
        for replica in &group {
            let node = cluster.placement_of(replica).unwrap();
            assert!(!cluster.excluded_nodes(replica).contains(&node));
        }
    }

    #[test]
    fn test_failed_group_is_fully_unwound() {
        // Two upgrade domains cannot host a four-replica tenant
        let traces = trace_set(&[], &[usage(100.0, 100.0)]);
        let params = params(8);
        let mut cluster = cluster(&params, Arc::clone(&traces));
        let mut selector = selector(&params);
        let mut rng = StdRng::seed_from_u64(0);

        let group = premium(&traces, 0, 1);
        let err = cluster
            .place(&mut selector, SimTime::ZERO, &group, &mut rng)
            .unwrap_err();
        assert!(err.is_placement_infeasible());
        assert_eq!(cluster.num_placed_replicas(), 0);
        assert_eq!(cluster.num_active_tenants(), 0);
        assert_eq!(cluster.allocated(), ResourceUsage::ZERO);
        assert!(cluster.nodes().iter().all(|n| n.current == ResourceUsage::ZERO));
        assert!(cluster.group_of(&group[0]).is_none());
    }

    #[test]
    fn test_move_transfers_usage_not_allocation() {
        let traces = trace_set(&[usage(300.0, 100.0)], &[]);
        let params = params(4);
        let mut cluster = cluster(&params, Arc::clone(&traces));
        let mut selector = selector(&params);
        let mut rng = StdRng::seed_from_u64(1);
        let group = standard(0, 7);
        cluster.place(&mut selector, SimTime::ZERO, &group, &mut rng).unwrap();

        let src = cluster.placement_of(&group[0]).unwrap();
        let dst = NodeId((src.index() + 1) % 4);
        let allocated = cluster.allocated();
        cluster.move_replica(SimTime::from_minutes(10), &group[0], dst, MoveKind::Regular).unwrap();

        assert_eq!(cluster.node(src).current, ResourceUsage::ZERO);
        assert_eq!(cluster.node(dst).current.memory, 300.0);
        assert_eq!(cluster.allocated(), allocated);
        assert_eq!(cluster.num_moves, 1);
        assert_eq!(cluster.interval.moves, 1);
        assert_eq!(cluster.interval.memory_moved, 300.0);
        assert!(cluster.move_replica(SimTime::ZERO, &group[0], dst, MoveKind::Regular).is_err());
        cluster.check_consistency().unwrap();
    }

    #[test]
    fn test_eviction_releases_footprint_and_residency() {
        let traces = trace_set(&[usage(100.0, 100.0)], &[]);
        let params = params(4);
        let mut cluster = cluster(&params, Arc::clone(&traces));
        let mut selector = selector(&params);
        let mut rng = StdRng::seed_from_u64(1);
        cluster.place(&mut selector, SimTime::ZERO, &standard(0, 1), &mut rng).unwrap();

        let still_alive = SimTime::from_hours(24);
        assert!(cluster.evict_tenants_if_lifetime_elapsed(still_alive).unwrap().is_empty());

        let after_end = SimTime::from_hours(11 * 24);
        let evicted = cluster.evict_tenants_if_lifetime_elapsed(after_end).unwrap();
        assert_eq!(evicted.len(), 1);
        cluster.update_resource_usage_with_new_reports(after_end).unwrap();
        assert_eq!(cluster.allocated(), ResourceUsage::ZERO);
        assert_eq!(cluster.num_placed_replicas(), 0);
        assert!(cluster.nodes().iter().all(|n| n.current == ResourceUsage::ZERO));
    }

    #[test]
    fn test_eviction_rereports_node_usage() {
        let traces = trace_set(&[usage(100.0, 100.0)], &[]);
        let params = params(4);
        let mut cluster = cluster(&params, Arc::clone(&traces));
        let mut selector = selector(&params);
        let mut rng = StdRng::seed_from_u64(1);
        let group = standard(0, 1);
        cluster.place(&mut selector, SimTime::ZERO, &group, &mut rng).unwrap();
        let node = cluster.placement_of(&group[0]).unwrap();
        assert_eq!(cluster.node(node).max.memory, 100.0);

        cluster
            .evict_tenants_if_lifetime_elapsed(SimTime::from_hours(11 * 24))
            .unwrap();
        assert_eq!(cluster.node(node).current, ResourceUsage::ZERO);
        assert_eq!(cluster.node(node).max, ResourceUsage::ZERO);
    }

    #[test]
    fn test_place_clears_space_on_loaded_ring() {
        // Every node ends up at 5500 MB: one 4000 MB and one 1500 MB replica
        let mut loads = vec![usage(4000.0, 100.0); 4];
        loads.extend([usage(1500.0, 100.0); 4]);
        loads.push(usage(100.0, 100.0));
        let traces = trace_set(&loads, &[]);
        let params = params(4);
        let mut cluster = cluster(&params, Arc::clone(&traces));
        let mut selector = selector(&params);
        let mut rng = StdRng::seed_from_u64(5);
        for i in 0..8 {
            cluster.place(&mut selector, SimTime::ZERO, &standard(i, 1), &mut rng).unwrap();
        }
        assert!(cluster.nodes().iter().all(|n| n.current.memory == 5500.0));

        let arriving = standard(8, 1);
        cluster.place(&mut selector, SimTime::ZERO, &arriving, &mut rng).unwrap();

        assert_eq!(cluster.num_moves_to_enable_placement, 1);
        assert_eq!(cluster.num_moves, 0);
        assert_eq!(cluster.interval.moves_due_to_clear_space, 1);
        let node = cluster.placement_of(&arriving[0]).unwrap();
        assert_eq!(cluster.node(node).current.memory, 4100.0);
        assert!(!cluster.is_any_node_in_violation());
        cluster.check_consistency().unwrap();
    }

    #[test]
    fn test_place_fails_when_clearing_is_impossible() {
        let mut loads = vec![usage(5500.0, 100.0); 4];
        loads.push(usage(100.0, 100.0));
        let traces = trace_set(&loads, &[]);
        let params = params(4);
        let mut cluster = cluster(&params, Arc::clone(&traces));
        let mut selector = selector(&params);
        let mut rng = StdRng::seed_from_u64(5);
        for i in 0..4 {
            cluster.place(&mut selector, SimTime::ZERO, &standard(i, 1), &mut rng).unwrap();
        }
        let usages = cluster.usages();
        let allocated = cluster.allocated();

        let arriving = standard(4, 1);
        let err = cluster
            .place(&mut selector, SimTime::ZERO, &arriving, &mut rng)
            .unwrap_err();
        assert!(matches!(err, CapsimError::PlacementInfeasible { .. }));
        assert_eq!(cluster.usages(), usages);
        assert_eq!(cluster.allocated(), allocated);
        assert_eq!(cluster.num_placed_replicas(), 4);
        assert_eq!(cluster.num_moves_to_enable_placement, 0);
        assert!(cluster.group_of(&arriving[0]).is_none());
        cluster.check_consistency().unwrap();
    }

    #[test]
    fn test_nodes_outside_the_ring_are_rejected() {
        let traces = trace_set(&[usage(100.0, 100.0)], &[]);
        let params = params(4);
        let cluster = cluster(&params, traces);
        let selector = selector(&params);
        let mut rng = StdRng::seed_from_u64(0);
        let outside = NodeId(9);

        assert!(cluster.get_node(outside).is_none());
        assert!(cluster.get_node(NodeId(3)).is_some());
        assert!(!cluster.is_node_in_violation(outside));
        assert!(!cluster.is_node_in_cpu_violation(outside));
        let err = cluster
            .replicas_on_node_sorted(SimTime::ZERO, outside, SortResource::Memory)
            .unwrap_err();
        assert!(matches!(err, CapsimError::InvariantViolation(_)));
        assert!(
            cluster
                .find_replicas_to_move_to_fix_violation_on_node(&selector, SimTime::ZERO, outside, &mut rng)
                .is_err()
        );
        assert_eq!(cluster.domain_replica_counts(3), [0; NODES_PER_UPGRADE_DOMAIN]);
        assert!(cluster.primary_replicas_sorted(SimTime::ZERO, 3).unwrap().is_empty());
    }

    #[test]
    fn test_cpu_capacity_and_violation_predicates() {
        let traces = trace_set(&[usage(100.0, 100.0); 4], &[]);
        // Ceiling = 0.9 * 4 cores * 4 nodes = 14.4 cores; each tenant reserves 1 core
        let params = params(4);
        let mut cluster = cluster(&params, Arc::clone(&traces));
        let mut selector = selector(&params);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(!cluster.is_cpu_capacity_reached());
        for i in 0..4 {
            cluster.place(&mut selector, SimTime::ZERO, &standard(i, 1), &mut rng).unwrap();
        }
        assert!(!cluster.is_cpu_capacity_reached());
        cluster.allocated.cpu = CpuUnits::from_cores(14.4);
        assert!(cluster.is_cpu_capacity_reached());

        cluster.nodes[2].current.memory = 8192.5;
        assert!(cluster.is_node_in_memory_violation(NodeId(2)));
        assert!(cluster.is_node_in_violation(NodeId(2)));
        assert!(!cluster.is_node_in_disk_violation(NodeId(2)));
        assert!(cluster.is_any_node_in_violation());
    }

    #[test]
    fn test_excluded_nodes_follow_upgrade_state() {
        let traces = trace_set(&[usage(10.0, 10.0)], &[]);
        let params = params(8);
        let mut cluster = cluster(&params, Arc::clone(&traces));
        let replica = &standard(0, 1)[0];

        assert!(cluster.excluded_nodes(replica).is_empty());
        cluster.begin_domain_upgrade(0);
        let excluded: Vec<_> = cluster.excluded_nodes(replica).into_iter().collect();
        assert_eq!(excluded, vec![NodeId(0), NodeId(1), NodeId(2), NodeId(3)]);

        cluster.begin_domain_upgrade(1);
        let excluded: Vec<_> = cluster.excluded_nodes(replica).into_iter().collect();
        assert_eq!(excluded, vec![NodeId(4), NodeId(5), NodeId(6), NodeId(7)]);

        cluster.end_upgrade_cycle();
        assert!(cluster.excluded_nodes(replica).is_empty());
    }

    #[test]
    fn test_ceiling_shrinks_once_per_cycle() {
        let traces = trace_set(&[usage(10.0, 10.0)], &[]);
        let params = params(8);
        let mut cluster = cluster(&params, traces);
        let full = cluster.cpu_ceiling();
        cluster.shrink_cpu_ceiling();
        cluster.shrink_cpu_ceiling();
        assert_eq!(cluster.cpu_ceiling(), full - full.scale(0.5));
        cluster.end_upgrade_cycle();
        assert_eq!(cluster.cpu_ceiling(), full);
    }
}
