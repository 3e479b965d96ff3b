//! Rolling upgrades
//!
//! [`UpgradeSchedule`] decides when each upgrade domain goes into
//! maintenance. Successive cycles alternate direction (low to high, then
//! high to low) unless upgrades are unidirectional. [`UpgradeExecutor`]
//! evacuates primaries and standards from a domain before it is marked
//! cleared, swapping primaries with a sibling where possible.
//!
//! Domain clearance is guarded by two checks, both fatal for the run:
//! - No primary or standard replica remains in a cleared domain
//! - A domain cleared earlier in the pass gains no residents before the
//!   next domain starts

use capsim_core::{
    CapsimError, NODES_PER_UPGRADE_DOMAIN, NodeId, PlacementPreference, ReplicaId, Result, SimTime,
};
use rand::RngCore;
use rand::seq::SliceRandom;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::cluster::ClusterManager;
use crate::config::{ExperimentParams, UpgradeHeuristic};
use crate::placement::PlacementSelector;
use crate::predictor::ViolationPredictor;

/// Planned upgrade cycles and the progress through them
#[derive(Debug, Clone)]
pub struct UpgradeSchedule {
    num_domains: usize,
    per_domain: SimTime,
    starts: Vec<SimTime>,
    ends: Vec<SimTime>,
    next: usize,
    unidirectional: bool,
    /// Replica count per node of the last cleared domain
    cleared_counts: [Option<usize>; NODES_PER_UPGRADE_DOMAIN],
}

impl UpgradeSchedule {
    /// Cycles start at `warmup + interval` and repeat every `interval`
    /// while they start within `duration`
    pub fn new(
        warmup: SimTime,
        interval: SimTime,
        num_domains: usize,
        per_domain: SimTime,
        duration: SimTime,
        unidirectional: bool,
    ) -> Self {
        let cycle_length = SimTime::from_minutes(per_domain.minutes() * num_domains as u64);
        let mut starts = Vec::new();
        if interval > SimTime::ZERO && num_domains > 0 {
            let mut start = warmup + interval;
            while start <= duration {
                starts.push(start);
                start = start + interval;
            }
        }
        let ends = starts.iter().map(|&s| s + cycle_length).collect();
        Self {
            num_domains,
            per_domain,
            starts,
            ends,
            next: 0,
            unidirectional,
            cleared_counts: [None; NODES_PER_UPGRADE_DOMAIN],
        }
    }

    pub fn from_params(params: &ExperimentParams) -> Self {
        Self::new(
            SimTime::from_hours(params.warmup_hours),
            SimTime::from_hours(params.upgrade_interval_hours),
            params.num_upgrade_domains(),
            SimTime::from_hours(params.hours_per_domain),
            SimTime::from_hours(params.simulation_duration_hours),
            params.unidirectional_upgrades,
        )
    }

    pub fn num_planned(&self) -> usize {
        self.starts.len()
    }

    pub fn starts(&self) -> &[SimTime] {
        &self.starts
    }

    pub fn ends(&self) -> &[SimTime] {
        &self.ends
    }

    /// Index of the current or next cycle
    pub fn next_index(&self) -> usize {
        self.next
    }

    /// Even cycles go low to high
    pub fn is_lower_to_higher(&self) -> bool {
        self.unidirectional || self.next % 2 == 0
    }

    pub fn initial_domain(&self) -> usize {
        if self.is_lower_to_higher() { 0 } else { self.num_domains.saturating_sub(1) }
    }

    pub fn last_domain(&self) -> usize {
        if self.is_lower_to_higher() { self.num_domains.saturating_sub(1) } else { 0 }
    }

    /// Domain cleared just before `domain` in this pass
    pub fn previous_domain(&self, domain: usize) -> Option<usize> {
        if self.is_lower_to_higher() {
            domain.checked_sub(1)
        } else {
            Some(domain + 1).filter(|&d| d < self.num_domains)
        }
    }

    /// Bias for placements while the cycle runs: towards upgraded domains
    pub fn placement_preference(&self) -> PlacementPreference {
        if self.is_lower_to_higher() {
            PlacementPreference::LowerUpgradeDomains
        } else {
            PlacementPreference::UpperUpgradeDomains
        }
    }

    /// Swap preference for `domain`. Nothing is upgraded yet when the
    /// initial domain runs, so its primaries are pushed the other way.
    pub fn swap_preference(&self, domain: usize) -> PlacementPreference {
        if domain == self.initial_domain() {
            self.placement_preference().opposite()
        } else {
            self.placement_preference()
        }
    }

    pub fn cycle_start(&self) -> Option<SimTime> {
        self.starts.get(self.next).copied()
    }

    pub fn cycle_end(&self) -> Option<SimTime> {
        self.ends.get(self.next).copied()
    }

    pub fn is_upgrading(&self, now: SimTime) -> bool {
        match (self.cycle_start(), self.cycle_end()) {
            (Some(start), Some(end)) => now >= start && now <= end,
            _ => false,
        }
    }

    pub fn is_time_to_start_domain_upgrade(&self, now: SimTime) -> bool {
        let Some(start) = self.cycle_start() else {
            return false;
        };
        let last_start = start + SimTime::from_minutes(
            self.per_domain.minutes() * self.num_domains.saturating_sub(1) as u64,
        );
        if now < start || now > last_start || self.per_domain == SimTime::ZERO {
            return false;
        }
        now.since(start).minutes() % self.per_domain.minutes() == 0
    }

    /// Domain whose maintenance window contains `now`
    pub fn domain_to_upgrade(&self, now: SimTime) -> Option<usize> {
        let start = self.cycle_start()?;
        if now < start || self.per_domain == SimTime::ZERO {
            return None;
        }
        let step = (now.since(start).minutes() / self.per_domain.minutes()) as usize;
        if step >= self.num_domains {
            return None;
        }
        Some(if self.is_lower_to_higher() {
            step
        } else {
            self.num_domains - 1 - step
        })
    }

    pub fn is_time_to_end_upgrade(&self, now: SimTime) -> bool {
        self.cycle_end() == Some(now)
    }

    /// Move on to the next planned cycle
    pub fn advance(&mut self) {
        self.next += 1;
        self.cleared_counts = [None; NODES_PER_UPGRADE_DOMAIN];
    }

    fn record_cleared(&mut self, counts: [usize; NODES_PER_UPGRADE_DOMAIN]) {
        self.cleared_counts = counts.map(Some);
    }

    /// A cleared domain may lose residents but never gain them
    pub fn check_no_new_residents(&self, cluster: &ClusterManager, domain: usize) -> Result<()> {
        let now = cluster.domain_replica_counts(domain);
        for (slot, (cleared, current)) in self.cleared_counts.iter().zip(now).enumerate() {
            if let Some(cleared) = cleared {
                if current > *cleared {
                    return Err(CapsimError::invariant(format!(
                        "node {} of cleared UD {} gained residents ({} -> {})",
                        domain * NODES_PER_UPGRADE_DOMAIN + slot,
                        domain,
                        cleared,
                        current
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Evacuates upgrade domains with a WorstFit selector
pub struct UpgradeExecutor {
    heuristic: UpgradeHeuristic,
    selector: PlacementSelector,
    /// Moves made by evacuations in the current cycle
    pub num_moves: u64,
    /// Swaps and moves a perfect evacuation would need
    pub min_swaps_needed: u64,
    pub min_moves_needed: u64,
    pub last_duration_ms: f64,
}

impl UpgradeExecutor {
    pub fn new(params: &ExperimentParams, predictor: Arc<ViolationPredictor>) -> Self {
        Self {
            heuristic: params.upgrade_heuristic,
            selector: PlacementSelector::worst_fit(params, predictor),
            num_moves: 0,
            min_swaps_needed: 0,
            min_moves_needed: 0,
            last_duration_ms: 0.0,
        }
    }

    pub fn heuristic(&self) -> UpgradeHeuristic {
        self.heuristic
    }

    /// Upgrade the domain scheduled at `now`. Returns the domain cleared.
    pub fn upgrade(
        &mut self,
        cluster: &mut ClusterManager,
        schedule: &mut UpgradeSchedule,
        now: SimTime,
        rng: &mut dyn RngCore,
    ) -> Result<usize> {
        let domain = schedule
            .domain_to_upgrade(now)
            .ok_or_else(|| CapsimError::invariant(format!("no domain scheduled at {now}")))?;

        if domain == schedule.initial_domain() {
            cluster.shrink_cpu_ceiling();
        } else if let Some(previous) = schedule.previous_domain(domain) {
            schedule.check_no_new_residents(cluster, previous)?;
            cluster.restore_domain_footprint(previous)?;
        }
        cluster.begin_domain_upgrade(domain);
        self.count_required_evacuations(cluster, domain);

        let moves_before = cluster.num_moves;
        let started = Instant::now();
        let swap_preference = schedule.swap_preference(domain);
        match self.heuristic {
            UpgradeHeuristic::GreedilyFailover => {
                self.failover_mixed(cluster, now, domain, swap_preference, true, rng)?
            }
            UpgradeHeuristic::GreedilyFailoverWithSort => {
                self.failover_mixed(cluster, now, domain, swap_preference, false, rng)?
            }
            UpgradeHeuristic::GreedilyFailoverPrimThenStd => {
                self.failover_primaries_then_standards(cluster, now, domain, swap_preference, true, rng)?
            }
            UpgradeHeuristic::GreedilyFailoverPrimThenStdWithSort => {
                self.failover_primaries_then_standards(cluster, now, domain, swap_preference, false, rng)?
            }
        }
        self.last_duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        self.num_moves += cluster.num_moves - moves_before;
        cluster.num_moves = moves_before;

        ensure_domain_evacuated(cluster, domain)?;
        schedule.record_cleared(cluster.domain_replica_counts(domain));
        cluster.release_domain_footprint(domain)?;

        info!("Cluster upgraded UD {} in {:.1} ms", domain, self.last_duration_ms);
        Ok(domain)
    }

    /// Close the running cycle: the last domain rejoins the ring and all
    /// exclusions are lifted
    pub fn end_cycle(&mut self, cluster: &mut ClusterManager, schedule: &UpgradeSchedule) -> Result<()> {
        if cluster.domain_under_upgrade().is_some() {
            cluster.restore_domain_footprint(schedule.last_domain())?;
        }
        cluster.end_upgrade_cycle();
        Ok(())
    }

    pub fn reset_counters(&mut self) {
        self.num_moves = 0;
    }

    fn count_required_evacuations(&mut self, cluster: &ClusterManager, domain: usize) {
        for node in NodeId::in_upgrade_domain(domain) {
            for replica in cluster.node(node).replicas() {
                if cluster.is_primary(replica) {
                    self.min_swaps_needed += 1;
                } else if cluster.is_standard(replica) {
                    self.min_moves_needed += 1;
                }
            }
        }
    }

    /// Primaries and standards in one pass, largest first: primaries swap
    /// when they can and move otherwise
    fn failover_mixed(
        &mut self,
        cluster: &mut ClusterManager,
        now: SimTime,
        domain: usize,
        swap_preference: PlacementPreference,
        shuffle: bool,
        rng: &mut dyn RngCore,
    ) -> Result<()> {
        let mut replicas = cluster.primary_and_standard_replicas_sorted(now, domain)?;
        if shuffle {
            replicas.shuffle(rng);
        }
        for replica in &replicas {
            if cluster.is_primary(replica) && self.try_swap(cluster, now, replica, swap_preference, rng)? {
                continue;
            }
            cluster.move_with_selector(&mut self.selector, now, replica, rng)?;
        }
        Ok(())
    }

    /// Swap every primary first, then move standards together with the
    /// primaries that found no swap partner
    fn failover_primaries_then_standards(
        &mut self,
        cluster: &mut ClusterManager,
        now: SimTime,
        domain: usize,
        swap_preference: PlacementPreference,
        shuffle: bool,
        rng: &mut dyn RngCore,
    ) -> Result<()> {
        let mut primaries = cluster.primary_replicas_sorted(now, domain)?;
        if shuffle {
            primaries.shuffle(rng);
        }
        let mut unswapped = BTreeSet::new();
        for primary in &primaries {
            if !self.try_swap(cluster, now, primary, swap_preference, rng)? {
                unswapped.insert(primary.clone());
            }
        }

        let mut to_move = cluster.standard_replicas_sorted(now, domain, &unswapped)?;
        if shuffle {
            to_move.shuffle(rng);
        }
        for replica in &to_move {
            cluster.move_with_selector(&mut self.selector, now, replica, rng)?;
        }
        Ok(())
    }

    fn try_swap(
        &mut self,
        cluster: &mut ClusterManager,
        now: SimTime,
        primary: &ReplicaId,
        preference: PlacementPreference,
        rng: &mut dyn RngCore,
    ) -> Result<bool> {
        let partner = self
            .selector
            .choose_replica_to_swap_with(cluster, now, primary, preference, rng)?;
        match partner {
            Some(partner) => {
                debug!("Swapping {} with {}", primary, partner);
                cluster.swap(now, primary, &partner)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// No primary or standard may remain in a cleared domain
fn ensure_domain_evacuated(cluster: &ClusterManager, domain: usize) -> Result<()> {
    for node in NodeId::in_upgrade_domain(domain) {
        if let Some(replica) = cluster
            .node(node)
            .replicas()
            .find(|r| cluster.is_primary(r) || cluster.is_standard(r))
        {
            return Err(CapsimError::invariant(format!(
                "{replica} still on {node} after UD {domain} was upgraded"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MoveKind;
    use crate::cluster::tests::{cluster, params, predictor, premium, selector, standard, trace_set, usage};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn four_week_schedule() -> UpgradeSchedule {
        let interval = 4 * 7 * 24;
        UpgradeSchedule::new(
            SimTime::from_hours(24),
            SimTime::from_hours(interval),
            10,
            SimTime::from_hours(2),
            SimTime::from_hours(3 * interval + 48),
            false,
        )
    }

    #[test]
    fn test_cycle_start_and_end_times() {
        let schedule = four_week_schedule();
        assert_eq!(schedule.num_planned(), 3);
        for (i, day) in [29, 57, 85].into_iter().enumerate() {
            assert_eq!(schedule.starts()[i], SimTime::from_hours(day * 24));
            assert_eq!(schedule.ends()[i], SimTime::from_hours(day * 24 + 20));
        }
    }

    #[test]
    fn test_domains_alternate_direction() {
        let mut schedule = four_week_schedule();
        let duration = SimTime::from_hours(3 * 4 * 7 * 24 + 48);
        let mut t = SimTime::ZERO;
        while t < duration {
            let in_cycle = (0..schedule.num_planned())
                .position(|i| t >= schedule.starts()[i] && t <= schedule.ends()[i]);
            match in_cycle {
                Some(i) => {
                    assert!(schedule.is_upgrading(t));
                    let offset = t.since(schedule.starts()[i]).minutes();
                    let on_boundary = offset % 120 == 0 && offset / 120 < 10;
                    assert_eq!(schedule.is_time_to_start_domain_upgrade(t), on_boundary);
                    if on_boundary {
                        let step = (offset / 120) as usize;
                        let expected = if i == 1 { 9 - step } else { step };
                        assert_eq!(schedule.domain_to_upgrade(t), Some(expected));
                    }
                    if schedule.is_time_to_end_upgrade(t) {
                        schedule.advance();
                    }
                }
                None => assert!(!schedule.is_upgrading(t)),
            }
            t = t + SimTime::from_minutes(10);
        }
        assert_eq!(schedule.next_index(), 3);
    }

    #[test]
    fn test_preferences_follow_direction() {
        let mut schedule = four_week_schedule();
        assert_eq!(schedule.placement_preference(), PlacementPreference::LowerUpgradeDomains);
        assert_eq!(schedule.swap_preference(0), PlacementPreference::UpperUpgradeDomains);
        assert_eq!(schedule.swap_preference(3), PlacementPreference::LowerUpgradeDomains);
        assert_eq!(schedule.previous_domain(0), None);
        assert_eq!(schedule.previous_domain(4), Some(3));

        schedule.advance();
        assert_eq!(schedule.initial_domain(), 9);
        assert_eq!(schedule.placement_preference(), PlacementPreference::UpperUpgradeDomains);
        assert_eq!(schedule.swap_preference(9), PlacementPreference::LowerUpgradeDomains);
        assert_eq!(schedule.previous_domain(9), None);
        assert_eq!(schedule.previous_domain(4), Some(5));
    }

    #[test]
    fn test_zero_interval_plans_nothing() {
        let schedule = UpgradeSchedule::new(
            SimTime::ZERO,
            SimTime::ZERO,
            4,
            SimTime::from_hours(1),
            SimTime::from_hours(100),
            false,
        );
        assert_eq!(schedule.num_planned(), 0);
        assert!(!schedule.is_upgrading(SimTime::from_hours(1)));
    }

    /// Cycle at 1h with one hour per domain
    fn hourly_schedule(num_domains: usize) -> UpgradeSchedule {
        UpgradeSchedule::new(
            SimTime::ZERO,
            SimTime::from_hours(1),
            num_domains,
            SimTime::from_hours(1),
            SimTime::from_hours(2),
            false,
        )
    }

    #[test]
    fn test_upgrade_evacuates_primaries_and_standards() {
        let params = params(16);
        let traces = trace_set(&[usage(500.0, 500.0); 8], &[usage(300.0, 300.0); 2]);
        let mut cluster = cluster(&params, Arc::clone(&traces));
        let mut selector = selector(&params);
        let mut rng = StdRng::seed_from_u64(17);
        for i in 0..8 {
            cluster.place(&mut selector, SimTime::ZERO, &standard(i, 1), &mut rng).unwrap();
        }
        for i in 0..2 {
            cluster.place(&mut selector, SimTime::ZERO, &premium(&traces, i, 1), &mut rng).unwrap();
        }
        let placed = cluster.num_placed_replicas();
        let mut schedule = hourly_schedule(4);
        let mut executor = UpgradeExecutor::new(&params, predictor());

        let now = SimTime::from_hours(1);
        cluster.set_placement_preference(schedule.placement_preference());
        let domain = executor.upgrade(&mut cluster, &mut schedule, now, &mut rng).unwrap();
        assert_eq!(domain, 0);
        ensure_domain_evacuated(&cluster, 0).unwrap();
        assert_eq!(cluster.num_moves, 0);
        assert_eq!(cluster.num_placed_replicas(), placed);
        assert!(executor.num_moves >= executor.min_moves_needed);
        cluster.check_consistency().unwrap();

        let domain = executor
            .upgrade(&mut cluster, &mut schedule, SimTime::from_hours(2), &mut rng)
            .unwrap();
        assert_eq!(domain, 1);
        ensure_domain_evacuated(&cluster, 1).unwrap();
        assert!(cluster.nodes_under_upgrade().contains(&NodeId(4)));
    }

    #[test]
    fn test_every_executor_evacuates_the_domain() {
        for heuristic in [
            UpgradeHeuristic::GreedilyFailover,
            UpgradeHeuristic::GreedilyFailoverWithSort,
            UpgradeHeuristic::GreedilyFailoverPrimThenStd,
            UpgradeHeuristic::GreedilyFailoverPrimThenStdWithSort,
        ] {
            let params = params(16).with_upgrade(heuristic, 0, 1);
            let traces = trace_set(&[usage(500.0, 500.0); 8], &[usage(300.0, 300.0); 3]);
            let mut cluster = cluster(&params, Arc::clone(&traces));
            let mut selector = selector(&params);
            let mut rng = StdRng::seed_from_u64(31);
            for i in 0..8 {
                cluster.place(&mut selector, SimTime::ZERO, &standard(i, 1), &mut rng).unwrap();
            }
            for i in 0..3 {
                cluster.place(&mut selector, SimTime::ZERO, &premium(&traces, i, 1), &mut rng).unwrap();
            }

            // Put the first tenant's primary in UD 0
            let group = premium(&traces, 0, 1);
            if cluster.placement_of(&group[0]).unwrap().upgrade_domain() != 0 {
                let sibling = group
                    .iter()
                    .find(|r| cluster.placement_of(r).unwrap().upgrade_domain() == 0)
                    .unwrap()
                    .clone();
                cluster.swap(SimTime::ZERO, &group[0], &sibling).unwrap();
            }
            let primaries = NodeId::in_upgrade_domain(0)
                .flat_map(|n| cluster.node(n).replicas())
                .filter(|r| cluster.is_primary(r))
                .count() as u64;
            assert!(primaries >= 1);
            let swaps_before = cluster.num_swaps;
            let placed = cluster.num_placed_replicas();

            let mut schedule = hourly_schedule(4);
            let mut executor = UpgradeExecutor::new(&params, predictor());
            assert_eq!(executor.heuristic(), heuristic);
            cluster.set_placement_preference(schedule.placement_preference());
            let domain = executor
                .upgrade(&mut cluster, &mut schedule, SimTime::from_hours(1), &mut rng)
                .unwrap();

            assert_eq!(domain, 0, "{heuristic:?}");
            for node in NodeId::in_upgrade_domain(0) {
                assert!(
                    cluster
                        .node(node)
                        .replicas()
                        .all(|r| !cluster.is_primary(r) && !cluster.is_standard(r)),
                    "{heuristic:?} left a primary or standard on {node}"
                );
            }
            assert_eq!(executor.min_swaps_needed, primaries, "{heuristic:?}");
            assert!(cluster.num_swaps - swaps_before >= primaries, "{heuristic:?}");
            assert_eq!(cluster.num_placed_replicas(), placed);
            cluster.check_consistency().unwrap();
        }
    }

    #[test]
    fn test_resident_added_to_cleared_domain_is_fatal() {
        let params = params(8);
        let traces = trace_set(&[usage(500.0, 500.0); 4], &[]);
        let mut cluster = cluster(&params, Arc::clone(&traces));
        let mut selector = selector(&params);
        let mut rng = StdRng::seed_from_u64(23);
        for i in 0..4 {
            cluster.place(&mut selector, SimTime::ZERO, &standard(i, 1), &mut rng).unwrap();
        }
        let mut schedule = hourly_schedule(2);
        let mut executor = UpgradeExecutor::new(&params, predictor());
        cluster.set_placement_preference(schedule.placement_preference());
        executor
            .upgrade(&mut cluster, &mut schedule, SimTime::from_hours(1), &mut rng)
            .unwrap();

        let intruder = cluster.node(NodeId(5)).replicas().next().cloned().unwrap_or_else(|| {
            cluster
                .nodes()
                .iter()
                .find_map(|n| n.replicas().next().cloned())
                .unwrap()
        });
        cluster
            .move_replica(SimTime::from_hours(1), &intruder, NodeId(0), MoveKind::Regular)
            .unwrap();
        let err = executor
            .upgrade(&mut cluster, &mut schedule, SimTime::from_hours(2), &mut rng)
            .unwrap_err();
        assert!(matches!(err, CapsimError::InvariantViolation(_)));
    }

    #[test]
    fn test_end_cycle_restores_ceiling_and_exclusions() {
        let params = params(8);
        let traces = trace_set(&[usage(500.0, 500.0); 2], &[]);
        let mut cluster = cluster(&params, Arc::clone(&traces));
        let mut selector = selector(&params);
        let mut rng = StdRng::seed_from_u64(29);
        for i in 0..2 {
            cluster.place(&mut selector, SimTime::ZERO, &standard(i, 1), &mut rng).unwrap();
        }
        let allocated = cluster.allocated();
        let ceiling = cluster.cpu_ceiling();
        let mut schedule = hourly_schedule(2);
        let mut executor = UpgradeExecutor::new(&params, predictor());
        cluster.set_placement_preference(schedule.placement_preference());
        executor
            .upgrade(&mut cluster, &mut schedule, SimTime::from_hours(1), &mut rng)
            .unwrap();
        executor
            .upgrade(&mut cluster, &mut schedule, SimTime::from_hours(2), &mut rng)
            .unwrap();
        assert!(cluster.cpu_ceiling() < ceiling);

        executor.end_cycle(&mut cluster, &schedule).unwrap();
        schedule.advance();
        assert_eq!(cluster.cpu_ceiling(), ceiling);
        assert_eq!(cluster.allocated(), allocated);
        assert!(cluster.nodes_under_upgrade().is_empty());
    }
}
