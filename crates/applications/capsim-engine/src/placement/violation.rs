//! Per-node violation probabilities for the probability-aware heuristics

use capsim_core::{ReplicaId, ResourceUsage, Result, SimTime, UsageTrace};
use rand::RngCore;
use std::iter;

use super::PlacementSelector;
use crate::cluster::ClusterManager;
use crate::predictor::{CurveSource, SampledTenants, TenantConstraints, TenantQuery};

impl PlacementSelector {
    /// Probability, per node, that the node's residents plus the arriving
    /// replica exceed node memory or disk. Empty nodes score zero.
    pub(super) fn compute_placement_violation_probabilities(
        &mut self,
        cluster: &ClusterManager,
        now: SimTime,
        replica: &ReplicaId,
        slo: &str,
        demand: &ResourceUsage,
        rng: &mut dyn RngCore,
    ) -> Result<()> {
        self.sample_cache
            .insert(replica.clone(), SampledTenants::new(self.mc_repetitions));
        let mut probabilities = vec![0.0; cluster.num_nodes()];
        for node in cluster.nodes().iter().filter(|n| !n.is_empty()) {
            let residents: Vec<ReplicaId> = node.replicas().cloned().collect();
            let mut queries = residents
                .iter()
                .map(|r| self.resident_query(cluster, now, r, self.extrapolate_growing_tenants))
                .collect::<Result<Vec<_>>>()?;
            queries.push(TenantQuery {
                constraints: TenantConstraints::new(slo, ResourceUsage::ZERO, 0.0),
                time_offset: 0,
                current: *demand,
                sample: self.cached_sample(replica),
            });
            probabilities[node.id.index()] = self.query(cluster, &mut queries, rng);
            self.store_samples(residents.iter().chain(iter::once(replica)), queries);
        }
        self.violation_probability = probabilities;
        Ok(())
    }

    /// Same as placement, for a replica leaving its node with its current
    /// usage; every node is queried, empty ones included
    pub(super) fn compute_move_violation_probabilities(
        &mut self,
        cluster: &ClusterManager,
        now: SimTime,
        replica: &ReplicaId,
        usage: &ResourceUsage,
        rng: &mut dyn RngCore,
    ) -> Result<()> {
        let slo = cluster.slo_of(replica)?.to_string();
        let mut probabilities = vec![0.0; cluster.num_nodes()];
        for node in cluster.nodes() {
            let residents: Vec<ReplicaId> = node.replicas().cloned().collect();
            let mut queries = residents
                .iter()
                .map(|r| self.resident_query(cluster, now, r, false))
                .collect::<Result<Vec<_>>>()?;
            queries.push(TenantQuery {
                constraints: TenantConstraints::new(&slo, *usage, 0.0),
                time_offset: 0,
                current: *usage,
                sample: self.cached_sample(replica),
            });
            probabilities[node.id.index()] = self.query(cluster, &mut queries, rng);
            self.store_samples(residents.iter().chain(iter::once(replica)), queries);
        }
        self.violation_probability = probabilities;
        Ok(())
    }

    /// Query for a placed replica: its usage so far bounds the analogous
    /// tenants from below and its age sets the evaluation offset
    fn resident_query(
        &self,
        cluster: &ClusterManager,
        now: SimTime,
        replica: &ReplicaId,
        extrapolate: bool,
    ) -> Result<TenantQuery> {
        let age = cluster.age(replica, now)?;
        let trace = cluster.replica_trace(replica)?;
        let current = if extrapolate {
            trace.usage_accounting_for_growth(age)
        } else {
            trace.usage_at(age)
        };
        let intervals = age.intervals();
        Ok(TenantQuery {
            constraints: TenantConstraints::new(cluster.slo_of(replica)?, current, intervals),
            time_offset: -(intervals.round() as i64),
            current,
            sample: self.cached_sample(replica),
        })
    }

    fn query(&self, cluster: &ClusterManager, queries: &mut [TenantQuery], rng: &mut dyn RngCore) -> f64 {
        self.predictor.probability_of_violation(
            queries,
            &cluster.capacity(),
            CurveSource::Model,
            true,
            self.mc_repetitions,
            rng,
        )
    }

    fn cached_sample(&self, replica: &ReplicaId) -> SampledTenants {
        self.sample_cache
            .get(replica)
            .cloned()
            .unwrap_or_else(|| SampledTenants::new(self.mc_repetitions))
    }

    fn store_samples<'a>(&mut self, replicas: impl Iterator<Item = &'a ReplicaId>, queries: Vec<TenantQuery>) {
        for (replica, query) in replicas.zip(queries) {
            self.sample_cache.insert(replica.clone(), query.sample);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::cluster::tests::{cluster, params, selector, standard, trace_set, usage};
    use crate::config::PlacementHeuristic;
    use capsim_core::SimTime;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::Arc;

    #[test]
    fn test_empty_cluster_has_zero_probabilities() {
        let params = params(4).with_heuristic(PlacementHeuristic::WorstFitProbabilityViolation);
        let traces = trace_set(&[usage(100.0, 100.0)], &[]);
        let mut cluster = cluster(&params, Arc::clone(&traces));
        let mut selector = selector(&params);
        let mut rng = StdRng::seed_from_u64(2);
        cluster.place(&mut selector, SimTime::ZERO, &standard(0, 1), &mut rng).unwrap();
        assert_eq!(selector.violation_probabilities(), &[0.0; 4]);
    }

    #[test]
    fn test_samples_are_cached_and_forgotten() {
        let params = params(4).with_heuristic(PlacementHeuristic::BestFitProbabilityViolation);
        let traces = trace_set(&[usage(100.0, 100.0); 2], &[]);
        let mut cluster = cluster(&params, Arc::clone(&traces));
        let mut selector = selector(&params);
        let mut rng = StdRng::seed_from_u64(4);
        let (a, b) = (standard(0, 1), standard(1, 1));
        cluster.place(&mut selector, SimTime::ZERO, &a, &mut rng).unwrap();
        cluster.place(&mut selector, SimTime::ZERO, &b, &mut rng).unwrap();
        assert!(selector.sample_cache.contains_key(&a[0]));
        assert!(selector.sample_cache.contains_key(&b[0]));
        assert_eq!(selector.violation_probabilities().len(), 4);

        selector.forget(&a);
        assert!(!selector.sample_cache.contains_key(&a[0]));
    }
}
