//! Violation predictor
//!
//! Trained once per simulation from a sample of the trace pool. For every SLO
//! it keeps empirical CDFs of historical maxima plus two families of demand
//! curves sorted by maximum disk usage:
//! - historical curves, the raw usage every simulated interval
//! - model curves, a monotonic-growth approximation whose last point is zero
//!
//! [`ViolationPredictor::probability_of_violation`] estimates, by Monte-Carlo
//! sampling of analogous historical tenants, how likely a set of co-located
//! tenants is to exceed a node's memory or disk capacity during their
//! remaining lifetimes.

use capsim_core::{CpuUnits, ResourceUsage, Result, SimTime, SloCatalog, UsageTrace};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

use crate::trace::{ReplicaTrace, TraceSet};

/// Upper bound on the number of sampled replicas
pub const MAX_PREDICTOR_SIZE: usize = 215_000;

/// Share of tenants sampled for training, in percent
pub const PERCENT_OF_TENANTS_TO_SAMPLE: usize = 40;

/// Percentile of historical maxima used to raise placement demand
pub const DEMAND_PERCENTILE: usize = 99;

/// Per-SLO empirical distribution of one resource's historical maxima
#[derive(Debug, Clone, Default)]
pub struct UsageCdf {
    data: BTreeMap<String, Vec<f64>>,
}

impl UsageCdf {
    pub fn add(&mut self, slo: &str, value: f64) {
        self.data.entry(slo.to_string()).or_default().push(value);
    }

    pub fn finalize(&mut self) {
        for values in self.data.values_mut() {
            values.sort_by(f64::total_cmp);
        }
    }

    /// `sorted[max(n·p/100 − 1, 0)]`, or −1 when the SLO was never observed
    pub fn percentile(&self, slo: &str, percentile: usize) -> f64 {
        match self.data.get(slo) {
            Some(values) if !values.is_empty() => {
                let idx = (values.len() * percentile / 100).saturating_sub(1);
                values[idx]
            }
            _ => -1.0,
        }
    }
}

/// Usage over time in constant simulation intervals
#[derive(Debug, Clone)]
pub struct DemandCurve {
    pub max_memory: f64,
    pub max_disk: f64,
    pub points: Vec<ResourceUsage>,
}

impl DemandCurve {
    pub fn new(points: Vec<ResourceUsage>) -> Self {
        let max_memory = points.iter().fold(0.0, |m: f64, p| m.max(p.memory));
        let max_disk = points.iter().fold(0.0, |m: f64, p| m.max(p.disk));
        Self {
            max_memory,
            max_disk,
            points,
        }
    }

    /// Sample a trace every simulation interval, up to one interval past its lifetime
    pub fn from_trace(trace: &ReplicaTrace) -> Self {
        let step = capsim_core::SIMULATION_INTERVAL_MINUTES;
        let end = trace.lifetime().minutes() + step;
        let points = (0..=end / step)
            .map(|i| trace.usage_at(SimTime::from_minutes(i * step)))
            .collect();
        Self::new(points)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Growth model: linear ramp from the first point to the maximum, reached
    /// once 98% (disk) or 97% (memory) of it is observed; zero at the end
    fn model(&self) -> Self {
        let raw = &self.points;
        let n = raw.len();
        let mut model = vec![ResourceUsage::ZERO; n];
        let (mut disk_done, mut memory_done) = (false, false);

        for i in 0..n {
            model[i].cpu = raw[i].cpu;
            if i == 0 {
                model[i].disk = raw[i].disk;
                model[i].memory = raw[i].memory;
            } else if i == n - 1 {
                model[i].disk = 0.0;
                model[i].memory = 0.0;
            } else {
                if disk_done {
                    model[i].disk = self.max_disk;
                }
                if memory_done {
                    model[i].memory = self.max_memory;
                }
            }

            if !disk_done && raw[i].disk >= self.max_disk * 98.0 / 100.0 {
                disk_done = true;
                for j in 1..=i {
                    model[j].disk =
                        model[0].disk + (j as f64 / i as f64) * (self.max_disk - model[0].disk);
                }
            }
            if !memory_done && raw[i].memory >= self.max_memory * 97.0 / 100.0 {
                memory_done = true;
                for j in 1..=i {
                    model[j].memory = model[0].memory
                        + (j as f64 / i as f64) * (self.max_memory - model[0].memory);
                }
            }
        }

        Self {
            max_memory: self.max_memory,
            max_disk: self.max_disk,
            points: model,
        }
    }

    /// Bound recorded for a sampled curve
    fn sample_bound(&self, source: CurveSource) -> (f64, f64) {
        match source {
            CurveSource::Model => {
                let p = self.points[self.points.len().saturating_sub(2)];
                (p.memory, p.disk)
            }
            CurveSource::Historical => (self.max_memory, self.max_disk),
        }
    }
}

/// Which family of curves a query samples from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurveSource {
    Historical,
    Model,
}

/// Filter on analogous historical tenants. AMU is memory, IDSU is disk;
/// lifetimes are in simulation intervals.
#[derive(Debug, Clone, PartialEq)]
pub struct TenantConstraints {
    pub slo: String,
    pub min_disk: f64,
    pub min_memory: f64,
    pub min_lifetime: f64,
    pub max_disk: f64,
    pub max_memory: f64,
}

impl TenantConstraints {
    pub fn new(slo: &str, min: ResourceUsage, min_lifetime: f64) -> Self {
        Self {
            slo: slo.to_string(),
            min_disk: min.disk,
            min_memory: min.memory,
            min_lifetime,
            max_disk: f64::INFINITY,
            max_memory: f64::INFINITY,
        }
    }
}

/// Memoised Monte-Carlo sample of one tenant
#[derive(Debug, Clone, PartialEq)]
pub struct SampledTenants {
    pub min_lifetime: f64,
    pub min_disk: f64,
    pub min_memory: f64,
    pub max_disk: f64,
    pub max_memory: f64,
    /// Curve index drawn in each repetition
    pub sampled_offsets: Vec<Option<usize>>,
    pub no_match: bool,
}

impl SampledTenants {
    pub fn new(repetitions: usize) -> Self {
        Self {
            min_lifetime: -1.0,
            min_disk: -1.0,
            min_memory: -1.0,
            max_disk: f64::INFINITY,
            max_memory: f64::INFINITY,
            sampled_offsets: vec![None; repetitions],
            no_match: false,
        }
    }

    pub fn is_sampled(&self) -> bool {
        self.sampled_offsets.first().is_some_and(Option::is_some)
    }

    /// Cached bounds still dominate current usage and cover the tenant's age
    pub fn can_reuse(&self, current: &ResourceUsage, time_offset: i64) -> bool {
        self.no_match
            || (self.is_sampled()
                && self.min_memory >= current.memory
                && self.min_disk >= current.disk
                && self.min_lifetime >= -(time_offset as f64))
    }

    fn mark_no_match(&mut self, current: &ResourceUsage, min_lifetime: f64) {
        self.no_match = true;
        self.max_memory = current.memory;
        self.min_memory = current.memory;
        self.max_disk = current.disk;
        self.min_disk = current.disk;
        self.min_lifetime = min_lifetime;
    }
}

/// One tenant of a probability query
#[derive(Debug, Clone)]
pub struct TenantQuery {
    pub constraints: TenantConstraints,
    /// Non-positive offset, in intervals, of the tenant's placement relative to now
    pub time_offset: i64,
    pub current: ResourceUsage,
    pub sample: SampledTenants,
}

#[derive(Debug, Clone, Copy)]
struct Bounds {
    min_memory: f64,
    min_disk: f64,
    max_memory: f64,
    max_disk: f64,
    min_lifetime: f64,
}

/// Per-SLO usage models used for placement risk estimation
#[derive(Debug, Clone, Default)]
pub struct ViolationPredictor {
    max_memory_cdf: UsageCdf,
    max_disk_cdf: UsageCdf,
    max_cpu_cdf: UsageCdf,
    historical: BTreeMap<String, Vec<DemandCurve>>,
    model: BTreeMap<String, Vec<DemandCurve>>,
    max_demands: BTreeMap<String, ResourceUsage>,
}

impl ViolationPredictor {
    /// Sample tenants for training and remove them from the arrival pool
    pub fn train(traces: &mut TraceSet, slos: &dyn SloCatalog, seed: u64) -> Result<Self> {
        let tenants: Vec<(String, Vec<String>)> = traces
            .tenants()
            .map(|(t, r)| (t.to_string(), r.to_vec()))
            .collect();
        let num_to_sample =
            MAX_PREDICTOR_SIZE.min(PERCENT_OF_TENANTS_TO_SAMPLE * tenants.len() / 100);

        let mut rng = StdRng::seed_from_u64(seed);
        let mut sampled = BTreeSet::new();
        let mut num_sampled = 0;
        while num_sampled < num_to_sample {
            let (tenant, replicas) = &tenants[rng.gen_range(0..tenants.len())];
            if sampled.insert(tenant.clone()) {
                num_sampled += replicas.len();
            }
        }

        let mut predictor = ViolationPredictor::default();
        for tenant in &sampled {
            let slo = traces.slo_of(tenant)?.to_string();
            if !slos.is_allowed(&slo) {
                continue;
            }
            for replica in traces.replicas_of(tenant).unwrap_or_default() {
                let trace = traces.trace(replica)?;
                let max = trace.max_usage();
                predictor.max_disk_cdf.add(&slo, max.disk);
                predictor.max_memory_cdf.add(&slo, max.memory);
                predictor.max_cpu_cdf.add(&slo, max.cpu.as_f64());
                predictor.add_historical_curve(&slo, DemandCurve::from_trace(trace));
            }
        }
        predictor.finalize();
        traces.remove_tenants(&sampled);

        info!(
            "Violation predictor trained on {} tenants ({} replicas) across {} SLOs; {} tenants left for arrivals",
            sampled.len(),
            num_sampled,
            predictor.historical.len(),
            traces.num_tenants()
        );
        Ok(predictor)
    }

    /// Build directly from per-SLO curves
    pub fn from_curves(curves: impl IntoIterator<Item = (String, Vec<ResourceUsage>)>) -> Self {
        let mut predictor = ViolationPredictor::default();
        for (slo, points) in curves {
            let curve = DemandCurve::new(points);
            let max_cpu = curve.points.iter().map(|p| p.cpu).max().unwrap_or_default();
            predictor.max_disk_cdf.add(&slo, curve.max_disk);
            predictor.max_memory_cdf.add(&slo, curve.max_memory);
            predictor.max_cpu_cdf.add(&slo, max_cpu.as_f64());
            predictor.add_historical_curve(&slo, curve);
        }
        predictor.finalize();
        predictor
    }

    fn add_historical_curve(&mut self, slo: &str, curve: DemandCurve) {
        self.historical.entry(slo.to_string()).or_default().push(curve);
    }

    fn finalize(&mut self) {
        self.max_disk_cdf.finalize();
        self.max_memory_cdf.finalize();
        self.max_cpu_cdf.finalize();

        for (slo, curves) in self.historical.iter_mut() {
            curves.sort_by(|a, b| a.max_disk.total_cmp(&b.max_disk));
            let mut models: Vec<DemandCurve> = curves.iter().map(DemandCurve::model).collect();
            models.sort_by(|a, b| a.max_disk.total_cmp(&b.max_disk));
            self.model.insert(slo.clone(), models);

            let max = curves.iter().fold(ResourceUsage::ZERO, |mut acc, c| {
                acc.disk = acc.disk.max(c.max_disk);
                acc.memory = acc.memory.max(c.max_memory);
                acc
            });
            self.max_demands.insert(slo.clone(), max);
        }
    }

    pub fn num_slos(&self) -> usize {
        self.historical.len()
    }

    pub fn curves(&self, slo: &str, source: CurveSource) -> Option<&[DemandCurve]> {
        let map = match source {
            CurveSource::Historical => &self.historical,
            CurveSource::Model => &self.model,
        };
        map.get(slo).map(Vec::as_slice)
    }

    /// Worst observed (disk, memory) for an SLO
    pub fn max_demand(&self, slo: &str) -> Option<ResourceUsage> {
        self.max_demands.get(slo).copied()
    }

    pub fn percentile(&self, slo: &str, percentile: usize) -> ResourceUsage {
        ResourceUsage::new(
            CpuUnits::from_units(self.max_cpu_cdf.percentile(slo, percentile)),
            self.max_memory_cdf.percentile(slo, percentile),
            self.max_disk_cdf.percentile(slo, percentile),
        )
    }

    /// Raise a placement demand to the SLO's high percentile of historical maxima
    pub fn predicted_max_usage(&self, demand: ResourceUsage, slo: &str) -> ResourceUsage {
        demand.max(&self.percentile(slo, DEMAND_PERCENTILE))
    }

    /// Fraction of Monte-Carlo repetitions in which the summed usage of
    /// `tenants` exceeds `capacity` memory or disk at some evaluated point.
    /// Sample caches inside `tenants` are consulted and refreshed.
    pub fn probability_of_violation(
        &self,
        tenants: &mut [TenantQuery],
        capacity: &ResourceUsage,
        source: CurveSource,
        sparse: bool,
        repetitions: usize,
        rng: &mut dyn RngCore,
    ) -> f64 {
        let n = tenants.len();
        let mut reuse = vec![false; n];
        let mut candidates: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (i, tenant) in tenants.iter_mut().enumerate() {
            let c = &mut tenant.constraints;
            c.min_disk = c.min_disk.max(tenant.current.disk);
            c.min_memory = c.min_memory.max(tenant.current.memory);

            reuse[i] = tenant.sample.can_reuse(&tenant.current, tenant.time_offset);
            if reuse[i] {
                continue;
            }
            if let Some(curves) = self.curves(&c.slo, source) {
                let start = curves.partition_point(|curve| curve.max_disk < c.min_disk);
                candidates[i] = (start..curves.len())
                    .filter(|&l| {
                        let curve = &curves[l];
                        c.min_memory <= curve.max_memory
                            && c.max_memory >= curve.max_memory
                            && curve.len() as f64 > c.min_lifetime
                            && c.min_disk <= curve.max_disk
                            && c.max_disk >= curve.max_disk
                    })
                    .collect();
            }
            if candidates[i].is_empty() {
                reuse[i] = true;
                let min_lifetime = c.min_lifetime;
                tenant.sample.mark_no_match(&tenant.current, min_lifetime);
            }
        }

        let current_total = tenants
            .iter()
            .fold(ResourceUsage::ZERO, |acc, t| acc + t.current);
        if current_total.disk > capacity.disk || current_total.memory > capacity.memory {
            return 1.0;
        }

        let (mut upper_disk, mut upper_memory) = (0.0, 0.0);
        let (mut sample_disk, mut sample_memory) = (0.0, 0.0);
        for tenant in tenants.iter() {
            let bound = self
                .max_demand(&tenant.constraints.slo)
                .unwrap_or(tenant.current);
            upper_disk += bound.disk;
            upper_memory += bound.memory;
            sample_disk += tenant.sample.max_disk;
            sample_memory += tenant.sample.max_memory;
        }
        let mut violation_impossible = upper_disk <= capacity.disk && upper_memory <= capacity.memory;
        if reuse.iter().all(|&r| r) {
            violation_impossible |= sample_disk <= capacity.disk && sample_memory <= capacity.memory;
        }
        if violation_impossible || repetitions == 0 {
            return 0.0;
        }

        for tenant in tenants.iter_mut() {
            if tenant.sample.sampled_offsets.len() < repetitions {
                tenant.sample.sampled_offsets.resize(repetitions, None);
            }
        }

        let mut bounds: Vec<Option<Bounds>> = vec![None; n];
        let mut current_sample: Vec<Option<usize>> = vec![None; n];
        let mut violations = 0usize;

        for rep in 0..repetitions {
            for (j, tenant) in tenants.iter_mut().enumerate() {
                current_sample[j] = if !reuse[j] {
                    let pick = candidates[j][rng.gen_range(0..candidates[j].len())];
                    tenant.sample.sampled_offsets[rep] = Some(pick);
                    Some(pick)
                } else if tenant.sample.no_match {
                    None
                } else {
                    tenant.sample.sampled_offsets[rep]
                };
            }

            for (j, tenant) in tenants.iter().enumerate() {
                if reuse[j] {
                    continue;
                }
                let Some(curve) = current_sample[j]
                    .and_then(|idx| self.curve(&tenant.constraints.slo, source, idx))
                else {
                    continue;
                };
                let (memory, disk) = curve.sample_bound(source);
                let lifetime = curve.len() as f64;
                let b = bounds[j].get_or_insert(Bounds {
                    min_memory: memory,
                    min_disk: disk,
                    max_memory: memory,
                    max_disk: disk,
                    min_lifetime: lifetime,
                });
                b.min_memory = b.min_memory.min(memory);
                b.min_disk = b.min_disk.min(disk);
                b.max_memory = b.max_memory.max(memory);
                b.max_disk = b.max_disk.max(disk);
                b.min_lifetime = b.min_lifetime.min(lifetime);
                if b.min_memory < tenant.current.memory || b.min_disk < tenant.current.disk {
                    warn!(
                        "Sampled bound below current usage for SLO {}",
                        tenant.constraints.slo
                    );
                }
            }

            let violated = if sparse && source == CurveSource::Model {
                self.violates_sparse(tenants, &current_sample, capacity, source)
            } else {
                self.violates_dense(tenants, &current_sample, capacity, source)
            };
            if violated {
                violations += 1;
            }
        }

        for (j, tenant) in tenants.iter_mut().enumerate() {
            if reuse[j] {
                continue;
            }
            if let Some(b) = bounds[j] {
                tenant.sample.max_memory = b.max_memory;
                tenant.sample.min_memory = b.min_memory;
                tenant.sample.max_disk = b.max_disk;
                tenant.sample.min_disk = b.min_disk;
                tenant.sample.min_lifetime = b.min_lifetime;
            }
        }

        for tenant in tenants.iter() {
            if tenant.sample.is_sampled()
                && !tenant.sample.no_match
                && !tenant.sample.can_reuse(&tenant.current, tenant.time_offset)
            {
                warn!(
                    "Stale violation-predictor sample for SLO {}",
                    tenant.constraints.slo
                );
            }
        }

        violations as f64 / repetitions as f64
    }

    fn curve(&self, slo: &str, source: CurveSource, idx: usize) -> Option<&DemandCurve> {
        self.curves(slo, source).and_then(|c| c.get(idx))
    }

    /// Sum every interval until the last sampled curve ends
    fn violates_dense(
        &self,
        tenants: &[TenantQuery],
        samples: &[Option<usize>],
        capacity: &ResourceUsage,
        source: CurveSource,
    ) -> bool {
        let sampled: Vec<Option<&DemandCurve>> = tenants
            .iter()
            .zip(samples)
            .map(|(t, s)| s.and_then(|idx| self.curve(&t.constraints.slo, source, idx)))
            .collect();
        let max_len = tenants
            .iter()
            .zip(&sampled)
            .filter_map(|(t, c)| c.map(|c| c.len() as i64 + t.time_offset))
            .max()
            .unwrap_or(0);

        for time in 0..max_len {
            let (mut disk, mut memory) = (0.0, 0.0);
            for (tenant, curve) in tenants.iter().zip(&sampled) {
                let point = curve.and_then(|c| {
                    let idx = time - tenant.time_offset;
                    usize::try_from(idx).ok().and_then(|idx| c.points.get(idx))
                });
                let usage = point.unwrap_or(&tenant.current);
                disk += usage.disk;
                memory += usage.memory;
            }
            if disk > capacity.disk || memory > capacity.memory {
                return true;
            }
        }
        false
    }

    /// Evaluate only where a sampled curve reaches its plateau end
    fn violates_sparse(
        &self,
        tenants: &[TenantQuery],
        samples: &[Option<usize>],
        capacity: &ResourceUsage,
        source: CurveSource,
    ) -> bool {
        let sampled: Vec<Option<&DemandCurve>> = tenants
            .iter()
            .zip(samples)
            .map(|(t, s)| s.and_then(|idx| self.curve(&t.constraints.slo, source, idx)))
            .collect();
        let points: Vec<i64> = tenants
            .iter()
            .zip(&sampled)
            .filter_map(|(t, c)| c.map(|c| c.len() as i64 - 2 + t.time_offset))
            .collect();

        for time in points {
            let (mut disk, mut memory) = (0.0, 0.0);
            for (tenant, curve) in tenants.iter().zip(&sampled) {
                match curve {
                    Some(c) => {
                        let idx = time - tenant.time_offset;
                        if idx > 0 && (idx as usize) < c.len() {
                            disk += c.points[idx as usize].disk;
                            memory += c.points[idx as usize].memory;
                        }
                    }
                    None => {
                        disk += tenant.current.disk;
                        memory += tenant.current.memory;
                    }
                }
            }
            if disk > capacity.disk || memory > capacity.memory {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slo::SloSpecification;
    use crate::synthetic::{SyntheticConfig, SyntheticTraceGenerator};

    fn point(memory: f64, disk: f64) -> ResourceUsage {
        ResourceUsage::new(CpuUnits(100), memory, disk)
    }

    fn ramp(max: f64, len: usize) -> Vec<ResourceUsage> {
        let mut points: Vec<ResourceUsage> = (0..len - 2)
            .map(|i| point(max * (i + 1) as f64 / (len - 2) as f64, max * (i + 1) as f64 / (len - 2) as f64))
            .collect();
        points.push(point(0.0, 0.0));
        points.push(point(0.0, 0.0));
        points
    }

    fn predictor() -> ViolationPredictor {
        ViolationPredictor::from_curves(vec![
            ("S".to_string(), ramp(400.0, 12)),
            ("S".to_string(), ramp(600.0, 20)),
            ("S".to_string(), ramp(800.0, 30)),
        ])
    }

    fn query(slo: &str, current: ResourceUsage, time_offset: i64, reps: usize) -> TenantQuery {
        TenantQuery {
            constraints: TenantConstraints::new(slo, current, (-time_offset) as f64),
            time_offset,
            current,
            sample: SampledTenants::new(reps),
        }
    }

    #[test]
    fn test_percentile_indexing() {
        let mut cdf = UsageCdf::default();
        for v in [5.0, 1.0, 3.0, 2.0, 4.0] {
            cdf.add("S", v);
        }
        cdf.finalize();
        assert_eq!(cdf.percentile("S", 99), 4.0);
        assert_eq!(cdf.percentile("S", 100), 5.0);
        assert_eq!(cdf.percentile("S", 10), 1.0);
        assert_eq!(cdf.percentile("missing", 99), -1.0);
    }

    #[test]
    fn test_model_curve_growth() {
        let curve = DemandCurve::new(vec![
            point(100.0, 10.0),
            point(150.0, 50.0),
            point(300.0, 100.0),
            point(250.0, 90.0),
            point(0.0, 0.0),
        ]);
        let model = curve.model();
        assert_eq!(model.points[0].disk, 10.0);
        assert_eq!(model.points[1].disk, 55.0);
        assert_eq!(model.points[2].disk, 100.0);
        assert_eq!(model.points[3].disk, 100.0);
        assert_eq!(model.points[4].disk, 0.0);
        assert_eq!(model.points[2].memory, 300.0);
        assert_eq!(model.points[3].memory, 300.0);
        assert_eq!(model.points[4].memory, 0.0);
    }

    #[test]
    fn test_max_demand_and_predicted_usage() {
        let p = predictor();
        let max = p.max_demand("S").unwrap();
        assert_eq!(max.disk, 800.0);
        assert_eq!(max.memory, 800.0);
        assert!(p.max_demand("T").is_none());

        let raised = p.predicted_max_usage(point(10.0, 10.0), "S");
        assert_eq!(raised.memory, 600.0);
        let unknown = p.predicted_max_usage(point(10.0, 10.0), "T");
        assert_eq!(unknown.memory, 10.0);

        let curves = p.curves("S", CurveSource::Model).unwrap();
        assert!(curves.windows(2).all(|w| w[0].max_disk <= w[1].max_disk));
    }

    #[test]
    fn test_probability_one_when_already_overloaded() {
        let p = predictor();
        let mut rng = StdRng::seed_from_u64(0);
        let mut tenants = vec![query("S", point(700.0, 100.0), -3, 10), query("S", point(400.0, 100.0), 0, 10)];
        let prob = p.probability_of_violation(
            &mut tenants,
            &point(1000.0, 1000.0),
            CurveSource::Model,
            true,
            10,
            &mut rng,
        );
        assert_eq!(prob, 1.0);
    }

    #[test]
    fn test_probability_zero_when_bound_fits() {
        let p = predictor();
        let mut rng = StdRng::seed_from_u64(0);
        let mut tenants = vec![query("S", point(100.0, 100.0), -3, 10), query("S", point(0.0, 0.0), 0, 10)];
        let prob = p.probability_of_violation(
            &mut tenants,
            &point(1600.0, 1600.0),
            CurveSource::Model,
            true,
            10,
            &mut rng,
        );
        assert_eq!(prob, 0.0);
        assert!(tenants.iter().all(|t| !t.sample.is_sampled()));
    }

    #[test]
    fn test_sampling_caches_bounds() {
        let p = predictor();
        let mut rng = StdRng::seed_from_u64(7);
        let mut tenants = vec![
            query("S", point(500.0, 500.0), -2, 20),
            query("S", point(0.0, 0.0), 0, 20),
        ];
        let prob = p.probability_of_violation(
            &mut tenants,
            &point(1000.0, 1000.0),
            CurveSource::Model,
            true,
            20,
            &mut rng,
        );
        assert!((0.0..=1.0).contains(&prob));
        assert!(prob > 0.0);

        let resident = &tenants[0].sample;
        assert!(resident.is_sampled());
        assert!(resident.min_memory >= 500.0);
        assert!(resident.can_reuse(&point(500.0, 500.0), -2));
        assert!(resident.sampled_offsets.iter().all(|o| o.is_some_and(|i| i >= 1)));
    }

    #[test]
    fn test_unknown_slo_uses_current_usage() {
        let p = predictor();
        let mut rng = StdRng::seed_from_u64(1);
        let mut tenants = vec![query("Unknown", point(300.0, 300.0), -5, 5)];
        let prob = p.probability_of_violation(
            &mut tenants,
            &point(1000.0, 1000.0),
            CurveSource::Historical,
            false,
            5,
            &mut rng,
        );
        assert_eq!(prob, 0.0);
        assert!(tenants[0].sample.no_match);
        assert_eq!(tenants[0].sample.max_memory, 300.0);
    }

    #[test]
    fn test_training_removes_sampled_tenants() {
        let catalog = SloSpecification::builtin("Gen5");
        let config = SyntheticConfig {
            tenants: 50,
            mean_lifetime_hours: 6.0,
            ..SyntheticConfig::default()
        };
        let mut traces = SyntheticTraceGenerator::new(config, &catalog).generate().unwrap();
        let before = traces.num_tenants();
        let p = ViolationPredictor::train(&mut traces, &catalog, 1).unwrap();
        assert!(traces.num_tenants() < before);
        assert!(p.num_slos() > 0);
    }
}
