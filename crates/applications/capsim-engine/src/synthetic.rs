//! Synthetic usage traces
//!
//! Generates a tenant population shaped like production exports:
//! - Log-normal lifetimes
//! - Disk that grows linearly with gaussian noise
//! - Memory that warms up towards a plateau below the SLO reservation
//! - Premium tenants with four replicas inserted together

use capsim_core::{CapsimError, CpuUnits, ResourceUsage, Result, SimTime, SloCatalog};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, LogNormal, Normal};
use serde::{Deserialize, Serialize};

use crate::slo::SloSpecification;
use crate::trace::{ReplicaTrace, TraceSet, UsageSample};

/// Synthetic workload parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub tenants: usize,
    pub premium_fraction: f64,
    pub mean_lifetime_hours: f64,
    pub lifetime_sigma: f64,
    pub disk_growth_per_day: f64,
    pub noise: f64,
    pub sample_minutes: u64,
    pub arrival_spread_hours: u64,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            tenants: 400,
            premium_fraction: 0.3,
            mean_lifetime_hours: 96.0,
            lifetime_sigma: 0.8,
            disk_growth_per_day: 0.05,
            noise: 0.02,
            sample_minutes: 10,
            arrival_spread_hours: 48,
            seed: 42,
        }
    }
}

/// Generates a [`TraceSet`] for an SLO catalog
pub struct SyntheticTraceGenerator<'a> {
    config: SyntheticConfig,
    catalog: &'a SloSpecification,
    rng: StdRng,
}

impl<'a> SyntheticTraceGenerator<'a> {
    pub fn new(config: SyntheticConfig, catalog: &'a SloSpecification) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            catalog,
            rng,
        }
    }

    pub fn generate(&mut self) -> Result<TraceSet> {
        if self.config.sample_minutes == 0 {
            return Err(CapsimError::config("synthetic sample_minutes must be positive"));
        }
        let (mut standard, mut premium) = (Vec::new(), Vec::new());
        for name in self.catalog.names() {
            if self.catalog.is_premium(name)? {
                premium.push(name.to_string());
            } else {
                standard.push(name.to_string());
            }
        }
        if standard.is_empty() && premium.is_empty() {
            return Err(CapsimError::config("catalog has no SLOs to synthesise"));
        }

        let lifetimes = LogNormal::new(self.config.mean_lifetime_hours.max(1.0).ln(), self.config.lifetime_sigma)
            .map_err(|e| CapsimError::config(format!("lifetime distribution: {e}")))?;
        let noise = Normal::new(0.0, self.config.noise)
            .map_err(|e| CapsimError::config(format!("noise distribution: {e}")))?;
        let epoch = NaiveDate::from_ymd_opt(2020, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .ok_or_else(|| CapsimError::config("invalid synthetic epoch"))?;

        let mut traces = Vec::new();
        for k in 0..self.config.tenants {
            let wants_premium = self.rng.gen_bool(self.config.premium_fraction.clamp(0.0, 1.0));
            let is_premium = (wants_premium && !premium.is_empty()) || standard.is_empty();
            let pool = if is_premium { &premium } else { &standard };
            let slo = pool[self.rng.gen_range(0..pool.len())].clone();
            let hours = lifetimes.sample(&mut self.rng).clamp(1.0, 24.0 * 60.0);
            let lifetime = SimTime::from_minutes((hours * 60.0) as u64);
            let spread = self.config.arrival_spread_hours.max(1) * 60;
            let inserted_at = epoch + Duration::minutes(self.rng.gen_range(0..spread) as i64);

            let num_replicas = if is_premium { 4 } else { 1 };
            let base = self.tenant_shape(&slo)?;
            for replica in 0..num_replicas {
                // Primaries run hotter than their secondaries
                let scale = if replica == 0 { 1.1 } else { 1.0 };
                let trace = self.replica_trace(inserted_at, lifetime, &base, scale, &noise)?;
                let machine = self.rng.gen_range(0..1000);
                traces.push((format!("syn_DB{machine}r{replica}_t{k:05}"), slo.clone(), trace));
            }
        }
        TraceSet::from_traces(traces, false)
    }

    fn tenant_shape(&mut self, slo: &str) -> Result<TenantShape> {
        let cpu = self.catalog.max_cpu(slo)?;
        Ok(TenantShape {
            cpu: cpu.scale(self.rng.gen_range(0.1..0.8)),
            memory: self.catalog.memory_mb(slo)? * self.rng.gen_range(0.2..0.7),
            disk: self.catalog.disk_mb(slo)? * self.rng.gen_range(0.1..0.5),
            growth: self.config.disk_growth_per_day * self.rng.gen_range(0.0..2.0),
        })
    }

    fn replica_trace(
        &mut self,
        inserted_at: NaiveDateTime,
        lifetime: SimTime,
        shape: &TenantShape,
        scale: f64,
        noise: &Normal<f64>,
    ) -> Result<ReplicaTrace> {
        let step = self.config.sample_minutes;
        let mut samples = Vec::new();
        let mut offset = 0;
        while offset <= lifetime.minutes() {
            let days = offset as f64 / (24.0 * 60.0);
            let warmup = 1.0 - (-(offset as f64) / 240.0).exp() * 0.5;
            let jitter = 1.0 + noise.sample(&mut self.rng);
            samples.push(UsageSample {
                offset: SimTime::from_minutes(offset),
                usage: ResourceUsage::new(
                    CpuUnits::from_units(shape.cpu.as_f64() * jitter.max(0.0)),
                    (shape.memory * scale * warmup * jitter).max(0.0),
                    (shape.disk * scale * (1.0 + shape.growth * days) * jitter).max(0.0),
                ),
            });
            offset += step;
        }
        ReplicaTrace::from_samples(inserted_at, samples)
    }
}

struct TenantShape {
    cpu: CpuUnits,
    memory: f64,
    disk: f64,
    growth: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsim_core::UsageTrace;

    fn small_config() -> SyntheticConfig {
        SyntheticConfig {
            tenants: 30,
            mean_lifetime_hours: 12.0,
            ..SyntheticConfig::default()
        }
    }

    #[test]
    fn test_generation_is_deterministic() {
        let catalog = SloSpecification::builtin("Gen5");
        let a = SyntheticTraceGenerator::new(small_config(), &catalog).generate().unwrap();
        let b = SyntheticTraceGenerator::new(small_config(), &catalog).generate().unwrap();
        let ids_a: Vec<_> = a.tenants().map(|(t, r)| (t.to_string(), r.to_vec())).collect();
        let ids_b: Vec<_> = b.tenants().map(|(t, r)| (t.to_string(), r.to_vec())).collect();
        assert_eq!(ids_a, ids_b);
        assert_eq!(a.num_tenants(), 30);
    }

    #[test]
    fn test_premium_groups_and_catalog_slos() {
        let catalog = SloSpecification::builtin("Gen5");
        let set = SyntheticTraceGenerator::new(small_config(), &catalog).generate().unwrap();
        for (tenant, replicas) in set.tenants() {
            let slo = set.slo_of(tenant).unwrap();
            assert!(catalog.is_allowed(slo));
            let expected = if catalog.is_premium(slo).unwrap() { 4 } else { 1 };
            assert_eq!(replicas.len(), expected);
            let trace = set.trace(&replicas[0]).unwrap();
            assert!(trace.lifetime() >= SimTime::from_hours(1));
            assert!(trace.max_usage().memory <= catalog.memory_mb(slo).unwrap() * 0.7 * 1.1 * 1.2);
        }
    }

    #[test]
    fn test_zero_sample_interval_rejected() {
        let catalog = SloSpecification::builtin("Gen5");
        let config = SyntheticConfig {
            sample_minutes: 0,
            ..small_config()
        };
        assert!(SyntheticTraceGenerator::new(config, &catalog).generate().is_err());
    }
}
