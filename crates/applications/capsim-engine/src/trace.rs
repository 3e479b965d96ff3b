//! Usage traces
//!
//! A [`TraceSet`] holds one [`ReplicaTrace`] per observed replica, grouped into
//! tenants. Premium tenants always expose four replica ids; replicas 2 and 3
//! share replica 1's trace. The [`ArrivalSampler`] draws arriving tenants from
//! the set with probability proportional to each SLO's share of the pool.

use capsim_core::{
    CapsimError, CpuUnits, ReplicaId, ResourceUsage, Result, SimTime, SloCatalog, TenantSource,
    UsageTrace, tenant_of,
};
use chrono::NaiveDateTime;
use rand::{Rng, RngCore};
use std::collections::{BTreeMap, BTreeSet};
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Replicas of one tenant inserted further apart than this were failed over
const FAILOVER_WINDOW_MINUTES: i64 = 10;

/// Disk and memory growth factor applied to growing tenants
const GROWTH_FACTOR: f64 = 2.5;

/// Look-back window used to detect growth
const GROWTH_WINDOW: SimTime = SimTime(5 * 60);

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %I:%M:%S %p",
];

/// One usage report, relative to the replica's insertion
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageSample {
    pub offset: SimTime,
    pub usage: ResourceUsage,
}

/// Usage history of a single replica
#[derive(Debug, Clone)]
pub struct ReplicaTrace {
    inserted_at: NaiveDateTime,
    samples: Vec<UsageSample>,
    max: ResourceUsage,
}

impl ReplicaTrace {
    /// Start a trace with its first report
    pub fn new(inserted_at: NaiveDateTime, usage: ResourceUsage) -> Self {
        Self {
            inserted_at,
            samples: vec![UsageSample { offset: SimTime::ZERO, usage }],
            max: usage,
        }
    }

    /// Build a trace from samples already expressed relative to insertion
    pub fn from_samples(inserted_at: NaiveDateTime, samples: Vec<UsageSample>) -> Result<Self> {
        let first = samples
            .first()
            .ok_or_else(|| CapsimError::trace("trace without samples"))?;
        if first.offset != SimTime::ZERO {
            return Err(CapsimError::trace("first sample must be at offset zero"));
        }
        if samples.windows(2).any(|w| w[1].offset < w[0].offset) {
            return Err(CapsimError::trace("samples out of order"));
        }
        let max = samples
            .iter()
            .fold(ResourceUsage::ZERO, |acc, s| acc.max(&s.usage));
        Ok(Self {
            inserted_at,
            samples,
            max,
        })
    }

    /// Append a report observed at `at`
    pub fn push(&mut self, at: NaiveDateTime, usage: ResourceUsage) -> Result<()> {
        let minutes = (at - self.inserted_at).num_minutes();
        let offset = u64::try_from(minutes)
            .map_err(|_| CapsimError::trace(format!("report at {at} precedes insertion")))?;
        let offset = SimTime::from_minutes(offset);
        if self.samples.last().is_some_and(|s| s.offset > offset) {
            return Err(CapsimError::trace(format!("report at {at} out of order")));
        }
        self.max = self.max.max(&usage);
        self.samples.push(UsageSample { offset, usage });
        Ok(())
    }

    pub fn inserted_at(&self) -> NaiveDateTime {
        self.inserted_at
    }

    pub fn samples(&self) -> &[UsageSample] {
        &self.samples
    }

    /// Index of the last sample reported at or before `elapsed`
    fn index_at(&self, elapsed: SimTime) -> usize {
        self.samples
            .partition_point(|s| s.offset <= elapsed)
            .saturating_sub(1)
    }

    fn usage_at_index(&self, idx: usize) -> ResourceUsage {
        // Every trace terminates with zeros
        if idx + 1 == self.samples.len() {
            ResourceUsage::ZERO
        } else {
            self.samples[idx].usage
        }
    }

    /// Reserved placement demand, banded on the SLO's CPU reservation
    pub fn placement_demand(reserved: CpuUnits) -> ResourceUsage {
        let (disk, cpu, memory) = match reserved.units() {
            c if c < 20_000 => (2.0, 1, 3072.0),
            c if c < 100_000 => (6.0, 2, 5120.0),
            c if c < 180_000 => (8.0, 3, 5120.0),
            _ => (10.0, 5, 5120.0),
        };
        ResourceUsage::new(CpuUnits::from_cores(cpu as f64), memory, disk * 25_000.0)
    }

    /// Current usage with disk and memory inflated when the replica is growing
    pub fn usage_accounting_for_growth(&self, elapsed: SimTime) -> ResourceUsage {
        if elapsed <= GROWTH_WINDOW {
            let mut usage = self.usage_at(elapsed);
            usage.disk *= GROWTH_FACTOR;
            usage.memory *= GROWTH_FACTOR;
            return usage;
        }

        let step = self
            .samples
            .get(1)
            .map(|s| s.offset.minutes())
            .filter(|&m| m > 0)
            .map_or(0, |m| (GROWTH_WINDOW.minutes() / m) as usize);
        let idx = self.index_at(elapsed);
        let prior = self.samples[idx.saturating_sub(step)].usage;
        let mut usage = self.usage_at_index(idx);
        if usage.disk - prior.disk > prior.disk * 0.01 {
            usage.disk *= GROWTH_FACTOR;
        }
        if usage.memory - prior.memory > prior.memory * 0.01 {
            usage.memory *= GROWTH_FACTOR;
        }
        usage
    }
}

impl UsageTrace for ReplicaTrace {
    fn usage_at(&self, elapsed: SimTime) -> ResourceUsage {
        self.usage_at_index(self.index_at(elapsed))
    }

    fn max_usage(&self) -> ResourceUsage {
        self.max
    }

    fn is_active(&self, elapsed: SimTime) -> bool {
        self.lifetime() >= elapsed
    }

    fn lifetime(&self) -> SimTime {
        self.samples.last().map_or(SimTime::ZERO, |s| s.offset)
    }
}

/// One parsed TSV row
#[derive(Debug, Clone)]
pub struct TraceRecord {
    pub timestamp: NaiveDateTime,
    pub cluster: String,
    pub machine: String,
    pub tenant: String,
    pub usage: ResourceUsage,
    pub slo: String,
}

impl TraceRecord {
    /// Parse `timestamp, cluster, machine, tenant, cpu, disk, memory, slo`
    pub fn parse(line: &str) -> Result<Self> {
        let columns: Vec<&str> = line.split('\t').collect();
        if columns.len() != 8 {
            return Err(CapsimError::trace(format!(
                "expected 8 columns; got {}",
                columns.len()
            )));
        }
        let number = |idx: usize| -> Result<f64> {
            columns[idx].trim().parse::<f64>().map_err(|_| {
                CapsimError::trace(format!("column {idx}: '{}' is not a number", columns[idx]))
            })
        };
        Ok(Self {
            timestamp: parse_timestamp(columns[0])?,
            cluster: columns[1].trim().to_string(),
            machine: columns[2].trim().to_string(),
            tenant: columns[3].trim().to_string(),
            usage: ResourceUsage::new(CpuUnits::from_units(number(4)?), number(6)?, number(5)?),
            slo: columns[7].trim().to_string(),
        })
    }

    pub fn canonical_id(&self) -> String {
        format!("{}_{}_{}", self.cluster, self.machine, self.tenant)
    }
}

fn parse_timestamp(text: &str) -> Result<NaiveDateTime> {
    let text = text.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .ok_or_else(|| CapsimError::trace(format!("unparseable timestamp '{text}'")))
}

/// All replica traces of a simulation, grouped into tenants
#[derive(Debug, Clone, Default)]
pub struct TraceSet {
    traces: BTreeMap<String, Arc<ReplicaTrace>>,
    tenant_slo: BTreeMap<String, String>,
    tenants: BTreeMap<String, Vec<String>>,
    slo_share: BTreeMap<String, f64>,
}

impl TraceSet {
    /// Load the TSV usage export
    pub fn from_file(path: &Path, use_only_new_tenants: bool) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file), use_only_new_tenants)
    }

    pub fn from_reader<R: BufRead>(reader: R, use_only_new_tenants: bool) -> Result<Self> {
        let mut traces: Vec<(String, String, ReplicaTrace)> = Vec::new();
        let mut previous: Option<(String, String, String)> = None;

        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = TraceRecord::parse(&line)
                .map_err(|e| CapsimError::trace(format!("line {}: {e}", line_num + 1)))?;
            if (line_num + 1) % 1_000_000 == 0 {
                info!("{}M lines read, {} traces detected", (line_num + 1) / 1_000_000, traces.len());
            }

            let key = (record.cluster.clone(), record.machine.clone(), record.tenant.clone());
            match traces.last_mut() {
                Some((_, _, trace)) if previous.as_ref() == Some(&key) => {
                    trace.push(record.timestamp, record.usage)?;
                }
                _ => {
                    traces.push((
                        record.canonical_id(),
                        record.slo.clone(),
                        ReplicaTrace::new(record.timestamp, record.usage),
                    ));
                    previous = Some(key);
                }
            }
        }
        Self::from_traces(traces, use_only_new_tenants)
    }

    /// Group replica traces `(canonical id, slo, trace)` into tenants
    pub fn from_traces(
        traces: Vec<(String, String, ReplicaTrace)>,
        use_only_new_tenants: bool,
    ) -> Result<Self> {
        let mut set = TraceSet::default();
        for (canonical, slo, trace) in traces {
            if set.traces.contains_key(&canonical) {
                return Err(CapsimError::trace(format!("duplicate replica trace {canonical}")));
            }
            set.tenant_slo
                .entry(tenant_of(&canonical).to_string())
                .or_insert(slo);
            set.traces.insert(canonical, Arc::new(trace));
        }

        if use_only_new_tenants {
            set.drop_initial_tenants();
        }
        set.group_replicas_in_tenants();
        Ok(set)
    }

    /// Drop traces inserted within an hour of the earliest insertion
    fn drop_initial_tenants(&mut self) {
        let Some(earliest) = self.traces.values().map(|t| t.inserted_at()).min() else {
            return;
        };
        let before = self.traces.len();
        self.traces
            .retain(|_, t| (t.inserted_at() - earliest).num_minutes() >= 60);
        info!("Dropped {} traces present at trace start", before - self.traces.len());
    }

    fn group_replicas_in_tenants(&mut self) {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for canonical in self.traces.keys() {
            grouped
                .entry(tenant_of(canonical).to_string())
                .or_default()
                .push(canonical.clone());
        }

        let total = grouped.len().max(1) as f64;
        let mut share: BTreeMap<String, f64> = BTreeMap::new();
        for tenant in grouped.keys() {
            if let Some(slo) = self.tenant_slo.get(tenant) {
                *share.entry(slo.clone()).or_default() += 1.0 / total;
            }
        }
        self.slo_share = share;

        let (mut standard, mut premium, mut dropped) = (0usize, 0usize, 0usize);
        for (tenant, replicas) in grouped {
            let kept = match replicas.len() {
                1 => Some(replicas),
                2 | 3 => None,
                4 if self.any_failed_over(&replicas) => None,
                4 => Some(replicas),
                _ => self.surviving_replicas(replicas),
            };
            match kept {
                Some(replicas) if replicas.len() == 1 => {
                    standard += 1;
                    self.tenants.insert(tenant, replicas);
                }
                Some(replicas) => {
                    premium += 1;
                    let replicas = self.order_premium_replicas(replicas);
                    self.tenants.insert(tenant, replicas);
                }
                None => dropped += 1,
            }
        }
        info!(
            "Trace pool: {} premium and {} standard tenants ({} dropped by failover filtering)",
            premium, standard, dropped
        );
    }

    fn insertion_gap_minutes(&self, a: &str, b: &str) -> i64 {
        (self.traces[a].inserted_at() - self.traces[b].inserted_at())
            .num_minutes()
            .abs()
    }

    fn any_failed_over(&self, replicas: &[String]) -> bool {
        replicas.iter().enumerate().any(|(i, a)| {
            replicas[i + 1..]
                .iter()
                .any(|b| self.insertion_gap_minutes(a, b) > FAILOVER_WINDOW_MINUTES)
        })
    }

    /// Replicas of an over-populated tenant that were created together and
    /// lived as long as the longest one; `None` unless four remain
    fn surviving_replicas(&self, replicas: Vec<String>) -> Option<Vec<String>> {
        let earliest = replicas.iter().map(|r| self.traces[r].inserted_at()).min()?;
        let early: Vec<String> = replicas
            .into_iter()
            .filter(|r| {
                (self.traces[r].inserted_at() - earliest).num_minutes() <= FAILOVER_WINDOW_MINUTES
            })
            .collect();
        let longest = early.iter().map(|r| self.traces[r].lifetime()).max()?;
        let mut survivors: Vec<String> = early
            .into_iter()
            .filter(|r| {
                longest.minutes() - self.traces[r].lifetime().minutes()
                    <= FAILOVER_WINDOW_MINUTES as u64
            })
            .collect();
        if survivors.len() < 4 {
            return None;
        }
        survivors.truncate(4);
        Some(survivors)
    }

    /// Move the largest replica to the front and alias replicas 2 and 3 to
    /// replica 1's trace
    fn order_premium_replicas(&mut self, mut replicas: Vec<String>) -> Vec<String> {
        let weight = |t: &ReplicaTrace| t.max_usage().memory * 1.1;
        let mut primary = 0;
        for i in 1..replicas.len() {
            if weight(&self.traces[&replicas[i]]) > weight(&self.traces[&replicas[primary]]) {
                primary = i;
            }
        }
        replicas.swap(0, primary);

        let secondary = Arc::clone(&self.traces[&replicas[1]]);
        for replica in &replicas[2..] {
            self.traces.insert(replica.clone(), Arc::clone(&secondary));
        }
        replicas
    }

    pub fn trace(&self, canonical: &str) -> Result<&Arc<ReplicaTrace>> {
        self.traces
            .get(canonical)
            .ok_or_else(|| CapsimError::UnknownReplica(canonical.to_string()))
    }

    pub fn slo_of(&self, tenant: &str) -> Result<&str> {
        self.tenant_slo
            .get(tenant)
            .map(String::as_str)
            .ok_or_else(|| CapsimError::UnknownReplica(tenant.to_string()))
    }

    /// Canonical replica ids of a tenant, primary first
    pub fn replicas_of(&self, tenant: &str) -> Option<&[String]> {
        self.tenants.get(tenant).map(Vec::as_slice)
    }

    pub fn tenants(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.tenants.iter().map(|(t, r)| (t.as_str(), r.as_slice()))
    }

    pub fn num_tenants(&self) -> usize {
        self.tenants.len()
    }

    pub fn num_replicas(&self) -> usize {
        self.tenants.values().map(Vec::len).sum()
    }

    pub fn slo_share(&self) -> &BTreeMap<String, f64> {
        &self.slo_share
    }

    /// Remove tenants from the arrival pool, keeping their traces
    pub fn remove_tenants(&mut self, tenants: &BTreeSet<String>) {
        self.tenants.retain(|t, _| !tenants.contains(t));
        debug!("Removed {} tenants from the arrival pool", tenants.len());
    }
}

#[derive(Debug, Clone)]
struct SloBucket {
    slo: String,
    cdf: f64,
    tenants: Vec<Vec<String>>,
}

/// Draws arriving tenants from a [`TraceSet`]
#[derive(Debug, Clone)]
pub struct ArrivalSampler {
    buckets: Vec<SloBucket>,
}

impl ArrivalSampler {
    /// Standard SLOs first, then premium; SLOs missing from the catalog are skipped
    pub fn new(traces: &TraceSet, slos: &dyn SloCatalog, only_premium: bool) -> Result<Self> {
        let mut standard: BTreeMap<&str, Vec<Vec<String>>> = BTreeMap::new();
        let mut premium: BTreeMap<&str, Vec<Vec<String>>> = BTreeMap::new();
        for (tenant, replicas) in traces.tenants() {
            let slo = traces.slo_of(tenant)?;
            let bucket = if replicas.len() == 1 { &mut standard } else { &mut premium };
            bucket.entry(slo).or_default().push(replicas.to_vec());
        }

        let mut buckets = Vec::new();
        let mut cdf = 0.0;
        let parts = if only_premium { vec![premium] } else { vec![standard, premium] };
        for part in parts {
            for (slo, tenants) in part {
                if !slos.is_allowed(slo) {
                    continue;
                }
                cdf += traces.slo_share().get(slo).copied().unwrap_or(0.0);
                buckets.push(SloBucket {
                    slo: slo.to_string(),
                    cdf,
                    tenants,
                });
            }
        }
        if buckets.is_empty() || cdf <= 0.0 {
            return Err(CapsimError::config("no tenants with an allowed SLO to draw arrivals from"));
        }
        Ok(Self { buckets })
    }

    pub fn slos(&self) -> impl Iterator<Item = &str> {
        self.buckets.iter().map(|b| b.slo.as_str())
    }
}

impl TenantSource for ArrivalSampler {
    fn next_tenant_group(&self, counter: u64, rng: &mut dyn RngCore) -> Result<Vec<ReplicaId>> {
        let total = self.buckets.last().map_or(0.0, |b| b.cdf);
        let draw = rng.gen_range(0.0..1.0) * total;
        let idx = self
            .buckets
            .partition_point(|b| b.cdf < draw)
            .min(self.buckets.len() - 1);
        let bucket = &self.buckets[idx];
        let replicas = &bucket.tenants[rng.gen_range(0..bucket.tenants.len())];
        Ok(replicas
            .iter()
            .map(|canonical| ReplicaId::new(canonical.clone(), counter))
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::slo::{SloEntry, SloSpecification};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    pub(crate) fn base_time() -> NaiveDateTime {
        parse_timestamp("2020-01-01 00:00:00").unwrap()
    }

    /// Trace with constant usage for `lifetime_minutes`, sampled every 10 minutes
    pub(crate) fn flat_trace(usage: ResourceUsage, lifetime_minutes: u64) -> ReplicaTrace {
        let samples = (0..=lifetime_minutes / 10)
            .map(|i| UsageSample {
                offset: SimTime::from_minutes(i * 10),
                usage,
            })
            .collect();
        ReplicaTrace::from_samples(base_time(), samples).unwrap()
    }

    fn tsv_line(minute: u32, machine: &str, tenant: &str, memory: u32, slo: &str) -> String {
        format!(
            "2020-01-01 {:02}:{:02}:00\ttr1\t{machine}\t{tenant}\t5000\t100\t{memory}\t{slo}\n",
            minute / 60,
            minute % 60
        )
    }

    #[test]
    fn test_usage_lookup_terminates_with_zeros() {
        let usage = ResourceUsage::new(CpuUnits(100), 10.0, 20.0);
        let trace = flat_trace(usage, 30);
        assert_eq!(trace.usage_at(SimTime::ZERO), usage);
        assert_eq!(trace.usage_at(SimTime::from_minutes(25)), usage);
        assert_eq!(trace.usage_at(SimTime::from_minutes(30)), ResourceUsage::ZERO);
        assert!(trace.is_active(SimTime::from_minutes(30)));
        assert!(!trace.is_active(SimTime::from_minutes(31)));
        assert_eq!(trace.lifetime(), SimTime::from_minutes(30));
    }

    #[test]
    fn test_placement_demand_bands() {
        let small = ReplicaTrace::placement_demand(CpuUnits::from_cores(1.0));
        assert_eq!(small, ResourceUsage::new(CpuUnits::from_cores(1.0), 3072.0, 50_000.0));
        let medium = ReplicaTrace::placement_demand(CpuUnits::from_cores(4.0));
        assert_eq!(medium.disk, 150_000.0);
        let large = ReplicaTrace::placement_demand(CpuUnits::from_cores(24.0));
        assert_eq!(large.cpu, CpuUnits::from_cores(5.0));
    }

    #[test]
    fn test_growth_accounting() {
        let samples: Vec<UsageSample> = (0..=100)
            .map(|i| UsageSample {
                offset: SimTime::from_minutes(i * 10),
                usage: ResourceUsage::new(CpuUnits(1), 100.0 + i as f64 * 10.0, 50.0),
            })
            .collect();
        let trace = ReplicaTrace::from_samples(base_time(), samples).unwrap();

        let early = trace.usage_accounting_for_growth(SimTime::from_hours(1));
        assert_eq!(early.memory, 160.0 * 2.5);
        assert_eq!(early.disk, 50.0 * 2.5);

        let late = trace.usage_accounting_for_growth(SimTime::from_hours(10));
        assert_eq!(late.memory, 700.0 * 2.5);
        assert_eq!(late.disk, 50.0);
    }

    #[test]
    fn test_tsv_grouping_and_premium_ordering() {
        let mut tsv = String::new();
        for minute in [0, 10, 20] {
            tsv.push_str(&tsv_line(minute, "DB1", "std", 500, "GP_Gen5_2"));
        }
        for (i, memory) in [100, 900, 300, 200].into_iter().enumerate() {
            for minute in [2, 12, 22] {
                tsv.push_str(&tsv_line(minute, &format!("DB{}", 10 + i), "prem", memory, "BC_Gen5_2"));
            }
        }
        for minute in [0, 10] {
            tsv.push_str(&tsv_line(minute, "DB5", "pair", 100, "GP_Gen5_2"));
            tsv.push_str(&tsv_line(minute, "DB6", "pair", 100, "GP_Gen5_2"));
        }

        let set = TraceSet::from_reader(tsv.as_bytes(), false).unwrap();
        assert_eq!(set.num_tenants(), 2);
        assert_eq!(set.replicas_of("std").unwrap(), ["tr1_DB1_std"]);

        let premium = set.replicas_of("prem").unwrap();
        assert_eq!(premium.len(), 4);
        assert_eq!(premium[0], "tr1_DB11_prem");
        let secondary = set.trace(&premium[1]).unwrap();
        assert!(Arc::ptr_eq(secondary, set.trace(&premium[2]).unwrap()));
        assert!(Arc::ptr_eq(secondary, set.trace(&premium[3]).unwrap()));
        assert_eq!(set.slo_of("prem").unwrap(), "BC_Gen5_2");
    }

    #[test]
    fn test_failed_over_premium_dropped() {
        let mut tsv = String::new();
        for (i, start) in [0, 0, 0, 45].into_iter().enumerate() {
            tsv.push_str(&tsv_line(start, &format!("DB{i}"), "flaky", 100, "BC_Gen5_2"));
            tsv.push_str(&tsv_line(start + 10, &format!("DB{i}"), "flaky", 100, "BC_Gen5_2"));
        }
        let set = TraceSet::from_reader(tsv.as_bytes(), false).unwrap();
        assert_eq!(set.num_tenants(), 0);
    }

    #[test]
    fn test_malformed_line() {
        let err = TraceSet::from_reader("2020-01-01 00:00:00\ttr1\tDB1\n".as_bytes(), false);
        assert!(matches!(err, Err(CapsimError::Trace(_))));
    }

    #[test]
    fn test_arrival_sampler_respects_catalog() {
        let traces = vec![
            ("r_m1_a".to_string(), "GP_Gen5_2".to_string(), flat_trace(ResourceUsage::ZERO, 20)),
            ("r_m2_b".to_string(), "Unknown".to_string(), flat_trace(ResourceUsage::ZERO, 20)),
        ];
        let set = TraceSet::from_traces(traces, false).unwrap();
        let catalog = SloSpecification::from_entries(
            vec![SloEntry::new("GP_Gen5_2", 2.0, 100.0, 100.0, false)],
            "Gen5",
        );
        let sampler = ArrivalSampler::new(&set, &catalog, false).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        for counter in 0..20 {
            let group = sampler.next_tenant_group(counter, &mut rng).unwrap();
            assert_eq!(group, vec![ReplicaId::new("r_m1_a", counter)]);
        }
        assert!(ArrivalSampler::new(&set, &catalog, true).is_err());
    }
}
