//! Experiment driver and statistics
//!
//! One run steps simulated time in 10-minute intervals:
//! 1. Upgrade the scheduled domain, opening and closing cycles
//! 2. Evict expired tenants and refresh usage
//! 3. Fill the ring with arrivals up to the CPU ceiling
//! 4. Record interval statistics
//! 5. Repair nodes in memory or disk violation
//!
//! Runs of an experiment are independent and seeded with their run index.

use capsim_core::{
    CapsimError, NodeId, PlacementPreference, ResourceUsage, Result, SIMULATION_INTERVAL_MINUTES,
    SimTime, SloCatalog, TenantSource,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterManager, MoveKind};
use crate::config::{ExperimentParams, MetricWeightingScheme, PlacementHeuristic};
use crate::placement::PlacementSelector;
use crate::predictor::ViolationPredictor;
use crate::trace::{ArrivalSampler, TraceSet};
use crate::upgrade::{UpgradeExecutor, UpgradeSchedule};

/// Passes over the ring looking for nodes to repair, per interval
const REPAIR_PASSES: usize = 3;

/// Progress is logged every this many simulated hours
const PROGRESS_HOURS: u64 = 10;

/// Per-run state shared by every random decision of the run
pub struct RunContext {
    pub run_index: u64,
    pub rng: StdRng,
}

impl RunContext {
    pub fn new(run_index: u64) -> Self {
        Self {
            run_index,
            rng: StdRng::seed_from_u64(run_index),
        }
    }
}

/// Statistics of one reporting interval. Utilisations are percentages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentStatistics {
    pub minutes_elapsed: u64,
    pub vcore_util: f64,
    pub disk_util: f64,
    pub mem_util: f64,
    /// Allocated cores over ring cores
    pub max_vcore_util: f64,
    pub cpu_violations: f64,
    pub disk_violations: f64,
    pub mem_violations: f64,
    pub moves: f64,
    pub moves_after_violation: f64,
    pub moves_due_to_clear_space: f64,
    pub cpu_moved: f64,
    pub memory_moved: f64,
    pub disk_moved: f64,
    pub placement_failures: f64,
    pub replacement_failures: f64,
    pub num_replicas: f64,
}

impl ExperimentStatistics {
    pub const TSV_HEADER: &'static str = "minutes\tvcore\tdisk\tmem\tmaxvcore\tcpuViol\tdiskViol\tmemViol\treplicas\tcpuMoved\tmemMoved\tdiskMoved\tmoves\tplacementFailures\treplacementFailures";

    pub fn add(&mut self, other: &ExperimentStatistics) {
        self.minutes_elapsed = self.minutes_elapsed.max(other.minutes_elapsed);
        self.vcore_util += other.vcore_util;
        self.disk_util += other.disk_util;
        self.mem_util += other.mem_util;
        self.max_vcore_util += other.max_vcore_util;
        self.cpu_violations += other.cpu_violations;
        self.disk_violations += other.disk_violations;
        self.mem_violations += other.mem_violations;
        self.moves += other.moves;
        self.moves_after_violation += other.moves_after_violation;
        self.moves_due_to_clear_space += other.moves_due_to_clear_space;
        self.cpu_moved += other.cpu_moved;
        self.memory_moved += other.memory_moved;
        self.disk_moved += other.disk_moved;
        self.placement_failures += other.placement_failures;
        self.replacement_failures += other.replacement_failures;
        self.num_replicas += other.num_replicas;
    }

    /// Ratios and replica counts are averaged over `intervals`, counters
    /// over `runs`
    pub fn divide(&mut self, runs: f64, intervals: f64) {
        if intervals > 0.0 {
            self.vcore_util /= intervals;
            self.disk_util /= intervals;
            self.mem_util /= intervals;
            self.max_vcore_util /= intervals;
            self.num_replicas /= intervals;
        }
        if runs > 0.0 {
            self.cpu_violations /= runs;
            self.disk_violations /= runs;
            self.mem_violations /= runs;
            self.moves /= runs;
            self.moves_after_violation /= runs;
            self.moves_due_to_clear_space /= runs;
            self.cpu_moved /= runs;
            self.memory_moved /= runs;
            self.disk_moved /= runs;
            self.placement_failures /= runs;
            self.replacement_failures /= runs;
        }
    }

    /// One record for a whole experiment: the sum of every interval of
    /// every run, averaged
    pub fn aggregate(runs: &[Vec<ExperimentStatistics>]) -> ExperimentStatistics {
        let mut total = ExperimentStatistics::default();
        let mut intervals = 0usize;
        for run in runs {
            for record in run {
                total.add(record);
            }
            intervals += run.len();
        }
        total.divide(runs.len() as f64, intervals as f64);
        total
    }

    /// Interval-by-interval mean across runs of equal length
    pub fn mean_per_interval(runs: &[Vec<ExperimentStatistics>]) -> Vec<ExperimentStatistics> {
        let len = runs.iter().map(Vec::len).min().unwrap_or(0);
        (0..len)
            .map(|i| {
                let mut mean = ExperimentStatistics::default();
                for run in runs {
                    mean.add(&run[i]);
                }
                let n = runs.len() as f64;
                mean.divide(n, n);
                mean
            })
            .collect()
    }

    pub fn total_moves(&self) -> f64 {
        self.moves + self.moves_after_violation
    }

    pub fn to_tsv(&self) -> String {
        format!(
            "{}\t{:.3}\t{:.3}\t{:.3}\t{:.3}\t{}\t{}\t{}\t{}\t{:.3}\t{:.3}\t{:.3}\t{}\t{}\t{}",
            self.minutes_elapsed,
            self.vcore_util,
            self.disk_util,
            self.mem_util,
            self.max_vcore_util,
            self.cpu_violations,
            self.disk_violations,
            self.mem_violations,
            self.num_replicas,
            self.cpu_moved,
            self.memory_moved,
            self.disk_moved,
            self.moves,
            self.placement_failures,
            self.replacement_failures,
        )
    }
}

/// Cumulative counters of one phase of an upgrade cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleCounters {
    pub memory_violations: u64,
    pub disk_violations: u64,
    pub moves: u64,
    pub moves_to_enable_placement: u64,
    pub swaps: u64,
}

impl CycleCounters {
    pub fn total_violations(&self) -> u64 {
        self.memory_violations + self.disk_violations
    }
}

/// What happened between two upgrade cycles and during one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeCycleLog {
    pub cycle: usize,
    pub before: CycleCounters,
    pub during: CycleCounters,
    pub min_swaps_needed: u64,
    pub min_moves_needed: u64,
}

/// Drives one run of one experiment
pub struct ExperimentRunner {
    params: ExperimentParams,
    ctx: RunContext,
    cluster: ClusterManager,
    selector: PlacementSelector,
    schedule: UpgradeSchedule,
    executor: UpgradeExecutor,
    arrivals: Arc<dyn TenantSource>,
    arrival_counter: u64,
    memory_violations: u64,
    disk_violations: u64,
    pending_before: Option<CycleCounters>,
    upgrade_logs: Vec<UpgradeCycleLog>,
}

impl ExperimentRunner {
    pub fn new(
        params: ExperimentParams,
        traces: Arc<TraceSet>,
        slos: Arc<dyn SloCatalog>,
        predictor: Arc<ViolationPredictor>,
        arrivals: Arc<dyn TenantSource>,
        run_index: u64,
    ) -> Result<Self> {
        let cluster = ClusterManager::new(&params, traces, slos, Arc::clone(&predictor))?;
        let selector = PlacementSelector::from_params(&params, Arc::clone(&predictor));
        let schedule = UpgradeSchedule::from_params(&params);
        let executor = UpgradeExecutor::new(&params, predictor);
        Ok(Self {
            params,
            ctx: RunContext::new(run_index),
            cluster,
            selector,
            schedule,
            executor,
            arrivals,
            arrival_counter: 0,
            memory_violations: 0,
            disk_violations: 0,
            pending_before: None,
            upgrade_logs: Vec::new(),
        })
    }

    pub fn cluster(&self) -> &ClusterManager {
        &self.cluster
    }

    pub fn upgrade_logs(&self) -> &[UpgradeCycleLog] {
        &self.upgrade_logs
    }

    /// Simulate the whole duration; one record per interval after t = 0
    pub fn run(&mut self) -> Result<Vec<ExperimentStatistics>> {
        let duration = SimTime::from_hours(self.params.simulation_duration_hours);
        let step = SimTime::from_minutes(SIMULATION_INTERVAL_MINUTES);
        let mut records = Vec::new();
        let mut now = SimTime::ZERO;

        info!(
            "Run {} of experiment {}: {} on {} nodes for {} h",
            self.ctx.run_index,
            self.params.id,
            self.params.placement_heuristic,
            self.params.num_nodes,
            self.params.simulation_duration_hours
        );

        while now <= duration {
            self.step_upgrades(now)?;

            let evicted = self.cluster.evict_tenants_if_lifetime_elapsed(now)?;
            self.selector.forget(&evicted);
            self.cluster.update_resource_usage_with_new_reports(now)?;

            let placement_failures = self.place_arrivals(now)?;

            if now != SimTime::ZERO {
                let mut record = self.collect_statistics(now);
                record.placement_failures = placement_failures as f64;
                let (moves, failures) = self.repair_violations(now)?;
                record.moves_after_violation = moves as f64;
                record.replacement_failures = failures as f64;
                records.push(record);
            }

            if now.minutes() % (PROGRESS_HOURS * 60) == 0 && now != SimTime::ZERO {
                info!(
                    "Run {}: {:.0} h simulated, {} tenants active, {} moves",
                    self.ctx.run_index,
                    now.hours(),
                    self.cluster.num_active_tenants(),
                    self.cluster.num_moves
                );
            }
            now = now + step;
        }

        self.cluster.check_consistency()?;
        Ok(records)
    }

    fn step_upgrades(&mut self, now: SimTime) -> Result<()> {
        if self.schedule.is_time_to_start_domain_upgrade(now) {
            if self.schedule.cycle_start() == Some(now) {
                self.cluster
                    .set_placement_preference(self.schedule.placement_preference());
                self.pending_before = Some(self.cycle_counters(0));
                self.reset_cycle_counters();
            }
            self.executor
                .upgrade(&mut self.cluster, &mut self.schedule, now, &mut self.ctx.rng)?;
        }

        if self.schedule.is_time_to_end_upgrade(now) {
            self.cluster.set_placement_preference(PlacementPreference::None);
            self.executor.end_cycle(&mut self.cluster, &self.schedule)?;

            let log = UpgradeCycleLog {
                cycle: self.schedule.next_index(),
                before: self.pending_before.take().unwrap_or_default(),
                during: self.cycle_counters(self.executor.num_moves),
                min_swaps_needed: self.executor.min_swaps_needed,
                min_moves_needed: self.executor.min_moves_needed,
            };
            info!(
                "Upgrade cycle {} done: {} swaps, {} moves ({} swaps and {} moves needed)",
                log.cycle,
                log.during.swaps,
                log.during.moves,
                log.min_swaps_needed,
                log.min_moves_needed
            );
            self.upgrade_logs.push(log);

            self.reset_cycle_counters();
            self.executor.reset_counters();
            self.executor.min_swaps_needed = 0;
            self.executor.min_moves_needed = 0;
            self.schedule.advance();
        }
        Ok(())
    }

    fn cycle_counters(&self, extra_moves: u64) -> CycleCounters {
        CycleCounters {
            memory_violations: self.memory_violations,
            disk_violations: self.disk_violations,
            moves: self.cluster.num_moves + extra_moves,
            moves_to_enable_placement: self.cluster.num_moves_to_enable_placement,
            swaps: self.cluster.num_swaps,
        }
    }

    fn reset_cycle_counters(&mut self) {
        self.memory_violations = 0;
        self.disk_violations = 0;
        self.cluster.num_moves = 0;
        self.cluster.num_moves_to_enable_placement = 0;
        self.cluster.num_swaps = 0;
    }

    /// Fill the ring up to its CPU ceiling. Returns the placement failures
    /// tolerated on the way.
    fn place_arrivals(&mut self, now: SimTime) -> Result<usize> {
        let mut failures = 0;
        let mut consecutive = 0;
        while !self.cluster.is_cpu_capacity_reached() {
            let group = self
                .arrivals
                .next_tenant_group(self.arrival_counter, &mut self.ctx.rng)?;
            self.arrival_counter += 1;

            match self
                .cluster
                .place(&mut self.selector, now, &group, &mut self.ctx.rng)
            {
                Ok(()) => consecutive = 0,
                Err(err) if err.is_placement_infeasible() && self.params.allow_tenant_placement_failures => {
                    warn!("Placement failed at {}: {}", now, err);
                    self.selector.forget(&group);
                    failures += 1;
                    consecutive += 1;
                    if consecutive >= self.params.max_consecutive_placement_failures {
                        warn!(
                            "Giving up on arrivals at {} after {} consecutive failures",
                            now, consecutive
                        );
                        break;
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Ok(failures)
    }

    fn collect_statistics(&mut self, now: SimTime) -> ExperimentStatistics {
        let capacity = self.cluster.capacity();
        let num_nodes = self.cluster.num_nodes() as f64;
        let total = self
            .cluster
            .usages()
            .into_iter()
            .fold(ResourceUsage::ZERO, |acc, u| acc + u);

        let mut record = ExperimentStatistics {
            minutes_elapsed: now.minutes(),
            vcore_util: 100.0 * total.cpu.as_f64() / (capacity.cpu.as_f64() * num_nodes),
            disk_util: 100.0 * total.disk / (capacity.disk * num_nodes),
            mem_util: 100.0 * total.memory / (capacity.memory * num_nodes),
            max_vcore_util: 100.0 * self.cluster.allocated().cpu.as_f64()
                / (capacity.cpu.as_f64() * num_nodes),
            num_replicas: self.cluster.num_active_tenants() as f64,
            ..Default::default()
        };

        for index in 0..self.cluster.num_nodes() {
            let node = NodeId(index);
            if self.cluster.is_node_in_cpu_violation(node) {
                record.cpu_violations += 1.0;
                warn!("{} in CPU violation at {}", node, now);
            }
            if self.cluster.is_node_in_memory_violation(node) {
                record.mem_violations += 1.0;
                self.memory_violations += 1;
                warn!("{} in memory violation at {}", node, now);
            }
            if self.cluster.is_node_in_disk_violation(node) {
                record.disk_violations += 1.0;
                self.disk_violations += 1;
                warn!("{} in disk violation at {}", node, now);
            }
        }

        let interval = std::mem::take(&mut self.cluster.interval);
        record.moves = interval.moves as f64;
        record.moves_due_to_clear_space = interval.moves_due_to_clear_space as f64;
        record.cpu_moved = interval.cpu_moved;
        record.memory_moved = interval.memory_moved;
        record.disk_moved = interval.disk_moved;
        record
    }

    /// Move replicas off nodes whose memory or disk exceeds capacity.
    /// Returns the moves made and the nodes that could not be fixed.
    fn repair_violations(&mut self, now: SimTime) -> Result<(usize, usize)> {
        let mut moves = 0;
        let mut failures = 0;
        for _ in 0..REPAIR_PASSES {
            if !self.cluster.is_any_node_in_violation() {
                break;
            }
            for index in 0..self.cluster.num_nodes() {
                let node = NodeId(index);
                if !self.cluster.is_node_in_violation(node) {
                    continue;
                }
                let plan = self.cluster.find_replicas_to_move_to_fix_violation_on_node(
                    &self.selector,
                    now,
                    node,
                    &mut self.ctx.rng,
                )?;
                if !plan.complete {
                    failures += 1;
                }
                for planned in &plan.moves {
                    self.cluster
                        .move_replica(now, &planned.replica, planned.dst, MoveKind::Regular)?;
                }
                moves += plan.num_moves();
                debug!("Repaired {} with {} moves (complete: {})", node, plan.num_moves(), plan.complete);
            }
        }
        Ok((moves, failures))
    }
}

/// Aggregated outcome of one experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSummary {
    pub id: usize,
    pub heuristic: PlacementHeuristic,
    pub weighting_scheme: MetricWeightingScheme,
    pub params: ExperimentParams,
    pub runs: usize,
    pub statistics: ExperimentStatistics,
    pub upgrade_logs: Vec<UpgradeCycleLog>,
    #[serde(skip)]
    pub per_interval: Vec<ExperimentStatistics>,
}

impl ExperimentSummary {
    pub fn total_moves(&self) -> f64 {
        self.statistics.total_moves()
    }

    /// Interval means as TSV, header first
    pub fn to_tsv(&self) -> String {
        let mut out = String::from(ExperimentStatistics::TSV_HEADER);
        out.push('\n');
        for record in &self.per_interval {
            out.push_str(&record.to_tsv());
            out.push('\n');
        }
        out
    }
}

/// Run every repetition of an experiment and aggregate them
pub fn run_experiment(
    params: &ExperimentParams,
    traces: Arc<TraceSet>,
    slos: Arc<dyn SloCatalog>,
    predictor: Arc<ViolationPredictor>,
    runs: usize,
) -> Result<ExperimentSummary> {
    if runs == 0 {
        return Err(CapsimError::config("an experiment needs at least one run"));
    }
    let arrivals: Arc<dyn TenantSource> = Arc::new(ArrivalSampler::new(
        &traces,
        slos.as_ref(),
        params.only_premium_tenants,
    )?);

    let mut all_runs = Vec::with_capacity(runs);
    let mut upgrade_logs = Vec::new();
    for run_index in 0..runs {
        let mut runner = ExperimentRunner::new(
            params.clone(),
            Arc::clone(&traces),
            Arc::clone(&slos),
            Arc::clone(&predictor),
            Arc::clone(&arrivals),
            run_index as u64,
        )?;
        all_runs.push(runner.run()?);
        upgrade_logs.extend_from_slice(runner.upgrade_logs());
    }

    let statistics = ExperimentStatistics::aggregate(&all_runs);
    info!(
        "Experiment {} ({}, {:?}): vcore {:.1}%, mem {:.1}%, disk {:.1}%, {:.1} moves per run",
        params.id,
        params.placement_heuristic,
        params.weighting_scheme,
        statistics.vcore_util,
        statistics.mem_util,
        statistics.disk_util,
        statistics.total_moves()
    );
    Ok(ExperimentSummary {
        id: params.id,
        heuristic: params.placement_heuristic,
        weighting_scheme: params.weighting_scheme,
        params: params.clone(),
        runs,
        statistics,
        upgrade_logs,
        per_interval: ExperimentStatistics::mean_per_interval(&all_runs),
    })
}

/// Every experiment of a simulation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulationSummary {
    pub experiments: Vec<ExperimentSummary>,
}

impl SimulationSummary {
    pub fn push(&mut self, summary: ExperimentSummary) {
        self.experiments.push(summary);
    }

    /// Experiments ordered by total moves, fewest first
    pub fn ranked(&self) -> Vec<&ExperimentSummary> {
        let mut ranked: Vec<&ExperimentSummary> = self.experiments.iter().collect();
        ranked.sort_by(|a, b| a.total_moves().total_cmp(&b.total_moves()));
        ranked
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
