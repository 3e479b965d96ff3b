//! Simulation configuration
//!
//! A simulation is a set of experiments: every cluster configuration of the
//! search space crossed with every placement algorithm. Each experiment is
//! run `runs_per_configuration` times with independent seeds.

use capsim_core::{CapsimError, NODES_PER_UPGRADE_DOMAIN, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::synthetic::SyntheticConfig;

/// Placement heuristic selected per experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PlacementHeuristic {
    #[default]
    WorstFit,
    BestFit,
    WorstFitUpgrade,
    DotProduct,
    InnerProduct,
    L2Norm,
    SumOfSquares,
    MinStdDiv,
    Penalties,
    WorstFitProbabilityViolation,
    WorstFitProbabilityViolationUpgrade,
    BestFitProbabilityViolation,
}

impl PlacementHeuristic {
    pub const ALL: [PlacementHeuristic; 12] = [
        PlacementHeuristic::WorstFit,
        PlacementHeuristic::BestFit,
        PlacementHeuristic::WorstFitUpgrade,
        PlacementHeuristic::DotProduct,
        PlacementHeuristic::InnerProduct,
        PlacementHeuristic::L2Norm,
        PlacementHeuristic::SumOfSquares,
        PlacementHeuristic::MinStdDiv,
        PlacementHeuristic::Penalties,
        PlacementHeuristic::WorstFitProbabilityViolation,
        PlacementHeuristic::WorstFitProbabilityViolationUpgrade,
        PlacementHeuristic::BestFitProbabilityViolation,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PlacementHeuristic::WorstFit => "WorstFit",
            PlacementHeuristic::BestFit => "BestFit",
            PlacementHeuristic::WorstFitUpgrade => "WorstFitUpgrade",
            PlacementHeuristic::DotProduct => "DotProduct",
            PlacementHeuristic::InnerProduct => "InnerProduct",
            PlacementHeuristic::L2Norm => "L2Norm",
            PlacementHeuristic::SumOfSquares => "SumOfSquares",
            PlacementHeuristic::MinStdDiv => "MinStdDiv",
            PlacementHeuristic::Penalties => "Penalties",
            PlacementHeuristic::WorstFitProbabilityViolation => "WorstFitProbabilityViolation",
            PlacementHeuristic::WorstFitProbabilityViolationUpgrade => {
                "WorstFitProbabilityViolationUpgrade"
            }
            PlacementHeuristic::BestFitProbabilityViolation => "BestFitProbabilityViolation",
        }
    }

    /// Whether the heuristic consults the violation predictor per node
    pub fn uses_violation_probability(self) -> bool {
        matches!(
            self,
            PlacementHeuristic::WorstFitProbabilityViolation
                | PlacementHeuristic::WorstFitProbabilityViolationUpgrade
                | PlacementHeuristic::BestFitProbabilityViolation
        )
    }
}

impl FromStr for PlacementHeuristic {
    type Err = CapsimError;

    fn from_str(s: &str) -> Result<Self> {
        PlacementHeuristic::ALL
            .into_iter()
            .find(|h| h.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| CapsimError::config(format!("unknown placement heuristic '{s}'")))
    }
}

impl fmt::Display for PlacementHeuristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How per-resource terms are combined into one score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MetricWeightingScheme {
    /// Minimum of the three terms
    #[default]
    MinWeight,
    /// Terms weighted by the cluster-wide mean utilisation of each resource
    FfSumWeight,
    /// Plain average
    UnweightedAvg,
}

impl FromStr for MetricWeightingScheme {
    type Err = CapsimError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "MinWeight" => Ok(MetricWeightingScheme::MinWeight),
            "FFSumWeight" | "FfSumWeight" => Ok(MetricWeightingScheme::FfSumWeight),
            "UnweightedAvg" => Ok(MetricWeightingScheme::UnweightedAvg),
            other => Err(CapsimError::config(format!("unknown weighting scheme '{other}'"))),
        }
    }
}

/// Upgrade executor variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum UpgradeHeuristic {
    GreedilyFailover,
    GreedilyFailoverWithSort,
    GreedilyFailoverPrimThenStd,
    #[default]
    GreedilyFailoverPrimThenStdWithSort,
}

impl FromStr for UpgradeHeuristic {
    type Err = CapsimError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "GreedilyFailover" => Ok(UpgradeHeuristic::GreedilyFailover),
            "GreedilyFailoverWithSort" => Ok(UpgradeHeuristic::GreedilyFailoverWithSort),
            "GreedilyFailoverPrimThenStd" => Ok(UpgradeHeuristic::GreedilyFailoverPrimThenStd),
            "GreedilyFailoverPrimThenStdWithSort" => {
                Ok(UpgradeHeuristic::GreedilyFailoverPrimThenStdWithSort)
            }
            other => Err(CapsimError::config(format!("unknown upgrade heuristic '{other}'"))),
        }
    }
}

/// Hardware search space; the cartesian product defines cluster configurations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSpace {
    pub cpu_caps: Vec<f64>,
    pub disk_caps: Vec<f64>,
    pub memory_caps: Vec<f64>,
    pub vcores_per_node: Vec<f64>,
    pub memory_sizes_gb: Vec<f64>,
    pub disk_sizes_gb: Vec<f64>,
    pub overbooking_ratios: Vec<f64>,
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self {
            cpu_caps: vec![0.9],
            disk_caps: vec![0.8],
            memory_caps: vec![0.85],
            vcores_per_node: vec![128.0],
            memory_sizes_gb: vec![4096.0],
            disk_sizes_gb: vec![14_540.0],
            overbooking_ratios: vec![1.0],
        }
    }
}

impl SearchSpace {
    pub fn size(&self) -> usize {
        self.cpu_caps.len()
            * self.disk_caps.len()
            * self.memory_caps.len()
            * self.vcores_per_node.len()
            * self.memory_sizes_gb.len()
            * self.disk_sizes_gb.len()
            * self.overbooking_ratios.len()
    }
}

/// Cluster shape and per-node overheads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub nodes: usize,
    pub vcore_overhead_per_node: u32,
    pub memory_overhead_per_node_gb: f64,
    pub disk_overhead_per_node_gb: f64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: 40,
            vcore_overhead_per_node: 2,
            memory_overhead_per_node_gb: 20.0,
            disk_overhead_per_node_gb: 200.0,
        }
    }
}

/// One placement algorithm to evaluate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementAlgo {
    pub heuristic: String,
    pub weighting_scheme: String,
    pub nodes_to_reserve: usize,
    pub penalties_threshold: f64,
    pub violation_threshold: f64,
    pub mc_repetitions: usize,
}

impl Default for PlacementAlgo {
    fn default() -> Self {
        Self {
            heuristic: "WorstFit".to_string(),
            weighting_scheme: "MinWeight".to_string(),
            nodes_to_reserve: 0,
            penalties_threshold: 0.25,
            violation_threshold: 0.05,
            mc_repetitions: 100,
        }
    }
}

/// Rolling-upgrade settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgradeAlgo {
    pub heuristic: String,
    pub interval_hours: u64,
    pub hours_per_domain: u64,
    pub apply_placement_preference: bool,
    pub unidirectional: bool,
}

impl Default for UpgradeAlgo {
    fn default() -> Self {
        Self {
            heuristic: "GreedilyFailoverPrimThenStdWithSort".to_string(),
            interval_hours: 672,
            hours_per_domain: 2,
            apply_placement_preference: true,
            unidirectional: false,
        }
    }
}

/// Top-level simulation configuration (JSON)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub search_space: SearchSpace,
    pub cluster: ClusterConfig,
    pub placement_algorithms: Vec<PlacementAlgo>,
    pub upgrade: UpgradeAlgo,
    pub runs_per_configuration: usize,
    pub simulation_duration_hours: u64,
    pub warmup_hours: u64,
    pub start_configuration_id: usize,
    pub hardware_generation: String,
    pub extrapolate_growing_tenants: bool,
    pub allow_tenant_placement_failures: bool,
    pub max_consecutive_placement_failures: usize,
    pub only_premium_tenants: bool,
    pub use_only_new_tenants: bool,
    pub apply_fault_domain_constraints: bool,
    pub predictor_seed: u64,
    pub trace_file: Option<PathBuf>,
    pub slo_file: Option<PathBuf>,
    pub synthetic: SyntheticConfig,
    pub output_directory: Option<PathBuf>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            search_space: SearchSpace::default(),
            cluster: ClusterConfig::default(),
            placement_algorithms: vec![PlacementAlgo::default()],
            upgrade: UpgradeAlgo::default(),
            runs_per_configuration: 1,
            simulation_duration_hours: 24 * 30,
            warmup_hours: 24,
            start_configuration_id: 0,
            hardware_generation: "Gen5".to_string(),
            extrapolate_growing_tenants: false,
            allow_tenant_placement_failures: false,
            max_consecutive_placement_failures: 50,
            only_premium_tenants: false,
            use_only_new_tenants: false,
            apply_fault_domain_constraints: true,
            predictor_seed: 1,
            trace_file: None,
            slo_file: None,
            synthetic: SyntheticConfig::default(),
            output_directory: None,
        }
    }
}

impl SimulationConfig {
    /// Load from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn num_experiments(&self) -> usize {
        self.search_space.size() * self.placement_algorithms.len()
    }

    /// Expand the search space into validated experiment parameters
    pub fn experiments(&self) -> Result<Vec<ExperimentParams>> {
        if self.runs_per_configuration == 0 {
            return Err(CapsimError::config("runs_per_configuration must be at least 1"));
        }
        if self.upgrade.hours_per_domain == 0 {
            return Err(CapsimError::config("upgrade.hours_per_domain must be at least 1"));
        }
        let upgrade_heuristic: UpgradeHeuristic = self.upgrade.heuristic.parse()?;
        let algorithms = self
            .placement_algorithms
            .iter()
            .map(|algo| {
                Ok((
                    algo,
                    algo.heuristic.parse::<PlacementHeuristic>()?,
                    algo.weighting_scheme.parse::<MetricWeightingScheme>()?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let space = &self.search_space;
        let mut experiments = Vec::new();
        let mut id = 0;
        for &cpu_cap in &space.cpu_caps {
            for &disk_cap in &space.disk_caps {
                for &memory_cap in &space.memory_caps {
                    for &vcores in &space.vcores_per_node {
                        for &memory_gb in &space.memory_sizes_gb {
                            for &disk_gb in &space.disk_sizes_gb {
                                for &overbooking_ratio in &space.overbooking_ratios {
                                    for (algo, heuristic, weighting) in &algorithms {
                                        if id < self.start_configuration_id {
                                            id += 1;
                                            continue;
                                        }
                                        let params = ExperimentParams {
                                            id,
                                            cpu_cap,
                                            disk_cap,
                                            memory_cap,
                                            overbooking_ratio,
                                            node_num_cores: (vcores * (1.0 - 0.07)).floor(),
                                            node_memory_mb: 1024.0
                                                * (memory_gb - self.cluster.memory_overhead_per_node_gb),
                                            node_disk_mb: 1024.0
                                                * (disk_gb - self.cluster.disk_overhead_per_node_gb),
                                            num_nodes: self.cluster.nodes,
                                            hardware_generation: self.hardware_generation.clone(),
                                            placement_heuristic: *heuristic,
                                            weighting_scheme: *weighting,
                                            nodes_to_reserve: algo.nodes_to_reserve,
                                            penalties_threshold: algo.penalties_threshold,
                                            violation_threshold: algo.violation_threshold,
                                            mc_repetitions: algo.mc_repetitions,
                                            extrapolate_growing_tenants: self
                                                .extrapolate_growing_tenants,
                                            allow_tenant_placement_failures: self
                                                .allow_tenant_placement_failures,
                                            max_consecutive_placement_failures: self
                                                .max_consecutive_placement_failures,
                                            only_premium_tenants: self.only_premium_tenants,
                                            apply_fault_domain_constraints: self
                                                .apply_fault_domain_constraints,
                                            upgrade_heuristic,
                                            upgrade_interval_hours: self.upgrade.interval_hours,
                                            hours_per_domain: self.upgrade.hours_per_domain,
                                            warmup_hours: self.warmup_hours,
                                            apply_placement_preference: self
                                                .upgrade
                                                .apply_placement_preference,
                                            unidirectional_upgrades: self.upgrade.unidirectional,
                                            simulation_duration_hours: self
                                                .simulation_duration_hours,
                                        };
                                        params.validate()?;
                                        experiments.push(params);
                                        id += 1;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(experiments)
    }
}

/// Fully resolved parameters of one experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentParams {
    pub id: usize,
    pub cpu_cap: f64,
    pub disk_cap: f64,
    pub memory_cap: f64,
    pub overbooking_ratio: f64,
    pub node_num_cores: f64,
    pub node_memory_mb: f64,
    pub node_disk_mb: f64,
    pub num_nodes: usize,
    pub hardware_generation: String,
    pub placement_heuristic: PlacementHeuristic,
    pub weighting_scheme: MetricWeightingScheme,
    pub nodes_to_reserve: usize,
    pub penalties_threshold: f64,
    pub violation_threshold: f64,
    pub mc_repetitions: usize,
    pub extrapolate_growing_tenants: bool,
    pub allow_tenant_placement_failures: bool,
    pub max_consecutive_placement_failures: usize,
    pub only_premium_tenants: bool,
    pub apply_fault_domain_constraints: bool,
    pub upgrade_heuristic: UpgradeHeuristic,
    pub upgrade_interval_hours: u64,
    pub hours_per_domain: u64,
    pub warmup_hours: u64,
    pub apply_placement_preference: bool,
    pub unidirectional_upgrades: bool,
    pub simulation_duration_hours: u64,
}

impl Default for ExperimentParams {
    fn default() -> Self {
        Self {
            id: 0,
            cpu_cap: 0.9,
            disk_cap: 1.0,
            memory_cap: 1.0,
            overbooking_ratio: 1.0,
            node_num_cores: 4.0,
            node_memory_mb: 1000.0,
            node_disk_mb: 1000.0,
            num_nodes: 4,
            hardware_generation: "Gen5".to_string(),
            placement_heuristic: PlacementHeuristic::WorstFit,
            weighting_scheme: MetricWeightingScheme::MinWeight,
            nodes_to_reserve: 0,
            penalties_threshold: 0.25,
            violation_threshold: 0.05,
            mc_repetitions: 20,
            extrapolate_growing_tenants: false,
            allow_tenant_placement_failures: false,
            max_consecutive_placement_failures: 50,
            only_premium_tenants: false,
            apply_fault_domain_constraints: false,
            upgrade_heuristic: UpgradeHeuristic::GreedilyFailoverPrimThenStdWithSort,
            upgrade_interval_hours: 672,
            hours_per_domain: 2,
            warmup_hours: 24,
            apply_placement_preference: true,
            unidirectional_upgrades: false,
            simulation_duration_hours: 48,
        }
    }
}

impl ExperimentParams {
    /// Set node count and per-node capacities
    pub fn with_nodes(mut self, num_nodes: usize, cores: f64, memory_mb: f64, disk_mb: f64) -> Self {
        self.num_nodes = num_nodes;
        self.node_num_cores = cores;
        self.node_memory_mb = memory_mb;
        self.node_disk_mb = disk_mb;
        self
    }

    pub fn with_heuristic(mut self, heuristic: PlacementHeuristic) -> Self {
        self.placement_heuristic = heuristic;
        self
    }

    pub fn with_weighting(mut self, scheme: MetricWeightingScheme) -> Self {
        self.weighting_scheme = scheme;
        self
    }

    pub fn with_upgrade(mut self, heuristic: UpgradeHeuristic, warmup_hours: u64, interval_hours: u64) -> Self {
        self.upgrade_heuristic = heuristic;
        self.warmup_hours = warmup_hours;
        self.upgrade_interval_hours = interval_hours;
        self
    }

    pub fn with_duration_hours(mut self, hours: u64) -> Self {
        self.simulation_duration_hours = hours;
        self
    }

    pub fn with_fault_domains(mut self, enabled: bool) -> Self {
        self.apply_fault_domain_constraints = enabled;
        self
    }

    pub fn num_upgrade_domains(&self) -> usize {
        self.num_nodes / NODES_PER_UPGRADE_DOMAIN
    }

    /// Reject shapes the simulator cannot model
    pub fn validate(&self) -> Result<()> {
        if self.num_nodes == 0 || self.num_nodes % NODES_PER_UPGRADE_DOMAIN != 0 {
            return Err(CapsimError::config(format!(
                "node count {} must be a positive multiple of {}",
                self.num_nodes, NODES_PER_UPGRADE_DOMAIN
            )));
        }
        for (name, cap) in [
            ("cpu_cap", self.cpu_cap),
            ("disk_cap", self.disk_cap),
            ("memory_cap", self.memory_cap),
        ] {
            if !(cap > 0.0 && cap <= 1.0) {
                return Err(CapsimError::config(format!("{name} {cap} must be in (0, 1]")));
            }
        }
        if self.node_num_cores <= 0.0 || self.node_memory_mb <= 0.0 || self.node_disk_mb <= 0.0 {
            return Err(CapsimError::config("node capacities must be positive"));
        }
        if self.mc_repetitions == 0 {
            return Err(CapsimError::config("mc_repetitions must be at least 1"));
        }
        if self.hours_per_domain == 0 {
            return Err(CapsimError::config("hours_per_domain must be at least 1"));
        }
        Ok(())
    }
}
