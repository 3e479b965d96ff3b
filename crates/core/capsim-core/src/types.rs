//! Core types shared across the simulator

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use crate::error::{CapsimError, Result};

/// Fixed-point CPU units per core.
pub const CPU_UNITS_PER_CORE: i64 = 10_000;

/// Nodes grouped into one upgrade domain.
pub const NODES_PER_UPGRADE_DOMAIN: usize = 4;

/// Number of fault domains upgrade domains are folded onto.
pub const NUM_FAULT_DOMAINS: usize = 5;

/// Length of one simulated interval in minutes.
pub const SIMULATION_INTERVAL_MINUTES: u64 = 10;

/// Node identifier, an index into the cluster's node arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl NodeId {
    /// Arena index
    pub fn index(self) -> usize {
        self.0
    }

    /// Upgrade domain this node belongs to
    pub fn upgrade_domain(self) -> usize {
        self.0 / NODES_PER_UPGRADE_DOMAIN
    }

    /// Fault domain this node belongs to
    pub fn fault_domain(self) -> usize {
        self.upgrade_domain() % NUM_FAULT_DOMAINS
    }

    /// All node ids of an upgrade domain
    pub fn in_upgrade_domain(domain: usize) -> impl Iterator<Item = NodeId> {
        let start = domain * NODES_PER_UPGRADE_DOMAIN;
        (start..start + NODES_PER_UPGRADE_DOMAIN).map(NodeId)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// CPU amount in fixed-point units (`CPU_UNITS_PER_CORE` per core)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CpuUnits(pub i64);

impl CpuUnits {
    pub const ZERO: CpuUnits = CpuUnits(0);

    /// Convert a (possibly fractional) core count
    pub fn from_cores(cores: f64) -> Self {
        CpuUnits((cores * CPU_UNITS_PER_CORE as f64).round() as i64)
    }

    /// Convert a raw unit value as reported by usage traces
    pub fn from_units(units: f64) -> Self {
        CpuUnits(units.round() as i64)
    }

    pub fn units(self) -> i64 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64
    }

    pub fn cores(self) -> f64 {
        self.0 as f64 / CPU_UNITS_PER_CORE as f64
    }

    /// `self / capacity`, 0 for an empty capacity
    pub fn ratio(self, capacity: CpuUnits) -> f64 {
        if capacity.0 == 0 {
            0.0
        } else {
            self.0 as f64 / capacity.0 as f64
        }
    }

    /// Scale by a factor, rounding to the nearest unit
    pub fn scale(self, factor: f64) -> Self {
        CpuUnits((self.0 as f64 * factor).round() as i64)
    }
}

impl Add for CpuUnits {
    type Output = CpuUnits;
    fn add(self, rhs: CpuUnits) -> CpuUnits {
        CpuUnits(self.0 + rhs.0)
    }
}

impl Sub for CpuUnits {
    type Output = CpuUnits;
    fn sub(self, rhs: CpuUnits) -> CpuUnits {
        CpuUnits(self.0 - rhs.0)
    }
}

impl AddAssign for CpuUnits {
    fn add_assign(&mut self, rhs: CpuUnits) {
        self.0 += rhs.0;
    }
}

impl SubAssign for CpuUnits {
    fn sub_assign(&mut self, rhs: CpuUnits) {
        self.0 -= rhs.0;
    }
}

impl fmt::Display for CpuUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} cores", self.cores())
    }
}

/// Simulated time, in whole minutes since the start of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SimTime(pub u64);

impl SimTime {
    pub const ZERO: SimTime = SimTime(0);

    pub fn from_minutes(minutes: u64) -> Self {
        SimTime(minutes)
    }

    pub fn from_hours(hours: u64) -> Self {
        SimTime(hours * 60)
    }

    pub fn minutes(self) -> u64 {
        self.0
    }

    pub fn hours(self) -> f64 {
        self.0 as f64 / 60.0
    }

    /// Time elapsed since `earlier`, saturating at zero
    pub fn since(self, earlier: SimTime) -> SimTime {
        SimTime(self.0.saturating_sub(earlier.0))
    }

    /// Number of simulation intervals covered by this duration
    pub fn intervals(self) -> f64 {
        self.0 as f64 / SIMULATION_INTERVAL_MINUTES as f64
    }
}

impl Add for SimTime {
    type Output = SimTime;
    fn add(self, rhs: SimTime) -> SimTime {
        SimTime(self.0 + rhs.0)
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}h{:02}m", self.0 / 60, self.0 % 60)
    }
}

/// Resource usage triple: cpu in fixed-point units, memory and disk in MB
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu: CpuUnits,
    pub memory: f64,
    pub disk: f64,
}

impl ResourceUsage {
    pub const ZERO: ResourceUsage = ResourceUsage {
        cpu: CpuUnits::ZERO,
        memory: 0.0,
        disk: 0.0,
    };

    pub fn new(cpu: CpuUnits, memory: f64, disk: f64) -> Self {
        Self { cpu, memory, disk }
    }

    /// True if every component fits within `capacity`
    pub fn fits_within(&self, capacity: &ResourceUsage) -> bool {
        self.cpu <= capacity.cpu && self.memory <= capacity.memory && self.disk <= capacity.disk
    }

    /// Component-wise maximum
    pub fn max(&self, other: &ResourceUsage) -> ResourceUsage {
        ResourceUsage {
            cpu: self.cpu.max(other.cpu),
            memory: self.memory.max(other.memory),
            disk: self.disk.max(other.disk),
        }
    }
}

impl Add for ResourceUsage {
    type Output = ResourceUsage;
    fn add(self, rhs: ResourceUsage) -> ResourceUsage {
        ResourceUsage {
            cpu: self.cpu + rhs.cpu,
            memory: self.memory + rhs.memory,
            disk: self.disk + rhs.disk,
        }
    }
}

impl Sub for ResourceUsage {
    type Output = ResourceUsage;
    fn sub(self, rhs: ResourceUsage) -> ResourceUsage {
        ResourceUsage {
            cpu: self.cpu - rhs.cpu,
            memory: self.memory - rhs.memory,
            disk: self.disk - rhs.disk,
        }
    }
}

impl AddAssign for ResourceUsage {
    fn add_assign(&mut self, rhs: ResourceUsage) {
        self.cpu += rhs.cpu;
        self.memory += rhs.memory;
        self.disk += rhs.disk;
    }
}

impl SubAssign for ResourceUsage {
    fn sub_assign(&mut self, rhs: ResourceUsage) {
        self.cpu -= rhs.cpu;
        self.memory -= rhs.memory;
        self.disk -= rhs.disk;
    }
}

/// Tenant identity inside a run: the trace tenant plus the arrival counter
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TenantKey {
    pub tenant: String,
    pub instance: u64,
}

impl fmt::Display for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}${}", self.tenant, self.instance)
    }
}

/// Replica identity: canonical trace id (`ring_machine_tenant`) plus the
/// arrival counter that distinguishes repeated draws of the same trace
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId {
    pub canonical: String,
    pub instance: u64,
}

impl ReplicaId {
    pub fn new(canonical: impl Into<String>, instance: u64) -> Self {
        Self {
            canonical: canonical.into(),
            instance,
        }
    }

    /// Parse the `canonical$instance` display form
    pub fn parse(s: &str) -> Result<Self> {
        let (canonical, instance) = s
            .rsplit_once('$')
            .ok_or_else(|| CapsimError::UnknownReplica(s.to_string()))?;
        let instance = instance
            .parse()
            .map_err(|_| CapsimError::UnknownReplica(s.to_string()))?;
        Ok(Self::new(canonical, instance))
    }

    /// Tenant part of the canonical id (after the last `_`)
    pub fn tenant(&self) -> &str {
        tenant_of(&self.canonical)
    }

    pub fn tenant_key(&self) -> TenantKey {
        TenantKey {
            tenant: self.tenant().to_string(),
            instance: self.instance,
        }
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}${}", self.canonical, self.instance)
    }
}

/// Tenant part of a canonical replica id
pub fn tenant_of(canonical: &str) -> &str {
    canonical
        .rsplit_once('_')
        .map(|(_, tenant)| tenant)
        .unwrap_or(canonical)
}

/// Role of a replica, derived from its position in the tenant group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Primary,
    Secondary,
    Standard,
}

impl Role {
    /// Role of the replica at `index` in a group of `group_len` replicas
    pub fn of(index: usize, group_len: usize) -> Role {
        match (group_len, index) {
            (1, _) => Role::Standard,
            (_, 0) => Role::Primary,
            _ => Role::Secondary,
        }
    }
}

/// Side of the cluster new and moved replicas should favour during an upgrade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PlacementPreference {
    #[default]
    None,
    LowerUpgradeDomains,
    UpperUpgradeDomains,
}

impl PlacementPreference {
    pub fn opposite(self) -> Self {
        match self {
            PlacementPreference::None => PlacementPreference::None,
            PlacementPreference::LowerUpgradeDomains => PlacementPreference::UpperUpgradeDomains,
            PlacementPreference::UpperUpgradeDomains => PlacementPreference::LowerUpgradeDomains,
        }
    }
}
