//! Collaborator interfaces consumed by the simulation core

use rand::RngCore;

use crate::error::Result;
use crate::types::{CpuUnits, ResourceUsage, ReplicaId, SimTime};

/// Per-replica usage history, replayed relative to its placement time
pub trait UsageTrace {
    /// Usage reported `elapsed` after placement
    fn usage_at(&self, elapsed: SimTime) -> ResourceUsage;

    /// Component-wise maximum over the whole trace
    fn max_usage(&self) -> ResourceUsage;

    /// Whether the replica is still alive `elapsed` after placement
    fn is_active(&self, elapsed: SimTime) -> bool;

    /// Time of the last report
    fn lifetime(&self) -> SimTime;
}

/// Guaranteed per-SLO footprint for one hardware generation
pub trait SloCatalog {
    /// Application memory reservation in MB
    fn memory_mb(&self, slo: &str) -> Result<f64>;

    /// Instance disk reservation in MB
    fn disk_mb(&self, slo: &str) -> Result<f64>;

    /// Maximum CPU the SLO may consume
    fn max_cpu(&self, slo: &str) -> Result<CpuUnits>;

    /// Whether tenants of this SLO take part in the simulation
    fn is_allowed(&self, slo: &str) -> bool;

    /// Footprint triple used for ring-wide allocation accounting
    fn footprint(&self, slo: &str) -> Result<ResourceUsage> {
        Ok(ResourceUsage::new(
            self.max_cpu(slo)?,
            self.memory_mb(slo)?,
            self.disk_mb(slo)?,
        ))
    }
}

/// Stream of arriving tenants
pub trait TenantSource {
    /// Draw the replica group of the next arriving tenant; `counter` becomes
    /// the instance suffix of every replica id in the group
    fn next_tenant_group(&self, counter: u64, rng: &mut dyn RngCore) -> Result<Vec<ReplicaId>>;
}
