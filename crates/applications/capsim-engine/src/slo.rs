//! SLO catalog
//!
//! Maps an SLO name to its guaranteed footprint on one hardware generation.
//! Each entry carries default values plus optional per-generation overrides.

use capsim_core::{CapsimError, CpuUnits, Result, SloCatalog};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

/// Raw `max_cpu_usage` units per core
const MAX_CPU_UNITS_PER_CORE: f64 = 100_000.0;

/// Per-generation overrides; missing keys fall back to the SLO defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardwareOverride {
    pub max_cpu_usage: Option<f64>,
    pub app_memory_usage_mb: Option<f64>,
    pub instance_disk_space_used: Option<f64>,
}

/// One SLO entry as stored in the catalog file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SloEntry {
    pub name: String,
    #[serde(default)]
    pub service_type: String,
    #[serde(default)]
    pub is_premium: bool,
    pub max_cpu_usage: f64,
    pub app_memory_usage_mb: f64,
    pub instance_disk_space_used: f64,
    #[serde(default)]
    pub hardware: BTreeMap<String, HardwareOverride>,
}

impl SloEntry {
    pub fn new(name: &str, cores: f64, memory_mb: f64, disk_mb: f64, is_premium: bool) -> Self {
        Self {
            name: name.to_string(),
            service_type: if is_premium { "Premium" } else { "Standard" }.to_string(),
            is_premium,
            max_cpu_usage: cores * MAX_CPU_UNITS_PER_CORE,
            app_memory_usage_mb: memory_mb,
            instance_disk_space_used: disk_mb,
            hardware: BTreeMap::new(),
        }
    }

    fn resolve(&self, generation: &str) -> ResolvedSlo {
        let over = self.hardware.get(generation);
        let pick = |value: Option<f64>, default: f64| value.unwrap_or(default);
        ResolvedSlo {
            max_cpu: CpuUnits::from_cores(
                pick(over.and_then(|o| o.max_cpu_usage), self.max_cpu_usage)
                    / MAX_CPU_UNITS_PER_CORE,
            ),
            memory_mb: pick(over.and_then(|o| o.app_memory_usage_mb), self.app_memory_usage_mb),
            disk_mb: pick(
                over.and_then(|o| o.instance_disk_space_used),
                self.instance_disk_space_used,
            ),
            is_premium: self.is_premium,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogFile {
    slos: Vec<SloEntry>,
}

#[derive(Debug, Clone, Copy)]
struct ResolvedSlo {
    max_cpu: CpuUnits,
    memory_mb: f64,
    disk_mb: f64,
    is_premium: bool,
}

/// Catalog instantiated for one hardware generation
#[derive(Debug, Clone)]
pub struct SloSpecification {
    generation: String,
    slos: BTreeMap<String, ResolvedSlo>,
}

impl SloSpecification {
    /// Build from entries; duplicates are logged and the first one wins
    pub fn from_entries(entries: Vec<SloEntry>, generation: &str) -> Self {
        let generation = generation.trim().to_string();
        let mut slos = BTreeMap::new();
        for entry in entries {
            if entry.name.trim().is_empty() {
                continue;
            }
            if slos.contains_key(&entry.name) {
                warn!(
                    "Duplicate SLO {} with service type {} in catalog",
                    entry.name, entry.service_type
                );
                continue;
            }
            let resolved = entry.resolve(&generation);
            slos.insert(entry.name, resolved);
        }
        Self { generation, slos }
    }

    pub fn from_json(text: &str, generation: &str) -> Result<Self> {
        let file: CatalogFile = serde_json::from_str(text)?;
        Ok(Self::from_entries(file.slos, generation))
    }

    pub fn from_file(path: &Path, generation: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text, generation)
    }

    /// Catalog backing synthetic workloads
    pub fn builtin(generation: &str) -> Self {
        let entries = vec![
            SloEntry::new("GP_Gen5_2", 2.0, 10_240.0, 32_768.0, false),
            SloEntry::new("GP_Gen5_4", 4.0, 20_480.0, 65_536.0, false),
            SloEntry::new("GP_Gen5_8", 8.0, 40_960.0, 131_072.0, false),
            SloEntry::new("BC_Gen5_2", 2.0, 10_240.0, 65_536.0, true),
            SloEntry::new("BC_Gen5_4", 4.0, 20_480.0, 131_072.0, true),
            SloEntry::new("BC_Gen5_8", 8.0, 40_960.0, 262_144.0, true),
        ];
        Self::from_entries(entries, generation)
    }

    pub fn generation(&self) -> &str {
        &self.generation
    }

    pub fn len(&self) -> usize {
        self.slos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slos.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slos.keys().map(String::as_str)
    }

    pub fn is_premium(&self, slo: &str) -> Result<bool> {
        Ok(self.get(slo)?.is_premium)
    }

    fn get(&self, slo: &str) -> Result<&ResolvedSlo> {
        self.slos
            .get(slo)
            .ok_or_else(|| CapsimError::UnknownSlo(slo.to_string()))
    }
}

impl SloCatalog for SloSpecification {
    fn memory_mb(&self, slo: &str) -> Result<f64> {
        Ok(self.get(slo)?.memory_mb)
    }

    fn disk_mb(&self, slo: &str) -> Result<f64> {
        Ok(self.get(slo)?.disk_mb)
    }

    fn max_cpu(&self, slo: &str) -> Result<CpuUnits> {
        Ok(self.get(slo)?.max_cpu)
    }

    fn is_allowed(&self, slo: &str) -> bool {
        self.slos.contains_key(slo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        "slos": [
            {"name": "SQLDB_GP_2", "max_cpu_usage": 200000, "app_memory_usage_mb": 10240,
             "instance_disk_space_used": 32768,
             "hardware": {"Gen5": {"app_memory_usage_mb": 12288}}},
            {"name": "SQLDB_BC_4", "is_premium": true, "max_cpu_usage": 400000,
             "app_memory_usage_mb": 20480, "instance_disk_space_used": 131072},
            {"name": "SQLDB_GP_2", "max_cpu_usage": 1, "app_memory_usage_mb": 1,
             "instance_disk_space_used": 1}
        ]
    }"#;

    #[test]
    fn test_generation_overrides() {
        let gen5 = SloSpecification::from_json(CATALOG, " Gen5 ").unwrap();
        assert_eq!(gen5.generation(), "Gen5");
        assert_eq!(gen5.memory_mb("SQLDB_GP_2").unwrap(), 12_288.0);
        assert_eq!(gen5.disk_mb("SQLDB_GP_2").unwrap(), 32_768.0);

        let gen4 = SloSpecification::from_json(CATALOG, "Gen4").unwrap();
        assert_eq!(gen4.memory_mb("SQLDB_GP_2").unwrap(), 10_240.0);
    }

    #[test]
    fn test_max_cpu_in_cores() {
        let catalog = SloSpecification::from_json(CATALOG, "Gen5").unwrap();
        assert_eq!(catalog.max_cpu("SQLDB_BC_4").unwrap(), CpuUnits::from_cores(4.0));
        assert!(catalog.is_premium("SQLDB_BC_4").unwrap());
    }

    #[test]
    fn test_duplicates_keep_first() {
        let catalog = SloSpecification::from_json(CATALOG, "Gen5").unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.max_cpu("SQLDB_GP_2").unwrap(), CpuUnits::from_cores(2.0));
    }

    #[test]
    fn test_unknown_slo() {
        let catalog = SloSpecification::builtin("Gen5");
        assert!(!catalog.is_allowed("SQLDB_HS_80"));
        assert!(matches!(catalog.disk_mb("SQLDB_HS_80"), Err(CapsimError::UnknownSlo(_))));
        let footprint = catalog.footprint("GP_Gen5_4").unwrap();
        assert_eq!(footprint.cpu, CpuUnits::from_cores(4.0));
        assert_eq!(footprint.memory, 20_480.0);
    }
}
