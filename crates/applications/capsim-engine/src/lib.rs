//! Capsim Simulation Engine
//!
//! Capacity-planning simulator for a ring of database nodes: tenants
//! arrive, grow and leave following usage traces while a placement
//! heuristic chooses their nodes and rolling upgrades evacuate one upgrade
//! domain at a time.

pub mod cluster;
pub mod config;
pub mod placement;
pub mod predictor;
pub mod runner;
pub mod slo;
pub mod synthetic;
pub mod trace;
pub mod upgrade;

pub use cluster::{ClusterManager, MoveKind};
pub use config::{ExperimentParams, PlacementHeuristic, SimulationConfig, UpgradeHeuristic};
pub use placement::PlacementSelector;
pub use predictor::ViolationPredictor;
pub use runner::{ExperimentRunner, ExperimentStatistics, SimulationSummary, run_experiment};
pub use upgrade::{UpgradeExecutor, UpgradeSchedule};
