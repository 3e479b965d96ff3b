//! Error types for Capsim

use std::fmt::Display;
use thiserror::Error;

/// Capsim result type
pub type Result<T> = std::result::Result<T, CapsimError>;

/// Errors raised by the simulator
#[derive(Error, Debug)]
pub enum CapsimError {
    /// No eligible node even after attempting to clear space
    #[error("Placement infeasible for {replica}: {reason}")]
    PlacementInfeasible { replica: String, reason: String },

    /// A run-level invariant was broken (upgrade assertions, clear-space post-check)
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    /// Configuration error (unknown heuristic, inconsistent cluster shape, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// SLO missing from the catalog
    #[error("Unknown SLO: {0}")]
    UnknownSlo(String),

    /// Replica or tenant not tracked by the cluster or the trace set
    #[error("Unknown replica: {0}")]
    UnknownReplica(String),

    /// Malformed usage trace input
    #[error("Trace error: {0}")]
    Trace(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CapsimError {
    /// Create a placement-infeasible error
    pub fn infeasible(replica: impl Display, reason: impl Into<String>) -> Self {
        Self::PlacementInfeasible {
            replica: replica.to_string(),
            reason: reason.into(),
        }
    }

    /// Create an invariant violation
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a trace error
    pub fn trace(msg: impl Into<String>) -> Self {
        Self::Trace(msg.into())
    }

    /// Whether the driver may count this as a placement failure and continue
    pub fn is_placement_infeasible(&self) -> bool {
        matches!(self, Self::PlacementInfeasible { .. })
    }
}
