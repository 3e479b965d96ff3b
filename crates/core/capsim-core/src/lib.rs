//! Capsim Core - Shared types and traits
//!
//! This crate defines the core abstractions used by the capacity-planning
//! simulator and the collaborators that feed it:
//! - Node, replica and tenant identities
//! - Fixed-point CPU accounting and resource triples
//! - Usage-trace, SLO-catalog and tenant-arrival interfaces
//! - Error types

pub mod types;
pub mod traits;
pub mod error;

pub use types::*;
pub use traits::*;
pub use error::*;
