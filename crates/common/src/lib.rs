//! Shared configuration, error types, IDs, and observability primitives for LFQ crates.
//!
//! Architecture role:
//! - defines engine configuration passed from the client down to operators
//! - provides common [`LfqError`] / [`Result`] contracts
//! - hosts the memory pool used by blocking operators and the metrics registry
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`memory`]
//! - [`metrics`]

pub mod config;
pub mod error;
pub mod ids;
pub mod memory;
pub mod metrics;

pub use config::EngineConfig;
pub use error::{LfqError, Result};
pub use ids::*;
pub use memory::{MemoryPool, MemoryReservation};
pub use metrics::MetricsRegistry;
