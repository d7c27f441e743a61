//! Physical layer: operators, streams, and the drivers that run them.
//!
//! Architecture role:
//! - task context, cancellation, and the execution node contract
//! - expression compilation/evaluation and aggregate accumulators
//! - partitioned physical operators with bounded buffering and spill
//! - physical planning from optimized logical plans
//!
//! Key modules:
//! - [`context`]
//! - [`exec_node`]
//! - [`expressions`]
//! - [`ops`]
//! - [`physical_planner`]
//! - [`collect`]

pub mod aggregates;
pub mod collect;
pub mod context;
pub mod display;
pub mod exec_node;
pub mod expressions;
pub mod hash_utils;
pub mod metrics;
pub mod ops;
pub mod physical_planner;
pub mod source;
pub mod spill;
pub mod stream;

pub use collect::{collect, collect_partitioned, execute_stream, execute_stream_partitioned};
pub use context::{CancellationToken, SharedTaskContext, TaskContext};
pub use display::explain_physical;
pub use exec_node::{ExecNode, OutputPartitioning, execute_node};
pub use expressions::{PhysicalExpr, compile_expr};
pub use metrics::{MetricsSnapshot, OperatorMetrics};
pub use physical_planner::create_physical_plan;
pub use source::{SourceProvider, TableSource, TableStatistics};
pub use stream::{
    BatchSender, RecordBatchStream, SendableRecordBatchStream, StreamAdapter,
    bounded_batch_channel, empty_stream, memory_stream,
};
