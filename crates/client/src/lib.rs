//! Embedded, lazily evaluated DataFrame engine.
//!
//! Architecture role:
//! - [`Engine`] owns the table catalog, optimizer, metrics and worker runtime
//! - [`DataFrame`] wraps an immutable logical plan and runs it on demand
//! - [`Compression`] and the writers persist query results
//!
//! ```no_run
//! # async fn demo() -> lfq_common::Result<()> {
//! use lfq_client::{Engine, col, lit, sum};
//! use lfq_common::EngineConfig;
//!
//! let engine = Engine::new(EngineConfig::default())?;
//! engine.register_parquet("orders", "/data/orders")?;
//! let totals = engine
//!     .table("orders")?
//!     .filter(vec![col("amount").gt(lit(0i64))])?
//!     .aggregate(vec![col("customer")], vec![sum(col("amount"))])?;
//! totals.show(20).await?;
//! # Ok(())
//! # }
//! ```

mod runtime;
mod session;

pub mod dataframe;
pub mod engine;
pub mod writer;

pub use dataframe::DataFrame;
pub use engine::Engine;
pub use lfq_execution::CancellationToken;
pub use lfq_planner::expr_fn::*;
pub use lfq_planner::{Expr, JoinKeys, JoinType, SortExpr};
pub use runtime::{EmbeddedRuntime, Runtime};
pub use writer::Compression;
