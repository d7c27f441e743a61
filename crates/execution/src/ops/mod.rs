//! Physical operators.
//!
//! Every operator implements [`ExecNode`](crate::exec_node::ExecNode) and pulls
//! its children through [`execute_node`](crate::exec_node::execute_node).

pub mod aggregate;
pub mod coalesce;
pub mod filter;
pub mod hash_join;
pub mod join_utils;
pub mod limit;
pub mod memory;
pub mod nested_loop_join;
pub mod projection;
pub mod repartition;
pub mod set_op;
pub mod sort;
pub mod sort_merge_join;
pub mod union;
pub mod unnest;
pub mod window;

use std::sync::Arc;

use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use arrow_schema::SchemaRef;
use lfq_common::Result;

pub use aggregate::{HashAggregateExec, SortAggregateExec};
pub use coalesce::CoalescePartitionsExec;
pub use filter::FilterExec;
pub use hash_join::HashJoinExec;
pub use limit::{GlobalLimitExec, LocalLimitExec};
pub use memory::MemoryExec;
pub use nested_loop_join::NestedLoopJoinExec;
pub use projection::ProjectionExec;
pub use repartition::{RepartitionExec, RepartitionScheme};
pub use set_op::SetOpExec;
pub use sort::{SortExec, SortPreservingMergeExec};
pub use sort_merge_join::SortMergeJoinExec;
pub use union::UnionExec;
pub use unnest::UnnestExec;
pub use window::WindowExec;

/// Re-label `batch` with `schema`; column types must already match.
pub(crate) fn rebatch(schema: &SchemaRef, batch: RecordBatch) -> Result<RecordBatch> {
    if batch.schema_ref() == schema {
        return Ok(batch);
    }
    let options = RecordBatchOptions::new().with_row_count(Some(batch.num_rows()));
    Ok(RecordBatch::try_new_with_options(
        Arc::clone(schema),
        batch.columns().to_vec(),
        &options,
    )?)
}
