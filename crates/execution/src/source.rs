//! Contracts between the physical planner and data sources.

use std::fmt;
use std::sync::Arc;

use arrow_schema::SchemaRef;
use lfq_common::Result;
use lfq_planner::Expr;

use crate::exec_node::ExecNode;

/// Size hints a source may report; used to pick join and aggregate strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStatistics {
    pub num_rows: Option<usize>,
    pub total_bytes: Option<usize>,
}

/// A readable table.
pub trait TableSource: Send + Sync + fmt::Debug {
    fn schema(&self) -> SchemaRef;

    fn statistics(&self) -> TableStatistics {
        TableStatistics::default()
    }

    /// Build the leaf operator for a scan.
    ///
    /// `projection` indexes into [`TableSource::schema`]. `filters` and
    /// `limit` are hints: a source may use them to skip data but the
    /// planner re-applies every filter above the scan.
    fn scan(
        &self,
        projection: Option<&[usize]>,
        filters: &[Expr],
        limit: Option<usize>,
    ) -> Result<Arc<dyn ExecNode>>;
}

/// Resolves table names used by `TableScan` nodes.
pub trait SourceProvider: Send + Sync {
    fn source(&self, table: &str) -> Result<Arc<dyn TableSource>>;
}
