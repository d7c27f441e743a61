use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use lfq_common::{LfqError, Result};
use lfq_execution::ops::MemoryExec;
use lfq_execution::{ExecNode, TableSource, TableStatistics};
use lfq_planner::Expr;

/// Table over record batches held in memory, one `Vec` per partition.
#[derive(Debug, Clone)]
pub struct MemTable {
    schema: SchemaRef,
    partitions: Vec<Vec<RecordBatch>>,
}

impl MemTable {
    /// Every batch must carry the same fields as `schema`.
    pub fn try_new(schema: SchemaRef, partitions: Vec<Vec<RecordBatch>>) -> Result<Self> {
        for batch in partitions.iter().flatten() {
            if batch.schema().fields() != schema.fields() {
                return Err(LfqError::Schema(format!(
                    "batch schema {:?} does not match table schema {:?}",
                    batch.schema().fields(),
                    schema.fields()
                )));
            }
        }
        Ok(Self { schema, partitions })
    }

    /// Single-partition table; the schema is taken from the first batch.
    pub fn from_batches(batches: Vec<RecordBatch>) -> Result<Self> {
        let schema = batches
            .first()
            .map(RecordBatch::schema)
            .ok_or_else(|| {
                LfqError::BuilderArgument("at least one batch is required".to_string())
            })?;
        Self::try_new(schema, vec![batches])
    }

    pub fn partitions(&self) -> &[Vec<RecordBatch>] {
        &self.partitions
    }
}

impl TableSource for MemTable {
    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn statistics(&self) -> TableStatistics {
        let batches = || self.partitions.iter().flatten();
        TableStatistics {
            num_rows: Some(batches().map(RecordBatch::num_rows).sum()),
            total_bytes: Some(batches().map(RecordBatch::get_array_memory_size).sum()),
        }
    }

    fn scan(
        &self,
        projection: Option<&[usize]>,
        _filters: &[Expr],
        limit: Option<usize>,
    ) -> Result<Arc<dyn ExecNode>> {
        Ok(Arc::new(MemoryExec::try_new(
            self.partitions.clone(),
            Arc::clone(&self.schema),
            projection.map(<[usize]>::to_vec),
            limit,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use arrow::array::Int64Array;
    use arrow_schema::{DataType, Field, Schema};

    use super::*;

    #[test]
    fn rejects_batches_with_a_different_schema() {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, true)]));
        let other = Arc::new(Schema::new(vec![Field::new("b", DataType::Int64, true)]));
        let batch = RecordBatch::try_new(other, vec![Arc::new(Int64Array::from(vec![1]))])
            .expect("batch");
        assert!(matches!(
            MemTable::try_new(schema, vec![vec![batch]]),
            Err(LfqError::Schema(_))
        ));
    }

    #[test]
    fn statistics_count_rows_across_partitions() {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, true)]));
        let batch = |n: i64| {
            RecordBatch::try_new(
                Arc::clone(&schema),
                vec![Arc::new(Int64Array::from_iter_values(0..n))],
            )
            .expect("batch")
        };
        let t = MemTable::try_new(Arc::clone(&schema), vec![vec![batch(3)], vec![batch(4)]])
            .expect("table");
        assert_eq!(t.statistics().num_rows, Some(7));
        let scan = t.scan(Some(&[0]), &[], Some(2)).expect("scan");
        assert_eq!(scan.output_partitioning().partition_count(), 2);
    }
}
