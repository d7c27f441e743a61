//! Scan sources for the engine.
//!
//! A [`Catalog`] maps table names to [`lfq_execution::TableSource`]s and is
//! what the physical planner resolves `TableScan` nodes against. Two sources
//! ship with the crate: [`MemTable`] over batches already in memory and
//! [`ParquetTable`] over local parquet files.

pub mod catalog;
pub mod memory;
pub mod parquet_provider;

pub use catalog::{Catalog, TableDef};
pub use memory::MemTable;
pub use parquet_provider::{ParquetScanExec, ParquetTable};
