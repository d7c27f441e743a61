use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arrow::array::{AsArray, Int64Array, RecordBatch, StringArray};
use arrow::datatypes::Int64Type;
use arrow_schema::{DataType, Field, Schema};
use futures::executor::block_on;
use lfq_common::EngineConfig;
use lfq_execution::{TableSource, TaskContext, collect};
use lfq_storage::{Catalog, ParquetTable, TableDef};
use parquet::arrow::ArrowWriter;

fn unique_dir(tag: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("lfq-{tag}-{nanos}"));
    std::fs::create_dir_all(&dir).expect("create dir");
    dir
}

fn write_file(path: &PathBuf, ids: Vec<i64>, names: Vec<&str>) {
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, true),
        Field::new("name", DataType::Utf8, true),
    ]));
    let batch = RecordBatch::try_new(
        Arc::clone(&schema),
        vec![
            Arc::new(Int64Array::from(ids)),
            Arc::new(StringArray::from(names)),
        ],
    )
    .expect("batch");
    let file = File::create(path).expect("create file");
    let mut writer = ArrowWriter::try_new(file, schema, None).expect("writer");
    writer.write(&batch).expect("write");
    writer.close().expect("close");
}

#[test]
fn directory_table_scans_every_file_with_projection() {
    let dir = unique_dir("scan");
    write_file(&dir.join("a.parquet"), vec![1, 2], vec!["a", "b"]);
    write_file(&dir.join("b.parquet"), vec![3], vec!["c"]);

    let table = ParquetTable::try_from_path(&dir).expect("table");
    assert_eq!(table.statistics().num_rows, Some(3));

    let scan = table.scan(Some(&[1, 0]), &[], None).expect("scan");
    assert_eq!(scan.output_partitioning().partition_count(), 2);
    assert_eq!(scan.schema().field(0).name(), "name");

    let ctx = Arc::new(TaskContext::new(EngineConfig::default()));
    let batches = block_on(collect(scan, ctx)).expect("collect");
    let ids: Vec<i64> = batches
        .iter()
        .flat_map(|b| b.column(1).as_primitive::<Int64Type>().values().to_vec())
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn json_catalog_opens_parquet_tables() {
    let dir = unique_dir("catalog");
    let data = dir.join("t.parquet");
    write_file(&data, vec![7], vec!["x"]);
    let defs = serde_json::json!([
        { "name": "t", "uri": data.to_string_lossy(), "format": "parquet" }
    ]);
    let catalog_path = dir.join("catalog.json");
    std::fs::write(&catalog_path, defs.to_string()).expect("write catalog");

    let cat = Catalog::load_from_json(&catalog_path).expect("catalog");
    assert_eq!(cat.table_names(), vec!["t".to_string()]);
    assert_eq!(cat.schema("t").expect("schema").fields().len(), 2);
    let def: TableDef = serde_json::from_value(defs[0].clone()).expect("def");
    assert_eq!(def.format, "parquet");
    std::fs::remove_dir_all(&dir).ok();
}
