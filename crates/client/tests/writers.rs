use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arrow::array::{Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};
use futures::executor::block_on;
use lfq_client::{Compression, DataFrame, Engine, col, lit};
use lfq_common::{EngineConfig, LfqError};

fn unique_path(prefix: &str, ext: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("{prefix}_{nanos}.{ext}"))
}

fn source(engine: &Engine) -> DataFrame {
    let schema = Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, false),
        Field::new("v", DataType::Utf8, true),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(vec![1, 2, 3])),
            Arc::new(StringArray::from(vec![Some("a"), None, Some("c")])),
        ],
    )
    .expect("batch");
    engine.read_batches(vec![batch]).expect("read")
}

#[test]
fn parquet_round_trip_through_engine() {
    let engine = Engine::new(EngineConfig::default()).expect("engine");
    let path = unique_path("lfq_write", "parquet");
    let df = source(&engine)
        .filter(vec![col("k").gt(lit(1i64))])
        .expect("filter");
    block_on(df.write_parquet(&path, Compression::Gzip, None)).expect("write");

    let back = engine.read_parquet(&path).expect("read back");
    assert_eq!(back.schema().fields().len(), 2);
    assert_eq!(block_on(back.count()).expect("count"), 2);
    std::fs::remove_file(&path).ok();
}

#[test]
fn csv_and_json_sinks_write_rows() {
    let engine = Engine::new(EngineConfig::default()).expect("engine");
    let df = source(&engine);

    let csv = unique_path("lfq_write", "csv");
    block_on(df.write_csv(&csv, true)).expect("csv");
    let text = std::fs::read_to_string(&csv).expect("read csv");
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("k,v"));
    assert_eq!(lines.count(), 3);

    let json = unique_path("lfq_write", "json");
    block_on(df.write_json(&json)).expect("json");
    let text = std::fs::read_to_string(&json).expect("read json");
    assert_eq!(text.lines().count(), 3);
    assert!(text.contains(r#""k":1"#), "{text}");

    std::fs::remove_file(&csv).ok();
    std::fs::remove_file(&json).ok();
}

#[test]
fn level_for_codec_without_levels_is_rejected_before_running() {
    let engine = Engine::new(EngineConfig::default()).expect("engine");
    let path = unique_path("lfq_write", "parquet");
    let err = block_on(source(&engine).write_parquet(&path, Compression::Snappy, Some(2)))
        .expect_err("level rejected");
    assert!(matches!(err, LfqError::BuilderArgument(_)), "{err}");
    assert!(!path.exists());
    assert_eq!("brotli".parse::<Compression>().expect("parse").default_level(), Some(1));
}
