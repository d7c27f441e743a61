//! File sinks for finished query results.

use std::fmt;
use std::fs::{self, File};
use std::path::Path;
use std::str::FromStr;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use lfq_common::{LfqError, Result};
use parquet::arrow::ArrowWriter;
use parquet::basic::{BrotliLevel, Compression as ParquetCompression, GzipLevel, ZstdLevel};
use parquet::file::properties::WriterProperties;
use tracing::info;

/// Parquet compression codec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Compression {
    Uncompressed,
    Snappy,
    Gzip,
    Brotli,
    Lz4,
    Lz4Raw,
    #[default]
    Zstd,
}

impl Compression {
    /// Level used when the caller does not pass one.
    pub fn default_level(self) -> Option<u32> {
        match self {
            Compression::Gzip => Some(6),
            Compression::Brotli => Some(1),
            Compression::Zstd => Some(4),
            _ => None,
        }
    }

    /// Resolve to the parquet codec, rejecting levels for codecs without one.
    pub fn to_parquet(self, level: Option<u32>) -> Result<ParquetCompression> {
        let level = match (self.default_level(), level) {
            (None, Some(l)) => {
                return Err(LfqError::BuilderArgument(format!(
                    "compression {self} does not take a level (got {l})"
                )));
            }
            (Some(_), Some(l)) => l,
            (Some(d), None) => d,
            (None, None) => 0,
        };
        let bad_level = |e: parquet::errors::ParquetError| {
            LfqError::BuilderArgument(format!("invalid {self} level {level}: {e}"))
        };
        Ok(match self {
            Compression::Uncompressed => ParquetCompression::UNCOMPRESSED,
            Compression::Snappy => ParquetCompression::SNAPPY,
            Compression::Lz4 => ParquetCompression::LZ4,
            Compression::Lz4Raw => ParquetCompression::LZ4_RAW,
            Compression::Gzip => ParquetCompression::GZIP(GzipLevel::try_new(level).map_err(bad_level)?),
            Compression::Brotli => {
                ParquetCompression::BROTLI(BrotliLevel::try_new(level).map_err(bad_level)?)
            }
            Compression::Zstd => {
                let level = i32::try_from(level).map_err(|_| {
                    LfqError::BuilderArgument(format!("invalid zstd level {level}"))
                })?;
                ParquetCompression::ZSTD(ZstdLevel::try_new(level).map_err(bad_level)?)
            }
        })
    }
}

impl FromStr for Compression {
    type Err = LfqError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "uncompressed" => Ok(Compression::Uncompressed),
            "snappy" => Ok(Compression::Snappy),
            "gzip" => Ok(Compression::Gzip),
            "brotli" => Ok(Compression::Brotli),
            "lz4" => Ok(Compression::Lz4),
            "lz4_raw" => Ok(Compression::Lz4Raw),
            "zstd" => Ok(Compression::Zstd),
            other => Err(LfqError::BuilderArgument(format!(
                "unknown compression '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Compression::Uncompressed => "uncompressed",
            Compression::Snappy => "snappy",
            Compression::Gzip => "gzip",
            Compression::Brotli => "brotli",
            Compression::Lz4 => "lz4",
            Compression::Lz4Raw => "lz4_raw",
            Compression::Zstd => "zstd",
        };
        f.write_str(s)
    }
}

fn create(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(File::create(path)?)
}

fn parquet_err(e: parquet::errors::ParquetError) -> LfqError {
    LfqError::Execution(format!("parquet write failed: {e}"))
}

pub fn write_csv(path: &Path, batches: &[RecordBatch], with_header: bool) -> Result<()> {
    let mut writer = arrow::csv::WriterBuilder::new()
        .with_header(with_header)
        .build(create(path)?);
    for batch in batches {
        writer.write(batch)?;
    }
    info!(path = %path.display(), batches = batches.len(), "csv written");
    Ok(())
}

/// Newline-delimited JSON, one object per row.
pub fn write_json(path: &Path, batches: &[RecordBatch]) -> Result<()> {
    let mut writer = arrow::json::LineDelimitedWriter::new(create(path)?);
    for batch in batches {
        writer.write(batch)?;
    }
    writer.finish()?;
    info!(path = %path.display(), batches = batches.len(), "json written");
    Ok(())
}

pub fn write_parquet(
    path: &Path,
    schema: SchemaRef,
    batches: &[RecordBatch],
    compression: Compression,
    level: Option<u32>,
) -> Result<()> {
    let props = WriterProperties::builder()
        .set_compression(compression.to_parquet(level)?)
        .build();
    let mut writer = ArrowWriter::try_new(create(path)?, schema, Some(props)).map_err(parquet_err)?;
    for batch in batches {
        writer.write(batch).map_err(parquet_err)?;
    }
    writer.close().map_err(parquet_err)?;
    info!(path = %path.display(), %compression, "parquet written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_codecs_case_insensitively() {
        assert_eq!("ZSTD".parse::<Compression>().expect("zstd"), Compression::Zstd);
        assert_eq!("lz4_raw".parse::<Compression>().expect("lz4_raw"), Compression::Lz4Raw);
        assert!(matches!(
            "lzo".parse::<Compression>(),
            Err(LfqError::BuilderArgument(_))
        ));
    }

    #[test]
    fn default_levels_and_level_validation() {
        assert_eq!(
            Compression::Gzip.to_parquet(None).expect("gzip"),
            ParquetCompression::GZIP(GzipLevel::try_new(6).expect("level"))
        );
        assert_eq!(
            Compression::Zstd.to_parquet(None).expect("zstd"),
            ParquetCompression::ZSTD(ZstdLevel::try_new(4).expect("level"))
        );
        assert!(matches!(
            Compression::Snappy.to_parquet(Some(3)),
            Err(LfqError::BuilderArgument(_))
        ));
        assert!(matches!(
            Compression::Gzip.to_parquet(Some(42)),
            Err(LfqError::BuilderArgument(_))
        ));
        assert_eq!(
            Compression::Uncompressed.to_parquet(None).expect("none"),
            ParquetCompression::UNCOMPRESSED
        );
    }
}
