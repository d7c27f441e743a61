//! Row encoding and hashing shared by repartition, joins, aggregation and set operations.
//!
//! Key columns are encoded with arrow's `RowConverter`, so equal values of the
//! same type produce identical bytes regardless of which batch they came from.
//! Hashes mix the engine seed into SipHash over those bytes, which keeps
//! partition assignment deterministic for a given seed.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use arrow::array::{Array, ArrayRef, UInt32Array};
use arrow::compute::SortOptions;
use arrow::row::{RowConverter, Rows, SortField};
use arrow_schema::DataType;
use lfq_common::Result;

/// Converter for key columns of `types`, all ascending with nulls first.
pub fn key_converter(types: &[DataType]) -> Result<RowConverter> {
    Ok(RowConverter::new(
        types.iter().map(|t| SortField::new(t.clone())).collect(),
    )?)
}

/// Converter honoring per-column sort options.
pub fn sort_converter(types: &[DataType], options: &[SortOptions]) -> Result<RowConverter> {
    Ok(RowConverter::new(
        types
            .iter()
            .zip(options)
            .map(|(t, o)| SortField::new_with_options(t.clone(), *o))
            .collect(),
    )?)
}

/// Seeded 64-bit hash of one encoded row.
pub fn hash_row(seed: u64, row: &[u8]) -> u64 {
    let mut h = DefaultHasher::new();
    seed.hash(&mut h);
    row.hash(&mut h);
    h.finish()
}

/// Hash every row of `rows`.
pub fn hash_rows(seed: u64, rows: &Rows) -> Vec<u64> {
    rows.iter().map(|r| hash_row(seed, r.as_ref())).collect()
}

/// Per-output row indices for hash partitioning into `n` parts.
pub fn partition_indices(hashes: &[u64], n: usize) -> Vec<UInt32Array> {
    let n = n.max(1);
    let mut parts: Vec<Vec<u32>> = vec![Vec::new(); n];
    for (i, h) in hashes.iter().enumerate() {
        parts[(*h % n as u64) as usize].push(i as u32);
    }
    parts.into_iter().map(UInt32Array::from).collect()
}

/// `true` for rows where every key column is non-null.
///
/// Join keys containing a null never match anything.
pub fn valid_key_rows(keys: &[ArrayRef], num_rows: usize) -> Vec<bool> {
    let mut valid = vec![true; num_rows];
    for k in keys {
        if let Some(nulls) = k.logical_nulls() {
            for (i, v) in valid.iter_mut().enumerate() {
                *v &= nulls.is_valid(i);
            }
        }
    }
    valid
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::Int64Array;

    use super::*;

    #[test]
    fn equal_values_hash_equal_across_batches() {
        let conv = key_converter(&[DataType::Int64]).expect("converter");
        let a: ArrayRef = Arc::new(Int64Array::from(vec![1, 2, 3]));
        let b: ArrayRef = Arc::new(Int64Array::from(vec![3, 9]));
        let ra = conv.convert_columns(&[a]).expect("rows");
        let rb = conv.convert_columns(&[b]).expect("rows");
        let ha = hash_rows(7, &ra);
        let hb = hash_rows(7, &rb);
        assert_eq!(ha[2], hb[0]);
        assert_ne!(hash_rows(8, &ra)[2], ha[2]);
    }

    #[test]
    fn partitions_cover_every_row_once() {
        let hashes = vec![0, 1, 2, 3, 4, 5, 6];
        let parts = partition_indices(&hashes, 3);
        let total: usize = parts.iter().map(|p| p.len()).sum();
        assert_eq!(total, 7);
        assert_eq!(parts[1].values().to_vec(), vec![1, 4]);
    }

    #[test]
    fn null_keys_are_invalid() {
        let k: ArrayRef = Arc::new(Int64Array::from(vec![Some(1), None]));
        assert_eq!(valid_key_rows(&[k], 2), vec![true, false]);
    }
}
