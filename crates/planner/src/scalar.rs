//! Single typed values used by literals, accumulators, and constant folding.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, AsArray, BooleanArray, Float64Array, Int32Array, Int64Array, StringArray,
    UInt64Array, new_null_array,
};
use arrow::compute::cast;
use arrow::datatypes::{
    DataType, Float32Type, Float64Type, Int8Type, Int16Type, Int32Type, Int64Type, UInt8Type,
    UInt16Type, UInt32Type, UInt64Type,
};
use lfq_common::{LfqError, Result};
use serde::{Deserialize, Serialize};

/// A nullable value of one of the engine's canonical scalar types.
///
/// Narrow integer and float columns map onto the widest variant of their
/// family (`Int8`/`Int16` read as `Int32`, unsigned as `UInt64`, `Float32` as
/// `Float64`); [`ScalarValue::iter_to_array`] casts back to the column type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    /// Untyped null.
    Null,
    Boolean(Option<bool>),
    Int32(Option<i32>),
    Int64(Option<i64>),
    UInt64(Option<u64>),
    Float64(Option<f64>),
    Utf8(Option<String>),
}

impl ScalarValue {
    pub fn data_type(&self) -> DataType {
        match self {
            ScalarValue::Null => DataType::Null,
            ScalarValue::Boolean(_) => DataType::Boolean,
            ScalarValue::Int32(_) => DataType::Int32,
            ScalarValue::Int64(_) => DataType::Int64,
            ScalarValue::UInt64(_) => DataType::UInt64,
            ScalarValue::Float64(_) => DataType::Float64,
            ScalarValue::Utf8(_) => DataType::Utf8,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(
            self,
            ScalarValue::Null
                | ScalarValue::Boolean(None)
                | ScalarValue::Int32(None)
                | ScalarValue::Int64(None)
                | ScalarValue::UInt64(None)
                | ScalarValue::Float64(None)
                | ScalarValue::Utf8(None)
        )
    }

    /// Typed null for `dt`'s canonical variant.
    pub fn try_new_null(dt: &DataType) -> Result<Self> {
        Ok(match dt {
            DataType::Null => ScalarValue::Null,
            DataType::Boolean => ScalarValue::Boolean(None),
            DataType::Int8 | DataType::Int16 | DataType::Int32 => ScalarValue::Int32(None),
            DataType::Int64 => ScalarValue::Int64(None),
            DataType::UInt8 | DataType::UInt16 | DataType::UInt32 | DataType::UInt64 => {
                ScalarValue::UInt64(None)
            }
            DataType::Float32 | DataType::Float64 => ScalarValue::Float64(None),
            DataType::Utf8 | DataType::LargeUtf8 => ScalarValue::Utf8(None),
            other => {
                return Err(LfqError::Unsupported(format!(
                    "scalar values of type {other}"
                )));
            }
        })
    }

    /// Read row `idx` of `array`.
    pub fn try_from_array(array: &dyn Array, idx: usize) -> Result<Self> {
        if array.is_null(idx) {
            return Self::try_new_null(array.data_type());
        }
        Ok(match array.data_type() {
            DataType::Null => ScalarValue::Null,
            DataType::Boolean => ScalarValue::Boolean(Some(array.as_boolean().value(idx))),
            DataType::Int8 => ScalarValue::Int32(Some(array.as_primitive::<Int8Type>().value(idx).into())),
            DataType::Int16 => ScalarValue::Int32(Some(array.as_primitive::<Int16Type>().value(idx).into())),
            DataType::Int32 => ScalarValue::Int32(Some(array.as_primitive::<Int32Type>().value(idx))),
            DataType::Int64 => ScalarValue::Int64(Some(array.as_primitive::<Int64Type>().value(idx))),
            DataType::UInt8 => ScalarValue::UInt64(Some(array.as_primitive::<UInt8Type>().value(idx).into())),
            DataType::UInt16 => ScalarValue::UInt64(Some(array.as_primitive::<UInt16Type>().value(idx).into())),
            DataType::UInt32 => ScalarValue::UInt64(Some(array.as_primitive::<UInt32Type>().value(idx).into())),
            DataType::UInt64 => ScalarValue::UInt64(Some(array.as_primitive::<UInt64Type>().value(idx))),
            DataType::Float32 => {
                ScalarValue::Float64(Some(array.as_primitive::<Float32Type>().value(idx).into()))
            }
            DataType::Float64 => {
                ScalarValue::Float64(Some(array.as_primitive::<Float64Type>().value(idx)))
            }
            DataType::Utf8 => ScalarValue::Utf8(Some(array.as_string::<i32>().value(idx).to_string())),
            DataType::LargeUtf8 => {
                ScalarValue::Utf8(Some(array.as_string::<i64>().value(idx).to_string()))
            }
            other => {
                return Err(LfqError::Unsupported(format!(
                    "scalar values of type {other}"
                )));
            }
        })
    }

    /// Repeat this value `n` times.
    pub fn to_array_of_size(&self, n: usize) -> ArrayRef {
        match self {
            ScalarValue::Null => new_null_array(&DataType::Null, n),
            ScalarValue::Boolean(v) => Arc::new(BooleanArray::from(vec![*v; n])),
            ScalarValue::Int32(v) => Arc::new(Int32Array::from(vec![*v; n])),
            ScalarValue::Int64(v) => Arc::new(Int64Array::from(vec![*v; n])),
            ScalarValue::UInt64(v) => Arc::new(UInt64Array::from(vec![*v; n])),
            ScalarValue::Float64(v) => Arc::new(Float64Array::from(vec![*v; n])),
            ScalarValue::Utf8(v) => Arc::new(StringArray::from(vec![v.as_deref(); n])),
        }
    }

    /// Build an array of type `dt` from a sequence of values.
    pub fn iter_to_array(
        values: impl IntoIterator<Item = ScalarValue>,
        dt: &DataType,
    ) -> Result<ArrayRef> {
        let values: Vec<ScalarValue> = values.into_iter().collect();
        let canonical = Self::try_new_null(dt)?.data_type();
        let array: ArrayRef = match canonical {
            DataType::Null => new_null_array(dt, values.len()),
            DataType::Boolean => Arc::new(
                values
                    .iter()
                    .map(|v| match v {
                        ScalarValue::Boolean(b) => Ok(*b),
                        v if v.is_null() => Ok(None),
                        v => Err(mismatch(v, dt)),
                    })
                    .collect::<Result<BooleanArray>>()?,
            ),
            DataType::Int32 => Arc::new(
                values
                    .iter()
                    .map(|v| match v {
                        ScalarValue::Int32(x) => Ok(*x),
                        v if v.is_null() => Ok(None),
                        v => Err(mismatch(v, dt)),
                    })
                    .collect::<Result<Int32Array>>()?,
            ),
            DataType::Int64 => Arc::new(
                values
                    .iter()
                    .map(|v| match v {
                        ScalarValue::Int64(x) => Ok(*x),
                        ScalarValue::Int32(x) => Ok(x.map(i64::from)),
                        v if v.is_null() => Ok(None),
                        v => Err(mismatch(v, dt)),
                    })
                    .collect::<Result<Int64Array>>()?,
            ),
            DataType::UInt64 => Arc::new(
                values
                    .iter()
                    .map(|v| match v {
                        ScalarValue::UInt64(x) => Ok(*x),
                        v if v.is_null() => Ok(None),
                        v => Err(mismatch(v, dt)),
                    })
                    .collect::<Result<UInt64Array>>()?,
            ),
            DataType::Float64 => Arc::new(
                values
                    .iter()
                    .map(|v| match v {
                        ScalarValue::Float64(x) => Ok(*x),
                        v if v.is_null() => Ok(None),
                        v => Err(mismatch(v, dt)),
                    })
                    .collect::<Result<Float64Array>>()?,
            ),
            DataType::Utf8 => Arc::new(
                values
                    .iter()
                    .map(|v| match v {
                        ScalarValue::Utf8(s) => Ok(s.clone()),
                        v if v.is_null() => Ok(None),
                        v => Err(mismatch(v, dt)),
                    })
                    .collect::<Result<StringArray>>()?,
            ),
            other => {
                return Err(LfqError::Unsupported(format!("arrays of type {other}")));
            }
        };
        if array.data_type() == dt {
            Ok(array)
        } else {
            Ok(cast(&array, dt)?)
        }
    }

    /// Value as `bool`, `None` for nulls and non-boolean values.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ScalarValue::Boolean(b) => *b,
            _ => None,
        }
    }

    /// Value as `i64` when it is an integer that fits.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ScalarValue::Int32(v) => v.map(i64::from),
            ScalarValue::Int64(v) => *v,
            ScalarValue::UInt64(v) => v.and_then(|x| i64::try_from(x).ok()),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            ScalarValue::Int32(v) => v.map(f64::from),
            ScalarValue::Int64(v) => v.map(|x| x as f64),
            ScalarValue::UInt64(v) => v.map(|x| x as f64),
            ScalarValue::Float64(v) => *v,
            _ => None,
        }
    }

    fn as_i128(&self) -> Option<i128> {
        match self {
            ScalarValue::Int32(v) => v.map(i128::from),
            ScalarValue::Int64(v) => v.map(i128::from),
            ScalarValue::UInt64(v) => v.map(i128::from),
            _ => None,
        }
    }
}

fn mismatch(v: &ScalarValue, dt: &DataType) -> LfqError {
    LfqError::Execution(format!(
        "cannot place {} value into {dt} array",
        v.data_type()
    ))
}

impl PartialOrd for ScalarValue {
    /// Orders non-null values of comparable types; numeric variants compare
    /// across widths. Nulls and mixed families are unordered.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        use ScalarValue::*;
        match (self, other) {
            (Boolean(Some(a)), Boolean(Some(b))) => a.partial_cmp(b),
            (Utf8(Some(a)), Utf8(Some(b))) => a.partial_cmp(b),
            (Float64(Some(a)), Float64(Some(b))) => Some(a.total_cmp(b)),
            (a, b) if a.is_null() || b.is_null() => None,
            (Float64(_), _) | (_, Float64(_)) => {
                let (a, b) = (self.as_f64()?, other.as_f64()?);
                Some(a.total_cmp(&b))
            }
            _ => {
                let (a, b) = (self.as_i128()?, other.as_i128()?);
                a.partial_cmp(&b)
            }
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            v if v.is_null() => write!(f, "NULL"),
            ScalarValue::Boolean(Some(b)) => write!(f, "{b}"),
            ScalarValue::Int32(Some(v)) => write!(f, "{v}"),
            ScalarValue::Int64(Some(v)) => write!(f, "{v}"),
            ScalarValue::UInt64(Some(v)) => write!(f, "{v}"),
            ScalarValue::Float64(Some(v)) => write!(f, "{v:?}"),
            ScalarValue::Utf8(Some(s)) => write!(f, "'{s}'"),
            _ => write!(f, "NULL"),
        }
    }
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        ScalarValue::Boolean(Some(v))
    }
}

impl From<i32> for ScalarValue {
    fn from(v: i32) -> Self {
        ScalarValue::Int32(Some(v))
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        ScalarValue::Int64(Some(v))
    }
}

impl From<u64> for ScalarValue {
    fn from(v: u64) -> Self {
        ScalarValue::UInt64(Some(v))
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        ScalarValue::Float64(Some(v))
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        ScalarValue::Utf8(Some(v.to_string()))
    }
}

impl From<String> for ScalarValue {
    fn from(v: String) -> Self {
        ScalarValue::Utf8(Some(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int16Array, StringArray};

    #[test]
    fn narrow_ints_widen_and_cast_back() {
        let arr = Int16Array::from(vec![Some(3), None]);
        let v0 = ScalarValue::try_from_array(&arr, 0).expect("row 0");
        let v1 = ScalarValue::try_from_array(&arr, 1).expect("row 1");
        assert_eq!(v0, ScalarValue::Int32(Some(3)));
        assert!(v1.is_null());
        let back = ScalarValue::iter_to_array(vec![v0, v1], &DataType::Int16).expect("array");
        assert_eq!(back.data_type(), &DataType::Int16);
        assert_eq!(back.null_count(), 1);
    }

    #[test]
    fn numeric_values_compare_across_widths() {
        assert!(ScalarValue::Int32(Some(2)) < ScalarValue::Int64(Some(3)));
        assert!(ScalarValue::Float64(Some(2.5)) > ScalarValue::Int64(Some(2)));
        assert_eq!(
            ScalarValue::Int64(None).partial_cmp(&ScalarValue::Int64(Some(1))),
            None
        );
    }

    #[test]
    fn strings_round_trip_through_arrays() {
        let arr = StringArray::from(vec!["a", "b"]);
        let v = ScalarValue::try_from_array(&arr, 1).expect("row");
        assert_eq!(v.to_string(), "'b'");
        assert_eq!(v.to_array_of_size(3).len(), 3);
    }
}
