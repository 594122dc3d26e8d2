//! Row values.

use arrow::{
    array::{Array, AsArray},
    datatypes::{
        Date32Type, Decimal128Type, Float32Type, Float64Type, Int8Type, Int16Type, Int32Type,
        Int64Type, TimestampMicrosecondType,
    },
};
use chrono::{DateTime, NaiveDate};

use crate::ColumnType;

/// A single cell value.
///
/// Integers are surfaced as `i64` and floats as `f64` regardless of the column width.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Utf8(String),
    Int(i64),
    Float(f64),
    Boolean(bool),
    /// Microseconds since the Unix epoch.
    Timestamp(i64),
    /// Days since the Unix epoch.
    Date(i32),
    Binary(Vec<u8>),
    Decimal {
        value: i128,
        scale: i8,
    },
}

impl Value {
    /// Reads the value at `row` of an array whose type was resolved to `ty`.
    ///
    /// The array must be of `ty.to_arrow()` type; [`Table`](crate::Table) guarantees this for
    /// all of its columns.
    pub(crate) fn from_array(array: &dyn Array, ty: ColumnType, row: usize) -> Self {
        if array.is_null(row) {
            return Value::Null;
        }
        match ty {
            ColumnType::Utf8 => Value::Utf8(array.as_string::<i32>().value(row).to_string()),
            ColumnType::Int8 => Value::Int(array.as_primitive::<Int8Type>().value(row).into()),
            ColumnType::Int16 => Value::Int(array.as_primitive::<Int16Type>().value(row).into()),
            ColumnType::Int32 => Value::Int(array.as_primitive::<Int32Type>().value(row).into()),
            ColumnType::Int64 => Value::Int(array.as_primitive::<Int64Type>().value(row)),
            ColumnType::Float32 => {
                Value::Float(array.as_primitive::<Float32Type>().value(row).into())
            }
            ColumnType::Float64 => Value::Float(array.as_primitive::<Float64Type>().value(row)),
            ColumnType::Boolean => Value::Boolean(array.as_boolean().value(row)),
            ColumnType::Timestamp { .. } => {
                Value::Timestamp(array.as_primitive::<TimestampMicrosecondType>().value(row))
            }
            ColumnType::Date => Value::Date(array.as_primitive::<Date32Type>().value(row)),
            ColumnType::Binary => Value::Binary(array.as_binary::<i32>().value(row).to_vec()),
            ColumnType::Decimal { scale, .. } => Value::Decimal {
                value: array.as_primitive::<Decimal128Type>().value(row),
                scale,
            },
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Renders the value the way it is written into Hive-style partition paths and text files.
    ///
    /// Returns `None` for [`Value::Null`] and [`Value::Binary`], which have no text form.
    pub fn to_text(&self) -> Option<String> {
        let text = match self {
            Value::Null | Value::Binary(_) => return None,
            Value::Utf8(s) => s.clone(),
            Value::Int(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Boolean(v) => v.to_string(),
            Value::Timestamp(micros) => DateTime::from_timestamp_micros(*micros)?
                .naive_utc()
                .format("%Y-%m-%d %H:%M:%S%.f")
                .to_string(),
            Value::Date(days) => {
                let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)?;
                epoch
                    .checked_add_signed(chrono::TimeDelta::days((*days).into()))?
                    .format("%Y-%m-%d")
                    .to_string()
            }
            Value::Decimal { value, scale } => format_decimal(*value, *scale),
        };
        Some(text)
    }
}

fn format_decimal(value: i128, scale: i8) -> String {
    if scale <= 0 {
        let zeros = "0".repeat(scale.unsigned_abs() as usize);
        return if value == 0 {
            "0".to_string()
        } else {
            format!("{value}{zeros}")
        };
    }

    let scale = scale as usize;
    let digits = value.unsigned_abs().to_string();
    let digits = format!("{digits:0>width$}", width = scale + 1);
    let (int_part, frac_part) = digits.split_at(digits.len() - scale);
    let sign = if value < 0 { "-" } else { "" };
    format!("{sign}{int_part}.{frac_part}")
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Binary(bytes) => {
                for byte in bytes {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            other => f.write_str(other.to_text().as_deref().unwrap_or("NULL")),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Utf8(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Utf8(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_text_formats_temporal_values() {
        assert_eq!(
            Value::Date(18_262).to_text().as_deref(),
            Some("2020-01-01")
        );
        assert_eq!(
            Value::Timestamp(1_577_836_800_000_000).to_text().as_deref(),
            Some("2020-01-01 00:00:00")
        );
        assert_eq!(
            Value::Timestamp(1_577_836_800_500_000).to_text().as_deref(),
            Some("2020-01-01 00:00:00.500")
        );
    }

    #[test]
    fn to_text_formats_decimals_with_scale() {
        let text = |value, scale| Value::Decimal { value, scale }.to_text();
        assert_eq!(text(12345, 2).as_deref(), Some("123.45"));
        assert_eq!(text(-5, 3).as_deref(), Some("-0.005"));
        assert_eq!(text(7, 0).as_deref(), Some("7"));
        assert_eq!(text(7, -2).as_deref(), Some("700"));
    }

    #[test]
    fn to_text_has_no_form_for_null_and_binary() {
        assert_eq!(Value::Null.to_text(), None);
        assert_eq!(Value::Binary(vec![1, 2]).to_text(), None);
    }
}
