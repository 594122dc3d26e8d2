//! Row predicates pushed into readers.
//!
//! A filter is a conjunction of [`Predicate`]s, each comparing one column against a literal or
//! testing it for null. Rows for which a comparison yields null are dropped.

use std::sync::Arc;

use arrow::{
    array::{
        Array, ArrayRef, BinaryArray, BooleanArray, Date32Array, Decimal128Array, Float64Array,
        Int64Array, RecordBatch, Scalar, StringArray, TimestampMicrosecondArray,
    },
    compute::{
        and, cast, is_not_null, is_null,
        kernels::cmp::{eq, gt, gt_eq, lt, lt_eq, neq},
        prep_null_mask_filter,
    },
    datatypes::DataType,
    error::ArrowError,
};
use lakeshift_table::Value;

/// Comparison operator of a [`Predicate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl std::fmt::Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Eq => "=",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
        };
        f.write_str(op)
    }
}

/// A single row condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// `column <op> literal`
    Compare {
        column: String,
        op: CompareOp,
        literal: Value,
    },
    /// `column IS NULL`
    IsNull { column: String },
    /// `column IS NOT NULL`
    IsNotNull { column: String },
}

impl Predicate {
    pub fn compare(column: impl Into<String>, op: CompareOp, literal: impl Into<Value>) -> Self {
        Self::Compare {
            column: column.into(),
            op,
            literal: literal.into(),
        }
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Self::IsNull {
            column: column.into(),
        }
    }

    pub fn is_not_null(column: impl Into<String>) -> Self {
        Self::IsNotNull {
            column: column.into(),
        }
    }

    pub fn column(&self) -> &str {
        match self {
            Self::Compare { column, .. } | Self::IsNull { column } | Self::IsNotNull { column } => {
                column
            }
        }
    }

    /// Evaluates the predicate against `batch`, which must contain the predicate column.
    ///
    /// Null comparison results are mapped to `false`.
    pub fn evaluate(&self, batch: &RecordBatch) -> Result<BooleanArray, ArrowError> {
        let column = batch.column_by_name(self.column()).ok_or_else(|| {
            ArrowError::SchemaError(format!("filter column '{}' not found", self.column()))
        })?;

        let mask = match self {
            Self::IsNull { .. } => is_null(column)?,
            Self::IsNotNull { .. } => is_not_null(column)?,
            Self::Compare { op, literal, .. } => {
                let literal = Scalar::new(literal_array(literal, column.data_type())?);
                let result = match op {
                    CompareOp::Eq => eq(column, &literal)?,
                    CompareOp::NotEq => neq(column, &literal)?,
                    CompareOp::Lt => lt(column, &literal)?,
                    CompareOp::LtEq => lt_eq(column, &literal)?,
                    CompareOp::Gt => gt(column, &literal)?,
                    CompareOp::GtEq => gt_eq(column, &literal)?,
                };
                prep_null_mask_filter(&result)
            }
        };
        Ok(mask)
    }
}

impl std::fmt::Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Compare {
                column,
                op,
                literal,
            } => write!(f, "{column} {op} {literal}"),
            Self::IsNull { column } => write!(f, "{column} IS NULL"),
            Self::IsNotNull { column } => write!(f, "{column} IS NOT NULL"),
        }
    }
}

/// Evaluates the conjunction of `predicates` against `batch`.
///
/// Returns `None` when there are no predicates.
pub fn evaluate_all(
    predicates: &[Predicate],
    batch: &RecordBatch,
) -> Result<Option<BooleanArray>, ArrowError> {
    let mut combined: Option<BooleanArray> = None;
    for predicate in predicates {
        let mask = predicate.evaluate(batch)?;
        combined = Some(match combined {
            Some(acc) => and(&acc, &mask)?,
            None => mask,
        });
    }
    Ok(combined)
}

/// Builds a one-element array holding `literal`, cast to `target`.
fn literal_array(literal: &Value, target: &DataType) -> Result<ArrayRef, ArrowError> {
    let array: ArrayRef = match literal {
        Value::Null => return Ok(arrow::array::new_null_array(target, 1)),
        Value::Utf8(v) => Arc::new(StringArray::from(vec![v.as_str()])),
        Value::Int(v) => Arc::new(Int64Array::from(vec![*v])),
        Value::Float(v) => Arc::new(Float64Array::from(vec![*v])),
        Value::Boolean(v) => Arc::new(BooleanArray::from(vec![*v])),
        Value::Timestamp(v) => Arc::new(TimestampMicrosecondArray::from(vec![*v])),
        Value::Date(v) => Arc::new(Date32Array::from(vec![*v])),
        Value::Binary(v) => Arc::new(BinaryArray::from(vec![v.as_slice()])),
        Value::Decimal { value, scale } => Arc::new(
            Decimal128Array::from(vec![*value]).with_precision_and_scale(38, *scale)?,
        ),
    };
    if array.data_type() == target {
        Ok(array)
    } else {
        cast(&array, target)
    }
}
