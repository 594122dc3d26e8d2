//! The closed set of column types a [`Table`](crate::Table) may hold.

use std::sync::Arc;

use arrow::datatypes::{DataType, TimeUnit};

/// Time zone attached to zoned timestamp columns.
pub const UTC: &str = "UTC";

/// Column type, resolved once when a table is constructed.
///
/// Any Arrow type outside this set is rejected with [`UnsupportedTypeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Utf8,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Boolean,
    /// Microsecond precision timestamp, optionally zoned at UTC.
    Timestamp {
        utc: bool,
    },
    Date,
    Binary,
    Decimal {
        precision: u8,
        scale: i8,
    },
}

/// Coarse type family used for schema compatibility checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeFamily {
    Text,
    Integer,
    Float,
    Decimal,
    Boolean,
    Timestamp,
    Date,
    Binary,
}

impl ColumnType {
    /// Resolves an Arrow type into the closed column type set.
    ///
    /// Timestamps of any unit resolve to [`ColumnType::Timestamp`]; zoned timestamps resolve to
    /// the UTC variant since Arrow stores zoned instants as UTC epochs.
    pub fn try_from_arrow(data_type: &DataType) -> Result<Self, UnsupportedTypeError> {
        let ty = match data_type {
            DataType::Utf8 => Self::Utf8,
            DataType::Int8 => Self::Int8,
            DataType::Int16 => Self::Int16,
            DataType::Int32 => Self::Int32,
            DataType::Int64 => Self::Int64,
            DataType::Float32 => Self::Float32,
            DataType::Float64 => Self::Float64,
            DataType::Boolean => Self::Boolean,
            DataType::Timestamp(_, tz) => Self::Timestamp { utc: tz.is_some() },
            DataType::Date32 => Self::Date,
            DataType::Binary => Self::Binary,
            DataType::Decimal128(precision, scale) => Self::Decimal {
                precision: *precision,
                scale: *scale,
            },
            other => {
                return Err(UnsupportedTypeError {
                    type_name: other.to_string(),
                });
            }
        };
        Ok(ty)
    }

    /// The Arrow type this column type is stored as.
    pub fn to_arrow(&self) -> DataType {
        match self {
            Self::Utf8 => DataType::Utf8,
            Self::Int8 => DataType::Int8,
            Self::Int16 => DataType::Int16,
            Self::Int32 => DataType::Int32,
            Self::Int64 => DataType::Int64,
            Self::Float32 => DataType::Float32,
            Self::Float64 => DataType::Float64,
            Self::Boolean => DataType::Boolean,
            Self::Timestamp { utc } => DataType::Timestamp(
                TimeUnit::Microsecond,
                utc.then(|| Arc::<str>::from(UTC)),
            ),
            Self::Date => DataType::Date32,
            Self::Binary => DataType::Binary,
            Self::Decimal { precision, scale } => DataType::Decimal128(*precision, *scale),
        }
    }

    pub fn family(&self) -> TypeFamily {
        match self {
            Self::Utf8 => TypeFamily::Text,
            Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64 => TypeFamily::Integer,
            Self::Float32 | Self::Float64 => TypeFamily::Float,
            Self::Decimal { .. } => TypeFamily::Decimal,
            Self::Boolean => TypeFamily::Boolean,
            Self::Timestamp { .. } => TypeFamily::Timestamp,
            Self::Date => TypeFamily::Date,
            Self::Binary => TypeFamily::Binary,
        }
    }

    /// The type a column comes back as after a columnar round-trip.
    ///
    /// Integers widen to `Int64` and `Float32` widens to `Float64`; every other type is kept.
    pub fn widened(&self) -> Self {
        match self.family() {
            TypeFamily::Integer => Self::Int64,
            TypeFamily::Float => Self::Float64,
            _ => *self,
        }
    }

    /// Whether values of `self` can be stored in a column declared as `declared`.
    ///
    /// Returns `Some(true)` for an exact match, `Some(false)` for a lossless widening within the
    /// same family, and `None` when the types are incompatible.
    pub fn coercible_to(&self, declared: &ColumnType) -> Option<bool> {
        if self == declared {
            return Some(true);
        }
        match (self, declared) {
            (Self::Timestamp { .. }, Self::Timestamp { .. }) => Some(false),
            (
                Self::Decimal {
                    precision: p1,
                    scale: s1,
                },
                Self::Decimal {
                    precision: p2,
                    scale: s2,
                },
            ) => {
                let integer_digits_fit = (*p1 as i16 - *s1 as i16) <= (*p2 as i16 - *s2 as i16);
                (s1 <= s2 && integer_digits_fit).then_some(false)
            }
            _ if self.family() == declared.family() => {
                (self.numeric_width() <= declared.numeric_width()).then_some(false)
            }
            _ => None,
        }
    }

    fn numeric_width(&self) -> u8 {
        match self {
            Self::Int8 => 1,
            Self::Int16 => 2,
            Self::Int32 | Self::Float32 => 4,
            Self::Int64 | Self::Float64 => 8,
            _ => 0,
        }
    }

    /// The managed query service (catalog) name of this type.
    pub fn catalog_name(&self) -> String {
        match self {
            Self::Utf8 => "string".to_string(),
            Self::Int8 => "tinyint".to_string(),
            Self::Int16 => "smallint".to_string(),
            Self::Int32 => "int".to_string(),
            Self::Int64 => "bigint".to_string(),
            Self::Float32 => "float".to_string(),
            Self::Float64 => "double".to_string(),
            Self::Boolean => "boolean".to_string(),
            Self::Timestamp { .. } => "timestamp".to_string(),
            Self::Date => "date".to_string(),
            Self::Binary => "binary".to_string(),
            Self::Decimal { precision, scale } => format!("decimal({precision},{scale})"),
        }
    }

    /// Parses a catalog type name.
    ///
    /// Accepts every name produced by [`catalog_name`](Self::catalog_name) plus the aliases
    /// `integer`, `varchar`, `varchar(n)`, `char`, `char(n)` and `varbinary`. Matching is case
    /// insensitive.
    pub fn from_catalog_name(name: &str) -> Result<Self, UnsupportedTypeError> {
        let normalized = name.trim().to_ascii_lowercase();
        let base = normalized
            .split_once('(')
            .map_or(normalized.as_str(), |(base, _)| base)
            .trim();

        let ty = match base {
            "tinyint" => Self::Int8,
            "smallint" => Self::Int16,
            "int" | "integer" => Self::Int32,
            "bigint" => Self::Int64,
            "float" | "real" => Self::Float32,
            "double" => Self::Float64,
            "boolean" => Self::Boolean,
            "string" | "varchar" | "char" => Self::Utf8,
            "timestamp" => Self::Timestamp { utc: false },
            "date" => Self::Date,
            "binary" | "varbinary" => Self::Binary,
            "decimal" => parse_decimal(&normalized).ok_or_else(|| UnsupportedTypeError {
                type_name: name.to_string(),
            })?,
            _ => {
                return Err(UnsupportedTypeError {
                    type_name: name.to_string(),
                });
            }
        };
        Ok(ty)
    }
}

fn parse_decimal(name: &str) -> Option<ColumnType> {
    let args = name
        .strip_prefix("decimal")?
        .trim()
        .strip_prefix('(')?
        .strip_suffix(')')?;
    let (precision, scale) = args.split_once(',')?;
    Some(ColumnType::Decimal {
        precision: precision.trim().parse().ok()?,
        scale: scale.trim().parse().ok()?,
    })
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.catalog_name())
    }
}

/// A type outside the supported column type set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported column type: {type_name}")]
pub struct UnsupportedTypeError {
    pub type_name: String,
}
