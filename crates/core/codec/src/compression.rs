//! Per-write compression settings.

use parquet::basic::{self as pq, GzipLevel, ZstdLevel};

/// Parquet page compression.
///
/// | Value       | Meaning                                   |
/// |-------------|-------------------------------------------|
/// | `snappy`    | Snappy (default)                          |
/// | `gzip`      | Gzip at parquet's default level           |
/// | `zstd`      | Zstandard at parquet's default level      |
/// | `none`      | No compression (`uncompressed` accepted)  |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ParquetCompression {
    None,
    #[default]
    Snappy,
    Gzip,
    Zstd,
}

impl ParquetCompression {
    /// File name extension, including the format suffix.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::None => ".parquet",
            Self::Snappy => ".snappy.parquet",
            Self::Gzip => ".gz.parquet",
            Self::Zstd => ".zstd.parquet",
        }
    }
}

impl From<ParquetCompression> for pq::Compression {
    fn from(c: ParquetCompression) -> Self {
        match c {
            ParquetCompression::None => pq::Compression::UNCOMPRESSED,
            ParquetCompression::Snappy => pq::Compression::SNAPPY,
            ParquetCompression::Gzip => pq::Compression::GZIP(GzipLevel::default()),
            ParquetCompression::Zstd => pq::Compression::ZSTD(ZstdLevel::default()),
        }
    }
}

impl std::str::FromStr for ParquetCompression {
    // String is used because this error is only consumed by serde via
    // `serde::de::Error::custom`, which accepts any Display type.
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" | "uncompressed" => Ok(Self::None),
            "snappy" => Ok(Self::Snappy),
            "gzip" | "gz" => Ok(Self::Gzip),
            "zstd" => Ok(Self::Zstd),
            other => Err(format!(
                "unknown parquet compression: {other}. Supported: none, snappy, gzip, zstd"
            )),
        }
    }
}

impl std::fmt::Display for ParquetCompression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Snappy => write!(f, "snappy"),
            Self::Gzip => write!(f, "gzip"),
            Self::Zstd => write!(f, "zstd"),
        }
    }
}

impl<'de> serde::Deserialize<'de> for ParquetCompression {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = serde::Deserialize::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Delimited text compression.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CsvCompression {
    #[default]
    None,
    Gzip,
}

impl CsvCompression {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::None => ".csv",
            Self::Gzip => ".csv.gz",
        }
    }
}

impl std::str::FromStr for CsvCompression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" | "uncompressed" => Ok(Self::None),
            "gzip" | "gz" => Ok(Self::Gzip),
            other => Err(format!(
                "unknown csv compression: {other}. Supported: none, gzip"
            )),
        }
    }
}

impl std::fmt::Display for CsvCompression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Gzip => write!(f, "gzip"),
        }
    }
}

impl<'de> serde::Deserialize<'de> for CsvCompression {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = serde::Deserialize::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Whether a delimited text payload is gzip compressed.
///
/// The `.gz` extension wins; otherwise the gzip magic bytes decide.
pub fn is_gzip(key: &str, bytes: &[u8]) -> bool {
    key.ends_with(".gz") || bytes.starts_with(&GZIP_MAGIC)
}
