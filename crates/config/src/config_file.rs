//! TOML configuration file loading with environment variable overrides.
//!
//! Deserializes a [`ConfigFile`] with [Figment], merging `LAKESHIFT_*` environment variables
//! over the optional TOML file. The raw [`ConfigFile`] is resolved into a
//! [`Config`](crate::Config) by [`Config::load`](crate::Config::load).
//!
//! ## Environment variables
//!
//! All env vars are prefixed with `LAKESHIFT_` and use double underscores to separate nested
//! keys. For example, `LAKESHIFT_QUERY__STAGING_LOCATION` maps to `query.staging_location` in
//! the config file.
//!
//! ## Durations
//!
//! Every `*_secs` key is a number of seconds and may be fractional, e.g. `0.25`.

use std::time::Duration;

use lakeshift_codec::{CsvCompression, ParquetCompression};
use serde::Deserialize as _;

/// Prefix of environment variables overriding file values.
pub const ENV_PREFIX: &str = "LAKESHIFT_";

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub writer: WriterSection,
    #[serde(default)]
    pub query: QuerySection,
    #[serde(default)]
    pub warehouse: WarehouseSection,
    #[serde(default)]
    pub storage: StorageSection,
}

/// `[executor]`: worker pool and retry settings of storage calls.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ExecutorSection {
    /// Tasks in flight (default: number of CPUs).
    pub concurrency: Option<usize>,
    /// Attempts per call, the first one included (default: 5).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// Delay before the first retry (default: 0.1).
    #[serde(default)]
    pub min_backoff_secs: ConfigDuration<100>,
    /// Upper bound of the retry delay (default: 10).
    #[serde(default)]
    pub max_backoff_secs: ConfigDuration<10_000>,
    /// Timeout of a single call (default: 60).
    #[serde(default)]
    pub call_timeout_secs: ConfigDuration<60_000>,
}

/// `[writer]`: defaults of dataset writes.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct WriterSection {
    /// `parquet` or `csv` (default: `parquet`).
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default)]
    pub parquet_compression: ParquetCompression,
    /// Single character field delimiter (default: `,`).
    #[serde(default = "default_csv_delimiter")]
    pub csv_delimiter: String,
    /// Write a header line (default: true).
    #[serde(default = "default_true")]
    pub csv_header: bool,
    #[serde(default)]
    pub csv_compression: CsvCompression,
    /// At most this many rows per object. At most one `chunk_*` key may be set.
    pub chunk_rows: Option<usize>,
    /// Roughly at most this many bytes of in-memory data per object.
    pub chunk_bytes: Option<usize>,
    /// Split each partition into this many objects.
    pub chunk_files: Option<usize>,
}

impl Default for WriterSection {
    fn default() -> Self {
        Self {
            format: default_format(),
            parquet_compression: ParquetCompression::default(),
            csv_delimiter: default_csv_delimiter(),
            csv_header: true,
            csv_compression: CsvCompression::default(),
            chunk_rows: None,
            chunk_bytes: None,
            chunk_files: None,
        }
    }
}

/// `[query]`: query service settings.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct QuerySection {
    #[serde(default)]
    pub poll_min_interval_secs: ConfigDuration<250>,
    #[serde(default)]
    pub poll_max_interval_secs: ConfigDuration<5_000>,
    /// Give up waiting for a query after this long (default: never).
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub timeout_secs: Option<Duration>,
    /// Rows per result page, 1 to 1000 (default: 1000).
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    pub workgroup: Option<String>,
    pub staging_location: Option<String>,
    /// Keep unloaded results after reading them (default: true).
    #[serde(default = "default_true")]
    pub keep_staged: bool,
}

impl Default for QuerySection {
    fn default() -> Self {
        Self {
            poll_min_interval_secs: ConfigDuration::default(),
            poll_max_interval_secs: ConfigDuration::default(),
            timeout_secs: None,
            page_size: default_page_size(),
            workgroup: None,
            staging_location: None,
            keep_staged: true,
        }
    }
}

/// `[warehouse]`: warehouse settings.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct WarehouseSection {
    /// Role ARN the warehouse assumes to access storage.
    pub iam_role: Option<String>,
    #[serde(default)]
    pub poll_min_interval_secs: ConfigDuration<250>,
    #[serde(default)]
    pub poll_max_interval_secs: ConfigDuration<5_000>,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub timeout_secs: Option<Duration>,
    pub staging_location: Option<String>,
    /// Length of `VARCHAR` columns of created tables (default: 256).
    #[serde(default = "default_varchar_length")]
    pub varchar_length: u32,
    /// Keep staged objects after a successful transfer (default: false).
    #[serde(default)]
    pub keep_staged: bool,
}

impl Default for WarehouseSection {
    fn default() -> Self {
        Self {
            iam_role: None,
            poll_min_interval_secs: ConfigDuration::default(),
            poll_max_interval_secs: ConfigDuration::default(),
            timeout_secs: None,
            staging_location: None,
            varchar_length: default_varchar_length(),
            keep_staged: false,
        }
    }
}

/// `[storage]`: object storage settings.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct StorageSection {
    /// Default location of datasets. Relative paths resolve against the config file directory.
    pub base_url: Option<String>,
    /// KMS key for server-side encryption of written objects.
    pub sse_kms_key_id: Option<String>,
}

/// A duration given in fractional seconds, defaulting to `DEFAULT_MILLIS` milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigDuration<const DEFAULT_MILLIS: u64>(Duration);

impl<const DEFAULT_MILLIS: u64> Default for ConfigDuration<DEFAULT_MILLIS> {
    fn default() -> Self {
        Self(Duration::from_millis(DEFAULT_MILLIS))
    }
}

impl<const DEFAULT_MILLIS: u64> From<ConfigDuration<DEFAULT_MILLIS>> for Duration {
    fn from(val: ConfigDuration<DEFAULT_MILLIS>) -> Self {
        val.0
    }
}

impl<'de, const DEFAULT_MILLIS: u64> serde::Deserialize<'de> for ConfigDuration<DEFAULT_MILLIS> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserialize_duration(deserializer).map(|opt| opt.map_or_else(Self::default, Self))
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    <Option<f64>>::deserialize(deserializer)?
        .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
        .transpose()
}

fn default_max_attempts() -> usize {
    5
}

fn default_format() -> String {
    "parquet".to_string()
}

fn default_csv_delimiter() -> String {
    ",".to_string()
}

fn default_true() -> bool {
    true
}

fn default_page_size() -> usize {
    1000
}

fn default_varchar_length() -> u32 {
    256
}
