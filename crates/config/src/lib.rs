//! Configuration of the lakeshift components.
//!
//! A [`Config`] is loaded once and its parts are handed to component constructors; nothing
//! reads configuration from process-wide state.

use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format as _, Toml},
};
use fs_err as fs;
use lakeshift_codec::{CsvOptions, FileFormat};
use lakeshift_dataset::WriterConfig;
use lakeshift_executor::{ExecutorConfig, RetryPolicy, default_concurrency};
use lakeshift_object_store::{InvalidPathError, StorageUrl, StoreOptions};
use lakeshift_query_results::{MAX_PAGE_SIZE, QueryConfig};
use lakeshift_table::ChunkTarget;
use lakeshift_warehouse::WarehouseConfig;

pub mod config_file;

pub use self::config_file::{ConfigDuration, ConfigFile, ENV_PREFIX};

/// Resolved configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub executor: ExecutorConfig,
    pub writer: WriterConfig,
    pub query: QueryConfig,
    pub warehouse: WarehouseConfig,
    pub storage: StorageConfig,
}

/// Object storage settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageConfig {
    pub base_url: Option<StorageUrl>,
    pub options: StoreOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error at {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("config parse error")]
    Figment(#[source] Box<figment::Error>),
    #[error("invalid value for '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("invalid storage base URL")]
    InvalidStorageUrl(#[source] InvalidPathError),
}

impl Config {
    /// Loads configuration from an optional TOML file.
    ///
    /// With `env_override`, env vars prefixed with `LAKESHIFT_` override file values. Nested
    /// values use double underscore separators, e.g. `LAKESHIFT_EXECUTOR__CONCURRENCY` overrides
    /// `executor.concurrency`. Missing values take their defaults.
    pub fn load(file: Option<&Path>, env_override: bool) -> Result<Self, ConfigError> {
        let mut figment = Figment::new();
        let mut base = None;
        if let Some(file) = file {
            let config_path =
                fs::canonicalize(file).map_err(|err| ConfigError::Io(file.to_path_buf(), err))?;
            let contents = fs::read_to_string(&config_path)
                .map_err(|err| ConfigError::Io(config_path.clone(), err))?;
            figment = figment.merge(Toml::string(&contents));
            base = config_path.parent().map(Path::to_path_buf);
        }
        if env_override {
            figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        }
        let config_file: ConfigFile = figment
            .extract()
            .map_err(|err| ConfigError::Figment(Box::new(err)))?;
        Self::from_config_file(config_file, base.as_deref())
    }

    /// Resolves a deserialized config file. Relative filesystem paths resolve against `base`.
    pub fn from_config_file(file: ConfigFile, base: Option<&Path>) -> Result<Self, ConfigError> {
        let executor = ExecutorConfig {
            concurrency: file.executor.concurrency.unwrap_or_else(default_concurrency),
            retry: RetryPolicy {
                max_attempts: file.executor.max_attempts,
                min_delay: file.executor.min_backoff_secs.into(),
                max_delay: file.executor.max_backoff_secs.into(),
                call_timeout: file.executor.call_timeout_secs.into(),
            },
        };
        if executor.concurrency == 0 {
            return Err(invalid("executor.concurrency", "must be at least 1"));
        }
        if executor.retry.max_attempts == 0 {
            return Err(invalid("executor.max_attempts", "must be at least 1"));
        }

        let writer = writer_config(&file.writer)?;

        if !(1..=MAX_PAGE_SIZE).contains(&file.query.page_size) {
            return Err(invalid(
                "query.page_size",
                format!("{} is outside 1..={MAX_PAGE_SIZE}", file.query.page_size),
            ));
        }
        let query = QueryConfig {
            poll_min_interval: file.query.poll_min_interval_secs.into(),
            poll_max_interval: file.query.poll_max_interval_secs.into(),
            timeout: file.query.timeout_secs,
            page_size: file.query.page_size,
            workgroup: file.query.workgroup,
            staging_location: file.query.staging_location,
            keep_staged: file.query.keep_staged,
        };

        let warehouse = WarehouseConfig {
            iam_role: file.warehouse.iam_role,
            poll_min_interval: file.warehouse.poll_min_interval_secs.into(),
            poll_max_interval: file.warehouse.poll_max_interval_secs.into(),
            timeout: file.warehouse.timeout_secs,
            staging_location: file.warehouse.staging_location,
            varchar_length: file.warehouse.varchar_length,
            keep_staged: file.warehouse.keep_staged,
        };

        let base_url = file
            .storage
            .base_url
            .map(|url| StorageUrl::new_with_base(url, base))
            .transpose()
            .map_err(ConfigError::InvalidStorageUrl)?;
        let storage = StorageConfig {
            base_url,
            options: StoreOptions {
                sse_kms_key_id: file.storage.sse_kms_key_id,
            },
        };

        Ok(Self {
            executor,
            writer,
            query,
            warehouse,
            storage,
        })
    }
}

fn writer_config(section: &config_file::WriterSection) -> Result<WriterConfig, ConfigError> {
    let format = match section.format.trim().to_lowercase().as_str() {
        "parquet" => FileFormat::Parquet(section.parquet_compression),
        "csv" => {
            let delimiter = match section.csv_delimiter.as_bytes() {
                [byte] if byte.is_ascii() => *byte,
                _ => {
                    return Err(invalid(
                        "writer.csv_delimiter",
                        format!("'{}' is not a single ASCII character", section.csv_delimiter),
                    ));
                }
            };
            FileFormat::Csv(CsvOptions {
                delimiter,
                header: section.csv_header,
                compression: section.csv_compression,
            })
        }
        other => {
            return Err(invalid(
                "writer.format",
                format!("unknown format '{other}', expected parquet or csv"),
            ));
        }
    };

    let targets = [
        section.chunk_rows.map(ChunkTarget::Rows),
        section.chunk_bytes.map(ChunkTarget::Bytes),
        section.chunk_files.map(ChunkTarget::Files),
    ];
    let mut targets = targets.into_iter().flatten();
    let chunk_target = targets.next().unwrap_or_default();
    if targets.next().is_some() {
        return Err(invalid(
            "writer.chunk_rows",
            "at most one of chunk_rows, chunk_bytes and chunk_files may be set",
        ));
    }

    Ok(WriterConfig {
        chunk_target,
        format,
    })
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}
