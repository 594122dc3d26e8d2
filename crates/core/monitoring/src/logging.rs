//! A set of utilities to enable logging configuration using tracing_subscriber.

use std::{io::IsTerminal, sync::Once};

use tracing::field::DisplayValue;
use tracing_subscriber::{self, EnvFilter, filter::LevelFilter};

static LAKESHIFT_LOG_ENV_VAR: &str = "LAKESHIFT_LOG";

/// Initializes a tracing subscriber for logging.
pub fn init() {
    // Since we also use this function to enable logging in tests, wrap it in `Once` to prevent
    // multiple initializations.
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let (env_filter, log_level) = env_filter_and_log_level();

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_ansi(std::io::stderr().is_terminal())
            .with_writer(std::io::stderr)
            .init();

        tracing::info!("log level: {}", log_level);
    });
}

/// Renders the source chain of an error, outermost cause first.
///
/// Meant for the `error_source` field next to `error = %err` in log events, so that the
/// top-level message and its causes stay in separate fields.
pub fn error_source<E>(err: &E) -> DisplayValue<String>
where
    E: std::error::Error + ?Sized,
{
    let mut chain = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push(cause.to_string());
        source = cause.source();
    }
    tracing::field::display(chain.join(": "))
}

/// List of crates in the workspace.
const LAKESHIFT_CRATES: &[&str] = &[
    "lakeshift_catalog",
    "lakeshift_codec",
    "lakeshift_config",
    "lakeshift_dataset",
    "lakeshift_executor",
    "lakeshift_object_store",
    "lakeshift_query_results",
    "lakeshift_table",
    "lakeshift_warehouse",
    "monitoring",
];

fn env_filter_and_log_level() -> (EnvFilter, String) {
    // Parse directives from RUST_LOG
    let log_filter = EnvFilter::builder().with_default_directive(LevelFilter::ERROR.into());
    let directive_string = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    let mut env_filter = log_filter
        .parse(&directive_string)
        .unwrap_or_else(|_| EnvFilter::new(LevelFilter::ERROR.to_string()));

    let log_level = std::env::var(LAKESHIFT_LOG_ENV_VAR).unwrap_or_else(|_| "info".to_string());

    for crate_name in LAKESHIFT_CRATES {
        // Add directives for each workspace crate, if not overriden by RUST_LOG
        if !directive_string.contains(&format!("{crate_name}=")) {
            match format!("{crate_name}={log_level}").parse() {
                Ok(directive) => env_filter = env_filter.add_directive(directive),
                Err(_) => eprintln!("ignoring invalid {LAKESHIFT_LOG_ENV_VAR} level: {log_level}"),
            }
        }
    }

    (env_filter, log_level)
}
