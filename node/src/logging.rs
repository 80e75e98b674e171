//! # Structured Logging
//!
//! Installs the global `tracing` subscriber. Output goes to stderr so that
//! stdout stays clean for `bitsave-node config`, and `RUST_LOG` overrides
//! the node's default filter:
//!
//! ```text
//! RUST_LOG=bitsave_contracts=debug bitsave-node run --log-format json
//! ```

use clap::ValueEnum;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, util::TryInitError, EnvFilter,
};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str =
    "bitsave_node=info,bitsave_contracts=info,bitsave_protocol=info,tower_http=debug";

/// Log line layout, selected with `--log-format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Multi-line output with source locations, for local development.
    #[default]
    Pretty,
    /// One line per event.
    Compact,
    /// JSON lines for log aggregation. Rejected commands carry their
    /// condition name in the `code` field.
    Json,
}

fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Installs the global subscriber.
///
/// Fails if a subscriber is already installed.
pub fn init_logging(default_filter: &str, format: LogFormat) -> Result<(), TryInitError> {
    let registry = tracing_subscriber::registry().with(env_filter(default_filter));
    let layer = fmt::layer().with_writer(std::io::stderr).with_target(true);

    match format {
        LogFormat::Pretty => registry
            .with(layer.pretty().with_file(true).with_line_number(true))
            .try_init()?,
        LogFormat::Compact => registry.with(layer.compact()).try_init()?,
        LogFormat::Json => registry
            .with(layer.json().flatten_event(true).with_current_span(false))
            .try_init()?,
    }

    tracing::debug!(?format, "logging initialized");
    Ok(())
}
