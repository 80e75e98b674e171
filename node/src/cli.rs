//! # CLI Interface
//!
//! Defines the command-line argument structure for `bitsave-node` using
//! `clap` derive. Supports three subcommands: `run`, `config`, and
//! `version`.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use bitsave_protocol::config::{DEFAULT_METRICS_PORT, DEFAULT_RPC_PORT};
use bitsave_protocol::{parse_ether, Address, BitsaveConfig};

use crate::logging::LogFormat;

/// Bitsave ledger node.
///
/// Runs the Bitsave savings ledger as a service. Serves JSON-RPC and REST
/// over HTTP, streams committed events over WebSocket, and exposes
/// Prometheus metrics.
#[derive(Parser, Debug)]
#[command(
    name = "bitsave-node",
    about = "Bitsave savings ledger node",
    version,
    propagate_version = true
)]
pub struct BitsaveNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the Bitsave node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Print the effective ledger configuration as JSON and exit.
    Config(LedgerArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub ledger: LedgerArgs,

    /// Directory for the durable event log. In-memory when omitted.
    #[arg(long, short = 'd', env = "BITSAVE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Port for the JSON-RPC and REST API.
    #[arg(long, env = "BITSAVE_RPC_PORT", default_value_t = DEFAULT_RPC_PORT)]
    pub rpc_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "BITSAVE_METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Log output format.
    #[arg(long, env = "BITSAVE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

/// Ledger configuration sources.
///
/// Flags override the JSON file, which overrides the built-in defaults.
/// Fees and balances are given in ether, e.g. `--join-fee 0.0000001`.
#[derive(Args, Debug, Default)]
pub struct LedgerArgs {
    /// JSON config file.
    #[arg(long, short = 'c', env = "BITSAVE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Stable coin token address.
    #[arg(long, env = "BITSAVE_STABLE_COIN")]
    pub stable_coin: Option<String>,

    /// Points token address. The zero address disables points payouts.
    #[arg(long, env = "BITSAVE_CS_TOKEN")]
    pub cs_token: Option<String>,

    /// Master (administrator) address.
    #[arg(long, env = "BITSAVE_MASTER")]
    pub master: Option<String>,

    /// Join fee in ether.
    #[arg(long, env = "BITSAVE_JOIN_FEE")]
    pub join_fee: Option<String>,

    /// Saving fee in ether.
    #[arg(long, env = "BITSAVE_SAVING_FEE")]
    pub saving_fee: Option<String>,

    /// Fee pool seed in ether.
    #[arg(long, env = "BITSAVE_INITIAL_BALANCE")]
    pub initial_balance: Option<String>,
}

impl LedgerArgs {
    /// Builds and validates the effective configuration.
    pub fn resolve(&self) -> Result<BitsaveConfig> {
        let mut config = match &self.config {
            Some(path) => BitsaveConfig::from_json_file(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => BitsaveConfig::default(),
        };

        if let Some(raw) = &self.stable_coin {
            config.stable_coin = parse_address("--stable-coin", raw)?;
        }
        if let Some(raw) = &self.cs_token {
            config.cs_token = parse_address("--cs-token", raw)?;
        }
        if let Some(raw) = &self.master {
            config.master = parse_address("--master", raw)?;
        }
        if let Some(raw) = &self.join_fee {
            config.join_fee = parse_amount("--join-fee", raw)?;
        }
        if let Some(raw) = &self.saving_fee {
            config.saving_fee = parse_amount("--saving-fee", raw)?;
        }
        if let Some(raw) = &self.initial_balance {
            config.initial_balance = parse_amount("--initial-balance", raw)?;
        }

        config.validate().context("invalid ledger configuration")?;
        Ok(config)
    }
}

fn parse_address(flag: &str, raw: &str) -> Result<Address> {
    raw.parse::<Address>()
        .with_context(|| format!("{flag}: '{raw}' is not a valid address"))
}

fn parse_amount(flag: &str, raw: &str) -> Result<u128> {
    parse_ether(raw).with_context(|| format!("{flag}: '{raw}' is not a valid ether amount"))
}
