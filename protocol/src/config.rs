//! # Protocol Configuration & Constants
//!
//! Every magic number in Bitsave lives here. The fee schedule, the points
//! multiplier, and the deployment defaults are fixed when the engine is
//! constructed and never change underneath a running ledger.
//!
//! [`BitsaveConfig`] is the one struct the engine is built from. It is
//! passed in explicitly; nothing in the core reads ambient global state.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::types::{Address, NATIVE_TOKEN};

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// The full protocol version string.
pub const PROTOCOL_VERSION: &str = "0.1.0";

// ---------------------------------------------------------------------------
// Fee Parameters
// ---------------------------------------------------------------------------

/// Default join fee: 0.0000001 ether.
pub const DEFAULT_JOIN_FEE_WEI: u128 = 100_000_000_000;

/// Default flat fee per created saving: 0.0000001 ether.
pub const DEFAULT_SAVING_FEE_WEI: u128 = 100_000_000_000;

/// Default seed balance for the fee pool at deployment: 0.000000001 ether.
pub const DEFAULT_INITIAL_BALANCE_WEI: u128 = 1_000_000_000;

/// USDT on Lisk, the stable coin the original deployment accepted.
pub const DEFAULT_STABLE_COIN: &str = "0xac485391EB2d7D88253a7F1eF18C37f4242D1A24";

/// Master address of the original deployment.
pub const DEFAULT_MASTER_ADDRESS: &str = "0x125629FAab442e459C1015FCBa50499D0aAB8EE0";

// ---------------------------------------------------------------------------
// Saving Rules
// ---------------------------------------------------------------------------

/// Points credited per unit of principal. `interest = principal * 10`.
pub const POINTS_MULTIPLIER: u128 = 10;

/// Upper bound (inclusive) for a saving's early-withdrawal penalty.
pub const MAX_PENALTY_PERCENTAGE: u8 = 100;

/// Longest saving name accepted, in bytes.
pub const MAX_SAVING_NAME_LENGTH: usize = 128;

// ---------------------------------------------------------------------------
// Network Parameters
// ---------------------------------------------------------------------------

/// Default RPC API port.
pub const DEFAULT_RPC_PORT: u16 = 9841;

/// Default metrics (Prometheus) port.
pub const DEFAULT_METRICS_PORT: u16 = 9842;

// ---------------------------------------------------------------------------
// BitsaveConfig
// ---------------------------------------------------------------------------

/// Errors raised while loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Deployment parameters for a Bitsave ledger.
///
/// Fees are in wei. `cs_token` is the points token; leaving it at the native
/// marker disables the points payout on mature withdrawals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitsaveConfig {
    /// The stable coin the protocol advertises for token savings.
    pub stable_coin: Address,
    /// Points token. `Address::ZERO` means "no points token".
    pub cs_token: Address,
    /// Administrator allowed to sweep vaults and collect fees.
    pub master: Address,
    /// Seed balance placed in the fee pool at deployment.
    #[serde(with = "crate::types::amount_str")]
    pub initial_balance: u128,
    /// Minimum attached value to register.
    #[serde(with = "crate::types::amount_str")]
    pub join_fee: u128,
    /// Flat fee attached to every `createSaving`.
    #[serde(with = "crate::types::amount_str")]
    pub saving_fee: u128,
}

impl Default for BitsaveConfig {
    fn default() -> Self {
        Self {
            stable_coin: Address::from_hex(DEFAULT_STABLE_COIN).unwrap_or(Address::ZERO),
            cs_token: NATIVE_TOKEN,
            master: Address::from_hex(DEFAULT_MASTER_ADDRESS).unwrap_or(Address::ZERO),
            initial_balance: DEFAULT_INITIAL_BALANCE_WEI,
            join_fee: DEFAULT_JOIN_FEE_WEI,
            saving_fee: DEFAULT_SAVING_FEE_WEI,
        }
    }
}

impl BitsaveConfig {
    /// Loads a JSON config file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: BitsaveConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.join_fee == 0 {
            return Err(ConfigError::Invalid("join_fee must be non-zero".into()));
        }
        if self.master.is_zero() {
            return Err(ConfigError::Invalid("master address must be set".into()));
        }
        Ok(())
    }

    /// Whether mature withdrawals pay interest in the points token.
    pub fn points_payout_enabled(&self) -> bool {
        !self.cs_token.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::parse_ether;
    use std::io::Write;

    #[test]
    fn default_fees_match_deployment() {
        let cfg = BitsaveConfig::default();
        assert_eq!(cfg.join_fee, parse_ether("0.0000001").unwrap());
        assert_eq!(cfg.saving_fee, parse_ether("0.0000001").unwrap());
        assert_eq!(cfg.initial_balance, parse_ether("0.000000001").unwrap());
        assert!(!cfg.points_payout_enabled());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn default_addresses_parse() {
        let cfg = BitsaveConfig::default();
        assert_eq!(
            cfg.stable_coin.to_hex(),
            DEFAULT_STABLE_COIN.to_lowercase()
        );
        assert!(!cfg.master.is_zero());
    }

    #[test]
    fn zero_join_fee_is_invalid() {
        let cfg = BitsaveConfig {
            join_fee: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn loads_from_json_file() {
        let cfg = BitsaveConfig {
            cs_token: Address::derive(b"points"),
            ..Default::default()
        };
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(serde_json::to_string_pretty(&cfg).unwrap().as_bytes())
            .unwrap();

        let loaded = BitsaveConfig::from_json_file(file.path()).unwrap();
        assert_eq!(loaded, cfg);
        assert!(loaded.points_payout_enabled());
    }

    #[test]
    fn penalty_bound_sanity() {
        assert_eq!(MAX_PENALTY_PERCENTAGE, 100);
        assert!(POINTS_MULTIPLIER > 0);
    }
}
