//! # Core Types
//!
//! Identities and amounts shared by every Bitsave crate.
//!
//! An [`Address`] is a 20-byte opaque identity, rendered as `0x`-prefixed
//! lowercase hex. Users, vaults, tokens, and the protocol master all live in
//! the same address space. The all-zero address is reserved as the marker
//! for the chain's native currency ([`NATIVE_TOKEN`]).
//!
//! Amounts are `u128` in the smallest native unit (wei). Use
//! [`parse_ether`] / [`format_ether`] at the edges; the protocol itself
//! never touches decimals.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of wei in one ether.
pub const WEI_PER_ETHER: u128 = 1_000_000_000_000_000_000;

/// Decimal places of the native currency.
pub const ETHER_DECIMALS: usize = 18;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures when parsing user-supplied addresses or amounts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Address string is not 40 hex characters (with optional `0x`).
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Amount string is not a non-negative decimal number.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// More fractional digits than the native currency supports.
    #[error("too many decimal places in {0} (max 18)")]
    TooPrecise(String),

    /// The amount does not fit in a `u128`.
    #[error("amount overflows u128: {0}")]
    Overflow(String),
}

// ---------------------------------------------------------------------------
// Address
// ---------------------------------------------------------------------------

/// A 20-byte account, vault, or token identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address([u8; 20]);

/// The native currency marker. Savings denominated in this "token" are
/// funded with attached value rather than a token transfer.
pub const NATIVE_TOKEN: Address = Address::ZERO;

impl Address {
    /// The all-zero address.
    pub const ZERO: Address = Address([0u8; 20]);

    /// Wraps raw bytes.
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Returns the raw 20 bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// `true` for the zero address (the native currency marker).
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    /// Derives an address from arbitrary seed bytes: the first 20 bytes of
    /// their BLAKE3 digest. Used for vault addresses and test fixtures.
    pub fn derive(seed: &[u8]) -> Self {
        let digest = blake3::hash(seed);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest.as_bytes()[..20]);
        Self(bytes)
    }

    /// Lowercase `0x`-prefixed hex.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// Parses 40 hex characters, with or without the `0x` prefix.
    pub fn from_hex(s: &str) -> Result<Self, ParseError> {
        let raw = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        if raw.len() != 40 {
            return Err(ParseError::InvalidAddress(s.to_string()));
        }
        let decoded = hex::decode(raw).map_err(|_| ParseError::InvalidAddress(s.to_string()))?;
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Address {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

// Hex strings on the wire so addresses work as JSON map keys.
impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Address::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Amount helpers
// ---------------------------------------------------------------------------

/// Converts a decimal ether string (`"0.1"`, `"12"`, `"0.0000001"`) to wei.
pub fn parse_ether(s: &str) -> Result<u128, ParseError> {
    let s = s.trim();
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(ParseError::InvalidAmount(s.to_string()));
    }
    let all_digits = |part: &str| part.chars().all(|c| c.is_ascii_digit());
    if !all_digits(whole) || !all_digits(frac) {
        return Err(ParseError::InvalidAmount(s.to_string()));
    }
    if frac.len() > ETHER_DECIMALS {
        return Err(ParseError::TooPrecise(s.to_string()));
    }

    let whole_wei = if whole.is_empty() {
        0
    } else {
        whole
            .parse::<u128>()
            .map_err(|_| ParseError::Overflow(s.to_string()))?
            .checked_mul(WEI_PER_ETHER)
            .ok_or_else(|| ParseError::Overflow(s.to_string()))?
    };

    let frac_wei = if frac.is_empty() {
        0
    } else {
        let padded = format!("{:0<width$}", frac, width = ETHER_DECIMALS);
        padded
            .parse::<u128>()
            .map_err(|_| ParseError::InvalidAmount(s.to_string()))?
    };

    whole_wei
        .checked_add(frac_wei)
        .ok_or_else(|| ParseError::Overflow(s.to_string()))
}

/// Renders wei as a decimal ether string with trailing zeros trimmed.
pub fn format_ether(wei: u128) -> String {
    let whole = wei / WEI_PER_ETHER;
    let frac = wei % WEI_PER_ETHER;
    if frac == 0 {
        return whole.to_string();
    }
    let frac_str = format!("{:018}", frac);
    format!("{}.{}", whole, frac_str.trim_end_matches('0'))
}

// ---------------------------------------------------------------------------
// Serde helper: u128 amounts as decimal strings
// ---------------------------------------------------------------------------

/// Serializes `u128` wei amounts as decimal strings.
///
/// JSON numbers above `u64::MAX` don't survive `serde_json::Value`, and
/// points balances cross that line at about 1.8 ether of principal. Strings
/// keep every amount exact on the wire.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Deposit {
///     #[serde(with = "bitsave_protocol::types::amount_str")]
///     amount: u128,
/// }
/// ```
pub mod amount_str {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<u128>().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_str_keeps_large_values_exact() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Wrapper {
            #[serde(with = "amount_str")]
            amount: u128,
        }

        let w = Wrapper {
            amount: u128::from(u64::MAX) * 10,
        };
        let json = serde_json::to_value(&w).unwrap();
        assert_eq!(json["amount"], "184467440737095516150");
        let back: Wrapper = serde_json::from_value(json).unwrap();
        assert_eq!(back, w);
    }

    #[test]
    fn address_hex_roundtrip_and_prefix_optional() {
        let addr = Address::derive(b"alice");
        let hex = addr.to_hex();
        assert!(hex.starts_with("0x"));
        assert_eq!(hex.len(), 42);
        assert_eq!(Address::from_hex(&hex).unwrap(), addr);
        assert_eq!(Address::from_hex(&hex[2..]).unwrap(), addr);
    }

    #[test]
    fn address_rejects_bad_input() {
        assert!(Address::from_hex("0x1234").is_err());
        assert!(Address::from_hex(&format!("0x{}", "zz".repeat(20))).is_err());
    }

    #[test]
    fn mixed_case_checksummed_address_parses() {
        let addr: Address = "0xac485391EB2d7D88253a7F1eF18C37f4242D1A24".parse().unwrap();
        assert_eq!(addr.to_hex(), "0xac485391eb2d7d88253a7f1ef18c37f4242d1a24");
    }

    #[test]
    fn native_marker_is_zero() {
        assert!(NATIVE_TOKEN.is_zero());
        assert!(!Address::derive(b"x").is_zero());
        assert_eq!(
            NATIVE_TOKEN.to_hex(),
            "0x0000000000000000000000000000000000000000"
        );
    }

    #[test]
    fn address_serializes_as_hex_string() {
        let addr = Address::derive(b"bob");
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, format!("\"{}\"", addr.to_hex()));
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn parse_ether_handles_fractions() {
        assert_eq!(parse_ether("1").unwrap(), WEI_PER_ETHER);
        assert_eq!(parse_ether("0.1").unwrap(), 100_000_000_000_000_000);
        assert_eq!(parse_ether("0.06").unwrap(), 60_000_000_000_000_000);
        assert_eq!(parse_ether("0.0000001").unwrap(), 100_000_000_000);
        assert_eq!(parse_ether("0.000000001").unwrap(), 1_000_000_000);
        assert_eq!(parse_ether(".5").unwrap(), WEI_PER_ETHER / 2);
    }

    #[test]
    fn parse_ether_rejects_garbage() {
        assert!(parse_ether("").is_err());
        assert!(parse_ether("-1").is_err());
        assert!(parse_ether("1.2.3").is_err());
        assert_eq!(
            parse_ether("0.0000000000000000001"),
            Err(ParseError::TooPrecise("0.0000000000000000001".into()))
        );
    }

    #[test]
    fn format_ether_trims_zeros() {
        assert_eq!(format_ether(0), "0");
        assert_eq!(format_ether(WEI_PER_ETHER * 3), "3");
        assert_eq!(format_ether(160_000_000_000_000_000), "0.16");
        assert_eq!(format_ether(1), "0.000000000000000001");
    }
}
