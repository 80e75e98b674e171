//! # Bitsave Errors
//!
//! One variant per named failure condition. Every condition is checked
//! before anything is mutated, so receiving an error means the ledger is
//! exactly as it was before the call.
//!
//! [`BitsaveError::code`] gives the stable condition name that callers
//! surface to end users verbatim.

use bitsave_protocol::{Address, TokenLedgerError};
use thiserror::Error;

/// Errors returned by the Bitsave engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BitsaveError {
    /// Attached value is below the join fee.
    #[error("attached value {attached} is below the join fee {required}")]
    AmountNotEnough { attached: u128, required: u128 },

    /// The caller has not joined Bitsave.
    #[error("user {0} is not registered")]
    UserNotRegistered(Address),

    /// The caller already owns a vault. Vaults are never replaced.
    #[error("user {0} has already joined")]
    UserAlreadyRegistered(Address),

    /// Attached value does not cover the flat saving fee.
    #[error("attached value {attached} does not cover the saving fee {required}")]
    NotEnoughToPayGasFee { attached: u128, required: u128 },

    /// Maturity must lie strictly after the current block time.
    #[error("maturity time {maturity_time} is not after current time {now}")]
    InvalidTime { maturity_time: u64, now: u64 },

    /// Duplicate name on creation, or a missing/withdrawn saving otherwise.
    #[error("invalid saving '{name}': {reason}")]
    InvalidSaving { name: String, reason: &'static str },

    /// Penalty percentage above 100.
    #[error("penalty percentage {0} is above 100")]
    InvalidPenaltyPercentage(u8),

    /// A deposit of nothing.
    #[error("amount must be greater than zero")]
    ZeroAmount,

    /// An increment named a different token than the saving holds.
    #[error("saving '{name}' holds {expected}, not {got}")]
    TokenMismatch {
        name: String,
        expected: Address,
        got: Address,
    },

    /// A master-only command was called by someone else.
    #[error("only the master address may call this; caller was {0}")]
    MasterCallRequired(Address),

    /// Not enough funds to release the requested amount.
    #[error("insufficient funds: available {available}, requested {requested}")]
    InsufficientFunds { available: u128, requested: u128 },

    /// A token pull or push was refused; nothing was applied.
    #[error("token transfer failed: {0}")]
    TokenTransferFailed(#[from] TokenLedgerError),

    /// The event log refused the batch; nothing was applied.
    #[error("event log unavailable: {0}")]
    EventLog(String),

    /// A balance or points counter would leave the `u128` range.
    #[error("arithmetic overflow")]
    Overflow,

    /// The engine was constructed with an unusable configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BitsaveError {
    /// The stable condition name, e.g. `"AmountNotEnough"`.
    pub fn code(&self) -> &'static str {
        match self {
            BitsaveError::AmountNotEnough { .. } => "AmountNotEnough",
            BitsaveError::UserNotRegistered(_) => "UserNotRegistered",
            BitsaveError::UserAlreadyRegistered(_) => "UserAlreadyRegistered",
            BitsaveError::NotEnoughToPayGasFee { .. } => "NotEnoughToPayGasFee",
            BitsaveError::InvalidTime { .. } => "InvalidTime",
            BitsaveError::InvalidSaving { .. } => "InvalidSaving",
            BitsaveError::InvalidPenaltyPercentage(_) => "InvalidPenaltyPercentage",
            BitsaveError::ZeroAmount => "ZeroAmount",
            BitsaveError::TokenMismatch { .. } => "TokenMismatch",
            BitsaveError::MasterCallRequired(_) => "MasterCallRequired",
            BitsaveError::InsufficientFunds { .. } => "InsufficientFunds",
            BitsaveError::TokenTransferFailed(_) => "TokenTransferFailed",
            BitsaveError::EventLog(_) => "EventLogUnavailable",
            BitsaveError::Overflow => "Overflow",
            BitsaveError::InvalidConfig(_) => "InvalidConfig",
        }
    }

    pub(crate) fn invalid_saving(name: &str, reason: &'static str) -> Self {
        BitsaveError::InvalidSaving {
            name: name.to_string(),
            reason,
        }
    }
}

pub type BitsaveResult<T> = Result<T, BitsaveError>;
