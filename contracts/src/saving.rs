//! # Saving
//!
//! A single named, time-locked deposit inside a vault. The lifecycle is:
//!
//! 1. **Open**: principal deposited, maturity and penalty fixed.
//! 2. **Increment**: more principal added, any number of times.
//! 3. **Withdraw**: principal (minus the penalty when early) released and
//!    the record invalidated. It stays in the vault as history.
//!
//! Points follow the principal: `interest_accumulated` is always
//! `amount * POINTS_MULTIPLIER`, however the principal was built up.

use bitsave_protocol::config::{MAX_PENALTY_PERCENTAGE, POINTS_MULTIPLIER};
use bitsave_protocol::types::amount_str;
use bitsave_protocol::Address;
use serde::{Deserialize, Serialize};

use crate::error::{BitsaveError, BitsaveResult};

/// A saving record as stored in a vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Saving {
    /// Unique among the vault's valid savings.
    pub name: String,
    /// Principal in the saving's token (wei for native savings).
    #[serde(with = "amount_str")]
    pub amount: u128,
    /// `Address::ZERO` for native savings.
    pub token_id: Address,
    /// Block time the saving was opened.
    pub start_time: u64,
    /// Withdrawals at or after this time carry no penalty.
    pub maturity_time: u64,
    /// Share of principal forfeited on early withdrawal, 0–100.
    pub penalty_percentage: u8,
    /// Stored as given. Has no effect on withdrawal policy.
    pub is_safe_mode: bool,
    /// Points earned by this saving.
    #[serde(with = "amount_str")]
    pub interest_accumulated: u128,
    /// `false` once withdrawn.
    pub is_valid: bool,
}

/// Points earned by `principal`.
pub fn points_for(principal: u128) -> BitsaveResult<u128> {
    principal
        .checked_mul(POINTS_MULTIPLIER)
        .ok_or(BitsaveError::Overflow)
}

impl Saving {
    /// Opens a saving at `now`.
    ///
    /// # Errors
    ///
    /// [`BitsaveError::InvalidTime`] unless `maturity_time > now`,
    /// [`BitsaveError::InvalidPenaltyPercentage`] above 100,
    /// [`BitsaveError::Overflow`] if the points would not fit.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        name: String,
        amount: u128,
        token_id: Address,
        now: u64,
        maturity_time: u64,
        penalty_percentage: u8,
        is_safe_mode: bool,
    ) -> BitsaveResult<Self> {
        if maturity_time <= now {
            return Err(BitsaveError::InvalidTime { maturity_time, now });
        }
        if penalty_percentage > MAX_PENALTY_PERCENTAGE {
            return Err(BitsaveError::InvalidPenaltyPercentage(penalty_percentage));
        }

        Ok(Self {
            interest_accumulated: points_for(amount)?,
            name,
            amount,
            token_id,
            start_time: now,
            maturity_time,
            penalty_percentage,
            is_safe_mode,
            is_valid: true,
        })
    }

    /// Whether the principal is in the native currency.
    pub fn is_native(&self) -> bool {
        self.token_id.is_zero()
    }

    /// Whether a withdrawal at `now` is penalty-free.
    pub fn is_mature(&self, now: u64) -> bool {
        now >= self.maturity_time
    }

    /// Penalty charged for withdrawing at `now`. Rounds down.
    pub fn penalty_at(&self, now: u64) -> u128 {
        if self.is_mature(now) {
            return 0;
        }
        // floor(a * p / 100) without the a * p overflow.
        let pct = u128::from(self.penalty_percentage);
        (self.amount / 100) * pct + (self.amount % 100) * pct / 100
    }

    /// Adds principal and re-derives the points. Returns the points delta.
    pub(crate) fn add_principal(&mut self, deposit: u128) -> BitsaveResult<u128> {
        let amount = self
            .amount
            .checked_add(deposit)
            .ok_or(BitsaveError::Overflow)?;
        let interest = points_for(amount)?;
        let delta = interest - self.interest_accumulated;

        self.amount = amount;
        self.interest_accumulated = interest;
        Ok(delta)
    }
}
