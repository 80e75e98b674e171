//! # Fungible Token Ledger
//!
//! Savings denominated in a token move real token balances: the principal
//! is pulled from the saver into their vault on deposit and pushed back on
//! withdrawal. [`TokenLedger`] is the seam to whatever actually holds those
//! balances (an ERC-20 contract behind an RPC client, or the in-memory
//! [`InMemoryTokenLedger`] used by tests and the standalone node).
//!
//! Transfers either complete fully or fail without touching any balance.
//! The engine relies on that to keep its own commands atomic.

use parking_lot::Mutex;
use std::collections::HashMap;
use thiserror::Error;

use crate::types::Address;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a token movement was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenLedgerError {
    /// The native currency marker is not a token.
    #[error("the native currency marker cannot be transferred as a token")]
    NativeMarker,

    /// The sender does not hold enough of the token.
    #[error("insufficient token balance: {holder} holds {available} of {token}, needs {requested}")]
    InsufficientBalance {
        token: Address,
        holder: Address,
        available: u128,
        requested: u128,
    },

    /// The spender was not approved for enough of the owner's tokens.
    #[error("insufficient allowance: {spender} may move {allowed} of {owner}'s {token}, needs {requested}")]
    InsufficientAllowance {
        token: Address,
        owner: Address,
        spender: Address,
        allowed: u128,
        requested: u128,
    },

    /// The recipient's balance would exceed `u128::MAX`.
    #[error("token balance overflow for {holder}")]
    Overflow { holder: Address },
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Balances of fungible tokens held outside the Bitsave core.
pub trait TokenLedger: Send + Sync {
    /// Balance of `holder` in `token`. Unknown pairs hold zero.
    fn balance_of(&self, token: Address, holder: Address) -> u128;

    /// Moves `amount` of `token` from `from` to `to` on `from`'s authority.
    fn transfer(
        &self,
        token: Address,
        from: Address,
        to: Address,
        amount: u128,
    ) -> Result<(), TokenLedgerError>;

    /// Moves `amount` of `token` from `from` to `to` on `spender`'s
    /// authority, consuming allowance granted by `from`.
    fn transfer_from(
        &self,
        token: Address,
        spender: Address,
        from: Address,
        to: Address,
        amount: u128,
    ) -> Result<(), TokenLedgerError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct LedgerState {
    /// `(token, holder) -> balance`
    balances: HashMap<(Address, Address), u128>,
    /// `(token, owner, spender) -> allowance`
    allowances: HashMap<(Address, Address, Address), u128>,
}

impl LedgerState {
    fn balance(&self, token: Address, holder: Address) -> u128 {
        self.balances.get(&(token, holder)).copied().unwrap_or(0)
    }

    /// Checks both sides before touching either, so a failure leaves the
    /// state untouched.
    fn move_balance(
        &mut self,
        token: Address,
        from: Address,
        to: Address,
        amount: u128,
    ) -> Result<(), TokenLedgerError> {
        if token.is_zero() {
            return Err(TokenLedgerError::NativeMarker);
        }
        let available = self.balance(token, from);
        if available < amount {
            return Err(TokenLedgerError::InsufficientBalance {
                token,
                holder: from,
                available,
                requested: amount,
            });
        }
        if from == to {
            return Ok(());
        }
        let credited = self
            .balance(token, to)
            .checked_add(amount)
            .ok_or(TokenLedgerError::Overflow { holder: to })?;

        self.balances.insert((token, from), available - amount);
        self.balances.insert((token, to), credited);
        Ok(())
    }
}

/// A process-local token ledger with ERC-20 style allowances.
///
/// One mutex guards every balance so multi-party moves are atomic.
#[derive(Debug, Default)]
pub struct InMemoryTokenLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryTokenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates `amount` new tokens for `to`.
    pub fn mint(&self, token: Address, to: Address, amount: u128) -> Result<(), TokenLedgerError> {
        if token.is_zero() {
            return Err(TokenLedgerError::NativeMarker);
        }
        let mut state = self.state.lock();
        let balance = state
            .balance(token, to)
            .checked_add(amount)
            .ok_or(TokenLedgerError::Overflow { holder: to })?;
        state.balances.insert((token, to), balance);
        Ok(())
    }

    /// Sets the allowance `spender` may pull from `owner`.
    pub fn approve(&self, token: Address, owner: Address, spender: Address, amount: u128) {
        self.state
            .lock()
            .allowances
            .insert((token, owner, spender), amount);
    }

    /// Remaining allowance.
    pub fn allowance(&self, token: Address, owner: Address, spender: Address) -> u128 {
        self.state
            .lock()
            .allowances
            .get(&(token, owner, spender))
            .copied()
            .unwrap_or(0)
    }
}

impl TokenLedger for InMemoryTokenLedger {
    fn balance_of(&self, token: Address, holder: Address) -> u128 {
        self.state.lock().balance(token, holder)
    }

    fn transfer(
        &self,
        token: Address,
        from: Address,
        to: Address,
        amount: u128,
    ) -> Result<(), TokenLedgerError> {
        self.state.lock().move_balance(token, from, to, amount)
    }

    fn transfer_from(
        &self,
        token: Address,
        spender: Address,
        from: Address,
        to: Address,
        amount: u128,
    ) -> Result<(), TokenLedgerError> {
        let mut state = self.state.lock();
        let key = (token, from, spender);
        let allowed = state.allowances.get(&key).copied().unwrap_or(0);
        if allowed < amount {
            return Err(TokenLedgerError::InsufficientAllowance {
                token,
                owner: from,
                spender,
                allowed,
                requested: amount,
            });
        }
        state.move_balance(token, from, to, amount)?;
        state.allowances.insert(key, allowed - amount);
        Ok(())
    }
}
