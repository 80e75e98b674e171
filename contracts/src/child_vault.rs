//! # Child Vault
//!
//! The per-user container. It owns the user's savings, the balances backing
//! them, and the running points total. The vault only does bookkeeping:
//! fees, token movements and events are orchestrated by [`crate::Bitsave`],
//! which stages every change on a clone and swaps it in once the whole
//! command has succeeded.

use std::collections::{BTreeMap, HashMap};

use bitsave_protocol::types::amount_str;
use bitsave_protocol::{Address, NATIVE_TOKEN};
use serde::{Deserialize, Serialize};

use crate::error::{BitsaveError, BitsaveResult};
use crate::saving::Saving;

/// Domain separator for vault address derivation.
const VAULT_ADDRESS_DOMAIN: &[u8] = b"bitsave.child-vault.v1";

/// What closing a saving released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosedSaving {
    pub token_id: Address,
    /// Principal minus penalty, leaving the vault.
    pub payout: u128,
    /// Portion of principal that stays in the vault.
    pub penalty: u128,
    /// Points earned by the saving.
    pub interest: u128,
    pub matured: bool,
}

/// A user's vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildVault {
    owner: Address,
    address: Address,
    created_at: u64,
    #[serde(with = "amount_str")]
    native_balance: u128,
    #[serde(with = "balances_str")]
    token_balances: BTreeMap<Address, u128>,
    #[serde(with = "amount_str")]
    total_points: u128,
    savings: HashMap<String, Saving>,
    /// Saving names in first-creation order.
    saving_names: Vec<String>,
}

impl ChildVault {
    /// Creates an empty vault for `owner`.
    pub fn new(owner: Address, created_at: u64) -> Self {
        Self {
            owner,
            address: Self::derive_address(owner),
            created_at,
            native_balance: 0,
            token_balances: BTreeMap::new(),
            total_points: 0,
            savings: HashMap::new(),
            saving_names: Vec::new(),
        }
    }

    /// The vault address for `owner`. Stable across restarts and nodes.
    pub fn derive_address(owner: Address) -> Address {
        let mut seed = Vec::with_capacity(VAULT_ADDRESS_DOMAIN.len() + 20);
        seed.extend_from_slice(VAULT_ADDRESS_DOMAIN);
        seed.extend_from_slice(owner.as_bytes());
        Address::derive(&seed)
    }

    pub fn owner(&self) -> Address {
        self.owner
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn native_balance(&self) -> u128 {
        self.native_balance
    }

    pub fn total_points(&self) -> u128 {
        self.total_points
    }

    /// Balance held for `token`. The native marker reads the native balance.
    pub fn balance_of(&self, token: Address) -> u128 {
        if token == NATIVE_TOKEN {
            return self.native_balance;
        }
        self.token_balances.get(&token).copied().unwrap_or(0)
    }

    /// Token balances, excluding native, ordered by token address.
    pub fn token_balances(&self) -> Vec<(Address, u128)> {
        self.token_balances
            .iter()
            .map(|(token, amount)| (*token, *amount))
            .collect()
    }

    /// The latest record stored under `name`, valid or not.
    pub fn saving(&self, name: &str) -> Option<&Saving> {
        self.savings.get(name)
    }

    /// Whether `name` currently holds a valid saving.
    pub fn has_valid_saving(&self, name: &str) -> bool {
        self.savings.get(name).map_or(false, |s| s.is_valid)
    }

    /// All saving records in creation order.
    pub fn savings(&self) -> impl Iterator<Item = &Saving> {
        self.saving_names
            .iter()
            .filter_map(move |name| self.savings.get(name))
    }

    /// Native balance backing valid native savings.
    pub fn reserved_native(&self) -> BitsaveResult<u128> {
        self.savings
            .values()
            .filter(|s| s.is_valid && s.is_native())
            .try_fold(0u128, |acc, s| {
                acc.checked_add(s.amount).ok_or(BitsaveError::Overflow)
            })
    }

    /// Native balance not backing any valid saving: fees, penalties and
    /// anything else left behind.
    pub fn unreserved_native(&self) -> BitsaveResult<u128> {
        Ok(self.native_balance.saturating_sub(self.reserved_native()?))
    }

    // -----------------------------------------------------------------------
    // Balance bookkeeping
    // -----------------------------------------------------------------------

    pub(crate) fn credit(&mut self, token: Address, amount: u128) -> BitsaveResult<()> {
        if amount == 0 {
            return Ok(());
        }
        let next = self
            .balance_of(token)
            .checked_add(amount)
            .ok_or(BitsaveError::Overflow)?;
        self.set_balance(token, next);
        Ok(())
    }

    pub(crate) fn debit(&mut self, token: Address, amount: u128) -> BitsaveResult<()> {
        if amount == 0 {
            return Ok(());
        }
        let available = self.balance_of(token);
        let next = available
            .checked_sub(amount)
            .ok_or(BitsaveError::InsufficientFunds {
                available,
                requested: amount,
            })?;
        self.set_balance(token, next);
        Ok(())
    }

    fn set_balance(&mut self, token: Address, amount: u128) {
        if token == NATIVE_TOKEN {
            self.native_balance = amount;
        } else {
            self.token_balances.insert(token, amount);
        }
    }

    // -----------------------------------------------------------------------
    // Saving lifecycle
    // -----------------------------------------------------------------------

    /// Records a newly opened saving and adds its points.
    ///
    /// A withdrawn record under the same name is replaced.
    pub(crate) fn insert_saving(&mut self, saving: Saving) -> BitsaveResult<()> {
        if self.has_valid_saving(&saving.name) {
            return Err(BitsaveError::invalid_saving(
                &saving.name,
                "a valid saving with this name already exists",
            ));
        }
        self.total_points = self
            .total_points
            .checked_add(saving.interest_accumulated)
            .ok_or(BitsaveError::Overflow)?;

        if !self.savings.contains_key(&saving.name) {
            self.saving_names.push(saving.name.clone());
        }
        self.savings.insert(saving.name.clone(), saving);
        Ok(())
    }

    /// Adds `deposit` to the principal of the valid saving `name`.
    pub(crate) fn increment_saving(&mut self, name: &str, deposit: u128) -> BitsaveResult<Saving> {
        let saving = self
            .savings
            .get_mut(name)
            .filter(|s| s.is_valid)
            .ok_or_else(|| BitsaveError::invalid_saving(name, "no valid saving with this name"))?;

        let delta = saving.add_principal(deposit)?;
        let updated = saving.clone();
        self.total_points = self
            .total_points
            .checked_add(delta)
            .ok_or(BitsaveError::Overflow)?;
        Ok(updated)
    }

    /// Invalidates the saving `name` and debits the payout from the
    /// balance of its token. The penalty stays behind.
    ///
    /// Points are never taken back.
    pub(crate) fn close_saving(&mut self, name: &str, now: u64) -> BitsaveResult<ClosedSaving> {
        let saving = self
            .savings
            .get(name)
            .filter(|s| s.is_valid)
            .ok_or_else(|| BitsaveError::invalid_saving(name, "no valid saving with this name"))?;

        let penalty = saving.penalty_at(now);
        let closed = ClosedSaving {
            token_id: saving.token_id,
            payout: saving.amount - penalty,
            penalty,
            interest: saving.interest_accumulated,
            matured: saving.is_mature(now),
        };

        self.debit(closed.token_id, closed.payout)?;
        if let Some(saving) = self.savings.get_mut(name) {
            saving.is_valid = false;
        }
        Ok(closed)
    }
}

/// Token balance maps with decimal-string amounts.
mod balances_str {
    use std::collections::BTreeMap;

    use bitsave_protocol::Address;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        balances: &BTreeMap<Address, u128>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_map(balances.iter().map(|(k, v)| (k, v.to_string())))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<Address, u128>, D::Error> {
        BTreeMap::<Address, String>::deserialize(deserializer)?
            .into_iter()
            .map(|(k, v)| {
                v.parse::<u128>()
                    .map(|amount| (k, amount))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
