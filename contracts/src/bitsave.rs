//! # Bitsave Engine
//!
//! The parent ledger. It registers users, owns the vault map and the fee
//! pool, and runs every command against a vault under that vault's lock.
//!
//! ## Command Shape
//!
//! Every mutating command follows the same steps:
//!
//! 1. Validate in the documented order. The first failing check decides
//!    the error.
//! 2. Stage the vault changes on a clone.
//! 3. Perform the token movements. A failure rolls back the ones already
//!    done.
//! 4. Append the events as one batch. A failure rolls back the token
//!    movements.
//! 5. Swap the staged vault in.
//!
//! A rejected command therefore leaves vaults, fee pool, token balances and
//! the event log exactly as they were.
//!
//! ## Locking
//!
//! Locks are always taken in this order: user map shard, vault, fee pool,
//! then the event log's own lock. Commands on different users only meet at
//! the fee pool and the log.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitsave_protocol::config::MAX_SAVING_NAME_LENGTH;
use bitsave_protocol::{
    Address, BitsaveConfig, BitsaveEvent, EventLog, EventRecord, TokenLedger, NATIVE_TOKEN,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::child_vault::ChildVault;
use crate::error::{BitsaveError, BitsaveResult};
use crate::saving::Saving;

/// Seed for the protocol's own account on the token ledger.
const PROTOCOL_ADDRESS_SEED: &[u8] = b"bitsave.protocol.v1";

// ---------------------------------------------------------------------------
// Call inputs and outputs
// ---------------------------------------------------------------------------

/// Who is calling, what they attached, and the block time of the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallContext {
    pub sender: Address,
    /// Native value attached, in wei.
    pub value: u128,
    /// Block time in seconds.
    pub timestamp: u64,
}

impl CallContext {
    pub fn new(sender: Address, timestamp: u64) -> Self {
        Self {
            sender,
            value: 0,
            timestamp,
        }
    }

    pub fn with_value(mut self, value: u128) -> Self {
        self.value = value;
        self
    }
}

/// Arguments to [`Bitsave::create_saving`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSavingParams {
    pub name: String,
    pub maturity_time: u64,
    pub penalty_percentage: u8,
    #[serde(default)]
    pub is_safe_mode: bool,
    /// `Address::ZERO` for a native saving.
    #[serde(default)]
    pub token_id: Address,
    /// Declared amount. Pulled from the caller for token savings; for
    /// native savings only checked to be non-zero.
    #[serde(with = "bitsave_protocol::types::amount_str")]
    pub amount: u128,
}

/// The result of a successful command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt<T> {
    pub tx_id: Uuid,
    pub output: T,
    /// Events committed by the command, in order.
    pub events: Vec<EventRecord>,
}

/// Output of [`Bitsave::join_bitsave`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Joined {
    pub vault: Address,
    /// Value attached above the join fee, returned to the caller.
    pub refund: u128,
}

/// Output of [`Bitsave::withdraw_saving`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Withdrawal {
    pub token_id: Address,
    /// Principal paid out.
    pub amount: u128,
    /// Principal kept in the vault.
    pub penalty: u128,
    /// Points tokens paid out. Zero unless mature and a points token is set.
    pub points_paid: u128,
}

/// A token movement made during a command, kept so it can be undone.
#[derive(Debug, Clone, Copy)]
struct TokenMove {
    token: Address,
    /// Set for pulls made on the protocol's allowance.
    spender: Option<Address>,
    from: Address,
    to: Address,
    amount: u128,
}

// ---------------------------------------------------------------------------
// Bitsave
// ---------------------------------------------------------------------------

/// The Bitsave ledger.
pub struct Bitsave {
    config: BitsaveConfig,
    address: Address,
    users: DashMap<Address, Arc<Mutex<ChildVault>>>,
    /// Vault address to owner, so queries accept either.
    vault_owners: DashMap<Address, Address>,
    user_count: AtomicU64,
    fee_pool: Mutex<u128>,
    tokens: Arc<dyn TokenLedger>,
    events: Arc<dyn EventLog>,
}

impl std::fmt::Debug for Bitsave {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitsave")
            .field("address", &self.address)
            .field("master", &self.config.master)
            .field("user_count", &self.user_count())
            .field("fee_pool", &self.fee_pool())
            .finish()
    }
}

impl Bitsave {
    /// Deploys a ledger. The fee pool starts at `config.initial_balance`.
    pub fn new(
        config: BitsaveConfig,
        tokens: Arc<dyn TokenLedger>,
        events: Arc<dyn EventLog>,
    ) -> BitsaveResult<Self> {
        config
            .validate()
            .map_err(|e| BitsaveError::InvalidConfig(e.to_string()))?;

        let address = Address::derive(PROTOCOL_ADDRESS_SEED);
        info!(
            protocol = %address,
            master = %config.master,
            join_fee = %config.join_fee,
            saving_fee = %config.saving_fee,
            "Bitsave ledger deployed"
        );

        Ok(Self {
            fee_pool: Mutex::new(config.initial_balance),
            config,
            address,
            users: DashMap::new(),
            vault_owners: DashMap::new(),
            user_count: AtomicU64::new(0),
            tokens,
            events,
        })
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Registers the caller and creates their vault.
    ///
    /// The join fee goes to the fee pool. Value above it is refunded.
    pub fn join_bitsave(&self, ctx: CallContext) -> BitsaveResult<Receipt<Joined>> {
        self.join_inner(ctx)
            .map_err(|e| rejected("joinBitsave", &ctx, e))
    }

    fn join_inner(&self, ctx: CallContext) -> BitsaveResult<Receipt<Joined>> {
        let join_fee = self.config.join_fee;
        if ctx.value < join_fee {
            return Err(BitsaveError::AmountNotEnough {
                attached: ctx.value,
                required: join_fee,
            });
        }
        let refund = ctx.value - join_fee;

        let slot = match self.users.entry(ctx.sender) {
            Entry::Occupied(_) => return Err(BitsaveError::UserAlreadyRegistered(ctx.sender)),
            Entry::Vacant(slot) => slot,
        };

        let vault = ChildVault::new(ctx.sender, ctx.timestamp);
        let vault_address = vault.address();

        let mut pool = self.fee_pool.lock();
        let next_pool = pool.checked_add(join_fee).ok_or(BitsaveError::Overflow)?;

        let mut events = vec![BitsaveEvent::JoinedBitsave { user: ctx.sender }];
        if refund > 0 {
            events.push(BitsaveEvent::NativeTransfer {
                to: ctx.sender,
                amount: refund,
            });
        }
        let records = self.commit_events(events, ctx.timestamp, &[])?;

        *pool = next_pool;
        self.vault_owners.insert(vault_address, ctx.sender);
        // Counted before the user becomes visible to readers.
        let count = self.user_count.fetch_add(1, Ordering::SeqCst) + 1;
        slot.insert(Arc::new(Mutex::new(vault)));

        info!(user = %ctx.sender, vault = %vault_address, users = count, "user joined");
        Ok(receipt(
            Joined {
                vault: vault_address,
                refund,
            },
            records,
        ))
    }

    /// Opens a named saving in the caller's vault.
    ///
    /// Checks run in this order: registration, saving fee, maturity,
    /// penalty, amount, name. Native savings hold the attached value minus
    /// the saving fee, which must be non-zero; token savings pull
    /// `params.amount` from the caller.
    pub fn create_saving(
        &self,
        ctx: CallContext,
        params: CreateSavingParams,
    ) -> BitsaveResult<Receipt<Saving>> {
        self.create_inner(ctx, params)
            .map_err(|e| rejected("createSaving", &ctx, e))
    }

    fn create_inner(
        &self,
        ctx: CallContext,
        params: CreateSavingParams,
    ) -> BitsaveResult<Receipt<Saving>> {
        let handle = self.vault_of(ctx.sender)?;

        let saving_fee = self.config.saving_fee;
        if ctx.value < saving_fee {
            return Err(BitsaveError::NotEnoughToPayGasFee {
                attached: ctx.value,
                required: saving_fee,
            });
        }
        let native = params.token_id == NATIVE_TOKEN;
        let principal = if native {
            ctx.value - saving_fee
        } else {
            params.amount
        };
        // Maturity and penalty are checked by `Saving::open`, ahead of the
        // amount and name checks.
        let saving = Saving::open(
            params.name,
            principal,
            params.token_id,
            ctx.timestamp,
            params.maturity_time,
            params.penalty_percentage,
            params.is_safe_mode,
        )?;
        // A native saving must carry value beyond the fee.
        if params.amount == 0 || principal == 0 {
            return Err(BitsaveError::ZeroAmount);
        }
        check_name(&saving.name)?;

        let mut vault = handle.lock();
        let mut staged = vault.clone();
        staged.credit(NATIVE_TOKEN, ctx.value)?;
        if !native {
            staged.credit(saving.token_id, principal)?;
        }
        staged.insert_saving(saving.clone())?;

        let moves = if native {
            Vec::new()
        } else {
            vec![self.pull(saving.token_id, ctx.sender, staged.address(), principal)]
        };
        self.apply_moves(&moves)?;

        let records = self.commit_events(
            vec![BitsaveEvent::SavingCreated {
                user: ctx.sender,
                name: saving.name.clone(),
                amount: principal,
                token_id: saving.token_id,
            }],
            ctx.timestamp,
            &moves,
        )?;
        *vault = staged;

        info!(
            user = %ctx.sender,
            name = %saving.name,
            token = %saving.token_id,
            amount = %principal,
            maturity = saving.maturity_time,
            "saving created"
        );
        Ok(receipt(saving, records))
    }

    /// Adds principal to a valid saving.
    ///
    /// Native savings take the attached value; token savings pull `amount`
    /// of `token_id`, which must match the saving's token.
    pub fn increment_saving(
        &self,
        ctx: CallContext,
        name: &str,
        token_id: Address,
        amount: u128,
    ) -> BitsaveResult<Receipt<Saving>> {
        self.increment_inner(ctx, name, token_id, amount)
            .map_err(|e| rejected("incrementSaving", &ctx, e))
    }

    fn increment_inner(
        &self,
        ctx: CallContext,
        name: &str,
        token_id: Address,
        amount: u128,
    ) -> BitsaveResult<Receipt<Saving>> {
        let handle = self.vault_of(ctx.sender)?;
        let mut vault = handle.lock();

        let current = vault
            .saving(name)
            .filter(|s| s.is_valid)
            .ok_or_else(|| BitsaveError::invalid_saving(name, "no valid saving with this name"))?;
        if current.token_id != token_id {
            return Err(BitsaveError::TokenMismatch {
                name: name.to_string(),
                expected: current.token_id,
                got: token_id,
            });
        }
        let native = token_id == NATIVE_TOKEN;
        let deposit = if native { ctx.value } else { amount };
        if deposit == 0 {
            return Err(BitsaveError::ZeroAmount);
        }

        let mut staged = vault.clone();
        staged.credit(NATIVE_TOKEN, ctx.value)?;
        if !native {
            staged.credit(token_id, deposit)?;
        }
        let updated = staged.increment_saving(name, deposit)?;

        let moves = if native {
            Vec::new()
        } else {
            vec![self.pull(token_id, ctx.sender, staged.address(), deposit)]
        };
        self.apply_moves(&moves)?;

        let records = self.commit_events(
            vec![BitsaveEvent::SavingIncremented {
                user: ctx.sender,
                name: name.to_string(),
                amount: deposit,
                token_id,
            }],
            ctx.timestamp,
            &moves,
        )?;
        *vault = staged;

        info!(
            user = %ctx.sender,
            name = %name,
            deposit = %deposit,
            principal = %updated.amount,
            "saving incremented"
        );
        Ok(receipt(updated, records))
    }

    /// Withdraws a valid saving.
    ///
    /// Before maturity the penalty share of the principal stays in the
    /// vault. At or after maturity the full principal is paid and, when a
    /// points token is configured, the accumulated points are paid in it
    /// from the master account. Points are never deducted.
    ///
    /// Value attached to this call is not taken.
    pub fn withdraw_saving(&self, ctx: CallContext, name: &str) -> BitsaveResult<Receipt<Withdrawal>> {
        self.withdraw_inner(ctx, name)
            .map_err(|e| rejected("withdrawSaving", &ctx, e))
    }

    fn withdraw_inner(&self, ctx: CallContext, name: &str) -> BitsaveResult<Receipt<Withdrawal>> {
        let handle = self.vault_of(ctx.sender)?;
        let mut vault = handle.lock();

        let mut staged = vault.clone();
        let closed = staged.close_saving(name, ctx.timestamp)?;
        let vault_address = staged.address();

        let mut moves = Vec::new();
        let mut events = vec![BitsaveEvent::SavingWithdrawn {
            user: ctx.sender,
            name: name.to_string(),
            amount: closed.payout,
            penalty: closed.penalty,
        }];

        if closed.token_id == NATIVE_TOKEN {
            if closed.payout > 0 {
                events.push(BitsaveEvent::NativeTransfer {
                    to: ctx.sender,
                    amount: closed.payout,
                });
            }
        } else if closed.payout > 0 {
            moves.push(TokenMove {
                token: closed.token_id,
                spender: None,
                from: vault_address,
                to: ctx.sender,
                amount: closed.payout,
            });
            events.push(BitsaveEvent::TokenWithdrawal {
                from: vault_address,
                to: ctx.sender,
                token_id: closed.token_id,
                amount: closed.payout,
            });
        }

        let points_paid = if closed.matured && self.config.points_payout_enabled() {
            closed.interest
        } else {
            0
        };
        if points_paid > 0 {
            moves.push(TokenMove {
                token: self.config.cs_token,
                spender: None,
                from: self.config.master,
                to: ctx.sender,
                amount: points_paid,
            });
            events.push(BitsaveEvent::TokenWithdrawal {
                from: self.config.master,
                to: ctx.sender,
                token_id: self.config.cs_token,
                amount: points_paid,
            });
        }

        self.apply_moves(&moves)?;
        let records = self.commit_events(events, ctx.timestamp, &moves)?;
        *vault = staged;

        info!(
            user = %ctx.sender,
            name = %name,
            amount = %closed.payout,
            penalty = %closed.penalty,
            points_paid = %points_paid,
            matured = closed.matured,
            "saving withdrawn"
        );
        Ok(receipt(
            Withdrawal {
                token_id: closed.token_id,
                amount: closed.payout,
                penalty: closed.penalty,
                points_paid,
            },
            records,
        ))
    }

    /// Master only. Moves a vault's unreserved native balance into the fee
    /// pool. Returns the amount swept; sweeping an empty residue is a no-op.
    pub fn sweep_vault(&self, ctx: CallContext, user: Address) -> BitsaveResult<Receipt<u128>> {
        self.sweep_inner(ctx, user)
            .map_err(|e| rejected("sweepVault", &ctx, e))
    }

    fn sweep_inner(&self, ctx: CallContext, user: Address) -> BitsaveResult<Receipt<u128>> {
        self.require_master(&ctx)?;
        let handle = self.vault_of(user)?;
        let mut vault = handle.lock();

        let residue = vault.unreserved_native()?;
        if residue == 0 {
            debug!(user = %user, "nothing to sweep");
            return Ok(receipt(0, Vec::new()));
        }

        let mut staged = vault.clone();
        staged.debit(NATIVE_TOKEN, residue)?;

        let mut pool = self.fee_pool.lock();
        let next_pool = pool.checked_add(residue).ok_or(BitsaveError::Overflow)?;
        let records = self.commit_events(
            vec![BitsaveEvent::VaultSwept {
                user,
                amount: residue,
            }],
            ctx.timestamp,
            &[],
        )?;
        *pool = next_pool;
        *vault = staged;

        info!(user = %user, amount = %residue, "vault swept");
        Ok(receipt(residue, records))
    }

    /// Master only. Pays `amount` out of the fee pool to the master.
    pub fn collect_fees(&self, ctx: CallContext, amount: u128) -> BitsaveResult<Receipt<u128>> {
        self.collect_inner(ctx, amount)
            .map_err(|e| rejected("collectFees", &ctx, e))
    }

    fn collect_inner(&self, ctx: CallContext, amount: u128) -> BitsaveResult<Receipt<u128>> {
        self.require_master(&ctx)?;
        if amount == 0 {
            return Err(BitsaveError::ZeroAmount);
        }

        let mut pool = self.fee_pool.lock();
        let remaining = pool
            .checked_sub(amount)
            .ok_or(BitsaveError::InsufficientFunds {
                available: *pool,
                requested: amount,
            })?;
        let records = self.commit_events(
            vec![BitsaveEvent::FeesCollected {
                to: ctx.sender,
                amount,
            }],
            ctx.timestamp,
            &[],
        )?;
        *pool = remaining;

        info!(to = %ctx.sender, amount = %amount, remaining = %remaining, "fees collected");
        Ok(receipt(amount, records))
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// The vault address of `user`.
    pub fn user_child_contract_address(&self, user: Address) -> BitsaveResult<Address> {
        Ok(self.vault_of(user)?.lock().address())
    }

    pub fn is_registered(&self, user: Address) -> bool {
        self.users.contains_key(&user)
    }

    /// The latest record under `name` in the vault of `owner_or_vault`,
    /// which may be a user or a vault address. Withdrawn records are
    /// returned with `is_valid == false`.
    pub fn get_saving(&self, owner_or_vault: Address, name: &str) -> BitsaveResult<Saving> {
        self.vault_of(owner_or_vault)?
            .lock()
            .saving(name)
            .cloned()
            .ok_or_else(|| BitsaveError::invalid_saving(name, "no saving with this name"))
    }

    /// Every saving record of a vault, in creation order.
    pub fn list_savings(&self, owner_or_vault: Address) -> BitsaveResult<Vec<Saving>> {
        Ok(self
            .vault_of(owner_or_vault)?
            .lock()
            .savings()
            .cloned()
            .collect())
    }

    pub fn total_points(&self, owner_or_vault: Address) -> BitsaveResult<u128> {
        Ok(self.vault_of(owner_or_vault)?.lock().total_points())
    }

    /// A consistent copy of a whole vault.
    pub fn vault_snapshot(&self, owner_or_vault: Address) -> BitsaveResult<ChildVault> {
        Ok(self.vault_of(owner_or_vault)?.lock().clone())
    }

    pub fn user_count(&self) -> u64 {
        self.user_count.load(Ordering::SeqCst)
    }

    pub fn fee_pool(&self) -> u128 {
        *self.fee_pool.lock()
    }

    pub fn stable_coin(&self) -> Address {
        self.config.stable_coin
    }

    pub fn cs_token(&self) -> Address {
        self.config.cs_token
    }

    pub fn master_address(&self) -> Address {
        self.config.master
    }

    pub fn join_fee(&self) -> u128 {
        self.config.join_fee
    }

    pub fn saving_fee(&self) -> u128 {
        self.config.saving_fee
    }

    /// The protocol's account on the token ledger. Users approve this
    /// address before creating token savings.
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn config(&self) -> &BitsaveConfig {
        &self.config
    }

    /// Committed events with `seq >= from`.
    pub fn events_since(&self, from: u64) -> BitsaveResult<Vec<EventRecord>> {
        self.events
            .since(from)
            .map_err(|e| BitsaveError::EventLog(e.to_string()))
    }

    /// Number of events committed so far.
    pub fn event_count(&self) -> u64 {
        self.events.len()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Resolves a user or vault address to the vault handle.
    fn vault_of(&self, owner_or_vault: Address) -> BitsaveResult<Arc<Mutex<ChildVault>>> {
        if let Some(handle) = self.users.get(&owner_or_vault) {
            return Ok(Arc::clone(handle.value()));
        }
        let owner = self
            .vault_owners
            .get(&owner_or_vault)
            .map(|entry| *entry.value())
            .ok_or(BitsaveError::UserNotRegistered(owner_or_vault))?;
        self.users
            .get(&owner)
            .map(|handle| Arc::clone(handle.value()))
            .ok_or(BitsaveError::UserNotRegistered(owner_or_vault))
    }

    fn require_master(&self, ctx: &CallContext) -> BitsaveResult<()> {
        if ctx.sender != self.config.master {
            return Err(BitsaveError::MasterCallRequired(ctx.sender));
        }
        Ok(())
    }

    fn pull(&self, token: Address, from: Address, to: Address, amount: u128) -> TokenMove {
        TokenMove {
            token,
            spender: Some(self.address),
            from,
            to,
            amount,
        }
    }

    /// Performs `moves` in order. On failure the completed ones are undone.
    fn apply_moves(&self, moves: &[TokenMove]) -> BitsaveResult<()> {
        for (done, m) in moves.iter().enumerate() {
            let result = match m.spender {
                Some(spender) => self
                    .tokens
                    .transfer_from(m.token, spender, m.from, m.to, m.amount),
                None => self.tokens.transfer(m.token, m.from, m.to, m.amount),
            };
            if let Err(e) = result {
                self.undo_moves(&moves[..done]);
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn undo_moves(&self, moves: &[TokenMove]) {
        for m in moves.iter().rev() {
            if let Err(e) = self.tokens.transfer(m.token, m.to, m.from, m.amount) {
                error!(
                    token = %m.token,
                    from = %m.to,
                    to = %m.from,
                    amount = %m.amount,
                    error = %e,
                    "failed to undo token movement"
                );
            }
        }
    }

    /// Appends `events` as one batch, undoing `moves` if the log refuses.
    fn commit_events(
        &self,
        events: Vec<BitsaveEvent>,
        timestamp: u64,
        moves: &[TokenMove],
    ) -> BitsaveResult<Vec<EventRecord>> {
        match self.events.append(events, timestamp) {
            Ok(records) => Ok(records),
            Err(e) => {
                self.undo_moves(moves);
                Err(BitsaveError::EventLog(e.to_string()))
            }
        }
    }
}

fn receipt<T>(output: T, events: Vec<EventRecord>) -> Receipt<T> {
    Receipt {
        tx_id: Uuid::new_v4(),
        output,
        events,
    }
}

fn check_name(name: &str) -> BitsaveResult<()> {
    if name.is_empty() {
        return Err(BitsaveError::invalid_saving(name, "name must not be empty"));
    }
    if name.len() > MAX_SAVING_NAME_LENGTH {
        return Err(BitsaveError::invalid_saving(name, "name is too long"));
    }
    Ok(())
}

fn rejected(op: &'static str, ctx: &CallContext, e: BitsaveError) -> BitsaveError {
    warn!(
        op,
        sender = %ctx.sender,
        value = %ctx.value,
        code = e.code(),
        error = %e,
        "command rejected"
    );
    e
}
