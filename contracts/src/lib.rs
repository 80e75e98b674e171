// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Bitsave Contracts
//!
//! The savings ledger. Users join once, get a vault, and keep named
//! time-locked savings in it:
//!
//! - **Bitsave**: the parent ledger: registration, fees, the command
//!   surface and the read-only queries.
//! - **Child Vault**: one per user, holding savings, balances and points.
//! - **Saving**: a single deposit with a maturity time and an early
//!   withdrawal penalty.
//!
//! ## Design Principles
//!
//! 1. All monetary operations check for overflow with `checked_add` and
//!    `checked_sub`.
//! 2. A command either applies completely (vault, fee pool, token balances
//!    and event log) or not at all.
//! 3. Every failure has a named condition, see [`BitsaveError::code`].
//! 4. Every public type is serializable (serde) for the RPC surface.

pub mod bitsave;
pub mod child_vault;
pub mod error;
pub mod saving;

pub use bitsave::{Bitsave, CallContext, CreateSavingParams, Joined, Receipt, Withdrawal};
pub use child_vault::ChildVault;
pub use error::{BitsaveError, BitsaveResult};
pub use saving::Saving;
