// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Bitsave Protocol: Shared Primitives
//!
//! The types and collaborators every Bitsave crate agrees on: identities and
//! wei amounts, the deployment configuration, the event model and its log,
//! the fungible-token seam, and durable storage.
//!
//! ## Architecture
//!
//! - **types**: `Address`, the native-currency marker, ether/wei helpers.
//! - **config**: Protocol constants and `BitsaveConfig`.
//! - **events**: `BitsaveEvent`, `EventRecord`, the `EventLog` trait.
//! - **token**: The `TokenLedger` trait and an in-memory ledger.
//! - **storage**: sled persistence for the event log.
//!
//! The state machine itself lives in `bitsave-contracts`.

pub mod config;
pub mod events;
pub mod storage;
pub mod token;
pub mod types;

pub use config::BitsaveConfig;
pub use events::{BitsaveEvent, EventLog, EventLogError, EventRecord, MemoryEventLog};
pub use token::{InMemoryTokenLedger, TokenLedger, TokenLedgerError};
pub use types::{format_ether, parse_ether, Address, NATIVE_TOKEN};
