//! # Event Log
//!
//! The append-only audit trail of every committed Bitsave state transition.
//! The engine appends a command's events as one batch inside the same
//! critical section that commits the state change, so an observer never
//! sees an event whose state change did not land.
//!
//! Sequence numbers start at 0 and are dense: the n-th appended record has
//! `seq == n`. Consumers resume with [`EventLog::since`].

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{amount_str, Address};

/// Errors surfaced by event log backends.
#[derive(Debug, Error)]
pub enum EventLogError {
    /// The backend could not persist the batch.
    #[error("event log write failed: {0}")]
    Write(String),

    /// A stored record could not be read back.
    #[error("event log read failed: {0}")]
    Read(String),
}

/// A state transition observed by the outside world.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BitsaveEvent {
    /// A user registered and received a vault.
    JoinedBitsave { user: Address },

    /// A new saving was opened.
    SavingCreated {
        user: Address,
        name: String,
        #[serde(with = "amount_str")]
        amount: u128,
        token_id: Address,
    },

    /// Principal was added to an existing saving.
    SavingIncremented {
        user: Address,
        name: String,
        #[serde(with = "amount_str")]
        amount: u128,
        token_id: Address,
    },

    /// A saving was closed. `amount` is what left the vault.
    SavingWithdrawn {
        user: Address,
        name: String,
        #[serde(with = "amount_str")]
        amount: u128,
        #[serde(with = "amount_str")]
        penalty: u128,
    },

    /// Native currency left the protocol.
    NativeTransfer {
        to: Address,
        #[serde(with = "amount_str")]
        amount: u128,
    },

    /// A fungible token left the protocol.
    TokenWithdrawal {
        from: Address,
        to: Address,
        token_id: Address,
        #[serde(with = "amount_str")]
        amount: u128,
    },

    /// The master moved a vault's unreserved residue into the fee pool.
    VaultSwept {
        user: Address,
        #[serde(with = "amount_str")]
        amount: u128,
    },

    /// The master withdrew from the fee pool.
    FeesCollected {
        to: Address,
        #[serde(with = "amount_str")]
        amount: u128,
    },
}

impl BitsaveEvent {
    /// The event's name as an indexer would see it.
    pub fn kind(&self) -> &'static str {
        match self {
            BitsaveEvent::JoinedBitsave { .. } => "JoinedBitsave",
            BitsaveEvent::SavingCreated { .. } => "SavingCreated",
            BitsaveEvent::SavingIncremented { .. } => "SavingIncremented",
            BitsaveEvent::SavingWithdrawn { .. } => "SavingWithdrawn",
            BitsaveEvent::NativeTransfer { .. } => "NativeTransfer",
            BitsaveEvent::TokenWithdrawal { .. } => "TokenWithdrawal",
            BitsaveEvent::VaultSwept { .. } => "VaultSwept",
            BitsaveEvent::FeesCollected { .. } => "FeesCollected",
        }
    }
}

/// An event with its position in the log and the block time it was
/// committed at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub seq: u64,
    pub timestamp: u64,
    pub event: BitsaveEvent,
}

/// Append-only storage for [`EventRecord`]s.
///
/// `append` must be all-or-nothing for the batch: either every event gets a
/// sequence number or none does.
pub trait EventLog: Send + Sync {
    /// Appends a batch and returns the stored records.
    fn append(
        &self,
        events: Vec<BitsaveEvent>,
        timestamp: u64,
    ) -> Result<Vec<EventRecord>, EventLogError>;

    /// All records with `seq >= from`, in order.
    fn since(&self, from: u64) -> Result<Vec<EventRecord>, EventLogError>;

    /// Number of records appended so far.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process event log. The default for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    records: RwLock<Vec<EventRecord>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventLog for MemoryEventLog {
    fn append(
        &self,
        events: Vec<BitsaveEvent>,
        timestamp: u64,
    ) -> Result<Vec<EventRecord>, EventLogError> {
        let mut records = self.records.write();
        let mut appended = Vec::with_capacity(events.len());
        for event in events {
            let record = EventRecord {
                seq: records.len() as u64,
                timestamp,
                event,
            };
            records.push(record.clone());
            appended.push(record);
        }
        Ok(appended)
    }

    fn since(&self, from: u64) -> Result<Vec<EventRecord>, EventLogError> {
        let records = self.records.read();
        let start = usize::try_from(from).unwrap_or(usize::MAX).min(records.len());
        Ok(records[start..].to_vec())
    }

    fn len(&self) -> u64 {
        self.records.read().len() as u64
    }
}
