//! # BitsaveDB: Durable Event Store
//!
//! The persistence layer for a Bitsave node, built on sled's embedded
//! key-value store. It keeps the audit log durable across restarts and
//! remembers which configuration the log was written under.
//!
//! ## Tree Layout
//!
//! | Tree       | Key              | Value                  |
//! |------------|------------------|------------------------|
//! | `events`   | `seq` (8B BE)    | `json(EventRecord)`    |
//! | `metadata` | key (UTF-8)      | value (bytes)          |
//!
//! Sequence numbers are stored as big-endian u64 so that sled's
//! lexicographic ordering matches numeric ordering and `since(n)` is a
//! plain range scan.
//!
//! Records are JSON rather than bincode: events are internally tagged
//! enums, which bincode cannot read back.
//!
//! ## Atomicity
//!
//! A batch of events is written with a single sled `Batch`. Either every
//! event of a command lands on disk or none does.

use parking_lot::Mutex;
use sled::{Batch, Db, Tree};
use std::path::Path;

use crate::config::BitsaveConfig;
use crate::events::{BitsaveEvent, EventLog, EventLogError, EventRecord};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

impl From<DbError> for EventLogError {
    fn from(e: DbError) -> Self {
        EventLogError::Write(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Metadata Keys
// ---------------------------------------------------------------------------

/// Well-known key in the `metadata` tree for the deployment config.
const META_CONFIG: &[u8] = b"config";

// ---------------------------------------------------------------------------
// BitsaveDB
// ---------------------------------------------------------------------------

/// Durable storage for the Bitsave event log and deployment metadata.
#[derive(Debug)]
pub struct BitsaveDB {
    /// The underlying sled database handle.
    db: Db,
    /// Event records indexed by sequence number (big-endian u64 keys).
    events: Tree,
    /// Deployment metadata.
    metadata: Tree,
    /// Serializes appends so sequence numbers stay dense.
    append_lock: Mutex<()>,
}

impl BitsaveDB {
    /// Open or create a database at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Create a temporary database that is removed when dropped.
    pub fn open_temporary() -> DbResult<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config.open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> DbResult<Self> {
        let events = db.open_tree("events")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self {
            db,
            events,
            metadata,
            append_lock: Mutex::new(()),
        })
    }

    // -- Event operations ---------------------------------------------------

    /// The sequence number the next appended event will get.
    pub fn next_seq(&self) -> DbResult<u64> {
        match self.events.last()? {
            Some((key, _)) => {
                let seq = u64::from_be_bytes(
                    key.as_ref()
                        .try_into()
                        .map_err(|_| DbError::Serialization("invalid seq key".to_string()))?,
                );
                Ok(seq + 1)
            }
            None => Ok(0),
        }
    }

    /// Appends a batch of events atomically and flushes it to disk.
    pub fn put_events(
        &self,
        events: Vec<BitsaveEvent>,
        timestamp: u64,
    ) -> DbResult<Vec<EventRecord>> {
        let _guard = self.append_lock.lock();
        let mut seq = self.next_seq()?;

        let mut batch = Batch::default();
        let mut records = Vec::with_capacity(events.len());
        for event in events {
            let record = EventRecord {
                seq,
                timestamp,
                event,
            };
            let bytes = serde_json::to_vec(&record)
                .map_err(|e| DbError::Serialization(e.to_string()))?;
            batch.insert(&seq.to_be_bytes(), bytes);
            records.push(record);
            seq += 1;
        }

        self.events.apply_batch(batch)?;
        self.db.flush()?;

        Ok(records)
    }

    /// Reads every record with `seq >= from`.
    pub fn get_events_since(&self, from: u64) -> DbResult<Vec<EventRecord>> {
        let mut records = Vec::new();
        for result in self.events.range(from.to_be_bytes()..) {
            let (_key, value) = result?;
            let record: EventRecord = serde_json::from_slice(&value)
                .map_err(|e| DbError::Serialization(e.to_string()))?;
            records.push(record);
        }
        Ok(records)
    }

    /// Number of stored events.
    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    // -- Metadata operations ------------------------------------------------

    /// Records the configuration this log was written under.
    pub fn put_config(&self, config: &BitsaveConfig) -> DbResult<()> {
        let bytes =
            serde_json::to_vec(config).map_err(|e| DbError::Serialization(e.to_string()))?;
        self.metadata.insert(META_CONFIG, bytes)?;
        self.db.flush()?;
        Ok(())
    }

    /// The stored configuration, if one was ever recorded.
    pub fn get_config(&self) -> DbResult<Option<BitsaveConfig>> {
        match self.metadata.get(META_CONFIG)? {
            Some(bytes) => {
                let config = serde_json::from_slice(&bytes)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                Ok(Some(config))
            }
            None => Ok(None),
        }
    }

    /// Force a flush of all pending writes to disk.
    pub fn flush(&self) -> DbResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl EventLog for BitsaveDB {
    fn append(
        &self,
        events: Vec<BitsaveEvent>,
        timestamp: u64,
    ) -> Result<Vec<EventRecord>, EventLogError> {
        Ok(self.put_events(events, timestamp)?)
    }

    fn since(&self, from: u64) -> Result<Vec<EventRecord>, EventLogError> {
        self.get_events_since(from)
            .map_err(|e| EventLogError::Read(e.to_string()))
    }

    fn len(&self) -> u64 {
        self.event_count() as u64
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
