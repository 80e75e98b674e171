//! Live event fan-out.
//!
//! [`BroadcastEventLog`] sits between the ledger and its real log. Records
//! are published to WebSocket subscribers only after the inner log has
//! accepted them, so subscribers never see an event that was not committed.
//! Appends are serialized with their publication, so subscribers receive
//! records in `seq` order.

use std::sync::Arc;

use bitsave_protocol::{BitsaveEvent, EventLog, EventLogError, EventRecord};
use parking_lot::Mutex;
use tokio::sync::broadcast;

pub struct BroadcastEventLog {
    inner: Arc<dyn EventLog>,
    tx: broadcast::Sender<EventRecord>,
    /// Held across append and send.
    publish: Mutex<()>,
}

impl BroadcastEventLog {
    pub fn new(inner: Arc<dyn EventLog>, tx: broadcast::Sender<EventRecord>) -> Self {
        Self {
            inner,
            tx,
            publish: Mutex::new(()),
        }
    }
}

impl EventLog for BroadcastEventLog {
    fn append(
        &self,
        events: Vec<BitsaveEvent>,
        timestamp: u64,
    ) -> Result<Vec<EventRecord>, EventLogError> {
        let _publish = self.publish.lock();
        let records = self.inner.append(events, timestamp)?;
        for record in &records {
            // No subscribers is not an error.
            let _ = self.tx.send(record.clone());
        }
        Ok(records)
    }

    fn since(&self, from: u64) -> Result<Vec<EventRecord>, EventLogError> {
        self.inner.since(from)
    }

    fn len(&self) -> u64 {
        self.inner.len()
    }
}
