//! RedbQueue — redb-backed durable offline queue.
//!
//! Tables:
//! - `queue_by_recipient`: packed recipient + enqueue-time + message-id key
//!   → record JSON (range scans give per-recipient enqueue order)
//! - `queue_by_message_id`: message-id bytes → queue key (for delivery marks)

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use uuid::Uuid;

use super::{OfflineQueue, QueueError};
use crate::types::{now_millis, AgentId, Envelope, QueuedMessage};

const QUEUE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("queue_by_recipient");
const BY_MESSAGE_ID: TableDefinition<&[u8], &[u8]> = TableDefinition::new("queue_by_message_id");

fn persist<E: Into<redb::Error>>(e: E) -> QueueError {
    QueueError::Persistence(Box::new(e.into()))
}

/// `[u16 len][recipient][u64 enqueued_at][u64 seq][16B message_id]`, all
/// big-endian, so lexicographic key order is (recipient, enqueue time,
/// sequence). The sequence breaks ties between enqueues landing in the
/// same millisecond.
fn queue_key(recipient: &AgentId, enqueued_at: u64, seq: u64, message_id: &Uuid) -> Vec<u8> {
    let name = recipient.as_str().as_bytes();
    let mut key = Vec::with_capacity(2 + name.len() + 8 + 8 + 16);
    key.extend_from_slice(&(name.len() as u16).to_be_bytes());
    key.extend_from_slice(name);
    key.extend_from_slice(&enqueued_at.to_be_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key.extend_from_slice(message_id.as_bytes());
    key
}

/// Inclusive key bounds covering every record for one recipient.
fn recipient_bounds(recipient: &AgentId) -> (Vec<u8>, Vec<u8>) {
    let name = recipient.as_str().as_bytes();
    let mut prefix = Vec::with_capacity(2 + name.len());
    prefix.extend_from_slice(&(name.len() as u16).to_be_bytes());
    prefix.extend_from_slice(name);

    let mut start = prefix.clone();
    start.extend_from_slice(&[0u8; 32]);
    let mut end = prefix;
    end.extend_from_slice(&[0xffu8; 32]);
    (start, end)
}

/// Durable [`OfflineQueue`]. All storage work runs on the blocking pool;
/// each operation is a single redb transaction.
pub struct RedbQueue {
    db: Arc<Database>,
    ttl: Duration,
    seq: AtomicU64,
}

impl RedbQueue {
    /// Open or create a queue database at the given path.
    pub fn open(path: impl AsRef<Path>, ttl: Duration) -> Result<Self, QueueError> {
        let db = Database::create(path).map_err(persist)?;

        // Ensure required tables exist.
        let write_txn = db.begin_write().map_err(persist)?;
        {
            let _ = write_txn.open_table(QUEUE).map_err(persist)?;
            let _ = write_txn.open_table(BY_MESSAGE_ID).map_err(persist)?;
        }
        write_txn.commit().map_err(persist)?;

        Ok(Self {
            db: Arc::new(db),
            ttl,
            seq: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl OfflineQueue for RedbQueue {
    async fn enqueue(&self, envelope: Envelope) -> Result<(), QueueError> {
        let record = QueuedMessage {
            envelope,
            delivered: false,
            enqueued_at: now_millis(),
        };
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let key = queue_key(
            &record.envelope.to,
            record.enqueued_at,
            seq,
            &record.envelope.message_id,
        );
        let id_key = *record.envelope.message_id.as_bytes();
        let json = serde_json::to_vec(&record)?;
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || {
            let write_txn = db.begin_write().map_err(persist)?;
            {
                let mut queue_table = write_txn.open_table(QUEUE).map_err(persist)?;
                let mut id_table = write_txn.open_table(BY_MESSAGE_ID).map_err(persist)?;
                queue_table
                    .insert(key.as_slice(), json.as_slice())
                    .map_err(persist)?;
                id_table
                    .insert(id_key.as_slice(), key.as_slice())
                    .map_err(persist)?;
            }
            write_txn.commit().map_err(persist)?;
            Ok(())
        })
        .await?
    }

    async fn drain(&self, recipient: &AgentId) -> Result<Vec<QueuedMessage>, QueueError> {
        let (start, end) = recipient_bounds(recipient);
        let ttl = self.ttl;
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || {
            let read_txn = db.begin_read().map_err(persist)?;
            let table = read_txn.open_table(QUEUE).map_err(persist)?;

            let now = now_millis();
            let mut eligible = Vec::new();
            for entry in table
                .range::<&[u8]>(start.as_slice()..=end.as_slice())
                .map_err(persist)?
            {
                let (_, value) = entry.map_err(persist)?;
                let record: QueuedMessage = serde_json::from_slice(value.value())?;
                if record.eligible(ttl, now) {
                    eligible.push(record);
                }
            }
            Ok(eligible)
        })
        .await?
    }

    async fn mark_delivered(&self, message_id: Uuid) -> Result<(), QueueError> {
        let id_key = *message_id.as_bytes();
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || {
            let write_txn = db.begin_write().map_err(persist)?;
            {
                let id_table = write_txn.open_table(BY_MESSAGE_ID).map_err(persist)?;
                let queue_key: Option<Vec<u8>> = id_table
                    .get(id_key.as_slice())
                    .map_err(persist)?
                    .map(|guard| guard.value().to_vec());
                drop(id_table);

                if let Some(key) = queue_key {
                    let mut queue_table = write_txn.open_table(QUEUE).map_err(persist)?;
                    let record: Option<QueuedMessage> = queue_table
                        .get(key.as_slice())
                        .map_err(persist)?
                        .map(|guard| serde_json::from_slice(guard.value()))
                        .transpose()?;

                    if let Some(mut record) = record {
                        if !record.delivered {
                            record.delivered = true;
                            let json = serde_json::to_vec(&record)?;
                            queue_table
                                .insert(key.as_slice(), json.as_slice())
                                .map_err(persist)?;
                        }
                    }
                }
            }
            write_txn.commit().map_err(persist)?;
            Ok(())
        })
        .await?
    }

    async fn purge_expired(&self) -> Result<u64, QueueError> {
        let ttl = self.ttl;
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || {
            let write_txn = db.begin_write().map_err(persist)?;
            let removed;
            {
                let mut queue_table = write_txn.open_table(QUEUE).map_err(persist)?;
                let mut id_table = write_txn.open_table(BY_MESSAGE_ID).map_err(persist)?;

                let now = now_millis();
                let mut expired: Vec<(Vec<u8>, [u8; 16])> = Vec::new();
                for entry in queue_table.iter().map_err(persist)? {
                    let (key, value) = entry.map_err(persist)?;
                    let record: QueuedMessage = serde_json::from_slice(value.value())?;
                    if record.expired(ttl, now) {
                        expired.push((
                            key.value().to_vec(),
                            *record.envelope.message_id.as_bytes(),
                        ));
                    }
                }

                removed = expired.len() as u64;
                for (key, id_key) in expired {
                    queue_table.remove(key.as_slice()).map_err(persist)?;
                    id_table.remove(id_key.as_slice()).map_err(persist)?;
                }
            }
            write_txn.commit().map_err(persist)?;
            Ok(removed)
        })
        .await?
    }

    async fn pending(&self) -> Result<u64, QueueError> {
        let ttl = self.ttl;
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || {
            let read_txn = db.begin_read().map_err(persist)?;
            let table = read_txn.open_table(QUEUE).map_err(persist)?;

            let now = now_millis();
            let mut count = 0u64;
            for entry in table.iter().map_err(persist)? {
                let (_, value) = entry.map_err(persist)?;
                let record: QueuedMessage = serde_json::from_slice(value.value())?;
                if record.eligible(ttl, now) {
                    count += 1;
                }
            }
            Ok(count)
        })
        .await?
    }
}
