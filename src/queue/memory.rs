//! In-memory offline queue for tests and ephemeral relays.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{OfflineQueue, QueueError};
use crate::types::{now_millis, AgentId, Envelope, QueuedMessage};

/// Non-durable [`OfflineQueue`] with the same semantics as [`super::RedbQueue`].
pub struct MemoryQueue {
    ttl: Duration,
    state: Mutex<HashMap<AgentId, Vec<QueuedMessage>>>,
}

impl MemoryQueue {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl OfflineQueue for MemoryQueue {
    async fn enqueue(&self, envelope: Envelope) -> Result<(), QueueError> {
        let record = QueuedMessage {
            envelope,
            delivered: false,
            enqueued_at: now_millis(),
        };
        self.state
            .lock()
            .entry(record.envelope.to.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn drain(&self, recipient: &AgentId) -> Result<Vec<QueuedMessage>, QueueError> {
        let now = now_millis();
        let state = self.state.lock();
        let mut eligible: Vec<QueuedMessage> = state
            .get(recipient)
            .into_iter()
            .flatten()
            .filter(|record| record.eligible(self.ttl, now))
            .cloned()
            .collect();
        // insertion order already matches enqueue order; sort keeps the
        // contract explicit for same-millis records
        eligible.sort_by_key(|record| record.enqueued_at);
        Ok(eligible)
    }

    async fn mark_delivered(&self, message_id: Uuid) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        for records in state.values_mut() {
            for record in records.iter_mut() {
                if record.envelope.message_id == message_id {
                    record.delivered = true;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, QueueError> {
        let now = now_millis();
        let mut removed = 0u64;
        let mut state = self.state.lock();
        for records in state.values_mut() {
            let before = records.len();
            records.retain(|record| !record.expired(self.ttl, now));
            removed += (before - records.len()) as u64;
        }
        state.retain(|_, records| !records.is_empty());
        Ok(removed)
    }

    async fn pending(&self) -> Result<u64, QueueError> {
        let now = now_millis();
        let state = self.state.lock();
        Ok(state
            .values()
            .flatten()
            .filter(|record| record.eligible(self.ttl, now))
            .count() as u64)
    }
}
