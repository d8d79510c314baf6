//! Offline queue: durable store of envelopes awaiting delivery.
//!
//! A message is eligible for delivery iff `!delivered && age < ttl`.
//! `drain` never mutates delivered state; marking is a separate step so a
//! crash mid-drain cannot lose messages. `mark_delivered` is idempotent.

pub mod memory;
pub mod redb;

use async_trait::async_trait;
use uuid::Uuid;

use crate::types::{AgentId, Envelope, QueuedMessage};

pub use memory::MemoryQueue;
pub use redb::RedbQueue;

/// Durable offline-message store, keyed by recipient.
///
/// The delivery router is the sole writer; implementations only need to be
/// consistent per call, not across calls (the router serializes per-recipient
/// operation sequences itself).
#[async_trait]
pub trait OfflineQueue: Send + Sync {
    /// Append an undelivered record for `envelope.to`.
    async fn enqueue(&self, envelope: Envelope) -> Result<(), QueueError>;

    /// All eligible (non-expired, non-delivered) records for `recipient`, in
    /// `enqueued_at` ascending order. Does not mutate delivered state.
    async fn drain(&self, recipient: &AgentId) -> Result<Vec<QueuedMessage>, QueueError>;

    /// Mark a record delivered. Idempotent; unknown ids are a no-op.
    async fn mark_delivered(&self, message_id: Uuid) -> Result<(), QueueError>;

    /// Remove records older than the TTL regardless of delivered state.
    /// Returns the number removed.
    async fn purge_expired(&self) -> Result<u64, QueueError>;

    /// Count of currently eligible records across all recipients.
    async fn pending(&self) -> Result<u64, QueueError>;
}

/// Errors from offline-queue operations. `Persistence` means the durable
/// store is unavailable: the caller must surface delivery as uncertain, not
/// claim success.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("persistence failure: {0}")]
    Persistence(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("storage task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
