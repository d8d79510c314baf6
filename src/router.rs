//! Delivery router - the orchestration core of the relay.
//!
//! On an inbound send the router verifies the envelope, pushes it to the
//! recipient's live session if one exists, and otherwise (or on push
//! failure) enqueues it durably. On connect it registers the session,
//! supersedes any prior one, and drains queued messages to the new session
//! in enqueue order.
//!
//! The router is the sole writer of session and queued-message state; the
//! registry and queue are passive stores it mutates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::crypto::EnvelopeVerifier;
use crate::queue::{OfflineQueue, QueueError};
use crate::registry::{ConnectionRegistry, SessionHandle};
use crate::types::{AgentId, DeliveryOutcome, Envelope};

/// Errors surfaced by routing operations.
///
/// Transport push failures are not here: they are recoverable and converted
/// into offline-queue fallback internally.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// Signature verification failed. The envelope is dropped: never routed,
    /// never queued, never exposed to the recipient.
    #[error("invalid envelope: signature verification failed")]
    InvalidEnvelope,
    /// The durable store is unavailable. Delivery state is unknown; the
    /// sender must be told so, never given a false positive.
    #[error(transparent)]
    Persistence(#[from] QueueError),
}

pub struct DeliveryRouter {
    registry: Arc<ConnectionRegistry>,
    queue: Arc<dyn OfflineQueue>,
    verifier: Arc<dyn EnvelopeVerifier>,
    push_timeout: Duration,
    /// Per-recipient serialization of push/enqueue/drain sequences. Keyed
    /// striping keeps unrelated agents' traffic independent.
    recipient_locks: Mutex<HashMap<AgentId, Arc<tokio::sync::Mutex<()>>>>,
}

impl DeliveryRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        queue: Arc<dyn OfflineQueue>,
        verifier: Arc<dyn EnvelopeVerifier>,
        push_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            queue,
            verifier,
            push_timeout,
            recipient_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<dyn OfflineQueue> {
        &self.queue
    }

    fn recipient_lock(&self, recipient: &AgentId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.recipient_locks.lock();
        locks
            .entry(recipient.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop a recipient's lock entry once nothing holds or waits on it.
    ///
    /// Entries are only handed out under the map lock, so a strong count of
    /// one (the map's own reference) means no task can be about to use it.
    /// Without this the map would grow with every distinct recipient ever
    /// addressed.
    fn release_recipient_lock(&self, recipient: &AgentId) {
        let mut locks = self.recipient_locks.lock();
        if let Some(lock) = locks.get(recipient) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(recipient);
            }
        }
    }

    /// Route an envelope from a sending agent.
    ///
    /// Returns [`DeliveryOutcome::DeliveredLive`] after a confirmed push to
    /// the recipient's live session, [`DeliveryOutcome::Queued`] after a
    /// durable enqueue, or an error. A failed or timed-out push falls
    /// through to the queue; envelopes are never silently dropped.
    pub async fn route_outbound(&self, envelope: Envelope) -> Result<DeliveryOutcome, RouteError> {
        if !self.verifier.verify(&envelope) {
            tracing::warn!(
                message_id = %envelope.message_id,
                from = %envelope.from,
                "dropped envelope: invalid signature"
            );
            return Err(RouteError::InvalidEnvelope);
        }

        let recipient = envelope.to.clone();
        let result = self.deliver_serialized(envelope).await;
        self.release_recipient_lock(&recipient);
        result
    }

    async fn deliver_serialized(&self, envelope: Envelope) -> Result<DeliveryOutcome, RouteError> {
        let lock = self.recipient_lock(&envelope.to);
        let _guard = lock.lock().await;

        if let Some(handle) = self.registry.lookup(&envelope.to) {
            match handle.push(envelope.clone(), self.push_timeout).await {
                Ok(()) => {
                    tracing::debug!(
                        message_id = %envelope.message_id,
                        to = %envelope.to,
                        "delivered live"
                    );
                    return Ok(DeliveryOutcome::DeliveredLive);
                }
                Err(err) => {
                    tracing::warn!(
                        message_id = %envelope.message_id,
                        to = %envelope.to,
                        error = %err,
                        "live push failed, falling back to offline queue"
                    );
                }
            }
        }

        self.queue.enqueue(envelope).await?;
        Ok(DeliveryOutcome::Queued)
    }

    /// Register a freshly authenticated session and drain its queued
    /// messages to it.
    ///
    /// If a prior session exists for the same agent it is superseded: its
    /// loop is signalled to terminate before the drain begins. Draining
    /// happens after registration so an envelope enqueued in between is
    /// either picked up here or delivered live by `route_outbound` itself.
    ///
    /// Returns the number of queued messages delivered. A push failure
    /// stops the drain; remaining records stay queued, in order, for the
    /// next connect.
    pub async fn on_connect(&self, handle: SessionHandle) -> Result<usize, RouteError> {
        let agent_id = handle.agent_id().clone();

        if let Some(previous) = self.registry.register(handle.clone()) {
            tracing::info!(
                agent_id = %agent_id,
                superseded = %previous.session_id(),
                "session superseded by new connection"
            );
            previous.close();
        }

        let result = self.drain_serialized(&handle, &agent_id).await;
        self.release_recipient_lock(&agent_id);
        result
    }

    async fn drain_serialized(
        &self,
        handle: &SessionHandle,
        agent_id: &AgentId,
    ) -> Result<usize, RouteError> {
        let lock = self.recipient_lock(agent_id);
        let _guard = lock.lock().await;

        let mut delivered = 0usize;
        for record in self.queue.drain(agent_id).await? {
            let message_id = record.envelope.message_id;
            match handle.push(record.envelope, self.push_timeout).await {
                Ok(()) => {
                    self.queue.mark_delivered(message_id).await?;
                    delivered += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        agent_id = %agent_id,
                        message_id = %message_id,
                        error = %err,
                        "drain push failed, leaving remaining messages queued"
                    );
                    break;
                }
            }
        }

        if delivered > 0 {
            tracing::info!(agent_id = %agent_id, delivered, "drained offline queue");
        }
        Ok(delivered)
    }
}

/// Background liveness and expiry sweeper.
///
/// Evicts sessions whose heartbeat age exceeds `ping_timeout` (through the
/// registry's compare-and-remove path) and purges expired queue records.
pub fn spawn_sweeper(
    registry: Arc<ConnectionRegistry>,
    queue: Arc<dyn OfflineQueue>,
    interval: Duration,
    ping_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;

            for handle in registry.sweep_expired(ping_timeout) {
                tracing::info!(
                    agent_id = %handle.agent_id(),
                    session_id = %handle.session_id(),
                    "evicting session: heartbeat timeout"
                );
                handle.close();
            }

            match queue.purge_expired().await {
                Ok(0) => {}
                Ok(removed) => tracing::info!(removed, "purged expired queued messages"),
                Err(err) => tracing::warn!(error = %err, "queue purge failed"),
            }
        }
    })
}
