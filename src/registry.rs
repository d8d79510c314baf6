//! Connection registry: the sole source of truth for which agents are live.
//!
//! Maps each agent identity to at most one active session handle. A new
//! registration for an already-connected identity supersedes the prior
//! session; unregistration is compare-and-remove on the session id so a
//! stale disconnect can never evict a newer session.
//!
//! Nothing here is persisted. The registry starts empty and is torn down by
//! closing all sessions at shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, Notify};
use uuid::Uuid;

use crate::types::{AgentId, Envelope};

/// Outbound channel capacity per session. A full channel means the client
/// is not draining its socket; pushes then hit the push timeout and fall
/// back to the offline queue.
const SESSION_OUTBOUND_CAPACITY: usize = 64;

/// An envelope push awaiting transport confirmation from the session's
/// writer task.
#[derive(Debug)]
pub struct SessionPush {
    pub envelope: Envelope,
    /// Resolved `true` once the frame is written to the transport.
    pub done: oneshot::Sender<bool>,
}

/// Errors from pushing to a live session. All recoverable: the router
/// converts them into offline-queue fallback.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("session closed")]
    Closed,
    #[error("push timed out")]
    Timeout,
    #[error("transport write failed")]
    Transport,
}

/// Handle to one live session: the binding between an agent identity and
/// its connected transport. Cloneable; all clones refer to the same session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session_id: Uuid,
    agent_id: AgentId,
    outbound: mpsc::Sender<SessionPush>,
    closed: Arc<Notify>,
}

impl SessionHandle {
    /// Create a handle and the receiving end its writer task will drain.
    pub fn channel(agent_id: AgentId) -> (Self, mpsc::Receiver<SessionPush>) {
        let (tx, rx) = mpsc::channel(SESSION_OUTBOUND_CAPACITY);
        let handle = Self {
            session_id: Uuid::new_v4(),
            agent_id,
            outbound: tx,
            closed: Arc::new(Notify::new()),
        };
        (handle, rx)
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Push an envelope to the session and wait for transport confirmation.
    ///
    /// The whole exchange is bounded by `timeout`: a slow or stuck client
    /// surfaces as [`PushError::Timeout`], never as an indefinite stall.
    pub async fn push(&self, envelope: Envelope, timeout: Duration) -> Result<(), PushError> {
        let (done_tx, done_rx) = oneshot::channel();
        let push = SessionPush {
            envelope,
            done: done_tx,
        };

        let exchange = async {
            self.outbound
                .send(push)
                .await
                .map_err(|_| PushError::Closed)?;
            match done_rx.await {
                Ok(true) => Ok(()),
                Ok(false) | Err(_) => Err(PushError::Transport),
            }
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(PushError::Timeout),
        }
    }

    /// Signal the session loop to terminate (supersession, sweep, shutdown).
    pub fn close(&self) {
        self.closed.notify_waiters();
        self.closed.notify_one();
    }

    /// Resolves when [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.closed.notified().await;
    }
}

struct LiveSession {
    handle: SessionHandle,
    last_heartbeat: Instant,
}

/// Process-wide map from agent identity to its single live session.
///
/// The lock is held only for map operations, never across network I/O, so
/// a slow push on one connection cannot block registry visibility.
pub struct ConnectionRegistry {
    state: RwLock<HashMap<AgentId, LiveSession>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(HashMap::new()),
        }
    }

    /// Install `handle` as the sole live session for its agent.
    ///
    /// Returns the superseded handle, if any, so the caller can close it.
    pub fn register(&self, handle: SessionHandle) -> Option<SessionHandle> {
        let agent_id = handle.agent_id().clone();
        let mut state = self.state.write();
        state
            .insert(
                agent_id,
                LiveSession {
                    handle,
                    last_heartbeat: Instant::now(),
                },
            )
            .map(|prev| prev.handle)
    }

    /// Remove the mapping only if the registered session id matches.
    ///
    /// Returns `false` for both "not found" and "stale session id"; a stale
    /// unregister is the expected outcome of a quick reconnect race, not an
    /// error.
    pub fn unregister(&self, agent_id: &AgentId, session_id: Uuid) -> bool {
        let mut state = self.state.write();
        match state.get(agent_id) {
            Some(live) if live.handle.session_id() == session_id => {
                state.remove(agent_id);
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, agent_id: &AgentId) -> Option<SessionHandle> {
        self.state.read().get(agent_id).map(|live| live.handle.clone())
    }

    /// Refresh the liveness timestamp for an agent. No-op if not registered.
    pub fn touch_heartbeat(&self, agent_id: &AgentId) {
        if let Some(live) = self.state.write().get_mut(agent_id) {
            live.last_heartbeat = Instant::now();
        }
    }

    /// Remove sessions whose heartbeat age exceeds `ping_timeout`, returning
    /// their handles for the caller to close.
    ///
    /// Eviction goes through the same compare-and-remove path as explicit
    /// disconnects, so a session that reconnected between the expiry scan
    /// and the removal survives.
    pub fn sweep_expired(&self, ping_timeout: Duration) -> Vec<SessionHandle> {
        let expired: Vec<(AgentId, SessionHandle)> = {
            let state = self.state.read();
            state
                .iter()
                .filter(|(_, live)| live.last_heartbeat.elapsed() > ping_timeout)
                .map(|(agent_id, live)| (agent_id.clone(), live.handle.clone()))
                .collect()
        };

        expired
            .into_iter()
            .filter(|(agent_id, handle)| self.unregister(agent_id, handle.session_id()))
            .map(|(_, handle)| handle)
            .collect()
    }

    /// Remove and return every live session (shutdown teardown).
    pub fn close_all(&self) -> Vec<SessionHandle> {
        let mut state = self.state.write();
        state.drain().map(|(_, live)| live.handle).collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().is_empty()
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.state.read().keys().cloned().collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::Intent;

    fn make_handle(agent: &str) -> (SessionHandle, mpsc::Receiver<SessionPush>) {
        SessionHandle::channel(AgentId::from(agent))
    }

    fn make_envelope(to: &str) -> Envelope {
        Envelope::new(
            AgentId::from("sender"),
            AgentId::from(to),
            Intent::Inform,
            b"ct".to_vec(),
        )
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = make_handle("a");
        let session_id = handle.session_id();

        assert!(registry.register(handle).is_none());
        assert_eq!(registry.len(), 1);

        let found = registry.lookup(&AgentId::from("a")).unwrap();
        assert_eq!(found.session_id(), session_id);
        assert!(registry.lookup(&AgentId::from("b")).is_none());
    }

    #[test]
    fn test_supersession_returns_previous_handle() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = make_handle("a");
        let (second, _rx2) = make_handle("a");
        let first_id = first.session_id();
        let second_id = second.session_id();

        registry.register(first);
        let prev = registry.register(second).unwrap();
        assert_eq!(prev.session_id(), first_id);

        // first handle no longer reachable
        let found = registry.lookup(&AgentId::from("a")).unwrap();
        assert_eq!(found.session_id(), second_id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_stale_unregister_is_noop() {
        let registry = ConnectionRegistry::new();
        let (old, _rx1) = make_handle("a");
        let (new, _rx2) = make_handle("a");
        let old_id = old.session_id();
        let new_id = new.session_id();

        // old registers, then new supersedes, then old's disconnect arrives late
        registry.register(old);
        registry.register(new);
        let removed = registry.unregister(&AgentId::from("a"), old_id);
        assert!(!removed, "stale unregister must be a no-op");

        let found = registry.lookup(&AgentId::from("a")).unwrap();
        assert_eq!(found.session_id(), new_id);
    }

    #[test]
    fn test_matching_unregister_removes() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = make_handle("a");
        let session_id = handle.session_id();
        registry.register(handle);

        assert!(registry.unregister(&AgentId::from("a"), session_id));
        assert!(registry.lookup(&AgentId::from("a")).is_none());

        // second call: absence, still not an error
        assert!(!registry.unregister(&AgentId::from("a"), session_id));
    }

    #[test]
    fn test_sweep_evicts_stale_sessions() {
        let registry = ConnectionRegistry::new();
        let (stale, _rx1) = make_handle("a");
        registry.register(stale);

        std::thread::sleep(Duration::from_millis(5));
        let evicted = registry.sweep_expired(Duration::from_millis(1));
        assert_eq!(evicted.len(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_sweep_spares_fresh_heartbeat() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = make_handle("a");
        registry.register(handle);

        std::thread::sleep(Duration::from_millis(5));
        registry.touch_heartbeat(&AgentId::from("a"));
        let evicted = registry.sweep_expired(Duration::from_millis(60_000));
        assert!(evicted.is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_close_all_drains_registry() {
        let registry = ConnectionRegistry::new();
        let (a, _rx1) = make_handle("a");
        let (b, _rx2) = make_handle("b");
        registry.register(a);
        registry.register(b);

        let closed = registry.close_all();
        assert_eq!(closed.len(), 2);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_push_confirmed_by_writer() {
        let (handle, mut rx) = make_handle("a");

        // simulated writer task: confirm whatever arrives
        tokio::spawn(async move {
            while let Some(push) = rx.recv().await {
                let _ = push.done.send(true);
            }
        });

        let result = handle
            .push(make_envelope("a"), Duration::from_secs(1))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_push_fails_when_receiver_dropped() {
        let (handle, rx) = make_handle("a");
        drop(rx);

        let result = handle
            .push(make_envelope("a"), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(PushError::Closed)));
    }

    #[tokio::test]
    async fn test_push_times_out_on_stuck_writer() {
        let (handle, _rx) = make_handle("a");
        // receiver alive but never confirming
        let result = handle
            .push(make_envelope("a"), Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(PushError::Timeout)));
    }

    #[tokio::test]
    async fn test_push_transport_failure() {
        let (handle, mut rx) = make_handle("a");

        tokio::spawn(async move {
            while let Some(push) = rx.recv().await {
                let _ = push.done.send(false);
            }
        });

        let result = handle
            .push(make_envelope("a"), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(PushError::Transport)));
    }

    #[tokio::test]
    async fn test_close_unblocks_waiter() {
        let (handle, _rx) = make_handle("a");
        let waiter = handle.clone();
        let task = tokio::spawn(async move {
            waiter.closed().await;
        });
        // let the waiter park first
        tokio::task::yield_now().await;
        handle.close();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("close should unblock the waiter")
            .unwrap();
    }
}
