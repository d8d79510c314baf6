//! RelayRuntime - lifecycle manager for a relay instance.
//!
//! Wires the registry, offline queue, and router together, runs the TCP
//! accept loop and the background sweeper, and tears everything down on
//! shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::RelayConfig;
use crate::crypto::{ConnectAuthenticator, EnvelopeVerifier};
use crate::queue::{MemoryQueue, OfflineQueue, QueueError, RedbQueue};
use crate::registry::ConnectionRegistry;
use crate::router::{spawn_sweeper, DeliveryRouter};
use crate::session::handle_connection;
use crate::transport::RelayListener;

#[derive(Debug, Error)]
pub enum RelayRuntimeError {
    #[error("listener error: {0}")]
    Listener(#[from] std::io::Error),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("relay already started")]
    AlreadyStarted,
}

/// Point-in-time operational counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Agents with a live registered session.
    pub active_agents: usize,
    /// Queued messages currently eligible for delivery.
    pub pending_messages: u64,
}

pub struct RelayRuntime {
    config: RelayConfig,
    router: Arc<DeliveryRouter>,
    authenticator: Arc<dyn ConnectAuthenticator>,
    local_addr: Option<SocketAddr>,
    task_handles: Vec<JoinHandle<()>>,
    started: bool,
}

impl RelayRuntime {
    /// Build a runtime with the queue selected by `config.queue_path`:
    /// redb-backed when set, in-memory otherwise.
    pub fn new(
        config: RelayConfig,
        verifier: Arc<dyn EnvelopeVerifier>,
        authenticator: Arc<dyn ConnectAuthenticator>,
    ) -> Result<Self, RelayRuntimeError> {
        let queue: Arc<dyn OfflineQueue> = match &config.queue_path {
            Some(path) => Arc::new(RedbQueue::open(path, config.message_ttl())?),
            None => Arc::new(MemoryQueue::new(config.message_ttl())),
        };
        Ok(Self::with_queue(config, queue, verifier, authenticator))
    }

    /// Build a runtime around an externally-constructed queue.
    pub fn with_queue(
        config: RelayConfig,
        queue: Arc<dyn OfflineQueue>,
        verifier: Arc<dyn EnvelopeVerifier>,
        authenticator: Arc<dyn ConnectAuthenticator>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(DeliveryRouter::new(
            registry,
            queue,
            verifier,
            config.push_timeout(),
        ));
        Self {
            config,
            router,
            authenticator,
            local_addr: None,
            task_handles: Vec::new(),
            started: false,
        }
    }

    /// Bind the listener and start the accept loop and sweeper.
    ///
    /// Returns the bound address (useful with a `:0` port in tests).
    pub async fn start(&mut self) -> Result<SocketAddr, RelayRuntimeError> {
        if self.started {
            return Err(RelayRuntimeError::AlreadyStarted);
        }

        let listener = RelayListener::bind(self.config.listen_tcp).await?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);
        tracing::info!(addr = %local_addr, "relay listening");

        let router = self.router.clone();
        let authenticator = self.authenticator.clone();
        let max_frame_bytes = self.config.max_frame_bytes;
        let accept_handle = tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                tracing::debug!(peer = %peer, "accepted connection");
                let router = router.clone();
                let authenticator = authenticator.clone();
                tokio::spawn(async move {
                    if let Err(err) =
                        handle_connection(stream, max_frame_bytes, router, authenticator).await
                    {
                        tracing::warn!(peer = %peer, error = %err, "session ended with error");
                    }
                });
            }
        });
        self.task_handles.push(accept_handle);

        self.task_handles.push(spawn_sweeper(
            self.router.registry().clone(),
            self.router.queue().clone(),
            self.config.heartbeat_interval(),
            self.config.ping_timeout(),
        ));

        self.started = true;
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn router(&self) -> &Arc<DeliveryRouter> {
        &self.router
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub async fn stats(&self) -> Result<RelayStats, QueueError> {
        Ok(RelayStats {
            active_agents: self.router.registry().len(),
            pending_messages: self.router.queue().pending().await?,
        })
    }

    /// Stop the accept loop and sweeper and close every live session.
    pub fn shutdown(&mut self) {
        for handle in self.task_handles.drain(..) {
            handle.abort();
        }
        for session in self.router.registry().close_all() {
            session.close();
        }
        self.started = false;
        self.local_addr = None;
    }
}

impl Drop for RelayRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
