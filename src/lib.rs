#![cfg_attr(test, allow(clippy::panic))]
//! AgentLink relay: end-to-end encrypted message relay for autonomous agents.
//!
//! Agents exchange signed envelopes carrying opaque ciphertext payloads.
//! The relay routes each envelope to the recipient's live session when one
//! exists and falls back to a durable offline queue otherwise; queued
//! messages are drained, in order, when the recipient reconnects. The relay
//! never holds key material: signature verification, payload encryption,
//! and connect authentication are injected behind the ports in [`crypto`].

pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod queue;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod session;
pub mod transport;
pub mod types;

pub use config::RelayConfig;
pub use crypto::{
    AcceptAll, ConnectAuthenticator, CryptoError, EnvelopeSigner, EnvelopeVerifier, KeyDirectory,
    PayloadCipher,
};
pub use dispatch::{DispatchError, InboundMessage, IntentDispatcher, MessageHandler};
pub use queue::{MemoryQueue, OfflineQueue, QueueError, RedbQueue};
pub use registry::{ConnectionRegistry, PushError, SessionHandle, SessionPush};
pub use router::{spawn_sweeper, DeliveryRouter, RouteError};
pub use runtime::{RelayRuntime, RelayRuntimeError, RelayStats};
pub use session::{handle_connection, SessionError};
pub use transport::codec::{CodecError, Frame, RelayCodec};
pub use transport::{RelayListener, MAX_FRAME_BYTES};
pub use types::{AgentId, DeliveryOutcome, Envelope, Intent, QueuedMessage};
