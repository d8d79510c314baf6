//! Recipient-side intent dispatch.
//!
//! An agent receiving envelopes registers handlers per intent, plus optional
//! catch-all handlers that see every message. The dispatcher verifies each
//! envelope and decrypts its payload before any handler runs; a message that
//! fails either step reaches no handler.

use std::collections::HashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::crypto::{CryptoError, EnvelopeVerifier, PayloadCipher};
use crate::types::{AgentId, Envelope, Intent};

/// A verified, decrypted message as seen by handlers.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub message_id: Uuid,
    pub from: AgentId,
    pub intent: Intent,
    /// Decrypted plaintext.
    pub payload: Vec<u8>,
    pub metadata: BTreeMap<String, JsonValue>,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: InboundMessage);
}

/// Blanket impl so plain async closures can be registered via
/// [`IntentDispatcher::on_intent_fn`].
struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(InboundMessage) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ()> + Send,
{
    async fn handle(&self, message: InboundMessage) {
        (self.0)(message).await;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid envelope: signature verification failed")]
    InvalidEnvelope,
    #[error("payload decryption failed: {0}")]
    Decrypt(#[from] CryptoError),
}

/// Routes verified, decrypted messages to registered handlers.
///
/// Handlers for the message's intent run first, then catch-all handlers,
/// each in registration order.
pub struct IntentDispatcher {
    verifier: Arc<dyn EnvelopeVerifier>,
    cipher: Arc<dyn PayloadCipher>,
    by_intent: RwLock<HashMap<Intent, Vec<Arc<dyn MessageHandler>>>>,
    catch_all: RwLock<Vec<Arc<dyn MessageHandler>>>,
}

impl IntentDispatcher {
    pub fn new(verifier: Arc<dyn EnvelopeVerifier>, cipher: Arc<dyn PayloadCipher>) -> Self {
        Self {
            verifier,
            cipher,
            by_intent: RwLock::new(HashMap::new()),
            catch_all: RwLock::new(Vec::new()),
        }
    }

    pub fn on_intent(&self, intent: Intent, handler: Arc<dyn MessageHandler>) {
        self.by_intent.write().entry(intent).or_default().push(handler);
    }

    pub fn on_any(&self, handler: Arc<dyn MessageHandler>) {
        self.catch_all.write().push(handler);
    }

    /// Register an async closure for one intent.
    pub fn on_intent_fn<F, Fut>(&self, intent: Intent, handler: F)
    where
        F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.on_intent(intent, Arc::new(FnHandler(handler)));
    }

    /// Register an async closure for every intent.
    pub fn on_any_fn<F, Fut>(&self, handler: F)
    where
        F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.on_any(Arc::new(FnHandler(handler)));
    }

    /// Verify, decrypt, and dispatch one envelope.
    ///
    /// Returns the number of handlers invoked. Zero is not an error: a
    /// message with no registered handler is simply dropped after
    /// verification.
    pub async fn dispatch(&self, envelope: Envelope) -> Result<usize, DispatchError> {
        if !self.verifier.verify(&envelope) {
            tracing::warn!(
                message_id = %envelope.message_id,
                from = %envelope.from,
                "dropped inbound envelope: invalid signature"
            );
            return Err(DispatchError::InvalidEnvelope);
        }

        let payload = self.cipher.decrypt(&envelope.from, &envelope.payload)?;
        let message = InboundMessage {
            message_id: envelope.message_id,
            from: envelope.from,
            intent: envelope.intent,
            payload,
            metadata: envelope.metadata,
        };

        let handlers: Vec<Arc<dyn MessageHandler>> = {
            let by_intent = self.by_intent.read();
            let catch_all = self.catch_all.read();
            by_intent
                .get(&message.intent)
                .into_iter()
                .flatten()
                .chain(catch_all.iter())
                .cloned()
                .collect()
        };

        for handler in &handlers {
            handler.handle(message.clone()).await;
        }
        Ok(handlers.len())
    }
}
