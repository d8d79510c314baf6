//! Capability ports consumed from external collaborators.
//!
//! The relay core never implements cryptography. Signature construction and
//! verification, payload encryption, key lookup, and connect authentication
//! are injected behind these traits; the core depends on their contracts only.

use crate::types::{AgentId, Envelope};

/// Verifies an envelope's detached signature against the sender's known key.
///
/// The router drops any envelope this rejects: it is never routed, queued,
/// or exposed to a recipient.
pub trait EnvelopeVerifier: Send + Sync {
    fn verify(&self, envelope: &Envelope) -> bool;
}

/// Produces a detached signature over [`Envelope::signable_bytes`].
/// Used by sending agents, not by the relay itself.
pub trait EnvelopeSigner: Send + Sync {
    fn sign(&self, envelope: &Envelope) -> Vec<u8>;
}

/// Asymmetric payload confidentiality. Client-side only: the relay routes
/// opaque ciphertext and never holds either capability.
pub trait PayloadCipher: Send + Sync {
    fn encrypt(&self, recipient: &AgentId, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn decrypt(&self, sender: &AgentId, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Identity directory lookup.
pub trait KeyDirectory: Send + Sync {
    fn lookup_pubkey(&self, agent_id: &AgentId) -> Option<Vec<u8>>;
}

/// Authenticates the `hello` handshake credential before a session is
/// registered. The mechanism (wallet signature, token, mTLS) is external.
pub trait ConnectAuthenticator: Send + Sync {
    fn authenticate(&self, agent_id: &AgentId, credential: &[u8]) -> bool;
}

/// Errors surfaced by injected cipher implementations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("unknown key for agent: {0}")]
    UnknownKey(AgentId),
    #[error("cipher failure: {0}")]
    Cipher(String),
}

/// Permissive implementation of the verification and authentication ports.
///
/// Accepts every envelope and every handshake. Development and test use
/// only; a production relay must inject real implementations.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl EnvelopeVerifier for AcceptAll {
    fn verify(&self, _envelope: &Envelope) -> bool {
        true
    }
}

impl ConnectAuthenticator for AcceptAll {
    fn authenticate(&self, _agent_id: &AgentId, _credential: &[u8]) -> bool {
        true
    }
}
