//! Core message types for the AgentLink relay.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Opaque agent identifier. Uniqueness and ownership are handled by an
/// external directory; the relay treats it as a routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Message intent, fixed enumeration shared by sender and recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Request,
    Inform,
    Negotiate,
    Confirm,
    Escalate,
}

/// A signed message envelope.
///
/// `payload` is opaque ciphertext produced by the sender; the relay routes
/// it without ever seeing plaintext. The signature covers every other field
/// (see [`Envelope::signable_bytes`]) and is immutable once set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique per envelope, assigned sender-side. Recipients deduplicate on it.
    pub message_id: Uuid,
    pub from: AgentId,
    pub to: AgentId,
    pub intent: Intent,
    /// Ciphertext bytes, base64 on the wire.
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    /// Optional string-keyed scalar metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, JsonValue>,
    /// Detached signature over all other fields, base64 on the wire.
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
    /// Creation time, unix milliseconds, assigned sender-side.
    pub created_at: u64,
}

impl Envelope {
    /// Create an unsigned envelope with a fresh `message_id` and timestamp.
    pub fn new(from: AgentId, to: AgentId, intent: Intent, payload: Vec<u8>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            from,
            to,
            intent,
            payload,
            metadata: BTreeMap::new(),
            signature: Vec::new(),
            created_at: now_millis(),
        }
    }

    /// Bytes covered by the signature: canonical JSON of every field except
    /// `signature`, in fixed order. `metadata` is a `BTreeMap` so key order
    /// is deterministic.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let signable = (
            &self.message_id,
            &self.from,
            &self.to,
            &self.intent,
            Base64Display(&self.payload),
            &self.metadata,
            self.created_at,
        );
        // Infallible: every element is a string, finite number, or
        // string-keyed map of `serde_json::Value` (which cannot hold
        // non-finite numbers), so `to_vec` has no failure path here.
        serde_json::to_vec(&signable).unwrap_or_default()
    }
}

/// Serializes a byte slice as a base64 string (signable encoding helper).
struct Base64Display<'a>(&'a [u8]);

impl Serialize for Base64Display<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use base64::Engine as _;
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(self.0))
    }
}

pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Outcome of routing an envelope, reported back to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// Pushed to the recipient's live session and confirmed by the transport.
    DeliveredLive,
    /// Durably queued for a recipient with no live session.
    Queued,
    /// Persistence failed; delivery state is unknown. Never reported as success.
    Uncertain,
}

/// Durable record wrapping an envelope awaiting offline delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub envelope: Envelope,
    pub delivered: bool,
    /// Enqueue time, unix milliseconds. Expiry is measured from here.
    pub enqueued_at: u64,
}

impl QueuedMessage {
    /// Eligible for delivery iff not delivered and younger than the TTL.
    pub fn eligible(&self, ttl: Duration, now: u64) -> bool {
        !self.delivered && !self.expired(ttl, now)
    }

    pub fn expired(&self, ttl: Duration, now: u64) -> bool {
        now.saturating_sub(self.enqueued_at) >= ttl.as_millis() as u64
    }
}

/// Current time as unix milliseconds.
pub(crate) fn now_millis() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => match u64::try_from(duration.as_millis()) {
            Ok(millis) => millis,
            Err(_) => u64::MAX,
        },
        Err(_) => 0,
    }
}
