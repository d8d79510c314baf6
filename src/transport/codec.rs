use std::io;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

use crate::types::{AgentId, DeliveryOutcome, Envelope};

use super::MAX_FRAME_BYTES;

/// One wire frame, tagged by `type` in the JSON body.
///
/// The handshake is `hello` → `welcome`; after that, both directions carry
/// `envelope`, `receipt`, and `heartbeat` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// First frame on a connection: the agent identifies itself.
    Hello {
        agent_id: AgentId,
        /// Opaque credential bytes, base64 on the wire. Interpretation is up
        /// to the configured authenticator.
        #[serde(default, with = "crate::types::base64_bytes")]
        credential: Vec<u8>,
    },
    /// Handshake acceptance, carrying the server-assigned session id.
    Welcome { session_id: Uuid },
    /// A routed message, in either direction.
    Envelope { envelope: Envelope },
    /// Relay-to-sender acknowledgement of a routed envelope.
    Receipt {
        message_id: Uuid,
        outcome: DeliveryOutcome,
    },
    /// Client liveness ping. The relay refreshes the session timestamp and
    /// sends nothing back.
    Heartbeat,
}

/// Errors from encoding or decoding frames.
///
/// `Protocol` is recoverable: the offending frame's bytes are already
/// consumed, so the stream stays aligned and the session loop can keep
/// reading. `Io` and `FrameTooLarge` are not; the connection must be torn
/// down.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },
    #[error("malformed frame: {0}")]
    Protocol(String),
}

impl CodecError {
    /// Whether the connection can continue reading after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CodecError::Protocol(_))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RelayCodec {
    max_frame_bytes: u32,
}

impl Default for RelayCodec {
    fn default() -> Self {
        Self {
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }
}

impl RelayCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame_bytes(max_frame_bytes: u32) -> Self {
        Self { max_frame_bytes }
    }
}

impl Decoder for RelayCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if len > self.max_frame_bytes {
            return Err(CodecError::FrameTooLarge {
                size: len,
                max: self.max_frame_bytes,
            });
        }

        let frame_len = 4usize + len as usize;
        if src.len() < frame_len {
            return Ok(None);
        }

        // Consume the whole frame before parsing, so a parse failure leaves
        // the buffer aligned at the next frame.
        src.advance(4);
        let payload = src.split_to(len as usize);

        serde_json::from_slice(&payload)
            .map(Some)
            .map_err(|e| CodecError::Protocol(format!("JSON decode error: {e}")))
    }
}

impl Encoder<Frame> for RelayCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&item)
            .map_err(|e| CodecError::Protocol(format!("JSON encode error: {e}")))?;

        let len: u32 = payload
            .len()
            .try_into()
            .map_err(|_| CodecError::FrameTooLarge {
                size: u32::MAX,
                max: self.max_frame_bytes,
            })?;
        if len > self.max_frame_bytes {
            return Err(CodecError::FrameTooLarge {
                size: len,
                max: self.max_frame_bytes,
            });
        }

        dst.reserve(4 + payload.len());
        dst.put_u32(len);
        dst.put_slice(&payload);
        Ok(())
    }
}
