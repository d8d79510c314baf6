//! Transport layer: length-prefix framed JSON over TCP.
//!
//! Frame format: `[4 bytes: payload length (big-endian u32)] [payload: JSON-encoded Frame]`.

pub mod codec;

use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

pub use codec::{CodecError, Frame, RelayCodec};

/// Default maximum frame size: 1 MB (1,048,576 bytes).
pub const MAX_FRAME_BYTES: u32 = 1_048_576;

/// TCP listener for accepting incoming agent connections.
pub struct RelayListener {
    listener: TcpListener,
}

impl RelayListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self, io::Error> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, io::Error> {
        self.listener.local_addr()
    }

    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), io::Error> {
        self.listener.accept().await
    }
}

/// Client-side connect, wrapped in the relay codec. Used by agent-side
/// bindings and the integration tests.
pub async fn connect(
    addr: SocketAddr,
    max_frame_bytes: u32,
) -> Result<Framed<TcpStream, RelayCodec>, io::Error> {
    let stream = TcpStream::connect(addr).await?;
    Ok(Framed::new(
        stream,
        RelayCodec::with_max_frame_bytes(max_frame_bytes),
    ))
}
