//! Agent session loop for handling incoming connections.
//!
//! Each accepted connection runs one session:
//! 1. Handshake: read `hello`, authenticate, reply `welcome`
//! 2. Register with the connection registry (superseding any prior session)
//! 3. Drain queued messages to the new session, in order
//! 4. Serve inbound frames until disconnect, supersession, or eviction
//! 5. Unregister (compare-and-remove, so a reconnect race is harmless)
//!
//! Outbound writes go through a dedicated writer task that owns the sink
//! half of the connection; it confirms each router push only after the
//! frame hits the transport.

use std::io;
use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::crypto::ConnectAuthenticator;
use crate::registry::{SessionHandle, SessionPush};
use crate::router::{DeliveryRouter, RouteError};
use crate::transport::codec::{CodecError, Frame, RelayCodec};
use crate::types::{AgentId, DeliveryOutcome};

/// Locally-originated frames (receipts) waiting for the writer task.
const SESSION_FRAME_CAPACITY: usize = 16;

/// Errors that terminate a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("transport error: {0}")]
    Codec(#[from] CodecError),
    #[error("handshake violation: {0}")]
    Handshake(&'static str),
    #[error("authentication rejected for {0}")]
    Unauthorized(AgentId),
}

/// Serve one agent connection to completion.
///
/// Any frame other than `hello` before the handshake closes the connection;
/// after the handshake, malformed frames are logged and skipped while the
/// session keeps reading (the codec consumes their bytes, so the stream
/// stays aligned).
pub async fn handle_connection<S>(
    stream: S,
    max_frame_bytes: u32,
    router: Arc<DeliveryRouter>,
    authenticator: Arc<dyn ConnectAuthenticator>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut framed = Framed::new(stream, RelayCodec::with_max_frame_bytes(max_frame_bytes));

    let (agent_id, credential) = match framed.next().await {
        Some(Ok(Frame::Hello {
            agent_id,
            credential,
        })) => (agent_id, credential),
        Some(Ok(_)) => return Err(SessionError::Handshake("expected hello frame")),
        Some(Err(err)) => return Err(err.into()),
        None => {
            return Err(SessionError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before handshake",
            )))
        }
    };

    if !authenticator.authenticate(&agent_id, &credential) {
        tracing::warn!(agent_id = %agent_id, "rejected connection: authentication failed");
        return Err(SessionError::Unauthorized(agent_id));
    }

    let (handle, push_rx) = SessionHandle::channel(agent_id.clone());
    let session_id = handle.session_id();
    tracing::info!(agent_id = %agent_id, session_id = %session_id, "session established");

    // Welcome goes out on the sink directly, before the writer task takes
    // over, so it always precedes any drained envelope.
    framed
        .send(Frame::Welcome { session_id })
        .await?;

    let (sink, stream) = framed.split();
    let (frame_tx, frame_rx) = mpsc::channel(SESSION_FRAME_CAPACITY);
    let writer = tokio::spawn(writer_task(sink, push_rx, frame_rx));

    // Register and drain after the writer is live; drained pushes need it
    // to confirm transport writes.
    if let Err(err) = router.on_connect(handle.clone()).await {
        tracing::warn!(agent_id = %agent_id, error = %err, "queue drain failed on connect");
    }

    let result = read_loop(stream, &handle, &router, &frame_tx).await;

    // Compare-and-remove: if a newer session superseded us, this is a no-op
    // and the newer registration survives.
    if !router
        .registry()
        .unregister(&agent_id, session_id)
    {
        tracing::debug!(agent_id = %agent_id, session_id = %session_id, "stale unregister skipped");
    }
    drop(frame_tx);
    drop(handle);
    let _ = writer.await;

    tracing::info!(agent_id = %agent_id, session_id = %session_id, "session closed");
    result
}

/// Owns the sink half: serializes router pushes and local receipts onto the
/// transport, confirming each push only after the write succeeds.
async fn writer_task<S>(
    mut sink: SplitSink<Framed<S, RelayCodec>, Frame>,
    mut push_rx: mpsc::Receiver<SessionPush>,
    mut frame_rx: mpsc::Receiver<Frame>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            push = push_rx.recv() => match push {
                Some(push) => {
                    let frame = Frame::Envelope { envelope: push.envelope };
                    let written = sink.send(frame).await.is_ok();
                    let _ = push.done.send(written);
                    if !written {
                        break;
                    }
                }
                None => break,
            },
            frame = frame_rx.recv() => match frame {
                Some(frame) => {
                    if sink.send(frame).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

/// Serve inbound frames until the connection ends or the session is closed
/// (superseded, swept, or shut down).
async fn read_loop<S>(
    mut stream: SplitStream<Framed<S, RelayCodec>>,
    handle: &SessionHandle,
    router: &DeliveryRouter,
    frame_tx: &mpsc::Sender<Frame>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = handle.closed() => return Ok(()),
            next = stream.next() => match next {
                None => return Ok(()),
                Some(Err(err)) if err.is_recoverable() => {
                    tracing::warn!(
                        agent_id = %handle.agent_id(),
                        error = %err,
                        "skipping malformed frame"
                    );
                }
                Some(Err(err)) => return Err(err.into()),
                Some(Ok(frame)) => handle_frame(frame, handle, router, frame_tx).await,
            },
        }
    }
}

async fn handle_frame(
    frame: Frame,
    handle: &SessionHandle,
    router: &DeliveryRouter,
    frame_tx: &mpsc::Sender<Frame>,
) {
    match frame {
        Frame::Envelope { envelope } => {
            let message_id = envelope.message_id;
            let outcome = match router.route_outbound(envelope).await {
                Ok(outcome) => outcome,
                Err(RouteError::InvalidEnvelope) => {
                    // dropped and logged by the router; no receipt for an
                    // envelope that fails verification
                    return;
                }
                Err(RouteError::Persistence(err)) => {
                    tracing::error!(
                        message_id = %message_id,
                        error = %err,
                        "persistence failure, delivery state unknown"
                    );
                    DeliveryOutcome::Uncertain
                }
            };
            let receipt = Frame::Receipt {
                message_id,
                outcome,
            };
            if frame_tx.send(receipt).await.is_err() {
                tracing::debug!(message_id = %message_id, "writer gone, receipt dropped");
            }
        }
        Frame::Heartbeat => {
            router.registry().touch_heartbeat(handle.agent_id());
        }
        Frame::Hello { .. } | Frame::Welcome { .. } | Frame::Receipt { .. } => {
            tracing::warn!(
                agent_id = %handle.agent_id(),
                "ignoring unexpected frame after handshake"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::crypto::AcceptAll;
    use crate::queue::MemoryQueue;
    use crate::registry::ConnectionRegistry;
    use crate::transport::MAX_FRAME_BYTES;
    use crate::types::{Envelope, Intent};
    use bytes::{BufMut, BytesMut};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
    use tokio::task::JoinHandle;
    use tokio_util::codec::Encoder;
    use uuid::Uuid;

    struct RejectAuth;

    impl ConnectAuthenticator for RejectAuth {
        fn authenticate(&self, _agent_id: &AgentId, _credential: &[u8]) -> bool {
            false
        }
    }

    fn make_router() -> Arc<DeliveryRouter> {
        Arc::new(DeliveryRouter::new(
            Arc::new(ConnectionRegistry::new()),
            Arc::new(MemoryQueue::new(Duration::from_secs(60))),
            Arc::new(AcceptAll),
            Duration::from_millis(500),
        ))
    }

    fn make_envelope(from: &str, to: &str) -> Envelope {
        Envelope::new(
            AgentId::from(from),
            AgentId::from(to),
            Intent::Inform,
            b"ciphertext".to_vec(),
        )
    }

    type ClientConn = Framed<DuplexStream, RelayCodec>;

    fn spawn_session(
        router: Arc<DeliveryRouter>,
        authenticator: Arc<dyn ConnectAuthenticator>,
    ) -> (ClientConn, JoinHandle<Result<(), SessionError>>) {
        let (client, server) = duplex(64 * 1024);
        let task = tokio::spawn(handle_connection(
            server,
            MAX_FRAME_BYTES,
            router,
            authenticator,
        ));
        (Framed::new(client, RelayCodec::new()), task)
    }

    async fn handshake(client: &mut ClientConn, agent: &str) -> Uuid {
        client
            .send(Frame::Hello {
                agent_id: AgentId::from(agent),
                credential: Vec::new(),
            })
            .await
            .unwrap();
        match client.next().await.unwrap().unwrap() {
            Frame::Welcome { session_id } => session_id,
            other => panic!("expected welcome, got {other:?}"),
        }
    }

    async fn recv_frame(client: &mut ClientConn) -> Frame {
        tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .expect("decode error")
    }

    #[tokio::test]
    async fn test_handshake_registers_session() {
        let router = make_router();
        let (mut client, _task) = spawn_session(router.clone(), Arc::new(AcceptAll));

        let session_id = handshake(&mut client, "agent-a").await;

        let handle = router.registry().lookup(&AgentId::from("agent-a")).unwrap();
        assert_eq!(handle.session_id(), session_id);
    }

    #[tokio::test]
    async fn test_non_hello_first_frame_closes_connection() {
        let router = make_router();
        let (mut client, task) = spawn_session(router, Arc::new(AcceptAll));

        client.send(Frame::Heartbeat).await.unwrap();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(SessionError::Handshake(_))));
        // no welcome came back
        assert!(client.next().await.is_none());
    }

    #[tokio::test]
    async fn test_rejected_credential_gets_no_welcome() {
        let router = make_router();
        let (mut client, task) = spawn_session(router.clone(), Arc::new(RejectAuth));

        client
            .send(Frame::Hello {
                agent_id: AgentId::from("agent-a"),
                credential: b"bad".to_vec(),
            })
            .await
            .unwrap();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(SessionError::Unauthorized(_))));
        assert!(router.registry().is_empty());
    }

    #[tokio::test]
    async fn test_envelope_to_offline_recipient_receipts_queued() {
        let router = make_router();
        let (mut client, _task) = spawn_session(router.clone(), Arc::new(AcceptAll));
        handshake(&mut client, "agent-a").await;

        let envelope = make_envelope("agent-a", "agent-b");
        let message_id = envelope.message_id;
        client.send(Frame::Envelope { envelope }).await.unwrap();

        match recv_frame(&mut client).await {
            Frame::Receipt {
                message_id: id,
                outcome,
            } => {
                assert_eq!(id, message_id);
                assert_eq!(outcome, DeliveryOutcome::Queued);
            }
            other => panic!("expected receipt, got {other:?}"),
        }
        assert_eq!(router.queue().pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_live_delivery_between_sessions() {
        let router = make_router();
        let (mut sender, _t1) = spawn_session(router.clone(), Arc::new(AcceptAll));
        let (mut recipient, _t2) = spawn_session(router.clone(), Arc::new(AcceptAll));
        handshake(&mut sender, "agent-a").await;
        handshake(&mut recipient, "agent-b").await;

        let envelope = make_envelope("agent-a", "agent-b");
        let message_id = envelope.message_id;
        sender
            .send(Frame::Envelope {
                envelope: envelope.clone(),
            })
            .await
            .unwrap();

        match recv_frame(&mut recipient).await {
            Frame::Envelope { envelope: received } => {
                assert_eq!(received.message_id, message_id);
                assert_eq!(received.payload, envelope.payload);
            }
            other => panic!("expected envelope, got {other:?}"),
        }

        match recv_frame(&mut sender).await {
            Frame::Receipt { outcome, .. } => assert_eq!(outcome, DeliveryOutcome::DeliveredLive),
            other => panic!("expected receipt, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_queued_messages_drained_on_connect() {
        let router = make_router();
        let first = make_envelope("agent-a", "agent-b");
        let second = make_envelope("agent-a", "agent-b");
        router.route_outbound(first.clone()).await.unwrap();
        router.route_outbound(second.clone()).await.unwrap();

        let (mut client, _task) = spawn_session(router.clone(), Arc::new(AcceptAll));
        handshake(&mut client, "agent-b").await;

        match recv_frame(&mut client).await {
            Frame::Envelope { envelope } => assert_eq!(envelope.message_id, first.message_id),
            other => panic!("expected envelope, got {other:?}"),
        }
        match recv_frame(&mut client).await {
            Frame::Envelope { envelope } => assert_eq!(envelope.message_id, second.message_id),
            other => panic!("expected envelope, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_session_survives_malformed_frame() {
        let router = make_router();
        let (client, server) = duplex(64 * 1024);
        let _task = tokio::spawn(handle_connection(
            server,
            MAX_FRAME_BYTES,
            router.clone(),
            Arc::new(AcceptAll) as Arc<dyn ConnectAuthenticator>,
        ));
        let (read_half, mut raw) = tokio::io::split(client);
        let mut reader = tokio_util::codec::FramedRead::new(read_half, RelayCodec::new());

        // handshake by hand over the raw write half
        let mut buf = BytesMut::new();
        RelayCodec::new()
            .encode(
                Frame::Hello {
                    agent_id: AgentId::from("agent-a"),
                    credential: Vec::new(),
                },
                &mut buf,
            )
            .unwrap();
        raw.write_all(&buf).await.unwrap();
        assert!(matches!(
            tokio::time::timeout(Duration::from_secs(2), reader.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap(),
            Frame::Welcome { .. }
        ));

        // garbage frame, correctly length-prefixed
        let garbage = b"{definitely not json";
        let mut frame = BytesMut::new();
        frame.put_u32(garbage.len() as u32);
        frame.put_slice(garbage);
        raw.write_all(&frame).await.unwrap();

        // a valid envelope after the garbage still gets processed
        let envelope = make_envelope("agent-a", "agent-b");
        let message_id = envelope.message_id;
        let mut buf = BytesMut::new();
        RelayCodec::new()
            .encode(Frame::Envelope { envelope }, &mut buf)
            .unwrap();
        raw.write_all(&buf).await.unwrap();

        match tokio::time::timeout(Duration::from_secs(2), reader.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
        {
            Frame::Receipt {
                message_id: id,
                outcome,
            } => {
                assert_eq!(id, message_id);
                assert_eq!(outcome, DeliveryOutcome::Queued);
            }
            other => panic!("expected receipt, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disconnect_unregisters() {
        let router = make_router();
        let (mut client, task) = spawn_session(router.clone(), Arc::new(AcceptAll));
        handshake(&mut client, "agent-a").await;
        assert_eq!(router.registry().len(), 1);

        drop(client);
        task.await.unwrap().unwrap();
        assert!(router.registry().is_empty());
    }

    #[tokio::test]
    async fn test_supersession_closes_old_session() {
        let router = make_router();
        let (mut first, first_task) = spawn_session(router.clone(), Arc::new(AcceptAll));
        handshake(&mut first, "agent-a").await;

        let (mut second, _second_task) = spawn_session(router.clone(), Arc::new(AcceptAll));
        let second_id = handshake(&mut second, "agent-a").await;

        // old session loop terminates; its stale unregister must not evict
        // the new session
        tokio::time::timeout(Duration::from_secs(2), first_task)
            .await
            .expect("old session should terminate")
            .unwrap()
            .unwrap();
        let live = router.registry().lookup(&AgentId::from("agent-a")).unwrap();
        assert_eq!(live.session_id(), second_id);
    }

    #[tokio::test]
    async fn test_heartbeat_refreshes_liveness() {
        let router = make_router();
        let (mut client, _task) = spawn_session(router.clone(), Arc::new(AcceptAll));
        handshake(&mut client, "agent-a").await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        client.send(Frame::Heartbeat).await.unwrap();
        // give the session loop a moment to process
        tokio::time::sleep(Duration::from_millis(50)).await;

        // a sweep with a threshold shorter than the elapsed time since
        // connect but longer than since the heartbeat spares the session
        let evicted = router.registry().sweep_expired(Duration::from_millis(60));
        assert!(evicted.is_empty());
        assert_eq!(router.registry().len(), 1);
    }
}
