//! # Peer Session and Protocol Pump
//!
//! A [`Peer`] is a live, handshaken TCP session. Each session runs four
//! kinds of tasks:
//!
//! - **Read loop**: parses frames and dispatches. Heartbeat requests are
//!   answered inline, heartbeat answers refresh the liveness stamp, and
//!   everything else is fanned out to the sub-protocol queue while the
//!   payload is mirrored into a byte-stream read buffer.
//! - **Ping loop**: writes a heartbeat request on a fixed tick.
//! - **Watchdog**: closes the session when no heartbeat answer has been
//!   seen for the liveness deadline.
//! - **Protocol runners**: one task per bound [`Protocol`]; a runner
//!   returning (normally or with an error) closes the session.
//!
//! All tasks share one idempotent close signal. The server observes the
//! session end through [`Peer::run`] returning and removes the peer from
//! its map.
//!
//! Within a session, frames reach the sub-protocol queue in wire order.
//! Nothing is guaranteed between sessions.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::conn::{PeerConn, PeerFlags};
use crate::frame::{Frame, TYPE_PING, TYPE_PONG};
use crate::identity::NodeId;

/// Default interval between heartbeat requests.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Default liveness deadline: the session dies when no pong arrives for
/// this long.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(30);

/// A frame delivered to sub-protocols: the type byte and the raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub mtype: u8,
    pub payload: Bytes,
}

/// An application-defined sub-protocol bound to the server. One runner task
/// is spawned per peer; returning from `run` ends that peer's session.
#[async_trait::async_trait]
pub trait Protocol: Send + Sync + 'static {
    async fn run(&self, peer: Peer) -> anyhow::Result<()>;
}

/// Encodes application message objects for [`Peer::write_message_obj`].
///
/// Mirrors the dynamically-typed encoder surface of the embedder
/// configuration: implementations downcast `msg` to their own message
/// types and serialize them however they see fit.
pub trait Encoder: Send + Sync {
    fn encode(&self, msg: &(dyn Any + Send + Sync)) -> anyhow::Result<Vec<u8>>;
}

/// Write-path failures on a peer session.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("peer session closed")]
    Closed,
    #[error("no application encoder configured")]
    NoEncoder,
    #[error("encoding application message failed: {0}")]
    Encode(#[source] anyhow::Error),
}

struct PeerInner {
    id: NodeId,
    flags: PeerFlags,
    last_heartbeat: Mutex<Instant>,
    write_tx: mpsc::UnboundedSender<Frame>,
    closed: watch::Sender<bool>,
    messages_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    read_buf: Mutex<BytesMut>,
    encoder: Option<Arc<dyn Encoder>>,
}

/// Cheap-to-clone handle to a live peer session.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    /// Brings a handshaken connection to life: spawns the read, write,
    /// ping, watchdog, and protocol-runner tasks.
    pub(crate) fn spawn(
        conn: PeerConn,
        protocols: &[Arc<dyn Protocol>],
        encoder: Option<Arc<dyn Encoder>>,
        heartbeat_interval: Duration,
        liveness_timeout: Duration,
    ) -> Peer {
        let id = conn
            .remote_id
            .expect("only handshaken connections become peers");
        let flags = conn.flags;
        let (mut sink, mut stream) = conn.stream.split();
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Frame>();
        let (messages_tx, messages_rx) = mpsc::unbounded_channel::<Message>();
        let (closed, _) = watch::channel(false);

        let peer = Peer {
            inner: Arc::new(PeerInner {
                id,
                flags,
                last_heartbeat: Mutex::new(Instant::now()),
                write_tx,
                closed,
                messages_rx: tokio::sync::Mutex::new(Some(messages_rx)),
                read_buf: Mutex::new(BytesMut::new()),
                encoder,
            }),
        };

        // Writer: the sole owner of the sink half.
        {
            let peer = peer.clone();
            let mut close_rx = peer.inner.closed.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = close_rx.changed() => {
                            if *close_rx.borrow() {
                                return;
                            }
                        }
                        frame = write_rx.recv() => {
                            let Some(frame) = frame else { return };
                            if let Err(err) = sink.send(frame).await {
                                debug!(peer = %peer.id(), error = %err, "peer write failed");
                                peer.close();
                                return;
                            }
                        }
                    }
                }
            });
        }

        // Reader: parses frames and dispatches by type.
        {
            let peer = peer.clone();
            let mut close_rx = peer.inner.closed.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = close_rx.wait_for(|c| *c) => return,
                        frame = stream.next() => {
                            match frame {
                                Some(Ok(frame)) => peer.dispatch(frame, &messages_tx),
                                Some(Err(err)) => {
                                    debug!(peer = %peer.id(), error = %err, "peer read failed");
                                    peer.close();
                                    return;
                                }
                                None => {
                                    trace!(peer = %peer.id(), "peer hung up");
                                    peer.close();
                                    return;
                                }
                            }
                        }
                    }
                }
            });
        }

        // Ping loop: request a heartbeat every tick.
        {
            let peer = peer.clone();
            let mut close_rx = peer.inner.closed.subscribe();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(heartbeat_interval);
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = close_rx.wait_for(|c| *c) => return,
                        _ = tick.tick() => {
                            if peer.send_frame(Frame::new(TYPE_PING, Bytes::new())).is_err() {
                                peer.close();
                                return;
                            }
                        }
                    }
                }
            });
        }

        // Watchdog: enforce the liveness deadline.
        {
            let peer = peer.clone();
            let mut close_rx = peer.inner.closed.subscribe();
            // The deadline only needs coarse checking; a third of the
            // timeout matches the classic 10s-check / 30s-deadline pairing.
            let check_every = (liveness_timeout / 3).min(Duration::from_secs(10));
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(check_every);
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = close_rx.wait_for(|c| *c) => return,
                        _ = tick.tick() => {
                            let idle = peer.inner.last_heartbeat.lock().elapsed();
                            if idle > liveness_timeout {
                                debug!(peer = %peer.id(), ?idle, "peer liveness deadline exceeded");
                                peer.close();
                                return;
                            }
                        }
                    }
                }
            });
        }

        // One runner per bound sub-protocol.
        for protocol in protocols {
            let peer = peer.clone();
            let protocol = Arc::clone(protocol);
            tokio::spawn(async move {
                if let Err(err) = protocol.run(peer.clone()).await {
                    debug!(peer = %peer.id(), error = %err, "protocol runner failed");
                }
                peer.close();
            });
        }

        peer
    }

    fn dispatch(&self, frame: Frame, messages_tx: &mpsc::UnboundedSender<Message>) {
        match frame.mtype {
            TYPE_PING => {
                trace!(peer = %self.id(), "heartbeat request");
                if self.send_frame(Frame::new(TYPE_PONG, Bytes::new())).is_err() {
                    self.close();
                }
            }
            TYPE_PONG => {
                trace!(peer = %self.id(), "heartbeat answer");
                *self.inner.last_heartbeat.lock() = Instant::now();
            }
            mtype => {
                self.inner
                    .read_buf
                    .lock()
                    .extend_from_slice(&frame.payload);
                let _ = messages_tx.send(Message {
                    mtype,
                    payload: frame.payload,
                });
            }
        }
    }

    fn send_frame(&self, frame: Frame) -> Result<(), PeerError> {
        self.inner
            .write_tx
            .send(frame)
            .map_err(|_| PeerError::Closed)
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Tests the connection flag bitset (inbound/outbound/static/dynamic).
    pub fn is(&self, flag: PeerFlags) -> bool {
        self.inner.flags.contains(flag)
    }

    pub fn flags(&self) -> PeerFlags {
        self.inner.flags
    }

    /// Instant of the most recent heartbeat answer.
    pub fn last_heartbeat(&self) -> Instant {
        *self.inner.last_heartbeat.lock()
    }

    /// Queues a typed message for the peer. Types below 4 are reserved for
    /// the session itself.
    pub fn write_message(&self, mtype: u8, data: &[u8]) -> Result<(), PeerError> {
        self.send_frame(Frame::new(mtype, data.to_vec()))
    }

    /// Encodes an application object with the configured encoder and queues
    /// it for the peer.
    pub fn write_message_obj(
        &self,
        mtype: u8,
        obj: &(dyn Any + Send + Sync),
    ) -> Result<(), PeerError> {
        let encoder = self.inner.encoder.as_ref().ok_or(PeerError::NoEncoder)?;
        let data = encoder.encode(obj).map_err(PeerError::Encode)?;
        self.send_frame(Frame::new(mtype, data))
    }

    /// Takes the sub-protocol message queue. The queue exists once per
    /// session; a second call returns `None`.
    pub async fn messages(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.inner.messages_rx.lock().await.take()
    }

    /// Reads from the mirrored byte stream of sub-protocol payloads.
    /// Returns the number of bytes copied into `buf`.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut read_buf = self.inner.read_buf.lock();
        let n = read_buf.len().min(buf.len());
        buf[..n].copy_from_slice(&read_buf[..n]);
        let _ = read_buf.split_to(n);
        n
    }

    /// Signals the session to shut down. Idempotent; every session task
    /// observes the same signal.
    pub fn close(&self) {
        let _ = self.inner.closed.send(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Resolves when the session has been closed, by whatever cause. The
    /// server awaits this to learn when to drop the peer from its map.
    pub async fn run(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.inner.id)
            .field("flags", &self.inner.flags)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{FLAG_INBOUND, FLAG_OUTBOUND};
    use crate::frame::TYPE_APPLICATION_MIN;
    use crate::identity::NODE_ID_LEN;
    use tokio::net::{TcpListener, TcpStream};

    fn test_id(n: u8) -> NodeId {
        NodeId::from_bytes([n; NODE_ID_LEN])
    }

    async fn peer_pair(
        heartbeat: Duration,
        liveness: Duration,
    ) -> (Peer, Peer) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());

        let mut conn_a = PeerConn::new(client.unwrap(), test_id(1), FLAG_OUTBOUND, Some(test_id(2)));
        let mut conn_b = PeerConn::new(server.unwrap().0, test_id(2), FLAG_INBOUND, None);
        let (ra, rb) = tokio::join!(conn_a.client_handshake(), conn_b.server_handshake());
        ra.unwrap();
        rb.unwrap();

        let a = Peer::spawn(conn_a, &[], None, heartbeat, liveness);
        let b = Peer::spawn(conn_b, &[], None, heartbeat, liveness);
        (a, b)
    }

    #[tokio::test]
    async fn heartbeats_advance_liveness() {
        let (a, b) = peer_pair(Duration::from_millis(50), Duration::from_secs(30)).await;
        let before_a = a.last_heartbeat();
        let before_b = b.last_heartbeat();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(a.last_heartbeat() > before_a, "a never saw a pong");
        assert!(b.last_heartbeat() > before_b, "b never saw a pong");
        a.close();
        b.close();
    }

    #[tokio::test]
    async fn application_frames_reach_the_protocol_queue() {
        let (a, b) = peer_pair(Duration::from_secs(10), Duration::from_secs(30)).await;
        let mut messages = b.messages().await.expect("first take succeeds");
        assert!(b.messages().await.is_none(), "queue can only be taken once");

        a.write_message(TYPE_APPLICATION_MIN, b"first").unwrap();
        a.write_message(TYPE_APPLICATION_MIN + 1, b"second").unwrap();

        let m1 = messages.recv().await.unwrap();
        let m2 = messages.recv().await.unwrap();
        assert_eq!((m1.mtype, &m1.payload[..]), (TYPE_APPLICATION_MIN, &b"first"[..]));
        assert_eq!(
            (m2.mtype, &m2.payload[..]),
            (TYPE_APPLICATION_MIN + 1, &b"second"[..])
        );

        // The byte-stream mirror sees the same payloads in order.
        let mut buf = [0u8; 32];
        let n = b.read(&mut buf);
        assert_eq!(&buf[..n], b"firstsecond");

        a.close();
        b.close();
    }

    #[tokio::test]
    async fn silent_peer_is_closed_by_the_watchdog() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());

        let mut conn_a = PeerConn::new(client.unwrap(), test_id(1), FLAG_OUTBOUND, Some(test_id(2)));
        let mut conn_b = PeerConn::new(server.unwrap().0, test_id(2), FLAG_INBOUND, None);
        let (ra, rb) = tokio::join!(conn_a.client_handshake(), conn_b.server_handshake());
        ra.unwrap();
        rb.unwrap();

        // The remote side stays mute: it drains frames but never answers.
        let mute = tokio::spawn(async move {
            let mut conn_b = conn_b;
            while conn_b.stream.next().await.is_some() {}
        });

        let a = Peer::spawn(
            conn_a,
            &[],
            None,
            Duration::from_millis(50),
            Duration::from_millis(300),
        );
        let deadline = tokio::time::timeout(Duration::from_secs(5), a.run()).await;
        assert!(deadline.is_ok(), "watchdog should close the silent session");
        assert!(a.is_closed());
        mute.abort();
    }

    #[tokio::test]
    async fn protocol_runner_return_closes_the_session() {
        struct OneShot;

        #[async_trait::async_trait]
        impl Protocol for OneShot {
            async fn run(&self, peer: Peer) -> anyhow::Result<()> {
                peer.write_message(TYPE_APPLICATION_MIN, b"bye")?;
                Ok(())
            }
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());

        let mut conn_a = PeerConn::new(client.unwrap(), test_id(1), FLAG_OUTBOUND, Some(test_id(2)));
        let mut conn_b = PeerConn::new(server.unwrap().0, test_id(2), FLAG_INBOUND, None);
        let (ra, rb) = tokio::join!(conn_a.client_handshake(), conn_b.server_handshake());
        ra.unwrap();
        rb.unwrap();

        let protocols: Vec<Arc<dyn Protocol>> = vec![Arc::new(OneShot)];
        let a = Peer::spawn(
            conn_a,
            &protocols,
            None,
            Duration::from_secs(10),
            Duration::from_secs(30),
        );
        tokio::time::timeout(Duration::from_secs(5), a.run())
            .await
            .expect("runner return should close the session");
        drop(conn_b);
    }

    #[tokio::test]
    async fn write_message_obj_uses_the_configured_encoder() {
        struct StringEncoder;

        impl Encoder for StringEncoder {
            fn encode(&self, msg: &(dyn Any + Send + Sync)) -> anyhow::Result<Vec<u8>> {
                let s = msg
                    .downcast_ref::<String>()
                    .ok_or_else(|| anyhow::anyhow!("unsupported message type"))?;
                Ok(s.clone().into_bytes())
            }
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());

        let mut conn_a = PeerConn::new(client.unwrap(), test_id(1), FLAG_OUTBOUND, Some(test_id(2)));
        let mut conn_b = PeerConn::new(server.unwrap().0, test_id(2), FLAG_INBOUND, None);
        let (ra, rb) = tokio::join!(conn_a.client_handshake(), conn_b.server_handshake());
        ra.unwrap();
        rb.unwrap();

        let a = Peer::spawn(
            conn_a,
            &[],
            Some(Arc::new(StringEncoder)),
            Duration::from_secs(10),
            Duration::from_secs(30),
        );
        let b = Peer::spawn(conn_b, &[], None, Duration::from_secs(10), Duration::from_secs(30));
        let mut messages = b.messages().await.unwrap();

        let msg: String = "typed hello".into();
        a.write_message_obj(TYPE_APPLICATION_MIN, &msg).unwrap();
        let got = messages.recv().await.unwrap();
        assert_eq!(&got.payload[..], b"typed hello");

        assert!(matches!(
            b.write_message_obj(TYPE_APPLICATION_MIN, &msg),
            Err(PeerError::NoEncoder)
        ));

        a.close();
        b.close();
    }
}
