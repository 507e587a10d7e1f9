//! # UDP Transport and Reply Multiplexer
//!
//! The discovery protocol runs over a single UDP socket driven by two
//! long-lived tasks:
//!
//! - **Receive loop**: reads datagrams (≤ 1280 bytes), parses them and
//!   dispatches to the per-kind handler. A malformed packet aborts only
//!   itself; a closed socket ends the loop.
//! - **Coordinator loop**: the sole owner of the pending-reply list. All
//!   interaction goes through two channels (add-pending, got-reply) plus a
//!   shutdown signal, so the list itself needs no lock. The loop arms a
//!   single timer for the earliest deadline and fires the hourly table
//!   refresh.
//!
//! ## Request/response correlation
//!
//! Requests register a [`Pending`] entry keyed by `(peer-id, packet-kind)`
//! before the datagram is written. Incoming packets of a reply kind walk
//! the list; every matching callback runs, and a callback returning `true`
//! resolves its waiter and releases the entry. Findnode replies arrive in
//! multiple fragments, so the neighbors callback keeps accumulating until
//! it has seen a full bucket's worth of nodes.
//!
//! Unsolicited pong/neighbors packets are errors. Ping and findnode are
//! handled unconditionally: a ping from an unknown peer starts a reverse
//! bond, and findnode is answered only for peers we have bonded with (the
//! guard against traffic-amplification abuse).

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::identity::{Keypair, Node, NodeId};
use crate::nat;
use crate::table::{Table, BUCKET_SIZE};
use crate::wire::{
    self, decode_datagram, encode_datagram, Endpoint, FindNode, Neighbors, Packet, PacketKind,
    Ping, Pong, WireError, WireNode, DISCOVERY_VERSION, MAX_DATAGRAM_SIZE,
};

/// How long a request waits for its reply.
pub const RESP_TIMEOUT: Duration = Duration::from_millis(500);

/// Expiration horizon stamped into outgoing packets.
pub const PACKET_EXPIRATION: Duration = Duration::from_secs(20);

/// Interval between coordinator-driven table refreshes.
const REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Discovery transport failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("expired packet")]
    Expired,
    #[error("version mismatch")]
    BadVersion,
    #[error("unsolicited reply")]
    UnsolicitedReply,
    #[error("unknown node")]
    UnknownNode,
    #[error("RPC timeout")]
    Timeout,
    #[error("reply deadline too far in the future")]
    ClockWarp,
    #[error("socket closed")]
    Closed,
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("socket i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// A findnode that did not complete cleanly. Fragments received before the
/// failure are still usable and are returned alongside the error.
#[derive(Debug, thiserror::Error)]
#[error("findnode failed after {} nodes: {error}", partial.len())]
pub struct FindNodeFailure {
    pub partial: Vec<Node>,
    #[source]
    pub error: TransportError,
}

/// The narrow capability bundle the routing table consumes. Implemented by
/// [`UdpTransport`] and by mocks in table tests.
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Sends a ping and waits for the matching pong.
    async fn ping(&self, to: NodeId, addr: SocketAddr) -> Result<(), TransportError>;

    /// Waits for an incoming ping from `from`.
    async fn wait_ping(&self, from: NodeId) -> Result<(), TransportError>;

    /// Asks `to` for nodes close to `target`, aggregating fragmented
    /// replies until a full bucket has been received.
    async fn find_node(
        &self,
        to: NodeId,
        addr: SocketAddr,
        target: NodeId,
    ) -> Result<Vec<Node>, FindNodeFailure>;

    /// Shuts the transport down; pending waiters resolve with `Closed`.
    fn close(&self);
}

/// A registered reply callback. Lives in the coordinator loop only.
struct Pending {
    from: NodeId,
    kind: PacketKind,
    /// Returns true once all expected reply packets have been seen.
    callback: Box<dyn FnMut(&Packet) -> bool + Send>,
    errc: oneshot::Sender<Result<(), TransportError>>,
}

/// A pending entry with its deadline, as tracked by the coordinator.
struct Tracked {
    deadline: Instant,
    pending: Pending,
}

/// An inbound packet of a reply kind, forwarded to the coordinator. The
/// `matched` channel reports whether any pending entry claimed it.
struct Reply {
    from: NodeId,
    kind: PacketKind,
    packet: Packet,
    matched: oneshot::Sender<bool>,
}

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    self_id: NodeId,
    our_endpoint: Endpoint,
    add_pending_tx: mpsc::UnboundedSender<Pending>,
    got_reply_tx: mpsc::UnboundedSender<Reply>,
    closing: watch::Sender<bool>,
    table: OnceLock<Weak<Table>>,
}

/// Binds the discovery socket and brings up the routing table with its
/// receive and coordinator loops.
///
/// When a NAT mapper is configured and the bind address is not loopback,
/// the external IP is substituted into our advertised endpoint and a
/// background task keeps the port mapping alive.
pub async fn listen(
    key: &Keypair,
    listen_addr: &str,
    db_path: Option<&Path>,
    mapper: Option<Arc<dyn nat::Mapper>>,
) -> anyhow::Result<(Arc<Table>, Arc<UdpTransport>)> {
    let socket = UdpSocket::bind(listen_addr).await?;
    let local = socket.local_addr()?;
    let self_id = key.node_id();

    let (add_pending_tx, add_pending_rx) = mpsc::unbounded_channel();
    let (got_reply_tx, got_reply_rx) = mpsc::unbounded_channel();
    let (closing, _) = watch::channel(false);

    let mut advertised = local;
    if let Some(mapper) = mapper.filter(|_| !local.ip().is_loopback()) {
        if let Some(ip) = mapper.external_ip().await {
            advertised.set_ip(ip);
        }
        tokio::spawn(nat::map_loop(
            mapper,
            closing.subscribe(),
            nat::Protocol::Udp,
            local.port(),
            local.port(),
            "xfsnet discovery",
        ));
    }

    let transport = Arc::new(UdpTransport {
        socket: Arc::new(socket),
        self_id,
        our_endpoint: Endpoint::from_addr(advertised, advertised.port()),
        add_pending_tx,
        got_reply_tx,
        closing,
        table: OnceLock::new(),
    });

    let table = Table::new(
        Arc::clone(&transport) as Arc<dyn Discovery>,
        self_id,
        advertised,
        db_path,
    )?;
    transport
        .table
        .set(Arc::downgrade(&table))
        .ok()
        .expect("table installed twice");

    tokio::spawn(coordinator_loop(
        Arc::clone(&transport),
        add_pending_rx,
        got_reply_rx,
    ));
    tokio::spawn(read_loop(Arc::clone(&transport)));

    Ok((table, transport))
}

impl UdpTransport {
    pub fn our_endpoint(&self) -> Endpoint {
        self.our_endpoint
    }

    fn table(&self) -> Option<Arc<Table>> {
        self.table.get().and_then(Weak::upgrade)
    }

    fn is_closed(&self) -> bool {
        *self.closing.borrow()
    }

    /// Registers a reply callback with the coordinator. The returned
    /// receiver resolves when the callback completes, times out, or the
    /// transport closes.
    fn pending(
        &self,
        from: NodeId,
        kind: PacketKind,
        callback: Box<dyn FnMut(&Packet) -> bool + Send>,
    ) -> oneshot::Receiver<Result<(), TransportError>> {
        let (errc, rx) = oneshot::channel();
        if self.is_closed() {
            let _ = errc.send(Err(TransportError::Closed));
            return rx;
        }
        let entry = Pending {
            from,
            kind,
            callback,
            errc,
        };
        if let Err(send_err) = self.add_pending_tx.send(entry) {
            let _ = send_err.0.errc.send(Err(TransportError::Closed));
        }
        rx
    }

    /// Offers an inbound reply packet to the coordinator and reports
    /// whether a pending request claimed it.
    async fn handle_reply(&self, from: NodeId, kind: PacketKind, packet: Packet) -> bool {
        let (matched_tx, matched_rx) = oneshot::channel();
        let reply = Reply {
            from,
            kind,
            packet,
            matched: matched_tx,
        };
        if self.got_reply_tx.send(reply).is_err() {
            return false;
        }
        matched_rx.await.unwrap_or(false)
    }

    async fn send(&self, to: SocketAddr, packet: &Packet) -> Result<(), TransportError> {
        let datagram = encode_datagram(&self.self_id, packet)?;
        trace!(%to, kind = ?packet.kind(), "sending discovery packet");
        if let Err(err) = self.socket.send_to(&datagram, to).await {
            debug!(%to, error = %err, "UDP send failed");
            return Err(err.into());
        }
        Ok(())
    }

    async fn handle_packet(
        self: &Arc<Self>,
        buf: &[u8],
        from_addr: SocketAddr,
    ) -> Result<(), TransportError> {
        let (from_id, packet) = decode_datagram(buf)?;
        if wire::expired(packet.expiration()) {
            return Err(TransportError::Expired);
        }
        match packet {
            Packet::Ping(ping) => self.handle_ping(from_id, from_addr, ping).await,
            Packet::Pong(_) => {
                if !self.handle_reply(from_id, PacketKind::Pong, packet).await {
                    return Err(TransportError::UnsolicitedReply);
                }
                Ok(())
            }
            Packet::FindNode(findnode) => self.handle_findnode(from_id, from_addr, findnode).await,
            Packet::Neighbors(_) => {
                if !self
                    .handle_reply(from_id, PacketKind::Neighbors, packet)
                    .await
                {
                    return Err(TransportError::UnsolicitedReply);
                }
                Ok(())
            }
        }
    }

    async fn handle_ping(
        self: &Arc<Self>,
        from_id: NodeId,
        from_addr: SocketAddr,
        ping: Ping,
    ) -> Result<(), TransportError> {
        if ping.version != DISCOVERY_VERSION {
            return Err(TransportError::BadVersion);
        }
        let pong = Packet::Pong(Pong {
            to: Endpoint::from_addr(from_addr, ping.from.tcp),
            expiration: wire::expiration_from_now(PACKET_EXPIRATION),
        });
        self.send(from_addr, &pong).await?;

        let packet = Packet::Ping(ping.clone());
        if !self.handle_reply(from_id, PacketKind::Ping, packet).await {
            // Nobody was waiting for this ping: a new peer is introducing
            // itself. Bond back so both sides learn each other.
            if let Some(table) = self.table() {
                tokio::spawn(async move {
                    let _ = table.bond(true, from_id, from_addr, ping.from.tcp).await;
                });
            }
        }
        Ok(())
    }

    async fn handle_findnode(
        self: &Arc<Self>,
        from_id: NodeId,
        from_addr: SocketAddr,
        _findnode: FindNode,
    ) -> Result<(), TransportError> {
        let Some(table) = self.table() else {
            return Ok(());
        };
        if table.db().node(&from_id).is_none() {
            // No bond: answering would let an attacker bounce large
            // neighbors packets off us at a victim address.
            return Err(TransportError::UnknownNode);
        }
        let target = from_id.hash();
        let closest = table.closest(&target, BUCKET_SIZE);
        let nodes: Vec<WireNode> = closest.iter().map(WireNode::from_node).collect();
        let expiration = wire::expiration_from_now(PACKET_EXPIRATION);
        for fragment in Neighbors::fragments(&nodes, expiration) {
            self.send(from_addr, &Packet::Neighbors(fragment)).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Discovery for UdpTransport {
    async fn ping(&self, to: NodeId, addr: SocketAddr) -> Result<(), TransportError> {
        let rx = self.pending(to, PacketKind::Pong, Box::new(|_| true));
        let ping = Packet::Ping(Ping {
            version: DISCOVERY_VERSION,
            from: self.our_endpoint,
            to: Endpoint::from_addr(addr, 0),
            expiration: wire::expiration_from_now(PACKET_EXPIRATION),
        });
        self.send(addr, &ping).await?;
        rx.await.unwrap_or(Err(TransportError::Closed))
    }

    async fn wait_ping(&self, from: NodeId) -> Result<(), TransportError> {
        self.pending(from, PacketKind::Ping, Box::new(|_| true))
            .await
            .unwrap_or(Err(TransportError::Closed))
    }

    async fn find_node(
        &self,
        to: NodeId,
        addr: SocketAddr,
        target: NodeId,
    ) -> Result<Vec<Node>, FindNodeFailure> {
        // The callback runs in the coordinator loop; results are shared
        // back to this task through the accumulator.
        let acc: Arc<Mutex<Vec<Node>>> = Arc::new(Mutex::new(Vec::with_capacity(BUCKET_SIZE)));
        let mut received = 0usize;
        let callback_acc = Arc::clone(&acc);
        let rx = self.pending(
            to,
            PacketKind::Neighbors,
            Box::new(move |packet| {
                let Packet::Neighbors(reply) = packet else {
                    return false;
                };
                let mut nodes = callback_acc.lock();
                for wire_node in &reply.nodes {
                    received += 1;
                    if let Some(node) = wire_node.to_node() {
                        nodes.push(node);
                    }
                }
                received >= BUCKET_SIZE
            }),
        );
        let request = Packet::FindNode(FindNode {
            target,
            expiration: wire::expiration_from_now(PACKET_EXPIRATION),
        });
        if let Err(error) = self.send(addr, &request).await {
            return Err(FindNodeFailure {
                partial: Vec::new(),
                error,
            });
        }
        let result = rx.await.unwrap_or(Err(TransportError::Closed));
        let nodes = std::mem::take(&mut *acc.lock());
        match result {
            Ok(()) => Ok(nodes),
            Err(error) => Err(FindNodeFailure {
                partial: nodes,
                error,
            }),
        }
    }

    fn close(&self) {
        let _ = self.closing.send(true);
    }
}

/// Owns the pending-reply list. No other task touches it.
async fn coordinator_loop(
    transport: Arc<UdpTransport>,
    mut add_rx: mpsc::UnboundedReceiver<Pending>,
    mut reply_rx: mpsc::UnboundedReceiver<Reply>,
) {
    let mut plist: std::collections::VecDeque<Tracked> = std::collections::VecDeque::new();
    let mut closing_rx = transport.closing.subscribe();
    let mut refresh =
        tokio::time::interval_at(Instant::now() + REFRESH_INTERVAL, REFRESH_INTERVAL);

    loop {
        // Entries whose deadline is implausibly far out mean the clock
        // jumped after the deadline was assigned; fail them immediately so
        // the timer below always fires within 2×RESP_TIMEOUT.
        let now = Instant::now();
        while let Some(front) = plist.front() {
            if front.deadline.saturating_duration_since(now) < 2 * RESP_TIMEOUT {
                break;
            }
            let entry = plist.pop_front().expect("front checked");
            let _ = entry.pending.errc.send(Err(TransportError::ClockWarp));
        }
        let next_deadline = plist.front().map(|t| t.deadline);

        tokio::select! {
            _ = refresh.tick() => {
                if let Some(table) = transport.table() {
                    tokio::spawn(async move { table.refresh().await });
                }
            }

            changed = closing_rx.changed() => {
                if changed.is_err() || *closing_rx.borrow() {
                    for entry in plist.drain(..) {
                        let _ = entry.pending.errc.send(Err(TransportError::Closed));
                    }
                    return;
                }
            }

            entry = add_rx.recv() => {
                let Some(pending) = entry else { return };
                plist.push_back(Tracked {
                    deadline: Instant::now() + RESP_TIMEOUT,
                    pending,
                });
            }

            reply = reply_rx.recv() => {
                let Some(reply) = reply else { return };
                let mut matched = false;
                let mut i = 0;
                while i < plist.len() {
                    let entry = &mut plist[i];
                    if entry.pending.from == reply.from && entry.pending.kind == reply.kind {
                        matched = true;
                        if (entry.pending.callback)(&reply.packet) {
                            let entry = plist.remove(i).expect("index in bounds");
                            let _ = entry.pending.errc.send(Ok(()));
                            continue;
                        }
                    }
                    i += 1;
                }
                let _ = reply.matched.send(matched);
            }

            _ = sleep_until_opt(next_deadline) => {
                let now = Instant::now();
                while let Some(front) = plist.front() {
                    if front.deadline > now {
                        break;
                    }
                    let entry = plist.pop_front().expect("front checked");
                    let _ = entry.pending.errc.send(Err(TransportError::Timeout));
                }
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Reads datagrams until the socket closes. Per-packet failures are logged
/// and dropped.
async fn read_loop(transport: Arc<UdpTransport>) {
    let mut closing_rx = transport.closing.subscribe();
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];
    loop {
        tokio::select! {
            changed = closing_rx.changed() => {
                if changed.is_err() || *closing_rx.borrow() {
                    return;
                }
            }
            received = transport.socket.recv_from(&mut buf) => {
                match received {
                    Ok((n, from)) => {
                        if let Err(err) = transport.handle_packet(&buf[..n], from).await {
                            debug!(%from, error = %err, "bad discovery packet");
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "discovery socket read failed, stopping");
                        return;
                    }
                }
            }
        }
    }
}
