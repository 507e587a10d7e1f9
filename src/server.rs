//! # Server Orchestrator
//!
//! The [`Server`] owns every lifecycle: the routing table (which owns the
//! UDP transport and node database), the TCP listener, the dial scheduler,
//! the bound sub-protocols, and the peer map.
//!
//! ## Run loop
//!
//! One loop drives everything. Each iteration asks the scheduler for new
//! tasks given the current peers and in-flight dials, keeps up to 16 task
//! workers busy, and then absorbs whichever event arrives first: a task
//! completion, a handshaken connection, a peer departure, or a static-node
//! change. Exactly one session may exist per node id; a second handshake
//! for the same id is dropped on arrival.
//!
//! ## Shutdown
//!
//! [`Server::stop`] fires one close signal. The run loop closes every peer
//! and the table (which flushes the database and stops the UDP loops), and
//! the accept loop drops the listener. Stop is idempotent.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::conn::{PeerConn, PeerFlags, FLAG_INBOUND};
use crate::dial::{DialScheduler, DialTask, LOOKUP_INTERVAL};
use crate::identity::{Keypair, Node, NodeId};
use crate::nat;
use crate::peer::{Encoder, Peer, Protocol, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_LIVENESS_TIMEOUT};
use crate::table::Table;
use crate::udp;

/// Cap on concurrently running dial-scheduler tasks.
const MAX_ACTIVE_DIAL_TASKS: usize = 16;

/// Bound on how long a single TCP connect may take before the dial worker
/// gives up and frees its slot.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Embedder-facing configuration.
pub struct Config {
    /// `host:port` the server listens on. UDP discovery and TCP sessions
    /// share the port.
    pub listen_addr: String,
    /// The identity key. The node id is derived from its public key.
    pub key: Keypair,
    /// Whether to run UDP node discovery. Without it only static nodes are
    /// dialed.
    pub discover: bool,
    /// Directory for the persistent node database; `None` keeps it in
    /// memory.
    pub node_db_path: Option<PathBuf>,
    /// Nodes dialed and redialed regardless of discovery.
    pub static_nodes: Vec<Node>,
    /// Nodes used to seed the routing table.
    pub bootstrap_nodes: Vec<Node>,
    /// Cap on connected peers; half of it is the dynamic-dial budget.
    pub max_peers: usize,
    /// Optional NAT port mapper.
    pub nat: Option<Arc<dyn nat::Mapper>>,
    /// Optional encoder for application message objects.
    pub encoder: Option<Arc<dyn Encoder>>,
    /// Interval between heartbeat requests on every session.
    pub heartbeat_interval: Duration,
    /// A session dies when no heartbeat answer arrives for this long.
    pub liveness_timeout: Duration,
}

impl Config {
    pub fn new(listen_addr: impl Into<String>, key: Keypair) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            key,
            discover: true,
            node_db_path: None,
            static_nodes: Vec::new(),
            bootstrap_nodes: Vec::new(),
            max_peers: 16,
            nat: None,
            encoder: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
        }
    }
}

/// State that exists only while the server runs.
struct Running {
    close: watch::Sender<bool>,
    peers: Arc<Mutex<HashMap<NodeId, Peer>>>,
    table: Option<Arc<Table>>,
    self_node: Node,
    addstatic_tx: mpsc::UnboundedSender<Node>,
    rmstatic_tx: mpsc::UnboundedSender<NodeId>,
}

/// Manages all peer connections.
pub struct Server {
    config: Config,
    self_id: NodeId,
    protocols: Mutex<Vec<Arc<dyn Protocol>>>,
    running: Mutex<Option<Running>>,
}

/// Everything the run loop and its workers share.
struct RunCtx {
    self_id: NodeId,
    table: Option<Arc<Table>>,
    peers: Arc<Mutex<HashMap<NodeId, Peer>>>,
    protocols: Vec<Arc<dyn Protocol>>,
    encoder: Option<Arc<dyn Encoder>>,
    bootstrap_nodes: Vec<Node>,
    heartbeat_interval: Duration,
    liveness_timeout: Duration,
    addpeer_tx: mpsc::UnboundedSender<PeerConn>,
    last_lookup: tokio::sync::Mutex<Instant>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        let self_id = config.key.node_id();
        Self {
            config,
            self_id,
            protocols: Mutex::new(Vec::new()),
            running: Mutex::new(None),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.self_id
    }

    /// The local node record. `None` before [`Server::start`].
    pub fn self_node(&self) -> Option<Node> {
        self.running.lock().as_ref().map(|r| r.self_node.clone())
    }

    /// Binds an application sub-protocol. Protocols bound after start only
    /// apply to peers connected afterwards.
    pub fn bind(&self, protocol: Arc<dyn Protocol>) {
        self.protocols.lock().push(protocol);
    }

    /// Snapshot of the connected peers.
    pub fn peers(&self) -> Vec<Peer> {
        match self.running.lock().as_ref() {
            Some(running) => running.peers.lock().values().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Adds a static node: it will be dialed and kept dialed.
    pub fn add_peer(&self, node: Node) {
        if let Some(running) = self.running.lock().as_ref() {
            let _ = running.addstatic_tx.send(node);
        }
    }

    /// Removes a static node and disconnects it if connected.
    pub fn remove_peer(&self, id: NodeId) {
        if let Some(running) = self.running.lock().as_ref() {
            let _ = running.rmstatic_tx.send(id);
        }
    }

    /// Starts discovery, the TCP listener, and the run loop.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.running.lock().is_some() {
            anyhow::bail!("server already running");
        }

        // Discovery first: with an ephemeral listen port, TCP follows the
        // port the UDP socket actually bound.
        let mut table = None;
        let mut listen_port = None;
        if self.config.discover {
            let (tab, transport) = udp::listen(
                &self.config.key,
                &self.config.listen_addr,
                self.config.node_db_path.as_deref(),
                self.config.nat.clone(),
            )
            .await
            .context("discovery listen failed")?;
            listen_port = Some(transport.our_endpoint().udp);
            table = Some(tab);
        }

        let mut tcp_addr: SocketAddr = self
            .config
            .listen_addr
            .parse()
            .context("invalid listen address")?;
        if let Some(port) = listen_port {
            tcp_addr.set_port(port);
        }
        let listener = TcpListener::bind(tcp_addr)
            .await
            .context("TCP listen failed")?;
        let local = listener.local_addr()?;
        let self_node = Node::new(local.ip(), local.port(), local.port(), self.self_id);
        info!(addr = %local, id = %self.self_id, "p2p server listening");

        let (close, _) = watch::channel(false);
        let (addpeer_tx, addpeer_rx) = mpsc::unbounded_channel();
        let (addstatic_tx, addstatic_rx) = mpsc::unbounded_channel();
        let (rmstatic_tx, rmstatic_rx) = mpsc::unbounded_channel();
        let peers: Arc<Mutex<HashMap<NodeId, Peer>>> = Arc::new(Mutex::new(HashMap::new()));

        if let Some(mapper) = self.config.nat.clone().filter(|_| !local.ip().is_loopback()) {
            tokio::spawn(nat::map_loop(
                mapper,
                close.subscribe(),
                nat::Protocol::Tcp,
                local.port(),
                local.port(),
                "xfsnet server",
            ));
        }

        let ctx = Arc::new(RunCtx {
            self_id: self.self_id,
            table: table.clone(),
            peers: Arc::clone(&peers),
            protocols: self.protocols.lock().clone(),
            encoder: self.config.encoder.clone(),
            bootstrap_nodes: self.config.bootstrap_nodes.clone(),
            heartbeat_interval: self.config.heartbeat_interval,
            liveness_timeout: self.config.liveness_timeout,
            addpeer_tx: addpeer_tx.clone(),
            last_lookup: tokio::sync::Mutex::new(
                // The first lookup runs unthrottled.
                Instant::now()
                    .checked_sub(LOOKUP_INTERVAL)
                    .unwrap_or_else(Instant::now),
            ),
        });

        tokio::spawn(accept_loop(
            listener,
            self.self_id,
            addpeer_tx,
            close.subscribe(),
        ));

        let dyn_dials = if self.config.discover {
            self.config.max_peers / 2
        } else {
            0
        };
        let scheduler = DialScheduler::new(self.config.static_nodes.clone(), table.clone(), dyn_dials);
        tokio::spawn(run_loop(
            Arc::clone(&ctx),
            scheduler,
            addpeer_rx,
            addstatic_rx,
            rmstatic_rx,
            close.subscribe(),
        ));

        *self.running.lock() = Some(Running {
            close,
            peers,
            table,
            self_node,
            addstatic_tx,
            rmstatic_tx,
        });
        Ok(())
    }

    /// Shuts everything down. Safe to call more than once.
    pub fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        let _ = running.close.send(true);
        if let Some(table) = &running.table {
            table.close();
        }
        info!("p2p server stopped");
    }
}

/// Accepts inbound connections, runs the server handshake, and hands the
/// connection to the run loop.
async fn accept_loop(
    listener: TcpListener,
    self_id: NodeId,
    addpeer_tx: mpsc::UnboundedSender<PeerConn>,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = close_rx.wait_for(|c| *c) => return,
            accepted = listener.accept() => {
                let (stream, from) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "accept failed, stopping listener");
                        return;
                    }
                };
                let addpeer_tx = addpeer_tx.clone();
                tokio::spawn(async move {
                    let mut conn = PeerConn::new(stream, self_id, FLAG_INBOUND, None);
                    match conn.server_handshake().await {
                        Ok(id) => {
                            debug!(%from, %id, "inbound handshake complete");
                            let _ = addpeer_tx.send(conn);
                        }
                        Err(err) => {
                            debug!(%from, error = %err, "inbound handshake failed");
                        }
                    }
                });
            }
        }
    }
}

/// The scheduler/peer event loop described in the module docs.
async fn run_loop(
    ctx: Arc<RunCtx>,
    mut scheduler: DialScheduler<Table>,
    mut addpeer_rx: mpsc::UnboundedReceiver<PeerConn>,
    mut addstatic_rx: mpsc::UnboundedReceiver<Node>,
    mut rmstatic_rx: mpsc::UnboundedReceiver<NodeId>,
    mut close_rx: watch::Receiver<bool>,
) {
    let (delpeer_tx, mut delpeer_rx) = mpsc::unbounded_channel::<Peer>();
    let mut active: JoinSet<DialTask> = JoinSet::new();
    let mut pending: VecDeque<DialTask> = VecDeque::new();

    loop {
        let now = Instant::now();
        let snapshot: HashMap<NodeId, PeerFlags> = ctx
            .peers
            .lock()
            .iter()
            .map(|(id, peer)| (*id, peer.flags()))
            .collect();
        pending.extend(scheduler.new_tasks(pending.len() + active.len(), &snapshot, now));
        while active.len() < MAX_ACTIVE_DIAL_TASKS {
            let Some(task) = pending.pop_front() else { break };
            let ctx = Arc::clone(&ctx);
            active.spawn(async move { execute_task(task, ctx).await });
        }

        tokio::select! {
            _ = close_rx.wait_for(|c| *c) => {
                let peers: Vec<Peer> = ctx.peers.lock().values().cloned().collect();
                for peer in peers {
                    peer.close();
                }
                ctx.peers.lock().clear();
                active.abort_all();
                return;
            }

            Some(finished) = active.join_next() => {
                if let Ok(task) = finished {
                    scheduler.task_done(&task, Instant::now());
                }
            }

            Some(conn) = addpeer_rx.recv() => {
                install_peer(&ctx, conn, &delpeer_tx);
            }

            Some(peer) = delpeer_rx.recv() => {
                let mut peers = ctx.peers.lock();
                if peers.get(&peer.id()).is_some_and(|p| p.is_closed()) {
                    peers.remove(&peer.id());
                    debug!(id = %peer.id(), "peer removed");
                }
            }

            Some(node) = addstatic_rx.recv() => {
                scheduler.add_static(node);
            }

            Some(id) = rmstatic_rx.recv() => {
                scheduler.remove_static(&id);
                let peer = ctx.peers.lock().remove(&id);
                if let Some(peer) = peer {
                    peer.close();
                }
            }
        }
    }
}

/// Installs a handshaken connection as a peer, enforcing one session per
/// node id.
fn install_peer(ctx: &Arc<RunCtx>, conn: PeerConn, delpeer_tx: &mpsc::UnboundedSender<Peer>) {
    let id = conn.remote_id().expect("handshaken connection has an id");
    if id == ctx.self_id {
        debug!("dropping connection to self");
        return;
    }
    {
        let mut peers = ctx.peers.lock();
        if peers.contains_key(&id) {
            debug!(%id, "duplicate session dropped");
            return;
        }
        let peer = Peer::spawn(
            conn,
            &ctx.protocols,
            ctx.encoder.clone(),
            ctx.heartbeat_interval,
            ctx.liveness_timeout,
        );
        peers.insert(id, peer.clone());
        info!(%id, flags = %peer.flags(), "peer connected");

        let delpeer_tx = delpeer_tx.clone();
        tokio::spawn(async move {
            peer.run().await;
            let _ = delpeer_tx.send(peer);
        });
    }
}

/// Runs one scheduler task to completion, returning it (with results, for
/// discover tasks) for the scheduler's bookkeeping.
async fn execute_task(task: DialTask, ctx: Arc<RunCtx>) -> DialTask {
    match task {
        DialTask::Dial { flags, dest } => {
            dial(&ctx, flags, &dest).await;
            DialTask::Dial { flags, dest }
        }
        DialTask::Discover { bootstrap: true, .. } => {
            if let Some(table) = &ctx.table {
                table.bootstrap(ctx.bootstrap_nodes.clone()).await;
            }
            DialTask::Discover {
                bootstrap: true,
                results: Vec::new(),
            }
        }
        DialTask::Discover { bootstrap: false, .. } => {
            // Lookups are throttled; sleep off the remainder of the window.
            {
                let mut last = ctx.last_lookup.lock().await;
                let next = *last + LOOKUP_INTERVAL;
                let now = Instant::now();
                if now < next {
                    tokio::time::sleep_until(next).await;
                }
                *last = Instant::now();
            }
            let results = match &ctx.table {
                Some(table) => {
                    let mut target = [0u8; crate::identity::NODE_ID_LEN];
                    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut target);
                    table.lookup(NodeId::from_bytes(target)).await
                }
                None => Vec::new(),
            };
            DialTask::Discover {
                bootstrap: false,
                results,
            }
        }
        DialTask::WaitExpire { duration } => {
            tokio::time::sleep(duration).await;
            DialTask::WaitExpire { duration }
        }
    }
}

/// Dials a node and runs the client handshake; successes flow back to the
/// run loop through the add-peer channel.
async fn dial(ctx: &Arc<RunCtx>, flags: PeerFlags, dest: &Node) {
    let addr = dest.tcp_addr();
    let stream = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            debug!(%addr, error = %err, "dial failed");
            return;
        }
        Err(_) => {
            debug!(%addr, "dial timed out");
            return;
        }
    };
    let mut conn = PeerConn::new(stream, ctx.self_id, flags, Some(dest.id));
    match conn.client_handshake().await {
        Ok(()) => {
            debug!(id = %dest.id, %addr, "outbound handshake complete");
            let _ = ctx.addpeer_tx.send(conn);
        }
        Err(err) => {
            debug!(id = %dest.id, %addr, error = %err, "outbound handshake failed");
        }
    }
}
