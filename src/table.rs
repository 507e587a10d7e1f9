//! # Routing Table
//!
//! Kademlia-style routing table over 257 distance buckets, with bonding as
//! the liveness gate for entry.
//!
//! ## Buckets
//!
//! Bucket `i` holds up to 16 nodes whose hash is at log-distance `i` from
//! our own hash. The most recently active entry sits at the front; eviction
//! candidates are taken from the tail. A full bucket only replaces its tail
//! when the tail stops answering pings.
//!
//! ## Bonding
//!
//! A node becomes usable only after a mutual ping/pong exchange in the
//! current lifetime. Bonding is capped at 16 concurrent exchanges, and
//! concurrent calls for the same id coalesce onto one in-flight exchange.
//! A node already in the database with no recent findnode failures skips
//! the exchange entirely.
//!
//! ## Lookup
//!
//! [`Table::lookup`] runs the iterative Kademlia search with concurrency 3,
//! bonding every returned node before merging it into the result set. Nodes
//! that fail five findnode queries in a row are evicted from their bucket
//! (not from the database; a later query may re-bond them).

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::RngCore;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::identity::{distcmp, logdist, Node, NodeHash, NodeId, HASH_BITS};
use crate::nodedb::NodeDb;
use crate::storage::StorageError;
use crate::udp::Discovery;

/// Kademlia concurrency factor.
pub const ALPHA: usize = 3;

/// Kademlia bucket size.
pub const BUCKET_SIZE: usize = 16;

/// One bucket per log-distance, plus the zero bucket.
pub const N_BUCKETS: usize = HASH_BITS + 1;

/// Cap on concurrently running bonding exchanges.
pub const MAX_BONDING_PINGPONGS: usize = 16;

/// Findnode failures after which a node is evicted from its bucket.
pub const MAX_FINDNODE_FAILURES: u32 = 5;

/// Schema version of the node database.
pub const DB_VERSION: u32 = 4;

struct Bucket {
    last_lookup: Instant,
    entries: Vec<Node>,
}

impl Bucket {
    fn new() -> Self {
        Self {
            last_lookup: Instant::now(),
            entries: Vec::new(),
        }
    }

    /// Moves an existing entry for `n.id` to the front. Returns false when
    /// the bucket does not contain the id.
    fn bump(&mut self, n: &Node) -> bool {
        match self.entries.iter().position(|e| e.id == n.id) {
            Some(i) => {
                let entry = self.entries.remove(i);
                self.entries.insert(0, entry);
                true
            }
            None => false,
        }
    }
}

struct TableState {
    buckets: Vec<Bucket>,
    nursery: Vec<Node>,
}

/// Completion record shared by concurrent bonds for the same id.
#[derive(Clone)]
struct BondFlight {
    done: watch::Receiver<bool>,
    result: Arc<OnceLock<Option<Node>>>,
}

pub struct Table {
    state: Mutex<TableState>,
    bonding: Mutex<HashMap<NodeId, BondFlight>>,
    bond_slots: Semaphore,
    db: Arc<NodeDb>,
    net: Arc<dyn Discovery>,
    self_node: Node,
}

impl Table {
    /// Builds an empty table backed by the node database at `db_path` (an
    /// in-memory database when `None`).
    pub fn new(
        net: Arc<dyn Discovery>,
        self_id: NodeId,
        our_addr: SocketAddr,
        db_path: Option<&Path>,
    ) -> Result<Arc<Self>, StorageError> {
        let db = Arc::new(NodeDb::open(db_path, DB_VERSION, self_id)?);
        let mut buckets = Vec::with_capacity(N_BUCKETS);
        buckets.resize_with(N_BUCKETS, Bucket::new);
        Ok(Arc::new(Self {
            state: Mutex::new(TableState {
                buckets,
                nursery: Vec::new(),
            }),
            bonding: Mutex::new(HashMap::new()),
            bond_slots: Semaphore::new(MAX_BONDING_PINGPONGS),
            db,
            net,
            self_node: Node::new(our_addr.ip(), our_addr.port(), our_addr.port(), self_id),
        }))
    }

    /// The local node's own record.
    pub fn self_node(&self) -> &Node {
        &self.self_node
    }

    pub fn db(&self) -> &Arc<NodeDb> {
        &self.db
    }

    /// Total entries across all buckets.
    pub fn len(&self) -> usize {
        self.state.lock().buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flushes the node database and shuts the transport down.
    pub fn close(&self) {
        self.db.close();
        self.net.close();
    }

    /// Installs the bootstrap node list and refreshes. These nodes seed the
    /// table whenever it is otherwise empty.
    pub async fn bootstrap(self: &Arc<Self>, nodes: Vec<Node>) {
        {
            let mut state = self.state.lock();
            state.nursery = nodes;
        }
        self.refresh().await;
    }

    /// Returns up to `max` random nodes drawn across all non-empty buckets,
    /// never repeating a node.
    pub fn read_random_nodes(&self, max: usize) -> Vec<Node> {
        let state = self.state.lock();
        let mut per_bucket: Vec<&[Node]> = state
            .buckets
            .iter()
            .filter(|b| !b.entries.is_empty())
            .map(|b| b.entries.as_slice())
            .collect();
        if per_bucket.is_empty() || max == 0 {
            return Vec::new();
        }
        per_bucket.shuffle(&mut rand::thread_rng());

        // Round-robin over the bucket heads so no single bucket dominates.
        let mut out = Vec::with_capacity(max);
        let mut j = 0;
        while out.len() < max && !per_bucket.is_empty() {
            j %= per_bucket.len();
            let (head, rest) = per_bucket[j].split_first().expect("bucket non-empty");
            out.push(head.clone());
            if rest.is_empty() {
                per_bucket.remove(j);
            } else {
                per_bucket[j] = rest;
                j += 1;
            }
        }
        out
    }

    /// Performs a network search for nodes close to `target_id`, querying
    /// closer nodes on every iteration. The target does not need to be an
    /// actual node identifier.
    pub async fn lookup(self: &Arc<Self>, target_id: NodeId) -> Vec<Node> {
        let target = target_id.hash();
        let mut asked: HashSet<NodeId> = HashSet::new();
        let mut seen: HashSet<NodeId> = HashSet::new();
        asked.insert(self.self_node.id);

        let mut result = {
            let mut state = self.state.lock();
            let index = logdist(self.self_node.hash.as_bytes(), target.as_bytes());
            state.buckets[index].last_lookup = Instant::now();
            let mut initial = NodesByDistance::new(target);
            for bucket in &state.buckets {
                for node in &bucket.entries {
                    initial.push(node.clone(), BUCKET_SIZE);
                }
            }
            initial
        };

        if result.entries.is_empty() {
            // Everything was dropped; fall back to seeding.
            self.refresh().await;
            return Vec::new();
        }
        for node in &result.entries {
            seen.insert(node.id);
        }

        let (reply_tx, mut reply_rx) = mpsc::channel::<Vec<Node>>(ALPHA);
        let mut pending_queries = 0usize;
        loop {
            let mut i = 0;
            while i < result.entries.len() && pending_queries < ALPHA {
                let node = result.entries[i].clone();
                i += 1;
                if !asked.insert(node.id) {
                    continue;
                }
                pending_queries += 1;
                let table = Arc::clone(self);
                let reply_tx = reply_tx.clone();
                tokio::spawn(async move {
                    let nodes = match table.net.find_node(node.id, node.udp_addr(), target_id).await
                    {
                        Ok(nodes) => nodes,
                        Err(failure) => {
                            let fails = table.db.find_fails(&node.id) + 1;
                            if table.db.update_find_fails(&node.id, fails).is_err() {
                                let _ = reply_tx.send(Vec::new()).await;
                                return;
                            }
                            trace!(id = %node.id, fails, "bumping findnode failures");
                            if fails >= MAX_FINDNODE_FAILURES {
                                debug!(id = %node.id, fails, "evicting node after findnode failures");
                                table.remove(&node);
                            }
                            // Fragments received before the failure are
                            // still worth bonding with.
                            failure.partial
                        }
                    };
                    let bonded = table.bond_all(nodes).await;
                    let _ = reply_tx.send(bonded).await;
                });
            }
            if pending_queries == 0 {
                break;
            }
            let batch = reply_rx.recv().await.unwrap_or_default();
            for node in batch {
                if seen.insert(node.id) {
                    result.push(node, BUCKET_SIZE);
                }
            }
            pending_queries -= 1;
        }
        result.entries
    }

    /// Keeps buckets fresh: looks up a random target, or seeds the table
    /// from the database and nursery when it is empty.
    ///
    /// Returns a boxed future: refresh and lookup call each other, and one
    /// side of the cycle needs an erased type.
    pub fn refresh(self: &Arc<Self>) -> BoxFuture<'static, ()> {
        let table = Arc::clone(self);
        Box::pin(async move {
            let mut seed = {
                let state = table.state.lock();
                state.buckets.iter().all(|b| b.entries.is_empty())
            };

            if !seed {
                // The findnode target is id-sized, so there is no way to
                // aim a hash at a chosen bucket; a random target has to do.
                let mut target = [0u8; crate::identity::NODE_ID_LEN];
                rand::thread_rng().fill_bytes(&mut target);
                let found = table.lookup(NodeId::from_bytes(target)).await;
                if found.is_empty() {
                    seed = true;
                }
            }

            if seed {
                let mut nodes = table.state.lock().nursery.clone();
                nodes.extend(table.db.query_seeds(10));
                let bonded = table.bond_all(nodes).await;
                if !bonded.is_empty() {
                    table.lookup(table.self_node.id).await;
                }
            }
        })
    }

    /// The `n` known nodes closest to `target`.
    pub fn closest(&self, target: &NodeHash, n: usize) -> Vec<Node> {
        let state = self.state.lock();
        let mut close = NodesByDistance::new(*target);
        for bucket in &state.buckets {
            for node in &bucket.entries {
                close.push(node.clone(), n);
            }
        }
        close.entries
    }

    /// Bonds with all given nodes concurrently, returning those for which
    /// bonding probably succeeded.
    pub async fn bond_all(self: &Arc<Self>, nodes: Vec<Node>) -> Vec<Node> {
        let mut join = JoinSet::new();
        for node in nodes {
            let table = Arc::clone(self);
            join.spawn(async move { table.bond(false, node.id, node.udp_addr(), node.tcp).await });
        }
        let mut bonded = Vec::new();
        while let Some(res) = join.join_next().await {
            if let Ok(Some(node)) = res {
                bonded.push(node);
            }
        }
        bonded
    }

    /// Ensures a mutual ping/pong exchange with `id` has happened in the
    /// current lifetime, then inserts the node into its bucket.
    ///
    /// A node already in the database with no recent findnode failures
    /// skips the exchange. Concurrent callers for the same id share one
    /// in-flight exchange. When `pinged` is set the remote has just pinged
    /// us and the reciprocal wait is skipped.
    pub async fn bond(
        self: &Arc<Self>,
        pinged: bool,
        id: NodeId,
        addr: SocketAddr,
        tcp_port: u16,
    ) -> Option<Node> {
        let mut node = self.db.node(&id);
        let fails = match node {
            Some(_) => self.db.find_fails(&id),
            None => 0,
        };

        if node.is_none() || fails > 0 {
            enum Role {
                Holder(watch::Sender<bool>, Arc<OnceLock<Option<Node>>>),
                Waiter(BondFlight),
            }
            let role = {
                let mut bonding = self.bonding.lock();
                match bonding.get(&id) {
                    Some(flight) => Role::Waiter(flight.clone()),
                    None => {
                        let (tx, rx) = watch::channel(false);
                        let result = Arc::new(OnceLock::new());
                        bonding.insert(
                            id,
                            BondFlight {
                                done: rx,
                                result: Arc::clone(&result),
                            },
                        );
                        Role::Holder(tx, result)
                    }
                }
            };
            match role {
                Role::Waiter(mut flight) => {
                    let _ = flight.done.wait_for(|done| *done).await;
                    if let Some(Some(n)) = flight.result.get() {
                        node = Some(n.clone());
                    }
                }
                Role::Holder(tx, result) => {
                    let outcome = self.pingpong(pinged, id, addr, tcp_port).await;
                    self.bonding.lock().remove(&id);
                    if let Some(n) = &outcome {
                        node = Some(n.clone());
                    }
                    let _ = result.set(outcome);
                    let _ = tx.send(true);
                }
            }
        }

        // Even when the exchange failed, a previously known node gets
        // another chance in its bucket.
        let node = node?;
        self.add_bonded(node.clone()).await;
        if let Err(err) = self.db.update_find_fails(&id, 0) {
            warn!(id = %id, error = %err, "resetting findnode failures failed");
        }
        Some(node)
    }

    async fn pingpong(
        &self,
        pinged: bool,
        id: NodeId,
        addr: SocketAddr,
        tcp_port: u16,
    ) -> Option<Node> {
        let _slot = self
            .bond_slots
            .acquire()
            .await
            .expect("bond semaphore never closes");
        if let Err(err) = self.ping_node(id, addr).await {
            trace!(id = %id, error = %err, "bond ping failed");
            return None;
        }
        if !pinged {
            // Give the remote a chance to ping us before findnode requests
            // start. If it still remembers the bond this simply times out.
            let _ = self.net.wait_ping(id).await;
        }
        let node = Node::new(addr.ip(), addr.port(), tcp_port, id);
        if let Err(err) = self.db.update_node(&node) {
            warn!(id = %id, error = %err, "storing bonded node failed");
        }
        Some(node)
    }

    /// Pings a remote endpoint and records the attempt and the answer in
    /// the node database.
    async fn ping_node(&self, id: NodeId, addr: SocketAddr) -> Result<(), crate::udp::TransportError> {
        let _ = self.db.update_last_ping(&id, crate::nodedb::now_unix());
        self.net.ping(id, addr).await?;
        let _ = self.db.update_last_pong(&id, crate::nodedb::now_unix());
        self.db.ensure_expirer();
        Ok(())
    }

    /// Inserts a freshly bonded node into its bucket: bump if present, push
    /// to the front if there is room, otherwise challenge the tail.
    pub(crate) async fn add_bonded(self: &Arc<Self>, node: Node) {
        if node.id == self.self_node.id {
            return;
        }
        let tail = {
            let mut state = self.state.lock();
            let index = logdist(self.self_node.hash.as_bytes(), node.hash.as_bytes());
            let bucket = &mut state.buckets[index];
            if bucket.bump(&node) {
                return;
            }
            if bucket.entries.len() < BUCKET_SIZE {
                bucket.entries.insert(0, node);
                return;
            }
            bucket.entries.last().expect("full bucket").clone()
        };

        // Full bucket: the newcomer only displaces a tail that has gone
        // quiet. The lock is not held across the ping.
        if self.ping_node(tail.id, tail.udp_addr()).await.is_ok() {
            return;
        }
        let mut state = self.state.lock();
        let index = logdist(self.self_node.hash.as_bytes(), node.hash.as_bytes());
        let bucket = &mut state.buckets[index];
        // Re-check: the bucket may have changed while the tail was pinged.
        if let Some(pos) = bucket.entries.iter().position(|e| e.id == tail.id) {
            bucket.entries.remove(pos);
        }
        if !bucket.entries.iter().any(|e| e.id == node.id) {
            bucket.entries.insert(0, node);
            bucket.entries.truncate(BUCKET_SIZE);
        }
    }

    /// Drops a node from its bucket (the database keeps its record).
    pub(crate) fn remove(&self, node: &Node) {
        let mut state = self.state.lock();
        let index = logdist(self.self_node.hash.as_bytes(), node.hash.as_bytes());
        let bucket = &mut state.buckets[index];
        bucket.entries.retain(|e| e.id != node.id);
    }
}

/// Nodes ordered by XOR distance to a target, capped in length.
pub(crate) struct NodesByDistance {
    pub entries: Vec<Node>,
    target: NodeHash,
}

impl NodesByDistance {
    pub fn new(target: NodeHash) -> Self {
        Self {
            entries: Vec::new(),
            target,
        }
    }

    /// Inserts `n` in distance order, keeping at most `max_elems` entries.
    /// A node farther than everything in a full list is dropped.
    pub fn push(&mut self, n: Node, max_elems: usize) {
        let ix = self.entries.partition_point(|e| {
            distcmp(self.target.as_bytes(), e.hash.as_bytes(), n.hash.as_bytes())
                != std::cmp::Ordering::Greater
        });
        if ix >= max_elems {
            return;
        }
        self.entries.insert(ix, n);
        self.entries.truncate(max_elems);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::udp::{FindNodeFailure, TransportError};
    use async_trait::async_trait;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn rand_id() -> NodeId {
        let mut id = [0u8; crate::identity::NODE_ID_LEN];
        rand::thread_rng().fill_bytes(&mut id);
        NodeId::from_bytes(id)
    }

    fn node_at(id: NodeId, port: u16) -> Node {
        Node::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port, port, id)
    }

    /// Mock transport: pings always succeed, nobody pings back, findnode
    /// answers from a fixed universe with the closest nodes that are
    /// strictly closer to the target than the queried node itself.
    struct MockDiscovery {
        universe: Mutex<Vec<Node>>,
        pings: Mutex<HashMap<NodeId, usize>>,
        concurrent_pings: AtomicUsize,
        max_concurrent_pings: AtomicUsize,
        gate: watch::Sender<bool>,
        ping_fails: Mutex<HashSet<NodeId>>,
    }

    impl MockDiscovery {
        fn new() -> Arc<Self> {
            let (gate, _) = watch::channel(true);
            Arc::new(Self {
                universe: Mutex::new(Vec::new()),
                pings: Mutex::new(HashMap::new()),
                concurrent_pings: AtomicUsize::new(0),
                max_concurrent_pings: AtomicUsize::new(0),
                gate,
                ping_fails: Mutex::new(HashSet::new()),
            })
        }

        fn gated() -> Arc<Self> {
            let mock = Self::new();
            let _ = mock.gate.send(false);
            mock
        }

        fn open_gate(&self) {
            let _ = self.gate.send(true);
        }

        fn ping_count(&self, id: &NodeId) -> usize {
            self.pings.lock().get(id).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl Discovery for MockDiscovery {
        async fn ping(&self, to: NodeId, _addr: SocketAddr) -> Result<(), TransportError> {
            *self.pings.lock().entry(to).or_insert(0) += 1;
            let active = self.concurrent_pings.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent_pings.fetch_max(active, Ordering::SeqCst);
            let mut gate = self.gate.subscribe();
            let _ = gate.wait_for(|open| *open).await;
            self.concurrent_pings.fetch_sub(1, Ordering::SeqCst);
            if self.ping_fails.lock().contains(&to) {
                return Err(TransportError::Timeout);
            }
            Ok(())
        }

        async fn wait_ping(&self, _from: NodeId) -> Result<(), TransportError> {
            Ok(())
        }

        async fn find_node(
            &self,
            to: NodeId,
            _addr: SocketAddr,
            target: NodeId,
        ) -> Result<Vec<Node>, FindNodeFailure> {
            let target_hash = target.hash();
            let to_hash = to.hash();
            let mut candidates: Vec<Node> = self
                .universe
                .lock()
                .iter()
                .filter(|n| {
                    distcmp(
                        target_hash.as_bytes(),
                        n.hash.as_bytes(),
                        to_hash.as_bytes(),
                    ) == std::cmp::Ordering::Less
                })
                .cloned()
                .collect();
            candidates.sort_by(|a, b| {
                distcmp(target_hash.as_bytes(), a.hash.as_bytes(), b.hash.as_bytes())
            });
            candidates.truncate(ALPHA);
            Ok(candidates)
        }

        fn close(&self) {}
    }

    fn new_table(net: Arc<dyn Discovery>) -> Arc<Table> {
        Table::new(
            net,
            rand_id(),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 30300),
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn bonded_nodes_land_in_their_bucket() {
        let mock = MockDiscovery::new();
        let table = new_table(mock.clone());
        for port in 1..=20u16 {
            table.bond(false, rand_id(), addr(port), port).await;
        }
        assert!(table.len() > 0);

        // Bucket invariant: every entry's log-distance equals its index.
        let state = table.state.lock();
        for (index, bucket) in state.buckets.iter().enumerate() {
            for entry in &bucket.entries {
                assert_eq!(
                    logdist(table.self_node.hash.as_bytes(), entry.hash.as_bytes()),
                    index
                );
            }
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    #[tokio::test]
    async fn concurrent_bonds_share_one_exchange() {
        let mock = MockDiscovery::gated();
        let table = new_table(mock.clone());
        let id = rand_id();

        let mut join = JoinSet::new();
        for _ in 0..5 {
            let table = Arc::clone(&table);
            join.spawn(async move { table.bond(false, id, addr(4000), 4000).await });
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        mock.open_gate();
        let mut bonded = 0;
        while let Some(res) = join.join_next().await {
            if matches!(res, Ok(Some(_))) {
                bonded += 1;
            }
        }
        assert_eq!(bonded, 5, "all callers observe the shared result");
        assert_eq!(mock.ping_count(&id), 1, "exactly one exchange on the wire");
    }

    #[tokio::test]
    async fn bonding_concurrency_is_capped() {
        let mock = MockDiscovery::gated();
        let table = new_table(mock.clone());

        let mut join = JoinSet::new();
        for port in 1..=20u16 {
            let table = Arc::clone(&table);
            let id = rand_id();
            join.spawn(async move { table.bond(false, id, addr(port), port).await });
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let in_flight = mock.concurrent_pings.load(Ordering::SeqCst);
        assert!(
            (1..=MAX_BONDING_PINGPONGS).contains(&in_flight),
            "{in_flight} bonds in flight"
        );
        mock.open_gate();
        while join.join_next().await.is_some() {}
        assert!(mock.max_concurrent_pings.load(Ordering::SeqCst) <= MAX_BONDING_PINGPONGS);
    }

    #[tokio::test]
    async fn full_bucket_keeps_live_tail_and_evicts_dead_tail() {
        let mock = MockDiscovery::new();
        let table = new_table(mock.clone());

        // Craft ids landing in one bucket by rejection sampling.
        let bucket_of = |table: &Table, n: &Node| {
            logdist(table.self_node.hash.as_bytes(), n.hash.as_bytes())
        };
        let mut in_bucket = Vec::new();
        while in_bucket.len() < BUCKET_SIZE + 2 {
            let n = node_at(rand_id(), 1000 + in_bucket.len() as u16);
            if bucket_of(&table, &n) == HASH_BITS {
                in_bucket.push(n);
            }
        }
        let newcomer_a = in_bucket.pop().unwrap();
        let newcomer_b = in_bucket.pop().unwrap();
        for n in &in_bucket {
            table.add_bonded(n.clone()).await;
        }
        assert_eq!(table.len(), BUCKET_SIZE);
        let tail = in_bucket[0].clone(); // first inserted is now the tail

        // Live tail: the newcomer is dropped.
        table.add_bonded(newcomer_a.clone()).await;
        assert_eq!(table.len(), BUCKET_SIZE);
        assert!(table.closest(&newcomer_a.id.hash(), 1)[0].id != newcomer_a.id);

        // Dead tail: the newcomer replaces it.
        mock.ping_fails.lock().insert(tail.id);
        table.add_bonded(newcomer_b.clone()).await;
        assert_eq!(table.len(), BUCKET_SIZE);
        let ids: Vec<NodeId> = table
            .closest(&table.self_node.id.hash(), BUCKET_SIZE)
            .iter()
            .map(|n| n.id)
            .collect();
        assert!(ids.contains(&newcomer_b.id));
        assert!(!ids.contains(&tail.id));
    }

    #[tokio::test]
    async fn lookup_converges_to_closest_nodes() {
        let mock = MockDiscovery::new();
        let table = new_table(mock.clone());
        let target = rand_id();
        let target_hash = target.hash();

        // A universe of sixty nodes; seed the table with sixteen of them.
        let universe: Vec<Node> = (0..60u16).map(|i| node_at(rand_id(), 2000 + i)).collect();
        *mock.universe.lock() = universe.clone();
        for n in universe.iter().take(BUCKET_SIZE) {
            table.add_bonded(n.clone()).await;
        }

        let found = table.lookup(target).await;

        assert!(!found.is_empty());
        assert!(found.len() <= BUCKET_SIZE);
        // Distinct and sorted ascending by distance to the target.
        let mut ids = HashSet::new();
        for n in &found {
            assert!(ids.insert(n.id), "duplicate node {} in result", n.id);
        }
        for pair in found.windows(2) {
            assert_ne!(
                distcmp(
                    target_hash.as_bytes(),
                    pair[0].hash.as_bytes(),
                    pair[1].hash.as_bytes()
                ),
                std::cmp::Ordering::Greater
            );
        }
        // The mock only ever reveals the three globally closest nodes, so
        // the reachable set is the seeds plus those three; the result must
        // be the sixteen closest of that union.
        let mut best: Vec<Node> = universe.clone();
        best.sort_by(|a, b| distcmp(target_hash.as_bytes(), a.hash.as_bytes(), b.hash.as_bytes()));
        let mut reachable: Vec<Node> = universe.iter().take(BUCKET_SIZE).cloned().collect();
        for n in best.iter().take(ALPHA) {
            if !reachable.iter().any(|r| r.id == n.id) {
                reachable.push(n.clone());
            }
        }
        reachable
            .sort_by(|a, b| distcmp(target_hash.as_bytes(), a.hash.as_bytes(), b.hash.as_bytes()));
        let want: HashSet<NodeId> = reachable.iter().take(found.len()).map(|n| n.id).collect();
        let got: HashSet<NodeId> = found.iter().map(|n| n.id).collect();
        assert_eq!(got, want);
    }

    #[tokio::test]
    async fn refresh_seeds_from_database() {
        let dir = tempfile::tempdir().unwrap();
        let self_id = rand_id();
        {
            let db = NodeDb::open(Some(dir.path()), DB_VERSION, self_id).unwrap();
            for i in 0..4u16 {
                db.update_node(&node_at(rand_id(), 5000 + i)).unwrap();
            }
            db.close();
        }

        let mock = MockDiscovery::new();
        let table = Table::new(
            mock.clone() as Arc<dyn Discovery>,
            self_id,
            addr(30300),
            Some(dir.path()),
        )
        .unwrap();
        assert_eq!(table.len(), 0);

        table.refresh().await;
        assert!(table.len() >= 1, "seed replay should populate buckets");
    }

    #[tokio::test]
    async fn read_random_nodes_returns_distinct_nodes() {
        let mock = MockDiscovery::new();
        let table = new_table(mock.clone());
        for i in 0..20u16 {
            table.add_bonded(node_at(rand_id(), 6000 + i)).await;
        }
        let total = table.len();

        let sample = table.read_random_nodes(10);
        assert!(sample.len() <= 10.min(total));
        let distinct: HashSet<NodeId> = sample.iter().map(|n| n.id).collect();
        assert_eq!(distinct.len(), sample.len(), "no node may repeat");

        assert!(table.read_random_nodes(0).is_empty());
        let all = table.read_random_nodes(1000);
        assert_eq!(all.len(), total);
    }

    #[test]
    fn nodes_by_distance_keeps_closest() {
        let target = rand_id().hash();
        let mut list = NodesByDistance::new(target);
        let mut nodes: Vec<Node> = (0..32u16).map(|i| node_at(rand_id(), 7000 + i)).collect();
        for n in &nodes {
            list.push(n.clone(), BUCKET_SIZE);
        }
        nodes.sort_by(|a, b| distcmp(target.as_bytes(), a.hash.as_bytes(), b.hash.as_bytes()));
        let want: Vec<NodeId> = nodes.iter().take(BUCKET_SIZE).map(|n| n.id).collect();
        let got: Vec<NodeId> = list.entries.iter().map(|n| n.id).collect();
        assert_eq!(got, want);
    }
}
