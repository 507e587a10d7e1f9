//! # Dial Scheduler
//!
//! Decides which nodes to contact, when, and how often. The scheduler is a
//! pure state machine: the server's run loop asks it for new tasks on every
//! iteration and reports completions back; the scheduler itself never
//! touches a socket.
//!
//! ## Policy
//!
//! 1. Expire the redial history.
//! 2. Compute the dynamic-dial budget: the cap minus connected dynamic
//!    peers minus dynamic dials already in flight.
//! 3. Always dial static nodes that are not connected, dialing, or cooling
//!    down.
//! 4. Once bootstrapped, fill half the remaining budget from a random
//!    routing-table sample.
//! 5. Fill the rest from the lookup buffer.
//! 6. When the buffer cannot cover the budget and no lookup is running,
//!    emit a discover task (the very first one bootstraps).
//! 7. When nothing is running and nothing was produced, wait for the
//!    earliest history entry to expire instead of busy-spinning.
//!
//! Completed dials enter a 30-second cooldown history; lookups are
//! throttled to one per 4 seconds by the task executor.

use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::conn::{PeerFlags, FLAG_DYNAMIC, FLAG_OUTBOUND, FLAG_STATIC};
use crate::identity::{Node, NodeId};

/// Cooldown between redial attempts for the same node.
pub const DIAL_HISTORY_EXPIRATION: Duration = Duration::from_secs(30);

/// Minimum spacing between discovery lookups.
pub const LOOKUP_INTERVAL: Duration = Duration::from_secs(4);

/// The closed set of things the run loop can be asked to do.
#[derive(Debug, Clone)]
pub enum DialTask {
    /// Open a TCP connection to `dest` and run the client handshake.
    Dial { flags: PeerFlags, dest: Node },
    /// Bootstrap the table, or run one (throttled) random lookup. The
    /// executor fills `results` before reporting the task done.
    Discover { bootstrap: bool, results: Vec<Node> },
    /// Sleep; used to park the run loop while every candidate cools down.
    WaitExpire { duration: Duration },
}

/// An entry in the redial cooldown history.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PastDial {
    id: NodeId,
    expires: Instant,
}

// BinaryHeap is a max-heap; reverse the ordering to pop the earliest expiry.
impl Ord for PastDial {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .expires
            .cmp(&self.expires)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for PastDial {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of recent dials by expiry time.
#[derive(Default)]
struct DialHistory(BinaryHeap<PastDial>);

impl DialHistory {
    fn add(&mut self, id: NodeId, expires: Instant) {
        self.0.push(PastDial { id, expires });
    }

    fn contains(&self, id: &NodeId) -> bool {
        self.0.iter().any(|past| past.id == *id)
    }

    /// Drops entries whose cooldown has passed. Entries leave only through
    /// this expiry, and only strictly after their stamp.
    fn expire(&mut self, now: Instant) {
        while self.0.peek().is_some_and(|past| past.expires < now) {
            self.0.pop();
        }
    }

    fn min_expiry(&self) -> Option<Instant> {
        self.0.peek().map(|past| past.expires)
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

/// The routing-table surface the scheduler samples candidates from.
pub trait DiscoverTable: Send + Sync {
    fn read_random_nodes(&self, max: usize) -> Vec<Node>;
}

impl DiscoverTable for crate::table::Table {
    fn read_random_nodes(&self, max: usize) -> Vec<Node> {
        crate::table::Table::read_random_nodes(self, max)
    }
}

/// Dial scheduling state. Owned by the server's run loop.
pub struct DialScheduler<T: DiscoverTable + ?Sized> {
    table: Option<std::sync::Arc<T>>,
    static_nodes: HashMap<NodeId, Node>,
    dialing: HashMap<NodeId, PeerFlags>,
    lookup_buf: Vec<Node>,
    max_dyn_dials: usize,
    lookup_running: bool,
    bootstrapped: bool,
    hist: DialHistory,
}

impl<T: DiscoverTable + ?Sized> DialScheduler<T> {
    pub fn new(
        static_nodes: Vec<Node>,
        table: Option<std::sync::Arc<T>>,
        max_dyn_dials: usize,
    ) -> Self {
        let mut scheduler = Self {
            table,
            static_nodes: HashMap::new(),
            dialing: HashMap::new(),
            lookup_buf: Vec::new(),
            max_dyn_dials,
            lookup_running: false,
            bootstrapped: false,
            hist: DialHistory::default(),
        };
        for node in static_nodes {
            scheduler.add_static(node);
        }
        scheduler
    }

    pub fn add_static(&mut self, node: Node) {
        self.static_nodes.insert(node.id, node);
    }

    pub fn remove_static(&mut self, id: &NodeId) {
        self.static_nodes.remove(id);
    }

    /// Produces the next batch of tasks given the number of tasks already
    /// running and the currently connected peers.
    pub fn new_tasks(
        &mut self,
        n_running: usize,
        peers: &HashMap<NodeId, PeerFlags>,
        now: Instant,
    ) -> Vec<DialTask> {
        let mut tasks = Vec::new();
        self.hist.expire(now);

        let mut need_dyn_dials = self.max_dyn_dials;
        need_dyn_dials -= peers
            .values()
            .filter(|flags| flags.contains(FLAG_DYNAMIC))
            .count()
            .min(need_dyn_dials);
        need_dyn_dials -= self
            .dialing
            .values()
            .filter(|flags| flags.contains(FLAG_DYNAMIC))
            .count()
            .min(need_dyn_dials);

        let mut add_dial = |scheduler: &mut Self, tasks: &mut Vec<DialTask>, flags, node: &Node| {
            if scheduler.dialing.contains_key(&node.id)
                || peers.contains_key(&node.id)
                || scheduler.hist.contains(&node.id)
            {
                return false;
            }
            scheduler.dialing.insert(node.id, flags);
            tasks.push(DialTask::Dial {
                flags,
                dest: node.clone(),
            });
            true
        };

        let statics: Vec<Node> = self.static_nodes.values().cloned().collect();
        for node in &statics {
            add_dial(self, &mut tasks, FLAG_OUTBOUND | FLAG_STATIC, node);
        }

        let random_candidates = need_dyn_dials / 2;
        if random_candidates > 0 && self.bootstrapped {
            if let Some(table) = self.table.clone() {
                let sample = table.read_random_nodes(self.max_dyn_dials / 2);
                for node in sample.iter().take(random_candidates) {
                    if add_dial(self, &mut tasks, FLAG_OUTBOUND | FLAG_DYNAMIC, node) {
                        need_dyn_dials -= 1;
                    }
                }
            }
        }

        let mut consumed = 0;
        let buffered: Vec<Node> = self.lookup_buf.clone();
        for node in &buffered {
            if need_dyn_dials == 0 {
                break;
            }
            consumed += 1;
            if add_dial(self, &mut tasks, FLAG_OUTBOUND | FLAG_DYNAMIC, node) {
                need_dyn_dials -= 1;
            }
        }
        self.lookup_buf.drain(..consumed);

        if self.lookup_buf.len() < need_dyn_dials && !self.lookup_running {
            self.lookup_running = true;
            tasks.push(DialTask::Discover {
                bootstrap: !self.bootstrapped,
                results: Vec::new(),
            });
        }

        if n_running == 0 && tasks.is_empty() && self.hist.len() > 0 {
            let duration = self
                .hist
                .min_expiry()
                .expect("history non-empty")
                .saturating_duration_since(now);
            tasks.push(DialTask::WaitExpire { duration });
        }

        trace!(
            produced = tasks.len(),
            dialing = self.dialing.len(),
            cooling = self.hist.len(),
            "dial scheduling tick"
        );
        tasks
    }

    /// Absorbs a completed task back into the scheduling state.
    pub fn task_done(&mut self, task: &DialTask, now: Instant) {
        match task {
            DialTask::Dial { dest, .. } => {
                self.hist.add(dest.id, now + DIAL_HISTORY_EXPIRATION);
                self.dialing.remove(&dest.id);
            }
            DialTask::Discover { bootstrap, results } => {
                if *bootstrap {
                    self.bootstrapped = true;
                }
                self.lookup_running = false;
                self.lookup_buf.extend(results.iter().cloned());
            }
            DialTask::WaitExpire { .. } => {}
        }
    }
}
