//! # Node Database
//!
//! Typed accessors over the [`Storage`](crate::storage::Storage) facade for
//! everything discovery persists about remote nodes:
//!
//! | Field | Contents |
//! |-------|----------|
//! | `:discover` | the full node record (bincode) |
//! | `:discover:lastping` | unix seconds of the last ping we sent |
//! | `:discover:lastpong` | unix seconds of the last pong we received |
//! | `:discover:findfail` | consecutive findnode failures |
//!
//! Keys are `"n:" ‖ node-id ‖ field`. Node records reuse the discovery
//! wire encoding; integer fields use bincode's varint encoding. Read
//! failures are treated as absent values.
//!
//! ## Seeding
//!
//! [`NodeDb::query_seeds`] walks the store with a persistent iterator so
//! that consecutive calls return disjoint batches; once the cursor runs off
//! the end it is dropped and the next call starts over.
//!
//! ## Expiration
//!
//! A background sweeper drops nodes that have not ponged for 24 hours. It
//! runs hourly on a single task for the database's lifetime; the first
//! successful ping/pong exchange starts it idempotently.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bincode::Options;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::identity::{Node, NodeId, NODE_ID_LEN};
use crate::storage::{Storage, StorageError, StorageIter};
use crate::wire::WireNode;

/// Key prefix for per-node items.
const ITEM_PREFIX: &[u8] = b"n:";

const DISCOVER_ROOT: &str = ":discover";
const DISCOVER_PING: &str = ":discover:lastping";
const DISCOVER_PONG: &str = ":discover:lastpong";
const DISCOVER_FINDFAIL: &str = ":discover:findfail";

/// Time after which an unseen node is dropped.
const NODE_EXPIRATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Interval between expiration sweeps.
const CLEANUP_CYCLE: Duration = Duration::from_secs(60 * 60);

/// Upper bound on a stored integer blob. Anything larger is corrupt.
const MAX_INT_BLOB_SIZE: u64 = 16;

fn record_options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_INT_BLOB_SIZE)
}

pub(crate) fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn make_key(id: &NodeId, field: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(ITEM_PREFIX.len() + NODE_ID_LEN + field.len());
    key.extend_from_slice(ITEM_PREFIX);
    key.extend_from_slice(id.as_bytes());
    key.extend_from_slice(field.as_bytes());
    key
}

/// Splits a store key back into (id, field). Keys without the node prefix
/// have no id.
fn split_key(key: &[u8]) -> Option<(NodeId, &str)> {
    let item = key.strip_prefix(ITEM_PREFIX)?;
    if item.len() < NODE_ID_LEN {
        return None;
    }
    let (id_bytes, field) = item.split_at(NODE_ID_LEN);
    let mut id = [0u8; NODE_ID_LEN];
    id.copy_from_slice(id_bytes);
    Some((NodeId::from_bytes(id), std::str::from_utf8(field).ok()?))
}

/// Persistent store of discovered nodes and their liveness bookkeeping.
pub struct NodeDb {
    store: Storage,
    self_id: NodeId,
    seeder: Mutex<Option<StorageIter>>,
    expirer_started: AtomicBool,
    quit_tx: watch::Sender<bool>,
}

impl NodeDb {
    /// Opens the database at `path` with the given schema version, falling
    /// back to an in-memory store when `path` is `None` or unopenable.
    pub fn open(path: Option<&Path>, version: u32, self_id: NodeId) -> Result<Self, StorageError> {
        let store = match Storage::open(path, version) {
            Ok(store) => store,
            Err(err) if path.is_some() => {
                warn!(error = %err, "node database open failed, using in-memory store");
                Storage::open(None, version)?
            }
            Err(err) => return Err(err),
        };
        let (quit_tx, _) = watch::channel(false);
        Ok(Self {
            store,
            self_id,
            seeder: Mutex::new(None),
            expirer_started: AtomicBool::new(false),
            quit_tx,
        })
    }

    /// The full record for `id`, if one is stored and decodes.
    pub fn node(&self, id: &NodeId) -> Option<Node> {
        let blob = self.store.get(&make_key(id, DISCOVER_ROOT)).ok()??;
        match WireNode::from_record_bytes(&blob) {
            Ok(record) => Some(Node::new(
                record.endpoint.ip,
                record.endpoint.udp,
                record.endpoint.tcp,
                record.id,
            )),
            Err(err) => {
                debug!(id = %id, error = %err, "dropping undecodable node record");
                None
            }
        }
    }

    /// Inserts, potentially overwriting, a node record. Records share the
    /// binary encoding of the discovery wire codec.
    pub fn update_node(&self, node: &Node) -> Result<(), StorageError> {
        let blob = WireNode::from_node(node).to_record_bytes();
        self.store.put(&make_key(&node.id, DISCOVER_ROOT), &blob)
    }

    /// Deletes every field stored under `id`.
    pub fn delete_node(&self, id: &NodeId) -> Result<(), StorageError> {
        for (key, _) in self.store.iter() {
            if let Some((kid, _)) = split_key(&key) {
                if kid == *id {
                    self.store.delete(&key)?;
                }
            }
        }
        Ok(())
    }

    fn fetch_i64(&self, key: &[u8]) -> i64 {
        let Ok(Some(blob)) = self.store.get(key) else {
            return 0;
        };
        record_options().deserialize(&blob).unwrap_or(0)
    }

    fn store_i64(&self, key: &[u8], value: i64) -> Result<(), StorageError> {
        let blob = record_options()
            .serialize(&value)
            .expect("varint serialization cannot fail");
        self.store.put(key, &blob)
    }

    /// Consecutive findnode failures since the last successful bond.
    pub fn find_fails(&self, id: &NodeId) -> u32 {
        self.fetch_i64(&make_key(id, DISCOVER_FINDFAIL)) as u32
    }

    pub fn update_find_fails(&self, id: &NodeId, fails: u32) -> Result<(), StorageError> {
        self.store_i64(&make_key(id, DISCOVER_FINDFAIL), fails as i64)
    }

    /// Unix seconds of the last ping sent to `id`.
    pub fn last_ping(&self, id: &NodeId) -> i64 {
        self.fetch_i64(&make_key(id, DISCOVER_PING))
    }

    pub fn update_last_ping(&self, id: &NodeId, unix_secs: i64) -> Result<(), StorageError> {
        self.store_i64(&make_key(id, DISCOVER_PING), unix_secs)
    }

    /// Unix seconds of the last pong received from `id`.
    pub fn last_pong(&self, id: &NodeId) -> i64 {
        self.fetch_i64(&make_key(id, DISCOVER_PONG))
    }

    pub fn update_last_pong(&self, id: &NodeId, unix_secs: i64) -> Result<(), StorageError> {
        self.store_i64(&make_key(id, DISCOVER_PONG), unix_secs)
    }

    /// Returns up to `n` previously-known nodes for seeding an empty table.
    ///
    /// The cursor persists across calls, so repeated queries walk disjoint
    /// sections of the store. Self-references are deleted on sight. When a
    /// pass yields nothing the cursor is released and the next call starts
    /// from the beginning.
    pub fn query_seeds(&self, n: usize) -> Vec<Node> {
        let mut seeder = self.seeder.lock();
        let iter = seeder.get_or_insert_with(|| self.store.iter());

        let mut nodes = Vec::with_capacity(n);
        for (key, _) in iter.by_ref() {
            let Some((id, field)) = split_key(&key) else {
                continue;
            };
            if field != DISCOVER_ROOT {
                continue;
            }
            if id == self.self_id {
                let _ = self.delete_node(&id);
                continue;
            }
            if let Some(node) = self.node(&id) {
                nodes.push(node);
                if nodes.len() >= n {
                    break;
                }
            }
        }
        if nodes.is_empty() {
            *seeder = None;
        }
        nodes
    }

    /// Starts the hourly expiration sweeper if it is not already running.
    pub fn ensure_expirer(self: &Arc<Self>) {
        if self
            .expirer_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let db = Arc::clone(self);
        let mut quit_rx = self.quit_tx.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(CLEANUP_CYCLE);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await; // the first tick completes immediately
            loop {
                tokio::select! {
                    _ = tick.tick() => db.expire_nodes(),
                    changed = quit_rx.changed() => {
                        if changed.is_err() || *quit_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    /// One expiration sweep: drop every node (other than self) whose last
    /// pong is older than [`NODE_EXPIRATION`].
    pub fn expire_nodes(&self) {
        let threshold = now_unix() - NODE_EXPIRATION.as_secs() as i64;
        let mut dropped = 0usize;
        for (key, _) in self.store.iter() {
            let Some((id, field)) = split_key(&key) else {
                continue;
            };
            if field != DISCOVER_ROOT {
                continue;
            }
            if id != self.self_id && self.last_pong(&id) > threshold {
                continue;
            }
            if self.delete_node(&id).is_ok() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!(dropped, "expired stale node records");
        }
    }

    /// Stops the sweeper and flushes the store.
    pub fn close(&self) {
        let _ = self.quit_tx.send(true);
        if let Some(seeder) = self.seeder.lock().take() {
            drop(seeder);
        }
        self.store.close();
    }
}
