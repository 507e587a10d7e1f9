//! # xfsnet - Node Discovery and Peer Sessions
//!
//! xfsnet is a peer-to-peer networking library combining Kademlia-style
//! node discovery over UDP with multiplexed, heartbeat-kept TCP peer
//! sessions. An application joins an overlay network, locates nodes by
//! their 512-bit identifier, establishes identity-checked sessions, and
//! exchanges typed messages over application-defined sub-protocols.
//!
//! ## Architecture
//!
//! Long-running work is structured as cooperating tokio tasks that talk
//! through typed channels; the few pieces of shared mutable state (bucket
//! contents, the bonding registry, the peer map) sit behind short-lived
//! mutexes. The pending-reply list of the UDP layer is owned by exactly
//! one task and reached only through its channels.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `server` | orchestrator: config, run loop, accept loop, peer map |
//! | `identity` | node ids, hashes, XOR distance, node URIs, keypairs |
//! | `table` | k-bucket routing table, bonding, iterative lookup |
//! | `udp` | discovery transport and pending-reply multiplexer |
//! | `wire` | discovery datagram codec (ping/pong/findnode/neighbors) |
//! | `nodedb` | persisted node records, liveness stamps, seed queries |
//! | `storage` | versioned key/value store facade |
//! | `dial` | dial scheduler: budgets, cooldown history, lookup feed |
//! | `frame` | TCP frame codec and handshake payloads |
//! | `conn` | peer connection handshake |
//! | `peer` | peer session: heartbeat, watchdog, protocol pump |
//! | `nat` | port-mapper interface and refresh task |
//!
//! ## Quick Start
//!
//! ```ignore
//! let mut config = Config::new("0.0.0.0:9090", Keypair::generate());
//! config.bootstrap_nodes = vec![Node::parse("xfsnode://10.0.0.1:9090/?id=…")?];
//!
//! let server = Server::new(config);
//! server.bind(Arc::new(MyProtocol));
//! server.start().await?;
//! ```

pub mod conn;
pub mod dial;
pub mod frame;
pub mod identity;
pub mod nat;
pub mod nodedb;
pub mod peer;
pub mod server;
pub mod storage;
pub mod table;
pub mod udp;
pub mod wire;

pub use conn::{PeerFlags, FLAG_DYNAMIC, FLAG_INBOUND, FLAG_OUTBOUND, FLAG_STATIC};
pub use identity::{Keypair, Node, NodeId, UriError};
pub use peer::{Encoder, Message, Peer, Protocol};
pub use server::{Config, Server};
pub use table::Table;
