//! Integration tests for the server public API: two real nodes on
//! localhost finding each other and exchanging sub-protocol messages.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use xfsnet::{Config, Keypair, Message, Node, Peer, Protocol, Server};

/// Allow time for handshakes and heartbeats under load.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

fn test_config(static_nodes: Vec<Node>) -> Config {
    let mut config = Config::new("127.0.0.1:0", Keypair::generate());
    config.static_nodes = static_nodes;
    config
}

async fn wait_for_peer(server: &Server) -> Peer {
    timeout(SETTLE_TIMEOUT, async {
        loop {
            if let Some(peer) = server.peers().into_iter().next() {
                return peer;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("no peer appeared in time")
}

/// Forwards every sub-protocol message to the test through a channel, then
/// stays parked until the session ends.
struct Capture {
    tx: mpsc::UnboundedSender<(xfsnet::NodeId, Message)>,
}

#[async_trait::async_trait]
impl Protocol for Capture {
    async fn run(&self, peer: Peer) -> anyhow::Result<()> {
        let mut messages = peer
            .messages()
            .await
            .ok_or_else(|| anyhow::anyhow!("message queue already taken"))?;
        while let Some(msg) = messages.recv().await {
            if self.tx.send((peer.id(), msg)).is_err() {
                break;
            }
        }
        Ok(())
    }
}

#[tokio::test]
async fn static_dial_connects_both_directions() {
    let b = Server::new(test_config(Vec::new()));
    b.start().await.expect("b start");
    let b_node = b.self_node().expect("b is running");

    let a = Server::new(test_config(vec![b_node]));
    a.start().await.expect("a start");

    let a_peer = wait_for_peer(&a).await;
    let b_peer = wait_for_peer(&b).await;
    assert_eq!(a_peer.id(), b.node_id());
    assert_eq!(b_peer.id(), a.node_id());

    // One session per node id on each side, whatever discovery does.
    assert_eq!(a.peers().len(), 1);
    assert_eq!(b.peers().len(), 1);

    // Heartbeats advance on the default one-second tick.
    let before = a_peer.last_heartbeat();
    sleep(Duration::from_millis(2500)).await;
    assert!(
        a_peer.last_heartbeat() > before,
        "no heartbeat answer within 2.5s"
    );

    a.stop();
    b.stop();
    timeout(SETTLE_TIMEOUT, a_peer.run())
        .await
        .expect("peers close on server stop");
    assert!(a.peers().is_empty());
}

#[tokio::test]
async fn sub_protocol_messages_flow_between_nodes() {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let b = Server::new(test_config(Vec::new()));
    b.bind(Arc::new(Capture { tx }));
    b.start().await.expect("b start");
    let b_node = b.self_node().expect("b is running");

    let a = Server::new(test_config(vec![b_node]));
    a.start().await.expect("a start");

    let a_peer = wait_for_peer(&a).await;
    let _ = wait_for_peer(&b).await;

    a_peer
        .write_message(4, b"hello from a")
        .expect("session is open");

    let (from, msg) = timeout(SETTLE_TIMEOUT, rx.recv())
        .await
        .expect("message arrives")
        .expect("capture channel open");
    assert_eq!(from, a.node_id());
    assert_eq!(msg.mtype, 4);
    assert_eq!(&msg.payload[..], b"hello from a");

    a.stop();
    b.stop();
}

#[tokio::test]
async fn stop_is_idempotent() {
    let server = Server::new(test_config(Vec::new()));
    server.start().await.expect("start");
    server.stop();
    server.stop();
    assert!(server.peers().is_empty());
    assert!(server.self_node().is_none());
}
