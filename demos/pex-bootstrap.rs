//! Walks through a PEX request/advertisement round trip between two
//! in-process nodes: node A's connection manager asks node B for
//! peers, B answers with its one known contact, and A's dial callback
//! fires for that contact.
//!
//! Run with `cargo run --example pex-bootstrap`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dht_core::core::async_runtime as rt;
use dht_core::{DhtNode, InMemoryTransport, NodeConfig, NodeId, NullStateStore, Peer, PeerDto};
use serde_json::json;

fn main() {
    rt::run(async_main());
}

fn node_id(last_byte: u8) -> NodeId {
    let mut bytes = [0u8; 20];
    bytes[19] = last_byte;
    NodeId::from_bytes(&bytes).unwrap()
}

async fn async_main() {
    let a_id = node_id(1);
    let b_id = node_id(2);
    let discovered_id = node_id(3);

    let mut cfg_a = NodeConfig::new(a_id);
    cfg_a.min_connections = 2;
    cfg_a.simulator_mode = true;
    let (node_a, _events_a) = DhtNode::new(Peer, cfg_a, Arc::new(NullStateStore));

    let mut cfg_b = NodeConfig::new(b_id);
    cfg_b.simulator_mode = true;
    let (node_b, _events_b) = DhtNode::new(Peer, cfg_b, Arc::new(NullStateStore));

    let dialed: Arc<Mutex<Vec<NodeId>>> = Arc::new(Mutex::new(Vec::new()));
    let dialed_for_closure = dialed.clone();

    // node A: dials whatever its connection manager decides is worth
    // dialing; node B: answers every PEX request with `discovered_id`
    // as its one known peer.
    let mgr_a = node_a.connection_manager(
        Box::new(|_peer: &PeerDto| true),
        Box::new(move |peer: PeerDto| {
            if let Some(id) = peer.peer_id() {
                println!("node A dialing newly discovered peer {}", id);
                dialed_for_closure.lock().unwrap().push(id);
            }
        }),
        Box::new(|_max| Vec::new()),
        Box::new(|| 0),
    );
    let mgr_b = node_b.connection_manager(
        Box::new(|_peer: &PeerDto| true),
        Box::new(|_peer: PeerDto| {}),
        Box::new(move |_max| {
            vec![PeerDto::new(json!({
                "peerId": discovered_id.to_hex(),
                "publicKey": "deadbeef",
            }))]
        }),
        Box::new(|| 0),
    );

    let (trans_a, rx_a, trans_b, rx_b) = InMemoryTransport::pair();
    mgr_a.attach_pex_channel(b_id, Arc::new(trans_a), rx_a);
    mgr_b.attach_pex_channel(a_id, Arc::new(trans_b), rx_b);

    mgr_a.start();
    // PEX_INITIAL_DELAY is 2s in the real config; give the demo a
    // little slack past it to observe the round trip.
    tokio::time::sleep(Duration::from_millis(2200)).await;

    mgr_a.close();
    mgr_b.close();
    node_a.close().await;
    node_b.close().await;

    println!("node A dialed: {:?}", dialed.lock().unwrap());
}
