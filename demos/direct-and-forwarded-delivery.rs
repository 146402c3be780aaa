//! Bootstraps three in-process DHT nodes over in-memory transports and
//! walks through scenario 1 (direct delivery) and scenario 2
//! (forwarded delivery over one hop) end to end.
//!
//! Run with `cargo run --example direct-and-forwarded-delivery`.

use std::sync::Arc;
use std::time::Duration;

use dht_core::core::async_runtime as rt;
use dht_core::{DhtNode, Envelope, Event, InMemoryTransport, NodeConfig, NodeId, NullStateStore, Peer};
use serde_json::json;
use uuid::Uuid;

fn main() {
    rt::run(async_main());
}

fn node_id(last_byte: u8) -> NodeId {
    let mut bytes = [0u8; 20];
    bytes[19] = last_byte;
    NodeId::from_bytes(&bytes).unwrap()
}

fn simulator_config(id: NodeId) -> NodeConfig {
    let mut cfg = NodeConfig::new(id);
    // skip the liveness ping so this demo doesn't depend on real
    // network timing (spec.md §4.F "simulator mode").
    cfg.simulator_mode = true;
    cfg
}

async fn async_main() {
    // node A (0x00...01), B (0x00...02), C (0x80...00): A and C are
    // linked, and so are C and B, but A and B never talk directly.
    let a_id = node_id(1);
    let b_id = node_id(2);
    let mut c_bytes = [0u8; 20];
    c_bytes[0] = 0x80;
    let c_id = NodeId::from_bytes(&c_bytes).unwrap();

    let (node_a, mut events_a) = DhtNode::new(Peer, simulator_config(a_id), Arc::new(NullStateStore));
    let (node_b, mut events_b) = DhtNode::new(Peer, simulator_config(b_id), Arc::new(NullStateStore));
    let (node_c, _events_c) = DhtNode::new(Peer, simulator_config(c_id), Arc::new(NullStateStore));

    // scenario 1: A and B connected directly.
    let (trans_ab, rx_ab, trans_ba, rx_ba) = InMemoryTransport::pair();
    node_a.attach_peer(b_id, Arc::new(trans_ab), rx_ab);
    node_b.attach_peer(a_id, Arc::new(trans_ba), rx_ba);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let m1 = Envelope::new(json!({
        "id": Uuid::new_v4().to_string(),
        "timestamp": now_millis(),
        "senderId": a_id.to_hex(),
    }));
    node_a.send_message(b_id, m1).await.unwrap();
    match events_b.recv().await.unwrap() {
        Event::ChatMessage(payload) => println!("B received direct chat message: {}", payload.0),
        other => println!("unexpected event on B: {:?}", other),
    }

    // scenario 2: tear down the direct A<->B link, connect A<->C and
    // C<->B instead, and send from A to B again. A doesn't know B
    // anymore, so it must cache and forward via C.
    node_a.close().await;
    let (node_a, mut events_a2) = DhtNode::new(Peer, simulator_config(a_id), Arc::new(NullStateStore));
    let _ = &mut events_a; // silence unused warning from the scenario-1 receiver

    let (trans_ac, rx_ac, trans_ca, rx_ca) = InMemoryTransport::pair();
    node_a.attach_peer(c_id, Arc::new(trans_ac), rx_ac);
    node_c.attach_peer(a_id, Arc::new(trans_ca), rx_ca);

    let (trans_cb, rx_cb, trans_bc, rx_bc) = InMemoryTransport::pair();
    node_c.attach_peer(b_id, Arc::new(trans_cb), rx_cb);
    node_b.attach_peer(c_id, Arc::new(trans_bc), rx_bc);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let m2 = Envelope::new(json!({
        "id": Uuid::new_v4().to_string(),
        "timestamp": now_millis(),
        "senderId": a_id.to_hex(),
    }));
    node_a.send_message(b_id, m2).await.unwrap();

    match events_b.recv().await.unwrap() {
        Event::ChatMessage(payload) => println!("B received forwarded chat message via C: {}", payload.0),
        other => println!("unexpected event on B: {:?}", other),
    }
    println!("A's cache holds the forwarded payload until C acknowledges it");
    let _ = events_a2.try_recv();

    node_a.close().await;
    node_b.close().await;
    node_c.close().await;
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}
