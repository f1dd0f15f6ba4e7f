//! Wire-level tests against a live service: real TCP, real frames.

use std::collections::BTreeMap;
use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::Mutex;

use prisma_crypto::keypair::KeyPair;
use prisma_graph::Graph;
use prisma_p2p::framing::{read_frame, write_frame};
use prisma_p2p::message::WireMessage;
use prisma_p2p::{NetworkConfig, NetworkService};
use prisma_state::genesis::install_genesis;
use prisma_store::StoreDb;

fn free_port() -> u16 {
    StdTcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Boot a service with a funded single-node graph on a free port.
async fn spawn_node(name: &str) -> (Arc<NetworkService>, Arc<StoreDb>, u16) {
    let dir = std::env::temp_dir().join(format!("prisma_p2p_test_{name}"));
    let _ = std::fs::remove_dir_all(&dir);
    let store = Arc::new(StoreDb::open(&dir).unwrap());

    let mut balances = BTreeMap::new();
    balances.insert("1PR".to_string(), 1_000);
    install_genesis(&store, balances).unwrap();

    let mut graph = Graph::new(store.clone(), KeyPair::generate(), 4).unwrap();
    graph.init().unwrap();
    let verify_key = graph.verify_key().clone();

    let port = free_port();
    let config = NetworkConfig {
        listen_port: port,
        developer_mode: true,
        // Long timers: the test drives all traffic itself.
        get_peers_timer: 3600,
        get_events_timer: 3600,
        ..NetworkConfig::default()
    };
    let service = Arc::new(NetworkService::new(
        config,
        Arc::new(Mutex::new(graph)),
        store.clone(),
        &verify_key,
    ));
    tokio::spawn(service.clone().run());

    // Wait for the listener to come up.
    for _ in 0..50 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    (service, store, port)
}

async fn request(port: u16, msg: WireMessage) -> WireMessage {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    write_frame(&mut stream, &msg.to_bytes().unwrap(), 6).await.unwrap();
    let frame = read_frame(&mut stream).await.unwrap();
    WireMessage::from_bytes(&frame).unwrap()
}

#[tokio::test]
async fn get_peers_registers_and_returns_the_responder() {
    let (service, store, port) = spawn_node("peers").await;

    let response = request(
        port,
        WireMessage::GetPeers { id: "cafebabe".into(), port: 12345, latest_event: 7.5 },
    )
    .await;

    let WireMessage::GetPeersResponse { peers } = response else {
        panic!("wrong reply variant");
    };
    // Our entry plus the responder itself.
    assert!(peers.iter().any(|p| p.id == "cafebabe" && p.port == 12345));
    assert!(peers.iter().any(|p| p.id == service.node_id()));

    // The asker landed in the responder's peer book.
    let known = store.get_peers_many().unwrap();
    assert!(known.iter().any(|p| p.id == "cafebabe"));
}

#[tokio::test]
async fn get_state_answers_null_when_not_ahead() {
    let (_service, _store, port) = spawn_node("state_null").await;

    // The node only has the genesis state (-1); an equally fresh asker
    // gets nothing.
    let response = request(port, WireMessage::GetState { last_round: -1 }).await;
    assert_eq!(
        response,
        WireMessage::GetStateResponse { states: None, start_data: None }
    );
}

#[tokio::test]
async fn get_state_serves_chain_to_stale_askers() {
    let (_service, store, port) = spawn_node("state_chain").await;

    // Give the node one signed state past genesis.
    let state = prisma_store::State {
        last_round: 9,
        prev_hash: "prev".into(),
        balance: BTreeMap::new(),
    };
    store
        .insert_state(&prisma_store::StoredState { state, hash: "h9".into(), signed: true })
        .unwrap();
    store
        .insert_signature(
            9,
            "h9",
            prisma_store::SignatureEntry { verify_key: "vk".into(), signed: "blob".into() },
        )
        .unwrap();

    let response = request(port, WireMessage::GetState { last_round: -1 }).await;
    let WireMessage::GetStateResponse { states: Some(states), start_data: Some(_) } = response
    else {
        panic!("expected a state chain");
    };
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].state.last_round, 9);
    assert_eq!(states[0].signatures["vk"], "blob");
}

#[tokio::test]
async fn get_events_returns_signed_subset() {
    let (_service, _store, port) = spawn_node("events").await;

    // A fresh asker that knows nothing: empty creator-height map.
    let asker = KeyPair::generate();
    let info: BTreeMap<String, u64> = BTreeMap::new();
    let signed = asker.sign(&serde_json::to_vec(&info).unwrap());

    let response = request(
        port,
        WireMessage::GetEvents { latest_event: 0.0, event_info: signed.into() },
    )
    .await;

    let WireMessage::GetEventsResponse { events: Some(payload) } = response else {
        panic!("expected an events payload");
    };
    // The blob opens under the responder's key and contains its root.
    let msg = prisma_crypto::keypair::verify_attached(&payload.verify_key, &payload.signed)
        .unwrap();
    let (head, subset): (String, BTreeMap<String, prisma_core::Event>) =
        serde_json::from_slice(&msg).unwrap();
    assert!(subset.contains_key(&head));
    assert!(subset[&head].is_root());
}

#[tokio::test]
async fn malformed_requests_close_without_reply() {
    let (_service, _store, port) = spawn_node("malformed").await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    write_frame(&mut stream, br#"{"method":"get_blocks"}"#, 6).await.unwrap();
    // The connection is dropped; the read yields EOF, not a frame.
    assert!(read_frame(&mut stream).await.is_err());
}

#[tokio::test]
async fn response_as_request_is_rejected() {
    let (_service, _store, port) = spawn_node("resp_as_req").await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let msg = WireMessage::GetPeersResponse { peers: vec![] };
    write_frame(&mut stream, &msg.to_bytes().unwrap(), 6).await.unwrap();
    assert!(read_frame(&mut stream).await.is_err());
}
