//! The sync service: a TCP listener for inbound peers plus periodic timers
//! that pick a random peer and run the get_peers / get_events / get_state
//! sub-protocols. One request/response pair per connection; every outbound
//! exchange carries a single deadline.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::{interval, sleep, timeout, Duration};
use tracing::{debug, info, warn};

use prisma_core::constants::{
    DEFAULT_PEER_TIMEOUT_SECS, DEFAULT_ZLIB_LEVEL, GENESIS_ROUND,
};
use prisma_core::error::PrismaError;
use prisma_core::types::Round;
use prisma_graph::Graph;
use prisma_state::{manager, runner};
use prisma_store::{PeerInfo, StoreDb};

use crate::framing::{read_frame, write_frame};
use crate::message::{StartData, StateUnit, WireMessage};
use crate::peers::{is_valid_node_ip, node_id};

const STATUS_INIT: u8 = 0;
const STATUS_BOOTSTRAPPING: u8 = 1;
const STATUS_READY: u8 = 2;

/// Peers required before gossip starts (one is enough in developer mode).
const MIN_GOSSIP_PEERS: usize = 3;

#[derive(Clone, Debug)]
pub struct NetworkConfig {
    pub listen_port: u16,
    pub get_peers_timer: u64,
    pub get_events_timer: u64,
    pub timeout_secs: u64,
    pub zlib_level: u32,
    pub developer_mode: bool,
    pub bootstrap_nodes: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: 19840,
            get_peers_timer: 60,
            get_events_timer: 5,
            timeout_secs: DEFAULT_PEER_TIMEOUT_SECS,
            zlib_level: DEFAULT_ZLIB_LEVEL,
            developer_mode: false,
            bootstrap_nodes: Vec::new(),
        }
    }
}

pub struct NetworkService {
    config: NetworkConfig,
    node_id: String,
    graph: Arc<Mutex<Graph>>,
    store: Arc<StoreDb>,
    status: AtomicU8,
}

impl NetworkService {
    pub fn new(config: NetworkConfig, graph: Arc<Mutex<Graph>>, store: Arc<StoreDb>, verify_key: &str) -> Self {
        Self {
            config,
            node_id: node_id(&verify_key.to_string()),
            graph,
            store,
            status: AtomicU8::new(STATUS_INIT),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_ready(&self) -> bool {
        self.status.load(Ordering::SeqCst) == STATUS_READY
    }

    /// Listen, bootstrap, and drive the periodic sync timers. Runs forever.
    pub async fn run(self: Arc<Self>) -> Result<(), PrismaError> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.listen_port)).await?;
        info!(port = self.config.listen_port, node_id = %self.node_id, "network listening");

        let bootstrapper = self.clone();
        tokio::spawn(async move { bootstrapper.bootstrap().await });

        let mut peers_tick = interval(Duration::from_secs(self.config.get_peers_timer.max(1)));
        let mut events_tick = interval(Duration::from_secs(self.config.get_events_timer.max(1)));

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let svc = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = svc.handle_connection(stream, addr).await {
                                debug!(peer = %addr, error = %e, "inbound connection failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                _ = peers_tick.tick() => {
                    let svc = self.clone();
                    tokio::spawn(async move { svc.get_peers_from_random_peer().await });
                },
                _ = events_tick.tick() => {
                    let svc = self.clone();
                    tokio::spawn(async move { svc.get_events_from_random_peer().await });
                },
            }
        }
    }

    // ── Bootstrap ────────────────────────────────────────────────────────────

    /// Forget stale peers, learn fresh ones from the configured bootstrap
    /// nodes, then catch up on signed states before gossiping.
    async fn bootstrap(&self) {
        self.status.store(STATUS_BOOTSTRAPPING, Ordering::SeqCst);
        if let Err(e) = self.store.delete_peers() {
            warn!(error = %e, "could not clear peer book");
        }

        for entry in self.config.bootstrap_nodes.clone() {
            let Some((host, port)) = parse_host_port(&entry) else {
                warn!(entry = %entry, "bad bootstrap entry, expected host:port");
                continue;
            };
            info!(host = %host, port, "bootstrapping peer");
            if let Err(e) = self.get_peers_from(&host, port).await {
                warn!(host = %host, port, error = %e, "bootstrap peer failed");
            }
        }

        // Catch up via the signed-state chain from some reachable peer.
        loop {
            let peer = match self.store.get_random_peer() {
                Ok(Some(peer)) => peer,
                Ok(None) => {
                    debug!("no peers yet; waiting to bootstrap state");
                    sleep(Duration::from_secs(2)).await;
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "peer book unavailable");
                    sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };
            match self.download_state_from(&peer).await {
                Ok(()) => break,
                Err(e) => {
                    warn!(peer = %peer.id, error = %e, "state download failed");
                    let _ = self.store.delete_peer(&peer.id);
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }

        self.status.store(STATUS_READY, Ordering::SeqCst);
        info!("node ready");
    }

    // ── Outbound exchanges ───────────────────────────────────────────────────

    /// One request/response round trip under the peer deadline.
    async fn exchange(
        &self,
        host: &str,
        port: u16,
        request: WireMessage,
    ) -> Result<WireMessage, PrismaError> {
        let deadline = Duration::from_secs(self.config.timeout_secs);
        timeout(deadline, self.exchange_inner(host, port, request))
            .await
            .map_err(|_| PrismaError::Peer(format!("{host}:{port} timed out")))?
    }

    async fn exchange_inner(
        &self,
        host: &str,
        port: u16,
        request: WireMessage,
    ) -> Result<WireMessage, PrismaError> {
        let mut stream = TcpStream::connect((host, port)).await?;

        // A node must never sync with itself.
        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;
        if local.ip() == peer.ip() && peer.port() == self.config.listen_port {
            return Err(PrismaError::SelfConnection);
        }

        write_frame(&mut stream, &request.to_bytes()?, self.config.zlib_level).await?;
        let response = read_frame(&mut stream).await?;
        WireMessage::from_bytes(&response)
    }

    async fn get_peers_from(&self, host: &str, port: u16) -> Result<(), PrismaError> {
        let request = WireMessage::GetPeers {
            id: self.node_id.clone(),
            port: self.config.listen_port,
            latest_event: self.store.get_latest_event_time()?,
        };
        match self.exchange(host, port, request).await? {
            WireMessage::GetPeersResponse { peers } => {
                for peer in peers {
                    if peer.id != self.node_id
                        && is_valid_node_ip(&peer.host, self.config.developer_mode)
                    {
                        self.store.insert_peer(&peer)?;
                    }
                }
                Ok(())
            }
            _ => Err(PrismaError::Peer("unexpected get_peers reply".into())),
        }
    }

    async fn get_peers_from_random_peer(&self) {
        let Ok(Some(peer)) = self.store.get_random_peer() else {
            debug!("no peers to ask for more peers");
            return;
        };
        if let Err(e) = self.get_peers_from(&peer.host, peer.port).await {
            debug!(peer = %peer.id, error = %e, "get_peers failed, dropping peer");
            let _ = self.store.delete_peer(&peer.id);
        }
    }

    /// The heart of gossip: tell a random peer what we know, absorb what it
    /// sends back, and run a consensus tick on the result.
    async fn get_events_from_random_peer(&self) {
        if !self.is_ready() {
            debug!("not ready, still bootstrapping");
            return;
        }
        let peer_count = self.store.count_peers();
        let min_peers = if self.config.developer_mode { 1 } else { MIN_GOSSIP_PEERS };
        if peer_count < min_peers {
            debug!(peer_count, "not enough peers for gossip");
            return;
        }
        let Ok(Some(peer)) = self.store.get_random_peer() else {
            return;
        };

        let (latest_event, event_info) = {
            let graph = self.graph.lock().await;
            let info = match graph.event_info_response() {
                Ok(Some(info)) => info,
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "could not build event info");
                    return;
                }
            };
            match self.store.get_latest_event_time() {
                Ok(t) => (t, info),
                Err(e) => {
                    warn!(error = %e, "could not read latest event time");
                    return;
                }
            }
        };

        let request = WireMessage::GetEvents {
            latest_event,
            event_info: event_info.into(),
        };
        let response = match self.exchange(&peer.host, peer.port, request).await {
            Ok(r) => r,
            Err(e) => {
                debug!(peer = %peer.id, error = %e, "get_events failed, dropping peer");
                let _ = self.store.delete_peer(&peer.id);
                return;
            }
        };

        match response {
            WireMessage::GetEventsResponse { events: Some(events) } => {
                let mut graph = self.graph.lock().await;
                match runner::process_events_response(&mut graph, &events.into()) {
                    Ok(outcome) => {
                        if outcome.inserted_events > 0 {
                            debug!(
                                inserted = outcome.inserted_events,
                                new_rounds = outcome.new_consensus_rounds,
                                "sync tick complete"
                            );
                        }
                    }
                    Err(e) if e.is_fatal() => {
                        // A half-applied batch would silently diverge.
                        panic!("storage fault during consensus tick: {e}");
                    }
                    Err(e) => warn!(error = %e, "sync tick rejected"),
                }
            }
            WireMessage::GetEventsResponse { events: None } => {
                debug!(peer = %peer.id, "peer had nothing for us");
            }
            _ => {
                debug!(peer = %peer.id, "unexpected get_events reply, dropping peer");
                let _ = self.store.delete_peer(&peer.id);
            }
        }
    }

    /// Cold-start catch-up: fetch the signed-state chain above our last
    /// round and reinitialize the DAG at the remote checkpoint.
    async fn download_state_from(&self, peer: &PeerInfo) -> Result<(), PrismaError> {
        let last_round = self
            .store
            .get_last_state()?
            .map(|s| s.state.last_round)
            .unwrap_or(GENESIS_ROUND);

        let request = WireMessage::GetState { last_round };
        let response = self.exchange(&peer.host, peer.port, request).await?;
        let WireMessage::GetStateResponse { states, start_data } = response else {
            return Err(PrismaError::Peer("unexpected get_state reply".into()));
        };

        let Some(states) = states.filter(|s| !s.is_empty()) else {
            // The peer has nothing newer; we are as caught up as it is.
            return Ok(());
        };

        let mut graph = self.graph.lock().await;
        let local_last = self
            .store
            .get_last_state()?
            .map(|s| s.state.last_round)
            .unwrap_or(GENESIS_ROUND);
        let remote_last = states.last().map(|u| u.state.last_round).unwrap_or(local_last);
        if local_last >= remote_last {
            return Ok(());
        }

        let chain = states
            .into_iter()
            .map(|unit| (unit.state, unit.signatures))
            .collect();
        manager::handle_received_state_chain(&mut graph, chain)?;

        let checkpoint = self
            .store
            .get_last_state()?
            .map(|s| s.state.last_round)
            .unwrap_or(local_last);
        let start = start_data
            .ok_or_else(|| PrismaError::Peer("state chain without start_data".into()))?;
        graph.reinitialize_from_sync(start.rounds, start.heights, start.witnesses, checkpoint)?;
        Ok(())
    }

    // ── Inbound dispatch ─────────────────────────────────────────────────────

    async fn handle_connection(
        &self,
        mut stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), PrismaError> {
        let deadline = Duration::from_secs(self.config.timeout_secs);
        timeout(deadline, self.serve_one(&mut stream, addr))
            .await
            .map_err(|_| PrismaError::Peer(format!("{addr} timed out")))?
    }

    async fn serve_one(
        &self,
        stream: &mut TcpStream,
        addr: SocketAddr,
    ) -> Result<(), PrismaError> {
        let frame = read_frame(stream).await?;
        let request = WireMessage::from_bytes(&frame)?;
        debug!(peer = %addr, "inbound request");

        let response = match request {
            WireMessage::GetPeers { id, port, latest_event } => {
                self.handle_get_peers(stream, addr, id, port, latest_event)?
            }
            WireMessage::GetEvents { event_info, .. } => {
                let graph = self.graph.lock().await;
                let events = graph.events_subset_response(&event_info.into())?;
                WireMessage::GetEventsResponse { events: events.map(Into::into) }
            }
            WireMessage::GetState { last_round } => self.handle_get_state(last_round).await?,
            // Responses are only valid on connections we opened.
            _ => return Err(PrismaError::Peer("response message as request".into())),
        };

        write_frame(stream, &response.to_bytes()?, self.config.zlib_level).await
    }

    fn handle_get_peers(
        &self,
        stream: &TcpStream,
        addr: SocketAddr,
        id: String,
        port: u16,
        latest_event: f64,
    ) -> Result<WireMessage, PrismaError> {
        let now = chrono::Utc::now().timestamp();
        self.store.insert_peer(&PeerInfo {
            id,
            host: addr.ip().to_string(),
            port,
            latest_event,
            seen: now,
        })?;

        let mut peers = self.store.get_peers_many()?;
        peers.push(PeerInfo {
            id: self.node_id.clone(),
            host: stream
                .local_addr()
                .map(|a| a.ip().to_string())
                .unwrap_or_else(|_| "0.0.0.0".into()),
            port: self.config.listen_port,
            latest_event: self.store.get_latest_event_time()?,
            seen: now,
        });
        Ok(WireMessage::GetPeersResponse { peers })
    }

    /// Serve the signed-state chain above the asker's round, plus the
    /// bootstrap tables it needs to participate from the checkpoint.
    async fn handle_get_state(&self, last_round: Round) -> Result<WireMessage, PrismaError> {
        let _graph = self.graph.lock().await;
        let local_round = self
            .store
            .get_last_state()?
            .map(|s| s.state.last_round)
            .unwrap_or(GENESIS_ROUND);
        if local_round <= last_round {
            return Ok(WireMessage::GetStateResponse { states: None, start_data: None });
        }

        let states: Vec<StateUnit> = self
            .store
            .get_state_with_proof_many(last_round)?
            .into_iter()
            .map(|(state, signatures)| StateUnit { state, signatures })
            .collect();

        let mut witnesses = BTreeMap::new();
        witnesses.insert(local_round, self.store.get_witness(local_round)?);
        witnesses.insert(local_round - 1, self.store.get_witness(local_round - 1)?);
        let start_data = StartData {
            rounds: self.store.get_rounds_many()?,
            witnesses,
            heights: self.store.get_heights_many()?,
        };

        Ok(WireMessage::GetStateResponse {
            states: Some(states),
            start_data: Some(start_data),
        })
    }
}

fn parse_host_port(entry: &str) -> Option<(String, u16)> {
    let (host, port) = entry.rsplit_once(':')?;
    let port = port.parse().ok()?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}
