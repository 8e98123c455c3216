//! Async wiring around the pure, synchronous `RaftNode` (C4): the
//! election timer, the heartbeat ticker, the wire RPC handler, and the
//! apply pipeline that drains committed entries into the namespace and
//! node registry.
//!
//! `RaftNode` itself holds no lock and does no I/O — this module owns the
//! single mutex guarding it, always releasing that lock before any RPC
//! send and re-acquiring it only to incorporate replies, per §5.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use sdfs_meta::{
    Command, LogEntry, MetaError, Namespace, NodeRegistry, PeerId, RaftConfig, RaftLogStore, RaftMessage, RaftNode,
};
use sdfs_transport::{Frame, Opcode, RpcHandler, TcpTransport, TcpTransportConfig};
use tracing::{debug, info, warn};

const REQUEST_VOTE_DEADLINE: Duration = Duration::from_secs(1);
const APPEND_ENTRIES_DEADLINE: Duration = Duration::from_millis(300);
const SUBMIT_COMMIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state every master process wires together at startup.
pub struct ConsensusService {
    node: Mutex<RaftNode>,
    log_store: RaftLogStore,
    peer_addrs: RwLock<HashMap<PeerId, String>>,
    namespace: Arc<RwLock<Namespace>>,
    registry: Arc<NodeRegistry>,
}

impl ConsensusService {
    /// Build a consensus service, restoring hard state from `log_store`
    /// if any was persisted by a previous run.
    pub fn new(
        config: RaftConfig,
        log_store: RaftLogStore,
        peer_addrs: HashMap<PeerId, String>,
        namespace: Arc<RwLock<Namespace>>,
        registry: Arc<NodeRegistry>,
    ) -> Self {
        let current_term = log_store.load_term().unwrap_or_default();
        let voted_for = log_store.load_voted_for().unwrap_or_default();
        let entry_count = log_store.entry_count().unwrap_or_default();
        let log: Vec<LogEntry> = log_store.get_entries(1, entry_count + 1).unwrap_or_default();
        let node = RaftNode::restore(config, current_term, voted_for, log);
        Self {
            node: Mutex::new(node),
            log_store,
            peer_addrs: RwLock::new(peer_addrs),
            namespace,
            registry,
        }
    }

    /// Whether this master currently believes itself to be the leader.
    pub fn is_leader(&self) -> bool {
        self.node.lock().is_leader()
    }

    /// The address of the current leader, if known, for redirects.
    pub fn leader_address(&self) -> Option<String> {
        let leader = self.node.lock().current_leader()?;
        self.peer_addrs.read().get(&leader).cloned()
    }

    /// This master's own peer id.
    pub fn peer_id(&self) -> PeerId {
        self.node.lock().peer_id()
    }

    /// Records a newly joined peer's address for RPC addressing. Called
    /// both when this master answers a `RegisterMaster` bootstrap call
    /// and, symmetrically, once the corresponding `AddServer` command
    /// commits.
    pub fn learn_peer(&self, peer_id: PeerId, address: String) {
        self.peer_addrs.write().insert(peer_id, address);
    }

    /// Leader-only: append `command`, replicate it to a majority, and
    /// wait for it to be committed and applied. Returns a leader hint on
    /// failure.
    pub async fn submit_command(self: &Arc<Self>, command: Command) -> Result<(), MetaError> {
        let (index, batch) = {
            let mut node = self.node.lock();
            let batch = node.submit(command)?;
            let index = node.last_log_index();
            if let Some(entry) = node.log_entry(index) {
                let _ = self.log_store.append_entry(entry);
            }
            (index, batch)
        };

        self.broadcast(batch).await;

        let deadline = tokio::time::Instant::now() + SUBMIT_COMMIT_TIMEOUT;
        loop {
            self.drain_and_apply();
            if self.node.lock().last_applied() >= index {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                let hint = self.node.lock().current_leader();
                return Err(MetaError::NotLeader {
                    leader_hint: hint,
                    leader_address: hint.and_then(|p| self.peer_addrs.read().get(&p).cloned()),
                });
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn drain_and_apply(&self) {
        let entries = self.node.lock().take_committed_entries();
        if entries.is_empty() {
            return;
        }
        let commit_index = self.node.lock().commit_index();
        let _ = self.log_store.save_commit_index(commit_index);
        let mut namespace = self.namespace.write();
        for entry in entries {
            apply_command(entry.command, &mut namespace, &self.registry);
        }
    }

    async fn broadcast(self: &Arc<Self>, batch: Vec<(PeerId, RaftMessage)>) {
        let mut tasks = Vec::new();
        for (peer, msg) in batch {
            let addr = self.peer_addrs.read().get(&peer).cloned();
            let this = self.clone();
            if let Some(addr) = addr {
                tasks.push(tokio::spawn(async move {
                    let opcode = opcode_for(&msg);
                    if let Some(reply) = send_rpc(&addr, opcode, &msg, reply_deadline(opcode)).await {
                        let mut node = this.node.lock();
                        match (&msg, &reply) {
                            (RaftMessage::AppendEntries { .. }, RaftMessage::AppendEntriesResponse { .. }) => {
                                node.handle_append_response(peer, &reply);
                            }
                            (RaftMessage::RequestVote { .. }, RaftMessage::RequestVoteResponse { .. }) => {
                                if let Some(heartbeats) = node.handle_vote_response(peer, &reply) {
                                    drop(node);
                                    this.persist_hard_state();
                                    this.broadcast(heartbeats).await;
                                }
                            }
                            _ => {}
                        }
                    }
                }));
            }
        }
        for task in tasks {
            let _ = task.await;
        }
        self.persist_hard_state();
        self.drain_and_apply();
    }

    fn persist_hard_state(&self) {
        let node = self.node.lock();
        let _ = self.log_store.save_term(node.current_term());
        let _ = self.log_store.save_voted_for(node.voted_for());
    }

    /// Runs the election timer: on expiry (no AppendEntries seen from a
    /// leader within a randomized `[8*rtt, 9*rtt)` window), starts an
    /// election and broadcasts `RequestVote`.
    pub async fn run_election_timer(self: Arc<Self>) {
        loop {
            let (low, high) = self.node.lock().election_timeout_range_ms();
            let timeout_ms = if high > low {
                rand::thread_rng().gen_range(low..high)
            } else {
                low
            };
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;

            let already_leader = self.node.lock().is_leader();
            if already_leader {
                continue;
            }

            let batch = {
                let mut node = self.node.lock();
                node.start_election()
            };
            self.persist_hard_state();

            if let Some(msg) = batch {
                let peers: Vec<(PeerId, RaftMessage)> =
                    self.peer_addrs.read().keys().map(|p| (*p, msg.clone())).collect();
                self.broadcast(peers).await;
            } else {
                info!("single-node cluster: became leader without an election round");
            }
        }
    }

    /// Runs the leader's heartbeat ticker.
    pub async fn run_heartbeat_ticker(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if !self.node.lock().is_leader() {
                continue;
            }
            let heartbeats = self.node.lock().build_heartbeats();
            self.broadcast(heartbeats).await;
        }
    }
}

fn opcode_for(msg: &RaftMessage) -> Opcode {
    match msg {
        RaftMessage::RequestVote { .. } => Opcode::RequestVote,
        RaftMessage::RequestVoteResponse { .. } => Opcode::RequestVoteResponse,
        RaftMessage::AppendEntries { .. } => Opcode::AppendEntries,
        RaftMessage::AppendEntriesResponse { .. } => Opcode::AppendEntriesResponse,
    }
}

fn reply_deadline(opcode: Opcode) -> Duration {
    match opcode {
        Opcode::RequestVote => REQUEST_VOTE_DEADLINE,
        _ => APPEND_ENTRIES_DEADLINE,
    }
}

async fn send_rpc(addr: &str, opcode: Opcode, msg: &RaftMessage, deadline: Duration) -> Option<RaftMessage> {
    let payload = bincode::serialize(msg).ok()?;
    let transport = TcpTransport::new(TcpTransportConfig::default());
    let result = tokio::time::timeout(deadline, async {
        let conn = transport.connect(addr).await.ok()?;
        let request = Frame::new(opcode, 0, payload);
        conn.send_frame(&request).await.ok()?;
        let response = conn.recv_frame().await.ok()?;
        bincode::deserialize::<RaftMessage>(&response.payload).ok()
    })
    .await;
    match result {
        Ok(Some(reply)) => Some(reply),
        Ok(None) => None,
        Err(_) => {
            debug!(addr, "raft RPC timed out, will retry on next tick");
            None
        }
    }
}

fn apply_command(command: Command, namespace: &mut Namespace, registry: &NodeRegistry) {
    match command {
        Command::AddServer { .. } => {
            // Peer address wiring is handled out-of-band via static
            // config at bootstrap (§4.6's `RegisterMaster`); committing
            // AddServer exists so every master's log agrees on cluster
            // membership history even though this build doesn't grow the
            // peer set dynamically.
        }
        Command::AddNode { node_id, address } => {
            registry.register(node_id, address);
        }
        Command::AddFile { host_ids, path, digest } => {
            if let Err(e) = namespace.add_file(&path, digest, host_ids) {
                warn!(path, error = %e, "failed to apply committed AddFile");
            }
        }
        Command::DeleteFile { path } => {
            if let Err(e) = namespace.delete_file(&path) {
                warn!(path, error = %e, "failed to apply committed DeleteFile");
            }
        }
    }
}

/// Dispatches incoming Raft wire RPCs to the consensus state machine.
pub struct RaftRpcHandler {
    service: Arc<ConsensusService>,
}

impl RaftRpcHandler {
    /// Wrap a `ConsensusService` as an `RpcHandler` for the transport
    /// layer's accept loop.
    pub fn new(service: Arc<ConsensusService>) -> Self {
        Self { service }
    }
}

impl RpcHandler for RaftRpcHandler {
    fn handle(
        &self,
        request: Frame,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = sdfs_transport::Result<Vec<u8>>> + Send + '_>> {
        Box::pin(async move {
            let response = match request.opcode() {
                Opcode::RequestVote => {
                    let msg: RaftMessage = bincode::deserialize(&request.payload)
                        .map_err(|e| sdfs_transport::TransportError::SerializationError(e.to_string()))?;
                    let mut node = self.service.node.lock();
                    let reply = node.handle_request_vote(&msg);
                    drop(node);
                    self.service.persist_hard_state();
                    reply
                }
                Opcode::AppendEntries => {
                    let msg: RaftMessage = bincode::deserialize(&request.payload)
                        .map_err(|e| sdfs_transport::TransportError::SerializationError(e.to_string()))?;
                    let mut node = self.service.node.lock();
                    let before = self.service.log_store.entry_count().unwrap_or_default();
                    let reply = node.handle_append_entries(&msg);
                    let log = node.log();
                    if log.len() > before {
                        let _ = self.service.log_store.append_entries(&log[before..]);
                    } else if log.len() < before {
                        let _ = self.service.log_store.truncate_from(sdfs_meta::LogIndex::new(log.len() as u64 + 1));
                    }
                    drop(node);
                    self.service.persist_hard_state();
                    self.service.drain_and_apply();
                    reply
                }
                Opcode::RegisterMaster => {
                    let req: RegisterMasterRequest = bincode::deserialize(&request.payload)
                        .map_err(|e| sdfs_transport::TransportError::SerializationError(e.to_string()))?;
                    self.service.learn_peer(req.peer_id, req.address.clone());
                    let my_id = self.service.peer_id();
                    if self.service.is_leader() {
                        let _ = self
                            .service
                            .submit_command(Command::AddServer { peer_id: req.peer_id, address: req.address })
                            .await;
                    }
                    let resp = RegisterMasterResponse { success: true, connect_id: my_id };
                    return bincode::serialize(&resp)
                        .map_err(|e| sdfs_transport::TransportError::SerializationError(e.to_string()));
                }
                other => {
                    return Err(sdfs_transport::TransportError::UnknownOpcode(other as u16));
                }
            };
            bincode::serialize(&response).map_err(|e| sdfs_transport::TransportError::SerializationError(e.to_string()))
        })
    }
}

/// Bootstrap-only join call a newcomer master sends to one existing
/// master (§4.4, §6).
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct RegisterMasterRequest {
    /// The joining master's peer id.
    pub peer_id: PeerId,
    /// The joining master's RPC address.
    pub address: String,
}

/// Reply to `RegisterMasterRequest`.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct RegisterMasterResponse {
    /// Whether the join was accepted.
    pub success: bool,
    /// The responding master's own peer id.
    pub connect_id: PeerId,
}

/// Calls `RegisterMaster` against one existing master to join the
/// cluster. Used at bootstrap by a newcomer that isn't in anyone's
/// static peer list yet.
pub async fn register_with(existing_master_addr: &str, peer_id: PeerId, address: String) -> Option<RegisterMasterResponse> {
    let request = RegisterMasterRequest { peer_id, address };
    let payload = bincode::serialize(&request).ok()?;
    let transport = TcpTransport::new(TcpTransportConfig::default());
    let conn = transport.connect(existing_master_addr).await.ok()?;
    let frame = Frame::new(Opcode::RegisterMaster, 0, payload);
    conn.send_frame(&frame).await.ok()?;
    let response = conn.recv_frame().await.ok()?;
    bincode::deserialize(&response.payload).ok()
}
