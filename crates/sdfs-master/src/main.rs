#![warn(missing_docs)]

//! SDFS master binary: boots the Raft wire-RPC listener, the election
//! timer and heartbeat ticker, and the client/node-facing HTTP front
//! door.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use sdfs_master::api::{self, MasterState};
use sdfs_master::config::MasterConfig;
use sdfs_master::consensus_service::{register_with, ConsensusService, RaftRpcHandler};
use sdfs_master::replica::ReplicaManager;
use sdfs_master::upload::UploadCoordinator;
use sdfs_meta::{FileKvStore, Namespace, NodeRegistry, PeerId, RaftConfig, RaftLogStore};
use sdfs_transport::RpcServer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = MasterConfig::from_env()?;
    tracing::info!(peer_id = config.peer_id, bind = %config.bind_addr, raft = %config.raft_addr, "sdfs master starting");

    std::fs::create_dir_all(&config.data_dir)?;
    let kv = Arc::new(FileKvStore::open(config.data_dir.join("raft.kv"))?);
    let log_store = RaftLogStore::new(kv);

    let peer_id = PeerId::new(config.peer_id);
    let peer_ids: Vec<PeerId> = config.peers.iter().map(|p| PeerId::new(p.peer_id)).collect();
    let raft_config = RaftConfig::from_env(peer_id, peer_ids);

    let mut peer_addrs = HashMap::new();
    for peer in &config.peers {
        peer_addrs.insert(PeerId::new(peer.peer_id), peer.raft_addr.clone());
    }

    let namespace = Arc::new(RwLock::new(Namespace::new()));
    let registry = Arc::new(NodeRegistry::new());

    let consensus = Arc::new(ConsensusService::new(
        raft_config,
        log_store,
        peer_addrs,
        namespace.clone(),
        registry.clone(),
    ));

    tokio::spawn(consensus.clone().run_election_timer());
    tokio::spawn(consensus.clone().run_heartbeat_ticker(Duration::from_millis(50)));

    let raft_handler: Arc<dyn sdfs_transport::RpcHandler> = Arc::new(RaftRpcHandler::new(consensus.clone()));
    let raft_listener = tokio::net::TcpListener::bind(config.raft_addr).await?;
    tokio::spawn(async move {
        let transport = sdfs_transport::TcpTransport::new(sdfs_transport::TcpTransportConfig::default());
        if let Err(e) = RpcServer::serve(&transport, raft_listener, raft_handler).await {
            tracing::error!(error = %e, "raft rpc listener exited");
        }
    });

    if let Some(join_addr) = &config.join_addr {
        match register_with(join_addr, peer_id, config.bind_addr.to_string()).await {
            Some(resp) if resp.success => {
                tracing::info!(connect_id = ?resp.connect_id, "joined cluster via RegisterMaster");
            }
            _ => tracing::warn!(join_addr, "RegisterMaster join attempt did not succeed"),
        }
    }

    let state = Arc::new(MasterState {
        consensus,
        namespace,
        registry: registry.clone(),
        uploads: UploadCoordinator::new(registry),
        replicas: ReplicaManager::spawn(),
        http: reqwest::Client::new(),
        replication_factor: config.replication_factor,
    });

    let router = api::router(state);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, router.into_make_service()).await?;
    Ok(())
}
