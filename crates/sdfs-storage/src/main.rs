//! SDFS storage node: serves the content store over HTTP and emits
//! heartbeats to the master cluster.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use sdfs_storage::content_store::ContentStore;
use sdfs_storage::server::{self, NodeConfig, NodeState};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let bind_addr: SocketAddr = env_or("SDFS_NODE_BIND", "0.0.0.0:9400").parse()?;
    let advertise_addr = env_or("SDFS_NODE_ADVERTISE", &bind_addr.to_string());
    let data_prefix = PathBuf::from(env_or("SDFS_NODE_DATA", "/var/lib/sdfs/node"));
    let master_addrs: Vec<String> = std::env::var("SDFS_MASTER_ADDRS")
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    let store = ContentStore::open(&data_prefix)?;
    let config = NodeConfig {
        bind_addr,
        data_prefix,
        advertise_addr,
        master_addrs,
        heartbeat_interval: Duration::from_secs(1),
    };
    let state = NodeState::new(store, config);

    tracing::info!(bind = %bind_addr, "sdfs storage node starting");

    tokio::spawn(server::run_heartbeat_loop(state.clone()));
    tokio::spawn(server::run_ticket_sweep(state.clone()));

    let router = server::router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, router.into_make_service()).await?;
    Ok(())
}
