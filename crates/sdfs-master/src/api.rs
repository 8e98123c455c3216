//! HTTP front door (C8): the client- and node-facing endpoints enumerated
//! in spec §6, merged into one `Router`. Any mutating route checks
//! `ConsensusService::is_leader()` before doing work; on a non-leader
//! master it replies `307 Temporary Redirect` with the cached leader
//! address, or a plain-text body naming the leader's peer id if the
//! address isn't known yet (spec §4.8).

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::RwLock;
use sdfs_meta::{Command, Digest, MetaError, Namespace, NodeId, NodeRegistry};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::consensus_service::ConsensusService;
use crate::replica::{ReplicaManager, ReplicaTask};
use crate::upload::{CoordError, UploadCoordinator};

/// Shared state behind every front-door handler.
pub struct MasterState {
    pub consensus: Arc<ConsensusService>,
    pub namespace: Arc<RwLock<Namespace>>,
    pub registry: Arc<NodeRegistry>,
    pub uploads: UploadCoordinator,
    pub replicas: ReplicaManager,
    pub http: reqwest::Client,
    /// Target number of nodes that should end up holding a digest,
    /// including the node an upload originally lands on (`SDFS_REPLICATION_FACTOR`).
    pub replication_factor: u32,
}

/// Builds the merged client/node router.
pub fn router(state: Arc<MasterState>) -> Router {
    Router::new()
        .route("/api/sdfs/download", get(client_download))
        .route("/api/sdfs/upload", get(client_upload))
        .route("/api/sdfs/delete", get(client_delete))
        .route("/api/sdfs/heartbeat", post(node_heartbeat))
        .route("/api/callback/upload", post(node_upload_callback))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn leader_redirect(state: &MasterState) -> Response {
    match state.consensus.leader_address() {
        Some(addr) => {
            let location = format!("http://{addr}");
            (StatusCode::TEMPORARY_REDIRECT, [(header::LOCATION, location)]).into_response()
        }
        None => (
            StatusCode::TEMPORARY_REDIRECT,
            format!("leader unknown, last seen peer {:?}", state.consensus.peer_id()),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct PathQuery {
    path: String,
}

/// `GET /api/sdfs/download?path=<p>` — returns the redirect URL a client
/// fetches bytes from.
async fn client_download(State(state): State<Arc<MasterState>>, Query(q): Query<PathQuery>) -> Response {
    let file = {
        let namespace = state.namespace.read();
        namespace.get_file(&q.path).map(|f| (f.digest.clone(), f.host_set.clone()))
    };
    let (digest, host_set) = match file {
        Ok(v) => v,
        Err(e) => return (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    };
    let host_id = match host_set.first() {
        Some(h) => *h,
        None => return (StatusCode::SERVICE_UNAVAILABLE, "no host known for this file").into_response(),
    };
    let Some(node) = state.registry.get_by_id(host_id) else {
        return (StatusCode::SERVICE_UNAVAILABLE, "host is no longer registered").into_response();
    };

    let url = format!(
        "http://{}/api/sdfs/download?hash={}&name={}",
        node.address,
        digest,
        q.path.rsplit('/').next().unwrap_or(&q.path)
    );
    let ticket: TicketResponse = match state.http.get(&url).send().await.and_then(|r| r.error_for_status()) {
        Ok(resp) => match resp.json().await {
            Ok(t) => t,
            Err(e) => return (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
        },
        Err(e) => return (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
    };
    let redirect_url = format!("http://{}/api/download?id={}", node.address, ticket.ticket);
    (StatusCode::OK, [(header::LOCATION, redirect_url.clone())], redirect_url).into_response()
}

#[derive(Deserialize)]
struct TicketResponse {
    ticket: String,
}

/// `GET /api/sdfs/upload?path=<p>` — reserves a node and upload id for
/// the client to POST bytes to.
async fn client_upload(State(state): State<Arc<MasterState>>, Query(q): Query<PathQuery>) -> Response {
    if !state.consensus.is_leader() {
        return leader_redirect(&state);
    }
    match state.uploads.add_upload(q.path).await {
        Ok((id, node)) => Json(UploadReservation { id, node }).into_response(),
        Err(CoordError::Conflict) => (StatusCode::CONFLICT, "upload already pending for this path").into_response(),
        Err(CoordError::Unavailable) => (StatusCode::SERVICE_UNAVAILABLE, "no node available").into_response(),
        Err(CoordError::Remote(msg)) => (StatusCode::BAD_GATEWAY, msg).into_response(),
        Err(CoordError::NotFound) => (StatusCode::NOT_FOUND, "unknown upload").into_response(),
        Err(CoordError::NotLeader { .. }) => leader_redirect(&state),
    }
}

#[derive(Serialize)]
struct UploadReservation {
    id: String,
    node: String,
}

/// `GET /api/sdfs/delete?path=<p>` — removes the path and fans out digest
/// deletion to every host that holds it.
async fn client_delete(State(state): State<Arc<MasterState>>, Query(q): Query<PathQuery>) -> Response {
    if !state.consensus.is_leader() {
        return leader_redirect(&state);
    }
    let (host_ids, digest) = {
        let namespace = state.namespace.read();
        match namespace.get_file(&q.path) {
            Ok(f) => (f.host_set.clone(), Some(f.digest.clone())),
            Err(e) => return (StatusCode::NOT_FOUND, e.to_string()).into_response(),
        }
    };

    if let Err(e) = state.consensus.submit_command(Command::DeleteFile { path: q.path.clone() }).await {
        return match e {
            MetaError::NotLeader { .. } => leader_redirect(&state),
            other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response(),
        };
    }

    if let Some(digest) = digest {
        for host_id in host_ids {
            if let Some(node) = state.registry.get_by_id(host_id) {
                let url = format!("http://{}/api/sdfs/delete?hash={}", node.address, digest);
                let http = state.http.clone();
                let digest = digest.clone();
                tokio::spawn(async move {
                    if let Err(e) = http.get(&url).send().await.and_then(|r| r.error_for_status()) {
                        warn!(node = %node.address, digest = %digest, error = %e, "digest deletion fan-out failed");
                    }
                });
            }
        }
    }
    StatusCode::OK.into_response()
}

#[derive(Deserialize)]
struct HeartbeatBody {
    host: String,
    cpu: f64,
    size: u64,
    memory: f64,
    disk: u64,
}

/// `POST /api/sdfs/heartbeat` — from a node. Registers a previously
/// unknown host via a committed `AddNode`, else just refreshes metrics.
async fn node_heartbeat(State(state): State<Arc<MasterState>>, Json(body): Json<HeartbeatBody>) -> Response {
    if !state.consensus.is_leader() {
        return leader_redirect(&state);
    }
    if !state.registry.contains_address(&body.host) {
        let node_id = NodeId::new(rand::random());
        if let Err(e) = state
            .consensus
            .submit_command(Command::AddNode { node_id, address: body.host.clone() })
            .await
        {
            warn!(host = %body.host, error = %e, "failed to commit AddNode for new heartbeat source");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    }
    state.registry.update_metrics(&body.host, body.cpu, body.memory, body.size, body.disk);
    StatusCode::OK.into_response()
}

#[derive(Deserialize)]
struct UploadCallbackBody {
    id: String,
    hash: String,
    host: String,
}

/// `POST /api/callback/upload` — from a node, once it has stored the
/// uploaded bytes and computed their digest.
async fn node_upload_callback(State(state): State<Arc<MasterState>>, Json(body): Json<UploadCallbackBody>) -> Response {
    if !state.consensus.is_leader() {
        return leader_redirect(&state);
    }
    let digest = Digest::from_encoded(body.hash);
    match state.uploads.finish_upload(&state.consensus, &body.id, digest.clone()).await {
        Ok(()) => {
            maybe_schedule_replication(&state, &body.host, digest);
            StatusCode::OK.into_response()
        }
        Err(CoordError::NotLeader { .. }) => leader_redirect(&state),
        Err(CoordError::NotFound) => (StatusCode::NOT_FOUND, "unknown upload id").into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Picks up to `replication_factor - 1` additional nodes (beyond the one
/// the upload already landed on) to push `digest` onto, ranked by free
/// disk space, and enqueues a replication task if any are available.
fn maybe_schedule_replication(state: &MasterState, source_host: &str, digest: Digest) {
    let wanted_total = state.replication_factor.max(1) as usize;
    let needed_targets = wanted_total.saturating_sub(1);
    // Fetch one extra candidate: the source host itself may be among the
    // top-ranked nodes and gets filtered out below.
    let targets: Vec<String> = state
        .registry
        .select_top_n(wanted_total + 1)
        .into_iter()
        .map(|n| n.address)
        .filter(|addr| addr != source_host)
        .take(needed_targets)
        .collect();
    if targets.is_empty() {
        return;
    }
    state.replicas.enqueue(ReplicaTask::new(source_host.to_string(), targets, digest));
}
