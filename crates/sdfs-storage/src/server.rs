//! Node-side HTTP data plane: download tickets, upload reservation,
//! delete, replica reception, and the heartbeat emitter (§4.1, §6).

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::content_store::ContentStore;
use crate::digest::Digest;
use crate::error::StorageError;

/// How long an unused download ticket stays valid.
pub const DOWNLOAD_TICKET_TTL: Duration = Duration::from_secs(3600);

/// Static configuration for a storage node process.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address this node's HTTP server binds to.
    pub bind_addr: SocketAddr,
    /// Root directory objects are stored under.
    pub data_prefix: PathBuf,
    /// Address this node advertises to masters and clients.
    pub advertise_addr: String,
    /// Known master addresses; the first reachable one is tried, and the
    /// heartbeat loop follows 307 redirects to the current leader.
    pub master_addrs: Vec<String>,
    /// Heartbeat emission interval.
    pub heartbeat_interval: Duration,
}

struct DownloadTicket {
    digest: Digest,
    #[allow(dead_code)]
    filename: String,
    created_at: Instant,
}

/// Shared node state behind the HTTP router.
pub struct NodeState {
    store: ContentStore,
    config: NodeConfig,
    tickets: RwLock<HashMap<String, DownloadTicket>>,
    pending_uploads: RwLock<HashSet<String>>,
    current_master: RwLock<String>,
    http: reqwest::Client,
}

impl NodeState {
    /// Build node state from a content store and config.
    pub fn new(store: ContentStore, config: NodeConfig) -> Arc<Self> {
        let current_master = config.master_addrs.first().cloned().unwrap_or_default();
        Arc::new(Self {
            store,
            config,
            tickets: RwLock::new(HashMap::new()),
            pending_uploads: RwLock::new(HashSet::new()),
            current_master: RwLock::new(current_master),
            http: reqwest::Client::new(),
        })
    }

    /// The content store this node serves.
    pub fn store(&self) -> &ContentStore {
        &self.store
    }
}

/// Build the axum router exposing this node's HTTP endpoints.
pub fn router(state: Arc<NodeState>) -> Router {
    Router::new()
        .route("/api/sdfs/download", get(create_download_ticket))
        .route("/api/download", get(stream_download))
        .route("/api/sdfs/upload", get(reserve_upload))
        .route("/api/upload", post(receive_upload))
        .route("/api/sdfs/delete", get(delete_object))
        .route("/api/sdfs/replica/request", post(receive_replica))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Deserialize)]
struct DownloadCreateQuery {
    hash: String,
    name: Option<String>,
}

#[derive(Serialize)]
struct DownloadTicketResponse {
    ticket: String,
}

async fn create_download_ticket(
    State(state): State<Arc<NodeState>>,
    Query(q): Query<DownloadCreateQuery>,
) -> Response {
    let digest = Digest::from_encoded(q.hash.clone());
    if !state.store.contains(&digest) {
        return (StatusCode::NOT_FOUND, "unknown digest").into_response();
    }
    let ticket_id = uuid::Uuid::new_v4().simple().to_string();
    state.tickets.write().insert(
        ticket_id.clone(),
        DownloadTicket {
            digest,
            filename: q.name.unwrap_or_default(),
            created_at: Instant::now(),
        },
    );
    axum::Json(DownloadTicketResponse { ticket: ticket_id }).into_response()
}

#[derive(Deserialize)]
struct DownloadStreamQuery {
    id: String,
}

async fn stream_download(
    State(state): State<Arc<NodeState>>,
    Query(q): Query<DownloadStreamQuery>,
    headers: HeaderMap,
) -> Response {
    let digest = {
        let tickets = state.tickets.read();
        match tickets.get(&q.id) {
            Some(t) if t.created_at.elapsed() < DOWNLOAD_TICKET_TTL => t.digest.clone(),
            Some(_) => return (StatusCode::GONE, "ticket expired").into_response(),
            None => return (StatusCode::NOT_FOUND, "unknown ticket").into_response(),
        }
    };

    let handle = match state.store.get(&digest) {
        Ok(h) => h,
        Err(_) => return (StatusCode::NOT_FOUND, "object missing").into_response(),
    };
    let bytes = match std::fs::read(handle.path()) {
        Ok(b) => b,
        Err(e) => {
            warn!(digest = %digest, error = %e, "failed reading object for download");
            return (StatusCode::INTERNAL_SERVER_ERROR, "read failed").into_response();
        }
    };
    drop(handle);

    if let Some(range) = headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        return match parse_range(range, bytes.len()) {
            Some((start, end)) => {
                let slice = bytes[start..=end].to_vec();
                let content_range = format!("bytes {start}-{end}/{}", bytes.len());
                (
                    StatusCode::PARTIAL_CONTENT,
                    [
                        (header::CONTENT_RANGE, content_range),
                        (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                    ],
                    slice,
                )
                    .into_response()
            }
            None => (StatusCode::INTERNAL_SERVER_ERROR, format!("invalid range: {range}")).into_response(),
        };
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    )
        .into_response()
}

fn parse_range(header_value: &str, len: usize) -> Option<(usize, usize)> {
    let spec = header_value.strip_prefix("bytes=")?;
    let (start_s, end_s) = spec.split_once('-')?;
    let (start, end) = if start_s.is_empty() {
        // `bytes=-N`: last N bytes.
        let suffix_len: usize = end_s.parse().ok()?;
        if suffix_len == 0 || suffix_len > len {
            return None;
        }
        (len - suffix_len, len - 1)
    } else {
        let start: usize = start_s.parse().ok()?;
        let end = if end_s.is_empty() {
            // `bytes=S-`: from S to EOF.
            len.checked_sub(1)?
        } else {
            end_s.parse().ok()?
        };
        (start, end)
    };
    if start > end || end >= len {
        return None;
    }
    Some((start, end))
}

#[derive(Deserialize)]
struct UploadReserveQuery {
    id: String,
}

async fn reserve_upload(
    State(state): State<Arc<NodeState>>,
    Query(q): Query<UploadReserveQuery>,
) -> Response {
    state.pending_uploads.write().insert(q.id.clone());
    debug!(upload_id = %q.id, "reserved upload slot");
    StatusCode::OK.into_response()
}

#[derive(Deserialize)]
struct UploadBodyQuery {
    id: String,
}

#[derive(Serialize)]
struct UploadCallbackBody {
    id: String,
    hash: String,
    host: String,
}

async fn receive_upload(
    State(state): State<Arc<NodeState>>,
    Query(q): Query<UploadBodyQuery>,
    body: Bytes,
) -> Response {
    {
        let mut pending = state.pending_uploads.write();
        if !pending.remove(&q.id) {
            return (StatusCode::CONFLICT, "no reserved upload for this id").into_response();
        }
    }

    let digest = match state.store.add(&body) {
        Ok(d) => d,
        Err(e) => {
            warn!(upload_id = %q.id, error = %e, "upload write failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "write failed").into_response();
        }
    };

    let master = state.current_master.read().clone();
    if !master.is_empty() {
        let callback = UploadCallbackBody {
            id: q.id.clone(),
            hash: digest.as_str().to_string(),
            host: state.config.advertise_addr.clone(),
        };
        let url = format!("http://{master}/api/callback/upload");
        if let Err(e) = state.http.post(&url).json(&callback).send().await {
            warn!(error = %e, url, "failed to post upload callback to master");
        }
    }

    (StatusCode::ACCEPTED, axum::Json(serde_json::json!({ "hash": digest.as_str() }))).into_response()
}

#[derive(Deserialize)]
struct DeleteQuery {
    hash: String,
}

async fn delete_object(State(state): State<Arc<NodeState>>, Query(q): Query<DeleteQuery>) -> Response {
    let digest = Digest::from_encoded(q.hash);
    match state.store.remove(&digest) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(StorageError::Busy { .. }) => StatusCode::CONFLICT.into_response(),
        Err(StorageError::NotFound { .. }) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!(error = %e, "delete failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Deserialize)]
struct ReplicaRequestBody {
    link: String,
    hash: String,
}

async fn receive_replica(State(state): State<Arc<NodeState>>, axum::Json(body): axum::Json<ReplicaRequestBody>) -> Response {
    let digest = Digest::from_encoded(body.hash.clone());
    if state.store.contains(&digest) {
        debug!(digest = %digest, "replica request is a no-op, already held");
        return StatusCode::OK.into_response();
    }

    let bytes = match state.http.get(&body.link).send().await {
        Ok(resp) => match resp.bytes().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed reading replica body");
                return StatusCode::BAD_GATEWAY.into_response();
            }
        },
        Err(e) => {
            warn!(error = %e, link = %body.link, "failed fetching replica source");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let stored = match state.store.add(&bytes) {
        Ok(d) => d,
        Err(e) => {
            warn!(error = %e, "failed storing replica bytes");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    if stored != digest {
        warn!(expected = %digest, got = %stored, "replica digest mismatch");
        let _ = state.store.remove(&stored);
        return StatusCode::UNPROCESSABLE_ENTITY.into_response();
    }
    StatusCode::OK.into_response()
}

#[derive(Serialize)]
struct HeartbeatBody {
    host: String,
    cpu: f64,
    size: u64,
    memory: f64,
    disk: u64,
}

/// Run the heartbeat emitter at 1 Hz until the process exits. Follows a
/// 307 redirect to the current leader's address.
pub async fn run_heartbeat_loop(state: Arc<NodeState>) {
    let mut interval = tokio::time::interval(state.config.heartbeat_interval);
    loop {
        interval.tick().await;
        let master = state.current_master.read().clone();
        if master.is_empty() {
            continue;
        }
        let body = HeartbeatBody {
            host: state.config.advertise_addr.clone(),
            cpu: 0.0,
            size: state.store.total_bytes(),
            memory: 0.0,
            disk: state.store.total_bytes(),
        };
        let url = format!("http://{master}/api/sdfs/heartbeat");
        match state.http.post(&url).json(&body).send().await {
            Ok(resp) if resp.status() == StatusCode::TEMPORARY_REDIRECT => {
                if let Some(location) = resp.headers().get(header::LOCATION).and_then(|v| v.to_str().ok()) {
                    info!(new_leader = location, "heartbeat redirected to new leader");
                    *state.current_master.write() = location.trim_start_matches("http://").to_string();
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, url, "heartbeat send failed"),
        }
    }
}

/// Periodically drop download tickets idle past `DOWNLOAD_TICKET_TTL`.
pub async fn run_ticket_sweep(state: Arc<NodeState>) {
    let mut interval = tokio::time::interval(Duration::from_secs(3600));
    loop {
        interval.tick().await;
        let mut tickets = state.tickets.write();
        let before = tickets.len();
        tickets.retain(|_, t| t.created_at.elapsed() < DOWNLOAD_TICKET_TTL);
        let dropped = before - tickets.len();
        if dropped > 0 {
            debug!(dropped, "swept expired download tickets");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_parses_inclusive_bounds() {
        assert_eq!(parse_range("bytes=0-4", 10), Some((0, 4)));
        assert_eq!(parse_range("bytes=5-", 10), Some((5, 9)));
        assert_eq!(parse_range("bytes=5-20", 10), None);
        assert_eq!(parse_range("nonsense", 10), None);
    }

    #[test]
    fn range_parses_suffix_form() {
        assert_eq!(parse_range("bytes=-3", 10), Some((7, 9)));
        assert_eq!(parse_range("bytes=-20", 10), None);
        assert_eq!(parse_range("bytes=-0", 10), None);
    }
}
