//! Upload coordinator (C6): at-most-one upload per path, node selection
//! from the registry, and the two-phase commit (reserve → node accepts
//! bytes → callback → `AddFile` commit) described in spec §4.6.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use sdfs_meta::{Command, Digest, MetaError, NodeId, NodeRegistry};
use thiserror::Error;
use tracing::warn;

use crate::consensus_service::ConsensusService;

const UPLOAD_ID_LEN: usize = 8;
const UPLOAD_ID_MAX_ATTEMPTS: usize = 8;

/// Errors returned by the upload coordinator, mapping onto spec §7's
/// abstract error kinds.
#[derive(Debug, Error)]
pub enum CoordError {
    #[error("an upload is already pending for this path")]
    Conflict,
    #[error("no storage node is available to accept the upload")]
    Unavailable,
    #[error("the chosen node rejected the reservation: {0}")]
    Remote(String),
    #[error("no upload id was found for this path")]
    NotFound,
    #[error("this master is not the leader")]
    NotLeader { leader_address: Option<String> },
}

impl From<MetaError> for CoordError {
    fn from(err: MetaError) -> Self {
        match err {
            MetaError::NotLeader { leader_address, .. } => CoordError::NotLeader { leader_address },
            other => CoordError::Remote(other.to_string()),
        }
    }
}

struct UploadRecord {
    path: String,
    node_id: NodeId,
    node_addr: String,
}

/// Tracks in-flight uploads. One instance per master process, shared by
/// every request handler.
pub struct UploadCoordinator {
    uploads: Mutex<HashMap<String, UploadRecord>>,
    pending: Mutex<HashSet<String>>,
    registry: Arc<NodeRegistry>,
    http: reqwest::Client,
}

impl UploadCoordinator {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self {
            uploads: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            registry,
            http: reqwest::Client::new(),
        }
    }

    /// Reserves an upload slot for `path` on the best-available node.
    /// Returns the upload id and the node's address for the client to
    /// POST bytes to.
    pub async fn add_upload(&self, path: String) -> Result<(String, String), CoordError> {
        {
            let mut pending = self.pending.lock();
            if pending.contains(&path) {
                return Err(CoordError::Conflict);
            }
            pending.insert(path.clone());
        }

        let node = match self.registry.select_best() {
            Some(n) => n,
            None => {
                self.pending.lock().remove(&path);
                return Err(CoordError::Unavailable);
            }
        };

        let id = match self.fresh_upload_id() {
            Some(id) => id,
            None => {
                self.pending.lock().remove(&path);
                return Err(CoordError::Remote("upload id space exhausted".into()));
            }
        };

        let reserve_url = format!("http://{}/api/sdfs/upload?id={}", node.address, id);
        let reserved = self.http.get(&reserve_url).send().await.and_then(|r| r.error_for_status());
        if let Err(e) = reserved {
            self.pending.lock().remove(&path);
            return Err(CoordError::Remote(e.to_string()));
        }

        self.uploads.lock().insert(
            id.clone(),
            UploadRecord { path, node_id: node.node_id, node_addr: node.address.clone() },
        );
        Ok((id, node.address))
    }

    /// Called once a node's upload callback reports the digest it
    /// computed. Submits `AddFile` to consensus and waits for it to
    /// commit before releasing the path and upload id.
    pub async fn finish_upload(
        &self,
        consensus: &Arc<ConsensusService>,
        id: &str,
        digest: Digest,
    ) -> Result<(), CoordError> {
        let record = self.uploads.lock().remove(id).ok_or(CoordError::NotFound)?;

        let command = Command::AddFile {
            host_ids: vec![record.node_id],
            path: record.path.clone(),
            digest,
        };
        match consensus.submit_command(command).await {
            Ok(()) => {
                self.pending.lock().remove(&record.path);
                Ok(())
            }
            Err(e) => {
                // Put the record back so a retry against the real leader
                // can still resolve this id.
                self.uploads.lock().insert(
                    id.to_string(),
                    UploadRecord { path: record.path, node_id: record.node_id, node_addr: record.node_addr },
                );
                Err(e.into())
            }
        }
    }

    fn fresh_upload_id(&self) -> Option<String> {
        let uploads = self.uploads.lock();
        for _ in 0..UPLOAD_ID_MAX_ATTEMPTS {
            let id = random_alphanumeric(UPLOAD_ID_LEN);
            if !uploads.contains_key(&id) {
                return Some(id);
            }
        }
        warn!("exhausted upload id resample attempts, id space unexpectedly saturated");
        None
    }
}

fn random_alphanumeric(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len).map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_have_requested_length() {
        assert_eq!(random_alphanumeric(8).len(), 8);
    }

    #[tokio::test]
    async fn add_upload_fails_unavailable_with_empty_registry() {
        let registry = Arc::new(NodeRegistry::new());
        let coord = UploadCoordinator::new(registry);
        let err = coord.add_upload("/a.txt".into()).await.unwrap_err();
        assert!(matches!(err, CoordError::Unavailable));
    }

    #[tokio::test]
    async fn add_upload_conflict_on_pending_path() {
        let registry = Arc::new(NodeRegistry::new());
        let coord = UploadCoordinator::new(registry);
        coord.pending.lock().insert("/a.txt".into());
        let err = coord.add_upload("/a.txt".into()).await.unwrap_err();
        assert!(matches!(err, CoordError::Conflict));
    }
}
