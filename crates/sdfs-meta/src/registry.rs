//! Node registry (C5): per-node liveness and resource metrics, with a
//! selection queue ordered by free disk space. Populated by committed
//! `AddNode` commands; liveness fields update locally from heartbeats and
//! are never themselves replicated through the log.

use crate::types::NodeId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Everything known about one storage node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub address: String,
    pub cpu: f64,
    pub memory_pct: f64,
    pub used_bytes: u64,
    pub free_bytes_disk: u64,
    pub last_heartbeat_secs: u64,
}

/// Address-keyed view plus a free-disk-ordered selection queue. The queue
/// is rebuilt from the map on read rather than maintained incrementally —
/// acceptable at the scale this system targets, and it avoids a second
/// source of truth to keep consistent with the map.
pub struct NodeRegistry {
    by_address: RwLock<HashMap<String, NodeRecord>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            by_address: RwLock::new(HashMap::new()),
        }
    }

    pub fn contains_address(&self, address: &str) -> bool {
        self.by_address.read().contains_key(address)
    }

    pub fn contains_node_id(&self, node_id: NodeId) -> bool {
        self.by_address.read().values().any(|r| r.node_id == node_id)
    }

    /// Inserts a brand-new node (called when an `AddNode` command is
    /// applied). Idempotent: re-applying the same `AddNode` just
    /// overwrites the placeholder metrics.
    pub fn register(&self, node_id: NodeId, address: String) {
        let mut map = self.by_address.write();
        map.entry(address.clone()).or_insert(NodeRecord {
            node_id,
            address,
            cpu: 0.0,
            memory_pct: 0.0,
            used_bytes: 0,
            free_bytes_disk: 0,
            last_heartbeat_secs: now_secs(),
        });
    }

    /// Updates metrics in place for an address already known to the
    /// registry. No-op if the address is unknown — callers are expected
    /// to have gone through `register` (via a committed `AddNode`) first.
    pub fn update_metrics(
        &self,
        address: &str,
        cpu: f64,
        memory_pct: f64,
        used_bytes: u64,
        free_bytes_disk: u64,
    ) {
        if let Some(rec) = self.by_address.write().get_mut(address) {
            rec.cpu = cpu;
            rec.memory_pct = memory_pct;
            rec.used_bytes = used_bytes;
            rec.free_bytes_disk = free_bytes_disk;
            rec.last_heartbeat_secs = now_secs();
        }
    }

    /// Returns the node with the most free disk space, if any node is
    /// registered. Used by the upload coordinator to choose a target for a
    /// new upload.
    pub fn select_best(&self) -> Option<NodeRecord> {
        self.select_top_n(1).into_iter().next()
    }

    /// Returns up to `n` nodes ranked by free disk space, most free first.
    /// Used by the replica manager to fill out a file's replica set to a
    /// configured target count rather than just picking a single node.
    pub fn select_top_n(&self, n: usize) -> Vec<NodeRecord> {
        let mut records: Vec<NodeRecord> = self.by_address.read().values().cloned().collect();
        records.sort_by(|a, b| b.free_bytes_disk.cmp(&a.free_bytes_disk));
        records.truncate(n);
        records
    }

    pub fn get(&self, address: &str) -> Option<NodeRecord> {
        self.by_address.read().get(address).cloned()
    }

    /// Looks a node up by id rather than address. Used when the caller
    /// only has a `NodeId` on hand, e.g. resolving a `File::host_set`
    /// entry back to a reachable address.
    pub fn get_by_id(&self, node_id: NodeId) -> Option<NodeRecord> {
        self.by_address.read().values().find(|r| r.node_id == node_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.by_address.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Age in seconds since the last heartbeat for `address`, if known.
    /// Exposed only for the metrics snapshot; no eviction is performed on
    /// it (spec §9 leaves heartbeat-silence de-registration as an open
    /// extension point, so this data is surfaced without acting on it).
    pub fn last_heartbeat_age(&self, address: &str) -> Option<u64> {
        self.by_address
            .read()
            .get(address)
            .map(|r| now_secs().saturating_sub(r.last_heartbeat_secs))
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_address_selects_nothing() {
        let reg = NodeRegistry::new();
        assert!(reg.select_best().is_none());
    }

    #[test]
    fn selects_node_with_most_free_disk() {
        let reg = NodeRegistry::new();
        reg.register(NodeId::new(1), "a:1".into());
        reg.register(NodeId::new(2), "b:1".into());
        reg.update_metrics("a:1", 0.1, 0.1, 0, 100);
        reg.update_metrics("b:1", 0.1, 0.1, 0, 900);
        let best = reg.select_best().unwrap();
        assert_eq!(best.address, "b:1");
    }

    #[test]
    fn update_metrics_on_unknown_address_is_noop() {
        let reg = NodeRegistry::new();
        reg.update_metrics("ghost:1", 0.0, 0.0, 0, 0);
        assert!(reg.get("ghost:1").is_none());
    }

    #[test]
    fn select_top_n_ranks_by_free_disk_descending() {
        let reg = NodeRegistry::new();
        reg.register(NodeId::new(1), "a:1".into());
        reg.register(NodeId::new(2), "b:1".into());
        reg.register(NodeId::new(3), "c:1".into());
        reg.update_metrics("a:1", 0.0, 0.0, 0, 100);
        reg.update_metrics("b:1", 0.0, 0.0, 0, 900);
        reg.update_metrics("c:1", 0.0, 0.0, 0, 500);

        let top2: Vec<String> = reg.select_top_n(2).into_iter().map(|r| r.address).collect();
        assert_eq!(top2, vec!["b:1".to_string(), "c:1".to_string()]);
    }

    #[test]
    fn select_top_n_saturates_at_registry_size() {
        let reg = NodeRegistry::new();
        reg.register(NodeId::new(1), "a:1".into());
        assert_eq!(reg.select_top_n(5).len(), 1);
    }
}
