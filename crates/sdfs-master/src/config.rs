use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// One other master this process knows about at startup, before any
/// `RegisterMaster`/`AddServer` traffic has run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerAddr {
    pub peer_id: u64,
    pub raft_addr: String,
}

/// Startup configuration for the `sdfs-master` binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// This master's own id in the consensus cluster.
    pub peer_id: u64,
    /// Address the HTTP front door (C8) binds, serving clients and nodes.
    pub bind_addr: SocketAddr,
    /// Address the wire RPC listener binds for RequestVote/AppendEntries/
    /// RegisterMaster.
    pub raft_addr: SocketAddr,
    /// Statically configured peers, known at process start.
    pub peers: Vec<PeerAddr>,
    /// An existing master's raft address to `RegisterMaster` against at
    /// bootstrap, for a master joining a running cluster. `None` for the
    /// cluster's first master.
    pub join_addr: Option<String>,
    /// Where the append-only Raft log and hard-state sidecar live.
    pub data_dir: PathBuf,
    /// Read once at startup; non-empty shrinks the election timeout band,
    /// mirroring `RAFT_FORCE_MORE_REELECTION` (spec §6).
    pub force_more_reelection: bool,
    /// Target number of nodes that should end up holding a given digest
    /// (the upload's own node counts as the first). The replica manager
    /// fans out to `replication_factor - 1` additional nodes once an
    /// upload lands.
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u32,
}

fn default_replication_factor() -> u32 {
    2
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            peer_id: 1,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            raft_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            peers: Vec::new(),
            join_addr: None,
            data_dir: PathBuf::from("/var/lib/sdfs/master"),
            force_more_reelection: false,
            replication_factor: default_replication_factor(),
        }
    }
}

impl MasterConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("unsupported config file extension: {}", ext),
        }
    }

    /// Builds a config from environment variables, falling back to
    /// `Default` for anything unset. `SDFS_PEER_ID`, `SDFS_BIND_ADDR`,
    /// `SDFS_RAFT_ADDR`, `SDFS_PEERS` (comma-separated `id@addr`),
    /// `SDFS_JOIN_ADDR`, `SDFS_DATA_DIR`, `SDFS_REPLICATION_FACTOR`.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("SDFS_PEER_ID") {
            config.peer_id = v.parse()?;
        }
        if let Ok(v) = std::env::var("SDFS_BIND_ADDR") {
            config.bind_addr = v.parse()?;
        }
        if let Ok(v) = std::env::var("SDFS_RAFT_ADDR") {
            config.raft_addr = v.parse()?;
        }
        if let Ok(v) = std::env::var("SDFS_PEERS") {
            config.peers = v
                .split(',')
                .filter(|s| !s.is_empty())
                .filter_map(|entry| {
                    let (id, addr) = entry.split_once('@')?;
                    Some(PeerAddr { peer_id: id.parse().ok()?, raft_addr: addr.to_string() })
                })
                .collect();
        }
        if let Ok(v) = std::env::var("SDFS_JOIN_ADDR") {
            config.join_addr = Some(v);
        }
        if let Ok(v) = std::env::var("SDFS_DATA_DIR") {
            config.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SDFS_REPLICATION_FACTOR") {
            config.replication_factor = v.parse()?;
        }
        config.force_more_reelection = std::env::var("RAFT_FORCE_MORE_REELECTION")
            .map(|v| !v.is_empty())
            .unwrap_or(false);
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = MasterConfig::default();
        assert_eq!(config.peer_id, 1);
        assert_eq!(config.bind_addr, SocketAddr::from(([0, 0, 0, 0], 8080)));
        assert!(config.peers.is_empty());
        assert!(config.join_addr.is_none());
        assert!(!config.force_more_reelection);
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
peer_id = 2
bind_addr = "10.0.0.2:8080"
raft_addr = "10.0.0.2:8081"
peers = [{{ peer_id = 1, raft_addr = "10.0.0.1:8081" }}]
data_dir = "/tmp/sdfs-master"
force_more_reelection = true
            "#
        )
        .unwrap();

        let config = MasterConfig::from_file(file.path()).unwrap();
        assert_eq!(config.peer_id, 2);
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.peers[0].raft_addr, "10.0.0.1:8081");
        assert!(config.force_more_reelection);
    }

    #[test]
    fn test_default_replication_factor_is_two() {
        let config = MasterConfig::default();
        assert_eq!(config.replication_factor, 2);
    }

    #[test]
    fn test_serialization_round_trip() {
        let config = MasterConfig {
            peer_id: 3,
            peers: vec![PeerAddr { peer_id: 1, raft_addr: "h:1".into() }],
            ..MasterConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let decoded: MasterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.peer_id, decoded.peer_id);
        assert_eq!(config.peers.len(), decoded.peers.len());
    }
}
