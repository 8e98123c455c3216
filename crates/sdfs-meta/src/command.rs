//! Typed state-machine commands (C3): the payload carried by every Raft
//! log entry. Each variant has a stable numeric type tag, a deterministic
//! encoder/decoder, and is applied exactly once by the consensus module
//! in commit order.

use crate::types::{Digest, MetaError, NodeId, PeerId, Result};
use serde::{Deserialize, Serialize};

/// Stable wire tag for a command variant. Persisted nowhere on its own —
/// `bincode` already tags the enum — but kept as a documented constant so
/// the framing described in the external-interfaces contract has a home,
/// and so `decode` can recognise a payload that predates a future variant.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum TypeTag {
    AddServer = 1,
    AddNode = 2,
    AddFile = 3,
    DeleteFile = 4,
}

impl TypeTag {
    fn from_i32(v: i32) -> Option<Self> {
        match v {
            1 => Some(TypeTag::AddServer),
            2 => Some(TypeTag::AddNode),
            3 => Some(TypeTag::AddFile),
            4 => Some(TypeTag::DeleteFile),
            _ => None,
        }
    }
}

/// A command recorded in the Raft log and applied to the metadata state
/// machine on commit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Command {
    /// Add a peer to the consensus cluster and open an RPC channel to it.
    AddServer { peer_id: PeerId, address: String },
    /// Register a storage node in the cluster-wide registry.
    AddNode { node_id: NodeId, address: String },
    /// Bind a logical path to a digest and record its initial hosts.
    AddFile {
        host_ids: Vec<NodeId>,
        path: String,
        digest: Digest,
    },
    /// Remove a logical path's binding to its digest.
    DeleteFile { path: String },
}

impl Command {
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Command::AddServer { .. } => TypeTag::AddServer,
            Command::AddNode { .. } => TypeTag::AddNode,
            Command::AddFile { .. } => TypeTag::AddFile,
            Command::DeleteFile { .. } => TypeTag::DeleteFile,
        }
    }

    /// Deterministic encoding: a 4-byte little-endian type tag followed by
    /// the bincode-serialised variant body. `bincode`'s own encoding of
    /// fixed-width integers and length-prefixed strings/vecs satisfies the
    /// "fixed-width fields then variable-length byte strings" framing
    /// without hand-rolling a parallel format.
    pub fn encode(&self) -> Vec<u8> {
        let tag = self.type_tag() as i32;
        let mut out = Vec::new();
        out.extend_from_slice(&tag.to_le_bytes());
        let body = bincode::serialize(self).expect("command serialization is infallible");
        out.extend_from_slice(&body);
        out
    }

    /// Reverses `encode`. A malformed or truncated payload, or a type tag
    /// this build does not recognise, is a fatal decode error — command
    /// application must stay byte-exact across every master.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(MetaError::Corrupt("entry shorter than type tag".into()));
        }
        let mut tag_bytes = [0u8; 4];
        tag_bytes.copy_from_slice(&bytes[..4]);
        let tag = i32::from_le_bytes(tag_bytes);
        let known = TypeTag::from_i32(tag).ok_or(MetaError::UnknownTypeTag(tag))?;
        let cmd: Command = bincode::deserialize(&bytes[4..])
            .map_err(|e| MetaError::Corrupt(e.to_string()))?;
        debug_assert_eq!(known as i32, cmd.type_tag() as i32);
        Ok(cmd)
    }
}
