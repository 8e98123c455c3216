#![warn(missing_docs)]

//! SDFS metadata subsystem: the namespace, the command codec, Raft
//! consensus, and the node registry (C2–C5).

/// Typed state-machine commands and their codec (C3).
pub mod command;
/// Raft-style consensus state machine (C4).
pub mod consensus;
/// Persistent key-value store abstraction backing the Raft log (ambient).
pub mod kvstore;
/// Directory tree, digest index, and dedup (C2).
pub mod namespace;
/// Per-node liveness and the free-disk selection queue (C5).
pub mod registry;
/// Persistence of Raft hard state (term, voted_for, commit index, log).
pub mod raft_log;
/// Core types: ids, digests, and errors shared across this crate.
pub mod types;

pub use command::{Command, TypeTag};
pub use consensus::{LogEntry, RaftConfig, RaftMessage, RaftNode, RaftState};
pub use kvstore::{BatchOp, FileKvStore, KvStore, MemoryKvStore};
pub use namespace::{File, Namespace};
pub use raft_log::RaftLogStore;
pub use registry::{NodeRecord, NodeRegistry};
pub use types::{Digest, LogIndex, MetaError, NodeId, PeerId, Result, Term};
