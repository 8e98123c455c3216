#![warn(missing_docs)]

//! SDFS master subsystem: the Raft wiring layer, the upload and replica
//! coordinators, and the HTTP front door masters serve to clients and
//! storage nodes (C4, C6, C7, C8).

/// Client and node-facing HTTP front door (C8).
pub mod api;
/// Startup configuration.
pub mod config;
/// Async wiring around the Raft state machine: election timer, heartbeat
/// ticker, wire RPC handler, and commit pipeline (C4).
pub mod consensus_service;
/// Single-flight upload coordination (C6).
pub mod upload;
/// Bounded-concurrency cross-node replication (C7).
pub mod replica;
