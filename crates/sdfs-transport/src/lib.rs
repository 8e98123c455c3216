#![warn(missing_docs)]

//! SDFS wire RPC: the binary-framed transport masters use to call
//! `AppendEntries`, `RequestVote`, and `RegisterMaster` on each other
//! (§6).

/// Frame/opcode wire format shared by client and server.
pub mod protocol;
/// Request/response correlation over a `TcpConnection`.
pub mod rpc;
/// TCP connection setup and frame I/O.
pub mod tcp;
/// Transport error type.
pub mod error;

pub use error::{Result, TransportError};
pub use protocol::{Frame, FrameFlags, FrameHeader, Opcode, WireEntry};
pub use rpc::{RpcClient, RpcClientConfig, RpcHandler, RpcServer};
pub use tcp::{TcpConnection, TcpTransport, TcpTransportConfig};
