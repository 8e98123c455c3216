//! Transport error types for the SDFS wire RPC layer.

use thiserror::Error;

/// Transport-specific errors that can occur during network operations.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection was refused by the remote host.
    #[error("connection refused to {addr}")]
    ConnectionRefused {
        /// Remote address that refused the connection.
        addr: String,
    },

    /// Connection attempt timed out.
    #[error("connection to {addr} timed out after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Remote address for the timed-out connection.
        addr: String,
        /// Timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// Connection was reset by the remote host.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// Frame had invalid magic number.
    #[error("invalid magic: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic {
        /// Expected magic number.
        expected: u32,
        /// Actual magic number received.
        got: u32,
    },

    /// Protocol version mismatch.
    #[error("version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// Expected protocol version.
        expected: u8,
        /// Actual protocol version received.
        got: u8,
    },

    /// Checksum verification failed.
    #[error("checksum mismatch: expected 0x{expected:08X}, computed 0x{computed:08X}")]
    ChecksumMismatch {
        /// Expected checksum value.
        expected: u32,
        /// Computed checksum value.
        computed: u32,
    },

    /// Payload exceeds maximum allowed size.
    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge {
        /// Size of the payload in bytes.
        size: u32,
        /// Maximum allowed payload size in bytes.
        max_size: u32,
    },

    /// Request timed out while waiting for response.
    #[error("request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// Unique identifier for the request.
        request_id: u64,
        /// Timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// Received an unknown opcode.
    #[error("unknown opcode: 0x{0:04X}")]
    UnknownOpcode(u16),

    /// Not connected to any peer.
    #[error("not connected")]
    NotConnected,

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// I/O error from the standard library.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
