//! Error types for homewire.

use thiserror::Error;

/// Main error type for all homewire operations.
#[derive(Debug, Error)]
pub enum HomewireError {
    /// I/O error during socket or flash-image operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Inbound byte stream could not be framed.
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Payload could not be sealed or opened.
    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),

    /// Every registry slot is occupied.
    #[error("No free client slot")]
    RegistryFull,

    /// No session is registered under this identity.
    #[error("Unknown client: {0}")]
    UnknownClient(String),

    /// Framed message does not fit in the per-client send buffer.
    #[error("Frame of {len} bytes exceeds send buffer capacity {capacity}")]
    SendBufferOverflow { len: usize, capacity: usize },

    /// The client's writer queue has no free slot.
    #[error("Writer queue full ({slots} frames pending)")]
    QueueFull { slots: usize },

    /// Connection closed (writer gone or peer hung up).
    #[error("Connection closed")]
    ConnectionClosed,

    /// Non-volatile storage failure.
    #[error("Flash error: {0}")]
    Flash(String),

    /// Domain service rejected or failed a command.
    #[error("Service error: {0}")]
    Service(String),
}

/// Faults raised while reassembling frames from a byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The accumulator filled up without ever containing a length delimiter.
    #[error("accumulator full ({capacity} bytes) without a frame header")]
    HeaderOverflow { capacity: usize },
}

/// Faults raised by the cipher layer. Callers drop the message on any of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CipherError {
    /// Ciphertext was not valid base64.
    #[error("invalid base64 encoding")]
    InvalidEncoding,

    /// Decoded ciphertext is shorter than the nonce.
    #[error("ciphertext shorter than nonce ({0} bytes)")]
    Truncated(usize),

    /// Key material is not 32 bytes of hex.
    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

/// Reasons an inbound message is dropped by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolFault {
    /// Payload is not a JSON object.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// `type` is absent or not a string.
    #[error("missing or non-string type field")]
    MissingType,

    /// `type` is a string that names no inbound command.
    #[error("unrecognized type {0:?}")]
    Unrecognized(String),

    /// `type` names a command only the server may send.
    #[error("send-only type {0:?} received")]
    SendOnly(String),
}

/// Result type alias using HomewireError.
pub type Result<T> = std::result::Result<T, HomewireError>;
