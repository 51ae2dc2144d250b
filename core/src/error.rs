//! Flat error taxonomy for the SPV core.
//!
//! Every subsystem owns one error enum; `SpvError` composes them with
//! `#[from]` so a single `?` anywhere in the core converts cleanly, mirroring
//! how the rest of this codebase keeps one top-level error per crate instead
//! of a web of ad-hoc `String` errors.

use thiserror::Error;

/// Top-level error type for the SPV core.
#[derive(Debug, Error)]
pub enum SpvError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("header error: {0}")]
    Header(#[from] HeaderError),

    #[error("merkle tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type SpvResult<T> = Result<T, SpvError>;

/// Errors from the wire codec (§4.1).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("checksum mismatch for command {command:?}")]
    ChecksumMismatch { command: String },

    #[error("oversize payload: {len} bytes exceeds the {max} byte limit")]
    OversizePayload { len: usize, max: usize },

    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// Errors from header/Merkle validation (§4.2).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("timestamp {timestamp} is more than {max_drift}s ahead of now ({now})")]
    BadTimestamp {
        timestamp: u32,
        now: u32,
        max_drift: u32,
    },

    #[error("bits {bits:#010x} decode to a target above max-proof-of-work")]
    BadProofOfWorkLimit { bits: u32 },

    #[error("block id does not satisfy its own target")]
    BadProofOfWork,

    #[error("bits {found:#010x} does not match expected retarget value {expected:#010x}")]
    BadDifficulty { found: u32, expected: u32 },

    #[error("checkpoint mismatch at height {height}: expected {expected}, got {found}")]
    CheckpointMismatch {
        height: u32,
        expected: String,
        found: String,
    },

    #[error("invalid compact bits encoding {0:#010x}")]
    InvalidBits(u32),
}

/// Errors from partial Merkle tree reconstruction (§4.2).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("malformed partial merkle tree: {0}")]
    MalformedTree(String),

    #[error("reconstructed root does not match the expected root")]
    UnexpectedRoot,
}

/// Errors from the chain store (§4.3).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("block {0} is an orphan: parent not known")]
    Orphan(String),

    #[error("block {0} is already known")]
    AlreadyKnown(String),

    #[error("reorganization would exceed the retention window ({depth} > {limit})")]
    ForkTooDeep { depth: u32, limit: u32 },

    #[error(transparent)]
    Header(#[from] HeaderError),
}

/// Errors from the per-peer session state machine (§4.4).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("handshake did not complete before the deadline")]
    HandshakeTimeout,

    #[error("no pong received for outstanding ping within the keep-alive deadline")]
    KeepAliveTimeout,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Errors from the download coordinator (§4.5).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("no eligible peer to act as download peer")]
    NoEligiblePeer,

    #[error("download stalled: {0}")]
    DownloadStalled(String),
}

/// Errors from the persistence port (§6, §4.7).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corruption detected: {0}")]
    Corruption(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[cfg(feature = "sled-storage")]
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
}
