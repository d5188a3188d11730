//! # Error Taxonomy
//!
//! Centralizes the error categories this benchmark can raise, following the
//! same split the original implementation used between configuration/usage
//! errors (fail fast, at construction) and transport errors (surfaced from
//! `run()`/completion callbacks and treated as fatal, never retried).
//!
//! All of these are folded into `anyhow::Result` at the application
//! boundary, the way `main.rs` does for every benchmark mechanism.

use thiserror::Error;

/// Errors raised while validating configuration or routing tables, before
/// any transport activity begins.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("routing table is incomplete: rank {rank} does not reach every peer")]
    IncompleteRoutingTable { rank: u64 },

    #[error("malformed routing table line {line_no}: {line:?}")]
    InvalidRoutingTable { line_no: usize, line: String },

    #[error("packet size {packet_size} is not a multiple of element size {element_size}")]
    UnalignedPacketSize {
        packet_size: usize,
        element_size: usize,
    },

    #[error("chunk size {chunk_size} does not evenly divide the circular buffer size {buffer_size}")]
    UnalignedChunkSize {
        chunk_size: usize,
        buffer_size: usize,
    },

    #[error("mode {mode} requires world size {required}, got {actual}")]
    WorldSizeMismatch {
        mode: &'static str,
        required: u64,
        actual: u64,
    },

    #[error("iters_to_sync must be greater than zero")]
    ZeroSyncInterval,

    #[error("channel count {0} exceeds the maximum of 256")]
    TooManyChannels(usize),

    #[error("unknown test number {0}")]
    UnknownTestNumber(u32),
}

/// Raised when a caller attempts to use a channel after marking it EOF.
#[derive(Debug, Error)]
#[error("send<{channel}> called after mark_eof({channel}) on this rank")]
pub struct UsageAfterEof {
    pub channel: usize,
}

/// Raised when peers disagree on the channel-type schema fingerprint
/// reduced to rank 0 at communicator construction.
#[derive(Debug, Error)]
#[error("channel-type schema mismatch: local fingerprint {local:#x}, rank 0 fingerprint {authoritative:#x}")]
pub struct TypeMismatch {
    pub local: u64,
    pub authoritative: u64,
}

/// Transport-level failures surfaced from async completions. These are
/// always fatal: the benchmark does not attempt recovery (spec Non-goals).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection to rank {rank} failed: {source}")]
    Connect {
        rank: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("send to rank {dest} failed: {source}")]
    Send {
        dest: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("receive failed: {source}")]
    Receive {
        #[source]
        source: std::io::Error,
    },

    #[error("peer {rank} closed the connection unexpectedly")]
    PeerClosed { rank: u64 },

    #[error("completion callback observed a non-zero status: {0}")]
    CompletionStatus(String),

    #[error("out-of-band descriptor exchange with rank {rank} failed: {detail}")]
    OobExchange { rank: u64, detail: String },
}

/// Checks a completion "status" the way the original's `ucp::check(status)`
/// idiom does on completion callbacks: zero is success, anything else is
/// wrapped into a `TransportError::CompletionStatus` and propagated.
pub fn check(status: i32) -> Result<(), TransportError> {
    if status == 0 {
        Ok(())
    } else {
        Err(TransportError::CompletionStatus(format!(
            "non-zero completion status: {status}"
        )))
    }
}

/// Top-level error type this crate's fallible APIs return. Kept small and
/// composable via `#[from]` so call sites can use `?` freely and still let
/// `anyhow` wrap everything at the edges.
#[derive(Debug, Error)]
pub enum BenchError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    UsageAfterEof(#[from] UsageAfterEof),

    #[error(transparent)]
    TypeMismatch(#[from] TypeMismatch),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
