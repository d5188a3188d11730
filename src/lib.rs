//! # Distributed All-to-All Bandwidth Benchmark
//!
//! A distributed benchmarking harness for high-performance interconnects:
//! peer ranks exchange packets under a gap-bounded flow-control window over
//! a two-sided tag transport or a one-sided RDMA-style transport, and a
//! multi-channel communicator layers typed channels with EOF/sync/ack
//! semantics on top of one abstract transport.

pub mod bench;
pub mod channel_runner;
pub mod cli;
pub mod comm;
pub mod error;
pub mod gap;
pub mod net_stats;
pub mod packet;
pub mod queue;
pub mod report;
pub mod router;
pub mod transport;
pub mod utils;

pub use cli::{Args, BenchMode, BenchmarkConfig};
pub use comm::Communicator;
pub use error::BenchError;
pub use net_stats::NetStats;
pub use packet::Packet;
pub use router::Router;
pub use transport::Transport;

/// The current version of the benchmark binary.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
