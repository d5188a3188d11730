//! # Command-Line Interface
//!
//! `clap`-derived argument parsing for the benchmark binary, following the
//! teacher's `cli.rs` structure: a `Args` struct parsed directly from
//! `std::env::args`, converted into an internal `BenchmarkConfig` via
//! `From<&Args>` (SPEC_FULL.md §6).
//!
//! The CLI surface keeps spec.md §6's positional numeric contract
//! (`test_num` 0..26) while layering a `ValueEnum`-backed [`BenchMode`] on
//! top for readability; `test_num` values this crate doesn't implement are
//! accepted by the parser and rejected later as `ConfigError::UnknownTestNumber`
//! so the usage-error exit path stays uniform with every other configuration
//! failure.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::error::ConfigError;
use crate::gap::circular_engine::BUFFER_SIZE;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Benchmark mode, spec.md §6 (0..26; only a subset is implemented —
    /// see `BenchMode`).
    pub test_num: u32,

    /// Number of packets each rank sends to each peer in its route.
    pub iterations: usize,

    /// Optional routing-table file (spec.md §6 line format). Absent senders
    /// follow the `to_all` default policy.
    pub routing_table_path: Option<PathBuf>,

    /// Two-sided/one-sided gap window (spec.md §4.3/§4.4).
    #[arg(long, default_value_t = 4)]
    pub max_gap: i64,

    /// Packet payload size in bytes; must be a multiple of 4 (one `u32` per
    /// element).
    #[arg(long, default_value_t = 64)]
    pub packet_size: usize,

    /// Put size for circular RDMA mode; must evenly divide the fixed 10 MiB
    /// ring (`gap::circular_engine::BUFFER_SIZE`).
    #[arg(long, default_value_t = 32 * 1024)]
    pub chunk_size: usize,

    /// Re-synchronize every N iterations in multi-channel mode
    /// (`ConfigError::ZeroSyncInterval` if zero).
    #[arg(long, default_value_t = 1)]
    pub sync_iters: usize,

    /// Per-channel priority weights for multi-channel mode: channel `i`
    /// sends `1 + w_i` packets per destination per iteration.
    #[arg(long, value_delimiter = ',', default_values_t = vec![0u64])]
    pub channel_priorities: Vec<u64>,

    /// Local address to bind the transport's listener to.
    #[arg(long, default_value = "0.0.0.0:0")]
    pub bind_addr: SocketAddr,

    /// TCP rendezvous address (ignored when `OMPI_COMM_WORLD_SIZE` is set —
    /// spec.md §6 Environment).
    #[arg(long)]
    pub rendezvous_addr: Option<SocketAddr>,

    /// World size for the TCP rendezvous connector.
    #[arg(long)]
    pub world_size: Option<u64>,

    /// Write a JSON summary to this path in addition to the console line.
    #[arg(long)]
    pub output_file: Option<PathBuf>,

    /// Silence informational console output; diagnostics still go to the
    /// log file/stderr.
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Increase diagnostic log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Detailed log destination; "stderr" or a file path (daily-rotated).
    #[arg(long)]
    pub log_file: Option<String>,
}

/// The benchmark modes this crate implements, mapped onto spec.md §6's
/// `test_num` contract. Numbers outside this set are valid CLI input but
/// fail at dispatch with `ConfigError::UnknownTestNumber` (DESIGN.md).
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum BenchMode {
    /// Two-sided gap-bounded all-to-all (spec.md §4.3).
    TagAllToAll,
    /// One-sided RDMA-style gap-bounded all-to-all (spec.md §4.4).
    RdmaAllToAll,
    /// Multi-channel communicator driven by the channel runner (spec.md §4.5).
    MultiChannel,
    /// Two-rank point-to-point throughput over the tag engine (scenario 4).
    PointToPoint,
    /// Ungated one-sided streaming into a fixed 10 MiB ring (scenario 6).
    CircularRdma,
}

impl BenchMode {
    pub fn from_test_num(test_num: u32) -> Result<Self, ConfigError> {
        match test_num {
            0 => Ok(BenchMode::TagAllToAll),
            1 => Ok(BenchMode::RdmaAllToAll),
            2 => Ok(BenchMode::MultiChannel),
            3 => Ok(BenchMode::PointToPoint),
            4 => Ok(BenchMode::CircularRdma),
            other => Err(ConfigError::UnknownTestNumber(other)),
        }
    }
}

/// Internal configuration derived from [`Args`], mirroring the teacher's
/// `Args -> BenchmarkConfiguration` split.
#[derive(Debug, Clone)]
pub struct BenchmarkConfig {
    pub mode: BenchMode,
    pub iterations: usize,
    pub routing_table_path: Option<PathBuf>,
    pub max_gap: i64,
    pub packet_element_count: usize,
    pub chunk_size: usize,
    pub sync_iters: usize,
    pub channel_priorities: Vec<usize>,
    pub bind_addr: SocketAddr,
    pub rendezvous_addr: Option<SocketAddr>,
    pub world_size: Option<u64>,
    pub output_file: Option<PathBuf>,
}

impl BenchmarkConfig {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let mode = BenchMode::from_test_num(args.test_num)?;
        if args.packet_size % 4 != 0 {
            return Err(ConfigError::UnalignedPacketSize {
                packet_size: args.packet_size,
                element_size: 4,
            });
        }
        if args.sync_iters == 0 && mode == BenchMode::MultiChannel {
            return Err(ConfigError::ZeroSyncInterval);
        }
        if mode == BenchMode::CircularRdma
            && (args.chunk_size == 0 || BUFFER_SIZE % args.chunk_size != 0)
        {
            return Err(ConfigError::UnalignedChunkSize {
                chunk_size: args.chunk_size,
                buffer_size: BUFFER_SIZE,
            });
        }
        Ok(Self {
            mode,
            iterations: args.iterations,
            routing_table_path: args.routing_table_path.clone(),
            max_gap: args.max_gap,
            packet_element_count: args.packet_size / 4,
            chunk_size: args.chunk_size,
            sync_iters: args.sync_iters,
            channel_priorities: args.channel_priorities.iter().map(|&w| w as usize).collect(),
            bind_addr: args.bind_addr,
            rendezvous_addr: args.rendezvous_addr,
            world_size: args.world_size,
            output_file: args.output_file.clone(),
        })
    }
}
